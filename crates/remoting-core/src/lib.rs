//! Channel runtime for a duplex RPC protocol between two peers sharing a
//! byte-stream transport.
//!
//! The crate is organized around the data flow described in the project
//! design notes: bytes arrive at a `NetworkLayer` (outside this crate, see
//! `remoting-io`/`remoting-transport-tcp`), pass upward through a stack of
//! [`stack::FilterLayer`]s, and are framed into [`command::Command`]s by the
//! application layer. A [`channel::Channel`] either resolves a pending
//! [`call`](channel::Channel::call), executes an inbound user operation, or
//! forwards bytes into a [`pipe::Pipe`].

pub mod application;
pub mod capability;
pub mod channel;
pub mod class_filter;
pub mod classloader;
pub mod command;
mod command_codec;
pub mod config;
pub mod error;
pub mod export_table;
pub mod fifo_buffer;
pub mod framing;
pub mod headers;
pub mod jarcache;
pub mod noproxy;
pub mod observability;
pub mod pipe;
pub mod port_forwarder;
pub mod serializer;
pub mod stack;

pub use error::{Error, Result};
