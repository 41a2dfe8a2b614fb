//! Single-threaded NIO selector loop (`IOHub`) and a byte-stream
//! `NetworkLayer` adapter, the transport-agnostic bottom of the protocol
//! stack described in `remoting-core`.

pub mod iohub;
pub mod network_layer;

pub use iohub::{IoHub, Listener, Readiness, RegistrationId};
pub use network_layer::NetworkLayer;

use thiserror::Error;

pub type Result<T, E = IoError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("selector failure: {0}")]
    Selector(#[from] std::io::Error),
    #[error("the hub has already shut down")]
    HubClosed,
}
