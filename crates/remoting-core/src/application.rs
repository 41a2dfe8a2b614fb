//! The application layer: turns a
//! negotiated `Box<dyn stack::ByteChannel>` into a running `Channel` by
//! wiring `command_codec` + `framing` to the channel's `CommandSink`
//! contract and driving an inbound pump loop off it.

use std::io::{Read, Write};
use std::sync::Mutex;

use bytes::BytesMut;

use crate::channel::{Channel, CommandSink, PipeRouter, RequestHandler, RpcHandler};
use crate::command::Command;
use crate::command_codec;
use crate::framing::{self, DecodeOutcome, FrameDecoder};

/// Encodes and frames every outbound `Command` and writes it to `W`.
/// Serializes writers with a `Mutex` since a `Channel` may call `send` from
/// several threads (an inbound response, an outbound call, a pipe ack).
pub struct FramedCommandSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> FramedCommandSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> CommandSink for FramedCommandSink<W> {
    fn send(&self, command: Command) {
        let payload = command_codec::encode(&command);
        let mut framed = BytesMut::new();
        framing::encode_frame(&payload, &mut framed);
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writer.write_all(&framed) {
            tracing::warn!(error = %e, "dropping command: write to transport failed");
        }
    }
}

/// Read frames off `reader` until EOF or a fatal error, decoding each into a
/// `Command` and dispatching it to `channel`. Returns normally on a clean
/// EOF (the peer half-closed); `channel.on_transport_failure` is left for
/// the caller to invoke on a genuine I/O error, since only the caller knows
/// whether a `CloseCommand` was already exchanged (orderly vs unorderly
/// shutdown).
pub fn pump_inbound(
    channel: &Channel,
    reader: &mut impl Read,
    request_handler: &dyn RequestHandler,
    rpc_handler: &dyn RpcHandler,
    pipes: &dyn PipeRouter,
) -> std::io::Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut scratch = [0u8; 8192];
    loop {
        match decoder.poll() {
            DecodeOutcome::Frame(frame) => {
                match command_codec::decode(&frame) {
                    Ok(command) => channel.on_command(command, request_handler, rpc_handler, pipes),
                    Err(e) => tracing::warn!(error = %e, "dropping malformed inbound frame"),
                }
                continue;
            }
            DecodeOutcome::NeedMore => {}
        }
        let n = reader.read(&mut scratch)?;
        if n == 0 {
            return Ok(());
        }
        decoder.feed(&scratch[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_filter::PermissiveClassFilter;
    use crate::command::Trace;
    use crate::export_table::{ExportTable, Side};
    use std::io::Cursor;
    use std::sync::Arc;

    fn new_export_table(side: Side) -> ExportTable {
        ExportTable::new(side, Arc::new(PermissiveClassFilter), 16)
    }

    struct EchoRequest;
    impl RequestHandler for EchoRequest {
        fn handle(&self, payload: Vec<u8>) -> std::result::Result<Vec<u8>, (String, String, Vec<String>)> {
            Ok(payload)
        }
    }
    struct NoopRpc;
    impl RpcHandler for NoopRpc {
        fn invoke(
            &self,
            _object: Arc<dyn std::any::Any + Send + Sync>,
            _method_signature: &str,
            _args: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, (String, String, Vec<String>)> {
            Ok(Vec::new())
        }
    }
    struct NoopPipes;
    impl PipeRouter for NoopPipes {
        fn on_write(&self, _oid: u32, _bytes: Vec<u8>) {}
        fn on_eof(&self, _oid: u32) {}
        fn on_ack(&self, _oid: u32, _delta: u32) {}
        fn on_error(&self, _oid: u32, _message: String) {}
    }

    #[test]
    fn pump_inbound_decodes_a_framed_user_request_and_replies_through_the_sink() {
        let sink = Arc::new(FramedCommandSink::new(Vec::<u8>::new()));
        let channel = Channel::new(
            "test",
            Side::Initiator,
            new_export_table(Side::Initiator),
            sink.clone(),
            None,
            4096,
        );

        let request = Command::UserRequest {
            request_id: 1,
            payload: b"hello".to_vec(),
            trace: Trace::Borrowed("t"),
        };
        let payload = command_codec::encode(&request);
        let mut framed = BytesMut::new();
        framing::encode_frame(&payload, &mut framed);
        let mut reader = Cursor::new(framed.to_vec());

        pump_inbound(&channel, &mut reader, &EchoRequest, &NoopRpc, &NoopPipes).unwrap();

        let written = sink.writer.lock().unwrap().clone();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&written);
        match decoder.poll() {
            DecodeOutcome::Frame(frame) => {
                let response = command_codec::decode(&frame).unwrap();
                match response {
                    Command::Response {
                        outcome: crate::command::ResponseOutcome::Success(bytes),
                        ..
                    } => assert_eq!(bytes, b"hello"),
                    other => panic!("unexpected response: {other:?}"),
                }
            }
            DecodeOutcome::NeedMore => panic!("expected a framed response"),
        }
    }

    #[test]
    fn pump_inbound_returns_ok_on_clean_eof() {
        let sink = Arc::new(FramedCommandSink::new(Vec::<u8>::new()));
        let channel = Channel::new(
            "test",
            Side::Initiator,
            new_export_table(Side::Initiator),
            sink,
            None,
            4096,
        );
        let mut reader = Cursor::new(Vec::<u8>::new());
        assert!(pump_inbound(&channel, &mut reader, &EchoRequest, &NoopRpc, &NoopPipes).is_ok());
    }
}
