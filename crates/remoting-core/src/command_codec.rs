//! Binary encoding of [`crate::command::Command`] envelopes. This is
//! separate from the external `Serializer` (see [`crate::serializer`]): the
//! `Serializer` only ever touches the opaque payload/args bytes a user
//! operation carries, while this module encodes the command *envelope*
//! (kind tag, OID, request id, trace string) that every implementation must
//! agree on bit-for-bit to interoperate.

use crate::command::{Command, DgcOp, RequestId, ResponseOutcome};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

const TAG_USER_REQUEST: u8 = 1;
const TAG_RESPONSE_SUCCESS: u8 = 2;
const TAG_RESPONSE_EXCEPTION: u8 = 3;
const TAG_RPC_REQUEST: u8 = 4;
const TAG_DGC_ADD_REF: u8 = 5;
const TAG_DGC_RELEASE: u8 = 6;
const TAG_DGC_CANCEL: u8 = 7;
const TAG_PIPE_WRITE: u8 = 8;
const TAG_PIPE_EOF: u8 = 9;
const TAG_PIPE_ACK: u8 = 10;
const TAG_PIPE_ERROR: u8 = 11;
const TAG_CLOSE: u8 = 12;

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn take_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_str(buf: &mut impl Buf) -> Result<String> {
    let bytes = take_bytes(buf)?;
    String::from_utf8(bytes).map_err(|e| Error::ClassResolution {
        class_name: "<command envelope>".into(),
        reason: format!("invalid utf-8 in envelope string: {e}"),
    })
}

fn truncated() -> Error {
    Error::ClassResolution {
        class_name: "<command envelope>".into(),
        reason: "truncated command envelope".into(),
    }
}

pub fn encode(command: &Command) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_str(&mut buf, command.trace());
    match command {
        Command::UserRequest {
            request_id,
            payload,
            ..
        } => {
            buf.put_u8(TAG_USER_REQUEST);
            buf.put_u64(*request_id);
            put_bytes(&mut buf, payload);
        }
        Command::Response {
            request_id,
            outcome,
            ..
        } => match outcome {
            ResponseOutcome::Success(bytes) => {
                buf.put_u8(TAG_RESPONSE_SUCCESS);
                buf.put_u64(*request_id);
                put_bytes(&mut buf, bytes);
            }
            ResponseOutcome::Exception {
                class_name,
                message,
                stack_trace,
            } => {
                buf.put_u8(TAG_RESPONSE_EXCEPTION);
                buf.put_u64(*request_id);
                put_str(&mut buf, class_name);
                put_str(&mut buf, message);
                buf.put_u32(stack_trace.len() as u32);
                for frame in stack_trace {
                    put_str(&mut buf, frame);
                }
            }
        },
        Command::RpcRequest {
            request_id,
            oid,
            method_signature,
            args,
            ..
        } => {
            buf.put_u8(TAG_RPC_REQUEST);
            buf.put_u64(*request_id);
            buf.put_u32(*oid);
            put_str(&mut buf, method_signature);
            put_bytes(&mut buf, args);
        }
        Command::DgcRequest { oid, op, .. } => {
            match op {
                DgcOp::AddRef(count) => {
                    buf.put_u8(TAG_DGC_ADD_REF);
                    buf.put_u32(*oid);
                    buf.put_u64(*count);
                }
                DgcOp::Release(count) => {
                    buf.put_u8(TAG_DGC_RELEASE);
                    buf.put_u32(*oid);
                    buf.put_u64(*count);
                }
                DgcOp::CancelRequest(request_id) => {
                    buf.put_u8(TAG_DGC_CANCEL);
                    buf.put_u32(*oid);
                    buf.put_u64(*request_id);
                }
            }
        }
        Command::PipeWrite { oid, bytes, .. } => {
            buf.put_u8(TAG_PIPE_WRITE);
            buf.put_u32(*oid);
            put_bytes(&mut buf, bytes);
        }
        Command::PipeEof { oid, .. } => {
            buf.put_u8(TAG_PIPE_EOF);
            buf.put_u32(*oid);
        }
        Command::PipeAck { oid, delta, .. } => {
            buf.put_u8(TAG_PIPE_ACK);
            buf.put_u32(*oid);
            buf.put_u32(*delta);
        }
        Command::PipeError { oid, message, .. } => {
            buf.put_u8(TAG_PIPE_ERROR);
            buf.put_u32(*oid);
            put_str(&mut buf, message);
        }
        Command::Close { .. } => {
            buf.put_u8(TAG_CLOSE);
        }
    }
    buf.to_vec()
}

pub fn decode(mut bytes: &[u8]) -> Result<Command> {
    let trace = take_str(&mut bytes)?;
    let trace: crate::command::Trace = std::borrow::Cow::Owned(trace);
    if bytes.is_empty() {
        return Err(truncated());
    }
    let tag = bytes.get_u8();
    let command = match tag {
        TAG_USER_REQUEST => {
            let request_id = get_u64(&mut bytes)?;
            let payload = take_bytes(&mut bytes)?;
            Command::UserRequest {
                request_id,
                payload,
                trace,
            }
        }
        TAG_RESPONSE_SUCCESS => {
            let request_id = get_u64(&mut bytes)?;
            let payload = take_bytes(&mut bytes)?;
            Command::Response {
                request_id,
                outcome: ResponseOutcome::Success(payload),
                trace,
            }
        }
        TAG_RESPONSE_EXCEPTION => {
            let request_id = get_u64(&mut bytes)?;
            let class_name = take_str(&mut bytes)?;
            let message = take_str(&mut bytes)?;
            let count = get_u32(&mut bytes)? as usize;
            let mut stack_trace = Vec::with_capacity(count);
            for _ in 0..count {
                stack_trace.push(take_str(&mut bytes)?);
            }
            Command::Response {
                request_id,
                outcome: ResponseOutcome::Exception {
                    class_name,
                    message,
                    stack_trace,
                },
                trace,
            }
        }
        TAG_RPC_REQUEST => {
            let request_id = get_u64(&mut bytes)?;
            let oid = get_u32(&mut bytes)?;
            let method_signature = take_str(&mut bytes)?;
            let args = take_bytes(&mut bytes)?;
            Command::RpcRequest {
                request_id,
                oid,
                method_signature,
                args,
                trace,
            }
        }
        TAG_DGC_ADD_REF => {
            let oid = get_u32(&mut bytes)?;
            let count = get_u64(&mut bytes)?;
            Command::DgcRequest {
                oid,
                op: DgcOp::AddRef(count),
                trace,
            }
        }
        TAG_DGC_RELEASE => {
            let oid = get_u32(&mut bytes)?;
            let count = get_u64(&mut bytes)?;
            Command::DgcRequest {
                oid,
                op: DgcOp::Release(count),
                trace,
            }
        }
        TAG_DGC_CANCEL => {
            let oid = get_u32(&mut bytes)?;
            let request_id: RequestId = get_u64(&mut bytes)?;
            Command::DgcRequest {
                oid,
                op: DgcOp::CancelRequest(request_id),
                trace,
            }
        }
        TAG_PIPE_WRITE => {
            let oid = get_u32(&mut bytes)?;
            let data = take_bytes(&mut bytes)?;
            Command::PipeWrite {
                oid,
                bytes: data,
                trace,
            }
        }
        TAG_PIPE_EOF => {
            let oid = get_u32(&mut bytes)?;
            Command::PipeEof { oid, trace }
        }
        TAG_PIPE_ACK => {
            let oid = get_u32(&mut bytes)?;
            let delta = get_u32(&mut bytes)?;
            Command::PipeAck { oid, delta, trace }
        }
        TAG_PIPE_ERROR => {
            let oid = get_u32(&mut bytes)?;
            let message = take_str(&mut bytes)?;
            Command::PipeError {
                oid,
                message,
                trace,
            }
        }
        TAG_CLOSE => Command::Close { trace },
        other => {
            return Err(Error::ClassResolution {
                class_name: "<command envelope>".into(),
                reason: format!("unknown command tag {other}"),
            });
        }
    };
    Ok(command)
}

fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(command: Command) {
        let bytes = encode(&command);
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(format!("{decoded:?}"), format!("{command:?}"));
    }

    #[test]
    fn round_trips_user_request() {
        round_trip(Command::UserRequest {
            request_id: 7,
            payload: vec![1, 2, 3],
            trace: "test:1".into(),
        });
    }

    #[test]
    fn round_trips_close() {
        round_trip(Command::Close { trace: "test:1".into() });
    }

    #[test]
    fn round_trips_pipe_write_with_empty_bytes() {
        round_trip(Command::PipeWrite {
            oid: 4,
            bytes: vec![],
            trace: "test:1".into(),
        });
    }

    #[test]
    fn rejects_truncated_envelope() {
        let bytes = encode(&Command::Close { trace: "t".into() });
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
