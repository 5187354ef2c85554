//! Self-describing wire value encoding and request/response framing.
//! Hand-rolled rather than `serde`-derived: the byte layout here (rpc_id
//! placement, method-name framing) is load-bearing, and a generic
//! serializer would obscure it — see DESIGN.md.

use crate::error::RpcError;
use crate::id::{NodeId, ID_LEN};

const TAG_BYTES: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_TUPLE: u8 = 0x04;
const TAG_ERROR: u8 = 0x05;

const FRAME_REQUEST: u8 = 0x00;
const FRAME_RESPONSE: u8 = 0x01;

/// A self-describing wire value: the only shapes the RPC protocol needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    /// Wire form is a 1-byte length (0-8) followed by that many big-endian
    /// bytes with leading zeros stripped; `0` encodes as a single `0x00`
    /// byte rather than a zero-length run.
    Int(u64),
    Bool(bool),
    Tuple(Vec<Value>),
    /// An inbound-request error result (e.g. an unknown method), carried
    /// back on the wire instead of silently dropping the datagram so the
    /// caller's `call()` resolves promptly rather than waiting out the
    /// full RPC timeout.
    Error(String),
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn node_id(id: &NodeId) -> Value {
        Value::Bytes(id.as_bytes().to_vec())
    }

    pub fn to_node_id(&self) -> Result<NodeId, RpcError> {
        let bytes = self
            .as_bytes()
            .ok_or_else(|| RpcError::Malformed("expected bytes for a node id".into()))?;
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| RpcError::Malformed("node id must be 20 bytes".into()))?;
        Ok(NodeId::from_bytes(arr))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::Int(i) => {
                out.push(TAG_INT);
                let full = i.to_be_bytes();
                let first_nonzero = full.iter().position(|&b| b != 0).unwrap_or(full.len() - 1);
                let trimmed = &full[first_nonzero..];
                out.push(trimmed.len() as u8);
                out.extend_from_slice(trimmed);
            }
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(if *b { 1 } else { 0 });
            }
            Value::Tuple(items) => {
                out.push(TAG_TUPLE);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            Value::Error(message) => {
                out.push(TAG_ERROR);
                let bytes = message.as_bytes();
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Value, &[u8]), RpcError> {
        let (&tag, rest) = buf
            .split_first()
            .ok_or_else(|| RpcError::Malformed("empty value".into()))?;
        match tag {
            TAG_BYTES => {
                let (len, rest) = take_u32(rest)?;
                let (bytes, rest) = take_n(rest, len as usize)?;
                Ok((Value::Bytes(bytes.to_vec()), rest))
            }
            TAG_INT => {
                let (&len, rest) = rest
                    .split_first()
                    .ok_or_else(|| RpcError::Malformed("truncated int length".into()))?;
                if len as usize > 8 {
                    return Err(RpcError::Malformed("int wider than 8 bytes".into()));
                }
                let (bytes, rest) = take_n(rest, len as usize)?;
                let mut arr = [0u8; 8];
                arr[8 - bytes.len()..].copy_from_slice(bytes);
                Ok((Value::Int(u64::from_be_bytes(arr)), rest))
            }
            TAG_BOOL => {
                let (&b, rest) = rest
                    .split_first()
                    .ok_or_else(|| RpcError::Malformed("truncated bool".into()))?;
                Ok((Value::Bool(b != 0), rest))
            }
            TAG_TUPLE => {
                let (count, mut rest) = take_u32(rest)?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (v, r) = Value::decode(rest)?;
                    items.push(v);
                    rest = r;
                }
                Ok((Value::Tuple(items), rest))
            }
            TAG_ERROR => {
                let (len, rest) = take_u32(rest)?;
                let (bytes, rest) = take_n(rest, len as usize)?;
                let message = String::from_utf8(bytes.to_vec())
                    .map_err(|_| RpcError::Malformed("error message not utf-8".into()))?;
                Ok((Value::Error(message), rest))
            }
            other => Err(RpcError::Malformed(format!("unknown value tag {other}"))),
        }
    }
}

fn take_u32(buf: &[u8]) -> Result<(u32, &[u8]), RpcError> {
    let (bytes, rest) = take_n(buf, 4)?;
    let arr: [u8; 4] = bytes.try_into().expect("took exactly 4 bytes");
    Ok((u32::from_be_bytes(arr), rest))
}

fn take_n(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), RpcError> {
    if buf.len() < n {
        return Err(RpcError::Malformed("truncated value".into()));
    }
    Ok(buf.split_at(n))
}

/// An rpc_id: a fresh random 160-bit nonce per outbound call.
pub type RpcId = [u8; ID_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request {
        rpc_id: RpcId,
        method: String,
        args: Value,
    },
    Response {
        rpc_id: RpcId,
        result: Value,
    },
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Request {
                rpc_id,
                method,
                args,
            } => {
                out.push(FRAME_REQUEST);
                out.extend_from_slice(rpc_id);
                let method_bytes = method.as_bytes();
                out.push(method_bytes.len() as u8);
                out.extend_from_slice(method_bytes);
                let mut args_buf = Vec::new();
                args.encode(&mut args_buf);
                out.extend_from_slice(&(args_buf.len() as u32).to_be_bytes());
                out.extend_from_slice(&args_buf);
            }
            Frame::Response { rpc_id, result } => {
                out.push(FRAME_RESPONSE);
                out.extend_from_slice(rpc_id);
                let mut result_buf = Vec::new();
                result.encode(&mut result_buf);
                out.extend_from_slice(&(result_buf.len() as u32).to_be_bytes());
                out.extend_from_slice(&result_buf);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, RpcError> {
        let (&kind, rest) = buf
            .split_first()
            .ok_or_else(|| RpcError::Malformed("empty datagram".into()))?;
        let (rpc_id_bytes, rest) = take_n(rest, ID_LEN)?;
        let mut rpc_id = [0u8; ID_LEN];
        rpc_id.copy_from_slice(rpc_id_bytes);

        match kind {
            FRAME_REQUEST => {
                let (&method_len, rest) = rest
                    .split_first()
                    .ok_or_else(|| RpcError::Malformed("truncated method length".into()))?;
                let (method_bytes, rest) = take_n(rest, method_len as usize)?;
                let method = String::from_utf8(method_bytes.to_vec())
                    .map_err(|_| RpcError::Malformed("method name not utf-8".into()))?;
                let (args_len, rest) = take_u32(rest)?;
                let (args_bytes, _rest) = take_n(rest, args_len as usize)?;
                let (args, _) = Value::decode(args_bytes)?;
                Ok(Frame::Request {
                    rpc_id,
                    method,
                    args,
                })
            }
            FRAME_RESPONSE => {
                let (result_len, rest) = take_u32(rest)?;
                let (result_bytes, _rest) = take_n(rest, result_len as usize)?;
                let (result, _) = Value::decode(result_bytes)?;
                Ok(Frame::Response { rpc_id, result })
            }
            other => Err(RpcError::Malformed(format!("unknown frame kind {other}"))),
        }
    }
}
