use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// The unit of data exchanged between nodes. The transport does not look inside: `kind` and
///  `payload` are interpreted by upper layers, and `origin_id` is how a receiver learns which
///  node sent an envelope (the receiving side does not report connection addresses).
#[derive(Clone, Eq, PartialEq)]
pub struct Envelope {
    origin_id: u64,
    kind: u32,
    payload: Bytes,
}
impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{origin:{}, kind:{}, payload:{} bytes}}", self.origin_id, self.kind, self.payload.len())
    }
}

impl Envelope {
    pub fn new(origin_id: u64, kind: u32, payload: impl Into<Bytes>) -> Envelope {
        Envelope {
            origin_id,
            kind,
            payload: payload.into(),
        }
    }

    pub fn origin_id(&self) -> u64 {
        self.origin_id
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_varint(self.origin_id);
        buf.put_u32_varint(self.kind);
        buf.put_usize_varint(self.payload.len());
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let origin_id = buf.try_get_u64_varint()?;
        let kind = buf.try_get_u32_varint()?;
        let payload_len = buf.try_get_usize_varint()?;

        if buf.remaining() < payload_len {
            bail!("envelope payload is truncated: expected {} bytes, {} remaining", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Envelope {
            origin_id,
            kind,
            payload,
        })
    }
}


/// An envelope on its way to a destination, i.e. what callers hand to the sender
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundRequest {
    pub destination: String,
    pub envelope: Envelope,
}
impl OutboundRequest {
    pub fn new(destination: impl Into<String>, envelope: Envelope) -> OutboundRequest {
        OutboundRequest {
            destination: destination.into(),
            envelope,
        }
    }
}
