//! Envelopes travel over a connection as a sequence of frames, one envelope per frame. All
//!  fixed-size numbers are in network byte order (BE):
//!
//! ```ascii
//!     0                   1                   2                   3
//!     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  0 | frame length: number of bytes following this field            |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  4 | CRC-32 (ISO-HDLC) of the envelope bytes                       |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  8 | envelope: origin id (varint), kind (varint),                  |
//!    |           payload length (varint), payload                    |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is not a security feature: it protects against a peer that got out of sync
//!  with the stream (or against a non-transport client connecting to the port), so that garbage
//!  is not handed to upper layers as an envelope.

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::messaging::envelope::Envelope;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const LEN_FIELD_LEN: usize = size_of::<u32>();
const CHECKSUM_LEN: usize = size_of::<u32>();

/// Serializes an envelope to a complete frame, ready to be written to a connection in a
///  single call. Fails if the frame would exceed `max_frame_len`.
pub fn encode_frame(envelope: &Envelope, max_frame_len: u32) -> anyhow::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(LEN_FIELD_LEN + CHECKSUM_LEN + envelope.payload().len() + 16);
    // length and checksum are patched after the envelope is in place
    buf.put_u32(0);
    buf.put_u32(0);
    envelope.ser(&mut buf);

    let frame_len = buf.len() - LEN_FIELD_LEN;
    if frame_len > max_frame_len.safe_cast() {
        bail!("envelope requires a frame of {} bytes, exceeding the configured maximum of {}", frame_len, max_frame_len);
    }

    let frame_len: u32 = frame_len.prechecked_cast();
    let checksum = FRAME_CRC.checksum(&buf[LEN_FIELD_LEN + CHECKSUM_LEN..]);

    buf[..LEN_FIELD_LEN].copy_from_slice(&frame_len.to_be_bytes());
    buf[LEN_FIELD_LEN..LEN_FIELD_LEN + CHECKSUM_LEN].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// Reads the next frame from a connection.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly, i.e. between two frames. A
///  connection that ends in the middle of a frame, or that delivers something other than a
///  well-formed frame, is reported as an error: there is no way to re-synchronize with the
///  stream after that.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_len: u32) -> anyhow::Result<Option<Envelope>> {
    let mut len_buf = [0u8; LEN_FIELD_LEN];
    if !read_len_field(reader, &mut len_buf).await? {
        return Ok(None);
    }

    let announced_len = u32::from_be_bytes(len_buf);
    let frame_len: usize = announced_len.safe_cast();
    if frame_len > max_frame_len.safe_cast() {
        bail!("peer announced a frame of {} bytes, exceeding the configured maximum of {} - the stream is apparently corrupt", frame_len, max_frame_len);
    }
    if frame_len < CHECKSUM_LEN {
        bail!("peer announced a frame of {} bytes, which is too short to hold a checksum", frame_len);
    }

    // the buffer grows with the bytes actually received rather than with the announced length
    let mut frame_buf = Vec::new();
    (&mut *reader).take(u64::from(announced_len))
        .read_to_end(&mut frame_buf).await
        .context("failed to read frame")?;
    if frame_buf.len() < frame_len {
        bail!("connection closed in the middle of a frame after {} of {} bytes", frame_buf.len(), frame_len);
    }

    let mut frame = Bytes::from(frame_buf);
    let expected_checksum = frame.get_u32();
    let actual_checksum = FRAME_CRC.checksum(frame.as_ref());
    if expected_checksum != actual_checksum {
        bail!("frame checksum mismatch: expected {:08x}, was {:08x}", expected_checksum, actual_checksum);
    }

    let envelope = Envelope::try_deser(&mut frame)?;
    if frame.has_remaining() {
        bail!("{} unexpected bytes after the envelope in a frame", frame.remaining());
    }
    Ok(Some(envelope))
}

/// returns `false` for EOF before the first byte
async fn read_len_field<R: AsyncRead + Unpin>(reader: &mut R, len_buf: &mut [u8; LEN_FIELD_LEN]) -> anyhow::Result<bool> {
    let mut num_read = 0;
    while num_read < len_buf.len() {
        let n = reader.read(&mut len_buf[num_read..]).await?;
        if n == 0 {
            if num_read == 0 {
                return Ok(false);
            }
            bail!("connection closed in the middle of a frame header");
        }
        num_read += n;
    }
    Ok(true)
}
