//! Length-checked line codec — frames a TLS byte stream into packets.
//!
//! Each line is a JSON envelope `{"s": N, "d": "..."}` where `d` is the
//! serialized [`Packet`] and `s` its byte length, terminated by `\n`.
//! The redundant length check catches frames corrupted or truncated in
//! transit before they reach the dispatcher.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::packet::Packet;

/// Maximum line length (including `\n`). A `DataPackage` of a full backfill
/// range is the largest frame we ever emit.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec error: framing violation, serialization failure, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error("corrupt frame: {0}")]
    Corrupt(#[from] FrameError),
    #[error("packet serialization failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a received line was rejected.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("declared payload length {declared} does not match actual length {actual}")]
    Length { declared: usize, actual: usize },
    #[error("payload does not parse as a packet: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The length-checked envelope wrapped around every packet.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    s: usize,
    d: String,
}

/// Frames packets on `\n` boundaries with the length-checked envelope.
///
/// Strict mode surfaces corrupt frames as errors (killing the connection);
/// lenient mode logs and skips them. Debug builds default to strict so
/// protocol bugs fail loud under test; release builds drop bad frames and
/// keep the session alive.
#[derive(Debug)]
pub struct PacketCodec {
    strict: bool,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            strict: cfg!(debug_assertions),
        }
    }
}

impl PacketCodec {
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn lenient() -> Self {
        Self { strict: false }
    }
}

/// Encodes a packet into a complete wire line, newline included.
///
/// The relay encodes each outbound packet once and fans the resulting
/// [`Bytes`] out to every connection.
pub fn encode_frame(packet: &Packet) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_string(packet).map_err(CodecError::Encode)?;
    let envelope = Envelope {
        s: payload.len(),
        d: payload,
    };
    let mut line = serde_json::to_string(&envelope).map_err(CodecError::Encode)?;
    // Serde escapes control characters inside strings, so the envelope text
    // itself never contains a raw newline. Strip anyway: framing must not
    // depend on the serializer's escaping rules.
    line.retain(|c| c != '\n' && c != '\r');
    line.push('\n');
    Ok(Bytes::from(line))
}

/// Decodes one wire line (without the trailing `\n`) back into a packet.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, FrameError> {
    let text = std::str::from_utf8(frame)?;
    let envelope: Envelope = serde_json::from_str(text.trim_end_matches('\r'))?;
    if envelope.s != envelope.d.len() {
        return Err(FrameError::Length {
            declared: envelope.s,
            actual: envelope.d.len(),
        });
    }
    Ok(serde_json::from_str(&envelope.d)?)
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            let line = src.split_to(pos);
            src.advance(1); // skip \n

            match decode_frame(&line) {
                Ok(packet) => return Ok(Some(packet)),
                Err(err) if self.strict => return Err(CodecError::Corrupt(err)),
                Err(err) => {
                    debug!("dropping corrupt frame: {err}");
                    // Keep scanning: later lines in the buffer may be fine.
                }
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode_frame(&item)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

/// Pass-through for frames already encoded with [`encode_frame`].
impl Encoder<Bytes> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}
