//! AWS event-stream binary framing (`application/vnd.amazon.eventstream`)
//!
//! Wire format, all integers big-endian:
//! `[total_len:u32][headers_len:u32][prelude_crc:u32][headers][payload][message_crc:u32]`
//!
//! A bad prelude CRC means frame boundaries can no longer be trusted and is
//! fatal for the stream. A bad message CRC only discards that frame.

use crate::error::{ConverseError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
/// Smallest legal frame: prelude plus message CRC
const MIN_FRAME_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
/// Maximum frame size: 16 MiB
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Typed header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    /// String value of a header, if present and string-typed
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(n, v)| match v {
            HeaderValue::String(s) if n == name => Some(s.as_str()),
            _ => None,
        })
    }

    /// Build a frame with string headers (used for fixtures and benchmarks)
    pub fn new(headers: &[(&str, &str)], payload: impl Into<Bytes>) -> Self {
        Self {
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), HeaderValue::String(v.to_string())))
                .collect(),
            payload: payload.into(),
        }
    }

    /// Encode this frame for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut headers = BytesMut::new();
        for (name, value) in &self.headers {
            if name.len() > u8::MAX as usize {
                return Err(ConverseError::Protocol(format!("Header name too long: {}", name)));
            }
            headers.put_u8(name.len() as u8);
            headers.put_slice(name.as_bytes());
            encode_value(&mut headers, value)?;
        }

        let total = PRELUDE_LEN + headers.len() + self.payload.len() + TRAILER_LEN;
        if total > MAX_FRAME_LEN {
            return Err(ConverseError::Protocol(format!(
                "Frame too large: {} bytes (max {})",
                total, MAX_FRAME_LEN
            )));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u32(headers.len() as u32);
        let prelude_crc = crc32fast::hash(&buf[..8]);
        buf.put_u32(prelude_crc);
        buf.put_slice(&headers);
        buf.put_slice(&self.payload);
        let message_crc = crc32fast::hash(&buf);
        buf.put_u32(message_crc);
        Ok(buf.to_vec())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and bytes consumed, or `Ok(None)` if more data is
    /// needed. Any checksum or header failure is an `Err` here; use
    /// [`FrameDecoder`] to skip individually corrupt frames.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        match decode_frame(buf)? {
            Some((Ok(frame), consumed)) => Ok(Some((frame, consumed))),
            Some((Err(e), _)) => Err(e),
            None => Ok(None),
        }
    }
}

fn encode_value(buf: &mut BytesMut, value: &HeaderValue) -> Result<()> {
    match value {
        HeaderValue::Bool(true) => buf.put_u8(0),
        HeaderValue::Bool(false) => buf.put_u8(1),
        HeaderValue::Byte(b) => {
            buf.put_u8(2);
            buf.put_i8(*b);
        }
        HeaderValue::Short(v) => {
            buf.put_u8(3);
            buf.put_i16(*v);
        }
        HeaderValue::Int(v) => {
            buf.put_u8(4);
            buf.put_i32(*v);
        }
        HeaderValue::Long(v) => {
            buf.put_u8(5);
            buf.put_i64(*v);
        }
        HeaderValue::Bytes(b) => {
            buf.put_u8(6);
            put_short_bytes(buf, b)?;
        }
        HeaderValue::String(s) => {
            buf.put_u8(7);
            put_short_bytes(buf, s.as_bytes())?;
        }
        HeaderValue::Timestamp(v) => {
            buf.put_u8(8);
            buf.put_i64(*v);
        }
        HeaderValue::Uuid(u) => {
            buf.put_u8(9);
            buf.put_slice(u);
        }
    }
    Ok(())
}

fn put_short_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(ConverseError::Protocol("Header value too long".to_string()));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Outer `Err`: framing is lost. Inner `Err`: this frame is bad but was skipped over.
#[allow(clippy::type_complexity)]
fn decode_frame(buf: &[u8]) -> Result<Option<(Result<Frame>, usize)>> {
    if buf.len() < PRELUDE_LEN {
        return Ok(None);
    }
    let mut prelude = &buf[..PRELUDE_LEN];
    let total = prelude.get_u32() as usize;
    let headers_len = prelude.get_u32() as usize;
    let prelude_crc = prelude.get_u32();

    if crc32fast::hash(&buf[..8]) != prelude_crc {
        return Err(ConverseError::Protocol(
            "Event stream prelude checksum mismatch".to_string(),
        ));
    }
    if total < MIN_FRAME_LEN || total > MAX_FRAME_LEN || headers_len > total - MIN_FRAME_LEN {
        return Err(ConverseError::Protocol(format!(
            "Invalid event stream frame lengths: total={} headers={}",
            total, headers_len
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut trailer = &buf[total - TRAILER_LEN..total];
    let message_crc = trailer.get_u32();
    if crc32fast::hash(&buf[..total - TRAILER_LEN]) != message_crc {
        return Ok(Some((
            Err(ConverseError::Protocol(
                "Event stream message checksum mismatch".to_string(),
            )),
            total,
        )));
    }

    let headers_end = PRELUDE_LEN + headers_len;
    let headers = match decode_headers(&buf[PRELUDE_LEN..headers_end]) {
        Ok(h) => h,
        Err(e) => return Ok(Some((Err(e), total))),
    };
    let payload = Bytes::copy_from_slice(&buf[headers_end..total - TRAILER_LEN]);
    Ok(Some((Ok(Frame { headers, payload }), total)))
}

fn decode_headers(mut buf: &[u8]) -> Result<Vec<(String, HeaderValue)>> {
    let truncated = || ConverseError::Protocol("Truncated event stream header".to_string());
    let mut headers = Vec::new();

    while buf.has_remaining() {
        let name_len = buf.get_u8() as usize;
        if buf.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);

        let need = |buf: &[u8], n: usize| if buf.len() < n { Err(truncated()) } else { Ok(()) };
        let value = match buf.get_u8() {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                need(buf, 1)?;
                HeaderValue::Byte(buf.get_i8())
            }
            3 => {
                need(buf, 2)?;
                HeaderValue::Short(buf.get_i16())
            }
            4 => {
                need(buf, 4)?;
                HeaderValue::Int(buf.get_i32())
            }
            5 => {
                need(buf, 8)?;
                HeaderValue::Long(buf.get_i64())
            }
            6 => {
                need(buf, 2)?;
                let len = buf.get_u16() as usize;
                need(buf, len)?;
                HeaderValue::Bytes(buf.copy_to_bytes(len))
            }
            7 => {
                need(buf, 2)?;
                let len = buf.get_u16() as usize;
                need(buf, len)?;
                let value = String::from_utf8_lossy(&buf[..len]).into_owned();
                buf.advance(len);
                HeaderValue::String(value)
            }
            8 => {
                need(buf, 8)?;
                HeaderValue::Timestamp(buf.get_i64())
            }
            9 => {
                need(buf, 16)?;
                let mut uuid = [0u8; 16];
                buf.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
            other => {
                return Err(ConverseError::Protocol(format!(
                    "Unknown event stream header type: {}",
                    other
                )))
            }
        };
        headers.push((name, value));
    }
    Ok(headers)
}

/// Incremental decoder over a chunked byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete frame it finishes.
    ///
    /// Frames with a bad message checksum are dropped with a warning.
    /// A bad prelude is returned as an error and the decoder should be
    /// abandoned.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((frame, consumed)) = decode_frame(&self.buffer)? {
            self.buffer.advance(consumed);
            match frame {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!("Skipping event stream frame: {}", e),
            }
        }
        Ok(frames)
    }

    /// Bytes buffered toward an incomplete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
