use std::io::{self, Read, Write};
use thiserror::Error;

pub const FRAME_HEADER_BYTES: usize = 8;
pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;
pub const MAX_PROBE_FRAME_BYTES: u64 = 1024 * 1024;
pub const GREETING_WINDOW_BYTES: usize = 256;
pub const LEGACY_PROBE_WINDOW_BYTES: usize = 1024;

pub const FRAMING_MARKER: &str = "FRAMING=1";
pub const PING_LITERAL: &[u8] = b"ping";
pub const PONG_MARKER: &[u8] = br#""message":"pong""#;
pub const PONG_PREFIX: &str = r#"{"status":"success","result":{"message":"pong""#;
pub const FRAMING_REFUSAL: &[u8] = b"Unity MCP requires FRAMING=1";

const LEGACY_CHUNK_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid framed length: 0")]
    EmptyFrame,
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: u64, max: u64 },
    #[error("connection closed before reading expected bytes ({read}/{expected})")]
    Truncated { read: usize, expected: usize },
    #[error("frame io failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Io(err) if is_timeout_kind(err.kind()))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::EmptyFrame | FrameError::OversizedFrame { .. }
        )
    }
}

pub fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

pub fn greeting_advertises_framing(greeting: &[u8]) -> bool {
    String::from_utf8_lossy(greeting).contains(FRAMING_MARKER)
}

pub fn contains_pong(data: &[u8]) -> bool {
    contains_subslice(data, PONG_MARKER)
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: u64) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyFrame);
    }
    let size = payload.len() as u64;
    if size > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size,
            max: max_frame_bytes,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes header and payload as one buffer so a peer never observes a lone header.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let frame = encode_frame(payload, MAX_FRAME_BYTES)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: u64) -> Result<Vec<u8>, FrameError> {
    let header = read_exact_bytes(reader, FRAME_HEADER_BYTES)?;
    let mut raw = [0u8; FRAME_HEADER_BYTES];
    raw.copy_from_slice(&header);
    let size = u64::from_be_bytes(raw);
    if size == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if size > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size,
            max: max_frame_bytes,
        });
    }
    let expected = usize::try_from(size).map_err(|_| FrameError::OversizedFrame {
        size,
        max: max_frame_bytes,
    })?;
    read_exact_bytes(reader, expected)
}

pub fn read_exact_bytes<R: Read>(reader: &mut R, count: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; count];
    let mut filled = 0;
    while filled < count {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(FrameError::Truncated {
                    read: filled,
                    expected: count,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(buf)
}

pub fn read_legacy_message<R: Read>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; LEGACY_CHUNK_BYTES];
    while buf.len() < max_bytes {
        let want = LEGACY_CHUNK_BYTES.min(max_bytes - buf.len());
        let n = match reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_timeout_kind(err.kind()) && !buf.is_empty() => break,
            Err(err) => return Err(FrameError::Io(err)),
        };
        buf.extend_from_slice(&chunk[..n]);
        if legacy_message_complete(&buf) {
            return Ok(buf);
        }
    }
    if buf.is_empty() {
        return Err(FrameError::Truncated {
            read: 0,
            expected: 1,
        });
    }
    Ok(buf)
}

fn legacy_message_complete(buf: &[u8]) -> bool {
    if contains_pong(buf) {
        return true;
    }
    let text = String::from_utf8_lossy(buf);
    if text.trim_start().starts_with(PONG_PREFIX) {
        return true;
    }
    serde_json::from_slice::<serde::de::IgnoredAny>(buf).is_ok()
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
