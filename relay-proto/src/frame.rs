//! Frame codec: envelopes to bytes and back.
//!
//! Two framings, negotiated by sniffing the first byte of a connection:
//! length-prefixed (4-byte big-endian length + JSON) and legacy
//! LF-terminated lines. Partial frames buffer across reads; `reset()`
//! empties the buffer without surfacing an error.

use crate::envelope::Envelope;
use crate::error::ErrorCode;

/// Default frame-size ceiling before the server declares its own.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Wire framing for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 4-byte big-endian length + that many UTF-8 bytes of one JSON object.
    LengthPrefixed,
    /// One JSON object per LF-terminated line.
    LegacyLine,
}

/// Decode failures, mapped onto wire error codes by `code()`.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds max of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Self::Malformed(_) => ErrorCode::Malformed,
        }
    }
}

/// Streaming decoder holding partial-frame state for one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Option<Framing>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            framing: None,
            buf: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Lock the framing instead of sniffing (client side knows what it speaks).
    pub fn with_framing(framing: Framing) -> Self {
        Self {
            framing: Some(framing),
            buf: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Apply the per-session limit declared at WELCOME.
    pub fn set_max_frame_bytes(&mut self, max: usize) {
        self.max_frame_bytes = max;
    }

    /// Negotiated framing, once the first byte has been seen.
    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Empty the buffer without surfacing an error. Used on reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feed bytes and drain every complete envelope.
    ///
    /// A decode error poisons the connection: callers surface the mapped
    /// error code and tear the session down, so the buffer is not rewound.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>, FrameError> {
        self.buf.extend_from_slice(bytes);

        if self.framing.is_none() {
            if let Some(&first) = self.buf.first() {
                // A length prefix starting with '{' would declare a frame of
                // at least 2 GiB, far past any max_frame_bytes.
                self.framing = Some(if first == b'{' {
                    Framing::LegacyLine
                } else {
                    Framing::LengthPrefixed
                });
            } else {
                return Ok(Vec::new());
            }
        }

        let mut out = Vec::new();
        loop {
            let next = match self.framing {
                Some(Framing::LengthPrefixed) => self.next_prefixed()?,
                Some(Framing::LegacyLine) => self.next_line()?,
                None => None,
            };
            match next {
                Some(env) => out.push(env),
                None => break,
            }
        }
        Ok(out)
    }

    fn next_prefixed(&mut self) -> Result<Option<Envelope>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..4 + len).skip(4).collect();
        let env = serde_json::from_slice(&frame)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok(Some(env))
    }

    fn next_line(&mut self) -> Result<Option<Envelope>, FrameError> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_frame_bytes {
                    return Err(FrameError::FrameTooLarge {
                        len: self.buf.len(),
                        max: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };
            let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
            let trimmed = String::from_utf8_lossy(&line);
            let trimmed = trimmed.trim();
            if trimmed.is_empty() {
                continue;
            }
            let env = serde_json::from_str(trimmed)
                .map_err(|e| FrameError::Malformed(e.to_string()))?;
            return Ok(Some(env));
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize one envelope for a sink in the given framing.
pub fn encode(env: &Envelope, framing: Framing) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(env).map_err(|e| FrameError::Malformed(e.to_string()))?;
    match framing {
        Framing::LengthPrefixed => {
            let mut out = Vec::with_capacity(4 + json.len());
            out.extend_from_slice(&(json.len() as u32).to_be_bytes());
            out.extend_from_slice(&json);
            Ok(out)
        }
        Framing::LegacyLine => {
            let mut out = json;
            out.push(b'\n');
            Ok(out)
        }
    }
}
