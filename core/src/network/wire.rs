//! Shared wire framing for both protocols.
//!
//! Two primitives:
//! - framed messages on a stream: `u32` big-endian total length (>= 1),
//!   one type byte, then `total - 1` payload bytes;
//! - nested blobs inside a payload: `u32` big-endian length, then bytes.
//!
//! Framed messages are read and written asynchronously on a stream; blobs
//! are parsed out of an already-read payload with [`PayloadReader`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, header included.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors when encoding or decoding wire data.
#[derive(Debug)]
pub enum WireError {
    /// Declared length is zero or otherwise impossible.
    BadLength(u32),
    /// Declared length exceeds [`MAX_FRAME_LEN`].
    Oversize(usize),
    /// Payload ended before a declared field.
    Truncated,
    /// A field that must be UTF-8 was not.
    BadString,
    /// A fixed-width field had the wrong size.
    BadFieldLength(&'static str, usize),
    /// Underlying stream error (includes EOF mid-frame).
    Io(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BadLength(n) => write!(f, "malformed frame: bad length {}", n),
            WireError::Oversize(n) => write!(f, "malformed frame: oversize length {}", n),
            WireError::Truncated => write!(f, "malformed frame: truncated payload"),
            WireError::BadString => write!(f, "malformed frame: invalid utf-8"),
            WireError::BadFieldLength(field, n) => {
                write!(f, "malformed frame: bad {} length {}", field, n)
            }
            WireError::Io(e) => write!(f, "stream error: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// Write one framed message: `[u32 total][tag][payload]`.
pub async fn write_frame<W>(w: &mut W, tag: u8, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() + 1 > MAX_FRAME_LEN {
        return Err(WireError::Oversize(payload.len() + 1));
    }

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&((payload.len() as u32) + 1).to_be_bytes());
    frame.push(tag);
    frame.extend_from_slice(payload);

    w.write_all(&frame)
        .await
        .map_err(|e| WireError::Io(e.to_string()))
}

/// Read one framed message, returning `(tag, payload)`. Reads are exact.
pub async fn read_frame<R>(r: &mut R) -> Result<(u8, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    r.read_exact(&mut header)
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    let total = u32::from_be_bytes(header);
    if total < 1 {
        return Err(WireError::BadLength(total));
    }
    if total as usize > MAX_FRAME_LEN {
        return Err(WireError::Oversize(total as usize));
    }

    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    let mut payload = vec![0u8; total as usize - 1];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    Ok((tag[0], payload))
}

/// Cursor over a message payload for reading nested blobs and integers.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Read a `u32 || bytes` blob.
    pub fn blob(&mut self) -> Result<&'a [u8], WireError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    /// Read a blob that must have exactly `n` bytes.
    pub fn fixed_blob(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], WireError> {
        let b = self.blob()?;
        if b.len() != n {
            return Err(WireError::BadFieldLength(field, b.len()));
        }
        Ok(b)
    }

    /// Read a blob that must be UTF-8.
    pub fn string(&mut self) -> Result<String, WireError> {
        let b = self.blob()?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::BadString)
    }

    /// Read a raw big-endian u32.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Builder for a message payload made of blobs and integers.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(b);
        self
    }

    pub fn u32(&mut self, n: u32) -> &mut Self {
        self.buf.extend_from_slice(&n.to_be_bytes());
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
