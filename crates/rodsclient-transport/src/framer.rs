//! Framed message I/O over any async byte stream.
//!
//! Every read and write is all-or-nothing: a frame that ends early is a
//! [`TransportError::ShortRead`], never a partial result. Deadlines apply to a
//! whole send or receive; a zero deadline means none.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rodsclient_proto::frame::{parse_header_len, HEADER_LEN_PREFIX_SIZE};
use rodsclient_proto::{Message, MessageHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Binary segments are moved in chunks of this size so progress can be
/// reported.
pub const BS_CHUNK_SIZE: usize = 64 * 1024;

/// A bidirectional byte stream a connection can run over: plain TCP, TLS, or
/// an in-memory pipe in tests.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

/// Called with `(processed, total)` bytes of a binary segment.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Runs `fut` under `timeout`; a zero timeout waits forever.
pub async fn with_deadline<F, T>(timeout: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Writes one frame. The header and XML segments go out as one buffer, the
/// binary segment follows in chunks. Returns the number of bytes written.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &Message,
    progress: Option<&ProgressCallback>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let head = msg.encode_head();
    writer.write_all(&head).await?;
    let mut written = head.len() as u64;

    let total = msg.bs.len() as u64;
    let mut sent = 0u64;
    for chunk in msg.bs.chunks(BS_CHUNK_SIZE) {
        writer.write_all(chunk).await?;
        sent += chunk.len() as u64;
        if let Some(cb) = progress {
            cb(sent, total);
        }
    }
    written += sent;

    writer.flush().await?;
    Ok(written)
}

/// Reads exactly `buf.len()` bytes.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TransportError::ShortRead {
                expected: buf.len() as u64,
                actual: filled as u64,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Reads up to `len` bytes without trusting `len` for the allocation.
async fn read_segment<R>(reader: &mut R, len: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(len.min(BS_CHUNK_SIZE as u64) as usize);
    let read = (&mut *reader).take(len).read_to_end(&mut buf).await? as u64;
    if read != len {
        return Err(TransportError::ShortRead {
            expected: len,
            actual: read,
        });
    }
    Ok(buf)
}

/// Reads one frame.
///
/// When `bs_buffer` is given the binary segment is written into it and
/// `Message::bs` stays empty; the buffer must be large enough. Returns the
/// message and the number of bytes read.
pub async fn read_message<R>(
    reader: &mut R,
    bs_buffer: Option<&mut [u8]>,
    progress: Option<&ProgressCallback>,
) -> Result<(Message, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; HEADER_LEN_PREFIX_SIZE];
    read_full(reader, &mut prefix).await?;
    let header_len = parse_header_len(prefix)?;

    let mut header_bytes = vec![0u8; header_len as usize];
    read_full(reader, &mut header_bytes).await?;
    let header = MessageHeader::decode(&header_bytes)?;

    let payload_len = header.message_len as u64 + header.error_len as u64;
    let payload = read_segment(reader, payload_len).await?;

    let bs_len = header.bs_len as usize;
    let mut msg = Message::from_parts(header, payload)?;

    match bs_buffer {
        Some(buf) => {
            if buf.len() < bs_len {
                return Err(TransportError::InvalidFrame {
                    reason: format!(
                        "binary buffer of {} bytes is too short for {} bytes",
                        buf.len(),
                        bs_len
                    ),
                });
            }
            read_bs(reader, &mut buf[..bs_len], progress).await?;
        }
        None if bs_len > 0 => {
            let mut bs = read_segment_with_progress(reader, bs_len as u64, progress).await?;
            std::mem::swap(&mut msg.bs, &mut bs);
        }
        None => {}
    }

    let total = (HEADER_LEN_PREFIX_SIZE as u64) + header_len as u64 + payload_len + bs_len as u64;
    Ok((msg, total))
}

async fn read_bs<R>(reader: &mut R, buf: &mut [u8], progress: Option<&ProgressCallback>) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let total = buf.len() as u64;
    let mut done = 0usize;
    for chunk in buf.chunks_mut(BS_CHUNK_SIZE) {
        read_full(reader, chunk).await.map_err(|e| match e {
            TransportError::ShortRead { actual, .. } => TransportError::ShortRead {
                expected: total,
                actual: done as u64 + actual,
            },
            other => other,
        })?;
        done += chunk.len();
        if let Some(cb) = progress {
            cb(done as u64, total);
        }
    }
    Ok(())
}

async fn read_segment_with_progress<R>(
    reader: &mut R,
    len: u64,
    progress: Option<&ProgressCallback>,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if progress.is_none() {
        return read_segment(reader, len).await;
    }
    let mut out = Vec::with_capacity(len.min(BS_CHUNK_SIZE as u64) as usize);
    while (out.len() as u64) < len {
        let want = (len - out.len() as u64).min(BS_CHUNK_SIZE as u64);
        let chunk = read_segment(reader, want).await.map_err(|e| match e {
            TransportError::ShortRead { actual, .. } => TransportError::ShortRead {
                expected: len,
                actual: out.len() as u64 + actual,
            },
            other => other,
        })?;
        out.extend_from_slice(&chunk);
        if let Some(cb) = progress {
            cb(out.len() as u64, len);
        }
    }
    Ok(out)
}
