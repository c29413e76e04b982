//! Chunked transfer of images and files.
//!
//! The sender writes a transfer envelope (`declared_length` = total size)
//! and then the raw bytes in chunks of at most `max_chunk` bytes, with no
//! framing per chunk. The receiver reads `min(max_chunk, remaining)` at a
//! time until exactly `declared_length` bytes reached the sink. A transfer
//! that stops early leaves the connection desynchronized; there is no resume.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::ContentKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{NodeError, NodeResult};

/// Pause before retrying an I/O call that would block.
const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Name used when a received resource name has no usable file name.
const UNNAMED: &str = "unnamed";

/// Copies exactly `declared` bytes from `source` to the socket `sink`.
///
/// Fails with [`NodeError::TransferIncomplete`] if `source` runs dry first.
pub async fn send_chunked<R, W>(
    source: &mut R,
    sink: &mut W,
    declared: u64,
    max_chunk: usize,
) -> NodeResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    copy_exact(source, sink, declared, max_chunk).await
}

/// Reads exactly `declared` raw bytes from the socket `source` into `sink`.
///
/// Fails with [`NodeError::TransferIncomplete`] if the connection closes
/// first; the caller must then treat the connection as unusable.
pub async fn receive_chunked<R, W>(
    source: &mut R,
    sink: &mut W,
    declared: u64,
    max_chunk: usize,
) -> NodeResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    copy_exact(source, sink, declared, max_chunk).await
}

async fn copy_exact<R, W>(
    source: &mut R,
    sink: &mut W,
    declared: u64,
    max_chunk: usize,
) -> NodeResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_chunk = max_chunk.max(1);
    let mut buf = vec![0u8; max_chunk];
    let mut done: u64 = 0;

    while done < declared {
        let want = usize::try_from(declared - done).map_or(max_chunk, |left| left.min(max_chunk));
        let n = match source.read(&mut buf[..want]).await {
            Ok(0) => {
                return Err(NodeError::TransferIncomplete {
                    expected: declared,
                    received: done,
                });
            }
            Ok(n) => n,
            Err(e) if is_transient(&e) => {
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        write_all_retrying(sink, &buf[..n]).await?;
        done += n as u64;
        trace!(done, declared, "Transferred chunk");
    }

    sink.flush().await?;
    Ok(done)
}

async fn write_all_retrying<W>(sink: &mut W, mut data: &[u8]) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    while !data.is_empty() {
        match sink.write(data).await {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => data = &data[n..],
            Err(e) if is_transient(&e) => tokio::time::sleep(RETRY_DELAY).await,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Reduces a resource name from the wire to a bare file name.
///
/// The sender transmits whatever path it read from; only the text after the
/// last `/` or `\` is kept, so a received file can never escape the
/// download directory.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => UNNAMED.to_string(),
        other => other.to_string(),
    }
}

/// Where a received image or file named `name` is stored.
pub fn destination(download_dir: &Path, kind: ContentKind, name: &str) -> PathBuf {
    let folder = match kind {
        ContentKind::Image => "imgs",
        ContentKind::File | ContentKind::Text => "files",
    };
    download_dir.join(folder).join(sanitize_filename(name))
}
