//! Async frame I/O and outbound connections.

use std::io;
use std::time::Duration;

use parley_core::PeerAddress;
use parley_protocol::{Envelope, FRAME_HEADER_LEN, encode_frame, frame_length};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{NodeError, NodeResult};
use crate::signals::ShutdownHandle;

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed or reset the connection, including
/// in the middle of a frame.
pub async fn read_frame<R>(reader: &mut R) -> NodeResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    if !read_or_closed(reader, &mut header).await? {
        return Ok(None);
    }

    let len = frame_length(header)?;
    let mut payload = vec![0u8; len];
    if !read_or_closed(reader, &mut payload).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Reads a frame and decodes it as an envelope.
///
/// The outer `Option` is `None` once the connection is closed; the inner one
/// is `None` for a frame that did not decode and was dropped.
pub async fn read_envelope<R>(reader: &mut R) -> NodeResult<Option<Option<Envelope>>>
where
    R: AsyncRead + Unpin,
{
    let Some(frame) = read_frame(reader).await? else {
        return Ok(None);
    };
    match Envelope::try_decode(&frame) {
        Ok(envelope) => Ok(Some(Some(envelope))),
        Err(e) => {
            debug!(error = %e, len = frame.len(), "Dropping undecodable frame");
            Ok(Some(None))
        }
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encodes and writes an envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(
        session = %envelope.session_name,
        kind = %envelope.message_type,
        "Writing envelope"
    );
    write_frame(writer, &envelope.encode()).await
}

/// How long an unframed reader waits for the rest of a message.
pub const UNFRAMED_QUIET: Duration = Duration::from_millis(20);

/// Reads one unframed message: everything that arrives until the sender
/// pauses for `quiet` or `max` bytes are buffered.
///
/// Returns `Ok(None)` at end of stream.
pub async fn read_unframed<R>(reader: &mut R, max: usize, quiet: Duration) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max];
    let mut len = reader.read(&mut buf).await?;
    if len == 0 {
        return Ok(None);
    }
    while len < max {
        match tokio::time::timeout(quiet, reader.read(&mut buf[len..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => len += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    buf.truncate(len);
    Ok(Some(buf))
}

async fn read_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> NodeResult<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Connects to `address`, retrying every `interval` while the connection is
/// refused. Other errors are returned at once.
///
/// The retry is unbounded; only `shutdown` stops it.
pub async fn connect_with_retry(
    address: &PeerAddress,
    interval: Duration,
    shutdown: &ShutdownHandle,
) -> NodeResult<TcpStream> {
    let target = (address.host.as_str(), address.port);
    let mut attempts = 0u32;
    loop {
        if shutdown.is_shutdown() {
            return Err(NodeError::Cancelled);
        }
        attempts += 1;
        let result = tokio::select! {
            result = TcpStream::connect(target) => result,
            _ = shutdown.cancelled() => return Err(NodeError::Cancelled),
        };
        match result {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%address, attempts, "Connected");
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                trace!(%address, attempts, "Connection refused, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => return Err(NodeError::Cancelled),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::PeerId;
    use parley_protocol::MessageType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_roundtrip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, &[9u8; 300]).await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), vec![9u8; 300]);
        assert!(read_frame(&mut b).await.unwrap().unwrap().is_empty());
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_read_is_no_message() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn envelopes_and_dropped_frames() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let sender: PeerId = "1111111111".parse().unwrap();
        let envelope = Envelope::text("1111111111-2222222222", 2333, sender, "hello_world");

        write_frame(&mut a, b"garbage").await.unwrap();
        write_envelope(&mut a, &envelope).await.unwrap();
        drop(a);

        assert_eq!(read_envelope(&mut b).await.unwrap(), Some(None));
        let decoded = read_envelope(&mut b).await.unwrap().unwrap().unwrap();
        assert_eq!(decoded.message_type, MessageType::Text);
        assert_eq!(decoded.payload, "hello_world");
        assert_eq!(read_envelope(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unframed_reads_join_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"127.0.0.1").await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            client.write_all(b"_9001").await.unwrap();
            client
        });

        let message = read_unframed(&mut server, 64, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, b"127.0.0.1_9001");

        drop(writer.await.unwrap());
        assert_eq!(read_unframed(&mut server, 64, UNFRAMED_QUIET).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unframed_reads_stop_at_the_limit() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"abcdef").await.unwrap();
        let message = read_unframed(&mut server, 4, UNFRAMED_QUIET).await.unwrap().unwrap();
        assert_eq!(message, b"abcd");
    }

    #[tokio::test]
    async fn connect_retries_until_listener_appears() {
        // Reserve a port, then free it so the first attempts are refused.
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let address = PeerAddress::new("127.0.0.1", port);
        let shutdown = ShutdownHandle::new();
        let connect = tokio::spawn(async move {
            connect_with_retry(&address, Duration::from_millis(20), &shutdown).await
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (_accepted, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();

        let stream = connect.await.unwrap();
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn connect_retry_is_cancellable() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let shutdown = ShutdownHandle::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            connect_with_retry(
                &PeerAddress::new("127.0.0.1", port),
                Duration::from_secs(1),
                &shutdown,
            ),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(NodeError::Cancelled)));
    }
}
