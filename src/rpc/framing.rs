//! Newline-delimited message framing for JSON-RPC over a byte stream.
//!
//! signal-cli's JSON-RPC daemon writes exactly one JSON object per line and
//! expects requests in the same shape. JSON serializers escape embedded
//! newlines, so a bare `\n` is always a message boundary.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","method":"send","id":"6f1c...","params":{...}}\n
//! {"jsonrpc":"2.0","result":{"timestamp":1700000000000},"id":"6f1c..."}\n
//! ```
//!
//! Lines are decoded lossily: the engine may interleave diagnostic output and
//! a stray invalid byte must not tear down the whole session.

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum line size (16MB) to prevent OOM from a misbehaving engine.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line longer than `MAX_MESSAGE_SIZE`. Its bytes were discarded up to
    /// and including the next newline; the count is how many.
    Oversized(usize),
}

/// Read the next frame from the stream.
///
/// Returns `Ok(None)` on a clean EOF. A final line without a trailing
/// newline is still returned as a message. An oversized line is consumed
/// and reported as `Frame::Oversized`, leaving the stream positioned at the
/// start of the following line.
///
/// # Errors
///
/// Returns an error only if the underlying read fails.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes_read = (&mut *reader)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read message line")?;

    // EOF - connection closed
    if bytes_read == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if bytes_read > MAX_MESSAGE_SIZE {
        let skipped = discard_line(reader).await?;
        return Ok(Some(Frame::Oversized(bytes_read + skipped)));
    }

    Ok(Some(Frame::Line(String::from_utf8_lossy(&line).into_owned())))
}

/// Consume bytes up to and including the next newline (or EOF) without
/// buffering them.
async fn discard_line<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (found, used) = {
            let buf = reader
                .fill_buf()
                .await
                .context("Failed to skip oversized line")?;
            if buf.is_empty() {
                return Ok(skipped);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, buf.len()),
            }
        };
        reader.consume(used);
        skipped += used;
        if found {
            return Ok(skipped);
        }
    }
}

/// Read one newline-terminated message from the stream.
///
/// Returns `Ok(None)` on a clean EOF.
///
/// # Errors
///
/// Returns an error if:
/// - The underlying read fails
/// - The line exceeds MAX_MESSAGE_SIZE (16MB)
pub async fn read_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match read_frame(reader).await? {
        Some(Frame::Line(line)) => Ok(Some(line)),
        Some(Frame::Oversized(_)) => Err(anyhow!(
            "Message size exceeds maximum {} bytes",
            MAX_MESSAGE_SIZE
        )),
        None => Ok(None),
    }
}

/// Write one message followed by a newline.
///
/// The body and its terminator go out in a single `write_all` so that
/// callers holding the writer lock never emit a partial message.
///
/// # Errors
///
/// Returns an error if the body contains a raw newline, or if the write or
/// flush fails.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.contains('\n') {
        bail!("Message body must not contain a raw newline");
    }

    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.extend_from_slice(body.as_bytes());
    frame.push(b'\n');

    writer
        .write_all(&frame)
        .await
        .context("Failed to write message")?;

    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (client, server) = duplex(1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let mut reader = BufReader::new(server);

        let message = r#"{"jsonrpc":"2.0","method":"listGroups","id":"1"}"#;
        write_message(&mut client_write, message)
            .await
            .expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn test_read_strips_crlf() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"{\"a\":1}\r\n").await.unwrap();

        let mut reader = BufReader::new(server);
        let received = read_message(&mut reader).await.unwrap();
        assert_eq!(received.as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_read_multiple_lines_in_one_chunk() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"first\nsecond\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert_eq!(read_message(&mut reader).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_message(&mut reader).await.unwrap().as_deref(), Some("second"));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_invalid_utf8_is_lossy() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"ab\xffcd\n").await.unwrap();

        let mut reader = BufReader::new(server);
        let received = read_message(&mut reader).await.unwrap().unwrap();
        assert!(received.starts_with("ab"));
        assert!(received.ends_with("cd"));
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped_up_to_next_line() {
        let (mut client, server) = duplex(64 * 1024);
        let mut reader = BufReader::new(server);

        let writer = async move {
            let filler = vec![b'x'; MAX_MESSAGE_SIZE + 10];
            client.write_all(&filler).await.unwrap();
            client.write_all(b"\n{\"a\":1}\n").await.unwrap();
            client
        };
        let frames = async {
            let first = read_frame(&mut reader).await.unwrap();
            let second = read_frame(&mut reader).await.unwrap();
            (first, second)
        };

        let (_client, (first, second)) = timeout(TEST_TIMEOUT, async { tokio::join!(writer, frames) })
            .await
            .expect("Test timed out");

        assert_eq!(first, Some(Frame::Oversized(MAX_MESSAGE_SIZE + 11)));
        assert_eq!(second, Some(Frame::Line(r#"{"a":1}"#.to_string())));
    }

    #[tokio::test]
    async fn test_write_rejects_embedded_newline() {
        let (client, _server) = duplex(1024);
        let (_read, mut write) = tokio::io::split(client);

        let result = write_message(&mut write, "line one\nline two").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connection_closed_returns_none() {
        let (client, server) = duplex(1024);
        drop(client);

        let mut reader = BufReader::new(server);
        let result = timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out")
            .expect("EOF should not be an error");

        assert_eq!(result, None);
    }
}
