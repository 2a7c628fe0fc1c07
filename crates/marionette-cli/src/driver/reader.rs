//! Async frame reader over the peer's output stream.
//!
//! Wraps a [`LineFramer`] around any `AsyncRead`. Reads block on the stream
//! with a deadline instead of polling, and the framer's buffer survives a
//! timeout so a frame straddling two calls is never lost.

use std::io;
use std::time::Duration;

use marionette_core::framing::LineFramer;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Bytes requested from the stream per read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Result of one [`FrameReader::read_frame`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A complete, parsed frame.
    Frame(Value),
    /// The wait elapsed before a full frame arrived.
    Timeout,
    /// The stream reached end-of-file.
    Closed,
}

pub struct FrameReader<R> {
    inner: R,
    framer: LineFramer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            framer: LineFramer::new(),
            chunk: vec![0; READ_CHUNK_SIZE],
        }
    }

    /// Bytes held back waiting for a terminator.
    #[allow(dead_code)]
    pub fn buffered(&self) -> usize {
        self.framer.buffered()
    }

    /// Wait up to `wait` for the next complete frame.
    ///
    /// Malformed and oversized lines are logged and skipped. Only a read
    /// error from the stream itself is returned as `Err`.
    pub async fn read_frame(&mut self, wait: Duration) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + wait;

        loop {
            while let Some(next) = self.framer.next_frame() {
                match next {
                    Ok(frame) => return Ok(ReadOutcome::Frame(frame)),
                    Err(anomaly) => warn!("{}", anomaly),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::Timeout);
            }

            match tokio::time::timeout(remaining, self.inner.read(&mut self.chunk)).await {
                Err(_) => return Ok(ReadOutcome::Timeout),
                Ok(Ok(0)) => {
                    if self.framer.buffered() > 0 {
                        warn!(
                            "Stream closed with {} bytes of an unterminated frame",
                            self.framer.buffered()
                        );
                    }
                    return Ok(ReadOutcome::Closed);
                }
                Ok(Ok(n)) => {
                    trace!("Read {} bytes", n);
                    self.framer.feed(&self.chunk[..n]);
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let (stream, mut peer) = duplex(1024);
        let mut reader = FrameReader::new(stream);

        let writer = tokio::spawn(async move {
            peer.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.write_all(b"\"result\":{}}\n").await.unwrap();
            peer
        });

        let outcome = reader.read_frame(TEST_TIMEOUT).await.expect("read");
        assert_eq!(
            outcome,
            ReadOutcome::Frame(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
        );
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_line_yields_only_valid_frame() {
        let (stream, mut peer) = duplex(1024);
        let mut reader = FrameReader::new(stream);

        peer.write_all(b"{\"id\":1,\"resu\n{\"id\":2,\"result\":true}\n")
            .await
            .unwrap();
        drop(peer);

        assert_eq!(
            reader.read_frame(TEST_TIMEOUT).await.expect("read"),
            ReadOutcome::Frame(json!({"id": 2, "result": true}))
        );
        assert_eq!(
            reader.read_frame(TEST_TIMEOUT).await.expect("read"),
            ReadOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_frame() {
        let (stream, mut peer) = duplex(1024);
        let mut reader = FrameReader::new(stream);

        peer.write_all(b"{\"id\":").await.unwrap();
        let outcome = timeout(TEST_TIMEOUT, reader.read_frame(Duration::from_millis(50)))
            .await
            .expect("read_frame should honor its own timeout")
            .expect("read");
        assert_eq!(outcome, ReadOutcome::Timeout);
        assert_eq!(reader.buffered(), 6);

        peer.write_all(b"7,\"result\":null}\n").await.unwrap();
        assert_eq!(
            reader.read_frame(TEST_TIMEOUT).await.expect("read"),
            ReadOutcome::Frame(json!({"id": 7, "result": null}))
        );
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (stream, peer) = duplex(64);
        let mut reader = FrameReader::new(stream);
        drop(peer);

        assert_eq!(
            reader.read_frame(TEST_TIMEOUT).await.expect("read"),
            ReadOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_several_frames_in_one_chunk() {
        let (stream, mut peer) = duplex(1024);
        let mut reader = FrameReader::new(stream);

        peer.write_all(b"{\"n\":1}\n{\"n\":2}\n").await.unwrap();

        for n in 1..=2 {
            assert_eq!(
                reader.read_frame(TEST_TIMEOUT).await.expect("read"),
                ReadOutcome::Frame(json!({ "n": n }))
            );
        }
    }
}
