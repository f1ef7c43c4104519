use std::{io, time::Duration};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUF_SIZE: usize = 1024;
const MAX_FIRST_LINE_CHARS: usize = 256;

/// Why the sniffer stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// An empty line ended the request head.
    HeadComplete,
    /// Nothing more arrived within the read timeout.
    TimedOut,
    /// The client closed (or reset) its side.
    PeerClosed,
    /// The size limit was reached before the head ended.
    LimitReached,
}

/// `RequestSummary` is what gets logged about a request, nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub bytes: usize,
    pub first_line: Option<String>,
    pub termination: Termination,
}

impl RequestSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    fn from_bytes(raw: &[u8], termination: Termination) -> Self {
        let text = String::from_utf8_lossy(raw);
        let first_line = text
            .trim()
            .lines()
            .next()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(|line| line.chars().take(MAX_FIRST_LINE_CHARS).collect());

        Self {
            bytes: raw.len(),
            first_line,
            termination,
        }
    }
}

fn head_end(buffer: &[u8]) -> Option<usize> {
    let crlf = buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4);
    let lf = buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|at| at + 2);

    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// `RequestSniffer` reads just enough of a request to log it. Bytes past the
/// end of one request head stay buffered for the next call, so pipelined
/// requests on one connection are seen one at a time.
#[derive(Debug)]
pub struct RequestSniffer {
    buffer: BytesMut,
    max_request_bytes: usize,
}

impl RequestSniffer {
    #[must_use]
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            max_request_bytes: max_request_bytes.max(1),
        }
    }

    /// Reads until a request head ends, the peer closes, the limit is hit or
    /// `timeout` elapses; whichever comes first. Only unexpected I/O errors
    /// are returned as errors.
    pub async fn sniff<R>(&mut self, reader: &mut R, timeout: Duration) -> io::Result<RequestSummary>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(end) = head_end(&self.buffer) {
                return Ok(self.take(end, Termination::HeadComplete));
            }

            if self.buffer.len() >= self.max_request_bytes {
                return Ok(self.take(self.buffer.len(), Termination::LimitReached));
            }

            self.buffer.reserve(DEFAULT_BUF_SIZE);
            let read = tokio::time::timeout_at(deadline, reader.read_buf(&mut self.buffer)).await;

            match read {
                Err(_elapsed) => {
                    return Ok(self.take(self.buffer.len(), Termination::TimedOut));
                }
                Ok(Ok(0)) => {
                    return Ok(self.take(self.buffer.len(), Termination::PeerClosed));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => {
                    use std::io::ErrorKind::{ConnectionAborted, ConnectionReset};
                    return match err.kind() {
                        // a client hanging up early is part of the game
                        ConnectionReset | ConnectionAborted => {
                            Ok(self.take(self.buffer.len(), Termination::PeerClosed))
                        }
                        _ => Err(err),
                    };
                }
            }
        }
    }

    fn take(&mut self, end: usize, termination: Termination) -> RequestSummary {
        let summary = RequestSummary::from_bytes(&self.buffer[..end], termination);
        self.buffer.advance(end);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn stops_at_the_end_of_the_request_head() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("should write request");

        let mut sniffer = RequestSniffer::new(4096);
        let summary = sniffer.sniff(&mut server, TIMEOUT).await.expect("should sniff");

        assert_eq!(summary.termination, Termination::HeadComplete);
        assert_eq!(summary.first_line.as_deref(), Some("GET /index.html HTTP/1.1"));
        assert_eq!(summary.bytes, 45);
    }

    #[tokio::test]
    async fn pipelined_requests_are_seen_one_by_one() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .await
            .expect("should write requests");

        let mut sniffer = RequestSniffer::new(4096);
        let first = sniffer.sniff(&mut server, TIMEOUT).await.expect("first");
        let second = sniffer.sniff(&mut server, TIMEOUT).await.expect("second");

        assert_eq!(first.first_line.as_deref(), Some("GET /a HTTP/1.1"));
        assert_eq!(second.first_line.as_deref(), Some("GET /b HTTP/1.1"));
        assert_eq!(second.termination, Termination::HeadComplete);
    }

    #[tokio::test]
    async fn silent_client_times_out_with_nothing() {
        let (_client, mut server) = tokio::io::duplex(64);

        let mut sniffer = RequestSniffer::new(4096);
        let summary = sniffer.sniff(&mut server, TIMEOUT).await.expect("should sniff");

        assert_eq!(summary.termination, Termination::TimedOut);
        assert!(summary.is_empty());
        assert_eq!(summary.first_line, None);
    }

    #[tokio::test]
    async fn partial_request_is_reported_on_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"POST /upl").await.expect("should write");

        let mut sniffer = RequestSniffer::new(4096);
        let summary = sniffer.sniff(&mut server, TIMEOUT).await.expect("should sniff");

        assert_eq!(summary.termination, Termination::TimedOut);
        assert_eq!(summary.bytes, 9);
        assert_eq!(summary.first_line.as_deref(), Some("POST /upl"));
    }

    #[tokio::test]
    async fn closed_client_ends_the_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x16\x03\x01garbage").await.expect("should write");
        drop(client);

        let mut sniffer = RequestSniffer::new(4096);
        let summary = sniffer.sniff(&mut server, TIMEOUT).await.expect("should sniff");

        assert_eq!(summary.termination, Termination::PeerClosed);
        assert_eq!(summary.bytes, 10);
    }

    #[tokio::test]
    async fn oversized_head_is_cut_at_the_limit() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        client.write_all(&[b'A'; 300]).await.expect("should write");

        let mut sniffer = RequestSniffer::new(128);
        let summary = sniffer.sniff(&mut server, TIMEOUT).await.expect("should sniff");

        assert_eq!(summary.termination, Termination::LimitReached);
        assert!(summary.bytes >= 128);
    }

    #[test]
    fn bare_newlines_also_end_a_head() {
        assert_eq!(head_end(b"GET / HTTP/1.0\n\nrest"), Some(16));
        assert_eq!(head_end(b"GET / HTTP/1.0\r\n"), None);
    }
}
