//! Reading the request head off a fresh public connection
//!
//! The dispatcher needs the raw head before handing the connection to
//! hyper, so upgrades can be forwarded with their headers exactly as
//! received. [`PrefixedIo`] replays what was read for the plain path.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use burrow_control::RequestHead;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::server::ServerError;

/// Largest request head accepted
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;

/// A parsed head plus every byte read so far
#[derive(Debug)]
pub struct ParsedHead {
    pub head: RequestHead,
    /// Bytes read from the connection, head included
    pub buffered: Bytes,
    /// Length of the head within `buffered`
    pub head_len: usize,
}

impl ParsedHead {
    /// Bytes the caller sent after the head
    pub fn leftover(&self) -> Bytes {
        self.buffered.slice(self.head_len..)
    }
}

/// Parse a complete head from `buf`, `None` if more bytes are needed
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let len = match request.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let head = RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        version: request.version.unwrap_or(1),
        headers: request
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };

    Ok(Some((head, len)))
}

/// Read until a full request head is buffered
///
/// Returns `None` when the peer closes before sending a complete head.
pub async fn read_head<S>(stream: &mut S) -> Result<Option<ParsedHead>, ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(None);
        }

        if let Some((head, head_len)) = parse_head(&buf)? {
            return Ok(Some(ParsedHead {
                head,
                buffered: buf.freeze(),
                head_len,
            }));
        }

        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ServerError::HeadTooLarge);
        }

        buf.reserve(4096);
    }
}

/// Whether the head asks for a protocol upgrade
pub fn is_upgrade(head: &RequestHead) -> bool {
    let has_upgrade = head.header("upgrade").is_some();
    let connection_upgrade = head.headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("connection")
            && std::str::from_utf8(value).is_ok_and(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
    });

    has_upgrade && connection_upgrade
}

/// IO that yields `prefix` before reading from the inner stream
pub struct PrefixedIo<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_raw_headers() {
        let raw = b"GET /ws?x=1 HTTP/1.1\r\nhost: abcd.example.com\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\nextra";

        let (head, len) = parse_head(raw).unwrap().unwrap();
        assert_eq!(len, raw.len() - 5);
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/ws?x=1");
        assert_eq!(head.version, 1);
        assert_eq!(head.headers[0].0, "host");
        assert_eq!(head.headers[1].0, "Upgrade");
        assert!(is_upgrade(&head));
    }

    #[test]
    fn test_partial_head() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x").unwrap().is_none());
        assert!(parse_head(b"NOT HTTP\r\n\r\n").is_err());
    }

    #[test]
    fn test_plain_request_is_not_upgrade() {
        let (head, _) = parse_head(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!is_upgrade(&head));
    }

    #[tokio::test]
    async fn test_read_head_and_leftover() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: x\r\n\r\nhello").await.unwrap();
        });

        let parsed = read_head(&mut server).await.unwrap().unwrap();
        assert_eq!(parsed.head.header("host"), Some(&b"x"[..]));
        assert_eq!(&parsed.leftover()[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_head(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
            raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 10));
            client.write_all(&raw).await.unwrap();
            // Keep the stream open
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        assert!(matches!(
            read_head(&mut server).await,
            Err(ServerError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_prefixed_io_replays() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut io = PrefixedIo::new(Bytes::from_static(b"abc"), server);

        use tokio::io::AsyncWriteExt;
        client.write_all(b"def").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }
}
