//! Streaming rewrite of the first `Host` header on the local leg

use std::borrow::Cow;

/// Rewrites the value of the first `Host:` header seen, then passes bytes through
///
/// The header must follow a line terminator inside a single chunk. Once one
/// replacement happened, later chunks are never inspected, so a body that
/// happens to contain `\r\nHost: ` is left alone.
#[derive(Debug, Clone)]
pub struct HostRewriteFilter {
    host: String,
    replaced: bool,
}

impl HostRewriteFilter {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            replaced: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the header has been rewritten yet
    pub fn is_done(&self) -> bool {
        self.replaced
    }

    /// Transform one chunk of the remote stream
    pub fn transform<'a>(&mut self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        if self.replaced {
            return Cow::Borrowed(chunk);
        }

        let Some((start, end)) = find_host_value(chunk) else {
            return Cow::Borrowed(chunk);
        };

        self.replaced = true;
        let mut out = Vec::with_capacity(chunk.len() - (end - start) + self.host.len());
        out.extend_from_slice(&chunk[..start]);
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&chunk[end..]);
        Cow::Owned(out)
    }
}

const HOST_PREFIX: &[u8] = b"\r\nhost: ";

/// Byte range of the first non-empty value after `\r\nHost: `
fn find_host_value(chunk: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;

    while let Some(offset) = chunk[from..]
        .windows(HOST_PREFIX.len())
        .position(|w| w.eq_ignore_ascii_case(HOST_PREFIX))
    {
        let start = from + offset + HOST_PREFIX.len();
        let len = chunk[start..]
            .iter()
            .take_while(|b| !b.is_ascii_whitespace())
            .count();

        if len > 0 {
            return Some((start, start + len));
        }
        from = start;
    }

    None
}

/// Method and path when `chunk` starts like a request line
pub fn sniff_request(chunk: &[u8]) -> Option<(String, String)> {
    let method_len = chunk
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    if method_len == 0 || chunk.get(method_len) != Some(&b' ') {
        return None;
    }

    let rest = &chunk[method_len + 1..];
    let path_len = rest
        .iter()
        .take_while(|b| !b.is_ascii_whitespace())
        .count();
    if path_len == 0 {
        return None;
    }

    Some((
        String::from_utf8_lossy(&chunk[..method_len]).into_owned(),
        String::from_utf8_lossy(&rest[..path_len]).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_first_host_only() {
        let mut filter = HostRewriteFilter::new("new");

        let out = filter.transform(b"GET / HTTP/1.1\r\nHost: old\r\n\r\nbody");
        assert_eq!(&out[..], b"GET / HTTP/1.1\r\nHost: new\r\n\r\nbody");
        assert!(filter.is_done());

        let later = b"more body\r\nHost: evil\r\n";
        assert_eq!(&filter.transform(later)[..], &later[..]);
    }

    #[test]
    fn test_header_name_case() {
        let mut filter = HostRewriteFilter::new("localhost:3000");
        let out = filter.transform(b"POST /x HTTP/1.1\r\nhOsT: abcd.example.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(
            &out[..],
            b"POST /x HTTP/1.1\r\nhOsT: localhost:3000\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_waits_for_a_chunk_with_host() {
        let mut filter = HostRewriteFilter::new("new");

        let first = b"GET / HTTP/1.1\r\nAccept: */*";
        assert_eq!(&filter.transform(first)[..], &first[..]);
        assert!(!filter.is_done());

        let out = filter.transform(b"\r\nHost: old:8080\r\n\r\n");
        assert_eq!(&out[..], b"\r\nHost: new\r\n\r\n");
    }

    #[test]
    fn test_ignores_host_without_line_break() {
        let mut filter = HostRewriteFilter::new("new");
        let chunk = b"Host: old\r\n";
        assert_eq!(&filter.transform(chunk)[..], &chunk[..]);

        // A value-less match is skipped in favour of a later one
        let out = filter.transform(b"\r\nHost: \r\nHost: old\r\n");
        assert_eq!(&out[..], b"\r\nHost: \r\nHost: new\r\n");
    }

    #[test]
    fn test_sniff_request() {
        assert_eq!(
            sniff_request(b"GET /hello?x=1 HTTP/1.1\r\n"),
            Some(("GET".to_string(), "/hello?x=1".to_string()))
        );
        assert_eq!(sniff_request(b"\x16\x03\x01 binary"), None);
        assert_eq!(sniff_request(b"GET  /double"), None);
        assert_eq!(sniff_request(b"body-bytes"), None);
    }
}
