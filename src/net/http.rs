//! Just enough HTTP/1.1 to read an upgrade request and answer plain requests.

use crate::error::ProtocolError;

/// Request heads larger than this are refused with 431.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Header names as sent; look them up with [`Request::header`].
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parses a request head (request line and headers, up to the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ProtocolError::MalformedRequest("head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| ProtocolError::MalformedRequest("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::MalformedRequest(format!(
                "bad request line: {request_line:?}"
            )));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(ProtocolError::MalformedRequest(format!(
                "unsupported version: {version}"
            )));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedRequest(format!("bad header: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Length of the head including the terminating blank line, once it is complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Builds a complete `Connection: close` response.
/// With `include_body` false (HEAD) the length is still announced.
pub fn response(
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
    include_body: bool,
) -> Vec<u8> {
    let mut status_buf = itoa::Buffer::new();
    let mut len_buf = itoa::Buffer::new();

    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status_buf.format(status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason.as_bytes());
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(content_type.as_bytes());
    out.extend_from_slice(b"\r\nContent-Length: ");
    out.extend_from_slice(len_buf.format(body.len()).as_bytes());
    out.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    if include_body {
        out.extend_from_slice(body);
    }
    out
}

/// Plain-text response whose body is the reason phrase.
pub fn status_response(status: u16, reason: &str) -> Vec<u8> {
    response(status, reason, "text/plain; charset=utf-8", reason.as_bytes(), true)
}

/// The response a rejected request gets before the connection is closed.
pub fn error_response(err: &ProtocolError) -> Vec<u8> {
    match err {
        ProtocolError::RequestHeadTooLarge { .. } => {
            status_response(431, "Request Header Fields Too Large")
        }
        _ => status_response(400, "Bad Request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost:3210\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: json, xml\r\n\
        \r\n";

    #[test]
    fn parses_upgrade_head() {
        let req = Request::parse(UPGRADE).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/chat");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(req.header("SEC-WEBSOCKET-KEY"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(req.header("sec-websocket-protocol"), Some("json, xml"));
        assert_eq!(req.header("origin"), None);
    }

    #[test]
    fn finds_head_end() {
        assert_eq!(head_len(UPGRADE), Some(UPGRADE.len()));
        assert_eq!(head_len(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(head_len(b"GET / HTTP/1.1\r\n\r\nextra"), Some(18));
    }

    #[test]
    fn rejects_malformed_heads() {
        for head in [
            &b"\r\n\r\n"[..],
            b"GET /\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
            b"GET / SPDY/3\r\n\r\n",
            b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: \xFF\r\n\r\n",
        ] {
            assert!(
                matches!(Request::parse(head), Err(ProtocolError::MalformedRequest(_))),
                "{head:?}"
            );
        }
    }

    #[test]
    fn builds_responses() {
        let out = response(200, "OK", "text/html", b"<p>hi</p>", true);
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 9\r\n\
              Connection: close\r\n\r\n<p>hi</p>"
        );

        let head_only = response(200, "OK", "text/html", b"<p>hi</p>", false);
        assert!(head_only.ends_with(b"Content-Length: 9\r\nConnection: close\r\n\r\n"));

        let rejected = error_response(&ProtocolError::NotAWebSocketUpgrade);
        assert!(rejected.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        let too_big = error_response(&ProtocolError::RequestHeadTooLarge { limit: MAX_HEAD_LEN });
        assert!(too_big.starts_with(b"HTTP/1.1 431 "));
    }
}
