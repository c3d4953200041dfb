//! HTTP/1.1 header section parsing for the relay paths.
//!
//! The broker never interprets bodies; it parses heads to learn three things:
//! where to route (`Host`), how the body is framed (`Content-Length` or not),
//! and whether the connection may be reused. Headers keep their original
//! order because request heads are re-serialized with a rewritten `Host`.

use http::{HeaderName, HeaderValue, Method, StatusCode, header};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::io::AsyncRead;

use crate::util::Peeked;

const MAX_HEADERS: usize = 64;

/// How the bytes after a header section are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body follows.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Bytes follow until the stream ends (chunked or unspecified length);
    /// the connection cannot be reused afterwards.
    UntilClose,
}

/// A parsed request line plus its headers, in wire order.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    /// Minor HTTP/1.x version from the request line.
    pub version: u8,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl RequestHead {
    /// Parses a head out of `buf`; `None` while the section is incomplete.
    /// On success also returns the section length in bytes.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid http request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let method: Method = req
                    .method
                    .context("missing http method")?
                    .parse()
                    .std_context("invalid http method")?;
                let target = req.path.context("missing request target")?.to_string();
                let version = req.version.context("missing http version")?;
                let head = Self {
                    method,
                    target,
                    version,
                    headers: collect_headers(req.headers)?,
                };
                Ok(Some((len, head)))
            }
        }
    }

    /// Reads from `reader` until a complete head is buffered and parses it
    /// without consuming anything. `None` when the stream ends cleanly before
    /// the first byte of a request.
    pub async fn peek(
        reader: &mut Peeked<impl AsyncRead + Unpin>,
    ) -> Result<Option<(usize, Self)>> {
        loop {
            if let Some(parsed) = Self::parse(reader.window())? {
                return Ok(Some(parsed));
            }
            if reader.at_limit() {
                return Err(anyerr!("request header section exceeds the buffer limit"));
            }
            if reader.fill().await.std_context("read request head")? == 0 {
                if reader.window().is_empty() {
                    return Ok(None);
                }
                return Err(anyerr!("connection closed inside a request head"));
            }
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// The routing key: the `Host` header as sent by the client.
    pub fn host(&self) -> Option<&str> {
        self.header(&header::HOST).and_then(|v| v.to_str().ok())
    }

    pub fn body_framing(&self) -> Result<BodyFraming> {
        body_framing(&self.headers)
    }

    /// True when this request forbids reusing the connection afterwards.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.headers, self.version)
    }

    /// Serializes the head with the `Host` header replaced by `origin`,
    /// leaving every other header in order.
    pub fn encode_with_host(&self, origin: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.headers.len() * 32);
        buf.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            if name == header::HOST {
                buf.extend_from_slice(origin.as_bytes());
            } else {
                buf.extend_from_slice(value.as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// A parsed status line plus its headers, in wire order.
///
/// Response heads are forwarded verbatim from the buffered bytes; this type
/// only answers framing and lifetime questions about them.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: u8,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid http response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let status = StatusCode::from_u16(res.code.context("missing status code")?)
                    .std_context("invalid status code")?;
                let version = res.version.context("missing http version")?;
                let head = Self {
                    status,
                    version,
                    headers: collect_headers(res.headers)?,
                };
                Ok(Some((len, head)))
            }
        }
    }

    /// Reads from `reader` until a complete head is buffered and parses it
    /// without consuming anything.
    pub async fn peek(reader: &mut Peeked<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        loop {
            if let Some(parsed) = Self::parse(reader.window())? {
                return Ok(parsed);
            }
            if reader.at_limit() {
                return Err(anyerr!("response header section exceeds the buffer limit"));
            }
            if reader.fill().await.std_context("read response head")? == 0 {
                return Err(anyerr!("stream ended inside a response head"));
            }
        }
    }

    /// Body framing of this response to a request with `request_method`.
    pub fn body_framing(&self, request_method: &Method) -> Result<BodyFraming> {
        if request_method == &Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::None);
        }
        match body_framing(&self.headers)? {
            // A response without explicit framing runs until the origin
            // closes, unlike a request.
            BodyFraming::None => Ok(BodyFraming::UntilClose),
            framing => Ok(framing),
        }
    }

    pub fn wants_close(&self) -> bool {
        wants_close(&self.headers, self.version)
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<Vec<(HeaderName, HeaderValue)>> {
    parsed
        .iter()
        .map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .std_context("invalid header name")?;
            let value =
                HeaderValue::from_bytes(h.value).std_context("invalid header value")?;
            Ok((name, value))
        })
        .collect()
}

fn body_framing(headers: &[(HeaderName, HeaderValue)]) -> Result<BodyFraming> {
    let find = |name: &HeaderName| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    };
    if let Some(te) = find(&header::TRANSFER_ENCODING) {
        let identity = te.to_str().is_ok_and(|v| v.eq_ignore_ascii_case("identity"));
        if !identity {
            return Ok(BodyFraming::UntilClose);
        }
    }
    match find(&header::CONTENT_LENGTH) {
        None => Ok(BodyFraming::None),
        Some(value) => {
            let len: u64 = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .context("malformed content-length")?;
            Ok(BodyFraming::Length(len))
        }
    }
}

fn wants_close(headers: &[(HeaderName, HeaderValue)], version: u8) -> bool {
    let connection = headers
        .iter()
        .find(|(n, _)| n == header::CONNECTION)
        .and_then(|(_, v)| v.to_str().ok());
    match connection {
        Some(value) => value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("close")),
        // HTTP/1.0 closes unless keep-alive was negotiated explicitly.
        None => version == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &[u8]) -> (usize, RequestHead) {
        RequestHead::parse(raw).unwrap().expect("complete head")
    }

    fn response(raw: &[u8]) -> (usize, ResponseHead) {
        ResponseHead::parse(raw).unwrap().expect("complete head")
    }

    #[test]
    fn parses_a_request_head() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: hrt.test\r\nContent-Length: 4\r\n\r\nbody";
        let (len, head) = request(raw);
        assert_eq!(&raw[len..], b"body");
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/submit");
        assert_eq!(head.host(), Some("hrt.test"));
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Length(4));
        assert!(!head.wants_close());
    }

    #[test]
    fn incomplete_head_is_not_an_error() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x").unwrap().is_none());
        assert!(ResponseHead::parse(b"HTTP/1.1 200 OK\r\n").unwrap().is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(RequestHead::parse(b"NOT VALID HTTP\r\n\r\n").is_err());
    }

    #[test]
    fn host_rewrite_keeps_order_and_other_headers() {
        let raw = b"GET /a HTTP/1.1\r\nAccept: */*\r\nHost: demo\r\nX-Extra: 1\r\n\r\n";
        let (_, head) = request(raw);
        let rewritten = head.encode_with_host("127.0.0.1:9001");
        assert_eq!(
            rewritten,
            b"GET /a HTTP/1.1\r\naccept: */*\r\nhost: 127.0.0.1:9001\r\nx-extra: 1\r\n\r\n"
        );
    }

    #[test]
    fn connection_close_is_detected_in_lists() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive, close\r\n\r\n";
        assert!(request(raw).1.wants_close());
        let raw = b"GET / HTTP/1.0\r\nHost: x\r\n\r\n";
        assert!(request(raw).1.wants_close());
        let raw = b"GET / HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
        assert!(!request(raw).1.wants_close());
    }

    #[test]
    fn response_framing_rules() {
        let (_, head) = response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(
            head.body_framing(&Method::GET).unwrap(),
            BodyFraming::Length(10)
        );
        assert_eq!(head.body_framing(&Method::HEAD).unwrap(), BodyFraming::None);

        let (_, head) = response(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(head.body_framing(&Method::GET).unwrap(), BodyFraming::None);

        let (_, head) = response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(
            head.body_framing(&Method::GET).unwrap(),
            BodyFraming::UntilClose
        );

        let (_, head) = response(b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            head.body_framing(&Method::GET).unwrap(),
            BodyFraming::UntilClose
        );
    }

    #[tokio::test]
    async fn peek_leaves_the_body_in_place() {
        use tokio::io::AsyncReadExt;

        let raw = b"GET / HTTP/1.1\r\nHost: demo\r\n\r\nleftover";
        let mut reader = Peeked::new(std::io::Cursor::new(raw.to_vec()), 8192);
        let (len, head) = RequestHead::peek(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.host(), Some("demo"));
        reader.consume(len);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"leftover");
    }

    #[tokio::test]
    async fn peek_reports_clean_eof_as_none() {
        let mut reader = Peeked::new(std::io::Cursor::new(Vec::new()), 8192);
        assert!(RequestHead::peek(&mut reader).await.unwrap().is_none());
    }
}
