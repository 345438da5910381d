use bytes::BytesMut;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{HEADER_SECTION_MAX_LENGTH, REQUEST_MAX_LENGTH};

/// Parsed request line and header section of a proxied HTTP request.
///
/// The tunnel forwards the raw bytes untouched; this view exists to find the
/// end of the message on the proxy side and to rebuild the outbound call on
/// the responder side.
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target exactly as received (absolute-form from proxy-aware
    /// clients, origin-form otherwise).
    pub target: String,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
    /// Length of the request line and header section, including the blank line.
    pub header_len: usize,
}

impl HttpRequest {
    /// Parses a request head from a buffer; `None` when more data is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method: Method = req
                    .method
                    .context("Missing HTTP method")?
                    .parse()
                    .std_context("Invalid HTTP method")?;
                let target = req.path.context("Missing request target")?.to_string();
                let headers = header_map(req.headers);
                Ok(Some(Self {
                    method,
                    target,
                    headers,
                    header_len,
                }))
            }
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST)?.to_str().ok()
    }

    /// Declared body length.
    ///
    /// Chunked request bodies cannot be framed into a single echo request
    /// and are rejected.
    pub fn content_length(&self) -> Result<usize> {
        if self
            .headers
            .contains_key(http::header::TRANSFER_ENCODING)
        {
            return Err(anyerr!("Chunked request bodies are not supported"));
        }
        match self.headers.get(http::header::CONTENT_LENGTH) {
            None => Ok(0),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .context("Invalid Content-Length header"),
        }
    }

    /// Rewrites the request target into an absolute plaintext-HTTP URL.
    ///
    /// Origin-form targets borrow the authority from the Host header. The
    /// scheme is always `http`, matching the tunnel's plaintext-only remit.
    pub fn target_url(&self) -> Result<String> {
        let uri: Uri = self.target.parse().std_context("Invalid request target")?;
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let authority = match uri.authority() {
            Some(authority) => authority.as_str().to_string(),
            None => self
                .host()
                .context("Origin-form request without Host header")?
                .to_string(),
        };
        Ok(format!("http://{authority}{path}"))
    }
}

/// Reads one complete HTTP request and returns the parsed head together with
/// the raw bytes (header section plus `Content-Length` body).
pub(crate) async fn read_request(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(HttpRequest, Vec<u8>)> {
    let mut buf = BytesMut::with_capacity(4096);
    let request = loop {
        if let Some(request) = HttpRequest::parse(&buf)? {
            break request;
        }
        ensure_any!(
            buf.len() < HEADER_SECTION_MAX_LENGTH,
            "Header section exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
        );
        let n = reader.read_buf(&mut buf).await.anyerr()?;
        ensure_any!(n > 0, "Connection closed before end of header section");
    };
    let total = request.header_len + request.content_length()?;
    ensure_any!(
        total <= REQUEST_MAX_LENGTH,
        "Request of {total} bytes does not fit in a single echo message"
    );
    while buf.len() < total {
        let n = reader.read_buf(&mut buf).await.anyerr()?;
        ensure_any!(n > 0, "Connection closed before end of request body");
    }
    Ok((request, buf[..total].to_vec()))
}

/// Parsed status line and header section of an HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    /// Parses a response head; `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("Invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers: header_map(res.headers),
                    },
                )))
            }
        }
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(status: StatusCode) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    }
}

/// Writes a minimal `text/plain` error response for the local proxy to hand
/// back when the tunnel fails.
pub(crate) async fn write_error_response(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
) -> std::io::Result<()> {
    let content = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    writer
        .write_all(HttpResponse::status_line(status).as_bytes())
        .await?;
    writer.write_all(b"Content-Type: text/plain\r\n").await?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", content.len()).as_bytes())
        .await?;
    writer.write_all(content.as_bytes()).await?;
    Ok(())
}

/// Removes hop-by-hop headers per RFC 9110 §7.6.1 before a message crosses
/// the tunnel boundary, including any named in the Connection header.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap<HeaderValue>) {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .flat_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .flat_map(|name| name.trim().parse().ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn header_map(headers: &mut [httparse::Header<'_>]) -> HeaderMap<HeaderValue> {
    HeaderMap::from_iter(headers.iter().flat_map(|h| {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}
