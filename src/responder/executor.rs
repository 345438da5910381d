use std::time::Duration;

use dynosaur::dynosaur;
use n0_error::{Result, StackResultExt, StdResultExt};
use tracing::debug;

use crate::http::{HttpRequest, HttpResponse, filter_hop_by_hop_headers};

#[dynosaur(pub(crate) DynHttpExecutor = dyn(box) HttpExecutor)]
/// Executes a tunneled HTTP request against its real destination.
pub trait HttpExecutor: Send + Sync {
    /// Takes the raw request bytes and returns the full response bytes
    /// (status line, headers, body) exactly as a client would read them
    /// from the wire.
    fn execute<'a>(
        &'a self,
        request: &'a [u8],
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'a;
}

/// Production executor backed by a [`reqwest::Client`].
///
/// Rebuilds the tunneled request as a plaintext-HTTP call (absolute-form
/// targets pass through, origin-form targets borrow the Host header) with
/// hop-by-hop headers filtered per RFC 9110.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// Creates an executor whose upstream calls abort after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().anyerr()?;
        Ok(Self { client })
    }
}

impl HttpExecutor for ReqwestExecutor {
    async fn execute<'a>(&'a self, request: &'a [u8]) -> Result<Vec<u8>> {
        let head = HttpRequest::parse(request)?.context("Truncated tunneled request head")?;
        let url = head.target_url()?;
        let body = request[head.header_len.min(request.len())..].to_vec();
        debug!(method = %head.method, %url, body_len = body.len(), "executing upstream request");

        let mut headers = head.headers.clone();
        filter_hop_by_hop_headers(&mut headers);
        // reqwest derives Host from the URL.
        headers.remove(http::header::HOST);

        let response = self
            .client
            .request(head.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .anyerr()?;
        serialize_response(response).await
    }
}

/// Dumps a response back into HTTP/1.1 wire bytes.
///
/// The body is collected whole, so transfer framing headers are replaced by
/// a plain Content-Length.
async fn serialize_response(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let mut headers = response.headers().clone();
    filter_hop_by_hop_headers(&mut headers);
    headers.remove(http::header::CONTENT_LENGTH);
    let body = response.bytes().await.anyerr()?;

    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(HttpResponse::status_line(status).as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
