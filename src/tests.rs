use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;

use crate::{
    HttpResponse, RECV_BUFFER_LEN,
    conn::{MemoryConn, PacketConn, memory_pair},
    initiator::{Initiator, InitiatorOpts, TunnelError},
    responder::{HttpExecutor, Responder, ResponderOpts, ReqwestExecutor},
    wire::{EchoKind, IcmpEcho},
};

// -- Test helpers --

fn client_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0)
}

fn server_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 0)
}

fn spawn_initiator(conn: MemoryConn, timeout: Duration) -> (Initiator, AbortOnDropHandle<()>) {
    let opts = InitiatorOpts {
        server_addr: server_addr(),
        request_timeout: timeout,
    };
    let initiator = Initiator::new(conn, opts);
    let dispatcher = {
        let initiator = initiator.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            initiator.dispatch().await.ok();
        }))
    };
    (initiator, dispatcher)
}

/// Spawns a full in-memory tunnel: initiator dispatcher plus responder loop.
fn spawn_tunnel(
    executor: impl HttpExecutor + 'static,
    timeout: Duration,
) -> (Initiator, Vec<AbortOnDropHandle<()>>) {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, dispatcher) = spawn_initiator(client_conn, timeout);
    let responder = Responder::new(server_conn, executor, ResponderOpts::default());
    let server = AbortOnDropHandle::new(tokio::spawn(async move {
        responder.serve().await.ok();
    }));
    (initiator, vec![dispatcher, server])
}

/// Reads from the server end until an echo request arrives.
async fn read_echo_request(conn: &MemoryConn) -> (IcmpEcho, SocketAddr) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        let echo = IcmpEcho::decode(&buf[..n]).unwrap();
        if echo.kind == EchoKind::Request {
            return (echo, from);
        }
    }
}

async fn send_fragment(conn: &MemoryConn, to: SocketAddr, ident: u16, seq: u16, payload: &[u8]) {
    conn.send_to(&IcmpEcho::reply(ident, seq, payload.to_vec()).encode(), to)
        .await
        .unwrap();
}

/// Reads a whole HTTP response from a stream and returns (status, body).
async fn read_http_response(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<(u16, Vec<u8>)> {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf))
        .await
        .anyerr()?
        .anyerr()?;
    let (header_len, response) =
        HttpResponse::parse_with_len(&buf)?.context("Incomplete HTTP response")?;
    Ok((response.status.as_u16(), buf[header_len..].to_vec()))
}

// -- Test executors --

/// Returns a fixed response regardless of the request.
struct FixedExecutor(Vec<u8>);

impl HttpExecutor for FixedExecutor {
    async fn execute<'a>(&'a self, _request: &'a [u8]) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Echoes the request bytes back as the response.
struct EchoExecutor;

impl HttpExecutor for EchoExecutor {
    async fn execute<'a>(&'a self, request: &'a [u8]) -> Result<Vec<u8>> {
        Ok(request.to_vec())
    }
}

/// Always fails; the responder abandons the session.
struct FailingExecutor;

impl HttpExecutor for FailingExecutor {
    async fn execute<'a>(&'a self, _request: &'a [u8]) -> Result<Vec<u8>> {
        Err(anyerr!("upstream exploded"))
    }
}

// -- Tests --

/// A small response travels as one data fragment plus a terminator.
#[tokio::test]
async fn test_small_round_trip() {
    let response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
    let (initiator, _tasks) = spawn_tunnel(FixedExecutor(response.clone()), Duration::from_secs(5));

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let got = initiator
        .send_request(request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(got, response);
    assert_eq!(initiator.in_flight(), 0);
}

/// A 3000-byte response is split into 1400/1400/200 and reassembled.
#[tokio::test]
async fn test_chunked_response() {
    let response: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    let (initiator, _tasks) = spawn_tunnel(FixedExecutor(response.clone()), Duration::from_secs(5));

    let got = initiator
        .send_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(got, response);
}

/// An empty response round-trips as a lone terminator.
#[tokio::test]
async fn test_empty_response() {
    let (initiator, _tasks) = spawn_tunnel(FixedExecutor(Vec::new()), Duration::from_secs(5));
    let got = initiator
        .send_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(got.is_empty());
}

/// Fragments delivered out of order are restored by the sequence sort.
#[tokio::test]
async fn test_out_of_order_reassembly() {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, _dispatcher) = spawn_initiator(client_conn, Duration::from_secs(5));

    let response: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let server = {
        let chunks: Vec<Vec<u8>> = response.chunks(1400).map(|c| c.to_vec()).collect();
        AbortOnDropHandle::new(tokio::spawn(async move {
            let (echo, from) = read_echo_request(&server_conn).await;
            // Deliver as seq 3, 1, 4 (terminator), 2.
            send_fragment(&server_conn, from, echo.ident, 3, &chunks[2]).await;
            send_fragment(&server_conn, from, echo.ident, 1, &chunks[0]).await;
            send_fragment(&server_conn, from, echo.ident, 4, &[]).await;
            send_fragment(&server_conn, from, echo.ident, 2, &chunks[1]).await;
        }))
    };

    let got = initiator
        .send_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(got, response);
    drop(server);
}

/// A spurious reply at sequence 0 (the kernel answering the ping) is ignored.
#[tokio::test]
async fn test_kernel_auto_reply_suppression() {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, _dispatcher) = spawn_initiator(client_conn, Duration::from_secs(5));

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
    let response = b"HTTP/1.1 204 No Content\r\n\r\n".to_vec();
    let server = {
        let response = response.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            let (echo, from) = read_echo_request(&server_conn).await;
            // What the kernel would synthesize: same ident, seq 0, request bytes.
            send_fragment(&server_conn, from, echo.ident, 0, &echo.payload).await;
            send_fragment(&server_conn, from, echo.ident, 1, &response).await;
            send_fragment(&server_conn, from, echo.ident, 2, &[]).await;
        }))
    };

    let got = initiator
        .send_request(&request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(got, response);
    drop(server);
}

/// Replies for unknown identifiers are dropped without disturbing live sessions.
#[tokio::test]
async fn test_unknown_ident_is_dropped() {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, _dispatcher) = spawn_initiator(client_conn, Duration::from_secs(5));

    let server = AbortOnDropHandle::new(tokio::spawn(async move {
        let (echo, from) = read_echo_request(&server_conn).await;
        let stray = echo.ident.wrapping_add(1);
        send_fragment(&server_conn, from, stray, 1, b"stray").await;
        send_fragment(&server_conn, from, stray, 2, &[]).await;
        send_fragment(&server_conn, from, echo.ident, 1, b"real").await;
        send_fragment(&server_conn, from, echo.ident, 2, &[]).await;
    }));

    let got = initiator
        .send_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(got, b"real");
    drop(server);
}

/// No fragments at all: the request times out and the session is cleaned up.
#[tokio::test]
async fn test_timeout_unregisters_session() {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, _dispatcher) = spawn_initiator(client_conn, Duration::from_secs(5));
    // Keep the server end alive but silent.
    let _server_conn = server_conn;

    let err = initiator
        .send_request(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Timeout { .. }));
    assert_eq!(err.response_status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(initiator.in_flight(), 0);
}

/// An executor failure is invisible on the wire; the initiator times out.
#[tokio::test]
async fn test_failing_executor_times_out() {
    let (initiator, _tasks) = spawn_tunnel(FailingExecutor, Duration::from_secs(5));
    let err = initiator
        .send_request(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Timeout { .. }));
}

/// 100 concurrent sessions each get their own response back.
#[tokio::test]
async fn test_concurrent_sessions() {
    let (initiator, _tasks) = spawn_tunnel(EchoExecutor, Duration::from_secs(10));

    let mut handles = Vec::new();
    for i in 0..100usize {
        let initiator = initiator.clone();
        handles.push(tokio::spawn(async move {
            // Vary the length so some responses chunk and some do not.
            let payload = format!("request {i} ").repeat(i % 7 + 1).into_bytes();
            let got = initiator
                .send_request(&payload, Duration::from_secs(10))
                .await?;
            Ok::<_, TunnelError>((payload, got))
        }));
    }
    for handle in handles {
        let (sent, got) = handle.await.unwrap().unwrap();
        assert_eq!(sent, got);
    }
    assert_eq!(initiator.in_flight(), 0);
}

// -- HTTP integration --

/// The reqwest executor performs a real call against a hyper origin.
#[tokio::test]
async fn test_reqwest_executor() -> Result {
    let listener = TcpListener::bind("localhost:0").await?;
    let origin_addr = listener.local_addr()?;
    let _origin = AbortOnDropHandle::new(tokio::spawn(origin_server::run(listener, "origin")));

    let executor = ReqwestExecutor::new(Duration::from_secs(5))?;
    let request =
        format!("GET http://{origin_addr}/test/path HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    let response = executor.execute(request.as_bytes()).await?;

    let (header_len, parsed) =
        HttpResponse::parse_with_len(&response)?.context("Incomplete HTTP response")?;
    assert_eq!(parsed.status, StatusCode::OK);
    assert_eq!(&response[header_len..], b"origin GET /test/path");
    Ok(())
}

/// Full path: reqwest client -> local proxy -> tunnel -> responder -> hyper origin.
#[tokio::test]
async fn test_proxy_end_to_end() -> Result {
    let origin_listener = TcpListener::bind("localhost:0").await?;
    let origin_addr = origin_listener.local_addr()?;
    let _origin =
        AbortOnDropHandle::new(tokio::spawn(origin_server::run(origin_listener, "origin")));

    let executor = ReqwestExecutor::new(Duration::from_secs(5))?;
    let (initiator, _tasks) = spawn_tunnel(executor, Duration::from_secs(5));

    let proxy_listener = TcpListener::bind("localhost:0").await?;
    let proxy_addr = proxy_listener.local_addr()?;
    let _proxy = {
        let initiator = initiator.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            initiator.serve_proxy(proxy_listener).await.ok();
        }))
    };
    debug!(%proxy_addr, %origin_addr, "tunnel proxy ready");

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;
    let res = client
        .get(format!("http://{origin_addr}/tunnel/me"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin GET /tunnel/me");
    Ok(())
}

/// POST bodies survive the trip through the tunnel.
#[tokio::test]
async fn test_proxy_post_with_body() -> Result {
    let origin_listener = TcpListener::bind("localhost:0").await?;
    let origin_addr = origin_listener.local_addr()?;
    let _origin = AbortOnDropHandle::new(tokio::spawn(origin_server::run_echo_body(
        origin_listener,
        "origin",
    )));

    let executor = ReqwestExecutor::new(Duration::from_secs(5))?;
    let (initiator, _tasks) = spawn_tunnel(executor, Duration::from_secs(5));

    let proxy_listener = TcpListener::bind("localhost:0").await?;
    let proxy_addr = proxy_listener.local_addr()?;
    let _proxy = {
        let initiator = initiator.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            initiator.serve_proxy(proxy_listener).await.ok();
        }))
    };

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;
    let res = client
        .post(format!("http://{origin_addr}/upload"))
        .body("hello request body")
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.text().await.anyerr()?,
        "origin POST /upload: hello request body"
    );
    Ok(())
}

// -- Edge case tests --

/// Garbage on the proxy port gets a 400 and does not wedge the listener.
#[tokio::test]
async fn test_proxy_invalid_request() -> Result {
    let (initiator, _tasks) = spawn_tunnel(EchoExecutor, Duration::from_secs(5));
    let proxy_listener = TcpListener::bind("localhost:0").await?;
    let proxy_addr = proxy_listener.local_addr()?;
    let _proxy = {
        let initiator = initiator.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            initiator.serve_proxy(proxy_listener).await.ok();
        }))
    };

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"NOT VALID HTTP\r\n\r\n").await?;
    let (status, _) = read_http_response(&mut stream).await?;
    assert_eq!(status, 400);
    Ok(())
}

/// A dead responder surfaces as 504 from the local proxy.
#[tokio::test]
async fn test_proxy_gateway_timeout() -> Result {
    let (client_conn, server_conn) = memory_pair(client_addr(), server_addr());
    let (initiator, _dispatcher) = spawn_initiator(client_conn, Duration::from_millis(200));
    let _silent_server = server_conn;

    let proxy_listener = TcpListener::bind("localhost:0").await?;
    let proxy_addr = proxy_listener.local_addr()?;
    let _proxy = {
        let initiator = initiator.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            initiator.serve_proxy(proxy_listener).await.ok();
        }))
    };

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await?;
    let (status, _) = read_http_response(&mut stream).await?;
    assert_eq!(status, 504);
    Ok(())
}

mod origin_server {
    use std::{convert::Infallible, sync::Arc};

    use http_body_util::{BodyExt, Full};
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Returns "{label} {METHOD} {PATH}" as response body.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    async move {
                        let body = format!("{} {} {}", *label, req.method(), req.uri().path());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }

    /// Returns "{label} {METHOD} {PATH}: {BODY}" as response body.
    pub(super) async fn run_echo_body(listener: TcpListener, label: &'static str) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let body_bytes = req.collect().await.unwrap().to_bytes();
                        let body_str = String::from_utf8_lossy(&body_bytes);
                        let response = format!("{} {} {}: {}", *label, method, path, body_str);
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(response))))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
