use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, e, stack_error};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    RECV_BUFFER_LEN,
    conn::{DynPacketConn, PacketConn, is_transient},
    http::{read_request, write_error_response},
    session::{SessionError, SessionTable},
    wire::{EchoKind, IcmpEcho},
};

/// Options for the initiator side of the tunnel.
#[derive(Debug, Clone)]
pub struct InitiatorOpts {
    /// Address of the responder host. Echo requests carry no port; the port
    /// half is ignored by raw sockets.
    pub server_addr: SocketAddr,
    /// Deadline applied to each proxied request.
    pub request_timeout: Duration,
}

impl InitiatorOpts {
    pub fn new(server: Ipv4Addr) -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(server), 0),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client side of the tunnel.
///
/// One clone runs [`dispatch`](Self::dispatch) as the process's only socket
/// reader; any number of tasks call [`send_request`](Self::send_request)
/// concurrently. Sessions are multiplexed over the shared socket by the
/// 16-bit echo identifier.
#[derive(derive_more::Debug, Clone)]
pub struct Initiator {
    #[debug("Arc<dyn PacketConn>")]
    conn: Arc<DynPacketConn<'static>>,
    sessions: Arc<SessionTable>,
    server_addr: SocketAddr,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl Initiator {
    pub fn new(conn: impl PacketConn + 'static, opts: InitiatorOpts) -> Self {
        Self {
            conn: DynPacketConn::new_arc(conn),
            sessions: SessionTable::new(),
            server_addr: opts.server_addr,
            request_timeout: opts.request_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// The per-request deadline from [`InitiatorOpts`].
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of sessions currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    /// Cancels all in-flight requests and stops the dispatcher and proxy loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Routes inbound echo replies to the sessions waiting on them.
    ///
    /// Exactly one task per process runs this loop. Anything that is not an
    /// echo reply for a live session is dropped: other ICMP traffic, replies
    /// for sessions that already finished, and fragments for a full inbox
    /// (the session then fails by timeout rather than blocking the loop).
    pub async fn dispatch(&self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = self.conn.recv_from(&mut buf) => result,
            };
            let (n, peer) = match result {
                Ok(read) => read,
                Err(err) if is_transient(&err) => {
                    debug!("transient icmp read error: {err:#}");
                    continue;
                }
                Err(err) => {
                    return Err(err).std_context("icmp socket read failed");
                }
            };
            let echo = match IcmpEcho::decode(&buf[..n]) {
                Ok(echo) => echo,
                Err(err) => {
                    trace!(%peer, "dropping undecodable packet: {err:#}");
                    continue;
                }
            };
            if echo.kind != EchoKind::Reply {
                continue;
            }
            let Some(inbox) = self.sessions.lookup(echo.ident) else {
                trace!(ident = echo.ident, seq = echo.seq, "reply for unknown session");
                continue;
            };
            match inbox.try_send(echo) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(echo)) => {
                    warn!(ident = echo.ident, seq = echo.seq, "session inbox full, dropping fragment");
                }
                // Session finished between lookup and delivery.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Tunnels one HTTP request and returns the reassembled response bytes.
    ///
    /// The whole request goes out as a single echo request at sequence 0;
    /// the response arrives as echo replies at sequences 1.. closed by an
    /// empty terminator. Fragments may arrive in any order; the result is
    /// re-ordered by sequence. Either the complete response or an error is
    /// returned, never partial data.
    pub async fn send_request(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TunnelError> {
        // The session guard unregisters the id on every exit path.
        let mut session = self
            .sessions
            .open()
            .map_err(|source| e!(TunnelError::Sessions { source }))?;
        let ident = session.id();
        debug!(ident, len = request.len(), "sending tunneled request");

        let packet = IcmpEcho::request(ident, 0, request).encode();
        self.conn
            .send_to(&packet, self.server_addr)
            .await
            .map_err(|source| e!(TunnelError::Io { source }))?;

        let deadline = Instant::now() + timeout;
        let mut fragments: Vec<(u16, Vec<u8>)> = Vec::new();
        // Sequence of the empty end-of-response fragment, one past the last
        // data fragment. The network may deliver it before some data
        // fragments, so completion requires both the terminator and every
        // sequence below it.
        let mut terminator: Option<u16> = None;
        loop {
            if let Some(end) = terminator
                && fragments.len() >= usize::from(end) - 1
            {
                break;
            }
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(e!(TunnelError::Cancelled)),
                next = tokio::time::timeout_at(deadline, session.recv()) => next,
            };
            let echo = match next {
                Err(_elapsed) => return Err(e!(TunnelError::Timeout)),
                Ok(None) => return Err(e!(TunnelError::Cancelled)),
                Ok(Some(echo)) => echo,
            };
            // The kernel answers our own echo request with a reply at
            // sequence 0 carrying the request bytes; real response
            // fragments start at 1.
            if echo.seq == 0 {
                trace!(ident, "ignoring kernel auto-reply");
                continue;
            }
            if echo.payload.is_empty() {
                terminator = Some(echo.seq);
            } else if !fragments.iter().any(|(seq, _)| *seq == echo.seq) {
                fragments.push((echo.seq, echo.payload));
            }
        }

        fragments.sort_unstable_by_key(|(seq, _)| *seq);
        let mut response = Vec::with_capacity(fragments.iter().map(|(_, p)| p.len()).sum());
        for (_, payload) in fragments {
            response.extend_from_slice(&payload);
        }
        debug!(ident, len = response.len(), "reassembled response");
        Ok(response)
    }

    /// Accepts browser connections and forwards each request through the
    /// tunnel in its own task.
    ///
    /// Runs until the listener errors or [`shutdown`](Self::shutdown) is
    /// called; cancellation drops the per-connection tasks, which
    /// unregisters their sessions.
    pub async fn serve_proxy(&self, listener: TcpListener) -> Result<()> {
        let mut id = 0;
        loop {
            let (stream, client_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let this = self.clone();
            tokio::spawn(
                self.shutdown
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted proxy connection");
                        if let Err(err) = this.handle_proxy_conn(stream).await {
                            warn!("error while serving proxy connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("proxy-conn", id)),
            );
            id += 1;
        }
    }

    async fn handle_proxy_conn(&self, mut stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.split();
        let (head, raw) = match read_request(&mut reader).await {
            Ok(parsed) => parsed,
            Err(err) => {
                write_error_response(&mut writer, StatusCode::BAD_REQUEST)
                    .await
                    .ok();
                return Err(err).context("invalid proxy request");
            }
        };
        debug!(method = %head.method, target = %head.target, len = raw.len(), "proxying request");

        match self.send_request(&raw, self.request_timeout).await {
            Ok(response) => {
                writer.write_all(&response).await?;
                writer.shutdown().await.ok();
                Ok(())
            }
            Err(err) => {
                debug!("tunneled request failed: {err:#}");
                write_error_response(&mut writer, err.response_status())
                    .await
                    .ok();
                Err(err.into())
            }
        }
    }
}

/// Errors surfaced to [`Initiator::send_request`] callers.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum TunnelError {
    /// No complete response arrived before the deadline.
    #[error("tunneled request timed out")]
    Timeout,
    /// The initiator was shut down while the request was in flight.
    #[error("tunneled request was cancelled")]
    Cancelled,
    /// No session identifier could be allocated.
    #[error("failed to open a tunnel session")]
    Sessions {
        #[error(source)]
        source: SessionError,
    },
    /// Writing to the shared socket failed.
    #[error("tunnel transport failed")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl TunnelError {
    /// Status the local proxy reports for this failure.
    pub fn response_status(&self) -> StatusCode {
        match self {
            TunnelError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
