use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    RECV_BUFFER_LEN,
    conn::{DynPacketConn, PacketConn, is_transient},
    wire::{EchoKind, IcmpEcho},
};

mod executor;
pub use executor::*;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for the responder side of the tunnel.
#[derive(Debug, Clone)]
pub struct ResponderOpts {
    /// Largest payload placed in a single echo reply. The default of 1400
    /// keeps the full IP datagram under a conservative path MTU.
    pub max_chunk_size: usize,
}

impl Default for ResponderOpts {
    fn default() -> Self {
        Self {
            max_chunk_size: 1400,
        }
    }
}

/// Server side of the tunnel.
///
/// Owns the socket reader: every inbound echo request is handed to the
/// [`HttpExecutor`] in its own task, and the executor's response bytes are
/// fragmented back to the requesting peer as a run of echo replies closed by
/// an empty terminator.
///
/// Response fragments always start at sequence 1. Sequence 0 belongs to the
/// original request, and the host kernel answers that one on its own; a
/// fragment at sequence 0 would be indistinguishable from the kernel's
/// auto-reply on the initiator side.
#[derive(derive_more::Debug)]
pub struct Responder {
    #[debug("Arc<dyn PacketConn>")]
    conn: Arc<DynPacketConn<'static>>,
    #[debug("Arc<dyn HttpExecutor>")]
    executor: Arc<DynHttpExecutor<'static>>,
    max_chunk_size: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Responder {
    pub fn new(
        conn: impl PacketConn + 'static,
        executor: impl HttpExecutor + 'static,
        opts: ResponderOpts,
    ) -> Self {
        Self {
            conn: DynPacketConn::new_arc(conn),
            executor: DynHttpExecutor::new_arc(executor),
            max_chunk_size: opts.max_chunk_size,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Reads echo requests off the socket and spawns a handler per request.
    ///
    /// Runs until the socket fails with a non-transient error or
    /// [`shutdown`](Self::shutdown) is called. Handlers are not serialized;
    /// concurrent requests from one peer proceed independently.
    pub async fn serve(&self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut id = 0u64;
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
                Err(err) => return Err(err).std_context("icmp socket read failed"),
            };
            let echo = match IcmpEcho::decode(&buf[..n]) {
                Ok(echo) => echo,
                Err(err) => {
                    trace!(%peer, "dropping undecodable packet: {err:#}");
                    continue;
                }
            };
            if echo.kind != EchoKind::Request {
                continue;
            }
            debug!(%peer, ident = echo.ident, len = echo.payload.len(), "tunneled request");

            let conn = self.conn.clone();
            let executor = self.executor.clone();
            let max_chunk_size = self.max_chunk_size;
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(
                async move {
                    if let Err(err) =
                        handle_request(conn, executor, max_chunk_size, peer, echo).await
                    {
                        if shutdown.is_cancelled() {
                            debug!("aborted at shutdown: {err:#}");
                        } else {
                            // The initiator has no error channel; it will
                            // observe this as a timeout.
                            warn!("failed to handle tunneled request: {err:#}");
                        }
                    }
                }
                .instrument(error_span!("request", id)),
            );
            id += 1;
        }
    }

    /// Stops accepting requests and waits briefly for in-flight handlers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending handlers)", self.tasks.len());
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.tasks.wait()).await {
            Ok(()) => debug!("all handlers finished"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "handlers did not finish in time, abort"
            ),
        }
    }
}

async fn handle_request(
    conn: Arc<DynPacketConn<'static>>,
    executor: Arc<DynHttpExecutor<'static>>,
    max_chunk_size: usize,
    peer: SocketAddr,
    echo: IcmpEcho,
) -> Result<()> {
    let response = executor.execute(&echo.payload).await?;
    debug!(%peer, len = response.len(), "sending response fragments");
    send_response_chunks(conn.as_ref(), peer, echo.ident, &response, max_chunk_size)
        .await
        .std_context("failed to write response fragments")?;
    Ok(())
}

/// Fragments `data` into echo replies of at most `max_chunk_size` payload
/// bytes, sequenced from 1, followed by an empty terminator one past the
/// last data fragment. An empty response is a lone terminator at sequence 1.
pub(crate) async fn send_response_chunks<C: PacketConn + ?Sized>(
    conn: &C,
    peer: SocketAddr,
    ident: u16,
    data: &[u8],
    max_chunk_size: usize,
) -> io::Result<()> {
    // The terminator must land inside the 16-bit sequence space; wrapping
    // would corrupt reassembly, so oversized responses are abandoned.
    if data.len().div_ceil(max_chunk_size) + 1 > usize::from(u16::MAX) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "response does not fit the 16-bit fragment space",
        ));
    }
    let mut seq: u16 = 1;
    for chunk in data.chunks(max_chunk_size) {
        conn.send_to(&IcmpEcho::reply(ident, seq, chunk).encode(), peer)
            .await?;
        seq += 1;
    }
    conn.send_to(&IcmpEcho::reply(ident, seq, Vec::new()).encode(), peer)
        .await?;
    Ok(())
}
