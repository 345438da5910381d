use std::{net::Ipv4Addr, time::Duration};

use clap::Parser;
use echotun::{
    conn::RawIcmpSocket,
    initiator::{Initiator, InitiatorOpts},
    responder::{ReqwestExecutor, Responder, ResponderOpts},
};
use n0_error::Result;
use tokio::net::TcpListener;

#[derive(Parser)]
enum Cli {
    /// Run the client side: a local HTTP proxy whose traffic leaves as ICMP.
    ///
    /// Requires the privilege to open a raw ICMP socket.
    Initiator {
        /// Address of the responder host.
        server: Ipv4Addr,
        /// host:port for the local HTTP proxy listener.
        #[clap(short, long, default_value = "127.0.0.1:8080")]
        proxy_addr: String,
        /// Per-request timeout in seconds.
        #[clap(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Run the server side: executes tunneled requests upstream.
    ///
    /// Requires the privilege to open a raw ICMP socket.
    Responder {
        /// Local bind address for the raw socket.
        #[clap(long, default_value = "0.0.0.0")]
        listen: Ipv4Addr,
        /// Largest payload per echo reply.
        #[clap(long, default_value_t = 1400)]
        max_chunk: usize,
        /// Upstream HTTP timeout in seconds.
        #[clap(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Initiator {
            server,
            proxy_addr,
            timeout,
        } => cmd_initiator(server, proxy_addr, timeout).await,
        Cli::Responder {
            listen,
            max_chunk,
            timeout,
        } => cmd_responder(listen, max_chunk, timeout).await,
    }
}

async fn cmd_initiator(server: Ipv4Addr, proxy_addr: String, timeout: u64) -> Result<()> {
    let socket = RawIcmpSocket::bind(Ipv4Addr::UNSPECIFIED)?;
    let mut opts = InitiatorOpts::new(server);
    opts.request_timeout = Duration::from_secs(timeout);
    let initiator = Initiator::new(socket, opts);

    let listener = TcpListener::bind(&proxy_addr).await?;
    println!("http proxy listening on {}", listener.local_addr()?);
    println!("requests are tunneled to {server} over icmp echo");

    let dispatcher = initiator.clone();
    tokio::select! {
        res = dispatcher.dispatch() => res?,
        res = initiator.serve_proxy(listener) => res?,
        _ = tokio::signal::ctrl_c() => initiator.shutdown(),
    }
    Ok(())
}

async fn cmd_responder(listen: Ipv4Addr, max_chunk: usize, timeout: u64) -> Result<()> {
    let socket = RawIcmpSocket::bind(listen)?;
    let executor = ReqwestExecutor::new(Duration::from_secs(timeout))?;
    let responder = Responder::new(
        socket,
        executor,
        ResponderOpts {
            max_chunk_size: max_chunk,
        },
    );
    println!("responder waiting for echo requests on {listen}");
    tokio::select! {
        res = responder.serve() => res?,
        _ = tokio::signal::ctrl_c() => responder.shutdown().await,
    }
    Ok(())
}
