use std::{
    io,
    mem::MaybeUninit,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use dynosaur::dynosaur;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::unix::AsyncFd,
    sync::{Mutex, mpsc},
};

#[dynosaur(pub(crate) DynPacketConn = dyn(box) PacketConn)]
/// Datagram transport carrying raw ICMP messages.
///
/// Both tunnel roles are written against this trait so the protocol can be
/// exercised without raw-socket privileges; see [`memory_pair`].
pub trait PacketConn: Send + Sync {
    /// Receives one ICMP message, stripped of any leading IP header.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a;

    /// Sends one ICMP message to the given peer.
    ///
    /// Writes may race from several tasks; implementations must deliver each
    /// call as a single datagram.
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

/// A nonblocking raw ICMPv4 socket driven by the tokio reactor.
///
/// Requires CAP_NET_RAW (or root) to open.
#[derive(Debug)]
pub struct RawIcmpSocket {
    fd: AsyncFd<Socket>,
}

impl RawIcmpSocket {
    /// Opens a raw ICMPv4 socket bound to `local`.
    pub fn bind(local: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.bind(&SocketAddr::new(IpAddr::V4(local), 0).into())?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }
}

impl PacketConn for RawIcmpSocket {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            // socket2 takes MaybeUninit; reusing the caller's buffer in place
            // is sound because only the kernel-filled prefix is read back.
            let result = guard.try_io(|fd| {
                let spare =
                    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) };
                fd.get_ref().recv_from(spare)
            });
            match result {
                Ok(Ok((n, addr))) => {
                    let addr = addr
                        .as_socket()
                        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                    let n = strip_ip_header(buf, n);
                    return Ok((n, addr));
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], addr: SocketAddr) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| fd.get_ref().send_to(buf, &addr.into())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Raw ICMPv4 sockets deliver the IPv4 header in front of the ICMP message;
/// shift it off so callers always see bare ICMP. Valid echo messages start
/// with type 0 or 8 and are never mistaken for a version-4 header.
fn strip_ip_header(buf: &mut [u8], n: usize) -> usize {
    if n >= 20 && buf[0] >> 4 == 4 {
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if (20..=n).contains(&ihl) {
            buf.copy_within(ihl..n, 0);
            return n - ihl;
        }
    }
    n
}

/// Read errors that leave the socket usable; the dispatcher loops log these
/// and keep reading. Anything else terminates the loop.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// A connected pair of in-memory packet conns.
///
/// Everything written to one side is readable from the other, tagged with
/// the writer's address. Protocol tests run on these instead of raw sockets.
pub fn memory_pair(a: SocketAddr, b: SocketAddr) -> (MemoryConn, MemoryConn) {
    let (a_to_b, from_a) = mpsc::unbounded_channel();
    let (b_to_a, from_b) = mpsc::unbounded_channel();
    (
        MemoryConn {
            local: a,
            peer: a_to_b,
            inbox: Mutex::new(from_b),
        },
        MemoryConn {
            local: b,
            peer: b_to_a,
            inbox: Mutex::new(from_a),
        },
    )
}

/// One side of a [`memory_pair`].
#[derive(Debug)]
pub struct MemoryConn {
    local: SocketAddr,
    peer: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbox: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl PacketConn for MemoryConn {
    async fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (data, from) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer conn closed"))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    async fn send_to<'a>(&'a self, buf: &'a [u8], _addr: SocketAddr) -> io::Result<usize> {
        self.peer
            .send((buf.to_vec(), self.local))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer conn closed"))?;
        Ok(buf.len())
    }
}
