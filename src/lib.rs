//! HTTP proxy traffic tunneled over ICMP echo messages.
//!
//! A browser talks to a local HTTP proxy; the [`initiator`] wraps each
//! request into a single ICMP echo request addressed to the responder host.
//! The [`responder`] executes the real HTTP call and streams the response
//! back as echo reply fragments, which the initiator reassembles. The 16-bit
//! echo identifier multiplexes concurrent requests over one raw socket; the
//! sequence field orders response fragments, with sequence 0 reserved for
//! the request itself and an empty fragment marking end of response.
//!
//! All protocol logic is written against the [`conn::PacketConn`] trait, so
//! everything except the raw socket itself can run without privileges.

/// Packet transports: the raw ICMPv4 socket and an in-memory test pair.
pub mod conn;
mod http;
/// Client side: the local proxy listener and request reassembly.
pub mod initiator;
/// Server side: request execution and response fragmentation.
pub mod responder;
/// In-flight session registry keyed by echo identifier.
pub mod session;
/// ICMP echo codec.
pub mod wire;

pub use self::http::{HttpRequest, HttpResponse, filter_hop_by_hop_headers};

/// How much data to read for a request header section before it is
/// considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Largest request (header section plus body) accepted by the local proxy.
/// Requests travel in one echo message and must fit a single IP datagram.
pub(crate) const REQUEST_MAX_LENGTH: usize = 60 * 1024;

/// Receive buffer sized for the largest possible IP datagram.
pub(crate) const RECV_BUFFER_LEN: usize = 64 * 1024;

#[cfg(test)]
mod tests;
