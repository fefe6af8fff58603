//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection.
//!
//! - **UDP** ([`udp`]): carries RTP media packets. A single ephemeral
//!   socket is shared for all outbound RTP delivery.
//!
//! - **HTTP tunnel** ([`http_tunnel`]): an optional fallback that pairs a
//!   GET and a POST HTTP connection (by `x-sessioncookie`) into one
//!   bidirectional, base64-encoded RTSP byte stream, for clients stuck
//!   behind proxies that block raw RTSP (§4.11, §10.12-adjacent).
//!
//! RTP/RTCP data itself can also ride the RTSP TCP connection directly via
//! `$`-framed interleaving (RFC 2326 §10.12), handled inside [`tcp`].

pub mod http_tunnel;
pub mod rtp_interface;
pub mod tcp;
pub mod udp;

pub use rtp_interface::{GroupSocket, InterleavedSink, UdpDestinationSink};
pub use udp::UdpTransport;
