use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

/// How RTP/RTCP packets reach this session's client: a UDP destination
/// negotiated via `client_port=`, or a pair of channel ids multiplexed onto
/// the RTSP TCP connection itself (RFC 2326 §10.12 `interleaved=`).
#[derive(Clone)]
pub enum DeliveryMode {
    Udp,
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        /// The owning RTSP connection's socket, shared with
        /// [`crate::protocol::MethodHandler`] so interleaved RTP/RTCP
        /// frames and RTSP responses serialize onto the same stream.
        writer: Arc<Mutex<TcpStream>>,
    },
}

impl std::fmt::Debug for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Udp => write!(f, "Udp"),
            DeliveryMode::Interleaved { rtp_channel, rtcp_channel, .. } => f
                .debug_struct("Interleaved")
                .field("rtp_channel", rtp_channel)
                .field("rtcp_channel", rtcp_channel)
                .finish(),
        }
    }
}

/// Negotiated RTP/RTCP transport parameters for a session (RFC 2326 §12.39).
///
/// Created during SETUP from the client's `Transport` header and the
/// server's allocated port pair. Used to address UDP packets, or to
/// identify the interleaved channel pair when `mode` is
/// [`DeliveryMode::Interleaved`].
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
///
/// The server sends RTP to `client_addr:client_rtp_port` and RTCP to
/// `client_addr:client_rtcp_port` in UDP mode; in interleaved mode both
/// travel over `mode`'s `writer`, framed with the `$`-marker (§4.9).
#[derive(Debug, Clone)]
pub struct Transport {
    /// Client's RTP receive port (UDP mode only; 0 when interleaved).
    pub client_rtp_port: u16,
    /// Client's RTCP receive port (UDP mode only; 0 when interleaved).
    pub client_rtcp_port: u16,
    /// Server's RTP send port (advertised to client, not actually bound).
    pub server_rtp_port: u16,
    /// Server's RTCP port (advertised to client, not actually bound).
    pub server_rtcp_port: u16,
    /// Full socket address for RTP delivery (`client_ip:client_rtp_port`).
    pub client_addr: SocketAddr,
    /// UDP vs. TCP-interleaved delivery (§4.9, §4.11 SETUP).
    pub mode: DeliveryMode,
}

/// Parsed client-side transport info from the RTSP `Transport` header
/// (RFC 2326 §12.39): either a UDP `client_port=` pair or a TCP
/// `interleaved=` channel pair.
#[derive(Debug, Clone)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Looks for `client_port=RTP-RTCP` (UDP) or `interleaved=A-B` (TCP)
    /// among semicolon-separated parameters; `RTP/AVP/TCP` without an
    /// explicit `interleaved=` defaults to channels 0-1, matching how
    /// most clients (ffmpeg, VLC) omit it on the first SETUP.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert!(matches!(th, TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }));
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
    /// assert!(matches!(th, TransportHeader::Interleaved { rtp_channel: 0, rtcp_channel: 1 }));
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let is_tcp = header.contains("RTP/AVP/TCP");

        for part in header.split(';') {
            let part = part.trim();
            if let Some(ports) = part.strip_prefix("client_port=") {
                let (rtp, rtcp) = parse_port_pair(ports)?;
                return Some(TransportHeader::Udp {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                });
            }
            if let Some(channels) = part.strip_prefix("interleaved=") {
                let (rtp, rtcp) = parse_port_pair(channels)?;
                return Some(TransportHeader::Interleaved {
                    rtp_channel: rtp as u8,
                    rtcp_channel: rtcp as u8,
                });
            }
        }

        if is_tcp {
            return Some(TransportHeader::Interleaved { rtp_channel: 0, rtcp_channel: 1 });
        }

        None
    }
}

fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 2 {
        return None;
    }
    let a: u16 = parts[0].parse().ok()?;
    let b: u16 = parts[1].parse().ok()?;
    Some((a, b))
}
