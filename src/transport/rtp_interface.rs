//! RTP interface (C10): the dual UDP/interleaved-TCP transport a
//! [`crate::media::multi_framed_rtp_sink::PacketSink`] is built on,
//! grounded in `RTPInterface.hh`'s `sendPacket` dispatch and the `$`
//! framing in RFC 2326 §10.12.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::multi_framed_rtp_sink::PacketSink;
use crate::Result;

/// A bound UDP socket used for both RTP and RTCP (RTCP traffic uses the
/// same underlying socket with a distinct destination port, matching
/// `Groupsock`'s role as a thin address+socket pair).
pub struct GroupSocket {
    socket: Arc<UdpSocket>,
}

impl GroupSocket {
    /// Binds `bind_addr` and, if `multicast_group` is set, joins it so the
    /// socket can also receive traffic for a multicast destination (used
    /// when a subsession streams to a multicast group rather than unicast).
    pub fn bind(bind_addr: SocketAddr, multicast_group: Option<Ipv4Addr>) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        if let Some(group) = multicast_group {
            let interface = match bind_addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &interface)?;
        }
        Ok(GroupSocket {
            socket: Arc::new(socket),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, dest)?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

/// A [`PacketSink`] that sends to one fixed UDP destination — the RTP or
/// RTCP half of a SETUP's negotiated client ports.
pub struct UdpDestinationSink {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
}

impl UdpDestinationSink {
    pub fn new(socket: Arc<UdpSocket>, dest: SocketAddr) -> Self {
        UdpDestinationSink { socket, dest }
    }
}

impl PacketSink for UdpDestinationSink {
    fn send_packet(&mut self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.dest)?;
        Ok(())
    }
}

/// Writes RTP/RTCP packets interleaved onto an RTSP TCP connection, framed
/// as `$ channel_id len_hi len_lo` followed by `len` bytes of payload (RFC
/// 2326 §10.12). Shared behind a mutex because the RTSP signaling and
/// media writers both target the same socket.
pub struct InterleavedSink {
    writer: Arc<Mutex<dyn Write + Send>>,
    channel_id: u8,
}

impl InterleavedSink {
    pub fn new(writer: Arc<Mutex<dyn Write + Send>>, channel_id: u8) -> Self {
        InterleavedSink { writer, channel_id }
    }
}

impl PacketSink for InterleavedSink {
    fn send_packet(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u16::MAX as usize {
            return Err(crate::RtspError::TransportSend(format!(
                "interleaved payload too large: {} bytes",
                bytes.len()
            )));
        }
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.push(0x24);
        framed.push(self.channel_id);
        framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        framed.extend_from_slice(bytes);
        let mut writer = self.writer.lock();
        writer.write_all(&framed)?;
        Ok(())
    }
}

/// Parses one interleaved frame header from the start of `buf`, returning
/// `(channel_id, payload_len)` if `buf` starts with the `$` marker.
pub fn parse_interleaved_header(buf: &[u8; 4]) -> Option<(u8, u16)> {
    if buf[0] != 0x24 {
        return None;
    }
    Some((buf[1], u16::from_be_bytes([buf[2], buf[3]])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn interleaved_sink_frames_with_dollar_marker() {
        let cursor = Arc::new(Mutex::new(Cursor::new(Vec::<u8>::new())));
        {
            let mut sink = InterleavedSink::new(cursor.clone() as Arc<Mutex<dyn Write + Send>>, 2);
            sink.send_packet(&[9, 9]).unwrap();
        }
        let written = cursor.lock().get_ref().clone();
        assert_eq!(written, vec![0x24, 2, 0, 2, 9, 9]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let cursor = Arc::new(Mutex::new(Cursor::new(Vec::<u8>::new())));
        let mut sink = InterleavedSink::new(cursor as Arc<Mutex<dyn Write + Send>>, 0);
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(sink.send_packet(&big).is_err());
    }

    #[test]
    fn parses_interleaved_header() {
        let header = [0x24, 1, 0x01, 0x2C];
        let (channel, len) = parse_interleaved_header(&header).unwrap();
        assert_eq!(channel, 1);
        assert_eq!(len, 300);
    }

    #[test]
    fn rejects_non_dollar_header() {
        let header = [b'R', b'T', b'S', b'P'];
        assert!(parse_interleaved_header(&header).is_none());
    }
}
