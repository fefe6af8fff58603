use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::media::multi_framed_rtp_sink::PacketSink;
use crate::rtcp::RtcpPacket;
use crate::session::transport::DeliveryMode;
use crate::session::SessionManager;
use crate::transport::rtp_interface::InterleavedSink;

/// How long [`spawn_rtcp_receiver`]'s blocking `recv_from` waits before
/// rechecking whether its session still exists, so the thread exits
/// promptly after TEARDOWN or reclamation instead of blocking forever.
const RTCP_RECEIVER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Binds a UDP socket on `server_rtcp_port` (the port advertised to the
/// client in SETUP's `Transport: ...;server_port=RTP-RTCP`) and spawns a
/// background thread that decodes incoming receiver reports and touches
/// the session's liveness clock (§4.11 Liveness: "no RTSP command and no
/// RTCP RR"). This is the UDP-mode counterpart of
/// `transport::tcp::Connection::handle_incoming_interleaved`.
///
/// The thread exits once `session_id` is no longer present in
/// `sessions` (removed by TEARDOWN or the reclamation reaper), so no
/// explicit shutdown signal is needed.
pub fn spawn_rtcp_receiver(server_rtcp_port: u16, sessions: SessionManager, session_id: String) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", server_rtcp_port))?;
    socket.set_read_timeout(Some(RTCP_RECEIVER_POLL_INTERVAL))?;

    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        loop {
            let Some(session) = sessions.get_session(&session_id) else {
                tracing::trace!(session_id, "rtcp receiver exiting: session gone");
                return;
            };

            match socket.recv_from(&mut buf) {
                Ok((n, _peer)) => {
                    session.touch();
                    match crate::rtcp::decode_compound(&buf[..n]) {
                        Ok(packets) => {
                            for packet in packets {
                                match packet {
                                    RtcpPacket::ReceiverReport { reports, .. }
                                    | RtcpPacket::SenderReport { reports, .. } => {
                                        for report in &reports {
                                            tracing::trace!(
                                                session_id = %session.id,
                                                ssrc = report.ssrc,
                                                fraction_lost = report.fraction_lost,
                                                jitter = report.interarrival_jitter,
                                                "UDP RTCP report received"
                                            );
                                        }
                                    }
                                    RtcpPacket::Bye { ssrcs } => {
                                        tracing::debug!(session_id = %session.id, ?ssrcs, "UDP RTCP BYE received");
                                    }
                                    RtcpPacket::Other { .. } => {}
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session.id, error = %e, "malformed UDP RTCP packet");
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "UDP RTCP receive error, stopping");
                    return;
                }
            }
        }
    });

    Ok(())
}

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) and sends RTP packets
/// to client addresses resolved by the [`Server`](crate::Server).
///
/// This layer is deliberately address-only — it does not know about
/// sessions or mounts. The caller resolves session state to socket
/// addresses before calling [`send_to`](Self::send_to).
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    /// Returns the shared outbound socket, so per-session
    /// [`crate::transport::rtp_interface::UdpDestinationSink`]s can be built
    /// around it without binding a dedicated socket per stream.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Send raw bytes to the client negotiated for one session — over UDP
    /// to `client_addr`, or interleaved on the session's RTSP TCP
    /// connection when SETUP negotiated `interleaved=` (§4.9). Fails if the
    /// session doesn't exist or hasn't completed SETUP yet.
    pub fn send_to_session(
        &self,
        sessions: &SessionManager,
        session_id: &str,
        payload: &[u8],
    ) -> Result<usize> {
        let session = sessions
            .get_session(session_id)
            .ok_or_else(|| RtspError::SessionNotFound(session_id.to_string()))?;
        let transport = session
            .get_transport()
            .ok_or_else(|| RtspError::TransportNotConfigured(session_id.to_string()))?;
        self.deliver(&transport, payload)
    }

    /// Dispatches one packet per this session's negotiated [`DeliveryMode`].
    fn deliver(&self, transport: &crate::session::Transport, payload: &[u8]) -> Result<usize> {
        match &transport.mode {
            DeliveryMode::Udp => self.send_to(payload, transport.client_addr),
            DeliveryMode::Interleaved { rtp_channel, writer, .. } => {
                let writer = writer.clone() as Arc<parking_lot::Mutex<dyn std::io::Write + Send>>;
                let mut sink = InterleavedSink::new(writer, *rtp_channel);
                sink.send_packet(payload)?;
                Ok(payload.len())
            }
        }
    }

    /// Send raw bytes to every session currently in the Playing state.
    ///
    /// Returns the total byte count sent across all recipients. A send
    /// failure to one recipient does not stop delivery to the rest; only
    /// the first error encountered is propagated.
    pub fn broadcast(&self, sessions: &SessionManager, payload: &[u8]) -> Result<usize> {
        let mut total = 0;
        for session in sessions.get_playing_sessions() {
            if let Some(transport) = session.get_transport() {
                total += self.deliver(&transport, payload)?;
            }
        }
        Ok(total)
    }

    /// Sends an RTCP packet (an SR in practice) to a session's RTCP
    /// destination: `client_rtcp_port` over UDP, or the negotiated
    /// `rtcp_channel` when interleaved (§4.11 RTCP, §4.9).
    pub fn send_rtcp_to_session(&self, transport: &crate::session::Transport, payload: &[u8]) -> Result<usize> {
        match &transport.mode {
            DeliveryMode::Udp => {
                let dest = SocketAddr::new(transport.client_addr.ip(), transport.client_rtcp_port);
                self.send_to(payload, dest)
            }
            DeliveryMode::Interleaved { rtcp_channel, writer, .. } => {
                let writer = writer.clone() as Arc<parking_lot::Mutex<dyn std::io::Write + Send>>;
                let mut sink = InterleavedSink::new(writer, *rtcp_channel);
                sink.send_packet(payload)?;
                Ok(payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = accept_thread.join().unwrap();
        (client, server)
    }

    #[test]
    fn deliver_interleaved_frames_with_dollar_marker() {
        let (client, mut server) = loopback_pair();
        let transport = crate::session::Transport {
            client_rtp_port: 0,
            client_rtcp_port: 0,
            server_rtp_port: 0,
            server_rtcp_port: 0,
            client_addr: "127.0.0.1:0".parse().unwrap(),
            mode: DeliveryMode::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1,
                writer: Arc::new(parking_lot::Mutex::new(client)),
            },
        };

        let udp = UdpTransport::bind().unwrap();
        let n = udp.deliver(&transport, &[1, 2, 3]).unwrap();
        assert_eq!(n, 3);

        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x24, 0, 0, 3, 1, 2, 3]);
    }

    fn encode_rr(sender_ssrc: u32, report_ssrc: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.push((2u8 << 6) | 1);
        body.push(201); // PT_RR
        body.extend_from_slice(&7u16.to_be_bytes());
        body.extend_from_slice(&sender_ssrc.to_be_bytes());
        body.extend_from_slice(&report_ssrc.to_be_bytes());
        body.push(0);
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body
    }

    #[test]
    fn rtcp_receiver_touches_session_on_incoming_rr_and_exits_after_removal() {
        let sessions = SessionManager::new();
        let session = sessions.create_session("rtsp://localhost/test.264");
        let session_id = session.id.clone();

        let receiver_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver_port = receiver_socket.local_addr().unwrap().port();
        drop(receiver_socket); // free the port for spawn_rtcp_receiver to rebind

        spawn_rtcp_receiver(receiver_port, sessions.clone(), session_id.clone()).unwrap();

        assert_eq!(session.get_state(), crate::session::SessionState::Ready);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rr = encode_rr(0xAAAA, 0xBBBB);
        client
            .send_to(&rr, ("127.0.0.1", receiver_port))
            .unwrap();

        // Give the background thread a moment to process the datagram.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!session.is_stale(5), "touch() should have reset liveness");

        sessions.remove_session(&session_id);
        // The receiver thread should notice within one poll interval and
        // stop without panicking; nothing to assert beyond "doesn't hang"
        // since the thread is detached.
    }
}
