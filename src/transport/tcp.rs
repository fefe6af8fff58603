use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::mount::MountRegistry;
use crate::protocol::MethodHandler;
use crate::protocol::RtspRequest;
use crate::rtcp::RtcpPacket;
use crate::server::ServerConfig;
use crate::session::transport::DeliveryMode;
use crate::session::SessionManager;
use crate::transport::rtp_interface::parse_interleaved_header;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    udp_socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let m = mounts.clone();
                let c = config.clone();
                let u = udp_socket.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, m, c, u, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    /// Shared with [`MethodHandler`] so interleaved RTP/RTCP frames (§4.9)
    /// and RTSP responses both serialize onto the same socket (RFC 2326
    /// §10.12 multiplexes them over one TCP connection).
    writer: Arc<Mutex<TcpStream>>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
    session_manager: SessionManager,
}

/// Result of reading one unit of input off the wire: either a complete
/// RTSP request (text, up to CRLFCRLF) or one interleaved `$`-framed
/// binary block destined for a channel id (RFC 2326 §10.12).
enum WireUnit {
    Request(String),
    Interleaved { channel_id: u8, payload: Vec<u8> },
    Eof,
    Error,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        udp_socket: Arc<UdpSocket>,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let writer = Arc::new(Mutex::new(stream));

        let mut handler =
            MethodHandler::new(session_manager.clone(), peer_addr, mounts.clone(), config, udp_socket);
        handler.set_interleaved_writer(writer.clone());

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
            session_manager: session_manager.clone(),
        };

        let reason = conn.run(&running);
        conn.cleanup(&session_manager, &mounts);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            match self.read_unit() {
                WireUnit::Eof => return "connection closed by client",
                WireUnit::Error => return "read error",
                WireUnit::Interleaved { channel_id, payload } => {
                    self.handle_incoming_interleaved(channel_id, &payload);
                }
                WireUnit::Request(request_text) => {
                    if request_text.trim().is_empty() {
                        continue;
                    }

                    match RtspRequest::parse(&request_text) {
                        Ok(request) => {
                            tracing::debug!(
                                peer = %self.peer_addr,
                                method = %request.method,
                                uri = %request.uri,
                                version = %request.version,
                                "request"
                            );

                            let response = self.handler.handle(&request);

                            tracing::debug!(
                                peer = %self.peer_addr,
                                status = response.status_code,
                                "response"
                            );

                            if self
                                .writer
                                .lock()
                                .write_all(response.serialize().as_bytes())
                                .is_err()
                            {
                                return "write error";
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                        }
                    }
                }
            }
        }

        "server shutting down"
    }

    /// Reads either one interleaved `$`-framed block or one complete
    /// line-delimited RTSP request (RFC 2326 §10.12 describes both
    /// sharing a single TCP byte stream; a `$` marker between requests
    /// switches the parser into binary mode for exactly one frame).
    fn read_unit(&mut self) -> WireUnit {
        let marker = match self.peek_byte() {
            Some(b) => b,
            None => return WireUnit::Eof,
        };

        if marker == 0x24 {
            let mut header = [0u8; 4];
            if self.reader.read_exact(&mut header).is_err() {
                return WireUnit::Error;
            }
            let Some((channel_id, len)) = parse_interleaved_header(&header) else {
                return WireUnit::Error;
            };
            let mut payload = vec![0u8; len as usize];
            if self.reader.read_exact(&mut payload).is_err() {
                return WireUnit::Error;
            }
            return WireUnit::Interleaved { channel_id, payload };
        }

        let mut request_text = String::new();
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return WireUnit::Eof,
                Ok(_) => {
                    request_text.push_str(&line);
                    if line == "\r\n" || line == "\n" {
                        break;
                    }
                }
                Err(_) => return WireUnit::Error,
            }
        }
        WireUnit::Request(request_text)
    }

    /// Peeks the next byte without consuming it (returns `None` at EOF).
    fn peek_byte(&mut self) -> Option<u8> {
        self.reader.fill_buf().ok().and_then(|buf| buf.first().copied())
    }

    /// An interleaved frame arrived from the client — in practice an RTCP
    /// receiver report on this session's negotiated RTCP channel (clients
    /// do not send RTP upstream to this server). Touches session liveness
    /// (§4.11) and logs decoded receiver-report stats; malformed or
    /// unrecognized channel data is dropped (ProtocolViolation, §7: fatal
    /// to this one exchange only).
    fn handle_incoming_interleaved(&self, channel_id: u8, payload: &[u8]) {
        let Some(session) = self.session_for_rtcp_channel(channel_id) else {
            tracing::trace!(channel_id, "interleaved data on unrecognized channel");
            return;
        };

        session.touch();

        match crate::rtcp::decode_compound(payload) {
            Ok(packets) => {
                for packet in packets {
                    match packet {
                        RtcpPacket::ReceiverReport { reports, .. } | RtcpPacket::SenderReport { reports, .. } => {
                            for report in &reports {
                                tracing::trace!(
                                    session_id = %session.id,
                                    ssrc = report.ssrc,
                                    fraction_lost = report.fraction_lost,
                                    jitter = report.interarrival_jitter,
                                    "interleaved RTCP report received"
                                );
                            }
                        }
                        RtcpPacket::Bye { ssrcs } => {
                            tracing::debug!(session_id = %session.id, ?ssrcs, "interleaved RTCP BYE received");
                        }
                        RtcpPacket::Other { .. } => {}
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "malformed interleaved RTCP packet");
            }
        }
    }

    /// Finds the session (owned by this connection) whose negotiated RTCP
    /// channel matches `channel_id`.
    fn session_for_rtcp_channel(&self, channel_id: u8) -> Option<Arc<crate::session::Session>> {
        self.handler.session_ids().iter().find_map(|id| {
            let session = self.session_manager.get_session(id)?;
            let transport = session.get_transport()?;
            match transport.mode {
                DeliveryMode::Interleaved { rtcp_channel, .. } if rtcp_channel == channel_id => Some(session),
                _ => None,
            }
        })
    }

    /// Clean up sessions owned by this connection and unsubscribe from mounts.
    fn cleanup(&self, session_manager: &SessionManager, mounts: &MountRegistry) {
        let orphaned = self.handler.session_ids().to_vec();
        if !orphaned.is_empty() {
            for id in &orphaned {
                mounts.unsubscribe_all(id);
            }
            let removed = session_manager.remove_sessions(&orphaned);
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
    }
}
