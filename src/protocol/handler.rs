use crate::auth::DigestAuthorization;
use crate::media::multi_framed_rtp_sink::PacketSink;
use crate::mount::MountRegistry;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::ServerConfig;
use crate::session::transport::{DeliveryMode, TransportHeader};
use crate::session::{SessionManager, SessionState, Transport};
use crate::transport::rtp_interface::{InterleavedSink, UdpDestinationSink};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    mounts: MountRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
    /// Nonce from the most recent `WWW-Authenticate` challenge issued on
    /// this connection, if [`ServerConfig::auth_db`] is configured.
    auth_nonce: Option<String>,
    /// Shared handle to this connection's socket, used to build an
    /// [`DeliveryMode::Interleaved`] transport when SETUP negotiates
    /// `RTP/AVP/TCP` (§4.9) — RTP/RTCP frames for that session are then
    /// written to the same socket the RTSP responses go out on.
    writer: Option<Arc<Mutex<TcpStream>>>,
    /// The server's shared outbound UDP socket, used to build a
    /// [`UdpDestinationSink`] for each session that negotiates UDP delivery.
    udp_socket: Arc<UdpSocket>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        udp_socket: Arc<UdpSocket>,
    ) -> Self {
        MethodHandler {
            session_manager,
            mounts,
            client_addr,
            config,
            session_ids: Vec::new(),
            auth_nonce: None,
            writer: None,
            udp_socket,
        }
    }

    /// Attaches the shared connection socket used for interleaved transport.
    /// Set once by [`crate::transport::tcp::Connection`] right after
    /// construction; `None` leaves SETUP unable to negotiate
    /// `RTP/AVP/TCP` (it falls back to rejecting with `461`).
    pub fn set_interleaved_writer(&mut self, writer: Arc<Mutex<TcpStream>>) {
        self.writer = Some(writer);
    }

    /// Enforce Digest authentication (§4.11) when [`ServerConfig::auth_db`] is
    /// set. Returns `Some(401)` when the request must be challenged or its
    /// credentials don't check out; `Some(401)` always carries a fresh
    /// nonce for the client's retry. Returns `None` when no auth is
    /// configured or the request's credentials are valid.
    fn check_auth(&mut self, method: &str, cseq: &str, request: &RtspRequest) -> Option<RtspResponse> {
        let db = self.config.auth_db.as_ref()?;

        let challenge = |nonce: &str| {
            RtspResponse::new(401, "Unauthorized")
                .add_header("CSeq", cseq)
                .add_header("WWW-Authenticate", &crate::auth::challenge_header(&db.realm, nonce))
        };

        let Some(header) = request.get_header("Authorization") else {
            let nonce = crate::auth::generate_nonce();
            tracing::debug!(%cseq, "no Authorization header, issuing challenge");
            self.auth_nonce = Some(nonce.clone());
            return Some(challenge(&nonce));
        };

        let valid = DigestAuthorization::parse(header)
            .zip(self.auth_nonce.as_deref())
            .is_some_and(|(parsed, nonce)| db.validate(&parsed, method, nonce));

        if valid {
            return None;
        }

        let nonce = crate::auth::generate_nonce();
        tracing::warn!(%cseq, "Authorization header rejected, issuing new challenge");
        self.auth_nonce = Some(nonce.clone());
        Some(challenge(&nonce))
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => {
                if let Some(challenge) = self.check_auth("DESCRIBE", cseq, request) {
                    return challenge;
                }
                self.handle_describe(cseq, &request.uri)
            }
            "SETUP" => {
                if let Some(challenge) = self.check_auth("SETUP", cseq, request) {
                    return challenge;
                }
                self.handle_setup(cseq, request)
            }
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            "REGISTER" => self.handle_register(cseq, request),
            "DEREGISTER" => self.handle_deregister(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, REGISTER, DEREGISTER",
        )
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let mount = match self.mounts.resolve_from_uri(uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri, "DESCRIBE for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = sdp::generate_sdp(
            &mount,
            &host,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
            &self.config.sdp_session_name,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mount = match self.mounts.resolve_from_uri(&request.uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let transport_header = match request.get_header("Transport") {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, "SETUP missing Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let client_transport = match TransportHeader::parse(transport_header) {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let wants_interleaved = matches!(client_transport, TransportHeader::Interleaved { .. });
        if wants_interleaved && (self.writer.is_none() || !self.config.allow_rtp_over_tcp) {
            tracing::warn!(%cseq, "interleaved SETUP unavailable (no connection writer, or disabled by config)");
            return RtspResponse::new(461, "Unsupported Transport").add_header("CSeq", cseq);
        }

        let session = self.session_manager.create_session(&request.uri);
        let session_id = session.id.clone();

        let destination_sink: Box<dyn PacketSink>;
        let mode: DeliveryMode;
        let client_rtp_port: u16;
        let client_rtcp_port: u16;

        match client_transport {
            TransportHeader::Udp { client_rtp_port: rtp, client_rtcp_port: rtcp } => {
                client_rtp_port = rtp;
                client_rtcp_port = rtcp;
                let dest = SocketAddr::new(self.client_addr.ip(), rtp);
                destination_sink = Box::new(UdpDestinationSink::new(self.udp_socket.clone(), dest));
                mode = DeliveryMode::Udp;
            }
            TransportHeader::Interleaved { rtp_channel, rtcp_channel } => {
                client_rtp_port = 0;
                client_rtcp_port = 0;
                let writer = self.writer.clone().expect("checked above");
                let sink_writer = writer.clone() as Arc<Mutex<dyn Write + Send>>;
                destination_sink = Box::new(InterleavedSink::new(sink_writer, rtp_channel));
                mode = DeliveryMode::Interleaved { rtp_channel, rtcp_channel, writer };
            }
        }

        let params = match mount.subsession().get_stream_parameters(&session_id, destination_sink) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to build stream for SETUP");
                self.session_manager.remove_session(&session_id);
                return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
            }
        };

        let transport_response = match &mode {
            DeliveryMode::Udp => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_rtp_port, client_rtcp_port, params.server_rtp_port, params.server_rtcp_port
            ),
            DeliveryMode::Interleaved { rtp_channel, rtcp_channel, .. } => {
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp_channel, rtcp_channel)
            }
        };

        let client_rtp_addr = SocketAddr::new(self.client_addr.ip(), client_rtp_port);
        let is_udp = matches!(mode, DeliveryMode::Udp);

        session.set_transport(Transport {
            client_rtp_port,
            client_rtcp_port,
            server_rtp_port: params.server_rtp_port,
            server_rtcp_port: params.server_rtcp_port,
            client_addr: client_rtp_addr,
            mode,
        });

        if is_udp {
            if let Err(e) = crate::transport::udp::spawn_rtcp_receiver(
                params.server_rtcp_port,
                self.session_manager.clone(),
                session_id.clone(),
            ) {
                tracing::warn!(session_id, server_rtcp_port = params.server_rtcp_port, error = %e, "failed to bind UDP RTCP receiver");
            }
        }

        mount.subscribe(&session_id);
        self.session_ids.push(session_id.clone());

        tracing::info!(
            session_id,
            mount = %mount.path(),
            uri = %request.uri,
            client_rtp = %client_rtp_addr,
            server_rtp_port = params.server_rtp_port,
            transport = %transport_response,
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PLAY missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        match self.session_manager.get_session(&session_id) {
            Some(session) => {
                session.touch();

                if let Some(mount) = self.mounts.resolve_from_uri(&session.uri) {
                    if let Err(e) = mount.subsession().start_stream(&session_id) {
                        tracing::error!(session_id, error = %e, "failed to start stream for PLAY");
                        return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                    }
                }

                session.set_state(SessionState::Playing);
                tracing::info!(session_id, "session started playing");

                let mut resp = RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
                    .add_header("Range", "npt=0.000-");

                if let Some(mount) = self.mounts.resolve_from_uri(&session.uri)
                    && let Some((seq, rtp_time)) = mount.subsession().rtp_info(&session_id)
                {
                    let rtp_info = format!("url={};seq={};rtptime={}", session.uri, seq, rtp_time);
                    resp = resp.add_header("RTP-Info", &rtp_info);
                }

                resp
            }
            None => {
                tracing::warn!(session_id, "PLAY for unknown session");
                RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PAUSE missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        match self.session_manager.get_session(&session_id) {
            Some(session) => {
                session.touch();

                if let Some(mount) = self.mounts.resolve_from_uri(&session.uri) {
                    if let Err(e) = mount.subsession().pause_stream(&session_id) {
                        tracing::warn!(session_id, error = %e, "failed to pause stream");
                    }
                }

                session.set_state(SessionState::Paused);
                tracing::info!(session_id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            None => {
                tracing::warn!(session_id, "PAUSE for unknown session");
                RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "TEARDOWN missing Session header");
                return RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq);
            }
        };

        match self.session_manager.remove_session(&session_id) {
            Some(_) => {
                self.mounts.unsubscribe_all(&session_id);
                self.session_ids.retain(|id| id != &session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 ยง10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = self.extract_session_id(request)
            && let Some(session) = self.session_manager.get_session(&id)
        {
            session.touch();
            resp = resp.add_header("Session", &id);
        }

        resp
    }

    /// REGISTER (§4.11, live555 extension): a proxy/relay asks this server
    /// to pull a stream from `request.uri` and re-serve it. Actually
    /// opening the back-connection is a deployment-specific concern (which
    /// proxy implementation, what credentials) left to the caller; this
    /// handler validates the request shape and acknowledges it so clients
    /// that rely on REGISTER/DEREGISTER for discovery (e.g. ONVIF-style
    /// camera proxies) get a well-formed response instead of `501`.
    fn handle_register(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::info!(
            %cseq,
            url = %request.uri,
            transport = ?request.get_header("Transport"),
            "REGISTER request received"
        );
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// DEREGISTER: the counterpart to [`Self::handle_register`] — a proxy
    /// withdraws a previous registration for `request.uri`.
    fn handle_deregister(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::info!(%cseq, url = %request.uri, "DEREGISTER request received");
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// Extract session ID from the Session header.
    /// Handles timeout suffix: "SESSIONID;timeout=60" -> "SESSIONID"
    fn extract_session_id(&self, request: &RtspRequest) -> Option<String> {
        request
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthDb;
    use crate::media::h264::H264FileSubsession;
    use crate::mount::{DEFAULT_MOUNT_PATH, MountRegistry};
    use crate::scheduler::Scheduler;
    use crate::session_media::{OnDemandSubsession, PortAllocator};
    use std::io::Write as _;

    fn temp_h264_file(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rtsp_rs_handler_test_{}_{}", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80, 0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00])
            .unwrap();
        path
    }

    fn handler_with_auth(auth: Option<AuthDb>) -> MethodHandler {
        let mounts = MountRegistry::new();
        let path = temp_h264_file("handler_with_auth");
        let codec = Box::new(H264FileSubsession::new(path.to_string_lossy().to_string()).unwrap());
        let on_demand = Arc::new(OnDemandSubsession::new(
            codec,
            Scheduler::new(),
            Arc::new(PortAllocator::new(6970)),
            false,
            false,
        ));
        mounts.add(DEFAULT_MOUNT_PATH, on_demand);
        mounts.set_default(DEFAULT_MOUNT_PATH);

        let mut config = ServerConfig::default();
        config.auth_db = auth;

        let udp_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());

        MethodHandler::new(
            SessionManager::new(),
            "127.0.0.1:1234".parse().unwrap(),
            mounts,
            Arc::new(config),
            udp_socket,
        )
    }

    fn describe_request() -> RtspRequest {
        RtspRequest::parse("DESCRIBE rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap()
    }

    #[test]
    fn no_auth_db_never_challenges() {
        let mut handler = handler_with_auth(None);
        let resp = handler.check_auth("DESCRIBE", "1", &describe_request());
        assert!(resp.is_none());
    }

    #[test]
    fn missing_authorization_header_challenges() {
        let mut db = AuthDb::new("streaming");
        db.add_user("alice", "secret");
        let mut handler = handler_with_auth(Some(db));

        let resp = handler.check_auth("DESCRIBE", "1", &describe_request()).unwrap();
        assert_eq!(resp.status_code, 401);
        assert!(handler.auth_nonce.is_some());
    }

    #[test]
    fn valid_credentials_pass_through() {
        let mut db = AuthDb::new("streaming");
        db.add_user("alice", "secret");
        let mut handler = handler_with_auth(Some(db));

        let challenge = handler.check_auth("DESCRIBE", "1", &describe_request()).unwrap();
        let www_auth = challenge
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("WWW-Authenticate"))
            .map(|(_, v)| v.clone())
            .unwrap();
        let nonce = www_auth
            .split("nonce=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap();

        let ha1 = format!("{:x}", md5::compute("alice:streaming:secret"));
        let ha2 = format!("{:x}", md5::compute("DESCRIBE:rtsp://127.0.0.1/stream"));
        let response = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)));

        let auth_header = format!(
            "Digest username=\"alice\", realm=\"streaming\", nonce=\"{}\", uri=\"rtsp://127.0.0.1/stream\", response=\"{}\"",
            nonce, response
        );
        let raw = format!(
            "DESCRIBE rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 2\r\nAuthorization: {}\r\n\r\n",
            auth_header
        );
        let request = RtspRequest::parse(&raw).unwrap();

        let resp = handler.check_auth("DESCRIBE", "2", &request);
        assert!(resp.is_none());
    }

    fn setup_request(transport: &str) -> RtspRequest {
        let raw = format!(
            "SETUP rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 1\r\nTransport: {}\r\n\r\n",
            transport
        );
        RtspRequest::parse(&raw).unwrap()
    }

    #[test]
    fn setup_udp_transport_succeeds() {
        let mut handler = handler_with_auth(None);
        let resp = handler.handle_setup("1", &setup_request("RTP/AVP;unicast;client_port=8000-8001"));
        assert_eq!(resp.status_code, 200);
        let transport = resp
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Transport"))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(transport.contains("client_port=8000-8001"));
        assert!(transport.contains("server_port="));
    }

    #[test]
    fn setup_interleaved_without_writer_rejects_with_461() {
        let mut handler = handler_with_auth(None);
        let resp = handler.handle_setup("1", &setup_request("RTP/AVP/TCP;unicast;interleaved=0-1"));
        assert_eq!(resp.status_code, 461);
    }

    #[test]
    fn setup_interleaved_with_writer_succeeds() {
        let mut handler = handler_with_auth(None);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || listener.accept());
        let stream = TcpStream::connect(addr).expect("loopback connect for test");
        accept_thread.join().unwrap().unwrap();
        handler.set_interleaved_writer(Arc::new(Mutex::new(stream)));

        let resp = handler.handle_setup("1", &setup_request("RTP/AVP/TCP;unicast;interleaved=0-1"));
        assert_eq!(resp.status_code, 200);
        let transport = resp
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Transport"))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(transport, "RTP/AVP/TCP;unicast;interleaved=0-1");
    }
}
