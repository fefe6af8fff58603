use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::auth::AuthDb;
use crate::error::{Result, RtspError};
use crate::media::h264::H264FileSubsession;
use crate::mount::{DEFAULT_MOUNT_PATH, Mount, MountRegistry};
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::session_media::{OnDemandSubsession, PortAllocator, ServerMediaSubsession};
use crate::transport::UdpTransport;
use crate::transport::{http_tunnel, tcp};

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// Public RTSP port for future URL-based headers (e.g. RTP-Info).
    pub public_port: Option<u16>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Seconds of RTSP/RTCP silence after which an idle [`crate::session::Session`]
    /// is destroyed by the reclamation reaper (§4.11 Liveness).
    pub reclamation_seconds: u64,
    /// When set, DESCRIBE and SETUP require a matching Digest `Authorization`
    /// header (§4.11 Authentication); `None` leaves the server open.
    pub auth_db: Option<AuthDb>,
    /// Interval between RTCP sender reports for each playing session (RFC 3550
    /// §6.2 recommends a minimum of 5s for small sessions like this server's).
    pub rtcp_report_interval_secs: u64,
    /// When set, also listen on this port for RTSP-over-HTTP tunneled
    /// connections (paired GET/POST, §4.11) alongside the main RTSP port.
    pub http_tunnel_port: Option<u16>,
    /// Whether SETUP may negotiate `RTP/AVP/TCP` interleaved delivery
    /// (§4.9). When `false`, interleaved SETUP is rejected with `461`
    /// regardless of whether the connection has a writer handle.
    pub allow_rtp_over_tcp: bool,
    /// When set, every client SETUP on a mount after the first attaches to
    /// that mount's already-running pipeline (and its server ports) instead
    /// of building an independent pipeline per client.
    pub reuse_first_source: bool,
    /// First port number tried by the server-side RTP/RTCP port allocator
    /// (§4.10).
    pub initial_port_num: u16,
    /// When set, RTP and RTCP for a stream share a single server port
    /// instead of the usual even/odd pair.
    pub multiplex_rtcp_with_rtp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            public_port: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            reclamation_seconds: crate::session::DEFAULT_RECLAMATION_SECS,
            auth_db: None,
            rtcp_report_interval_secs: 5,
            http_tunnel_port: None,
            allow_rtp_over_tcp: true,
            reuse_first_source: false,
            initial_port_num: 6970,
            multiplex_rtcp_with_rtp: false,
        }
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session manager, the [`MountRegistry`] (C11 Medium registry,
/// one entry per `ServerMediaSession`), the on-demand pipeline's shared
/// [`Scheduler`] and [`PortAllocator`], and the transport layer. Delegates
/// TCP connection handling to [`transport::tcp`] and RTP delivery to
/// [`transport::UdpTransport`].
pub struct Server {
    session_manager: SessionManager,
    mounts: MountRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    udp: Option<UdpTransport>,
    config: Arc<ServerConfig>,
    scheduler: Scheduler,
    port_allocator: Arc<PortAllocator>,
}

impl Server {
    /// Create a server with a single default H.264 mount at
    /// [`DEFAULT_MOUNT_PATH`], backed by a minimal embedded Annex B sample
    /// (one SPS/PPS/IDR) so the server is immediately
    /// DESCRIBE/SETUP/PLAY-able without the caller supplying a media file.
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration, using the
    /// same embedded default mount as [`Self::new`].
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        let path = write_embedded_sample();
        let subsession = Box::new(
            H264FileSubsession::new(path.to_string_lossy().to_string())
                .expect("embedded default stream is a valid Annex B file"),
        );
        Self::with_subsession(bind_addr, subsession, config)
    }

    /// Create a server whose default mount is backed by `subsession` (an
    /// [`H264FileSubsession`](crate::media::h264::H264FileSubsession),
    /// [`H265FileSubsession`](crate::media::h265::H265FileSubsession), or any
    /// custom [`ServerMediaSubsession`]).
    pub fn with_subsession(bind_addr: &str, subsession: Box<dyn ServerMediaSubsession>, config: ServerConfig) -> Self {
        let scheduler = Scheduler::new();
        let port_allocator = Arc::new(PortAllocator::new(config.initial_port_num));
        let mounts = MountRegistry::new();

        let on_demand = Arc::new(OnDemandSubsession::new(
            subsession,
            scheduler.clone(),
            port_allocator.clone(),
            config.reuse_first_source,
            config.multiplex_rtcp_with_rtp,
        ));
        mounts.add(DEFAULT_MOUNT_PATH, on_demand);
        mounts.set_default(DEFAULT_MOUNT_PATH);

        Self {
            session_manager: SessionManager::new(),
            mounts,
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            udp: None,
            config: Arc::new(config),
            scheduler,
            port_allocator,
        }
    }

    /// Register an additional named stream alongside the default mount.
    ///
    /// Mirrors `ServerMediaSession` registration (§3, §4.12
    /// `addServerMediaSession`): the path becomes the Medium's name in the
    /// registry and the URL suffix clients DESCRIBE/SETUP against. Built on
    /// this server's shared scheduler and port allocator, so the new mount's
    /// pipeline obeys the same `reuse_first_source`/`multiplex_rtcp_with_rtp`
    /// configuration as the default mount.
    pub fn add_mount(&self, path: &str, subsession: Box<dyn ServerMediaSubsession>) -> Arc<Mount> {
        let on_demand = Arc::new(OnDemandSubsession::new(
            subsession,
            self.scheduler.clone(),
            self.port_allocator.clone(),
            self.config.reuse_first_source,
            self.config.multiplex_rtcp_with_rtp,
        ));
        self.mounts.add(path, on_demand)
    }

    /// Close (deregister) a named stream, per the Medium registry's "closing
    /// a name removes exactly one Medium" invariant.
    pub fn remove_mount(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.remove(path)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let udp = UdpTransport::bind()?;
        let udp_socket = udp.socket();
        self.udp = Some(udp);

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let config = self.config.clone();
        let tcp_udp_socket = udp_socket.clone();

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, session_manager, mounts, config, tcp_udp_socket, running);
        });

        if let Some(http_port) = self.config.http_tunnel_port {
            let http_addr = format!(
                "{}:{}",
                self.bind_addr.rsplit_once(':').map(|(host, _)| host).unwrap_or("0.0.0.0"),
                http_port
            );
            let http_listener = TcpListener::bind(&http_addr)?;
            http_listener.set_nonblocking(true)?;

            let running = self.running.clone();
            let session_manager = self.session_manager.clone();
            let mounts = self.mounts.clone();
            let config = self.config.clone();
            let http_udp_socket = udp_socket.clone();

            tracing::info!(addr = %http_addr, "RTSP-over-HTTP tunnel listening");

            thread::spawn(move || {
                http_tunnel::accept_loop(http_listener, session_manager, mounts, config, http_udp_socket, running);
            });
        }

        self.spawn_reclamation_reaper();
        self.spawn_rtcp_sender();

        Ok(())
    }

    /// Background liveness reaper (§4.11, §5): once a second, destroys any
    /// [`crate::session::Session`] idle for `reclamation_seconds` and drops
    /// its mount subscriptions. Runs until [`Self::stop`] clears `running`.
    fn spawn_reclamation_reaper(&self) {
        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let reclamation_secs = self.config.reclamation_seconds;

        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                for session in session_manager.reap_stale_sessions(reclamation_secs) {
                    mounts.unsubscribe_all(&session.id);
                }
            }
        });
    }

    /// Periodic RTCP sender-report loop (RFC 3550 §6.4.1, §5). Each tick,
    /// sends one SR to every session currently playing, carrying that
    /// session's stream's running packet/octet counters. Per-session rather
    /// than per-mount, since each client's stream has its own SSRC unless
    /// `reuse_first_source` is set. Runs until [`Self::stop`] clears
    /// `running`.
    fn spawn_rtcp_sender(&self) {
        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let udp = match self.udp.clone() {
            Some(udp) => udp,
            None => return,
        };
        let interval = Duration::from_secs(self.config.rtcp_report_interval_secs.max(1));

        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);

                for path in mounts.mount_paths() {
                    let Some(mount) = mounts.get(&path) else {
                        continue;
                    };

                    for session_id in mount.subscribed_session_ids() {
                        let Some(session) = session_manager.get_session(&session_id) else {
                            continue;
                        };
                        if !session.is_playing() {
                            continue;
                        }
                        let Some(transport) = session.get_transport() else {
                            continue;
                        };
                        let Some((ssrc, packet_count, octet_count, rtp_timestamp)) =
                            mount.transmission_stats(&session_id)
                        else {
                            continue;
                        };
                        if packet_count == 0 {
                            continue;
                        }

                        let now = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs_f64();
                        let sr = crate::rtcp::SenderReport {
                            ssrc,
                            ntp_timestamp: crate::rtcp::NtpTimestamp::from_unix_secs(now),
                            rtp_timestamp,
                            packet_count: packet_count as u32,
                            octet_count: octet_count as u32,
                        };
                        let encoded = sr.encode();

                        if let Err(e) = udp.send_rtcp_to_session(&transport, &encoded) {
                            tracing::warn!(session_id, error = %e, "failed to send RTCP SR");
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn send_rtp_packet(&self, session_id: &str, payload: &[u8]) -> Result<usize> {
        let udp = self.udp.as_ref().ok_or(RtspError::NotStarted)?;
        udp.send_to_session(&self.session_manager, session_id, payload)
    }

    pub fn broadcast_rtp_packet(&self, payload: &[u8]) -> Result<usize> {
        let udp = self.udp.as_ref().ok_or(RtspError::NotStarted)?;
        udp.broadcast(&self.session_manager, payload)
    }

    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.get_transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri.clone(),
                    client_addr: transport.client_addr.to_string(),
                    client_rtp_port: transport.client_rtp_port,
                })
            })
            .collect()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Returns the server's mount registry (C11 Medium registry).
    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// Builds a minimal synthetic H.264 Annex B sample (one SPS, one PPS, one
/// IDR slice — no meaningful picture data) under the system temp directory,
/// used as [`Server::new`]'s zero-argument default mount.
fn write_embedded_sample() -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("rtsp_rs_default_stream_{}.h264", std::process::id()));
    let data: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, // SPS
        0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80, // PPS
        0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, // IDR slice
    ];
    std::fs::write(&path, data).expect("writing embedded default stream to temp dir");
    path
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub client_addr: String,
    pub client_rtp_port: u16,
}
