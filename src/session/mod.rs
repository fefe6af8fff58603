//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN (or timeout). It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state: Ready -> Playing <-> Paused.
//! - Transport parameters (client/server UDP ports) negotiated during SETUP.
//! - A timeout (default 60s, per RFC 2326 §12.37) — the client must send
//!   a request (e.g. GET_PARAMETER) before the timeout expires.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP         -> Ready
//! PLAY          -> Playing
//! PAUSE         -> Paused   (from Playing)
//! PLAY          -> Playing  (from Paused)
//! TEARDOWN      -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! ```

pub mod transport;

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use transport::Transport;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Default liveness reclamation window (§4.11): a session with no RTSP
/// command and no incoming RTCP RR for this long is destroyed by the
/// reaper, independent of the `timeout=` value advertised to the client.
pub const DEFAULT_RECLAMATION_SECS: u64 = 65;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Session created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered (RTP packets sent to client).
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Created during SETUP, destroyed by TEARDOWN or TCP disconnect.
/// Interior mutability via `RwLock` allows shared references across threads.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier: a random 32-bit id, rendered as an
    /// 8-character hex string (RFC 2326 §3).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    /// Transport parameters negotiated during SETUP (RFC 2326 §12.39).
    pub transport: RwLock<Option<Transport>>,
    /// Current playback state.
    pub state: RwLock<SessionState>,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    /// Last time this session saw RTSP command activity or an incoming
    /// RTCP RR (§4.11 Liveness). Read/reset by the reclamation reaper.
    last_activity: RwLock<Instant>,
}

impl Session {
    /// Create a new session with the given id (already checked unique by
    /// the caller's session table).
    fn new(id: String, uri: &str) -> Self {
        Session {
            id,
            uri: uri.to_string(),
            transport: RwLock::new(None),
            state: RwLock::new(SessionState::Ready),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Reset the liveness clock. Called on every RTSP command addressed to
    /// this session and on every incoming RTCP receiver report.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Whether this session has been idle for at least `reclamation_secs`.
    pub fn is_stale(&self, reclamation_secs: u64) -> bool {
        self.last_activity.read().elapsed() >= Duration::from_secs(reclamation_secs)
    }

    /// Set the transport parameters (called during SETUP).
    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, client_addr = %transport.client_addr, "transport configured");
        *self.transport.write() = Some(transport);
    }

    /// Returns a clone of the transport parameters, if configured.
    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    /// Transition to a new playback state.
    pub fn set_state(&self, state: SessionState) {
        tracing::debug!(session_id = %self.id, old_state = ?*self.state.read(), new_state = ?state, "state transition");
        *self.state.write() = state;
    }

    /// Returns the current playback state.
    pub fn get_state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"A3F1C02D;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. Session
/// lookups happen on every RTP delivery cycle, so read performance matters.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new session for the given URI and register it.
    ///
    /// The session id is a random 32-bit value, regenerated until it is
    /// distinct from every id currently in the table (RFC 2326 §3,
    /// mirroring `RTSPServer::generateNewSessionId` guarding against
    /// collisions rather than trusting a single random draw).
    pub fn create_session(&self, uri: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = format!("{:08X}", rand::rng().random::<u32>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(Session::new(id.clone(), uri));
        sessions.insert(id.clone(), session.clone());
        let total = sessions.len();
        drop(sessions);

        tracing::debug!(session_id = %id, uri, total_sessions = total, "session created");

        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            let total = self.sessions.read().len();
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during TCP disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for id in ids {
            if sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Remove and return every session idle for at least `reclamation_secs`
    /// (§4.11 Liveness, §8 "Liveness reclamation"). Intended to be called
    /// once per tick by a background reaper; a session destroyed this way
    /// skips the explicit-TEARDOWN response entirely, matching the spec's
    /// "destroyed before the next second tick" wording.
    pub fn reap_stale_sessions(&self, reclamation_secs: u64) -> Vec<Arc<Session>> {
        let stale_ids: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.is_stale(reclamation_secs))
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(stale_ids.len());
        let mut sessions = self.sessions.write();
        for id in &stale_ids {
            if let Some(session) = sessions.remove(id) {
                reaped.push(session);
            }
        }
        if !reaped.is_empty() {
            tracing::info!(
                count = reaped.len(),
                remaining = sessions.len(),
                "reclaimed idle sessions"
            );
        }
        reaped
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
