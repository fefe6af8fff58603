use std::sync::Arc;

use parking_lot::RwLock;

use crate::registry::MediumRegistry;
use crate::session_media::OnDemandSubsession;

pub const DEFAULT_MOUNT_PATH: &str = "/stream";

/// A named stream endpoint (e.g. `/stream`, `/camera1`).
///
/// Owns the on-demand subsession (C12/C13) for its one track and tracks
/// which sessions are subscribed. In the future, a mount may contain
/// multiple tracks (video + audio).
pub struct Mount {
    path: String,
    subsession: Arc<OnDemandSubsession>,
    session_ids: RwLock<Vec<String>>,
}

impl Mount {
    pub fn new(path: &str, subsession: Arc<OnDemandSubsession>) -> Self {
        Self {
            path: path.to_string(),
            subsession,
            session_ids: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The on-demand subsession backing this mount's single track.
    pub fn subsession(&self) -> &Arc<OnDemandSubsession> {
        &self.subsession
    }

    /// RTP payload type from the underlying subsession.
    pub fn payload_type(&self) -> u8 {
        self.subsession.payload_type()
    }

    /// SDP media-level attributes (delegated to the subsession).
    pub fn sdp_attributes(&self) -> Vec<String> {
        self.subsession.sdp_attributes()
    }

    /// Codec clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.subsession.clock_rate()
    }

    /// Subscribe a session to this mount (called during SETUP).
    pub fn subscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_string());
            tracing::debug!(mount = %self.path, session_id, "session subscribed");
        }
    }

    /// Unsubscribe a session from this mount (called during TEARDOWN or
    /// disconnect). Also tears down the session's stream, releasing its
    /// server ports once the last attached client has gone (C13).
    pub fn unsubscribe(&self, session_id: &str) {
        let mut ids = self.session_ids.write();
        if let Some(pos) = ids.iter().position(|id| id == session_id) {
            ids.swap_remove(pos);
            tracing::debug!(mount = %self.path, session_id, "session unsubscribed");
        }
        drop(ids);
        self.subsession.delete_stream(session_id);
    }

    /// Returns the list of subscribed session IDs.
    pub fn subscribed_session_ids(&self) -> Vec<String> {
        self.session_ids.read().clone()
    }

    /// Live transmission stats for `session_id`'s stream
    /// (`ssrc, packet_count, octet_count, rtp_timestamp`), for the next
    /// RTCP SR. `None` if the session has no stream (e.g. hasn't SETUP yet).
    pub fn transmission_stats(&self, session_id: &str) -> Option<(u32, u64, u64, u32)> {
        self.subsession.transmission_stats(session_id)
    }
}

/// Registry of named mount points, keyed by path.
///
/// Built on the generic [`MediumRegistry`] (C11): a mount is this server's
/// concrete "Medium" (§3 `ServerMediaSession`), and this type only adds the
/// RTSP-specific lookup behavior — URI-to-path resolution and a default
/// fallback mount — on top of plain name -> object storage.
///
/// Supports a "default" mount that acts as a fallback when the requested
/// URI path doesn't match any registered mount. This ensures that clients
/// requesting any path (e.g. `/test`, `/live`) will be served by the
/// default stream when only one mount is configured.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: MediumRegistry<Mount>,
    /// Path of the default (fallback) mount, used when no exact match is found.
    default_path: Arc<RwLock<Option<String>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mounts: MediumRegistry::new(),
            default_path: Arc::new(RwLock::new(None)),
        }
    }

    /// Register a new mount point. Replaces any existing mount at the same path.
    pub fn add(&self, path: &str, subsession: Arc<OnDemandSubsession>) -> Arc<Mount> {
        let mount = self.mounts.insert(path, Mount::new(path, subsession));
        tracing::info!(path, "mount registered");
        mount
    }

    /// Close (deregister) a mount by path, per the Medium invariant: closing
    /// a name removes exactly one entry. Returns the removed mount, if any.
    pub fn remove(&self, path: &str) -> Option<Arc<Mount>> {
        let removed = self.mounts.close(path);
        if removed.is_some() {
            tracing::info!(path, "mount closed");
        }
        removed
    }

    /// Designate a mount path as the default fallback.
    ///
    /// When [`resolve_from_uri`](Self::resolve_from_uri) cannot find an
    /// exact match, it falls back to this mount. Typically set to
    /// [`DEFAULT_MOUNT_PATH`] by the server constructor.
    pub fn set_default(&self, path: &str) {
        *self.default_path.write() = Some(path.to_string());
    }

    /// Look up a mount by exact path.
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.get(path)
    }

    /// Resolve a mount from an RTSP URI.
    ///
    /// Tries an exact path match first. If no mount is found, falls back
    /// to the default mount (if one has been set via [`set_default`](Self::set_default)).
    ///
    /// This fallback ensures clients requesting any URI (e.g.
    /// `rtsp://host/test`) are served when only a single default stream
    /// is configured — matching the behavior of most RTSP server
    /// implementations.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Mount>> {
        let path = extract_mount_path(uri);
        self.get(path).or_else(|| {
            let default = self.default_path.read();
            default.as_ref().and_then(|p| self.get(p))
        })
    }

    /// Unsubscribe a session from all mounts (used during disconnect cleanup).
    pub fn unsubscribe_all(&self, session_id: &str) {
        for name in self.mounts.names() {
            if let Some(mount) = self.mounts.get(&name) {
                mount.unsubscribe(session_id);
            }
        }
    }

    /// All registered mount paths, for the periodic RTCP SR scan.
    pub fn mount_paths(&self) -> Vec<String> {
        self.mounts.names()
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/stream/track1` → `/stream`
/// `rtsp://host:8554/stream`        → `/stream`
/// `rtsp://host:8554/`              → `/`
/// `rtsp://host:8554`               → `/stream` (default)
/// `*`                               → `/stream` (default)
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => DEFAULT_MOUNT_PATH,
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        DEFAULT_MOUNT_PATH
    };

    // Strip track suffix: /stream/track1 → /stream
    if let Some(pos) = path.rfind("/track") {
        &path[..pos]
    } else {
        path
    }
}
