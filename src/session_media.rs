//! On-demand media session orchestration (C12 `ServerMediaSubsession`, C13
//! `StreamState`), grounded in `OnDemandServerMediaSubsession.cpp` and
//! `ServerMediaSession.cpp`'s `StreamState` nested helper.
//!
//! A [`ServerMediaSubsession`] is a per-mount factory: given a scheduler, it
//! builds a fresh source+sink pipeline (C4-C9) for one client. An
//! [`OnDemandSubsession`] wraps that factory and owns the resulting
//! [`StreamState`]s, reference-counting them across SETUP/PLAY/PAUSE/TEARDOWN
//! exactly as `getStreamParameters`/`startStream`/`pauseStream`/`deleteStream`
//! do in the original.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::framed_source::FramedSource;
use crate::media::multi_framed_rtp_sink::{MultiFramedRtpSink, PacketSink};
use crate::media::rtp_sink::RtpSinkCore;
use crate::scheduler::Scheduler;

/// RTP payload size budget handed to every subsession's sink (1500-byte
/// Ethernet MTU minus IP/UDP/RTP headers, rounded down).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Per-mount factory for a codec-specific on-demand pipeline (C12).
///
/// Mirrors `ServerMediaSubsession`'s two factory methods; everything else
/// (reference counting, destination fan-out, start/pause/delete) lives in
/// [`OnDemandSubsession`], which is codec-agnostic.
pub trait ServerMediaSubsession: Send + Sync {
    /// RTSP control URL suffix for this track (e.g. `"track1"`).
    fn track_id(&self) -> &str;
    fn payload_type(&self) -> u8;
    fn clock_rate(&self) -> u32;

    /// Extra SDP media-level attribute lines (`a=rtpmap`, `a=fmtp`,
    /// `a=control`, ...), appended after the `m=` line.
    fn sdp_attributes(&self) -> Vec<String>;

    /// Builds a fresh upstream source reading from the beginning of this
    /// subsession's media (`createNewStreamSource`).
    fn create_new_stream_source(&self, scheduler: Scheduler) -> Result<Box<dyn FramedSource>>;

    /// Wraps `source` in whatever framer/fragmenter chain this codec needs
    /// and returns the RTP sink that will drive it (`createNewRTPSink`).
    fn create_new_rtp_sink(
        &self,
        core: RtpSinkCore,
        source: Box<dyn FramedSource>,
        sink: Box<dyn PacketSink>,
        max_output_packet_size: usize,
        scheduler: Scheduler,
    ) -> MultiFramedRtpSink;
}

/// Allocates RTP/RTCP server port pairs per §4.10: the first free *even*
/// port at or after `initial_port_num`, with RTCP at `port + 1` unless
/// `multiplex_rtcp_with_rtp` is set, in which case RTP and RTCP share one
/// port. Released pairs become eligible for reuse immediately.
///
/// These ports are advertised to clients in the SETUP response's
/// `Transport: ...;server_port=` field; actual UDP delivery goes out over
/// the server's single shared ephemeral socket (see
/// `transport::udp::UdpTransport`), matching this crate's existing
/// simplification of not binding one outbound socket per stream.
pub struct PortAllocator {
    initial: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(initial_port_num: u16) -> Self {
        let initial = if initial_port_num % 2 == 0 {
            initial_port_num
        } else {
            initial_port_num.wrapping_add(1)
        };
        PortAllocator {
            initial,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Allocates one RTP/RTCP port pair, returning `(rtp_port, rtcp_port)`.
    /// When `multiplex_rtcp_with_rtp` is set, both values are equal.
    pub fn allocate(&self, multiplex_rtcp_with_rtp: bool) -> Result<(u16, u16)> {
        let mut in_use = self.in_use.lock();
        let mut port = self.initial;
        loop {
            let rtcp_port = if multiplex_rtcp_with_rtp { port } else { port.wrapping_add(1) };
            let collides = in_use.contains(&port) || (!multiplex_rtcp_with_rtp && in_use.contains(&rtcp_port));
            if !collides && port != 0 && rtcp_port != 0 {
                in_use.insert(port);
                if !multiplex_rtcp_with_rtp {
                    in_use.insert(rtcp_port);
                }
                return Ok((port, rtcp_port));
            }
            let next = port.wrapping_add(2);
            if next == self.initial {
                return Err(RtspError::PortRangeExhausted);
            }
            port = next;
        }
    }

    /// Releases a previously allocated pair so a later `allocate` can reuse
    /// it.
    pub fn release(&self, rtp_port: u16, rtcp_port: u16, multiplex_rtcp_with_rtp: bool) {
        let mut in_use = self.in_use.lock();
        in_use.remove(&rtp_port);
        if !multiplex_rtcp_with_rtp {
            in_use.remove(&rtcp_port);
        }
    }
}

/// A `PacketSink` that fans one stream of RTP packets out to every
/// subscribed client destination, keyed by session id so a client's
/// destination can be added/removed independently of the others
/// (`Destinations` in the distilled spec's data model).
#[derive(Clone)]
pub struct Fanout {
    sinks: Arc<Mutex<HashMap<String, Box<dyn PacketSink>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Fanout {
            sinks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add(&self, session_id: &str, sink: Box<dyn PacketSink>) {
        self.sinks.lock().insert(session_id.to_string(), sink);
    }

    pub fn remove(&self, session_id: &str) {
        self.sinks.lock().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for Fanout {
    fn send_packet(&mut self, bytes: &[u8]) -> Result<()> {
        for (session_id, sink) in self.sinks.lock().iter_mut() {
            if let Err(e) = sink.send_packet(bytes) {
                tracing::warn!(session_id = %session_id, error = %e, "fanout destination send failed");
            }
        }
        Ok(())
    }
}

/// Parameters returned to a client's SETUP once its destination has been
/// registered against a stream (`getStreamParameters`'s out-params).
#[derive(Debug, Clone, Copy)]
pub struct StreamParameters {
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
}

/// A running source+sink pipeline shared by every client currently attached
/// to it (C13). Reference-counted: the pipeline and its allocated ports are
/// torn down once the last client tears down (§8 "StreamState
/// reference-count law").
struct StreamState {
    sink: MultiFramedRtpSink,
    fanout: Fanout,
    server_rtp_port: u16,
    server_rtcp_port: u16,
    reference_count: Mutex<usize>,
    playing_sessions: Mutex<HashSet<String>>,
}

impl StreamState {
    fn add_destination(&self, session_id: &str, sink: Box<dyn PacketSink>) {
        self.fanout.add(session_id, sink);
        *self.reference_count.lock() += 1;
    }

    fn start(&self, session_id: &str) {
        self.playing_sessions.lock().insert(session_id.to_string());
        self.sink.start_playing();
    }

    fn pause(&self, session_id: &str) {
        let mut playing = self.playing_sessions.lock();
        playing.remove(session_id);
        if playing.is_empty() {
            self.sink.stop_playing();
        }
    }

    /// Detaches one client's destination. Returns `true` once every client
    /// has gone (reference count reached zero), at which point the caller
    /// must release this stream's allocated ports.
    fn remove_destination(&self, session_id: &str) -> bool {
        self.fanout.remove(session_id);
        self.playing_sessions.lock().remove(session_id);
        let mut rc = self.reference_count.lock();
        *rc = rc.saturating_sub(1);
        if *rc == 0 {
            self.sink.stop_playing();
            true
        } else {
            false
        }
    }

    fn reference_count(&self) -> usize {
        *self.reference_count.lock()
    }
}

/// Orchestrates one mount's on-demand pipeline lifecycle (C12 + C13),
/// implementing `getStreamParameters`/`startStream`/`pauseStream`/
/// `deleteStream` from `OnDemandServerMediaSubsession.cpp`.
///
/// When `reuse_first_source` is set (`ServerConfig::reuse_first_source`),
/// every client SETUP after the first reuses the same [`StreamState`]
/// (and so the same upstream source and server ports) instead of building
/// an independent pipeline per client.
pub struct OnDemandSubsession {
    subsession: Box<dyn ServerMediaSubsession>,
    scheduler: Scheduler,
    port_allocator: Arc<PortAllocator>,
    reuse_first_source: bool,
    multiplex_rtcp_with_rtp: bool,
    shared_stream: Mutex<Option<Arc<StreamState>>>,
    by_session: Mutex<HashMap<String, Arc<StreamState>>>,
}

impl OnDemandSubsession {
    pub fn new(
        subsession: Box<dyn ServerMediaSubsession>,
        scheduler: Scheduler,
        port_allocator: Arc<PortAllocator>,
        reuse_first_source: bool,
        multiplex_rtcp_with_rtp: bool,
    ) -> Self {
        OnDemandSubsession {
            subsession,
            scheduler,
            port_allocator,
            reuse_first_source,
            multiplex_rtcp_with_rtp,
            shared_stream: Mutex::new(None),
            by_session: Mutex::new(HashMap::new()),
        }
    }

    pub fn track_id(&self) -> &str {
        self.subsession.track_id()
    }

    pub fn payload_type(&self) -> u8 {
        self.subsession.payload_type()
    }

    pub fn clock_rate(&self) -> u32 {
        self.subsession.clock_rate()
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.subsession.sdp_attributes()
    }

    /// Whether `reuse_first_source` is in effect for this mount.
    pub fn reuse_first_source(&self) -> bool {
        self.reuse_first_source
    }

    /// Number of clients currently attached to `session_id`'s stream
    /// (itself included), or 0 if the session has no stream.
    pub fn reference_count(&self, session_id: &str) -> usize {
        self.by_session
            .lock()
            .get(session_id)
            .map(|stream| stream.reference_count())
            .unwrap_or(0)
    }

    /// SETUP: attaches `destination_sink` to this subsession's stream,
    /// building a fresh pipeline (or reusing the shared one) as needed, and
    /// returns the server port pair to advertise in the `Transport` header.
    pub fn get_stream_parameters(&self, session_id: &str, destination_sink: Box<dyn PacketSink>) -> Result<StreamParameters> {
        let stream = if self.reuse_first_source {
            let mut shared = self.shared_stream.lock();
            match shared.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let built = self.build_stream()?;
                    *shared = Some(built.clone());
                    built
                }
            }
        } else {
            self.build_stream()?
        };

        stream.add_destination(session_id, destination_sink);
        self.by_session.lock().insert(session_id.to_string(), stream.clone());

        Ok(StreamParameters {
            server_rtp_port: stream.server_rtp_port,
            server_rtcp_port: stream.server_rtcp_port,
        })
    }

    fn build_stream(&self) -> Result<Arc<StreamState>> {
        let (server_rtp_port, server_rtcp_port) = self.port_allocator.allocate(self.multiplex_rtcp_with_rtp)?;
        let source = self.subsession.create_new_stream_source(self.scheduler.clone())?;
        let core = RtpSinkCore::new(self.subsession.payload_type(), self.subsession.clock_rate());
        let fanout = Fanout::new();
        let sink = self.subsession.create_new_rtp_sink(
            core,
            source,
            Box::new(fanout.clone()),
            DEFAULT_MAX_PACKET_SIZE,
            self.scheduler.clone(),
        );
        Ok(Arc::new(StreamState {
            sink,
            fanout,
            server_rtp_port,
            server_rtcp_port,
            reference_count: Mutex::new(0),
            playing_sessions: Mutex::new(HashSet::new()),
        }))
    }

    /// PLAY: starts (or resumes) delivery for `session_id`'s stream.
    pub fn start_stream(&self, session_id: &str) -> Result<()> {
        let stream = self.lookup(session_id)?;
        stream.start(session_id);
        Ok(())
    }

    /// PAUSE: stops delivery once no attached client is still playing.
    pub fn pause_stream(&self, session_id: &str) -> Result<()> {
        let stream = self.lookup(session_id)?;
        stream.pause(session_id);
        Ok(())
    }

    /// TEARDOWN (or disconnect cleanup): detaches `session_id`'s
    /// destination and, once the stream's reference count reaches zero,
    /// releases its ports and (for `reuse_first_source`) clears the shared
    /// handle so the next SETUP rebuilds a fresh pipeline. A no-op if the
    /// session has no stream.
    pub fn delete_stream(&self, session_id: &str) {
        let Some(stream) = self.by_session.lock().remove(session_id) else {
            return;
        };

        if stream.remove_destination(session_id) {
            self.port_allocator
                .release(stream.server_rtp_port, stream.server_rtcp_port, self.multiplex_rtcp_with_rtp);

            let mut shared = self.shared_stream.lock();
            if shared.as_ref().is_some_and(|s| Arc::ptr_eq(s, &stream)) {
                *shared = None;
            }
        }
    }

    /// Current RTP sequence number and timestamp for `session_id`'s stream,
    /// used to build PLAY's `RTP-Info` header.
    pub fn rtp_info(&self, session_id: &str) -> Option<(u16, u32)> {
        let stream = self.by_session.lock().get(session_id).cloned()?;
        Some((stream.sink.current_seq_no(), stream.sink.current_timestamp()))
    }

    /// Live transmission stats for `session_id`'s stream
    /// (`ssrc, packet_count, octet_count, rtp_timestamp`), used to build
    /// RTCP sender reports.
    pub fn transmission_stats(&self, session_id: &str) -> Option<(u32, u64, u64, u32)> {
        let stream = self.by_session.lock().get(session_id).cloned()?;
        Some((
            stream.sink.ssrc(),
            stream.sink.packet_count(),
            stream.sink.octet_count(),
            stream.sink.current_timestamp(),
        ))
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<StreamState>> {
        self.by_session
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RtspError::SessionNotFound(session_id.to_string()))
    }
}
