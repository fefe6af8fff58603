//! Multi-framed RTP sink (C9): the producer/consumer loop that pulls
//! frames from a `FramedSource`, packs them into RTP packets via
//! [`OutPacketBuffer`], and hands the result to a [`PacketSink`] for
//! transport. Grounded in `MultiFramedRTPSink::buildAndSendPacket` /
//! `packFrame` / `sendPacketIfNecessary`.
//!
//! Deliberate simplifications versus the original (documented in
//! `DESIGN.md`): exactly one source frame (or one fragment of one, when a
//! [`crate::media::fragmenter::Fragmenter`] sits upstream) is packed per
//! RTP packet — this server never aggregates multiple small frames into a
//! single packet the way live555's default packing policy can. The RTP
//! timestamp is derived from each frame's `presentation_time` relative to
//! the sink's creation time rather than stepped by a fixed per-frame
//! increment, which copes correctly with variable frame rates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::media::framed_source::{new_frame_buffer, FrameDelivery, FramedSource};
use crate::media::out_packet_buffer::OutPacketBuffer;
use crate::media::rtp_sink::RtpSinkCore;
use crate::scheduler::Scheduler;
use crate::RtspError;

/// Destination for assembled RTP packets: a UDP groupsock or an
/// interleaved TCP channel (C10). Kept separate from this module so the
/// packing logic stays transport-agnostic.
pub trait PacketSink: Send {
    fn send_packet(&mut self, bytes: &[u8]) -> crate::Result<()>;
}

/// Drives the RTP marker bit from a fragmenter's completion flag and a
/// framer's picture-end-marker flag, exactly as
/// `H264or5VideoRTPSink::doSpecialFrameHandling` reads
/// `fOurFragmenter->lastFragmentCompletedNALUnit()` together with the
/// upstream framer's `pictureEndMarker`.
pub struct MarkerBit {
    last_fragment_completed: Arc<AtomicBool>,
    picture_end_marker: Arc<AtomicBool>,
}

impl MarkerBit {
    pub fn new(last_fragment_completed: Arc<AtomicBool>, picture_end_marker: Arc<AtomicBool>) -> Self {
        MarkerBit {
            last_fragment_completed,
            picture_end_marker,
        }
    }

    fn should_set(&self) -> bool {
        self.last_fragment_completed.load(Ordering::SeqCst) && self.picture_end_marker.swap(false, Ordering::SeqCst)
    }
}

struct Inner {
    core: RtpSinkCore,
    out: OutPacketBuffer,
    sink: Box<dyn PacketSink>,
    source: Option<Box<dyn FramedSource>>,
    marker: Option<MarkerBit>,
    on_send_error: Option<Arc<dyn Fn(RtspError) + Send + Sync>>,
    epoch: Instant,
    playing: bool,
    after_playing: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// The RTP sink proper: owns the source and packet destination for the
/// lifetime of one PLAY session, and drives itself via the [`Scheduler`]
/// rather than a dedicated thread (matching the rest of this crate's
/// cooperative-scheduling idiom).
#[derive(Clone)]
pub struct MultiFramedRtpSink {
    inner: Arc<Mutex<Inner>>,
    scheduler: Scheduler,
}

impl MultiFramedRtpSink {
    pub fn new(
        core: RtpSinkCore,
        source: Box<dyn FramedSource>,
        sink: Box<dyn PacketSink>,
        max_output_packet_size: usize,
        scheduler: Scheduler,
        marker: Option<MarkerBit>,
    ) -> Self {
        let out = OutPacketBuffer::new(max_output_packet_size, max_output_packet_size, max_output_packet_size * 2);
        MultiFramedRtpSink {
            inner: Arc::new(Mutex::new(Inner {
                core,
                out,
                sink,
                source: Some(source),
                marker,
                on_send_error: None,
                epoch: Instant::now(),
                playing: false,
                after_playing: None,
            })),
            scheduler,
        }
    }

    pub fn set_on_send_error<F>(&self, callback: F)
    where
        F: Fn(RtspError) + Send + Sync + 'static,
    {
        self.inner.lock().on_send_error = Some(Arc::new(callback));
    }

    pub fn set_after_playing<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().after_playing = Some(Arc::new(callback));
    }

    pub fn ssrc(&self) -> u32 {
        self.inner.lock().core.ssrc()
    }

    pub fn current_seq_no(&self) -> u16 {
        self.inner.lock().core.current_seq_no()
    }

    pub fn current_timestamp(&self) -> u32 {
        self.inner.lock().core.current_timestamp()
    }

    /// Cumulative RTP packet count since creation (RFC 3550 §6.4.1 SR
    /// sender-info `packet count`).
    pub fn packet_count(&self) -> u64 {
        self.inner.lock().core.packet_count()
    }

    /// Cumulative RTP payload octet count since creation (RFC 3550 §6.4.1
    /// SR sender-info `octet count`).
    pub fn octet_count(&self) -> u64 {
        self.inner.lock().core.octet_count()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    /// Starts (or resumes) pulling frames and sending packets. Idempotent:
    /// calling this while already playing is a no-op.
    pub fn start_playing(&self) {
        let mut guard = self.inner.lock();
        if guard.playing {
            return;
        }
        guard.playing = true;
        drop(guard);
        Self::pump(self.inner.clone(), self.scheduler.clone());
    }

    /// Stops pulling frames. Already-sent packets are not recalled; the
    /// session's RTCP BYE (if any) is the caller's responsibility.
    pub fn stop_playing(&self) {
        let mut guard = self.inner.lock();
        guard.playing = false;
        if let Some(src) = guard.source.as_mut() {
            src.stop_getting_frames();
        }
    }

    /// Swaps the upstream source (used when a subsession reassigns its
    /// stream source across `play` calls). Returns the previous source.
    pub fn reassign_source(&self, source: Box<dyn FramedSource>) -> Option<Box<dyn FramedSource>> {
        self.inner.lock().source.replace(source)
    }

    fn pump(inner: Arc<Mutex<Inner>>, scheduler: Scheduler) {
        let (still_playing, max_payload) = {
            let mut guard = inner.lock();
            // Each packet starts fresh — this sink never aggregates frames,
            // so the previous packet's cursor must not shrink this one's
            // budget. Reserve the 12-byte RTP header up front so the
            // reported capacity is exactly the room left for payload.
            guard.out.reset_packet_start();
            guard.out.skip_bytes(12);
            (guard.playing, guard.out.total_bytes_available())
        };
        if !still_playing {
            return;
        }

        let staging = new_frame_buffer(max_payload);
        let staging_for_after = staging.clone();
        let inner_for_after = inner.clone();
        let inner_for_close = inner.clone();
        let scheduler_for_after = scheduler.clone();
        let scheduler_for_close = scheduler.clone();

        let mut guard = inner.lock();
        let Some(source) = guard.source.as_mut() else {
            drop(guard);
            Self::finish(inner);
            return;
        };
        source.get_next_frame(
            staging,
            max_payload,
            Box::new(move |delivery: FrameDelivery| {
                Self::send_one(&inner_for_after, &staging_for_after, delivery);
                Self::pump(inner_for_after, scheduler_for_after);
            }),
            Box::new(move || {
                let _ = &scheduler_for_close;
                Self::finish(inner_for_close);
            }),
        );
    }

    fn send_one(inner: &Arc<Mutex<Inner>>, staging: &crate::media::framed_source::FrameBuffer, delivery: FrameDelivery) {
        let mut guard = inner.lock();
        let Inner {
            core,
            out,
            sink,
            marker,
            on_send_error,
            epoch,
            ..
        } = &mut *guard;

        let marker_bit = marker.as_ref().map(|m| m.should_set()).unwrap_or(true);
        let elapsed = delivery.presentation_time.saturating_duration_since(*epoch);
        let timestamp = (elapsed.as_secs_f64() * core.rtp_timestamp_frequency() as f64) as u32;
        core.preset_next_timestamp(timestamp);

        // `pump` already reset the cursor and reserved the 12-byte header.
        {
            let data = staging.lock();
            out.enqueue(&data[..delivery.frame_size]);
        }

        let header = core.write_header(marker_bit, delivery.frame_size);
        out.insert(&header, 0);

        if let Err(err) = sink.send_packet(out.packet_data()) {
            if let Some(cb) = on_send_error.as_ref() {
                cb(err);
            } else {
                warn!(error = %err, "RTP packet send failed");
            }
        }
    }

    fn finish(inner: Arc<Mutex<Inner>>) {
        let mut guard = inner.lock();
        guard.playing = false;
        let callback = guard.after_playing.clone();
        drop(guard);
        if let Some(cb) = callback {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::byte_stream_file_source::ByteStreamFileSource;
    use std::io::Write;
    use std::sync::mpsc;

    struct ChannelSink(mpsc::Sender<Vec<u8>>);
    impl PacketSink for ChannelSink {
        fn send_packet(&mut self, bytes: &[u8]) -> crate::Result<()> {
            let _ = self.0.send(bytes.to_vec());
            Ok(())
        }
    }

    fn temp_file(contents: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rtsp_rs_mfrtp_test_{:p}", contents));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn sends_one_packet_per_frame_with_rtp_header() {
        let path = temp_file(b"abcd");
        let scheduler = Scheduler::new();
        let source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();

        let (tx, rx) = mpsc::channel();
        let core = RtpSinkCore::new(96, 90_000);
        let sink = MultiFramedRtpSink::new(core, Box::new(source), Box::new(ChannelSink(tx)), 1400, scheduler.clone(), None);
        sink.start_playing();

        let packet = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(packet.len() >= 12 + 4);
        assert_eq!(packet[0] >> 6, 2);
        assert_eq!(packet[1] & 0x7F, 96);
        assert_eq!(&packet[12..], b"abcd");

        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stops_pulling_frames_when_stopped() {
        let path = temp_file(&vec![0u8; 16]);
        let scheduler = Scheduler::new();
        let source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();
        let (tx, _rx) = mpsc::channel();
        let core = RtpSinkCore::new(96, 90_000);
        let sink = MultiFramedRtpSink::new(core, Box::new(source), Box::new(ChannelSink(tx)), 1400, scheduler.clone(), None);
        assert!(!sink.is_playing());
        sink.start_playing();
        assert!(sink.is_playing());
        sink.stop_playing();
        assert!(!sink.is_playing());
        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }
}
