//! H.264/H.265 stream framer (C6): a `FramedFilter` that repackages a raw
//! byte-stream input into one NAL unit per frame, stripping Annex B start
//! codes, grounded in `MPEGVideoStreamFramer.hh`'s `pictureEndMarker` hack
//! for the RTP M bit.
//!
//! Exact access-unit boundaries require parsing each VCL NAL's slice
//! header (`first_mb_in_slice`/`frame_num`), which is out of scope here —
//! see `SPEC_FULL.md` §1's exclusion of demuxing below "produce one access
//! unit". This framer approximates it the way single-slice-per-picture
//! streams behave in practice: every VCL NAL (H.264 types 1/5, H.265 types
//! 0-31) completes the access unit it belongs to; parameter-set/SEI/AUD
//! NALs do not. Streams with multiple slices per picture will see the
//! marker bit set once per slice instead of once per picture; this is
//! documented in `DESIGN.md`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::media::framed_source::{
    new_frame_buffer, AfterGettingFn, FrameBuffer, FrameDelivery, FramedFilter, FramedSource, OnCloseFn,
};
use crate::scheduler::Scheduler;

const UPSTREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

struct PendingNal {
    bytes: Vec<u8>,
    presentation_time: std::time::Instant,
    duration: Duration,
}

struct State {
    raw: Vec<u8>,
    queue: VecDeque<PendingNal>,
    upstream_closed: bool,
}

/// Delimits an Annex-B byte stream into one NAL unit per frame and exposes
/// `picture_end_marker`, which `doSpecialFrameHandling` (§4.8) reads and
/// clears to drive the RTP marker bit.
pub struct NalUnitStreamFramer {
    codec: VideoCodec,
    input: Option<Box<dyn FramedSource>>,
    scheduler: Scheduler,
    state: Arc<Mutex<State>>,
    picture_end_marker: Arc<AtomicBool>,
    awaiting: bool,
}

impl NalUnitStreamFramer {
    pub fn new(codec: VideoCodec, input: Box<dyn FramedSource>, scheduler: Scheduler) -> Self {
        NalUnitStreamFramer {
            codec,
            input: Some(input),
            scheduler,
            state: Arc::new(Mutex::new(State {
                raw: Vec::new(),
                queue: VecDeque::new(),
                upstream_closed: false,
            })),
            picture_end_marker: Arc::new(AtomicBool::new(false)),
            awaiting: false,
        }
    }

    /// Reads, then clears, the picture-end marker (matches the original's
    /// `Boolean&` hack without exposing mutable aliasing).
    pub fn take_picture_end_marker(&self) -> bool {
        self.picture_end_marker.swap(false, Ordering::SeqCst)
    }

    /// Returns a cloned handle to the picture-end-marker flag, so that a
    /// downstream RTP sink can read it directly instead of going through a
    /// type-erased `FramedSource` (mirrors the original holding a direct
    /// pointer to its upstream `MPEGVideoStreamFramer`).
    pub fn picture_end_marker_handle(&self) -> Arc<AtomicBool> {
        self.picture_end_marker.clone()
    }

    fn is_vcl_nal(&self, first_byte: u8) -> bool {
        match self.codec {
            VideoCodec::H264 => matches!(first_byte & 0x1F, 1 | 5),
            VideoCodec::H265 => ((first_byte >> 1) & 0x3F) <= 31,
        }
    }
}

fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, 4));
                i += 4;
                continue;
            }
            if data[i + 2] == 1 {
                starts.push((i, 3));
                i += 3;
                continue;
            }
        }
        i += 1;
    }
    starts
}

/// Extracts every NAL unit fully delimited by two consecutive start codes,
/// leaving the trailing (possibly still-growing) NAL in `raw`.
fn drain_complete_nals(raw: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let starts = find_start_codes(raw);
    if starts.len() < 2 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(starts.len() - 1);
    for w in starts.windows(2) {
        let (start, code_len) = w[0];
        let (next_start, _) = w[1];
        out.push(raw[start + code_len..next_start].to_vec());
    }
    let (last_start, _) = *starts.last().unwrap();
    raw.drain(0..last_start);
    out
}

/// Flushes whatever remains in `raw` as a final NAL (used once upstream
/// has closed and no further start code will ever arrive).
fn drain_final_nal(raw: &mut Vec<u8>) -> Option<Vec<u8>> {
    let starts = find_start_codes(raw);
    let (start, code_len) = *starts.first()?;
    let nal = raw[start + code_len..].to_vec();
    raw.clear();
    if nal.is_empty() {
        None
    } else {
        Some(nal)
    }
}

impl FramedSource for NalUnitStreamFramer {
    fn get_next_frame(
        &mut self,
        to: FrameBuffer,
        max_size: usize,
        after_getting: AfterGettingFn,
        on_close: OnCloseFn,
    ) {
        self.awaiting = true;

        let mut state = self.state.lock();
        if let Some(pending) = state.queue.pop_front() {
            drop(state);
            self.deliver(pending, to, max_size, after_getting);
            return;
        }
        if state.upstream_closed {
            if let Some(nal) = drain_final_nal(&mut state.raw) {
                let pending = PendingNal {
                    bytes: nal,
                    presentation_time: std::time::Instant::now(),
                    duration: Duration::ZERO,
                };
                drop(state);
                self.deliver(pending, to, max_size, after_getting);
                return;
            }
            drop(state);
            self.scheduler
                .schedule_delayed(Duration::ZERO, move || on_close());
            return;
        }
        drop(state);

        let Some(input) = self.input.as_mut() else {
            self.scheduler
                .schedule_delayed(Duration::ZERO, move || on_close());
            return;
        };

        let upstream_buf = new_frame_buffer(UPSTREAM_CHUNK_SIZE);
        let state_for_cb = self.state.clone();
        let state_for_close = self.state.clone();

        let upstream_buf_for_after = upstream_buf.clone();
        input.get_next_frame(
            upstream_buf,
            UPSTREAM_CHUNK_SIZE,
            Box::new(move |delivery: FrameDelivery| {
                let mut state = state_for_cb.lock();
                state
                    .raw
                    .extend_from_slice(&upstream_buf_for_after.lock()[..delivery.frame_size]);
                let nals = drain_complete_nals(&mut state.raw);
                for bytes in nals {
                    state.queue.push_back(PendingNal {
                        bytes,
                        presentation_time: delivery.presentation_time,
                        duration: delivery.duration,
                    });
                }
            }),
            Box::new(move || {
                state_for_close.lock().upstream_closed = true;
            }),
        );

        // The caller's request will be satisfied by re-issuing get_next_frame
        // once data has arrived; schedule a short re-poll so the queue drains
        // as soon as a NAL becomes available.
        self.reschedule_delivery(to, max_size, after_getting, on_close);
    }

    fn stop_getting_frames(&mut self) {
        self.awaiting = false;
        if let Some(input) = self.input.as_mut() {
            input.stop_getting_frames();
        }
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.awaiting
    }
}

impl NalUnitStreamFramer {
    fn deliver(&self, pending: PendingNal, to: FrameBuffer, max_size: usize, after_getting: AfterGettingFn) {
        let is_vcl = !pending.bytes.is_empty() && self.is_vcl_nal(pending.bytes[0]);
        if is_vcl {
            self.picture_end_marker.store(true, Ordering::SeqCst);
        }
        let n = pending.bytes.len().min(max_size);
        let truncated = pending.bytes.len() - n;
        {
            let mut guard = to.lock();
            guard[..n].copy_from_slice(&pending.bytes[..n]);
        }
        let presentation_time = pending.presentation_time;
        let duration = pending.duration;
        self.scheduler.schedule_delayed(Duration::ZERO, move || {
            after_getting(FrameDelivery {
                frame_size: n,
                num_truncated_bytes: truncated,
                presentation_time,
                duration,
            });
        });
    }

    /// Polls the internal queue until a NAL is ready (or upstream closes
    /// with nothing left), then delivers it. Bounded by repeated
    /// zero-delay scheduler re-arms rather than a busy loop on the calling
    /// thread.
    fn reschedule_delivery(
        &self,
        to: FrameBuffer,
        max_size: usize,
        after_getting: AfterGettingFn,
        on_close: OnCloseFn,
    ) {
        let state = self.state.clone();
        let scheduler = self.scheduler.clone();
        let codec = self.codec;
        let picture_end_marker = self.picture_end_marker.clone();
        poll_queue(state, scheduler, codec, picture_end_marker, to, max_size, after_getting, on_close);
    }
}

fn poll_queue(
    state: Arc<Mutex<State>>,
    scheduler: Scheduler,
    codec: VideoCodec,
    picture_end_marker: Arc<AtomicBool>,
    to: FrameBuffer,
    max_size: usize,
    after_getting: AfterGettingFn,
    on_close: OnCloseFn,
) {
    let mut guard = state.lock();
    if let Some(pending) = guard.queue.pop_front() {
        drop(guard);
        let is_vcl = !pending.bytes.is_empty()
            && match codec {
                VideoCodec::H264 => matches!(pending.bytes[0] & 0x1F, 1 | 5),
                VideoCodec::H265 => ((pending.bytes[0] >> 1) & 0x3F) <= 31,
            };
        if is_vcl {
            picture_end_marker.store(true, Ordering::SeqCst);
        }
        let n = pending.bytes.len().min(max_size);
        let truncated = pending.bytes.len() - n;
        to.lock()[..n].copy_from_slice(&pending.bytes[..n]);
        let presentation_time = pending.presentation_time;
        let duration = pending.duration;
        scheduler.schedule_delayed(Duration::ZERO, move || {
            after_getting(FrameDelivery {
                frame_size: n,
                num_truncated_bytes: truncated,
                presentation_time,
                duration,
            });
        });
        return;
    }
    if guard.upstream_closed {
        if let Some(nal) = drain_final_nal(&mut guard.raw) {
            guard.queue.push_back(PendingNal {
                bytes: nal,
                presentation_time: std::time::Instant::now(),
                duration: Duration::ZERO,
            });
            drop(guard);
            poll_queue(state, scheduler, codec, picture_end_marker, to, max_size, after_getting, on_close);
            return;
        }
        drop(guard);
        scheduler.schedule_delayed(Duration::ZERO, move || on_close());
        return;
    }
    drop(guard);
    scheduler.clone().schedule_delayed(Duration::from_millis(2), move || {
        poll_queue(state, scheduler, codec, picture_end_marker, to, max_size, after_getting, on_close);
    });
}

impl FramedFilter for NalUnitStreamFramer {
    fn reassign_input_source(&mut self, input: Box<dyn FramedSource>) -> Option<Box<dyn FramedSource>> {
        let mut state = self.state.lock();
        state.raw.clear();
        state.queue.clear();
        state.upstream_closed = false;
        drop(state);
        self.input.replace(input)
    }

    fn detach_input_source(&mut self) -> Option<Box<dyn FramedSource>> {
        self.input.take()
    }
}
