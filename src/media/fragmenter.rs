//! H.264/H.265 fragmenter (C7): produces RTP-sized pieces of NAL units.
//!
//! This is a byte-for-byte port of `H264or5Fragmenter::doGetNextFrame` in
//! `H264or5VideoRTPSink.cpp` — see `SPEC_FULL.md` §4.4 for the prose and
//! `DESIGN.md` for the line-by-line grounding. The buffer layout is
//! unchanged from the original: byte 0 is a reserved prefix used to stamp
//! the FU indicator (and, for H.265, shares space with the FU header); NAL
//! data starts at offset 1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::media::framed_source::{
    new_frame_buffer, AfterGettingFn, FrameBuffer, FrameDelivery, FramedFilter, FramedSource, OnCloseFn,
};
use crate::media::nal_framer::VideoCodec;
use crate::scheduler::Scheduler;

/// Default capacity for the fragmenter's input buffer — large enough to
/// hold any NAL this server expects to fragment. Mirrors
/// `OutPacketBuffer::maxSize` being passed as `inputBufferMax` in the
/// original constructor call.
pub const DEFAULT_INPUT_BUFFER_MAX: usize = 2 * 1024 * 1024;

struct Shared {
    buffer: Vec<u8>,
    num_valid_data_bytes: usize,
    cur_data_offset: usize,
    save_num_truncated_bytes: usize,
    presentation_time: Instant,
    duration: Duration,
}

impl Shared {
    fn new(input_buffer_max: usize) -> Self {
        Shared {
            buffer: vec![0u8; input_buffer_max + 1],
            num_valid_data_bytes: 1,
            cur_data_offset: 1,
            save_num_truncated_bytes: 0,
            presentation_time: Instant::now(),
            duration: Duration::ZERO,
        }
    }
}

/// Output of one fragmentation step: the bytes to emit, whether this
/// fragment completed the NAL unit (`lastFragmentCompletedNALUnit`), and
/// how many trailing bytes of the original frame were truncated (carried
/// through from the upstream read that filled the buffer).
type EmitResult = (Vec<u8>, bool, usize);

/// Executes one step of the state machine described in `SPEC_FULL.md`
/// §4.4. Returns `None` when the buffer is empty (the caller must fetch a
/// new NAL from upstream before a fragment can be produced).
fn try_emit(shared: &mut Shared, codec: VideoCodec, max_output_packet_size: usize) -> Option<EmitResult> {
    if shared.num_valid_data_bytes == 1 {
        return None;
    }
    let max_size = max_output_packet_size;

    if shared.cur_data_offset == 1 {
        let nal_size = shared.num_valid_data_bytes - 1;
        if nal_size <= max_size {
            let out = shared.buffer[1..shared.num_valid_data_bytes].to_vec();
            shared.cur_data_offset = shared.num_valid_data_bytes;
            let truncated = shared.save_num_truncated_bytes;
            reset_if_exhausted(shared);
            return Some((out, true, truncated));
        }

        // First fragment of a NAL too large to send whole: stamp FU
        // indicator/header in place, overwriting the NAL's own first byte(s).
        match codec {
            VideoCodec::H264 => {
                let b1 = shared.buffer[1];
                shared.buffer[0] = (b1 & 0xE0) | 28;
                shared.buffer[1] = 0x80 | (b1 & 0x1F);
            }
            VideoCodec::H265 => {
                let b1 = shared.buffer[1];
                let b2 = shared.buffer[2];
                let nal_type = (b1 & 0x7E) >> 1;
                shared.buffer[0] = (b1 & 0x81) | (49 << 1);
                shared.buffer[1] = b2;
                shared.buffer[2] = 0x80 | nal_type;
            }
        }
        let out = shared.buffer[0..max_size].to_vec();
        shared.cur_data_offset += max_size - 1;
        reset_if_exhausted(shared);
        return Some((out, false, 0));
    }

    // Middle or last fragment.
    let num_extra_header_bytes = match codec {
        VideoCodec::H264 => 2,
        VideoCodec::H265 => 3,
    };
    let cur = shared.cur_data_offset;
    let (b0, b1, b2) = (shared.buffer[0], shared.buffer[1], shared.buffer[2]);
    match codec {
        VideoCodec::H264 => {
            shared.buffer[cur - 2] = b0;
            shared.buffer[cur - 1] = b1 & !0x80;
        }
        VideoCodec::H265 => {
            shared.buffer[cur - 3] = b0;
            shared.buffer[cur - 2] = b1;
            shared.buffer[cur - 1] = b2 & !0x80;
        }
    }

    let num_bytes_to_send_full = num_extra_header_bytes + (shared.num_valid_data_bytes - cur);
    let (num_bytes_to_send, is_last) = if num_bytes_to_send_full > max_size {
        (max_size, false)
    } else {
        (num_bytes_to_send_full, true)
    };
    if is_last {
        shared.buffer[cur - 1] |= 0x40;
    }

    let start = cur - num_extra_header_bytes;
    let out = shared.buffer[start..start + num_bytes_to_send].to_vec();
    shared.cur_data_offset += num_bytes_to_send - num_extra_header_bytes;
    let truncated = if is_last { shared.save_num_truncated_bytes } else { 0 };
    reset_if_exhausted(shared);
    Some((out, is_last, truncated))
}

fn reset_if_exhausted(shared: &mut Shared) {
    if shared.cur_data_offset >= shared.num_valid_data_bytes {
        shared.num_valid_data_bytes = 1;
        shared.cur_data_offset = 1;
    }
}

/// A `FramedFilter` mediating between a NAL-per-frame framer (C6) and a
/// `MultiFramedRTPSink` (C9) that requires fragments no larger than
/// `max_output_packet_size`.
pub struct Fragmenter {
    codec: VideoCodec,
    input: Arc<Mutex<Option<Box<dyn FramedSource>>>>,
    scheduler: Scheduler,
    max_output_packet_size: usize,
    shared: Arc<Mutex<Shared>>,
    last_fragment_completed_nal_unit: Arc<AtomicBool>,
    awaiting: bool,
}

impl Fragmenter {
    pub fn new(
        codec: VideoCodec,
        input: Box<dyn FramedSource>,
        max_output_packet_size: usize,
        scheduler: Scheduler,
    ) -> Self {
        Self::with_input_buffer_max(codec, input, max_output_packet_size, DEFAULT_INPUT_BUFFER_MAX, scheduler)
    }

    pub fn with_input_buffer_max(
        codec: VideoCodec,
        input: Box<dyn FramedSource>,
        max_output_packet_size: usize,
        input_buffer_max: usize,
        scheduler: Scheduler,
    ) -> Self {
        Fragmenter {
            codec,
            input: Arc::new(Mutex::new(Some(input))),
            scheduler,
            max_output_packet_size,
            shared: Arc::new(Mutex::new(Shared::new(input_buffer_max))),
            last_fragment_completed_nal_unit: Arc::new(AtomicBool::new(true)),
            awaiting: false,
        }
    }

    /// Whether the most recently emitted fragment completed its NAL unit.
    /// Read (not consumed) by the H.264/5 RTP sink's marker-bit logic.
    pub fn last_fragment_completed_nal_unit(&self) -> bool {
        self.last_fragment_completed_nal_unit.load(Ordering::SeqCst)
    }

    /// Returns a cloned handle to the completion flag (see
    /// `picture_end_marker_handle` on [`crate::media::nal_framer::NalUnitStreamFramer`]
    /// for why this is exposed as a shared handle rather than a method call).
    pub fn last_fragment_completed_handle(&self) -> Arc<AtomicBool> {
        self.last_fragment_completed_nal_unit.clone()
    }
}

impl FramedSource for Fragmenter {
    fn get_next_frame(
        &mut self,
        to: FrameBuffer,
        max_size: usize,
        after_getting: AfterGettingFn,
        on_close: OnCloseFn,
    ) {
        self.awaiting = true;

        let immediate = {
            let mut guard = self.shared.lock();
            try_emit(&mut guard, self.codec, self.max_output_packet_size)
                .map(|(bytes, completed, truncated)| (bytes, completed, truncated, guard.presentation_time, guard.duration))
        };

        if let Some((bytes, completed, truncated, pt, dur)) = immediate {
            self.last_fragment_completed_nal_unit.store(completed, Ordering::SeqCst);
            let n = bytes.len().min(max_size);
            to.lock()[..n].copy_from_slice(&bytes[..n]);
            self.scheduler.schedule_delayed(Duration::ZERO, move || {
                after_getting(FrameDelivery {
                    frame_size: n,
                    num_truncated_bytes: truncated,
                    presentation_time: pt,
                    duration: dur,
                });
            });
            return;
        }

        // Empty state: fetch the next whole NAL from upstream.
        let input = self.input.clone();
        let shared = self.shared.clone();
        let codec = self.codec;
        let max_output = self.max_output_packet_size;
        let last_flag = self.last_fragment_completed_nal_unit.clone();

        let mut input_guard = input.lock();
        let Some(src) = input_guard.as_mut() else {
            drop(input_guard);
            self.scheduler.schedule_delayed(Duration::ZERO, move || on_close());
            return;
        };

        let buf_capacity = shared.lock().buffer.len() - 1;
        let upstream_buf = new_frame_buffer(buf_capacity);
        let upstream_buf_for_copy = upstream_buf.clone();

        src.get_next_frame(
            upstream_buf,
            buf_capacity,
            Box::new(move |delivery: FrameDelivery| {
                let emitted = {
                    let mut s = shared.lock();
                    {
                        let data = upstream_buf_for_copy.lock();
                        s.buffer[1..1 + delivery.frame_size].copy_from_slice(&data[..delivery.frame_size]);
                    }
                    s.num_valid_data_bytes = 1 + delivery.frame_size;
                    s.cur_data_offset = 1;
                    s.save_num_truncated_bytes = delivery.num_truncated_bytes;
                    s.presentation_time = delivery.presentation_time;
                    s.duration = delivery.duration;
                    try_emit(&mut s, codec, max_output)
                        .map(|(bytes, completed, truncated)| (bytes, completed, truncated, s.presentation_time, s.duration))
                };
                match emitted {
                    Some((bytes, completed, truncated, pt, dur)) => {
                        last_flag.store(completed, Ordering::SeqCst);
                        let n = bytes.len().min(max_size);
                        to.lock()[..n].copy_from_slice(&bytes[..n]);
                        after_getting(FrameDelivery {
                            frame_size: n,
                            num_truncated_bytes: truncated,
                            presentation_time: pt,
                            duration: dur,
                        });
                    }
                    None => {
                        warn!("fragmenter produced no output immediately after filling its buffer");
                    }
                }
            }),
            Box::new(move || on_close()),
        );
    }

    fn stop_getting_frames(&mut self) {
        self.awaiting = false;
        {
            let mut guard = self.shared.lock();
            guard.num_valid_data_bytes = 1;
            guard.cur_data_offset = 1;
            guard.save_num_truncated_bytes = 0;
        }
        self.last_fragment_completed_nal_unit.store(true, Ordering::SeqCst);
        if let Some(src) = self.input.lock().as_mut() {
            src.stop_getting_frames();
        }
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.awaiting
    }
}

impl FramedFilter for Fragmenter {
    fn reassign_input_source(&mut self, input: Box<dyn FramedSource>) -> Option<Box<dyn FramedSource>> {
        // Per the Open Question decided in DESIGN.md: overflow/partial-NAL
        // state never survives a source reassignment.
        {
            let mut guard = self.shared.lock();
            guard.num_valid_data_bytes = 1;
            guard.cur_data_offset = 1;
            guard.save_num_truncated_bytes = 0;
        }
        self.last_fragment_completed_nal_unit.store(true, Ordering::SeqCst);
        self.input.lock().replace(input)
    }

    fn detach_input_source(&mut self) -> Option<Box<dyn FramedSource>> {
        self.input.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_all(codec: VideoCodec, nal: &[u8], max_output: usize) -> Vec<(Vec<u8>, bool)> {
        let mut shared = Shared::new(DEFAULT_INPUT_BUFFER_MAX);
        shared.buffer[1..1 + nal.len()].copy_from_slice(nal);
        shared.num_valid_data_bytes = 1 + nal.len();
        shared.cur_data_offset = 1;

        let mut out = Vec::new();
        while let Some((bytes, completed, _truncated)) = try_emit(&mut shared, codec, max_output) {
            out.push((bytes, completed));
        }
        out
    }

    #[test]
    fn small_nal_emits_verbatim_single_fragment() {
        let nal = vec![0x65; 1200];
        let fragments = emit_all(VideoCodec::H264, &nal, 1400);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].0, nal);
        assert!(fragments[0].1);
    }

    #[test]
    fn large_h264_nal_fragments_with_correct_sizes_and_bits() {
        let mut nal = vec![0x65u8]; // NAL header: forbidden=0, nri=11, type=5
        nal.extend(std::iter::repeat(0xAB).take(3499));
        assert_eq!(nal.len(), 3500);

        let fragments = emit_all(VideoCodec::H264, &nal, 1400);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].0.len(), 1400);
        assert_eq!(fragments[1].0.len(), 1400);
        assert_eq!(fragments[2].0.len(), 705);

        let fu_indicator = fragments[0].0[0];
        assert_eq!(fu_indicator, 0x7C);
        assert_eq!(fragments[1].0[0], 0x7C);
        assert_eq!(fragments[2].0[0], 0x7C);

        assert_eq!(fragments[0].0[1], 0x85); // S=1
        assert_eq!(fragments[1].0[1], 0x05); // middle
        assert_eq!(fragments[2].0[1], 0x45); // E=1

        assert!(!fragments[0].1);
        assert!(!fragments[1].1);
        assert!(fragments[2].1);

        // reconstruct NAL type from FU indicator + FU header.
        let reconstructed_first_byte = (fu_indicator & 0xE0) | (fragments[0].0[1] & 0x1F);
        assert_eq!(reconstructed_first_byte, nal[0]);

        // reconstruct payload bytes 1..N-1 by concatenating fragment payloads
        // (excluding the 2-byte FU indicator+header on each fragment).
        let mut reconstructed = Vec::new();
        reconstructed.extend_from_slice(&fragments[0].0[2..]);
        reconstructed.extend_from_slice(&fragments[1].0[2..]);
        reconstructed.extend_from_slice(&fragments[2].0[2..]);
        assert_eq!(reconstructed, nal[1..]);
    }

    #[test]
    fn large_h265_nal_uses_three_byte_fu_header() {
        // byte0: forbidden(0)+type(6 bits)+layerid msb; byte1: layerid lsb+tid
        let mut nal = vec![0x02u8, 0x01u8];
        nal.extend(std::iter::repeat(0xCD).take(2998));
        assert_eq!(nal.len(), 3000);

        let fragments = emit_all(VideoCodec::H265, &nal, 1400);
        assert_eq!(fragments.len(), 3);
        for f in &fragments[..2] {
            assert_eq!(f.0.len(), 1400);
        }
        assert_eq!(fragments[2].0.len(), 207);

        // PayloadHdr: first byte has FU type (49<<1) in bits, preserving F and
        // layerid-msb bit from the original.
        assert_eq!(fragments[0].0[0] & 0x81, nal[0] & 0x81);
        assert_eq!((fragments[0].0[0] >> 1) & 0x3F, 49);
        assert_eq!(fragments[0].0[1], nal[1]);

        assert_eq!(fragments[0].0[2] & 0x80, 0x80); // S
        assert_eq!(fragments[1].0[2] & 0xC0, 0); // middle
        assert_eq!(fragments[2].0[2] & 0x40, 0x40); // E
    }

    #[test]
    fn exactly_max_size_nal_is_not_fragmented() {
        let nal = vec![0x41u8; 1400];
        let fragments = emit_all(VideoCodec::H264, &nal, 1400);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].1);
    }

    #[test]
    fn stop_and_restart_resets_state() {
        use crate::media::byte_stream_file_source::ByteStreamFileSource;
        use std::io::Write;

        let mut path = std::env::temp_dir();
        path.push("rtsp_rs_fragmenter_stop_test");
        std::fs::File::create(&path).unwrap().write_all(&[0u8; 4]).unwrap();

        let scheduler = Scheduler::new();
        let file_source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();
        let mut fragmenter = Fragmenter::new(VideoCodec::H264, Box::new(file_source), 1400, scheduler.clone());
        fragmenter.stop_getting_frames();
        assert!(fragmenter.last_fragment_completed_nal_unit());
        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }
}
