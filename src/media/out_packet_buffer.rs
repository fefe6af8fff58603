//! Output packet buffer (C3): a single reusable RTP assembly buffer with
//! overflow carry-over, grounded in `OutPacketBuffer` as used throughout
//! `MultiFramedRTPSink.hh`.

use std::time::{Duration, Instant};

/// Non-owning-in-spirit view over a flat byte buffer used to assemble one
/// RTP packet at a time. `packet_start` marks where the current packet's
/// RTP header begins; `cur_offset` is the next write position relative to
/// `packet_start`. Overflow data — the tail of a source frame that didn't
/// fit in the current packet — is carried separately until
/// [`OutPacketBuffer::use_overflow_data`] folds it into the next packet.
pub struct OutPacketBuffer {
    buf: Vec<u8>,
    packet_start: usize,
    cur_offset: usize,
    preferred_max_size: usize,
    max_size: usize,
    overflow_data: Vec<u8>,
    overflow_presentation_time: Option<Instant>,
    overflow_duration: Duration,
}

impl OutPacketBuffer {
    /// `max_buffer_size` must be large enough to hold a full packet twice
    /// over (current + worst-case overflow); callers size it from the
    /// sink's configured packet sizes.
    pub fn new(preferred_max_size: usize, max_size: usize, max_buffer_size: usize) -> Self {
        let limit = max_buffer_size.max(max_size * 2);
        OutPacketBuffer {
            buf: vec![0u8; limit],
            packet_start: 0,
            cur_offset: 0,
            preferred_max_size,
            max_size,
            overflow_data: Vec::new(),
            overflow_presentation_time: None,
            overflow_duration: Duration::ZERO,
        }
    }

    /// Absolute offset, in `self`'s backing storage, of the next write.
    pub fn cur_ptr_offset(&self) -> usize {
        self.packet_start + self.cur_offset
    }

    /// Mutable slice starting at the next write position, sized to the
    /// remainder of the packet.
    pub fn cur_ptr_mut(&mut self) -> &mut [u8] {
        let start = self.cur_ptr_offset();
        let avail = self.total_bytes_available();
        &mut self.buf[start..start + avail]
    }

    pub fn cur_offset(&self) -> usize {
        self.cur_offset
    }

    pub fn packet_start(&self) -> usize {
        self.packet_start
    }

    pub fn total_bytes_available(&self) -> usize {
        self.max_size.saturating_sub(self.cur_offset)
    }

    /// Slice of the packet currently assembled (header onward).
    pub fn packet_data(&self) -> &[u8] {
        &self.buf[self.packet_start..self.packet_start + self.cur_offset]
    }

    /// Starts a brand new packet at the front of the buffer.
    pub fn reset_packet_start(&mut self) {
        self.packet_start = 0;
        self.cur_offset = 0;
    }

    /// Keeps `packet_start` but rewinds the write cursor (used when
    /// re-emitting a special header before payload).
    pub fn reset_offset(&mut self) {
        self.cur_offset = 0;
    }

    pub fn enqueue(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.total_bytes_available());
        let start = self.cur_ptr_offset();
        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
        self.cur_offset += n;
    }

    pub fn enqueue_word(&mut self, word: u32) {
        self.enqueue(&word.to_be_bytes());
    }

    /// Writes `bytes` at `position` (relative to `packet_start`), without
    /// necessarily advancing sequentially — used to backfill the special
    /// header once the payload size is known.
    pub fn insert(&mut self, bytes: &[u8], position: usize) {
        let start = self.packet_start + position;
        let n = bytes.len();
        self.buf[start..start + n].copy_from_slice(bytes);
        if position + n > self.cur_offset {
            self.cur_offset = position + n;
        }
    }

    pub fn insert_word(&mut self, word: u32, position: usize) {
        self.insert(&word.to_be_bytes(), position);
    }

    pub fn skip_bytes(&mut self, n: usize) {
        self.cur_offset += n;
    }

    pub fn extract(&self, position: usize, n: usize) -> &[u8] {
        let start = self.packet_start + position;
        &self.buf[start..start + n]
    }

    pub fn is_preferred_size(&self) -> bool {
        self.cur_offset >= self.preferred_max_size
    }

    pub fn would_overflow(&self, num_bytes: usize) -> bool {
        self.cur_offset + num_bytes > self.max_size
    }

    pub fn is_too_big_for_a_packet(&self, num_bytes: usize) -> bool {
        num_bytes > self.max_size
    }

    pub fn overflow_data_size(&self) -> usize {
        self.overflow_data.len()
    }

    pub fn overflow_presentation_time(&self) -> Option<Instant> {
        self.overflow_presentation_time
    }

    /// Stashes `size` bytes starting at `offset` (relative to
    /// `packet_start`) as overflow, to be folded into the next packet via
    /// [`Self::use_overflow_data`].
    pub fn set_overflow_data(&mut self, offset: usize, size: usize, time: Instant, duration: Duration) {
        let start = self.packet_start + offset;
        self.overflow_data = self.buf[start..start + size].to_vec();
        self.overflow_presentation_time = Some(time);
        self.overflow_duration = duration;
    }

    /// Discards any pending overflow without adopting it. Used when a new
    /// upstream source is assigned (see `SPEC_FULL.md` §9's Open Question
    /// decision: overflow never survives a source reassignment).
    pub fn discard_overflow_data(&mut self) {
        self.overflow_data.clear();
        self.overflow_presentation_time = None;
        self.overflow_duration = Duration::ZERO;
    }

    /// Copies the previously stashed overflow into the current packet at
    /// the write cursor. After this call `cur_offset == overflow_data_size`
    /// (from before the call) and `overflow_data_size() == 0`. Returns the
    /// duration that was associated with the overflow data.
    pub fn use_overflow_data(&mut self) -> Duration {
        let n = self.overflow_data.len();
        let dst = self.cur_ptr_offset();
        self.buf[dst..dst + n].copy_from_slice(&self.overflow_data);
        self.cur_offset += n;
        self.overflow_data.clear();
        self.overflow_presentation_time = None;
        std::mem::replace(&mut self.overflow_duration, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_advances_offset() {
        let mut buf = OutPacketBuffer::new(1400, 1400, 4096);
        buf.enqueue(&[1, 2, 3, 4]);
        assert_eq!(buf.cur_offset(), 4);
        assert_eq!(buf.packet_data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn insert_backfills_without_moving_offset_forward() {
        let mut buf = OutPacketBuffer::new(1400, 1400, 4096);
        buf.skip_bytes(12);
        buf.enqueue(&[9, 9]);
        buf.insert(&[0xAA, 0xBB], 0);
        assert_eq!(buf.extract(0, 2), &[0xAA, 0xBB]);
        assert_eq!(buf.cur_offset(), 14);
    }

    #[test]
    fn overflow_round_trip() {
        let mut buf = OutPacketBuffer::new(1400, 1400, 4096);
        buf.enqueue(&[1, 2, 3, 4, 5]);
        buf.set_overflow_data(2, 3, Instant::now(), Duration::from_millis(5));
        assert_eq!(buf.overflow_data_size(), 3);
        buf.reset_packet_start();
        let dur = buf.use_overflow_data();
        assert_eq!(dur, Duration::from_millis(5));
        assert_eq!(buf.cur_offset(), 3);
        assert_eq!(buf.overflow_data_size(), 0);
        assert_eq!(buf.packet_data(), &[3, 4, 5]);
    }

    #[test]
    fn invariant_packet_start_plus_cur_offset_within_limit() {
        let mut buf = OutPacketBuffer::new(100, 100, 256);
        buf.enqueue(&vec![0u8; 50]);
        buf.set_overflow_data(0, 10, Instant::now(), Duration::ZERO);
        buf.reset_packet_start();
        buf.use_overflow_data();
        assert!(buf.packet_start() + buf.cur_offset() <= 256);
    }

    #[test]
    fn would_overflow_and_too_big_predicates() {
        let buf = OutPacketBuffer::new(100, 200, 1024);
        assert!(!buf.would_overflow(200));
        assert!(buf.would_overflow(201));
        assert!(buf.is_too_big_for_a_packet(201));
        assert!(!buf.is_too_big_for_a_packet(200));
    }
}
