//! Framed-source producer protocol (C4): the asynchronous
//! one-frame-per-call producer contract that connects file readers, codec
//! framers, fragmenters, and RTP sinks without copies beyond the one header
//! rewrite the fragmenter performs.
//!
//! live555 passes a raw `unsigned char* fTo` into `doGetNextFrame` and
//! invokes a C function pointer once data lands in it. Rust has no
//! equivalent to "hand out a raw pointer, get a callback later" without
//! `unsafe`, so this models the destination as a shared, lock-guarded
//! buffer (`FrameBuffer`) instead: the caller pre-sizes it to the
//! requested capacity, the source fills a prefix of it under the lock, and
//! the completion callback reports how much was actually written. This is
//! the same shared-mutable-state idiom the rest of the crate already uses
//! for session/mount state (`parking_lot::Mutex`/`RwLock`), just applied to
//! the data path.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Destination buffer for one `get_next_frame` call. Pre-sized by the
/// caller to the requested capacity (`max_size`); the source overwrites a
/// prefix of it and reports the written length via [`FrameDelivery`].
pub type FrameBuffer = Arc<Mutex<Vec<u8>>>;

/// Allocates a zeroed destination buffer of the given capacity.
pub fn new_frame_buffer(max_size: usize) -> FrameBuffer {
    Arc::new(Mutex::new(vec![0u8; max_size]))
}

/// Delivered once a frame has been written into the destination buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDelivery {
    /// Bytes actually written, always `<= max_size` of the request.
    pub frame_size: usize,
    /// Bytes discarded because the underlying frame exceeded `max_size`.
    pub num_truncated_bytes: usize,
    pub presentation_time: Instant,
    pub duration: Duration,
}

/// Invoked exactly once per successful `get_next_frame`, always via the
/// scheduler rather than synchronously.
pub type AfterGettingFn = Box<dyn FnOnce(FrameDelivery) + Send>;

/// Invoked instead of `AfterGettingFn` on end-of-stream.
pub type OnCloseFn = Box<dyn FnOnce() + Send>;

/// Producer half of the framed-source contract (§4.1).
///
/// Exactly one call to `get_next_frame` may be outstanding at a time; a
/// second call before the first has completed (via `after_getting` or
/// `on_close`) is a programming error, matching the source-level invariant
/// in the distilled spec rather than one this trait can enforce statically.
pub trait FramedSource: Send {
    /// Requests one frame into `to`, with capacity `max_size`. On success,
    /// schedules `after_getting` with the delivered size/timing. On
    /// end-of-stream, schedules `on_close` instead.
    fn get_next_frame(
        &mut self,
        to: FrameBuffer,
        max_size: usize,
        after_getting: AfterGettingFn,
        on_close: OnCloseFn,
    );

    /// Cancels an outstanding request idempotently. A later
    /// `get_next_frame` must restart cleanly.
    fn stop_getting_frames(&mut self);

    /// Whether a `get_next_frame` call is currently outstanding.
    fn is_currently_awaiting_data(&self) -> bool;
}

/// A `FramedSource` that wraps another `FramedSource`, forwarding
/// `stop_getting_frames` and allowing its input to be swapped out (used by
/// the H.264/5 RTP sink to reuse a fragmenter across `continuePlaying`
/// calls — see `SPEC_FULL.md` §4.8).
///
/// Per the Open Question resolved in `DESIGN.md`, reassigning the input
/// always discards any overflow state the filter itself is holding: the
/// overflow was produced against the *old* source's framing and is not
/// meaningful against the new one.
pub trait FramedFilter: FramedSource {
    /// Replaces the upstream source, discarding this filter's own overflow
    /// state (if any) in the process. The filter does not own the input:
    /// the previous input, if any, is returned to the caller so it can
    /// decide whether to close it.
    fn reassign_input_source(&mut self, input: Box<dyn FramedSource>) -> Option<Box<dyn FramedSource>>;

    /// Detaches the input without replacing it, so that a filter's
    /// destructor does not propagate `stop_getting_frames`/close to an
    /// input it no longer considers its own (mirrors
    /// `FramedFilter::detachInputSource` in the original).
    fn detach_input_source(&mut self) -> Option<Box<dyn FramedSource>>;
}
