//! Byte-stream file source (C5): reads a file as a byte stream and
//! produces bounded "frames", grounded in `ByteStreamFileSource.hh`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::media::framed_source::{AfterGettingFn, FrameBuffer, FrameDelivery, FramedSource, OnCloseFn};
use crate::scheduler::{Scheduler, TaskToken};
use crate::Result;

struct Shared {
    file: File,
    file_size: u64,
    preferred_frame_size: usize,
    play_time_per_frame: Duration,
    is_seekable: bool,
    elapsed_play_time: Duration,
    limit_num_bytes_to_stream: bool,
    num_bytes_to_stream: u64,
    force_eof: bool,
    have_started_reading: bool,
}

/// Reads raw bytes off disk, honoring a preferred frame size (0 =
/// unspecified), a play-time-per-frame used to advance presentation time,
/// and an optional byte limit set by a prior seek.
pub struct ByteStreamFileSource {
    shared: Arc<Mutex<Shared>>,
    scheduler: Scheduler,
    start_time: Instant,
    pending: Arc<Mutex<Option<TaskToken>>>,
    stopped: Arc<AtomicBool>,
    awaiting: bool,
}

impl ByteStreamFileSource {
    /// Opens `path` and determines its size. `play_time_per_frame` of zero
    /// means frames are not presentation-time-spaced (e.g. for non-realtime
    /// delivery).
    pub fn new(path: impl AsRef<Path>, scheduler: Scheduler) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let is_seekable = file.try_clone().is_ok();
        Ok(ByteStreamFileSource {
            shared: Arc::new(Mutex::new(Shared {
                file,
                file_size: metadata.len(),
                preferred_frame_size: 0,
                play_time_per_frame: Duration::ZERO,
                is_seekable,
                elapsed_play_time: Duration::ZERO,
                limit_num_bytes_to_stream: false,
                num_bytes_to_stream: 0,
                force_eof: false,
                have_started_reading: false,
            })),
            scheduler,
            start_time: Instant::now(),
            pending: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
            awaiting: false,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.shared.lock().file_size
    }

    pub fn set_preferred_frame_size(&mut self, size: usize) {
        self.shared.lock().preferred_frame_size = size;
    }

    pub fn set_play_time_per_frame(&mut self, duration: Duration) {
        self.shared.lock().play_time_per_frame = duration;
    }

    /// Seeks to an absolute byte offset. `num_bytes_to_stream == 0` means
    /// "stream until EOF".
    pub fn seek_to_byte_absolute(&mut self, byte_number: u64, num_bytes_to_stream: u64) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.file.seek(SeekFrom::Start(byte_number))?;
        shared.limit_num_bytes_to_stream = num_bytes_to_stream > 0;
        shared.num_bytes_to_stream = num_bytes_to_stream;
        shared.force_eof = false;
        Ok(())
    }

    /// Seeks relative to the current position.
    pub fn seek_to_byte_relative(&mut self, offset: i64, num_bytes_to_stream: u64) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.file.seek(SeekFrom::Current(offset))?;
        shared.limit_num_bytes_to_stream = num_bytes_to_stream > 0;
        shared.num_bytes_to_stream = num_bytes_to_stream;
        shared.force_eof = false;
        Ok(())
    }

    /// Forces end-of-stream on the next read, without actually moving the
    /// file position (mirrors `ByteStreamFileSource::seekToEnd`, used when a
    /// client's PAUSE/TEARDOWN races with an in-flight read).
    pub fn seek_to_end(&mut self) {
        self.shared.lock().force_eof = true;
    }
}

impl FramedSource for ByteStreamFileSource {
    fn get_next_frame(
        &mut self,
        to: FrameBuffer,
        max_size: usize,
        after_getting: AfterGettingFn,
        on_close: OnCloseFn,
    ) {
        self.awaiting = true;
        let shared = self.shared.clone();
        let stopped = self.stopped.clone();
        let pending = self.pending.clone();
        let start_time = self.start_time;

        let token = self.scheduler.schedule_delayed(Duration::ZERO, move || {
            *pending.lock() = None;
            if stopped.load(Ordering::SeqCst) {
                return;
            }

            let mut shared = shared.lock();
            if shared.force_eof {
                drop(shared);
                on_close();
                return;
            }

            let mut want = max_size;
            if shared.preferred_frame_size > 0 {
                want = want.min(shared.preferred_frame_size);
            }
            if shared.limit_num_bytes_to_stream {
                want = want.min(shared.num_bytes_to_stream as usize);
            }

            if want == 0 {
                drop(shared);
                on_close();
                return;
            }

            let mut buf = vec![0u8; want];
            let n = match shared.file.read(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "byte-stream file source read failed");
                    0
                }
            };

            if n == 0 {
                drop(shared);
                on_close();
                return;
            }

            shared.have_started_reading = true;
            if shared.limit_num_bytes_to_stream {
                shared.num_bytes_to_stream -= n as u64;
            }
            let presentation_time = start_time + shared.elapsed_play_time;
            let duration = shared.play_time_per_frame;
            shared.elapsed_play_time += duration;
            drop(shared);

            to.lock()[..n].copy_from_slice(&buf[..n]);
            after_getting(FrameDelivery {
                frame_size: n,
                num_truncated_bytes: 0,
                presentation_time,
                duration,
            });
        });
        *self.pending.lock() = Some(token);
    }

    fn stop_getting_frames(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
        self.awaiting = false;
        // A later get_next_frame must restart cleanly.
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.awaiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    fn temp_file(contents: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rtsp_rs_test_{:p}", contents));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn reads_whole_small_file_in_one_frame() {
        let path = temp_file(b"hello world");
        let scheduler = Scheduler::new();
        let mut source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();
        assert_eq!(source.file_size(), 11);

        let buf = crate::media::framed_source::new_frame_buffer(1024);
        let (tx, rx) = mpsc::channel();
        source.get_next_frame(
            buf.clone(),
            1024,
            Box::new(move |delivery| tx.send(delivery).unwrap()),
            Box::new(|| panic!("unexpected close")),
        );
        let delivery = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivery.frame_size, 11);
        assert_eq!(&buf.lock()[..11], b"hello world");
        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn honors_preferred_frame_size() {
        let path = temp_file(&vec![7u8; 100]);
        let scheduler = Scheduler::new();
        let mut source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();
        source.set_preferred_frame_size(10);

        let buf = crate::media::framed_source::new_frame_buffer(1024);
        let (tx, rx) = mpsc::channel();
        source.get_next_frame(
            buf,
            1024,
            Box::new(move |delivery| tx.send(delivery).unwrap()),
            Box::new(|| panic!("unexpected close")),
        );
        let delivery = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(delivery.frame_size, 10);
        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn seek_to_end_forces_close() {
        let path = temp_file(b"data");
        let scheduler = Scheduler::new();
        let mut source = ByteStreamFileSource::new(&path, scheduler.clone()).unwrap();
        source.seek_to_end();

        let buf = crate::media::framed_source::new_frame_buffer(16);
        let (tx, rx) = mpsc::channel();
        source.get_next_frame(
            buf,
            16,
            Box::new(|_| panic!("unexpected frame")),
            Box::new(move || tx.send(()).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        scheduler.shutdown();
        let _ = std::fs::remove_file(path);
    }
}
