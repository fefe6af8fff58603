//! Scheduler capability (C1): timed tasks and deferred work.
//!
//! The distilled design treats the scheduler as a capability abstraction
//! rather than something whose internals are specified — see `SPEC_FULL.md`
//! §1. This implementation grounds that capability in the polling style
//! already used by [`crate::transport::tcp::accept_loop`]: a background
//! thread drains a min-heap of delayed tasks and sleeps until the next one
//! is due, and readability watches are modeled as a delayed task that
//! re-arms itself until its predicate fires.
//!
//! Frame delivery callbacks (§4.1) are always run through
//! [`Scheduler::schedule_delayed`] with a zero delay rather than invoked
//! inline, so that "never synchronously inside the call" holds even for
//! sources (like [`crate::media::byte_stream_file_source`]) whose reads are
//! themselves synchronous.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    due: Instant,
    token: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.token == other.token
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest `due` sorts first.
        other.due.cmp(&self.due).then(other.token.cmp(&self.token))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<ScheduledTask>>,
    cancelled: Mutex<std::collections::HashSet<u64>>,
    cv: Condvar,
    next_token: AtomicU64,
    shutdown: AtomicBool,
}

/// A handle to a scheduled task, used to cancel it idempotently.
#[derive(Clone)]
pub struct TaskToken {
    token: u64,
    inner: Arc<Inner>,
}

impl TaskToken {
    /// Cancels the task. Safe to call more than once, and safe to call
    /// after the task has already run.
    pub fn cancel(&self) {
        self.inner.cancelled.lock().unwrap().insert(self.token);
    }
}

/// Cooperative event-loop capability shared by every component that needs
/// to defer work: `schedule_readable` (approximated here by a re-arming
/// poll) and `schedule_delayed`.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Spawns the background driver thread and returns a handle.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            cancelled: Mutex::new(std::collections::HashSet::new()),
            cv: Condvar::new(),
            next_token: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        let driver = inner.clone();
        thread::Builder::new()
            .name("rtsp-scheduler".into())
            .spawn(move || run_driver(driver))
            .expect("failed to spawn scheduler thread");
        Scheduler { inner }
    }

    /// Schedules `task` to run after `delay`. A `delay` of `Duration::ZERO`
    /// still defers execution to the scheduler thread; it never runs
    /// inline on the caller's thread.
    pub fn schedule_delayed<F>(&self, delay: Duration, task: F) -> TaskToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        let due = Instant::now() + delay;
        self.inner.heap.lock().unwrap().push(ScheduledTask {
            due,
            token,
            task: Box::new(task),
        });
        self.inner.cv.notify_one();
        TaskToken {
            token,
            inner: self.inner.clone(),
        }
    }

    /// Repeatedly polls `predicate` (at `interval`) until it returns
    /// `Some(())`, then runs `on_ready`. Models `schedule_readable` for
    /// sockets that only expose readiness via a non-blocking probe
    /// (matching [`crate::transport::tcp::accept_loop`]'s own poll loop).
    /// Returns a token that cancels the whole watch, including future
    /// re-arms.
    pub fn schedule_readable<P, F>(&self, interval: Duration, predicate: P, on_ready: F) -> TaskToken
    where
        P: Fn() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        let handle = TaskToken {
            token,
            inner: self.inner.clone(),
        };
        self.arm_readable_poll(token, interval, Arc::new(predicate), Some(on_ready));
        handle
    }

    fn arm_readable_poll<F>(
        &self,
        token: u64,
        interval: Duration,
        predicate: Arc<dyn Fn() -> bool + Send + Sync>,
        on_ready: Option<F>,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner.clone();
        let due = Instant::now() + interval;
        let task: Task = Box::new(move || {
            if inner.cancelled.lock().unwrap().contains(&token) {
                return;
            }
            if predicate() {
                if let Some(cb) = on_ready {
                    cb();
                }
                return;
            }
            let scheduler = Scheduler {
                inner: inner.clone(),
            };
            scheduler.arm_readable_poll(token, interval, predicate, on_ready);
        });
        self.inner.heap.lock().unwrap().push(ScheduledTask {
            due,
            token,
            task,
        });
        self.inner.cv.notify_one();
    }

    /// Stops the driver thread. Pending tasks are dropped, not executed.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        self.inner.cv.notify_all();
    }
}

fn run_driver(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(AtomicOrdering::SeqCst) {
            return;
        }
        let mut heap = inner.heap.lock().unwrap();
        let now = Instant::now();
        match heap.peek() {
            None => {
                let (guard, _) = inner
                    .cv
                    .wait_timeout(heap, Duration::from_millis(250))
                    .unwrap();
                heap = guard;
                drop(heap);
            }
            Some(top) if top.due <= now => {
                let scheduled = heap.pop().unwrap();
                drop(heap);
                if !inner.cancelled.lock().unwrap().remove(&scheduled.token) {
                    (scheduled.task)();
                }
            }
            Some(top) => {
                let wait = top.due - now;
                let (guard, _) = inner.cv.wait_timeout(heap, wait).unwrap();
                drop(guard);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn delayed_task_runs() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_delayed(Duration::from_millis(1), move || {
            tx.send(42).unwrap();
        });
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, 42);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel::<()>();
        let token = scheduler.schedule_delayed(Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        });
        token.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.shutdown();
    }

    #[test]
    fn zero_delay_still_defers() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        scheduler.schedule_delayed(Duration::ZERO, move || {
            ran2.store(true, AtomicOrdering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(ran.load(AtomicOrdering::SeqCst));
        scheduler.shutdown();
    }

    #[test]
    fn readable_poll_fires_once_ready() {
        let scheduler = Scheduler::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_readable(
            Duration::from_millis(5),
            move || flag2.load(AtomicOrdering::SeqCst),
            move || tx.send(()).unwrap(),
        );
        thread::sleep(Duration::from_millis(20));
        flag.store(true, AtomicOrdering::SeqCst);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        scheduler.shutdown();
    }
}
