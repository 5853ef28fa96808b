//! Signaling thread: a named thread that owns session and tunnel state
//!
//! Every decision about a session or a tunnel is taken on one thread.
//! Other threads (peer connection callbacks, socket workers, RPC callers)
//! hand work over with [`SignalingHandle::post`]. Timers are scheduled tasks
//! on the same queue, never sleeps.
//!
//! ```text
//!  worker / caller threads            signaling thread
//!  ───────────────────────            ────────────────
//!  post(task) ──────────────────────► run in FIFO order
//!  post_delayed(200ms, task) ───────► timer heap ──► run at deadline
//!  TaskHandle::cancel() ────────────► skipped when due
//! ```

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// Unit of work run on the signaling thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    Delayed(TimerEntry),
    Shutdown,
}

// ============================================================================
// Timers
// ============================================================================

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Handle to a delayed task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Prevent the task from running. Has no effect once it has run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ============================================================================
// Signaling Thread
// ============================================================================

/// Owner of the signaling thread. Dropping it stops the thread once the
/// tasks already queued have run; pending delayed tasks are discarded.
pub struct SignalingThread {
    handle: SignalingHandle,
    join: Option<JoinHandle<()>>,
}

impl SignalingThread {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(rx))?;

        let handle = SignalingHandle {
            tx,
            thread_id: join.thread().id(),
            next_seq: Arc::new(AtomicU64::new(0)),
        };

        log::debug!("Signaling thread '{}' started", name);

        Ok(SignalingThread {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SignalingHandle {
        self.handle.clone()
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for SignalingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable sender side of a signaling thread
#[derive(Clone)]
pub struct SignalingHandle {
    tx: Sender<Command>,
    thread_id: ThreadId,
    next_seq: Arc<AtomicU64>,
}

impl SignalingHandle {
    /// Queue a task. Returns false once the thread has stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Command::Run(Box::new(task))).is_ok()
    }

    /// Queue a task to run after `delay`
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            task: Box::new(task),
        };
        if self.tx.send(Command::Delayed(entry)).is_err() {
            cancelled.store(true, Ordering::Release);
        }
        TaskHandle { cancelled }
    }

    /// Whether the caller is running on this signaling thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

fn run_loop(rx: Receiver<Command>) {
    let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while timers
            .peek()
            .map(|Reverse(entry)| entry.deadline <= now)
            .unwrap_or(false)
        {
            if let Some(Reverse(entry)) = timers.pop() {
                if !entry.cancelled.load(Ordering::Acquire) {
                    (entry.task)();
                }
            }
        }

        let command = match timers.peek() {
            Some(Reverse(entry)) => {
                rx.recv_timeout(entry.deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Run(task)) => task(),
            Ok(Command::Delayed(entry)) => timers.push(Reverse(entry)),
            Ok(Command::Shutdown) => {
                drain(&rx);
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    log::debug!(
        "Signaling thread '{}' stopped ({} timers dropped)",
        thread::current().name().unwrap_or("?"),
        timers.len()
    );
}

/// Run every task still queued, including tasks they post. Delayed tasks
/// are dropped.
fn drain(rx: &Receiver<Command>) {
    while let Ok(command) = rx.try_recv() {
        if let Command::Run(task) = command {
            task();
        }
    }
}

// ============================================================================
// Thread Checker
// ============================================================================

/// Binds to the first thread that calls [`ThreadChecker::check`] and
/// reports whether later calls come from the same thread.
#[derive(Debug, Default)]
pub struct ThreadChecker {
    owner: OnceLock<ThreadId>,
}

impl ThreadChecker {
    pub const fn new() -> Self {
        Self {
            owner: OnceLock::new(),
        }
    }

    pub fn check(&self) -> bool {
        let current = thread::current().id();
        *self.owner.get_or_init(|| current) == current
    }
}

// ============================================================================
// Tests
// ============================================================================
