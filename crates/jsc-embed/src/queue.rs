//! Serial work queue with a dedicated engine thread
//!
//! Every engine call for a context (or a context group) runs on one worker
//! thread owned by a [`SerialWorkQueue`]. Callers either block on
//! [`run_sync`](SerialWorkQueue::run_sync) or fire and forget with
//! [`run_async`](SerialWorkQueue::run_async). Units run strictly in
//! submission order.
//!
//! Between units, and whenever the queue has been idle for the configured
//! tick interval, the worker runs its registered tick hooks. The embedding
//! context uses one to drain deferred releases.
//!
//! # Example
//!
//! ```
//! use jsc_embed::{EmbedConfig, SerialWorkQueue};
//!
//! let queue = SerialWorkQueue::new(&EmbedConfig::default()).unwrap();
//! let answer = queue.run_sync(|| Ok(6 * 7)).unwrap();
//! assert_eq!(answer, 42);
//! queue.quit();
//! ```

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info_span, trace};

use crate::config::EmbedConfig;
use crate::error::{EmbedError, EmbedResult};

type Unit = Box<dyn FnOnce() + Send>;

/// Background hook run by the worker. Returning `false` unregisters it.
pub type TickHook = Arc<dyn Fn() -> bool + Send + Sync>;

enum Message {
    Run(Unit),
    Quit,
}

/// Lifecycle of a work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting and running work
    Running,
    /// `quit()` was called; already enqueued work still runs
    Draining,
    /// The worker has exited
    Stopped,
}

/// Statistics about queue operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Units accepted by the queue
    pub units_submitted: AtomicU64,
    /// Units that finished running (successfully, with an error, or by panicking)
    pub units_completed: AtomicU64,
    /// Units that returned an error or panicked
    pub units_failed: AtomicU64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            units_submitted: self.units_submitted.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub units_submitted: u64,
    pub units_completed: u64,
    pub units_failed: u64,
}

impl QueueStatsSnapshot {
    /// Get the success rate as a percentage (0.0 - 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.units_completed == 0 {
            100.0
        } else {
            let succeeded = self.units_completed - self.units_failed;
            (succeeded as f64 / self.units_completed as f64) * 100.0
        }
    }

    /// Units submitted but not yet finished
    pub fn units_in_flight(&self) -> u64 {
        self.units_submitted.saturating_sub(self.units_completed)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    hooks: Mutex<Vec<(u64, TickHook)>>,
    next_hook: AtomicU64,
    stats: QueueStats,
}

/// Single worker thread executing units of work in FIFO order
pub struct SerialWorkQueue {
    tx: Sender<Message>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    name: String,
}

impl SerialWorkQueue {
    /// Spawn the worker thread
    pub fn new(config: &EmbedConfig) -> EmbedResult<Self> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::Running),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            stats: QueueStats::new(),
        });

        let worker_shared = shared.clone();
        let tick = config.tick_duration();
        let handle = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_worker(rx, worker_shared, tick))
            .map_err(|e| EmbedError::internal(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            tx,
            shared,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
            name: config.thread_name.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }

    /// Whether the caller is running on this queue's worker thread
    pub fn is_worker_thread(&self) -> bool {
        std::thread::current().id() == self.worker_id
    }

    /// Run `unit` on the worker and wait for its result.
    ///
    /// On the worker thread itself the unit runs inline, so units may call
    /// back into the queue that is running them. A panic in the unit is
    /// returned as [`EmbedError::WorkerPanicked`].
    pub fn run_sync<T, F>(&self, unit: F) -> EmbedResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> EmbedResult<T> + Send + 'static,
    {
        if self.is_worker_thread() {
            if self.state() == QueueState::Stopped {
                return Err(EmbedError::QueueClosed);
            }
            self.shared.stats.units_submitted.fetch_add(1, Ordering::Relaxed);
            return execute(&self.shared.stats, unit);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let shared = self.shared.clone();
        self.submit(Box::new(move || {
            let result = execute(&shared.stats, unit);
            let _ = reply_tx.send(result);
        }))?;

        reply_rx.recv().map_err(|_| EmbedError::QueueClosed)?
    }

    /// Enqueue `unit` without waiting for it
    pub fn run_async<F>(&self, unit: F) -> EmbedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared.clone();
        self.submit(Box::new(move || {
            let _ = execute(&shared.stats, || {
                unit();
                Ok(())
            });
        }))
    }

    fn submit(&self, unit: Unit) -> EmbedResult<()> {
        // Held across the send so nothing lands behind the quit message
        let state = self.shared.state.lock();
        if *state != QueueState::Running {
            return Err(EmbedError::QueueClosed);
        }
        self.tx
            .send(Message::Run(unit))
            .map_err(|_| EmbedError::QueueClosed)?;
        self.shared.stats.units_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a background hook; returns its id
    pub fn register_tick(&self, hook: impl Fn() -> bool + Send + Sync + 'static) -> u64 {
        let id = self.shared.next_hook.fetch_add(1, Ordering::Relaxed);
        self.shared.hooks.lock().push((id, Arc::new(hook)));
        id
    }

    pub fn unregister_tick(&self, id: u64) {
        self.shared.hooks.lock().retain(|(hook_id, _)| *hook_id != id);
    }

    /// Stop accepting work, run what is already enqueued, then stop.
    ///
    /// Joins the worker unless called from it. Idempotent.
    pub fn quit(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == QueueState::Running {
                *state = QueueState::Draining;
                let _ = self.tx.send(Message::Quit);
                debug!(name = %self.name, "Work queue draining");
            }
        }

        if self.is_worker_thread() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(name = %self.name, "Work queue thread panicked");
            }
        }
    }
}

impl Drop for SerialWorkQueue {
    fn drop(&mut self) {
        self.quit();
    }
}

fn run_worker(rx: Receiver<Message>, shared: Arc<Shared>, tick: Duration) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("jsc-embed-worker")
        .to_string();

    let _span = info_span!("work_queue", name = %thread_name).entered();
    debug!("Work queue started");

    loop {
        match rx.recv_timeout(tick) {
            Ok(Message::Run(unit)) => {
                unit();
                run_ticks(&shared);
            }
            Ok(Message::Quit) => {
                debug!("Quit received");
                break;
            }
            Err(RecvTimeoutError::Timeout) => run_ticks(&shared),
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Work channel disconnected");
                break;
            }
        }
    }

    *shared.state.lock() = QueueState::Stopped;
    shared.hooks.lock().clear();
    debug!("Work queue stopped");
}

fn run_ticks(shared: &Shared) {
    let hooks: Vec<(u64, TickHook)> = shared.hooks.lock().clone();
    if hooks.is_empty() {
        return;
    }

    let mut finished = Vec::new();
    for (id, hook) in hooks {
        match catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(true) => {}
            Ok(false) => finished.push(id),
            Err(panic) => {
                error!(hook = id, "Tick hook panicked: {}", panic_message(&*panic));
                finished.push(id);
            }
        }
    }

    if !finished.is_empty() {
        trace!(count = finished.len(), "Unregistering tick hooks");
        shared
            .hooks
            .lock()
            .retain(|(id, _)| !finished.contains(id));
    }
}

/// Run a unit with panic handling and record the outcome
fn execute<T, F>(stats: &QueueStats, unit: F) -> EmbedResult<T>
where
    F: FnOnce() -> EmbedResult<T>,
{
    let result = match catch_unwind(AssertUnwindSafe(unit)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&*panic);
            error!("Unit of work panicked: {}", message);
            Err(EmbedError::WorkerPanicked(message))
        }
    };

    stats.units_completed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        stats.units_failed.fetch_add(1, Ordering::Relaxed);
    }
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue() -> SerialWorkQueue {
        SerialWorkQueue::new(&EmbedConfig::default().thread_name("test-queue")).unwrap()
    }

    #[test]
    fn test_run_sync_returns_value() {
        let queue = queue();
        assert_eq!(queue.run_sync(|| Ok("done")).unwrap(), "done");
        let name = queue
            .run_sync(|| Ok(std::thread::current().name().map(str::to_string)))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-queue"));
    }

    #[test]
    fn test_errors_and_panics_are_returned() {
        let queue = queue();
        let err = queue
            .run_sync::<(), _>(|| Err(EmbedError::internal("boom")))
            .unwrap_err();
        assert_eq!(err.error_type(), "InternalError");

        let err = queue.run_sync::<(), _>(|| panic!("kaboom")).unwrap_err();
        assert!(matches!(err, EmbedError::WorkerPanicked(ref msg) if msg == "kaboom"));

        // Still usable after a panic
        assert_eq!(queue.run_sync(|| Ok(1)).unwrap(), 1);

        let stats = queue.stats().snapshot();
        assert_eq!(stats.units_submitted, 3);
        assert_eq!(stats.units_completed, 3);
        assert_eq!(stats.units_failed, 2);
    }

    #[test]
    fn test_inline_on_worker() {
        let queue = Arc::new(queue());
        let inner = queue.clone();
        let nested = queue
            .run_sync(move || {
                assert!(inner.is_worker_thread());
                inner.run_sync(|| Ok(5))
            })
            .unwrap();
        assert_eq!(nested, 5);
        assert!(!queue.is_worker_thread());
    }

    #[test]
    fn test_fifo_async_then_sync() {
        let queue = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = order.clone();
            queue.run_async(move || order.lock().push(i)).unwrap();
        }
        let seen = {
            let order = order.clone();
            queue.run_sync(move || Ok(order.lock().clone())).unwrap()
        };
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_quit_drains_then_rejects() {
        let queue = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            queue
                .run_async(move || {
                    std::thread::sleep(Duration::from_millis(2));
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.quit();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert_eq!(queue.state(), QueueState::Stopped);

        let late = ran.clone();
        let err = queue
            .run_sync(move || {
                late.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EmbedError::QueueClosed));
        assert!(queue.run_async(|| {}).is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 5);

        // Second quit is a no-op
        queue.quit();
    }

    #[test]
    fn test_tick_hooks() {
        let config = EmbedConfig::default().tick_interval(Duration::from_millis(1));
        let queue = SerialWorkQueue::new(&config).unwrap();

        let repeating = Arc::new(AtomicUsize::new(0));
        let once = Arc::new(AtomicUsize::new(0));
        {
            let repeating = repeating.clone();
            queue.register_tick(move || {
                repeating.fetch_add(1, Ordering::SeqCst);
                true
            });
            let once = once.clone();
            queue.register_tick(move || {
                once.fetch_add(1, Ordering::SeqCst);
                false
            });
        }

        std::thread::sleep(Duration::from_millis(50));
        queue.run_sync(|| Ok(())).unwrap();

        assert!(repeating.load(Ordering::SeqCst) >= 2);
        assert_eq!(once.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_tick() {
        let config = EmbedConfig::default().tick_interval(Duration::from_secs(60));
        let queue = SerialWorkQueue::new(&config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = queue.register_tick(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        queue.unregister_tick(id);
        queue.run_sync(|| Ok(())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_success_rate() {
        let snapshot = QueueStatsSnapshot {
            units_submitted: 4,
            units_completed: 4,
            units_failed: 1,
        };
        assert_eq!(snapshot.success_rate(), 75.0);
        assert_eq!(snapshot.units_in_flight(), 0);
    }

    #[test]
    fn test_units_in_flight() {
        let snapshot = QueueStatsSnapshot {
            units_submitted: 5,
            units_completed: 3,
            units_failed: 0,
        };
        assert_eq!(snapshot.units_in_flight(), 2);
    }
}
