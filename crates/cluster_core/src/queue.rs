//! Single-consumer message queue.
//!
//! Decouples network I/O (many producing tasks) from business-logic
//! execution (one cooperative consumer loop). Because there is exactly
//! one consumer, handler execution is totally ordered process-wide;
//! handlers never need locking against each other but must not block.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info};

use crate::context::HandlerContext;
use crate::error::NetError;

/// Queue capacity; producers get [`NetError::WriteTooBusy`] beyond it.
pub const QUEUE_CAPACITY: usize = 32 * 1024;

/// How long [`QueueConsumer::run_once`] waits for a task before
/// returning, so the host loop can interleave timers and shutdown
/// checks.
pub const POP_TIMEOUT: Duration = Duration::from_millis(40);

/// Per-id statistics are logged and reset on this period.
pub const STATS_FLUSH_PERIOD: Duration = Duration::from_secs(600);

/// The single global pre-handler, invoked before every dispatched
/// message. May mark the context failed to short-circuit the handler.
pub type Hook = Arc<dyn Fn(&mut HandlerContext) + Send + Sync>;

/// One decoded, ready-to-run unit of work.
pub type Task = Box<dyn FnOnce(&mut HandlerContext) + Send>;

/// A dispatched message waiting for the consumer.
pub struct QueuedTask {
    pub id: String,
    pub ctx: HandlerContext,
    pub hook: Option<Hook>,
    pub task: Task,
}

/// Creates the producer/consumer pair for one process.
pub fn message_queue() -> (QueueSender, QueueConsumer) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        QueueSender { tx },
        QueueConsumer {
            rx,
            stats: HashMap::new(),
            last_flush: Instant::now(),
        },
    )
}

/// Producer half; clone freely across connection tasks.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<QueuedTask>,
}

impl QueueSender {
    /// Enqueues without blocking; dispatch must return immediately
    /// relative to handler execution.
    pub fn push(&self, task: QueuedTask) -> Result<(), NetError> {
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => NetError::WriteTooBusy,
            mpsc::error::TrySendError::Closed(_) => NetError::Closed,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CmdStat {
    calls: u64,
    total: Duration,
}

/// Consumer half; owned by the process host loop, never shared.
pub struct QueueConsumer {
    rx: mpsc::Receiver<QueuedTask>,
    stats: HashMap<String, CmdStat>,
    last_flush: Instant,
}

impl QueueConsumer {
    /// Pulls and runs at most one task, waiting up to [`POP_TIMEOUT`].
    ///
    /// Runs the hook, then the handler unless the hook failed the
    /// context. A panicking handler is caught and logged at this
    /// run-loop boundary and never crashes the process. Returns
    /// whether a task ran.
    pub async fn run_once(&mut self) -> bool {
        let queued = match timeout(POP_TIMEOUT, self.rx.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) | Err(_) => {
                self.maybe_flush_stats();
                return false;
            }
        };

        let QueuedTask {
            id,
            mut ctx,
            hook,
            task,
        } = queued;

        let started = Instant::now();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(hook) = hook {
                hook(&mut ctx);
            }
            if !ctx.is_failed() {
                task(&mut ctx);
            }
        }));
        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("handler for '{id}' panicked: {message}");
        }

        let stat = self.stats.entry(id).or_default();
        stat.calls += 1;
        stat.total += started.elapsed();

        self.maybe_flush_stats();
        true
    }

    /// Drains whatever is immediately available; test and shutdown
    /// helper.
    pub async fn drain(&mut self) -> usize {
        let mut ran = 0;
        while self.run_once().await {
            ran += 1;
        }
        ran
    }

    fn maybe_flush_stats(&mut self) {
        if self.last_flush.elapsed() < STATS_FLUSH_PERIOD || self.stats.is_empty() {
            return;
        }
        let mut ids: Vec<_> = self.stats.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let stat = self.stats[&id];
            info!(
                "📊 '{}': {} calls, {:?} total",
                id, stat.calls, stat.total
            );
        }
        self.stats.clear();
        self.last_flush = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task_counting(counter: Arc<AtomicUsize>) -> Task {
        Box::new(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_hook_then_handler() {
        let (tx, mut consumer) = message_queue();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let hook_order = order.clone();
        let hook: Hook = Arc::new(move |_ctx| hook_order.lock().unwrap().push("hook"));
        let task_order = order.clone();
        tx.push(QueuedTask {
            id: "Test".into(),
            ctx: HandlerContext::default(),
            hook: Some(hook),
            task: Box::new(move |_ctx| task_order.lock().unwrap().push("handler")),
        })
        .unwrap();

        assert!(consumer.run_once().await);
        assert_eq!(*order.lock().unwrap(), vec!["hook", "handler"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_hook_short_circuits_the_handler() {
        let (tx, mut consumer) = message_queue();
        let counter = Arc::new(AtomicUsize::new(0));

        let hook: Hook = Arc::new(|ctx| ctx.fail());
        tx.push(QueuedTask {
            id: "Test".into(),
            ctx: HandlerContext::default(),
            hook: Some(hook),
            task: task_counting(counter.clone()),
        })
        .unwrap();

        assert!(consumer.run_once().await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_handler_does_not_kill_the_consumer() {
        let (tx, mut consumer) = message_queue();
        let counter = Arc::new(AtomicUsize::new(0));

        tx.push(QueuedTask {
            id: "Boom".into(),
            ctx: HandlerContext::default(),
            hook: None,
            task: Box::new(|_ctx| panic!("handler exploded")),
        })
        .unwrap();
        tx.push(QueuedTask {
            id: "After".into(),
            ctx: HandlerContext::default(),
            hook: None,
            task: task_counting(counter.clone()),
        })
        .unwrap();

        assert!(consumer.run_once().await);
        assert!(consumer.run_once().await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_queue_returns_after_the_poll_timeout() {
        let (_tx, mut consumer) = message_queue();
        let started = Instant::now();
        assert!(!consumer.run_once().await);
        assert!(started.elapsed() >= POP_TIMEOUT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tasks_run_in_fifo_order() {
        let (tx, mut consumer) = message_queue();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            tx.push(QueuedTask {
                id: format!("t{i}"),
                ctx: HandlerContext::default(),
                hook: None,
                task: Box::new(move |_ctx| order.lock().unwrap().push(i)),
            })
            .unwrap();
        }
        assert_eq!(consumer.drain().await, 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
