//! Handles for work running in the background.
//!
//! A [`Task`] is the caller's side: it can be polled for completion and
//! progress, or awaited. The [`TaskCompleter`] is the worker's side. A
//! completer dropped without a result resolves the task to `Abandoned`.

use crate::error::{VboxError, VboxResult};
use crate::parse::ProgressTracker;
use crate::transport::LiveOutput;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Create a linked completer/task pair.
pub fn task<T>(label: impl Into<String>) -> (TaskCompleter<T>, Task<T>) {
    let label = label.into();
    let (tx, rx) = oneshot::channel();
    let (progress_tx, progress_rx) = watch::channel(None);
    let finished = Arc::new(AtomicBool::new(false));
    (
        TaskCompleter {
            label: label.clone(),
            tx: Some(tx),
            progress: Arc::new(progress_tx),
            finished: Arc::clone(&finished),
        },
        Task {
            label,
            rx,
            progress: progress_rx,
            finished,
        },
    )
}

// ─── Task ────────────────────────────────────────────────────────────

pub struct Task<T> {
    label: String,
    rx: oneshot::Receiver<VboxResult<T>>,
    progress: watch::Receiver<Option<u8>>,
    finished: Arc<AtomicBool>,
}

impl<T: Send + 'static> Task<T> {
    /// Run `work` on the runtime, handing it a reporter for progress.
    pub fn spawn<F, Fut>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = VboxResult<T>> + Send + 'static,
    {
        let (completer, task) = task(label);
        let fut = work(completer.reporter());
        tokio::spawn(async move {
            completer.complete(fut.await);
        });
        task
    }

    /// A task that is already finished.
    pub fn ready(label: impl Into<String>, result: VboxResult<T>) -> Self {
        let (completer, task) = task(label);
        completer.complete(result);
        task
    }
}

impl<T> Task<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a result (or abandonment) is available.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Last reported percentage, if the work reports any.
    pub fn progress(&self) -> Option<u8> {
        *self.progress.borrow()
    }

    pub async fn wait(self) -> VboxResult<T> {
        let label = self.label;
        self.rx.await.unwrap_or_else(|_| Err(VboxError::abandoned(&label)))
    }

    /// Take the result without waiting. `None` while still running.
    pub fn try_take(&mut self) -> Option<VboxResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(VboxError::abandoned(&self.label)))
            }
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("finished", &self.is_finished())
            .field("progress", &self.progress())
            .finish()
    }
}

// ─── Completer ───────────────────────────────────────────────────────

pub struct TaskCompleter<T> {
    label: String,
    tx: Option<oneshot::Sender<VboxResult<T>>>,
    progress: Arc<watch::Sender<Option<u8>>>,
    finished: Arc<AtomicBool>,
}

impl<T> TaskCompleter<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            tx: Arc::clone(&self.progress),
        }
    }

    /// Marks the task finished before the result becomes visible, so a
    /// caller holding the result always sees `is_finished()`.
    pub fn complete(mut self, result: VboxResult<T>) {
        self.finished.store(true, Ordering::Release);
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped its handle; nothing to do then.
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
    }
}

// ─── Progress ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Option<u8>>>,
}

impl ProgressReporter {
    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, percent: u8) {
        self.tx.send_replace(Some(percent.min(100)));
    }

    /// Live sinks that turn a `N%...` output stream into progress updates.
    ///
    /// The tracking task ends once the command drops its copies of the
    /// returned sinks.
    pub fn track_output(&self) -> LiveOutput {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut tracker = ProgressTracker::new();
            while let Some(chunk) = rx.recv().await {
                if let Some(p) = tracker.push(&chunk) {
                    reporter.set(p);
                }
            }
        });
        LiveOutput::both(tx)
    }
}

// ─── Operation ───────────────────────────────────────────────────────

/// A long-running command with two completion points: `command` resolves
/// when the remote tool accepted (or rejected) the command, `settled` once
/// the entity state has been refreshed afterwards.
#[derive(Debug)]
pub struct Operation<T = ()> {
    pub command: Task<T>,
    pub settled: Task<()>,
}

impl<T> Operation<T> {
    /// Wait for both completion points; the command's result wins.
    pub async fn wait(self) -> VboxResult<T> {
        let result = self.command.wait().await;
        // A failed command never schedules a refresh, so `settled`
        // reports the same failure; only the command's result matters.
        let _ = self.settled.wait().await;
        result
    }
}
