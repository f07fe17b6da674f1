//! Foreground dispatch queue: background tasks post callbacks, the host's main loop drains them.
//!
//! Two buffers trade places under one short lock per drain, so producers wait for a swap at
//! most and never for callback execution. Callbacks posted while draining land in the fresh
//! pending buffer and run on the next drain.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

/// Work handed to the foreground.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Resumable unit of work produced by an invocation, stepped by the foreground.
pub type Task = BoxFuture<'static, ()>;

/// Host-side execution context: where inbound invocations end up running.
pub trait ExecutionContext: Send + Sync {
    /// Queue `callback` for the foreground. Must not block beyond a short critical section.
    fn post(&self, callback: Callback);

    /// Take ownership of a resumable task returned by an invocation.
    fn schedule(&self, task: Task);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Double-buffered callback queue plus frame-stepped tasks.
pub struct DispatchQueue {
    pending: Mutex<Vec<Callback>>,
    /// Spare buffer; only the draining thread touches it.
    running: Mutex<Vec<Callback>>,
    has_work: AtomicBool,
    tasks: Mutex<Vec<Task>>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(8)),
            running: Mutex::new(Vec::with_capacity(8)),
            has_work: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Append a callback to the pending buffer.
    pub fn post(&self, callback: Callback) {
        let mut pending = lock(&self.pending);
        pending.push(callback);
        self.has_work.store(true, Ordering::Release);
    }

    /// Cheap check for the host loop before calling [`DispatchQueue::drain_and_run`].
    pub fn has_pending_work(&self) -> bool {
        self.has_work.load(Ordering::Acquire) || !lock(&self.tasks).is_empty()
    }

    /// Number of callbacks waiting for the next drain.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Foreground only. Runs every callback posted before the swap, in post order, then
    /// steps each scheduled task once. Returns the number of callbacks run.
    pub fn drain_and_run(&self) -> usize {
        let mut batch = std::mem::take(&mut *lock(&self.running));
        {
            let mut pending = lock(&self.pending);
            std::mem::swap(&mut *pending, &mut batch);
            // Cleared under the lock so a concurrent post cannot be hidden.
            self.has_work.store(false, Ordering::Release);
        }

        let ran = batch.len();
        for callback in batch.drain(..) {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                log::error!("posted callback panicked");
            }
        }
        *lock(&self.running) = batch;

        self.step_tasks();
        ran
    }

    fn step_tasks(&self) {
        let mut stepping = std::mem::take(&mut *lock(&self.tasks));
        if stepping.is_empty() {
            return;
        }
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        stepping.retain_mut(|task| {
            match catch_unwind(AssertUnwindSafe(|| task.poll_unpin(&mut cx))) {
                Ok(Poll::Ready(())) => false,
                Ok(Poll::Pending) => true,
                Err(_) => {
                    log::error!("scheduled task panicked");
                    false
                }
            }
        });
        let mut tasks = lock(&self.tasks);
        // Tasks scheduled while stepping go after the survivors.
        stepping.append(&mut tasks);
        *tasks = stepping;
    }
}

impl ExecutionContext for DispatchQueue {
    fn post(&self, callback: Callback) {
        DispatchQueue::post(self, callback);
    }

    fn schedule(&self, task: Task) {
        lock(&self.tasks).push(task);
    }
}
