//! Worker pool: offload blocking work from a module loop, with the second
//! phase of every job returned to the loop as a callback.

use crate::utils::{capture_stack, panic_message, run_guarded, DEFAULT_STACK_TRACE_BYTES};
use anyhow::Context;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Off-loop phase of a submitted job.
pub type Job = Box<dyn FnOnce() + Send>;

/// On-loop phase, executed by the owning loop after the job finishes.
pub type Cb = Box<dyn FnOnce() + Send>;

struct Work {
    f: Job,
    cb: Cb,
}

/// A fixed set of worker threads plus a bounded callback queue back to the
/// owning loop. `new(0)` builds a disabled pool; submitting to it is a
/// programming error.
pub struct Pool {
    job_tx: Option<Sender<Work>>,
    cb_tx: Sender<Cb>,
    cb_rx: Receiver<Cb>,
    pending: Arc<AtomicUsize>,
    stack_trace_bytes: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawn `len` workers. The callback queue is bounded to `len`; workers
    /// block on it when the loop lags, the job queue itself is unbounded so
    /// submission from the loop never blocks.
    pub fn new(len: usize) -> anyhow::Result<Self> {
        let (cb_tx, cb_rx) = bounded(len);
        let pending = Arc::new(AtomicUsize::new(0));

        if len == 0 {
            return Ok(Self {
                job_tx: None,
                cb_tx,
                cb_rx,
                pending,
                stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
                workers: Vec::new(),
            });
        }

        let (job_tx, job_rx) = unbounded::<Work>();
        let mut workers = Vec::with_capacity(len);
        for i in 0..len {
            let job_rx = job_rx.clone();
            let cb_tx = cb_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{i}"))
                .spawn(move || worker_loop(job_rx, cb_tx, DEFAULT_STACK_TRACE_BYTES))
                .with_context(|| format!("failed to spawn pool-worker-{i}"))?;
            workers.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            cb_tx,
            cb_rx,
            pending,
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
            workers,
        })
    }

    /// Bound the stack snapshot logged on recovered callback panics.
    pub fn with_stack_trace_bytes(mut self, bytes: usize) -> Self {
        self.stack_trace_bytes = bytes;
        self
    }

    /// Submit a job: `f` runs on a worker, then `cb` is queued back to the
    /// owning loop.
    pub fn go(&self, f: impl FnOnce() + Send + 'static, cb: impl FnOnce() + Send + 'static) {
        let Some(job_tx) = &self.job_tx else {
            panic!("worker pool is disabled (len = 0)");
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = job_tx.send(Work {
            f: Box::new(f),
            cb: Box::new(cb),
        });
    }

    /// A sub-pool with one dedicated worker: jobs submitted through it
    /// execute, and their callbacks return, in submission order.
    pub fn new_linear_context(&self) -> anyhow::Result<LinearContext> {
        if self.job_tx.is_none() {
            panic!("worker pool is disabled (len = 0)");
        }
        let (job_tx, job_rx) = unbounded::<Work>();
        let cb_tx = self.cb_tx.clone();
        let stack_trace_bytes = self.stack_trace_bytes;
        thread::Builder::new()
            .name("pool-linear".to_string())
            .spawn(move || worker_loop(job_rx, cb_tx, stack_trace_bytes))
            .context("failed to spawn pool-linear worker")?;
        Ok(LinearContext {
            job_tx,
            pending: self.pending.clone(),
        })
    }

    /// The callback queue, for the owning loop's select.
    pub fn callback_queue(&self) -> &Receiver<Cb> {
        &self.cb_rx
    }

    /// Run one returned callback on the loop thread.
    pub fn cb(&mut self, cb: Cb) {
        if let Err(payload) = run_guarded(cb) {
            let msg = panic_message(&payload);
            match capture_stack(self.stack_trace_bytes) {
                Some(stack) => tracing::error!("[Pool] callback panicked: {msg}: {stack}"),
                None => tracing::error!("[Pool] callback panicked: {msg}"),
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drain callbacks until no submitted job is pending in either phase.
    pub fn close(&mut self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            match self.cb_rx.recv() {
                Ok(cb) => self.cb(cb),
                Err(_) => break,
            }
        }
    }

    pub fn idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Disconnect the job queue so workers exit their recv loop, and keep
        // the callback queue drained so none of them stays blocked on a
        // delivery nobody will consume.
        self.job_tx.take();
        while self.workers.iter().any(|h| !h.is_finished()) {
            while self.cb_rx.try_recv().is_ok() {}
            thread::yield_now();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Handle to a single-worker sub-pool. Dropping it retires the worker once
/// its queue drains.
pub struct LinearContext {
    job_tx: Sender<Work>,
    pending: Arc<AtomicUsize>,
}

impl LinearContext {
    /// Submit a job to the dedicated worker, preserving submission order
    /// through execution and callback delivery.
    pub fn go(&self, f: impl FnOnce() + Send + 'static, cb: impl FnOnce() + Send + 'static) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.job_tx.send(Work {
            f: Box::new(f),
            cb: Box::new(cb),
        });
    }
}

fn worker_loop(job_rx: Receiver<Work>, cb_tx: Sender<Cb>, stack_trace_bytes: usize) {
    while let Ok(work) = job_rx.recv() {
        if let Err(payload) = run_guarded(work.f) {
            let msg = panic_message(&payload);
            match capture_stack(stack_trace_bytes) {
                Some(stack) => tracing::error!("[Pool] job panicked: {msg}: {stack}"),
                None => tracing::error!("[Pool] job panicked: {msg}"),
            }
        }
        // The callback is delivered even when the job panicked, so the
        // pending count always unwinds through the loop.
        if cb_tx.send(work.cb).is_err() {
            break;
        }
    }
}
