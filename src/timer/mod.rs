//! Timers delivered as queue entries: a scheduler thread keeps a deadline
//! heap and pushes fired descriptors into a bounded queue that the owning
//! loop drains. Delivery blocks when the queue is full; fires are not
//! dropped while the dispatcher is alive.

pub use cron::CronExpr;

mod cron;

use crate::utils::{capture_stack, panic_message, run_guarded, DEFAULT_STACK_TRACE_BYTES};
use anyhow::Context;
use chrono::Local;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type TimerCb = Box<dyn FnMut() + Send>;

struct OnceState {
    cancelled: AtomicBool,
    cb: Mutex<TimerCb>,
    stack_trace_bytes: usize,
}

struct CronState {
    stopped: AtomicBool,
    expr: CronExpr,
    cb: Mutex<TimerCb>,
    stack_trace_bytes: usize,
}

/// Handle to a one-shot timer. Stopping it before delivery turns the fire
/// into a no-op; the queue entry is still consumed.
pub struct Timer {
    state: Arc<OnceState>,
}

impl Timer {
    pub fn stop(&self) {
        self.state.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Handle to a re-arming cron timer.
pub struct Cron {
    state: Arc<CronState>,
}

impl Cron {
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone)]
enum FiredKind {
    Once(Arc<OnceState>),
    Cron(Arc<CronState>),
}

/// A timer that reached its deadline, as consumed from the dispatcher queue.
pub struct FiredTimer {
    kind: FiredKind,
}

impl FiredTimer {
    /// Run the timer's callback on the consuming loop, unless it was
    /// cancelled after delivery was scheduled.
    pub fn fire(&self) {
        let (cb, stack_trace_bytes) = match &self.kind {
            FiredKind::Once(state) => {
                if state.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                (&state.cb, state.stack_trace_bytes)
            }
            FiredKind::Cron(state) => {
                if state.stopped.load(Ordering::Relaxed) {
                    return;
                }
                (&state.cb, state.stack_trace_bytes)
            }
        };

        let mut cb = cb.lock();
        if let Err(payload) = run_guarded(|| (*cb)()) {
            let msg = panic_message(&payload);
            match capture_stack(stack_trace_bytes) {
                Some(stack) => tracing::error!("[Timer] callback panicked: {msg}: {stack}"),
                None => tracing::error!("[Timer] callback panicked: {msg}"),
            }
        }
    }
}

enum SchedMsg {
    Once(Arc<OnceState>, Instant),
    Cron(Arc<CronState>),
}

/// Owner of the fired-timer queue. `new(0)` builds a disabled dispatcher;
/// arming timers on it is a programming error.
pub struct Dispatcher {
    // Held so the fired queue never disconnects under the consuming select,
    // even while the facility is disabled or the scheduler has exited.
    _fired_tx: Sender<FiredTimer>,
    fired_rx: Receiver<FiredTimer>,
    sched_tx: Option<Sender<SchedMsg>>,
    stack_trace_bytes: usize,
}

impl Dispatcher {
    pub fn new(len: usize) -> anyhow::Result<Self> {
        let (fired_tx, fired_rx) = bounded(len);

        let sched_tx = if len > 0 {
            let (sched_tx, sched_rx) = unbounded();
            let fired = fired_tx.clone();
            thread::Builder::new()
                .name("timer-dispatcher".to_string())
                .spawn(move || scheduler_loop(sched_rx, fired))
                .context("failed to spawn timer dispatcher")?;
            Some(sched_tx)
        } else {
            None
        };

        Ok(Self {
            _fired_tx: fired_tx,
            fired_rx,
            sched_tx,
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
        })
    }

    /// Bound the stack snapshot logged on recovered timer callback panics.
    pub fn with_stack_trace_bytes(mut self, bytes: usize) -> Self {
        self.stack_trace_bytes = bytes;
        self
    }

    /// The fired-timer queue, for the owning loop's select.
    pub fn fired_queue(&self) -> &Receiver<FiredTimer> {
        &self.fired_rx
    }

    /// Arm a one-shot timer firing after `d`.
    pub fn after_func(&self, d: Duration, cb: impl FnMut() + Send + 'static) -> Timer {
        let Some(sched_tx) = &self.sched_tx else {
            panic!("timer dispatcher is disabled (len = 0)");
        };
        let state = Arc::new(OnceState {
            cancelled: AtomicBool::new(false),
            cb: Mutex::new(Box::new(cb)),
            stack_trace_bytes: self.stack_trace_bytes,
        });
        let _ = sched_tx.send(SchedMsg::Once(state.clone(), Instant::now() + d));
        Timer { state }
    }

    /// Arm a cron timer that re-arms itself after each firing until stopped.
    pub fn cron_func(&self, expr: CronExpr, cb: impl FnMut() + Send + 'static) -> Cron {
        let Some(sched_tx) = &self.sched_tx else {
            panic!("timer dispatcher is disabled (len = 0)");
        };
        let state = Arc::new(CronState {
            stopped: AtomicBool::new(false),
            expr,
            cb: Mutex::new(Box::new(cb)),
            stack_trace_bytes: self.stack_trace_bytes,
        });
        let _ = sched_tx.send(SchedMsg::Cron(state.clone()));
        Cron { state }
    }
}

struct Entry {
    when: Instant,
    seq: u64,
    kind: FiredKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: the earliest deadline pops first, same-deadline entries in
    // submission order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn scheduler_loop(sched_rx: Receiver<SchedMsg>, fired_tx: Sender<FiredTimer>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut connected = true;

    loop {
        // Deliver everything due. A full fired queue blocks here, on the
        // scheduler thread, never dropping a fire.
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.when <= now) {
            let Some(entry) = heap.pop() else { break };
            match entry.kind {
                FiredKind::Once(state) => {
                    let fired = FiredTimer {
                        kind: FiredKind::Once(state),
                    };
                    if fired_tx.send(fired).is_err() {
                        return;
                    }
                }
                FiredKind::Cron(state) => {
                    if state.stopped.load(Ordering::Relaxed) {
                        continue;
                    }
                    let fired = FiredTimer {
                        kind: FiredKind::Cron(state.clone()),
                    };
                    if fired_tx.send(fired).is_err() {
                        return;
                    }
                    if let Some(delay) = next_cron_delay(&state) {
                        seq += 1;
                        heap.push(Entry {
                            when: Instant::now() + delay,
                            seq,
                            kind: FiredKind::Cron(state),
                        });
                    }
                }
            }
        }

        let timeout = heap
            .peek()
            .map(|e| e.when.saturating_duration_since(Instant::now()));

        match (timeout, connected) {
            (None, false) => return,
            (None, true) => match sched_rx.recv() {
                Ok(msg) => insert(&mut heap, &mut seq, msg),
                Err(_) => return,
            },
            (Some(d), false) => thread::sleep(d.min(Duration::from_secs(1))),
            (Some(d), true) => match sched_rx.recv_timeout(d) {
                Ok(msg) => insert(&mut heap, &mut seq, msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => connected = false,
            },
        }
    }
}

fn insert(heap: &mut BinaryHeap<Entry>, seq: &mut u64, msg: SchedMsg) {
    match msg {
        SchedMsg::Once(state, when) => {
            *seq += 1;
            heap.push(Entry {
                when,
                seq: *seq,
                kind: FiredKind::Once(state),
            });
        }
        SchedMsg::Cron(state) => {
            // An expression that never matches arms nothing.
            if let Some(delay) = next_cron_delay(&state) {
                *seq += 1;
                heap.push(Entry {
                    when: Instant::now() + delay,
                    seq: *seq,
                    kind: FiredKind::Cron(state),
                });
            }
        }
    }
}

fn next_cron_delay(state: &CronState) -> Option<Duration> {
    let now = Local::now().naive_local();
    let next = state.expr.next_after(now)?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
}
