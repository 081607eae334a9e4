//! Cooperative task scheduler
//!
//! The scheduler owns four collections: the FIFO task queue (shared with
//! worker threads behind a mutex and condition variable), the one-shot timer
//! map, the periodic ticker map, and the suspended-fiber table. The main loop
//! itself is driven by the machine, which pops tasks here and runs the
//! interpreter over them; this module only manages state and wakeups.

pub mod task;
pub mod worker;

pub use task::{Fiber, TickerEntry, TimerEntry, TimerKey, VmTask, MAX_TASK_ARGS};
pub use worker::{WorkerCompletion, WorkerRecord, WorkerValue};

use crate::value::Value;
use crate::vm::WorkerHostFn;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Task, timer, ticker, fiber and worker bookkeeping
pub struct Scheduler {
    shared: Arc<worker::Shared>,
    completions_tx: Sender<WorkerCompletion>,
    completions_rx: Receiver<WorkerCompletion>,
    timers: BTreeMap<TimerKey, TimerEntry>,
    tickers: BTreeMap<TimerKey, TickerEntry>,
    paused: FxHashMap<u64, Fiber>,
    workers: FxHashMap<u64, WorkerRecord>,
    next_uid: u64,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        let (completions_tx, completions_rx) = unbounded();
        Self {
            shared: Arc::new(worker::Shared::default()),
            completions_tx,
            completions_rx,
            timers: BTreeMap::new(),
            tickers: BTreeMap::new(),
            paused: FxHashMap::default(),
            workers: FxHashMap::default(),
            next_uid: 1,
        }
    }

    /// Allocate a unique id (tasks, timers, fibers, workers)
    pub fn next_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    // ========================================================================
    // Task queue
    // ========================================================================

    /// Append a task to the queue and wake the loop
    pub fn enqueue(&self, task: VmTask) {
        self.shared.queue.lock().push_back(task);
        self.shared.notify();
    }

    /// Pop the front task, if any
    pub fn try_pop(&self) -> Option<VmTask> {
        self.shared.queue.lock().pop_front()
    }

    /// Number of queued tasks
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.lock().len()
    }

    // ========================================================================
    // Timers & tickers
    // ========================================================================

    /// Register a one-shot timer; returns its cancellation id
    pub fn register_timer(&mut self, delay: Duration, task: VmTask) -> u64 {
        let id = self.next_uid();
        let seq = self.next_uid();
        let key = TimerKey {
            deadline: Instant::now() + delay,
            seq,
        };
        self.timers.insert(key, TimerEntry { id, task });
        id
    }

    /// Register a periodic ticker; returns its cancellation id
    pub fn register_ticker(&mut self, period: Duration, task: VmTask) -> u64 {
        let id = self.next_uid();
        let seq = self.next_uid();
        let key = TimerKey {
            deadline: Instant::now() + period,
            seq,
        };
        self.tickers.insert(key, TickerEntry { id, task, period });
        id
    }

    /// Cancel a timer; queued callbacks still run
    pub fn clear_timer(&mut self, id: u64) {
        self.timers.retain(|_, entry| entry.id != id);
    }

    /// Cancel a ticker; queued callbacks still run
    pub fn clear_ticker(&mut self, id: u64) {
        self.tickers.retain(|_, entry| entry.id != id);
    }

    /// Enqueue every timer and ticker whose deadline has passed
    ///
    /// Tickers re-arm at `now + period`, so missed periods collapse into a
    /// single fire per drain.
    pub fn drain_due(&mut self, now: Instant) {
        while let Some((&key, _)) = self.timers.iter().next() {
            if key.deadline > now {
                break;
            }
            let entry = self.timers.remove(&key).expect("first timer key exists");
            self.enqueue(entry.task);
        }

        let mut rearmed = Vec::new();
        while let Some((&key, _)) = self.tickers.iter().next() {
            if key.deadline > now {
                break;
            }
            let entry = self.tickers.remove(&key).expect("first ticker key exists");
            self.enqueue(entry.task.clone());
            rearmed.push(entry);
        }
        for entry in rearmed {
            let seq = self.next_uid();
            let key = TimerKey {
                deadline: now + entry.period,
                seq,
            };
            self.tickers.insert(key, entry);
        }
    }

    /// Earliest timer or ticker deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        let timer = self.timers.keys().next().map(|k| k.deadline);
        let ticker = self.tickers.keys().next().map(|k| k.deadline);
        match (timer, ticker) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========================================================================
    // Fibers
    // ========================================================================

    /// Park a suspended fiber
    pub fn park_fiber(&mut self, fiber: Fiber) {
        self.paused.insert(fiber.id, fiber);
    }

    /// Enqueue a resume for a parked fiber
    pub fn resume_fiber(&self, id: u64, argument: Value) {
        self.enqueue(VmTask::fiber_resume(id, argument));
    }

    /// Remove a parked fiber for reinstallation
    pub fn take_fiber(&mut self, id: u64) -> Option<Fiber> {
        self.paused.remove(&id)
    }

    /// Number of parked fibers
    pub fn paused_fibers(&self) -> usize {
        self.paused.len()
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Spawn a worker thread; the callback runs with the result on completion
    pub fn start_worker(
        &mut self,
        func: WorkerHostFn,
        arguments: Vec<WorkerValue>,
        callback: Value,
    ) -> std::io::Result<u64> {
        let id = self.next_uid();
        let handle = worker::spawn_worker(
            id,
            func,
            arguments,
            self.completions_tx.clone(),
            Arc::clone(&self.shared),
        )?;
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                callback,
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    /// Drain finished worker completions
    pub fn poll_completions(&self) -> Vec<WorkerCompletion> {
        self.completions_rx.try_iter().collect()
    }

    /// Retire a worker record, joining its thread; returns the callback
    pub fn finish_worker(&mut self, record: u64) -> Option<Value> {
        let mut record = self.workers.remove(&record)?;
        if let Some(handle) = record.handle.take() {
            let _ = handle.join();
        }
        Some(record.callback)
    }

    /// Number of workers still running or unprocessed
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    // ========================================================================
    // Loop support
    // ========================================================================

    /// Whether nothing remains to execute, wait for or resume
    pub fn is_idle(&self) -> bool {
        self.queued_tasks() == 0
            && self.timers.is_empty()
            && self.tickers.is_empty()
            && self.paused.is_empty()
            && self.workers.is_empty()
            && self.completions_rx.is_empty()
    }

    /// Block until a task is queued, a completion arrives, or the next
    /// timer/ticker deadline passes
    pub fn wait_for_work(&self) {
        let deadline = self.next_deadline();
        let mut queue = self.shared.queue.lock();
        if !queue.is_empty() || !self.completions_rx.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    self.shared
                        .condvar
                        .wait_for(&mut queue, deadline - now);
                }
            }
            None => {
                // Bounded wait so worker completions that raced the lock are
                // picked up promptly
                self.shared
                    .condvar
                    .wait_for(&mut queue, Duration::from_millis(50));
            }
        }
    }

    /// Join every remaining worker thread
    pub fn shutdown(&mut self) {
        let ids: Vec<u64> = self.workers.keys().copied().collect();
        for id in ids {
            self.finish_worker(id);
        }
    }

    /// Push every heap value the scheduler keeps alive
    pub fn trace_roots(&self, out: &mut Vec<Value>) {
        for task in self.shared.queue.lock().iter() {
            task.trace_roots(out);
        }
        for entry in self.timers.values() {
            entry.task.trace_roots(out);
        }
        for entry in self.tickers.values() {
            entry.task.trace_roots(out);
        }
        for fiber in self.paused.values() {
            fiber.trace_roots(out);
        }
        for record in self.workers.values() {
            out.push(record.callback);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
