//! Worker threads for blocking host calls
//!
//! A worker thread never touches the heap. Its arguments are snapshot into
//! plain [`WorkerValue`] data before the spawn, the native function runs as a
//! pure transform, and the completion travels back over a channel; the
//! scheduler converts it into heap values on the main thread and enqueues the
//! registered callback.

use crate::vm::WorkerHostFn;
use crate::value::Value;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::task::VmTask;

/// An immutable snapshot of a value crossing the worker boundary
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerValue {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Double
    Float(f64),
    /// Copied string bytes
    Str(String),
}

/// Completion report sent back from a worker thread
#[derive(Debug)]
pub struct WorkerCompletion {
    /// Worker record id
    pub record: u64,
    /// Result of the native call, or the thrown error message
    pub result: Result<WorkerValue, String>,
}

/// Main-thread bookkeeping for one spawned worker
///
/// The record pins the callback for the collector until the completion is
/// processed.
#[derive(Debug)]
pub struct WorkerRecord {
    /// Record id
    pub id: u64,
    /// Callback invoked with the result on the main thread
    pub callback: Value,
    /// Join handle, taken when the completion is processed
    pub handle: Option<JoinHandle<()>>,
}

/// State shared between the scheduler and its worker threads
#[derive(Debug, Default)]
pub struct Shared {
    /// Pending tasks
    pub queue: Mutex<VecDeque<VmTask>>,
    /// Signalled on task enqueue and worker completion
    pub condvar: Condvar,
}

impl Shared {
    /// Wake the scheduler loop
    pub fn notify(&self) {
        self.condvar.notify_all();
    }
}

/// Spawn a worker thread running a blocking host function
pub fn spawn_worker(
    record: u64,
    func: WorkerHostFn,
    arguments: Vec<WorkerValue>,
    completions: Sender<WorkerCompletion>,
    shared: Arc<Shared>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("charly-worker-{}", record))
        .spawn(move || {
            let result = func(&arguments);
            // The scheduler may already be gone during shutdown; a failed
            // send only means nobody is waiting for the result.
            let _ = completions.send(WorkerCompletion { record, result });
            shared.notify();
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn double_it(args: &[WorkerValue]) -> Result<WorkerValue, String> {
        match args.first() {
            Some(WorkerValue::Int(i)) => Ok(WorkerValue::Int(i * 2)),
            _ => Err("expected integer".to_string()),
        }
    }

    #[test]
    fn test_worker_reports_result() {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared::default());

        let handle = spawn_worker(7, double_it, vec![WorkerValue::Int(21)], tx, shared).unwrap();
        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert_eq!(completion.record, 7);
        assert_eq!(completion.result, Ok(WorkerValue::Int(42)));
    }

    #[test]
    fn test_worker_reports_error() {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared::default());

        let handle = spawn_worker(8, double_it, vec![WorkerValue::Null], tx, shared).unwrap();
        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert!(completion.result.is_err());
    }
}
