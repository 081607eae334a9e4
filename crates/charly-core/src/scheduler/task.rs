//! Tasks, fibers and timer entries

use crate::heap::CellRef;
use crate::value::Value;
use std::time::{Duration, Instant};

/// Most arguments a callback task can pre-bind
pub const MAX_TASK_ARGS: usize = 4;

/// A unit of pending work in the scheduler queue
#[derive(Debug, Clone)]
pub enum VmTask {
    /// Call a function value with pre-bound arguments
    Callback {
        /// Unique task id
        uid: u64,
        /// The callable
        func: Value,
        /// Pre-bound arguments, valid up to `argc`
        args: [Value; MAX_TASK_ARGS],
        /// Number of bound arguments
        argc: u8,
    },
    /// Resume a suspended fiber
    FiberResume {
        /// Fiber id allocated at suspension
        fiber: u64,
        /// Value the suspension call resolves to
        argument: Value,
    },
}

impl VmTask {
    /// Build a callback task; at most [`MAX_TASK_ARGS`] arguments are bound
    pub fn callback(uid: u64, func: Value, arguments: &[Value]) -> Self {
        let mut args = [Value::null(); MAX_TASK_ARGS];
        let argc = arguments.len().min(MAX_TASK_ARGS);
        args[..argc].copy_from_slice(&arguments[..argc]);
        VmTask::Callback {
            uid,
            func,
            args,
            argc: argc as u8,
        }
    }

    /// Build a fiber-resume task
    pub fn fiber_resume(fiber: u64, argument: Value) -> Self {
        VmTask::FiberResume { fiber, argument }
    }

    /// Push the heap values this task keeps alive
    pub fn trace_roots(&self, out: &mut Vec<Value>) {
        match self {
            VmTask::Callback { func, args, argc, .. } => {
                out.push(*func);
                out.extend_from_slice(&args[..*argc as usize]);
            }
            VmTask::FiberResume { argument, .. } => {
                out.push(*argument);
            }
        }
    }
}

/// A suspended interpreter state
///
/// The operand stack is moved out of the machine at suspension (the live
/// stack shrinks by exactly this amount) and moved back at resume.
#[derive(Debug)]
pub struct Fiber {
    /// Fiber id
    pub id: u64,
    /// Moved-out operand stack
    pub stack: Vec<Value>,
    /// Saved frame chain head
    pub frame: Option<CellRef>,
    /// Saved catch-table chain head
    pub catchtable: Option<CellRef>,
    /// Offset execution continues from
    pub resume_address: usize,
}

impl Fiber {
    /// Push the heap values this fiber keeps alive
    pub fn trace_roots(&self, out: &mut Vec<Value>) {
        out.extend(self.stack.iter().copied());
        if let Some(frame) = self.frame {
            out.push(Value::cell(frame));
        }
        if let Some(table) = self.catchtable {
            out.push(Value::cell(table));
        }
    }
}

/// Ordering key for timers and tickers
///
/// Deadline first, then the allocation sequence so simultaneous entries fire
/// in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    /// Absolute fire time (steady clock)
    pub deadline: Instant,
    /// Insertion sequence for deterministic ties
    pub seq: u64,
}

/// A one-shot timer entry
#[derive(Debug, Clone)]
pub struct TimerEntry {
    /// Id returned to the registrant for cancellation
    pub id: u64,
    /// Task enqueued when the timer fires
    pub task: VmTask,
}

/// A periodic ticker entry
#[derive(Debug, Clone)]
pub struct TickerEntry {
    /// Id returned to the registrant for cancellation
    pub id: u64,
    /// Task enqueued on every fire
    pub task: VmTask,
    /// Interval between fires
    pub period: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_binds_at_most_four_args() {
        let args: Vec<Value> = (0..6).map(Value::integer).collect();
        let task = VmTask::callback(1, Value::null(), &args);
        match task {
            VmTask::Callback { argc, args, .. } => {
                assert_eq!(argc, 4);
                assert_eq!(args[3], Value::integer(3));
            }
            _ => panic!("expected callback"),
        }
    }

    #[test]
    fn test_task_roots() {
        let func = Value::cell(CellRef::new(1));
        let arg = Value::cell(CellRef::new(2));
        let task = VmTask::callback(1, func, &[arg]);

        let mut roots = Vec::new();
        task.trace_roots(&mut roots);
        assert!(roots.contains(&func));
        assert!(roots.contains(&arg));
    }

    #[test]
    fn test_timer_key_ordering() {
        let now = Instant::now();
        let a = TimerKey { deadline: now, seq: 1 };
        let b = TimerKey { deadline: now, seq: 2 };
        let c = TimerKey {
            deadline: now + Duration::from_millis(1),
            seq: 0,
        };

        assert!(a < b, "ties break by insertion order");
        assert!(b < c, "earlier deadlines order first");
    }
}
