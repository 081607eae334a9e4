//! Virtual machine
//!
//! [`Machine`] is the interpreter context: heap, operand stack, frame and
//! catch-table chains, globals, primitive classes and the scheduler. The
//! dispatch loop and per-opcode semantics live in [`interpreter`]; value
//! construction, member lookup and control-stack plumbing live in
//! [`machine`].

pub mod interpreter;
pub mod machine;

pub use machine::{Machine, MachineOptions, Primitives};

use crate::scheduler::WorkerValue;
use crate::value::Value;
use crate::VmResult;

/// Most positional arguments a host function can receive
pub const MAX_HOST_ARGS: usize = 20;

/// Main-thread host function: machine facade, receiver, arguments
pub type MainHostFn = fn(&mut Machine, Value, &[Value]) -> VmResult<Value>;

/// Worker-side host function: pure transform over snapshot values
pub type WorkerHostFn = fn(&[WorkerValue]) -> Result<WorkerValue, String>;

/// The native target of a CFunction
///
/// The variant encodes the thread policy: `Main` requires the interpreter
/// thread (it receives the machine facade), `Blocking` may only run on a
/// worker thread, and `Pure` is a data transform that runs anywhere.
#[derive(Clone, Copy)]
pub enum HostCallable {
    /// Main-thread only; receives the machine facade
    Main(MainHostFn),
    /// Runs on any thread; pure snapshot transform
    Pure(WorkerHostFn),
    /// Worker-thread only; blocking snapshot transform
    Blocking(WorkerHostFn),
}

impl HostCallable {
    /// Whether the interpreter thread may invoke this callable directly
    pub fn callable_on_main(&self) -> bool {
        matches!(self, HostCallable::Main(_) | HostCallable::Pure(_))
    }

    /// Whether a worker thread may invoke this callable
    pub fn callable_on_worker(&self) -> bool {
        matches!(self, HostCallable::Pure(_) | HostCallable::Blocking(_))
    }

    /// Policy name for diagnostics
    pub fn policy_name(&self) -> &'static str {
        match self {
            HostCallable::Main(_) => "main",
            HostCallable::Pure(_) => "both",
            HostCallable::Blocking(_) => "worker",
        }
    }
}

impl std::fmt::Debug for HostCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostCallable::{}", self.policy_name())
    }
}
