//! Charly VM runtime core
//!
//! This crate provides the runtime of the Charly virtual machine:
//! - NaN-boxed value representation
//! - Cell heap with a mark-sweep garbage collector
//! - Frame / catch-table control stack
//! - Bytecode interpreter
//! - Cooperative task, timer, fiber and worker-thread scheduler

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builtins;
pub mod heap;
pub mod scheduler;
pub mod symbol;
pub mod value;
pub mod vm;

pub use heap::{CellKind, CellRef, GcConfig, GcStats, Heap};
pub use symbol::SymbolTable;
pub use value::Value;
pub use vm::{HostCallable, Machine, MachineOptions};

use thiserror::Error;

/// Machine execution errors
///
/// `Exception` is the only recoverable variant: it carries a thrown user
/// value and is consumed by catch-table unwinding inside the dispatch loop.
/// Every other variant is a terminal machine panic.
#[derive(Debug, Error)]
pub enum VmError {
    /// A user-level exception payload in flight
    #[error("uncaught exception")]
    Exception(Value),

    /// Operand stack popped below its floor
    #[error("operand stack underflow")]
    StackUnderflow,

    /// Operand stack grew past its configured ceiling
    #[error("operand stack overflow")]
    StackOverflow,

    /// The byte at the instruction pointer is not a valid opcode
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// The instruction pointer left the instruction block
    #[error("instruction pointer out of bounds: {0}")]
    IpOutOfBounds(usize),

    /// An opcode observed a value of the wrong kind
    #[error("type error: {0}")]
    TypeError(String),

    /// A local variable slot or lexical level does not exist
    #[error("bad local access: {0}")]
    BadLocalAccess(String),

    /// Heap exhausted even after growth
    #[error("heap exhausted")]
    OutOfMemory,

    /// A host function ran on a thread its policy forbids
    #[error("thread policy violation: {0}")]
    ThreadPolicy(String),

    /// Internal invariant violation
    #[error("machine panic: {0}")]
    Panic(String),
}

/// Machine execution result
pub type VmResult<T> = Result<T, VmError>;
