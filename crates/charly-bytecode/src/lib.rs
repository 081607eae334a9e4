//! Charly VM bytecode
//!
//! This crate defines the instruction set of the Charly virtual machine and
//! the compiled form the interpreter consumes:
//!
//! - [`Opcode`]: single-byte opcodes with a constant length table
//! - [`InstructionBlock`]: encoded instructions plus constants pool and line map
//! - [`Assembler`]: typed emitter with label patching
//!
//! The compiler front end (out of scope for this repository) targets the
//! [`Assembler`] API; the test suites of the runtime crate use it directly.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod asm;
pub mod block;
pub mod opcode;

pub use asm::{AssembleError, Assembler, Label};
pub use block::{Constant, DecodeError, InstructionBlock, LineEntry};
pub use opcode::{class_flags, function_flags, Opcode};
