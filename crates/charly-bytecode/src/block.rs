//! Compiled instruction blocks
//!
//! An [`InstructionBlock`] is the unit of compiled input the interpreter
//! consumes: a byte array of encoded instructions plus side tables (constants
//! pool and an optional line map for stack traces). All multi-byte operands
//! are little-endian.

use crate::opcode::Opcode;
use thiserror::Error;

/// Errors produced while decoding an instruction block
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Ran off the end of the block while reading an operand
    #[error("unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// The byte at the given offset is not a valid opcode
    #[error("invalid opcode {byte:#04x} at offset {offset}")]
    InvalidOpcode {
        /// Offending byte
        byte: u8,
        /// Offset of the byte within the block
        offset: usize,
    },
}

/// An entry in the constants pool
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// The null value
    Null,
    /// A boolean
    Bool(bool),
    /// A signed integer
    Int(i64),
    /// A double
    Float(f64),
    /// A UTF-8 string
    Str(String),
    /// A symbol hash payload
    Symbol(u64),
}

/// A source location attached to a bytecode offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// First bytecode offset this entry covers
    pub offset: u32,
    /// 1-based source line
    pub line: u32,
    /// 1-based source column
    pub column: u32,
}

/// A compiled instruction block
///
/// The block owns its encoded instruction bytes and the constants they
/// reference. `writeoffset` is the first byte past the last valid opcode;
/// execution never advances beyond it.
#[derive(Debug, Clone, Default)]
pub struct InstructionBlock {
    /// Encoded instructions
    pub data: Vec<u8>,
    /// Constants referenced by `PutValue` / `PutString`
    pub constants: Vec<Constant>,
    /// Optional source-location map, sorted by offset
    pub line_map: Vec<LineEntry>,
    /// Names behind the symbol hashes this block embeds (diagnostics only)
    pub symbol_names: Vec<(u64, String)>,
}

impl InstructionBlock {
    /// Create an empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// First byte past the last valid opcode
    #[inline]
    pub fn writeoffset(&self) -> usize {
        self.data.len()
    }

    /// Fetch a constant by pool index
    pub fn constant(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Look up the source location covering a bytecode offset
    pub fn lookup_line(&self, offset: usize) -> Option<LineEntry> {
        let mut found = None;
        for entry in &self.line_map {
            if entry.offset as usize <= offset {
                found = Some(*entry);
            } else {
                break;
            }
        }
        found
    }

    /// Decode the opcode at an offset
    pub fn opcode_at(&self, offset: usize) -> Result<Opcode, DecodeError> {
        let byte = *self
            .data
            .get(offset)
            .ok_or(DecodeError::UnexpectedEnd(offset))?;
        Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode { byte, offset })
    }

    /// Walk the block linearly, yielding `(offset, opcode)` pairs
    ///
    /// Stops at the write offset. Returns an error if an instruction is
    /// truncated or an opcode byte is invalid.
    pub fn walk(&self) -> Result<Vec<(usize, Opcode)>, DecodeError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.writeoffset() {
            let opcode = self.opcode_at(offset)?;
            if offset + opcode.length() > self.writeoffset() {
                return Err(DecodeError::UnexpectedEnd(offset));
            }
            out.push((offset, opcode));
            offset += opcode.length();
        }
        Ok(out)
    }

    // ========================================================================
    // Operand readers
    // ========================================================================

    /// Read a u8 operand
    #[inline]
    pub fn read_u8(&self, offset: usize) -> Result<u8, DecodeError> {
        self.data
            .get(offset)
            .copied()
            .ok_or(DecodeError::UnexpectedEnd(offset))
    }

    /// Read a little-endian u32 operand
    #[inline]
    pub fn read_u32(&self, offset: usize) -> Result<u32, DecodeError> {
        let bytes = self
            .data
            .get(offset..offset + 4)
            .ok_or(DecodeError::UnexpectedEnd(offset))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian i32 operand
    #[inline]
    pub fn read_i32(&self, offset: usize) -> Result<i32, DecodeError> {
        Ok(self.read_u32(offset)? as i32)
    }

    /// Read a little-endian u64 operand
    #[inline]
    pub fn read_u64(&self, offset: usize) -> Result<u64, DecodeError> {
        let bytes = self
            .data
            .get(offset..offset + 8)
            .ok_or(DecodeError::UnexpectedEnd(offset))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian f64 operand
    #[inline]
    pub fn read_f64(&self, offset: usize) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_u64(offset)?))
    }
}
