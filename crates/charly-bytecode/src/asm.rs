//! Instruction block assembler
//!
//! The [`Assembler`] is the programmatic surface the compiler (and the test
//! suites) use to build instruction blocks: typed emit methods per opcode,
//! forward-referencing labels with patching, and constants-pool interning.

use crate::block::{Constant, InstructionBlock, LineEntry};
use crate::opcode::Opcode;
use thiserror::Error;

/// Errors produced while assembling a block
#[derive(Debug, Error)]
pub enum AssembleError {
    /// A label was referenced but never placed
    #[error("label {0} was never placed")]
    UnplacedLabel(usize),

    /// A relative branch target does not fit in 32 bits
    #[error("branch offset out of range at {0}")]
    OffsetOutOfRange(usize),
}

/// A forward-referencable position in the block being assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum PatchKind {
    /// i32 offset relative to the start of the referencing instruction
    Relative { instruction_start: usize },
    /// u32 absolute block offset
    Absolute,
}

struct Patch {
    at: usize,
    label: Label,
    kind: PatchKind,
}

/// Builds an [`InstructionBlock`] instruction by instruction
#[derive(Default)]
pub struct Assembler {
    data: Vec<u8>,
    constants: Vec<Constant>,
    line_map: Vec<LineEntry>,
    symbol_names: Vec<(u64, String)>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    /// Create a fresh, unplaced label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place a label at the current write offset
    pub fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.offset());
    }

    /// Create a label already placed at the current write offset
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.place(label);
        label
    }

    /// Intern a constant, reusing an existing pool slot when possible
    pub fn constant(&mut self, constant: Constant) -> u32 {
        for (i, existing) in self.constants.iter().enumerate() {
            if *existing == constant {
                return i as u32;
            }
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Record the source location for instructions emitted from here on
    pub fn set_location(&mut self, line: u32, column: u32) {
        self.line_map.push(LineEntry {
            offset: self.offset() as u32,
            line,
            column,
        });
    }

    /// Record the name behind a symbol hash so diagnostics can print it
    pub fn name_symbol(&mut self, hash: u64, name: &str) -> u64 {
        if !self.symbol_names.iter().any(|(h, _)| *h == hash) {
            self.symbol_names.push((hash, name.to_string()));
        }
        hash
    }

    /// Finish assembly, resolving all patches
    pub fn assemble(mut self) -> Result<InstructionBlock, AssembleError> {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].ok_or(AssembleError::UnplacedLabel(patch.label.0))?;
            let bytes = match patch.kind {
                PatchKind::Relative { instruction_start } => {
                    let delta = target as i64 - instruction_start as i64;
                    let delta = i32::try_from(delta)
                        .map_err(|_| AssembleError::OffsetOutOfRange(instruction_start))?;
                    delta.to_le_bytes()
                }
                PatchKind::Absolute => {
                    let target = u32::try_from(target)
                        .map_err(|_| AssembleError::OffsetOutOfRange(patch.at))?;
                    target.to_le_bytes()
                }
            };
            self.data[patch.at..patch.at + 4].copy_from_slice(&bytes);
        }

        Ok(InstructionBlock {
            data: self.data,
            constants: self.constants,
            line_map: self.line_map,
            symbol_names: self.symbol_names,
        })
    }

    // ========================================================================
    // Raw emitters
    // ========================================================================

    fn emit_opcode(&mut self, opcode: Opcode) -> usize {
        let start = self.offset();
        self.data.push(opcode as u8);
        start
    }

    fn emit_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    fn emit_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_f64(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    fn emit_relative_label(&mut self, instruction_start: usize, label: Label) {
        self.patches.push(Patch {
            at: self.offset(),
            label,
            kind: PatchKind::Relative { instruction_start },
        });
        self.emit_u32(0);
    }

    fn emit_absolute_label(&mut self, label: Label) {
        self.patches.push(Patch {
            at: self.offset(),
            label,
            kind: PatchKind::Absolute,
        });
        self.emit_u32(0);
    }

    fn emit_branch_like(&mut self, opcode: Opcode, target: Label) {
        let start = self.emit_opcode(opcode);
        self.emit_relative_label(start, target);
    }

    // ========================================================================
    // Typed emit methods
    // ========================================================================

    /// Emit `nop`
    pub fn nop(&mut self) {
        self.emit_opcode(Opcode::Nop);
    }

    /// Emit `halt`
    pub fn halt(&mut self) {
        self.emit_opcode(Opcode::Halt);
    }

    /// Emit `typeof`
    pub fn type_of(&mut self) {
        self.emit_opcode(Opcode::Typeof);
    }

    /// Emit `readlocal index, level`
    pub fn read_local(&mut self, index: u32, level: u32) {
        self.emit_opcode(Opcode::ReadLocal);
        self.emit_u32(index);
        self.emit_u32(level);
    }

    /// Emit `setlocal index, level`
    pub fn set_local(&mut self, index: u32, level: u32) {
        self.emit_opcode(Opcode::SetLocal);
        self.emit_u32(index);
        self.emit_u32(level);
    }

    /// Emit `readglobal symbol`
    pub fn read_global(&mut self, symbol: u64) {
        self.emit_opcode(Opcode::ReadGlobal);
        self.emit_u64(symbol);
    }

    /// Emit `setglobal symbol`
    pub fn set_global(&mut self, symbol: u64) {
        self.emit_opcode(Opcode::SetGlobal);
        self.emit_u64(symbol);
    }

    /// Emit `readmembersymbol symbol`
    pub fn read_member_symbol(&mut self, symbol: u64) {
        self.emit_opcode(Opcode::ReadMemberSymbol);
        self.emit_u64(symbol);
    }

    /// Emit `setmembersymbol symbol`
    pub fn set_member_symbol(&mut self, symbol: u64) {
        self.emit_opcode(Opcode::SetMemberSymbol);
        self.emit_u64(symbol);
    }

    /// Emit `readmembervalue`
    pub fn read_member_value(&mut self) {
        self.emit_opcode(Opcode::ReadMemberValue);
    }

    /// Emit `setmembervalue`
    pub fn set_member_value(&mut self) {
        self.emit_opcode(Opcode::SetMemberValue);
    }

    /// Emit `readarrayindex index`
    pub fn read_array_index(&mut self, index: i32) {
        self.emit_opcode(Opcode::ReadArrayIndex);
        self.emit_u32(index as u32);
    }

    /// Emit `setarrayindex index`
    pub fn set_array_index(&mut self, index: i32) {
        self.emit_opcode(Opcode::SetArrayIndex);
        self.emit_u32(index as u32);
    }

    /// Emit `putvalue` for a pool constant
    pub fn put_constant(&mut self, constant: Constant) {
        let index = self.constant(constant);
        self.emit_opcode(Opcode::PutValue);
        self.emit_u32(index);
    }

    /// Emit `putvalue` for an integer literal
    pub fn put_int(&mut self, value: i64) {
        self.put_constant(Constant::Int(value));
    }

    /// Emit `putvalue` for a boolean literal
    pub fn put_bool(&mut self, value: bool) {
        self.put_constant(Constant::Bool(value));
    }

    /// Emit `putvalue` for the null literal
    pub fn put_null(&mut self) {
        self.put_constant(Constant::Null);
    }

    /// Emit `putvalue` for a symbol literal
    pub fn put_symbol(&mut self, hash: u64) {
        self.put_constant(Constant::Symbol(hash));
    }

    /// Emit `putfloat value`
    pub fn put_float(&mut self, value: f64) {
        self.emit_opcode(Opcode::PutFloat);
        self.emit_f64(value);
    }

    /// Emit `putstring` for a pool string
    pub fn put_string(&mut self, value: &str) {
        let index = self.constant(Constant::Str(value.to_string()));
        self.emit_opcode(Opcode::PutString);
        self.emit_u32(index);
    }

    /// Emit `putself`
    pub fn put_self(&mut self) {
        self.emit_opcode(Opcode::PutSelf);
    }

    /// Emit `putfunction`
    #[allow(clippy::too_many_arguments)]
    pub fn put_function(
        &mut self,
        name: u64,
        body: Label,
        argc: u32,
        minimum_argc: u32,
        lvarcount: u32,
        flags: u8,
    ) {
        self.emit_opcode(Opcode::PutFunction);
        self.emit_u64(name);
        self.emit_absolute_label(body);
        self.emit_u32(argc);
        self.emit_u32(minimum_argc);
        self.emit_u32(lvarcount);
        self.emit_u8(flags);
    }

    /// Emit `putgenerator`
    pub fn put_generator(&mut self, name: u64, resume: Label, lvarcount: u32) {
        self.emit_opcode(Opcode::PutGenerator);
        self.emit_u64(name);
        self.emit_absolute_label(resume);
        self.emit_u32(lvarcount);
    }

    /// Emit `putclass`
    pub fn put_class(
        &mut self,
        name: u64,
        property_count: u32,
        method_count: u32,
        static_method_count: u32,
        flags: u8,
    ) {
        self.emit_opcode(Opcode::PutClass);
        self.emit_u64(name);
        self.emit_u32(property_count);
        self.emit_u32(method_count);
        self.emit_u32(static_method_count);
        self.emit_u8(flags);
    }

    /// Emit `putarray count`
    pub fn put_array(&mut self, count: u32) {
        self.emit_opcode(Opcode::PutArray);
        self.emit_u32(count);
    }

    /// Emit `puthash count`
    pub fn put_hash(&mut self, count: u32) {
        self.emit_opcode(Opcode::PutHash);
        self.emit_u32(count);
    }

    /// Emit `putsupermember symbol`
    pub fn put_super_member(&mut self, symbol: u64) {
        self.emit_opcode(Opcode::PutSuperMember);
        self.emit_u64(symbol);
    }

    /// Emit `pop`
    pub fn pop(&mut self) {
        self.emit_opcode(Opcode::Pop);
    }

    /// Emit `dup`
    pub fn dup(&mut self) {
        self.emit_opcode(Opcode::Dup);
    }

    /// Emit `dupn count`
    pub fn dupn(&mut self, count: u32) {
        self.emit_opcode(Opcode::Dupn);
        self.emit_u32(count);
    }

    /// Emit `swap`
    pub fn swap(&mut self) {
        self.emit_opcode(Opcode::Swap);
    }

    /// Emit `topn offset`
    pub fn topn(&mut self, offset: u32) {
        self.emit_opcode(Opcode::Topn);
        self.emit_u32(offset);
    }

    /// Emit `setn offset`
    pub fn setn(&mut self, offset: u32) {
        self.emit_opcode(Opcode::Setn);
        self.emit_u32(offset);
    }

    /// Emit `call argc`
    pub fn call(&mut self, argc: u32) {
        self.emit_opcode(Opcode::Call);
        self.emit_u32(argc);
    }

    /// Emit `callmember symbol, argc`
    pub fn call_member(&mut self, symbol: u64, argc: u32) {
        self.emit_opcode(Opcode::CallMember);
        self.emit_u64(symbol);
        self.emit_u32(argc);
    }

    /// Emit `return`
    pub fn ret(&mut self) {
        self.emit_opcode(Opcode::Return);
    }

    /// Emit `yield`
    pub fn yield_value(&mut self) {
        self.emit_opcode(Opcode::Yield);
    }

    /// Emit `throw`
    pub fn throw(&mut self) {
        self.emit_opcode(Opcode::Throw);
    }

    /// Emit `registercatchtable handler`
    pub fn register_catchtable(&mut self, handler: Label) {
        self.emit_branch_like(Opcode::RegisterCatchTable, handler);
    }

    /// Emit `popcatchtable`
    pub fn pop_catchtable(&mut self) {
        self.emit_opcode(Opcode::PopCatchTable);
    }

    /// Emit `branch target`
    pub fn branch(&mut self, target: Label) {
        self.emit_branch_like(Opcode::Branch, target);
    }

    /// Emit `branchif target`
    pub fn branch_if(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchIf, target);
    }

    /// Emit `branchunless target`
    pub fn branch_unless(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchUnless, target);
    }

    /// Emit `branchlt target`
    pub fn branch_lt(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchLt, target);
    }

    /// Emit `branchgt target`
    pub fn branch_gt(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchGt, target);
    }

    /// Emit `branchle target`
    pub fn branch_le(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchLe, target);
    }

    /// Emit `branchge target`
    pub fn branch_ge(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchGe, target);
    }

    /// Emit `brancheq target`
    pub fn branch_eq(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchEq, target);
    }

    /// Emit `branchneq target`
    pub fn branch_neq(&mut self, target: Label) {
        self.emit_branch_like(Opcode::BranchNeq, target);
    }

    /// Emit `add`
    pub fn add(&mut self) {
        self.emit_opcode(Opcode::Add);
    }

    /// Emit `sub`
    pub fn sub(&mut self) {
        self.emit_opcode(Opcode::Sub);
    }

    /// Emit `mul`
    pub fn mul(&mut self) {
        self.emit_opcode(Opcode::Mul);
    }

    /// Emit `div`
    pub fn div(&mut self) {
        self.emit_opcode(Opcode::Div);
    }

    /// Emit `mod`
    pub fn modulo(&mut self) {
        self.emit_opcode(Opcode::Mod);
    }

    /// Emit `pow`
    pub fn pow(&mut self) {
        self.emit_opcode(Opcode::Pow);
    }

    /// Emit `uadd`
    pub fn uadd(&mut self) {
        self.emit_opcode(Opcode::UAdd);
    }

    /// Emit `usub`
    pub fn usub(&mut self) {
        self.emit_opcode(Opcode::USub);
    }

    /// Emit `eq`
    pub fn eq(&mut self) {
        self.emit_opcode(Opcode::Eq);
    }

    /// Emit `neq`
    pub fn neq(&mut self) {
        self.emit_opcode(Opcode::Neq);
    }

    /// Emit `lt`
    pub fn lt(&mut self) {
        self.emit_opcode(Opcode::Lt);
    }

    /// Emit `gt`
    pub fn gt(&mut self) {
        self.emit_opcode(Opcode::Gt);
    }

    /// Emit `le`
    pub fn le(&mut self) {
        self.emit_opcode(Opcode::Le);
    }

    /// Emit `ge`
    pub fn ge(&mut self) {
        self.emit_opcode(Opcode::Ge);
    }

    /// Emit `unot`
    pub fn unot(&mut self) {
        self.emit_opcode(Opcode::UNot);
    }

    /// Emit `shl`
    pub fn shl(&mut self) {
        self.emit_opcode(Opcode::Shl);
    }

    /// Emit `shr`
    pub fn shr(&mut self) {
        self.emit_opcode(Opcode::Shr);
    }

    /// Emit `band`
    pub fn band(&mut self) {
        self.emit_opcode(Opcode::BAnd);
    }

    /// Emit `bor`
    pub fn bor(&mut self) {
        self.emit_opcode(Opcode::BOr);
    }

    /// Emit `bxor`
    pub fn bxor(&mut self) {
        self.emit_opcode(Opcode::BXor);
    }

    /// Emit `ubnot`
    pub fn ubnot(&mut self) {
        self.emit_opcode(Opcode::UBNot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_simple_block() {
        let mut asm = Assembler::new();
        asm.put_int(3);
        asm.put_int(4);
        asm.add();
        asm.halt();

        let block = asm.assemble().unwrap();
        let walked = block.walk().unwrap();
        assert_eq!(walked.len(), 4);
        assert_eq!(walked[0].1, Opcode::PutValue);
        assert_eq!(walked[2].1, Opcode::Add);
        assert_eq!(walked[3].1, Opcode::Halt);
    }

    #[test]
    fn test_constants_are_interned() {
        let mut asm = Assembler::new();
        asm.put_int(42);
        asm.put_int(42);
        asm.put_int(7);

        let block = asm.assemble().unwrap();
        assert_eq!(block.constants.len(), 2);
    }

    #[test]
    fn test_forward_branch_patching() {
        let mut asm = Assembler::new();
        let end = asm.label();
        let start = asm.offset();
        asm.branch(end);
        asm.nop();
        asm.nop();
        asm.place(end);
        asm.halt();

        let block = asm.assemble().unwrap();
        // Offset is relative to the branch opcode byte: 5 (branch) + 2 (nops)
        let offset = block.read_i32(start + 1).unwrap();
        assert_eq!(offset, 7);
    }

    #[test]
    fn test_backward_branch_patching() {
        let mut asm = Assembler::new();
        let top = asm.here();
        asm.nop();
        let start = asm.offset();
        asm.branch(top);

        let block = asm.assemble().unwrap();
        let offset = block.read_i32(start + 1).unwrap();
        assert_eq!(offset, -1);
    }

    #[test]
    fn test_unplaced_label_errors() {
        let mut asm = Assembler::new();
        let nowhere = asm.label();
        asm.branch(nowhere);
        assert!(matches!(
            asm.assemble(),
            Err(AssembleError::UnplacedLabel(_))
        ));
    }

    #[test]
    fn test_function_body_absolute_patch() {
        let mut asm = Assembler::new();
        let body = asm.label();
        asm.put_function(0xABCD, body, 1, 1, 2, 0);
        asm.halt();
        asm.place(body);
        asm.put_null();
        asm.ret();

        let block = asm.assemble().unwrap();
        // name symbol at +1, body offset at +9
        assert_eq!(block.read_u64(1).unwrap(), 0xABCD);
        let body_offset = block.read_u32(9).unwrap() as usize;
        assert_eq!(block.opcode_at(body_offset).unwrap(), Opcode::PutValue);
    }
}
