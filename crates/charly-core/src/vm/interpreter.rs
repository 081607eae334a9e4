//! Bytecode dispatch loop and opcode semantics
//!
//! The interpreter is a flat loop over the machine's instruction block:
//! fetch the opcode byte, advance the instruction pointer by the opcode's
//! fixed length, execute. Frames are heap data rather than native recursion,
//! so calls and returns only relink the frame chain; `run` returns when a
//! `halt_after_return` frame returns, a `Halt` executes, or a fiber
//! suspends. A thrown [`VmError::Exception`] is caught between opcodes and
//! fed to catch-table unwinding; every other error is terminal.

use crate::heap::{CellKind, CellRef, FrameData, FunctionData, GeneratorData, Locals, ObjectData};
use crate::value::{self, Value};
use crate::vm::machine::FrameInit;
use crate::vm::{HostCallable, Machine, MAX_HOST_ARGS};
use crate::{VmError, VmResult};
use charly_bytecode::{Constant, InstructionBlock, Opcode};
use std::cmp::Ordering;
use std::sync::Arc;

impl Machine {
    /// Run the dispatch loop until the machine halts
    pub fn run(&mut self) -> VmResult<()> {
        while !self.halted {
            match self.step() {
                Ok(()) => {}
                Err(VmError::Exception(payload)) => {
                    self.unwind_catchstack(Some(payload))?;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Execute a single instruction
    fn step(&mut self) -> VmResult<()> {
        let block = Arc::clone(&self.block);
        let start = self.ip;
        if start >= block.writeoffset() {
            return Err(VmError::IpOutOfBounds(start));
        }

        let byte = block.data[start];
        let opcode = Opcode::from_u8(byte).ok_or(VmError::InvalidOpcode(byte))?;
        if start + opcode.length() > block.writeoffset() {
            return Err(VmError::IpOutOfBounds(start));
        }
        if self.options.trace_opcodes {
            eprintln!("{:06x}: {}", start, opcode);
        }

        // Branch-family handlers overwrite this
        self.ip = start + opcode.length();

        match opcode {
            // ===== Miscellaneous =====
            Opcode::Nop => Ok(()),
            Opcode::Halt => {
                self.halted = true;
                Ok(())
            }
            Opcode::Typeof => self.op_typeof(),

            // ===== Locals, globals & members =====
            Opcode::ReadLocal => {
                let index = read_u32(&block, start + 1)?;
                let level = read_u32(&block, start + 5)?;
                let value = self.read_local(index, level)?;
                self.push(value)
            }
            Opcode::SetLocal => {
                let index = read_u32(&block, start + 1)?;
                let level = read_u32(&block, start + 5)?;
                let value = self.pop()?;
                self.write_local(index, level, value)
            }
            Opcode::ReadGlobal => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                self.op_read_global(symbol)
            }
            Opcode::SetGlobal => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                let value = self.pop()?;
                self.heap
                    .object_mut(self.globals.as_cell())?
                    .container
                    .insert(symbol, value);
                Ok(())
            }
            Opcode::ReadMemberSymbol => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                let target = self.pop()?;
                let found = self.resolve_member(target, symbol).unwrap_or_default();
                self.push(found)
            }
            Opcode::SetMemberSymbol => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                let value = self.pop()?;
                let target = self.pop()?;
                self.set_member(target, symbol, value)
            }
            Opcode::ReadMemberValue => self.op_read_member_value(),
            Opcode::SetMemberValue => self.op_set_member_value(),
            Opcode::ReadArrayIndex => {
                let index = read_i32(&block, start + 1)?;
                self.op_read_array_index(index)
            }
            Opcode::SetArrayIndex => {
                let index = read_i32(&block, start + 1)?;
                self.op_set_array_index(index)
            }

            // ===== Literals =====
            Opcode::PutValue => {
                let index = read_u32(&block, start + 1)?;
                self.op_put_value(&block, index)
            }
            Opcode::PutFloat => {
                let value = read_f64(&block, start + 1)?;
                self.push(Value::double(value))
            }
            Opcode::PutString => {
                let index = read_u32(&block, start + 1)?;
                self.op_put_value(&block, index)
            }
            Opcode::PutSelf => {
                let value = match self.frames {
                    Some(frame) => self.heap.frame(frame)?.self_value,
                    None => Value::null(),
                };
                self.push(value)
            }
            Opcode::PutFunction => {
                let name = Value::symbol(read_u64(&block, start + 1)?);
                let body = read_u32(&block, start + 9)? as usize;
                let argc = read_u32(&block, start + 13)?;
                let minimum_argc = read_u32(&block, start + 17)?;
                let lvarcount = read_u32(&block, start + 21)?;
                let flags = read_u8(&block, start + 25)?;
                self.op_put_function(name, body, argc, minimum_argc, lvarcount, flags)
            }
            Opcode::PutGenerator => {
                let name = Value::symbol(read_u64(&block, start + 1)?);
                let resume = read_u32(&block, start + 9)? as usize;
                let lvarcount = read_u32(&block, start + 13)?;
                self.op_put_generator(name, resume, lvarcount)
            }
            Opcode::PutClass => {
                let name = Value::symbol(read_u64(&block, start + 1)?);
                let property_count = read_u32(&block, start + 9)? as usize;
                let method_count = read_u32(&block, start + 13)? as usize;
                let static_method_count = read_u32(&block, start + 17)? as usize;
                let flags = read_u8(&block, start + 21)?;
                self.op_put_class(name, property_count, method_count, static_method_count, flags)
            }
            Opcode::PutArray => {
                let count = read_u32(&block, start + 1)? as usize;
                self.op_put_array(count)
            }
            Opcode::PutHash => {
                let count = read_u32(&block, start + 1)? as usize;
                self.op_put_hash(count)
            }
            Opcode::PutSuperMember => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                self.op_put_super_member(symbol)
            }

            // ===== Stack plumbing =====
            Opcode::Pop => {
                self.pop()?;
                Ok(())
            }
            Opcode::Dup => {
                let value = self.peek()?;
                self.push(value)
            }
            Opcode::Dupn => {
                let count = read_u32(&block, start + 1)? as usize;
                if self.stack.len() < count {
                    return Err(VmError::StackUnderflow);
                }
                let copies = self.stack[self.stack.len() - count..].to_vec();
                for value in copies {
                    self.push(value)?;
                }
                Ok(())
            }
            Opcode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a)?;
                self.push(b)
            }
            Opcode::Topn => {
                let offset = read_u32(&block, start + 1)? as usize;
                let len = self.stack.len();
                if offset >= len {
                    return Err(VmError::StackUnderflow);
                }
                let value = self.stack[len - 1 - offset];
                self.push(value)
            }
            Opcode::Setn => {
                let offset = read_u32(&block, start + 1)? as usize;
                let value = self.pop()?;
                let len = self.stack.len();
                if offset >= len {
                    return Err(VmError::StackUnderflow);
                }
                self.stack[len - 1 - offset] = value;
                Ok(())
            }

            // ===== Calls & returns =====
            Opcode::Call => {
                let argc = read_u32(&block, start + 1)? as usize;
                self.op_call(argc)
            }
            Opcode::CallMember => {
                let symbol = Value::symbol(read_u64(&block, start + 1)?);
                let argc = read_u32(&block, start + 9)? as usize;
                self.op_call_member(symbol, argc)
            }
            Opcode::Return => self.op_return(),
            Opcode::Yield => self.op_yield(),

            // ===== Exceptions =====
            Opcode::Throw => {
                let payload = self.pop()?;
                Err(VmError::Exception(payload))
            }
            Opcode::RegisterCatchTable => {
                let offset = read_i32(&block, start + 1)?;
                let address = offset_target(start, offset)?;
                self.register_catchtable(address)?;
                Ok(())
            }
            Opcode::PopCatchTable => self.pop_catchtable(),

            // ===== Branches =====
            Opcode::Branch => {
                self.ip = offset_target(start, read_i32(&block, start + 1)?)?;
                Ok(())
            }
            Opcode::BranchIf => {
                let target = offset_target(start, read_i32(&block, start + 1)?)?;
                let value = self.pop()?;
                if self.truthyness(value) {
                    self.ip = target;
                }
                Ok(())
            }
            Opcode::BranchUnless => {
                let target = offset_target(start, read_i32(&block, start + 1)?)?;
                let value = self.pop()?;
                if !self.truthyness(value) {
                    self.ip = target;
                }
                Ok(())
            }
            Opcode::BranchLt
            | Opcode::BranchGt
            | Opcode::BranchLe
            | Opcode::BranchGe
            | Opcode::BranchEq
            | Opcode::BranchNeq => {
                let target = offset_target(start, read_i32(&block, start + 1)?)?;
                let right = self.pop()?;
                let left = self.pop()?;
                if self.fused_branch_condition(opcode, left, right) {
                    self.ip = target;
                }
                Ok(())
            }

            // ===== Arithmetic =====
            Opcode::Add => self.op_add(),
            Opcode::Sub => self.op_binary_numeric(value::sub, "-"),
            Opcode::Mul => self.op_binary_numeric(value::mul, "*"),
            Opcode::Div => self.op_binary_numeric(value::div, "/"),
            Opcode::Mod => self.op_binary_numeric(value::modulo, "%"),
            Opcode::Pow => self.op_binary_numeric(value::pow, "**"),
            Opcode::UAdd => {
                let value = self.peek()?;
                if !value.is_numeric() {
                    let kind = self.heap.kind_name(value);
                    return Err(self.throw_message(&format!("cannot apply unary + to {}", kind)));
                }
                Ok(())
            }
            Opcode::USub => {
                let operand = self.pop()?;
                match value::negate(operand) {
                    Some(result) => self.push(result),
                    None => {
                        let kind = self.heap.kind_name(operand);
                        Err(self.throw_message(&format!("cannot negate a value of type {}", kind)))
                    }
                }
            }

            // ===== Comparison & logic =====
            Opcode::Eq => {
                let right = self.pop()?;
                let left = self.pop()?;
                let equal = self.values_equal(left, right);
                self.push(Value::boolean(equal))
            }
            Opcode::Neq => {
                let right = self.pop()?;
                let left = self.pop()?;
                let equal = self.values_equal(left, right);
                self.push(Value::boolean(!equal))
            }
            Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = match (opcode, self.compare_values(left, right)) {
                    (Opcode::Lt, Some(Ordering::Less)) => true,
                    (Opcode::Gt, Some(Ordering::Greater)) => true,
                    (Opcode::Le, Some(Ordering::Less | Ordering::Equal)) => true,
                    (Opcode::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
                    _ => false,
                };
                self.push(Value::boolean(result))
            }
            Opcode::UNot => {
                let value = self.pop()?;
                let truthy = self.truthyness(value);
                self.push(Value::boolean(!truthy))
            }

            // ===== Bitwise =====
            Opcode::Shl => self.op_bitwise(value::shl),
            Opcode::Shr => self.op_bitwise(value::shr),
            Opcode::BAnd => self.op_bitwise(value::band),
            Opcode::BOr => self.op_bitwise(value::bor),
            Opcode::BXor => self.op_bitwise(value::bxor),
            Opcode::UBNot => {
                let operand = self.pop()?;
                if !operand.is_numeric() {
                    let kind = self.heap.kind_name(operand);
                    return Err(self.throw_message(&format!("cannot apply ~ to {}", kind)));
                }
                self.push(value::bnot(operand))
            }
        }
    }

    // ========================================================================
    // Member & index operations
    // ========================================================================

    fn op_read_global(&mut self, symbol: Value) -> VmResult<()> {
        let found = self
            .heap
            .object(self.globals.as_cell())?
            .container
            .get(&symbol)
            .copied();
        match found {
            Some(value) => self.push(value),
            None => {
                let name = self.symbols.describe(symbol.as_symbol());
                Err(self.throw_message(&format!("unknown global {}", name)))
            }
        }
    }

    fn op_read_member_value(&mut self) -> VmResult<()> {
        let member = self.pop()?;
        let target = self.pop()?;

        // Numeric members on arrays are element reads
        if member.is_numeric() && target.is_cell() && self.heap.array(target.as_cell()).is_ok() {
            self.push(target)?;
            return self.op_read_array_index(member.to_int() as i32);
        }

        let symbol = self.value_to_symbol(member);
        let found = self.resolve_member(target, symbol).unwrap_or_default();
        self.push(found)
    }

    fn op_set_member_value(&mut self) -> VmResult<()> {
        let value = self.pop()?;
        let member = self.pop()?;
        let target = self.pop()?;

        if member.is_numeric() && target.is_cell() && self.heap.array(target.as_cell()).is_ok() {
            self.push(target)?;
            self.push(value)?;
            return self.op_set_array_index(member.to_int() as i32);
        }

        let symbol = self.value_to_symbol(member);
        self.set_member(target, symbol, value)
    }

    fn op_read_array_index(&mut self, index: i32) -> VmResult<()> {
        let target = self.pop()?;
        if !target.is_cell() {
            let kind = self.heap.kind_name(target);
            return Err(self.throw_message(&format!("cannot index a value of type {}", kind)));
        }
        let array = self.heap.array(target.as_cell())?;
        let length = array.data.len() as i64;
        let mut index = index as i64;
        if index < 0 {
            index += length;
        }
        let value = if (0..length).contains(&index) {
            array.data[index as usize]
        } else {
            Value::null()
        };
        self.push(value)
    }

    fn op_set_array_index(&mut self, index: i32) -> VmResult<()> {
        let value = self.pop()?;
        let target = self.pop()?;
        if !target.is_cell() {
            let kind = self.heap.kind_name(target);
            return Err(self.throw_message(&format!("cannot index a value of type {}", kind)));
        }
        let array = self.heap.array_mut(target.as_cell())?;
        let length = array.data.len() as i64;
        let mut index = index as i64;
        if index < 0 {
            index += length;
        }
        if (0..length).contains(&index) {
            array.data[index as usize] = value;
            Ok(())
        } else {
            Err(self.throw_message(&format!(
                "array index {} out of bounds (length {})",
                index, length
            )))
        }
    }

    // ========================================================================
    // Literal operations
    // ========================================================================

    fn op_put_value(&mut self, block: &InstructionBlock, index: u32) -> VmResult<()> {
        let constant = block
            .constant(index)
            .ok_or_else(|| VmError::Panic(format!("missing constant {}", index)))?;
        let value = match constant {
            Constant::Null => Value::null(),
            Constant::Bool(b) => Value::boolean(*b),
            Constant::Int(i) => Value::number(*i),
            Constant::Float(f) => Value::double(*f),
            Constant::Str(s) => {
                let text = s.clone();
                self.create_str(&text)?
            }
            Constant::Symbol(hash) => Value::symbol(*hash),
        };
        self.push(value)
    }

    fn op_typeof(&mut self) -> VmResult<()> {
        let value = self.pop()?;
        let name = self.heap.kind_name(value);
        let string = self.create_str(name)?;
        self.push(string)
    }

    fn op_put_function(
        &mut self,
        name: Value,
        body: usize,
        argc: u32,
        minimum_argc: u32,
        lvarcount: u32,
        flags: u8,
    ) -> VmResult<()> {
        let kind = CellKind::Function(FunctionData {
            name,
            argc,
            minimum_argc,
            lvarcount,
            context: self.frames,
            body_address: body,
            bound_self: None,
            host_class: Value::null(),
            container: Box::default(),
            anonymous: flags & charly_bytecode::function_flags::ANONYMOUS != 0,
            needs_arguments: flags & charly_bytecode::function_flags::NEEDS_ARGUMENTS != 0,
        });
        let cell = self.allocate(kind)?;
        self.push(Value::cell(cell))
    }

    fn op_put_generator(&mut self, name: Value, resume: usize, lvarcount: u32) -> VmResult<()> {
        let self_value = match self.frames {
            Some(frame) => self.heap.frame(frame)?.self_value,
            None => Value::null(),
        };
        let generator = self.allocate(CellKind::Generator(GeneratorData {
            name,
            frame: None,
            catchtable: None,
            stack: Vec::new(),
            resume_address: resume,
            bound_self: None,
            container: Box::default(),
            finished: false,
            started: false,
        }))?;

        // The root frame lives outside the machine's frame chain until the
        // first resume swaps it in
        let generator_value = Value::cell(generator);
        self.heap.pin(generator_value);
        let frame = self.allocate(CellKind::Frame(FrameData {
            parent: None,
            environment: self.frames,
            catchtable: None,
            caller: Value::null(),
            self_value,
            origin_address: resume,
            return_address: None,
            stacksize: 0,
            halt_after_return: false,
            push_self_on_return: false,
            generator: Some(generator),
            locals: Locals::new(lvarcount as usize),
        }));
        self.heap.unpin(generator_value);

        self.heap.generator_mut(generator)?.frame = Some(frame?);
        self.push(generator_value)
    }

    fn op_put_array(&mut self, count: usize) -> VmResult<()> {
        if self.stack.len() < count {
            return Err(VmError::StackUnderflow);
        }
        // Elements stay on the stack (rooted) until the array exists
        let base = self.stack.len() - count;
        let elements = self.stack[base..].to_vec();
        let array = self.create_array(elements)?;
        self.stack.truncate(base);
        self.push(array)
    }

    fn op_put_hash(&mut self, count: usize) -> VmResult<()> {
        if self.stack.len() < count * 2 {
            return Err(VmError::StackUnderflow);
        }
        let base = self.stack.len() - count * 2;
        let mut object = ObjectData::new(Value::null());
        for pair in 0..count {
            let key = self.stack[base + pair * 2];
            let value = self.stack[base + pair * 2 + 1];
            let symbol = self.value_to_symbol(key);
            object.container.insert(symbol, value);
        }
        let cell = self.allocate(CellKind::Object(object))?;
        self.stack.truncate(base);
        self.push(Value::cell(cell))
    }

    fn op_put_class(
        &mut self,
        name: Value,
        property_count: usize,
        method_count: usize,
        static_method_count: usize,
        flags: u8,
    ) -> VmResult<()> {
        let has_parent = flags & charly_bytecode::class_flags::HAS_PARENT != 0;
        let has_constructor = flags & charly_bytecode::class_flags::HAS_CONSTRUCTOR != 0;

        let total = property_count
            + method_count
            + static_method_count
            + usize::from(has_parent)
            + usize::from(has_constructor);
        if self.stack.len() < total {
            return Err(VmError::StackUnderflow);
        }

        // Everything is read in place and only popped once the class cell
        // exists, so the values stay rooted across the allocations below
        let base = self.stack.len() - total;
        let mut cursor = base;

        let parent_class = if has_parent {
            let parent = self.stack[cursor];
            cursor += 1;
            if !parent.is_cell() || self.heap.class(parent.as_cell()).is_err() {
                let kind = self.heap.kind_name(parent);
                return Err(self.throw_message(&format!("cannot extend a value of type {}", kind)));
            }
            parent
        } else {
            Value::null()
        };

        let member_properties = self.stack[cursor..cursor + property_count].to_vec();
        cursor += property_count;
        let methods = self.stack[cursor..cursor + method_count].to_vec();
        cursor += method_count;
        let static_methods = self.stack[cursor..cursor + static_method_count].to_vec();
        cursor += static_method_count;
        let constructor = if has_constructor {
            self.stack[cursor]
        } else {
            Value::null()
        };

        let prototype = self.create_object(Value::null())?;
        for &method in &methods {
            let method_name = self.heap.function(method.as_cell())?.name;
            self.heap
                .object_mut(prototype.as_cell())?
                .container
                .insert(method_name, method);
        }

        let mut container = Box::<crate::heap::Container>::default();
        for &method in &static_methods {
            let method_name = self.heap.function(method.as_cell())?.name;
            container.insert(method_name, method);
        }

        let class_cell = self.allocate(CellKind::Class(crate::heap::ClassData {
            name,
            constructor,
            prototype,
            parent_class,
            member_properties: Box::new(member_properties),
            container,
        }))?;
        let class_value = Value::cell(class_cell);

        for method in methods.iter().chain(static_methods.iter()) {
            if let Ok(function) = self.heap.function_mut(method.as_cell()) {
                function.host_class = class_value;
            }
        }
        if constructor.is_cell() {
            if let Ok(function) = self.heap.function_mut(constructor.as_cell()) {
                function.host_class = class_value;
            }
        }

        self.stack.truncate(base);
        self.push(class_value)
    }

    fn op_put_super_member(&mut self, symbol: Value) -> VmResult<()> {
        let frame = self
            .frames
            .ok_or_else(|| VmError::Panic("super outside of a frame".to_string()))?;
        let (caller, self_value) = {
            let data = self.heap.frame(frame)?;
            (data.caller, data.self_value)
        };
        if !caller.is_cell() {
            return Err(self.throw_message("super used outside of a method"));
        }
        let host_class = self.heap.function(caller.as_cell())?.host_class;
        if !host_class.is_cell() {
            return Err(self.throw_message("super used outside of a method"));
        }
        let parent = self.heap.class(host_class.as_cell())?.parent_class;

        let name = self.symbols.describe(symbol.as_symbol());
        let Some(found) = self.lookup_class_chain(parent, symbol) else {
            return Err(self.throw_message(&format!("super has no member {}", name)));
        };

        if found.is_cell() && self.heap.function(found.as_cell()).is_ok() {
            let bound = self.copy_function_with_self(found, self_value)?;
            self.push(bound)
        } else {
            self.push(found)
        }
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    fn op_add(&mut self) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        // String concatenation; a single string operand stringifies the other
        if self.is_string_value(left) || self.is_string_value(right) {
            let mut bytes = match self.string_owned(left) {
                Some(bytes) => bytes,
                None => self.to_display_string(left).into_bytes(),
            };
            match self.string_owned(right) {
                Some(more) => bytes.extend_from_slice(&more),
                None => bytes.extend_from_slice(self.to_display_string(right).as_bytes()),
            }
            let result = self.create_string(&bytes)?;
            return self.push(result);
        }

        match value::add(left, right) {
            Some(result) => self.push(result),
            None => {
                let left_kind = self.heap.kind_name(left);
                let right_kind = self.heap.kind_name(right);
                Err(self.throw_message(&format!("cannot add {} and {}", left_kind, right_kind)))
            }
        }
    }

    fn op_binary_numeric(
        &mut self,
        op: fn(Value, Value) -> Option<Value>,
        symbol: &str,
    ) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        match op(left, right) {
            Some(result) => self.push(result),
            None => {
                let left_kind = self.heap.kind_name(left);
                let right_kind = self.heap.kind_name(right);
                Err(self.throw_message(&format!(
                    "cannot apply {} to {} and {}",
                    symbol, left_kind, right_kind
                )))
            }
        }
    }

    fn op_bitwise(&mut self, op: fn(Value, Value) -> Value) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        if !left.is_numeric() || !right.is_numeric() {
            let left_kind = self.heap.kind_name(left);
            let right_kind = self.heap.kind_name(right);
            return Err(self.throw_message(&format!(
                "bitwise operation needs numbers, found {} and {}",
                left_kind, right_kind
            )));
        }
        self.push(op(left, right))
    }

    fn fused_branch_condition(&self, opcode: Opcode, left: Value, right: Value) -> bool {
        match opcode {
            Opcode::BranchEq => self.values_equal(left, right),
            Opcode::BranchNeq => !self.values_equal(left, right),
            _ => match (opcode, self.compare_values(left, right)) {
                (Opcode::BranchLt, Some(Ordering::Less)) => true,
                (Opcode::BranchGt, Some(Ordering::Greater)) => true,
                (Opcode::BranchLe, Some(Ordering::Less | Ordering::Equal)) => true,
                (Opcode::BranchGe, Some(Ordering::Greater | Ordering::Equal)) => true,
                _ => false,
            },
        }
    }

    // ========================================================================
    // Call pipeline
    // ========================================================================

    fn op_call(&mut self, argc: usize) -> VmResult<()> {
        if self.stack.len() < argc + 1 {
            return Err(VmError::StackUnderflow);
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let callee = self.pop()?;
        self.call_value(callee, &args, Value::null())
    }

    fn op_call_member(&mut self, symbol: Value, argc: usize) -> VmResult<()> {
        if self.stack.len() < argc + 1 {
            return Err(VmError::StackUnderflow);
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let target = self.pop()?;

        let Some(callee) = self.resolve_member(target, symbol) else {
            let name = self.symbols.describe(symbol.as_symbol());
            let kind = self.heap.kind_name(target);
            return Err(self.throw_message(&format!("undefined method {} on {}", name, kind)));
        };
        self.call_value(callee, &args, target)
    }

    /// Dispatch a call on the callee kind
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args: &[Value],
        receiver: Value,
    ) -> VmResult<()> {
        if callee.is_cell() {
            let cell = callee.as_cell();
            if self.heap.function(cell).is_ok() {
                return self.call_function(callee, args, receiver, false, false);
            }
            if self.heap.cfunction(cell).is_ok() {
                return self.call_cfunction(callee, args, receiver);
            }
            if self.heap.class(cell).is_ok() {
                return self.call_class(callee, args);
            }
            if self.heap.generator(cell).is_ok() {
                return self.resume_generator(callee, args);
            }
        }
        let kind = self.heap.kind_name(callee);
        Err(self.throw_message(&format!("a value of type {} is not callable", kind)))
    }

    /// Entry point used by the uncaught-exception path
    pub(crate) fn call_function_value(
        &mut self,
        func: Value,
        args: &[Value],
        fallback_self: Value,
        halt_after_return: bool,
    ) -> VmResult<()> {
        self.call_function(func, args, fallback_self, halt_after_return, false)
    }

    /// Entry point used by the scheduler to run a task callback
    pub(crate) fn call_task_callee(&mut self, func: Value, args: &[Value]) -> VmResult<()> {
        if func.is_cell() {
            let cell = func.as_cell();
            if self.heap.function(cell).is_ok() {
                self.call_function(func, args, Value::null(), true, false)?;
                return self.run();
            }
            if self.heap.cfunction(cell).is_ok() {
                return self.call_cfunction(func, args, Value::null());
            }
            if self.heap.generator(cell).is_ok() {
                self.resume_generator(func, args)?;
                return self.run();
            }
        }
        let kind = self.heap.kind_name(func);
        Err(VmError::TypeError(format!(
            "scheduled callback of type {} is not callable",
            kind
        )))
    }

    fn call_function(
        &mut self,
        func: Value,
        args: &[Value],
        fallback_self: Value,
        halt_after_return: bool,
        push_self_on_return: bool,
    ) -> VmResult<()> {
        let data = self.heap.function(func.as_cell())?;
        let argc = data.argc;
        let minimum_argc = data.minimum_argc;
        let lvarcount = data.lvarcount;
        let context = data.context;
        let body_address = data.body_address;
        let bound_self = data.bound_self;
        let needs_arguments = data.needs_arguments;
        let name = data.name;

        if (args.len() as u32) < minimum_argc {
            let name = self.symbols.describe(name.as_symbol());
            return Err(self.throw_message(&format!(
                "missing arguments for {}: expected at least {}, found {}",
                name,
                minimum_argc,
                args.len()
            )));
        }

        // Arguments left the operand stack already; keep them alive across
        // the frame and arguments-array allocations
        for &arg in args {
            self.heap.pin(arg);
        }
        let result = self.call_function_inner(
            func,
            args,
            bound_self.unwrap_or(fallback_self),
            context,
            argc,
            lvarcount,
            body_address,
            needs_arguments,
            halt_after_return,
            push_self_on_return,
        );
        for &arg in args {
            self.heap.unpin(arg);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn call_function_inner(
        &mut self,
        func: Value,
        args: &[Value],
        self_value: Value,
        context: Option<CellRef>,
        argc: u32,
        lvarcount: u32,
        body_address: usize,
        needs_arguments: bool,
        halt_after_return: bool,
        push_self_on_return: bool,
    ) -> VmResult<()> {
        let frame = self.create_frame(FrameInit {
            self_value,
            caller: func,
            environment: context,
            lvarcount,
            return_address: Some(self.ip),
            origin_address: body_address,
            halt_after_return,
            push_self_on_return,
            generator: None,
        })?;

        for (index, &arg) in args.iter().take(argc as usize).enumerate() {
            self.heap.frame_mut(frame)?.locals.set(index, arg);
        }

        // Overflowing arguments become an array in the reserved slot
        if needs_arguments {
            let arguments = self.create_array(args.to_vec())?;
            self.heap
                .frame_mut(frame)?
                .locals
                .set(argc as usize, arguments);
        }

        self.ip = body_address;
        Ok(())
    }

    fn call_cfunction(&mut self, func: Value, args: &[Value], receiver: Value) -> VmResult<()> {
        let data = self.heap.cfunction(func.as_cell())?;
        let callable = data.callable;
        let push_return = data.push_return;
        let declared_argc = data.argc;
        let name = data.name;

        if args.len() > MAX_HOST_ARGS {
            return Err(self.throw_message(&format!(
                "host calls accept at most {} arguments",
                MAX_HOST_ARGS
            )));
        }
        if (args.len() as u32) < declared_argc {
            let name = self.symbols.describe(name.as_symbol());
            return Err(self.throw_message(&format!(
                "missing arguments for {}: expected {}, found {}",
                name,
                declared_argc,
                args.len()
            )));
        }

        let result = match callable {
            HostCallable::Main(host) => {
                for &arg in args {
                    self.heap.pin(arg);
                }
                self.heap.pin(receiver);
                let outcome = host(self, receiver, args);
                self.heap.unpin(receiver);
                for &arg in args {
                    self.heap.unpin(arg);
                }
                outcome?
            }
            HostCallable::Pure(host) => {
                let mut snapshots = Vec::with_capacity(args.len());
                for &arg in args {
                    snapshots.push(self.snapshot_value(arg)?);
                }
                match host(&snapshots) {
                    Ok(value) => self.from_worker_value(&value)?,
                    Err(message) => return Err(self.throw_message(&message)),
                }
            }
            HostCallable::Blocking(_) => {
                let name = self.symbols.describe(name.as_symbol());
                return Err(VmError::ThreadPolicy(format!(
                    "cfunction {} is worker-only and cannot run on the interpreter thread",
                    name
                )));
            }
        };

        if push_return {
            self.push(result)?;
        }
        Ok(())
    }

    fn call_class(&mut self, class_value: Value, args: &[Value]) -> VmResult<()> {
        for &arg in args {
            self.heap.pin(arg);
        }
        self.heap.pin(class_value);
        let result = self.call_class_inner(class_value, args);
        self.heap.unpin(class_value);
        for &arg in args {
            self.heap.unpin(arg);
        }
        result
    }

    fn call_class_inner(&mut self, class_value: Value, args: &[Value]) -> VmResult<()> {
        let object = self.create_object(class_value)?;
        self.heap.pin(object);

        // Null-initialise member properties down the parent chain
        let mut klass = class_value;
        let mut properties = Vec::new();
        while klass.is_cell() {
            let Ok(data) = self.heap.class(klass.as_cell()) else { break };
            properties.extend(data.member_properties.iter().copied());
            klass = data.parent_class;
        }
        for property in properties {
            self.heap
                .object_mut(object.as_cell())?
                .container
                .insert(property, Value::null());
        }

        // First constructor up the chain wins
        let mut constructor = Value::null();
        let mut klass = class_value;
        while klass.is_cell() {
            let Ok(data) = self.heap.class(klass.as_cell()) else { break };
            if data.constructor.is_cell() {
                constructor = data.constructor;
                break;
            }
            klass = data.parent_class;
        }

        let result = if constructor.is_cell() {
            // The constructor frame pushes the object when it returns
            self.call_function(constructor, args, object, false, true)
        } else {
            self.push(object)
        };
        self.heap.unpin(object);
        result
    }

    // ========================================================================
    // Generators
    // ========================================================================

    /// Resume a generator by swapping execution state with its record
    fn resume_generator(&mut self, gen_value: Value, args: &[Value]) -> VmResult<()> {
        let gen_cell = gen_value.as_cell();
        let (finished, started) = {
            let data = self.heap.generator(gen_cell)?;
            (data.finished, data.started)
        };

        if finished {
            return self.push(Value::null());
        }

        let resume_argument = args.first().copied().unwrap_or_default();

        {
            let generator = self.heap.generator_mut(gen_cell)?;
            generator.started = true;
            std::mem::swap(&mut self.stack, &mut generator.stack);
            std::mem::swap(&mut self.frames, &mut generator.frame);
            std::mem::swap(&mut self.catchstack, &mut generator.catchtable);
            std::mem::swap(&mut self.ip, &mut generator.resume_address);
        }

        // The suspended yield expression resolves to the resume argument;
        // on the first resume execution starts at the body instead
        if started {
            self.push(resume_argument)?;
        }
        Ok(())
    }

    fn op_yield(&mut self) -> VmResult<()> {
        let value = self.pop()?;
        let Some(gen_cell) = self.find_running_generator()? else {
            return Err(self.throw_message("yield outside of a generator"));
        };

        {
            let generator = self.heap.generator_mut(gen_cell)?;
            std::mem::swap(&mut self.stack, &mut generator.stack);
            std::mem::swap(&mut self.frames, &mut generator.frame);
            std::mem::swap(&mut self.catchstack, &mut generator.catchtable);
            std::mem::swap(&mut self.ip, &mut generator.resume_address);
        }

        self.push(value)
    }

    /// Nearest generator root frame on the active chain
    pub(crate) fn find_running_generator(&self) -> VmResult<Option<CellRef>> {
        let mut frame = self.frames;
        while let Some(cell) = frame {
            let data = self.heap.frame(cell)?;
            if let Some(generator) = data.generator {
                return Ok(Some(generator));
            }
            frame = data.parent;
        }
        Ok(None)
    }

    /// Swap a dying generator's caller state back in and retire its record
    pub(crate) fn exit_generator(&mut self, gen_cell: CellRef) -> VmResult<()> {
        let generator = self.heap.generator_mut(gen_cell)?;
        generator.finished = true;
        self.stack = std::mem::take(&mut generator.stack);
        self.frames = generator.frame.take();
        self.catchstack = generator.catchtable.take();
        self.ip = generator.resume_address;
        Ok(())
    }

    // ========================================================================
    // Return
    // ========================================================================

    fn op_return(&mut self) -> VmResult<()> {
        let frame_ref = self
            .frames
            .ok_or_else(|| VmError::Panic("return without an active frame".to_string()))?;

        let (return_address, stacksize, halt_after_return, push_self_on_return, self_value, generator) = {
            let data = self.heap.frame(frame_ref)?;
            (
                data.return_address,
                data.stacksize,
                data.halt_after_return,
                data.push_self_on_return,
                data.self_value,
                data.generator,
            )
        };

        // Returning from a generator's root frame finishes the generator
        // and resolves the resume call with the returned value
        if let Some(gen_cell) = generator {
            let result = if self.stack.len() > stacksize {
                self.pop()?
            } else {
                Value::null()
            };
            self.exit_generator(gen_cell)?;
            return self.push(result);
        }

        let return_value = if self.stack.len() > stacksize {
            self.pop()?
        } else {
            Value::null()
        };

        self.pop_frame()?;
        self.stack.truncate(stacksize);
        let result = if push_self_on_return {
            self_value
        } else {
            return_value
        };
        self.push(result)?;

        match return_address {
            Some(address) => self.ip = address,
            None => self.halted = true,
        }
        if halt_after_return {
            self.halted = true;
        }
        Ok(())
    }
}

// ============================================================================
// Operand readers
// ============================================================================

#[inline]
fn read_u8(block: &InstructionBlock, offset: usize) -> VmResult<u8> {
    block
        .read_u8(offset)
        .map_err(|_| VmError::IpOutOfBounds(offset))
}

#[inline]
fn read_u32(block: &InstructionBlock, offset: usize) -> VmResult<u32> {
    block
        .read_u32(offset)
        .map_err(|_| VmError::IpOutOfBounds(offset))
}

#[inline]
fn read_i32(block: &InstructionBlock, offset: usize) -> VmResult<i32> {
    block
        .read_i32(offset)
        .map_err(|_| VmError::IpOutOfBounds(offset))
}

#[inline]
fn read_u64(block: &InstructionBlock, offset: usize) -> VmResult<u64> {
    block
        .read_u64(offset)
        .map_err(|_| VmError::IpOutOfBounds(offset))
}

#[inline]
fn read_f64(block: &InstructionBlock, offset: usize) -> VmResult<f64> {
    block
        .read_f64(offset)
        .map_err(|_| VmError::IpOutOfBounds(offset))
}

#[inline]
fn offset_target(instruction_start: usize, offset: i32) -> VmResult<usize> {
    let target = instruction_start as i64 + offset as i64;
    usize::try_from(target).map_err(|_| VmError::IpOutOfBounds(instruction_start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MachineOptions;
    use charly_bytecode::Assembler;

    fn run_block(build: impl FnOnce(&mut Assembler), lvarcount: u32) -> VmResult<Value> {
        let mut asm = Assembler::new();
        build(&mut asm);
        let block = asm.assemble().expect("assembly failed");
        let mut machine = Machine::new(MachineOptions::default());
        machine.execute(block, lvarcount)
    }

    #[test]
    fn test_halt_leaves_top_of_stack() {
        let result = run_block(
            |asm| {
                asm.put_int(42);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(42));
    }

    #[test]
    fn test_integer_arithmetic() {
        let result = run_block(
            |asm| {
                asm.put_int(10);
                asm.put_int(20);
                asm.add();
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(30));
    }

    #[test]
    fn test_division_promotes() {
        let result = run_block(
            |asm| {
                asm.put_int(10);
                asm.put_int(4);
                asm.div();
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert!(result.is_double());
        assert_eq!(result.as_double(), 2.5);
    }

    #[test]
    fn test_modulo_by_zero_is_nan() {
        let result = run_block(
            |asm| {
                asm.put_int(7);
                asm.put_int(0);
                asm.modulo();
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert!(result.is_nan());
    }

    #[test]
    fn test_locals() {
        // let a = 3; let b = 4; a * a + b * b
        let result = run_block(
            |asm| {
                asm.put_int(3);
                asm.set_local(0, 0);
                asm.put_int(4);
                asm.set_local(1, 0);
                asm.read_local(0, 0);
                asm.read_local(0, 0);
                asm.mul();
                asm.read_local(1, 0);
                asm.read_local(1, 0);
                asm.mul();
                asm.add();
                asm.halt();
            },
            2,
        )
        .unwrap();
        assert_eq!(result, Value::integer(25));
    }

    #[test]
    fn test_branching() {
        // if 10 > 5 { 1 } else { 0 }
        let result = run_block(
            |asm| {
                let else_branch = asm.label();
                let end = asm.label();
                asm.put_int(10);
                asm.put_int(5);
                asm.gt();
                asm.branch_unless(else_branch);
                asm.put_int(1);
                asm.branch(end);
                asm.place(else_branch);
                asm.put_int(0);
                asm.place(end);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(1));
    }

    #[test]
    fn test_fused_branch_loop() {
        // i = 0; while i < 5 { i = i + 1 }; i
        let result = run_block(
            |asm| {
                let top = asm.label();
                let done = asm.label();
                asm.put_int(0);
                asm.set_local(0, 0);
                asm.place(top);
                asm.read_local(0, 0);
                asm.put_int(5);
                asm.branch_ge(done);
                asm.read_local(0, 0);
                asm.put_int(1);
                asm.add();
                asm.set_local(0, 0);
                asm.branch(top);
                asm.place(done);
                asm.read_local(0, 0);
                asm.halt();
            },
            1,
        )
        .unwrap();
        assert_eq!(result, Value::integer(5));
    }

    #[test]
    fn test_string_concat() {
        let mut asm = Assembler::new();
        asm.put_string("hello ");
        asm.put_string("world");
        asm.add();
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(machine.string_bytes(&result).unwrap(), b"hello world");
    }

    #[test]
    fn test_string_number_concat() {
        let mut asm = Assembler::new();
        asm.put_string("n=");
        asm.put_int(5);
        asm.add();
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(machine.string_bytes(&result).unwrap(), b"n=5");
    }

    #[test]
    fn test_function_call_and_return() {
        // func add(a, b) { return a + b }; add(3, 4)
        let result = run_block(
            |asm| {
                let body = asm.label();
                let main = asm.label();
                asm.branch(main);
                asm.place(body);
                asm.read_local(0, 0);
                asm.read_local(1, 0);
                asm.add();
                asm.ret();
                asm.place(main);
                asm.put_function(0x1, body, 2, 2, 2, 0);
                asm.put_int(3);
                asm.put_int(4);
                asm.call(2);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(7));
    }

    #[test]
    fn test_missing_argument_throws() {
        let result = run_block(
            |asm| {
                let body = asm.label();
                let main = asm.label();
                asm.branch(main);
                asm.place(body);
                asm.put_null();
                asm.ret();
                asm.place(main);
                asm.put_function(0x1, body, 2, 2, 2, 0);
                asm.put_int(1);
                asm.call(1);
                asm.halt();
            },
            0,
        );
        assert!(matches!(result, Err(VmError::Exception(_))));
    }

    #[test]
    fn test_throw_and_catch() {
        // try { throw 7 } catch (e) { e + 1 }
        let result = run_block(
            |asm| {
                let handler = asm.label();
                let end = asm.label();
                asm.register_catchtable(handler);
                asm.put_int(7);
                asm.throw();
                asm.place(handler);
                asm.put_int(1);
                asm.add();
                asm.branch(end);
                asm.place(end);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(8));
    }

    #[test]
    fn test_catch_across_frames() {
        // try { f() } catch (e) { e } where f throws
        let result = run_block(
            |asm| {
                let body = asm.label();
                let handler = asm.label();
                let main = asm.label();
                asm.branch(main);
                asm.place(body);
                asm.put_int(99);
                asm.throw();
                asm.place(main);
                asm.register_catchtable(handler);
                asm.put_function(0x1, body, 0, 0, 0, 0);
                asm.call(0);
                asm.place(handler);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(99));
    }

    #[test]
    fn test_uncaught_exception_is_terminal() {
        let result = run_block(
            |asm| {
                asm.put_int(1);
                asm.throw();
            },
            0,
        );
        assert!(matches!(result, Err(VmError::Exception(_))));
    }

    #[test]
    fn test_pop_catchtable() {
        let result = run_block(
            |asm| {
                let handler = asm.label();
                asm.register_catchtable(handler);
                asm.pop_catchtable();
                asm.put_int(5);
                asm.halt();
                asm.place(handler);
                asm.put_int(0);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(5));
    }

    #[test]
    fn test_array_literal_and_index() {
        let result = run_block(
            |asm| {
                asm.put_int(10);
                asm.put_int(20);
                asm.put_int(30);
                asm.put_array(3);
                asm.read_array_index(1);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(20));
    }

    #[test]
    fn test_array_negative_index_wraps_once() {
        let result = run_block(
            |asm| {
                asm.put_int(10);
                asm.put_int(20);
                asm.put_int(30);
                asm.put_array(3);
                asm.read_array_index(-1);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(30));
    }

    #[test]
    fn test_array_out_of_range_read_is_null() {
        let result = run_block(
            |asm| {
                asm.put_int(1);
                asm.put_array(1);
                asm.read_array_index(5);
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn test_array_out_of_range_write_throws() {
        let result = run_block(
            |asm| {
                asm.put_int(1);
                asm.put_array(1);
                asm.put_int(9);
                asm.set_array_index(5);
                asm.halt();
            },
            0,
        );
        assert!(matches!(result, Err(VmError::Exception(_))));
    }

    #[test]
    fn test_object_literal_and_member_access() {
        let mut asm = Assembler::new();
        let key = crate::symbol::symbol_hash("answer");
        asm.put_string("answer");
        asm.put_int(42);
        asm.put_hash(1);
        asm.read_member_symbol(key);
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(result, Value::integer(42));
    }

    #[test]
    fn test_set_member_symbol() {
        let mut asm = Assembler::new();
        let key = crate::symbol::symbol_hash("x");
        asm.put_hash(0);
        asm.set_local(0, 0);
        asm.read_local(0, 0);
        asm.put_int(5);
        asm.set_member_symbol(key);
        asm.read_local(0, 0);
        asm.read_member_symbol(key);
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 1).unwrap();
        assert_eq!(result, Value::integer(5));
    }

    #[test]
    fn test_typeof() {
        let mut asm = Assembler::new();
        asm.put_int(1);
        asm.type_of();
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(machine.string_bytes(&result).unwrap(), b"integer");
    }

    #[test]
    fn test_unknown_global_throws() {
        let result = run_block(
            |asm| {
                asm.read_global(0xDEAD_BEEF);
                asm.halt();
            },
            0,
        );
        assert!(matches!(result, Err(VmError::Exception(_))));
    }

    #[test]
    fn test_shift_and_bitwise() {
        let result = run_block(
            |asm| {
                asm.put_int(1);
                asm.put_int(4);
                asm.shl();
                asm.put_int(0xFF);
                asm.band();
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(16));
    }

    #[test]
    fn test_invalid_opcode_is_a_panic() {
        let mut machine = Machine::default();
        let block = InstructionBlock {
            data: vec![0xEE],
            ..Default::default()
        };
        let result = machine.execute(block, 0);
        assert!(matches!(result, Err(VmError::InvalidOpcode(0xEE))));
    }

    #[test]
    fn test_stack_plumbing_ops() {
        let result = run_block(
            |asm| {
                asm.put_int(1);
                asm.put_int(2);
                asm.swap(); // [2, 1]
                asm.pop(); // [2]
                asm.dup(); // [2, 2]
                asm.add(); // [4]
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(4));
    }

    #[test]
    fn test_topn_setn() {
        let result = run_block(
            |asm| {
                asm.put_int(7);
                asm.put_int(8);
                asm.put_int(9);
                asm.topn(2); // copy the 7 to the top
                asm.halt();
            },
            0,
        )
        .unwrap();
        assert_eq!(result, Value::integer(7));
    }
}
