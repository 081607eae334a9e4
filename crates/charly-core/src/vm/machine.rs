//! Machine context
//!
//! [`Machine`] carries everything the interpreter mutates: the heap, the
//! operand stack, the frame and catch-table chains, the globals object, the
//! primitive-class registry and the scheduler. It is passed explicitly
//! through the interpreter and the host-function ABI; there are no
//! process-wide statics.

use crate::heap::{
    trace_kind, CFunctionData, CatchTableData, CellKind, CellRef, ClassData, FrameData,
    FunctionData, GcConfig, Heap, Locals, ObjectData, StringData,
};
use crate::scheduler::{Fiber, Scheduler, VmTask, WorkerValue};
use crate::symbol::{symbol_hash, SymbolTable};
use crate::value::Value;
use crate::vm::HostCallable;
use crate::{VmError, VmResult};
use charly_bytecode::InstructionBlock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Machine construction options
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Heap configuration
    pub gc: GcConfig,
    /// Operand stack ceiling, in slots
    pub max_stack: usize,
    /// Log executed opcodes to stderr
    pub trace_opcodes: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            max_stack: 1 << 16,
            trace_opcodes: false,
        }
    }
}

/// The built-in classes used as fallback prototypes per value kind
#[derive(Debug, Default, Clone)]
pub struct Primitives {
    /// Arrays
    pub array: Value,
    /// Booleans
    pub boolean: Value,
    /// Classes
    pub class: Value,
    /// Functions and host functions
    pub function: Value,
    /// Generators
    pub generator: Value,
    /// Null
    pub null: Value,
    /// Integers and doubles
    pub number: Value,
    /// Objects
    pub object: Value,
    /// Strings
    pub string: Value,
    /// Fallback for every value
    pub value: Value,
}

impl Primitives {
    /// All primitive-class references, for rooting
    pub fn values(&self) -> [Value; 10] {
        [
            self.array,
            self.boolean,
            self.class,
            self.function,
            self.generator,
            self.null,
            self.number,
            self.object,
            self.string,
            self.value,
        ]
    }
}

/// Parameters for [`Machine::create_frame`]
#[derive(Debug, Clone, Copy)]
pub struct FrameInit {
    /// Self value inside the frame
    pub self_value: Value,
    /// The function value being called (null at the root)
    pub caller: Value,
    /// Lexical environment frame
    pub environment: Option<CellRef>,
    /// Local slot count
    pub lvarcount: u32,
    /// Where execution resumes after return
    pub return_address: Option<usize>,
    /// Entry offset of the body
    pub origin_address: usize,
    /// Return hands control back to the scheduler
    pub halt_after_return: bool,
    /// Return pushes self instead of the popped return value
    pub push_self_on_return: bool,
    /// Generator whose root frame this is
    pub generator: Option<CellRef>,
}

impl FrameInit {
    /// A plain call frame
    pub fn call(self_value: Value, caller: Value, environment: Option<CellRef>, lvarcount: u32) -> Self {
        Self {
            self_value,
            caller,
            environment,
            lvarcount,
            return_address: None,
            origin_address: 0,
            halt_after_return: false,
            push_self_on_return: false,
            generator: None,
        }
    }
}

/// The virtual machine context
pub struct Machine {
    pub(crate) heap: Heap,
    pub(crate) symbols: SymbolTable,
    pub(crate) block: Arc<InstructionBlock>,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Option<CellRef>,
    pub(crate) catchstack: Option<CellRef>,
    pub(crate) ip: usize,
    pub(crate) halted: bool,
    pub(crate) globals: Value,
    pub(crate) primitives: Primitives,
    pub(crate) uncaught_exception_handler: Value,
    pub(crate) internal_error_class: Value,
    pub(crate) scheduler: Scheduler,
    pub(crate) options: MachineOptions,
}

impl Machine {
    /// Create a machine and bootstrap its runtime objects
    pub fn new(options: MachineOptions) -> Self {
        let mut machine = Self {
            heap: Heap::new(options.gc.clone()),
            symbols: SymbolTable::new(),
            block: Arc::new(InstructionBlock::new()),
            stack: Vec::new(),
            frames: None,
            catchstack: None,
            ip: 0,
            halted: true,
            globals: Value::null(),
            primitives: Primitives::default(),
            uncaught_exception_handler: Value::null(),
            internal_error_class: Value::null(),
            scheduler: Scheduler::new(),
            options,
        };
        machine.bootstrap();
        machine
    }

    fn bootstrap(&mut self) {
        // A fresh heap cannot be exhausted by the handful of bootstrap cells
        self.globals = self
            .create_object(Value::null())
            .expect("bootstrap allocation");
        self.primitives.array = self.create_class("Array").expect("bootstrap allocation");
        self.primitives.boolean = self.create_class("Boolean").expect("bootstrap allocation");
        self.primitives.class = self.create_class("Class").expect("bootstrap allocation");
        self.primitives.function = self.create_class("Function").expect("bootstrap allocation");
        self.primitives.generator = self.create_class("Generator").expect("bootstrap allocation");
        self.primitives.null = self.create_class("Null").expect("bootstrap allocation");
        self.primitives.number = self.create_class("Number").expect("bootstrap allocation");
        self.primitives.object = self.create_class("Object").expect("bootstrap allocation");
        self.primitives.string = self.create_class("String").expect("bootstrap allocation");
        self.primitives.value = self.create_class("Value").expect("bootstrap allocation");
        self.internal_error_class = self
            .create_class("InternalError")
            .expect("bootstrap allocation");
        crate::builtins::install(self);
    }

    // ========================================================================
    // Public accessors
    // ========================================================================

    /// The heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The symbol table
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The symbol table, mutably
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The scheduler, mutably
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Current operand stack contents
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Top of the operand stack
    pub fn stack_top(&self) -> Option<Value> {
        self.stack.last().copied()
    }

    /// Number of active frames
    pub fn frame_count(&self) -> usize {
        let mut count = 0;
        let mut frame = self.frames;
        while let Some(cell) = frame {
            count += 1;
            frame = self.heap.frame(cell).ok().and_then(|f| f.parent);
        }
        count
    }

    /// Number of registered catch tables
    pub fn catch_depth(&self) -> usize {
        let mut count = 0;
        let mut table = self.catchstack;
        while let Some(cell) = table {
            count += 1;
            table = self.heap.catchtable(cell).ok().and_then(|t| t.parent);
        }
        count
    }

    /// The globals object
    pub fn globals_value(&self) -> Value {
        self.globals
    }

    /// The primitive-class registry
    pub fn primitives(&self) -> &Primitives {
        &self.primitives
    }

    /// Install the uncaught-exception handler (a function value)
    pub fn set_uncaught_exception_handler(&mut self, handler: Value) {
        self.uncaught_exception_handler = handler;
    }

    // ========================================================================
    // Operand stack
    // ========================================================================

    /// Push a value
    #[inline]
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.options.max_stack {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop a value
    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Peek at the top value
    #[inline]
    pub fn peek(&self) -> VmResult<Value> {
        self.stack.last().copied().ok_or(VmError::StackUnderflow)
    }

    // ========================================================================
    // Allocation & collection
    // ========================================================================

    /// Allocate a cell, collecting and growing as the contract requires
    ///
    /// The payload being allocated is itself rooted during any collection
    /// this triggers, so callers may build it from values they already
    /// popped off the operand stack.
    pub fn allocate(&mut self, kind: CellKind) -> VmResult<CellRef> {
        if self.heap.needs_collection() || self.heap.free_cells() == 0 {
            let mut roots = self.gather_roots();
            trace_kind(&kind, &mut roots);
            self.heap.collect(&roots);
            if self.heap.free_cells() == 0 {
                self.heap.grow();
            }
        }
        self.heap.allocate(kind).ok_or(VmError::OutOfMemory)
    }

    /// Assemble the full root set
    pub fn gather_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(self.stack.len() + 32);
        roots.extend(self.stack.iter().copied());
        if let Some(frame) = self.frames {
            roots.push(Value::cell(frame));
        }
        if let Some(table) = self.catchstack {
            roots.push(Value::cell(table));
        }
        roots.push(self.globals);
        roots.extend(self.primitives.values());
        roots.push(self.uncaught_exception_handler);
        roots.push(self.internal_error_class);
        self.scheduler.trace_roots(&mut roots);
        roots
    }

    /// Run a collection over the current root set
    pub fn collect_garbage(&mut self) {
        let roots = self.gather_roots();
        self.heap.collect(&roots);
    }

    /// Pin a temporary so it survives collections without another root
    pub fn pin_temporary(&mut self, value: Value) {
        self.heap.pin(value);
    }

    /// Release a pinned temporary
    pub fn unpin_temporary(&mut self, value: Value) {
        self.heap.unpin(value);
    }

    // ========================================================================
    // Value construction
    // ========================================================================

    /// Create an object of a class
    pub fn create_object(&mut self, klass: Value) -> VmResult<Value> {
        let cell = self.allocate(CellKind::Object(ObjectData::new(klass)))?;
        Ok(Value::cell(cell))
    }

    /// Create an array from its elements
    pub fn create_array(&mut self, elements: Vec<Value>) -> VmResult<Value> {
        let cell = self.allocate(CellKind::Array(crate::heap::ArrayData::new(elements)))?;
        Ok(Value::cell(cell))
    }

    /// Create a string, choosing the immediate form when it fits
    pub fn create_string(&mut self, bytes: &[u8]) -> VmResult<Value> {
        if let Some(value) = Value::immediate_string(bytes) {
            return Ok(value);
        }
        let cell = self.allocate(CellKind::Str(StringData::new(bytes)))?;
        Ok(Value::cell(cell))
    }

    /// Create a string from UTF-8 text
    pub fn create_str(&mut self, text: &str) -> VmResult<Value> {
        self.create_string(text.as_bytes())
    }

    /// Create an empty class with a fresh prototype object
    pub fn create_class(&mut self, name: &str) -> VmResult<Value> {
        let name = self.symbols.intern(name);
        let prototype = self.create_object(Value::null())?;
        let cell = self.allocate(CellKind::Class(ClassData {
            name,
            constructor: Value::null(),
            prototype,
            parent_class: Value::null(),
            member_properties: Box::default(),
            container: Box::default(),
        }))?;
        Ok(Value::cell(cell))
    }

    /// Create a host function
    pub fn create_cfunction(
        &mut self,
        name: &str,
        argc: u32,
        callable: HostCallable,
    ) -> VmResult<Value> {
        let name = self.symbols.intern(name);
        let cell = self.allocate(CellKind::CFunction(CFunctionData {
            name,
            callable,
            argc,
            push_return: true,
            container: Box::default(),
        }))?;
        Ok(Value::cell(cell))
    }

    /// Create an error object of the internal error class
    pub fn create_error(&mut self, message: &str) -> VmResult<Value> {
        let text = self.create_str(message)?;
        self.heap.pin(text);
        let object = self.create_object(self.internal_error_class);
        self.heap.unpin(text);
        let object = object?;
        let key = self.symbols.intern("message");
        self.heap
            .object_mut(object.as_cell())?
            .container
            .insert(key, text);
        Ok(object)
    }

    /// Copy a function cell, rebinding its self value
    ///
    /// Used by `super` resolution and member calls that need a bound
    /// receiver without mutating the shared function.
    pub fn copy_function_with_self(&mut self, function: Value, bound_self: Value) -> VmResult<Value> {
        let data = self.heap.function(function.as_cell())?;
        let kind = CellKind::Function(FunctionData {
            name: data.name,
            argc: data.argc,
            minimum_argc: data.minimum_argc,
            lvarcount: data.lvarcount,
            context: data.context,
            body_address: data.body_address,
            bound_self: Some(bound_self),
            host_class: data.host_class,
            container: data.container.clone(),
            anonymous: data.anonymous,
            needs_arguments: data.needs_arguments,
        });
        let cell = self.allocate(kind)?;
        Ok(Value::cell(cell))
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// Whether a value is a string in any physical form
    pub fn is_string_value(&self, value: Value) -> bool {
        value.is_immediate_string()
            || (value.is_cell() && self.heap.string(value.as_cell()).is_ok())
    }

    /// Borrow the bytes of a string in any physical form
    pub fn string_bytes<'a>(&'a self, value: &'a Value) -> Option<&'a [u8]> {
        if let Some(bytes) = value.immediate_string_bytes() {
            return Some(bytes);
        }
        if value.is_cell() {
            if let Ok(string) = self.heap.string(value.as_cell()) {
                return Some(string.as_bytes());
            }
        }
        None
    }

    /// Byte length of a string in any physical form
    pub fn string_length(&self, value: Value) -> Option<usize> {
        if value.is_immediate_string() {
            return Some(value.immediate_string_len());
        }
        if value.is_cell() {
            if let Ok(string) = self.heap.string(value.as_cell()) {
                return Some(string.len());
            }
        }
        None
    }

    pub(crate) fn string_owned(&self, value: Value) -> Option<Vec<u8>> {
        self.string_bytes(&value).map(|bytes| bytes.to_vec())
    }

    // ========================================================================
    // Semantics shared between opcodes
    // ========================================================================

    /// Language-level truthiness
    ///
    /// False for: false, null, integer zero, ±0.0, NaN and finished
    /// generators.
    pub fn truthyness(&self, value: Value) -> bool {
        if value.is_cell() {
            if let Ok(generator) = self.heap.generator(value.as_cell()) {
                return !generator.finished;
            }
            return true;
        }
        value.is_truthy_immediate()
    }

    /// Language-level equality: strings compare by bytes, numbers by value,
    /// everything else by identity
    pub fn values_equal(&self, left: Value, right: Value) -> bool {
        if self.is_string_value(left) && self.is_string_value(right) {
            return self.string_bytes(&left) == self.string_bytes(&right);
        }
        left.strict_equals(right)
    }

    /// Language-level ordering: numeric promotion or lexicographic bytes
    pub fn compare_values(&self, left: Value, right: Value) -> Option<std::cmp::Ordering> {
        if left.is_numeric() && right.is_numeric() {
            return crate::value::compare(left, right);
        }
        if self.is_string_value(left) && self.is_string_value(right) {
            return Some(self.string_bytes(&left).cmp(&self.string_bytes(&right)));
        }
        None
    }

    /// Render a value for display and string coercion
    pub fn to_display_string(&self, value: Value) -> String {
        self.render(value, 0)
    }

    fn render(&self, value: Value, depth: usize) -> String {
        if value.is_null() {
            return "null".to_string();
        }
        if value.is_boolean() {
            return value.as_boolean().to_string();
        }
        if value.is_integer() {
            return value.as_integer().to_string();
        }
        if value.is_double() {
            let d = value.as_double();
            return if d.is_nan() { "NaN".to_string() } else { format!("{}", d) };
        }
        if value.is_symbol() {
            return self.symbols.describe(value.as_symbol());
        }
        if let Some(bytes) = self.string_bytes(&value) {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        if !value.is_cell() {
            return "<value>".to_string();
        }

        let cell = value.as_cell();
        if let Ok(array) = self.heap.array(cell) {
            if depth >= 4 {
                return "[...]".to_string();
            }
            let items: Vec<String> = array
                .data
                .iter()
                .map(|&item| self.render(item, depth + 1))
                .collect();
            return format!("[{}]", items.join(", "));
        }
        if let Ok(function) = self.heap.function(cell) {
            return format!("<function {}>", self.symbols.describe(function.name.as_symbol()));
        }
        if let Ok(cfunction) = self.heap.cfunction(cell) {
            return format!("<cfunction {}>", self.symbols.describe(cfunction.name.as_symbol()));
        }
        if let Ok(generator) = self.heap.generator(cell) {
            return format!("<generator {}>", self.symbols.describe(generator.name.as_symbol()));
        }
        if let Ok(class) = self.heap.class(cell) {
            return format!("<class {}>", self.symbols.describe(class.name.as_symbol()));
        }
        if self.heap.object(cell).is_ok() {
            return "<object>".to_string();
        }
        format!("<{}>", self.heap.kind_name(value))
    }

    /// Coerce any value to the symbol of its canonical rendering
    pub fn value_to_symbol(&mut self, value: Value) -> Value {
        if value.is_symbol() {
            return value;
        }
        let rendered = self.to_display_string(value);
        self.symbols.intern(&rendered)
    }

    // ========================================================================
    // Member lookup
    // ========================================================================

    /// Resolve `target.<symbol>` following the container / prototype-chain /
    /// primitive-class order
    pub fn resolve_member(&self, target: Value, symbol: Value) -> Option<Value> {
        if target.is_cell() {
            let cell = target.as_cell();
            if let Ok(object) = self.heap.object(cell) {
                if let Some(&found) = object.container.get(&symbol) {
                    return Some(found);
                }
                return self
                    .lookup_class_chain(object.klass, symbol)
                    .or_else(|| self.lookup_primitive(self.primitives.object, symbol));
            }
            if self.heap.class(cell).is_ok() {
                let mut klass = target;
                while klass.is_cell() {
                    let Ok(data) = self.heap.class(klass.as_cell()) else { break };
                    if let Some(&found) = data.container.get(&symbol) {
                        return Some(found);
                    }
                    klass = data.parent_class;
                }
                return self.lookup_primitive(self.primitives.class, symbol);
            }
            if let Ok(function) = self.heap.function(cell) {
                if let Some(&found) = function.container.get(&symbol) {
                    return Some(found);
                }
                return self.lookup_primitive(self.primitives.function, symbol);
            }
            if let Ok(cfunction) = self.heap.cfunction(cell) {
                if let Some(&found) = cfunction.container.get(&symbol) {
                    return Some(found);
                }
                return self.lookup_primitive(self.primitives.function, symbol);
            }
            if let Ok(generator) = self.heap.generator(cell) {
                if let Some(&found) = generator.container.get(&symbol) {
                    return Some(found);
                }
                return self.lookup_primitive(self.primitives.generator, symbol);
            }
            if self.heap.array(cell).is_ok() {
                return self.lookup_primitive(self.primitives.array, symbol);
            }
            if self.heap.string(cell).is_ok() {
                return self.lookup_primitive(self.primitives.string, symbol);
            }
            return None;
        }

        let primitive = if value_is_number(target) {
            self.primitives.number
        } else if target.is_boolean() {
            self.primitives.boolean
        } else if target.is_null() {
            self.primitives.null
        } else if target.is_immediate_string() {
            self.primitives.string
        } else {
            self.primitives.value
        };
        self.lookup_primitive(primitive, symbol)
    }

    /// Walk a class's prototype chain
    pub fn lookup_class_chain(&self, klass: Value, symbol: Value) -> Option<Value> {
        let mut current = klass;
        while current.is_cell() {
            let Ok(class) = self.heap.class(current.as_cell()) else {
                return None;
            };
            if let Ok(prototype) = self.heap.object(class.prototype.as_cell()) {
                if let Some(&found) = prototype.container.get(&symbol) {
                    return Some(found);
                }
            }
            current = class.parent_class;
        }
        None
    }

    fn lookup_primitive(&self, primitive: Value, symbol: Value) -> Option<Value> {
        self.lookup_class_chain(primitive, symbol).or_else(|| {
            if primitive.raw() != self.primitives.value.raw() {
                self.lookup_class_chain(self.primitives.value, symbol)
            } else {
                None
            }
        })
    }

    /// Write `target.<symbol>`; only container-bearing cells accept writes
    pub fn set_member(&mut self, target: Value, symbol: Value, value: Value) -> VmResult<()> {
        if target.is_cell() {
            let cell = target.as_cell();
            if let Ok(object) = self.heap.object_mut(cell) {
                object.container.insert(symbol, value);
                return Ok(());
            }
            if let Ok(class) = self.heap.class_mut(cell) {
                class.container.insert(symbol, value);
                return Ok(());
            }
            if let Ok(function) = self.heap.function_mut(cell) {
                function.container.insert(symbol, value);
                return Ok(());
            }
            if let Ok(cfunction) = self.heap.cfunction_mut(cell) {
                cfunction.container.insert(symbol, value);
                return Ok(());
            }
            if let Ok(generator) = self.heap.generator_mut(cell) {
                generator.container.insert(symbol, value);
                return Ok(());
            }
        }
        let kind = self.heap.kind_name(target);
        Err(self.throw_message(&format!("cannot assign a member to a value of type {}", kind)))
    }

    // ========================================================================
    // Globals
    // ========================================================================

    /// Define or overwrite a global by name
    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let symbol = self.symbols.intern(name);
        self.heap
            .object_mut(self.globals.as_cell())?
            .container
            .insert(symbol, value);
        Ok(())
    }

    /// Read a global by name
    pub fn global(&self, name: &str) -> Option<Value> {
        let symbol = Value::symbol(symbol_hash(name));
        self.heap
            .object(self.globals.as_cell())
            .ok()?
            .container
            .get(&symbol)
            .copied()
    }

    // ========================================================================
    // Frames & locals
    // ========================================================================

    /// Push a new frame; records the current catch chain and stack depth
    pub fn create_frame(&mut self, init: FrameInit) -> VmResult<CellRef> {
        let kind = CellKind::Frame(FrameData {
            parent: self.frames,
            environment: init.environment,
            catchtable: self.catchstack,
            caller: init.caller,
            self_value: init.self_value,
            origin_address: init.origin_address,
            return_address: init.return_address,
            stacksize: self.stack.len(),
            halt_after_return: init.halt_after_return,
            push_self_on_return: init.push_self_on_return,
            generator: init.generator,
            locals: Locals::new(init.lvarcount as usize),
        });
        let cell = self.allocate(kind)?;
        self.frames = Some(cell);
        Ok(cell)
    }

    /// Pop the active frame, restoring its entry catch chain
    pub fn pop_frame(&mut self) -> VmResult<CellRef> {
        let frame = self
            .frames
            .ok_or_else(|| VmError::Panic("no frame to pop".to_string()))?;
        let data = self.heap.frame(frame)?;
        self.frames = data.parent;
        self.catchstack = data.catchtable;
        Ok(frame)
    }

    /// The active frame
    pub fn current_frame(&self) -> Option<CellRef> {
        self.frames
    }

    fn environment_at(&self, level: u32) -> VmResult<CellRef> {
        let mut frame = self
            .frames
            .ok_or_else(|| VmError::BadLocalAccess("no active frame".to_string()))?;
        for step in 0..level {
            frame = self.heap.frame(frame)?.environment.ok_or_else(|| {
                VmError::BadLocalAccess(format!(
                    "lexical level {} exceeds environment depth {}",
                    level, step
                ))
            })?;
        }
        Ok(frame)
    }

    /// Read local `index` after walking `level` lexical parents
    pub fn read_local(&self, index: u32, level: u32) -> VmResult<Value> {
        let frame = self.environment_at(level)?;
        self.heap
            .frame(frame)?
            .locals
            .get(index as usize)
            .ok_or_else(|| VmError::BadLocalAccess(format!("local index {} out of range", index)))
    }

    /// Write local `index` after walking `level` lexical parents
    pub fn write_local(&mut self, index: u32, level: u32, value: Value) -> VmResult<()> {
        let frame = self.environment_at(level)?;
        if self.heap.frame_mut(frame)?.locals.set(index as usize, value) {
            Ok(())
        } else {
            Err(VmError::BadLocalAccess(format!(
                "local index {} out of range",
                index
            )))
        }
    }

    // ========================================================================
    // Catch tables & unwinding
    // ========================================================================

    /// Register a handler at an absolute offset
    pub fn register_catchtable(&mut self, address: usize) -> VmResult<CellRef> {
        let kind = CellKind::CatchTable(CatchTableData {
            address,
            stacksize: self.stack.len(),
            frame: self.frames,
            parent: self.catchstack,
        });
        let cell = self.allocate(kind)?;
        self.catchstack = Some(cell);
        Ok(cell)
    }

    /// Pop the topmost catch table
    pub fn pop_catchtable(&mut self) -> VmResult<()> {
        let table = self
            .catchstack
            .ok_or_else(|| VmError::Panic("catch chain is empty".to_string()))?;
        self.catchstack = self.heap.catchtable(table)?.parent;
        Ok(())
    }

    fn frame_on_chain(&self, target: CellRef) -> bool {
        let mut frame = self.frames;
        while let Some(cell) = frame {
            if cell == target {
                return true;
            }
            frame = self.heap.frame(cell).ok().and_then(|f| f.parent);
        }
        false
    }

    /// Unwind the catch chain with an in-flight payload
    ///
    /// Discards handlers whose frames already returned, pops frames until
    /// the handler's frame is active, trims the operand stack, pushes the
    /// payload and jumps to the handler. With no handler left, the uncaught
    /// handler runs (once) or the exception becomes terminal.
    pub fn unwind_catchstack(&mut self, payload: Option<Value>) -> VmResult<()> {
        let table = loop {
            let Some(table_ref) = self.catchstack else {
                // A generator that exits throwing propagates into the catch
                // chain of its resumer
                if let Some(generator) = self.find_running_generator()? {
                    self.exit_generator(generator)?;
                    continue;
                }
                let handler = self.uncaught_exception_handler;
                let payload = payload.unwrap_or_default();
                if handler.is_cell() && self.heap.function(handler.as_cell()).is_ok() {
                    // One shot; the handler may re-register itself
                    self.uncaught_exception_handler = Value::null();
                    self.call_function_value(handler, &[payload], Value::null(), true)?;
                    return Ok(());
                }
                return Err(VmError::Exception(payload));
            };
            let data = self.heap.catchtable(table_ref)?;
            let frame = data.frame;
            match frame {
                Some(frame) if !self.frame_on_chain(frame) => {
                    // Stale handler of a frame that already returned
                    self.catchstack = data.parent;
                }
                _ => {
                    break (data.address, data.stacksize, frame, data.parent);
                }
            }
        };
        let (address, stacksize, frame, parent) = table;

        while self.frames != frame {
            let current = self
                .frames
                .ok_or_else(|| VmError::Panic("unwind lost the handler frame".to_string()))?;
            self.frames = self.heap.frame(current)?.parent;
        }

        self.stack.truncate(stacksize);
        if let Some(payload) = payload {
            self.push(payload)?;
        }
        self.ip = address;
        self.catchstack = parent;
        Ok(())
    }

    /// Build a user exception carrying an error object with a message
    pub fn throw_message(&mut self, message: &str) -> VmError {
        match self.create_error(message) {
            Ok(value) => VmError::Exception(value),
            Err(error) => error,
        }
    }

    /// Render an uncaught exception with the active call chain
    pub fn render_stack_trace(&self, payload: Value) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Uncaught exception: {}\n",
            self.describe_exception(payload)
        ));
        let mut frame = self.frames;
        while let Some(cell) = frame {
            let Ok(data) = self.heap.frame(cell) else { break };
            let name = if data.caller.is_cell() {
                match self.heap.function(data.caller.as_cell()) {
                    Ok(function) => self.symbols.describe(function.name.as_symbol()),
                    Err(_) => "<main>".to_string(),
                }
            } else {
                "<main>".to_string()
            };
            match self.block.lookup_line(data.origin_address) {
                Some(entry) => out.push_str(&format!(
                    "  at {} ({}:{})\n",
                    name, entry.line, entry.column
                )),
                None => out.push_str(&format!("  at {} (+{:#x})\n", name, data.origin_address)),
            }
            frame = data.parent;
        }
        out
    }

    fn describe_exception(&self, payload: Value) -> String {
        // Error objects render through their message property
        if payload.is_cell() {
            if let Ok(object) = self.heap.object(payload.as_cell()) {
                let key = Value::symbol(symbol_hash("message"));
                if let Some(&message) = object.container.get(&key) {
                    return self.to_display_string(message);
                }
            }
        }
        self.to_display_string(payload)
    }

    // ========================================================================
    // Scheduler facade
    // ========================================================================

    /// Enqueue a callback task
    pub fn enqueue_callback(&mut self, func: Value, args: &[Value]) {
        let uid = self.scheduler.next_uid();
        self.scheduler.enqueue(VmTask::callback(uid, func, args));
    }

    /// Register a one-shot timer; returns its cancellation id
    pub fn register_timer(&mut self, delay: Duration, func: Value, args: &[Value]) -> u64 {
        let uid = self.scheduler.next_uid();
        let task = VmTask::callback(uid, func, args);
        self.scheduler.register_timer(delay, task)
    }

    /// Register a periodic ticker; returns its cancellation id
    pub fn register_ticker(&mut self, period: Duration, func: Value, args: &[Value]) -> u64 {
        let uid = self.scheduler.next_uid();
        let task = VmTask::callback(uid, func, args);
        self.scheduler.register_ticker(period, task)
    }

    /// Cancel a timer
    pub fn clear_timer(&mut self, id: u64) {
        self.scheduler.clear_timer(id);
    }

    /// Cancel a ticker
    pub fn clear_ticker(&mut self, id: u64) {
        self.scheduler.clear_ticker(id);
    }

    /// Suspend the current execution state into a fiber
    ///
    /// The operand stack is moved out, the machine halts, and the returned
    /// id resumes the fiber through [`Machine::resume_fiber`].
    pub fn suspend_fiber(&mut self) -> u64 {
        let id = self.scheduler.next_uid();
        let fiber = Fiber {
            id,
            stack: std::mem::take(&mut self.stack),
            frame: self.frames.take(),
            catchtable: self.catchstack.take(),
            resume_address: self.ip,
        };
        self.scheduler.park_fiber(fiber);
        self.halted = true;
        id
    }

    /// Enqueue a resume of a suspended fiber
    pub fn resume_fiber(&mut self, id: u64, argument: Value) {
        self.scheduler.resume_fiber(id, argument);
    }

    /// Snapshot a value for the worker boundary
    ///
    /// Mutable heap values are rejected with a user exception; workers only
    /// ever see immutable copies.
    pub fn snapshot_value(&mut self, value: Value) -> VmResult<WorkerValue> {
        if value.is_null() {
            return Ok(WorkerValue::Null);
        }
        if value.is_boolean() {
            return Ok(WorkerValue::Bool(value.as_boolean()));
        }
        if value.is_integer() {
            return Ok(WorkerValue::Int(value.as_integer()));
        }
        if value.is_double() {
            return Ok(WorkerValue::Float(value.as_double()));
        }
        if let Some(bytes) = self.string_owned(value) {
            return Ok(WorkerValue::Str(String::from_utf8_lossy(&bytes).into_owned()));
        }
        let kind = self.heap.kind_name(value);
        Err(self.throw_message(&format!(
            "cannot pass a mutable {} across the worker boundary",
            kind
        )))
    }

    /// Convert a worker result back into a heap value
    pub fn from_worker_value(&mut self, value: &WorkerValue) -> VmResult<Value> {
        match value {
            WorkerValue::Null => Ok(Value::null()),
            WorkerValue::Bool(b) => Ok(Value::boolean(*b)),
            WorkerValue::Int(i) => Ok(Value::number(*i)),
            WorkerValue::Float(f) => Ok(Value::double(*f)),
            WorkerValue::Str(s) => self.create_str(s),
        }
    }

    /// Spawn a worker thread for a blocking host function
    ///
    /// Arguments are snapshot at the boundary; the callback runs on the main
    /// thread with the result (or an error object) once the worker finishes.
    pub fn start_worker_thread(
        &mut self,
        cfunction: Value,
        args: &[Value],
        callback: Value,
    ) -> VmResult<u64> {
        if !cfunction.is_cell() {
            return Err(VmError::TypeError("worker target must be a cfunction".to_string()));
        }
        let callable = self.heap.cfunction(cfunction.as_cell())?.callable;
        let func = match callable {
            HostCallable::Main(_) => {
                return Err(VmError::ThreadPolicy(
                    "main-only cfunction cannot run on a worker thread".to_string(),
                ))
            }
            HostCallable::Pure(func) | HostCallable::Blocking(func) => func,
        };
        let mut snapshots = Vec::with_capacity(args.len());
        for &arg in args {
            snapshots.push(self.snapshot_value(arg)?);
        }
        self.scheduler
            .start_worker(func, snapshots, callback)
            .map_err(|error| VmError::Panic(format!("failed to spawn worker thread: {}", error)))
    }

    // ========================================================================
    // Program entry points
    // ========================================================================

    /// Install an instruction block, resetting the instruction pointer
    ///
    /// The block's symbol-name table is merged so diagnostics can print the
    /// names behind embedded hashes.
    pub fn load(&mut self, block: InstructionBlock) {
        for (hash, name) in &block.symbol_names {
            self.symbols.register(*hash, name);
        }
        self.block = Arc::new(block);
        self.ip = 0;
    }

    /// Execute a block's top level synchronously
    ///
    /// A root frame with `lvarcount` locals is pushed; execution ends at a
    /// `Halt` opcode or when the root frame returns. The value left on top
    /// of the operand stack is returned.
    pub fn execute(&mut self, block: InstructionBlock, lvarcount: u32) -> VmResult<Value> {
        self.load(block);
        self.stack.clear();
        self.frames = None;
        self.catchstack = None;
        let mut init = FrameInit::call(Value::null(), Value::null(), None, lvarcount);
        init.halt_after_return = true;
        self.create_frame(init)?;
        self.ip = 0;
        self.halted = false;

        match self.run() {
            Ok(()) => Ok(self.stack.last().copied().unwrap_or_default()),
            Err(VmError::Exception(payload)) => {
                eprintln!("{}", self.render_stack_trace(payload));
                Err(VmError::Exception(payload))
            }
            Err(error) => Err(error),
        }
    }

    /// Execute a block, then drive the scheduler until everything drains
    pub fn start_runtime(&mut self, block: InstructionBlock, lvarcount: u32) -> VmResult<Value> {
        let result = self.execute(block, lvarcount)?;
        self.run_scheduler()?;
        Ok(result)
    }

    /// The scheduler main loop
    ///
    /// Runs until the task queue, timers, tickers, workers and suspended
    /// fibers are all empty.
    pub fn run_scheduler(&mut self) -> VmResult<()> {
        loop {
            // Worker completions become callback tasks, in completion order
            for completion in self.scheduler.poll_completions() {
                if let Some(callback) = self.scheduler.finish_worker(completion.record) {
                    let result = match completion.result {
                        Ok(value) => self.from_worker_value(&value)?,
                        Err(message) => self.create_error(&message)?,
                    };
                    self.enqueue_callback(callback, &[result]);
                }
            }

            self.scheduler.drain_due(Instant::now());

            if let Some(task) = self.scheduler.try_pop() {
                self.run_task(task)?;
                continue;
            }

            if self.scheduler.is_idle() {
                break;
            }
            self.scheduler.wait_for_work();
        }
        self.scheduler.shutdown();
        Ok(())
    }

    fn run_task(&mut self, task: VmTask) -> VmResult<()> {
        match task {
            VmTask::Callback { func, args, argc, .. } => {
                self.stack.clear();
                self.frames = None;
                self.catchstack = None;
                self.halted = false;
                let args = &args[..argc as usize];
                match self.call_task_callee(func, args) {
                    Ok(()) => Ok(()),
                    Err(VmError::Exception(payload)) => {
                        eprintln!("{}", self.render_stack_trace(payload));
                        Err(VmError::Exception(payload))
                    }
                    Err(error) => Err(error),
                }
            }
            VmTask::FiberResume { fiber, argument } => {
                let Some(fiber) = self.scheduler.take_fiber(fiber) else {
                    return Ok(());
                };
                self.stack = fiber.stack;
                self.frames = fiber.frame;
                self.catchstack = fiber.catchtable;
                self.ip = fiber.resume_address;
                self.halted = false;
                self.push(argument)?;
                match self.run() {
                    Ok(()) => Ok(()),
                    Err(VmError::Exception(payload)) => {
                        eprintln!("{}", self.render_stack_trace(payload));
                        Err(VmError::Exception(payload))
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }
}

#[inline]
fn value_is_number(value: Value) -> bool {
    value.is_numeric()
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineOptions::default())
    }
}
