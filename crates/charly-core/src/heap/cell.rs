//! Heap cells
//!
//! Every heap value occupies one fixed-size cell inside an arena. A cell is
//! a mark bit plus a tagged payload; dead cells carry the freelist link in
//! their payload, so sweep can tell "live", "dead" and "already freed" apart
//! structurally. Variable-size payloads (containers, spilled strings,
//! spilled locals) are owned boxes inside the variant, which makes the
//! type-specific destructor the drop of the replaced variant.

use crate::value::Value;
use crate::vm::HostCallable;
use rustc_hash::FxHashMap;

/// Number of local slots a small frame stores inline
pub const SMALL_FRAME_SLOTS: usize = 5;

/// Longest byte string stored inline in a heap cell
pub const SHORT_STRING_MAX: usize = 118;

/// A 48-bit handle to a heap cell (arena-slot index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef(u64);

impl CellRef {
    /// Build a handle from a raw slot index
    #[inline]
    pub const fn new(slot: u64) -> Self {
        CellRef(slot)
    }

    /// The raw slot index
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Symbol-keyed property map used by objects, classes and functions
pub type Container = FxHashMap<Value, Value>;

/// A heap cell: mark bit plus tagged payload
#[derive(Debug)]
pub struct Cell {
    /// Set during the mark phase, cleared during sweep
    pub marked: bool,
    /// The payload
    pub kind: CellKind,
}

impl Cell {
    /// A dead cell linking to the next freelist entry
    pub fn dead(next: Option<CellRef>) -> Self {
        Cell {
            marked: false,
            kind: CellKind::Dead { next },
        }
    }
}

/// The payload of a heap cell
#[derive(Debug)]
pub enum CellKind {
    /// Freelist entry
    Dead {
        /// Next free cell
        next: Option<CellRef>,
    },
    /// Plain object
    Object(ObjectData),
    /// Ordered value sequence
    Array(ArrayData),
    /// Byte string
    Str(StringData),
    /// Bytecode function
    Function(FunctionData),
    /// Host function
    CFunction(CFunctionData),
    /// Suspended or running generator
    Generator(GeneratorData),
    /// Class
    Class(ClassData),
    /// Activation record
    Frame(FrameData),
    /// Registered exception handler
    CatchTable(CatchTableData),
    /// Opaque host pointer with destructor
    CPointer(CPointerData),
}

impl CellKind {
    /// Human-readable kind name
    pub const fn name(&self) -> &'static str {
        match self {
            CellKind::Dead { .. } => "dead",
            CellKind::Object(_) => "object",
            CellKind::Array(_) => "array",
            CellKind::Str(_) => "string",
            CellKind::Function(_) => "function",
            CellKind::CFunction(_) => "cfunction",
            CellKind::Generator(_) => "generator",
            CellKind::Class(_) => "class",
            CellKind::Frame(_) => "frame",
            CellKind::CatchTable(_) => "catchtable",
            CellKind::CPointer(_) => "cpointer",
        }
    }
}

/// Object payload: class reference plus property map
#[derive(Debug)]
pub struct ObjectData {
    /// The class this object was constructed from
    pub klass: Value,
    /// Property map keyed by symbol
    pub container: Box<Container>,
}

impl ObjectData {
    /// Create an empty object of a class
    pub fn new(klass: Value) -> Self {
        ObjectData {
            klass,
            container: Box::default(),
        }
    }
}

/// Array payload
#[derive(Debug)]
pub struct ArrayData {
    /// The elements
    pub data: Box<Vec<Value>>,
}

impl ArrayData {
    /// Create an array from its elements
    pub fn new(data: Vec<Value>) -> Self {
        ArrayData { data: Box::new(data) }
    }
}

/// String payload: short strings stay inline in the cell and never deallocate
#[derive(Debug)]
pub enum StringData {
    /// Inline short form
    Short {
        /// Byte length
        len: u8,
        /// Inline buffer, valid up to `len`
        bytes: [u8; SHORT_STRING_MAX],
    },
    /// Spilled long form
    Spilled(Vec<u8>),
}

impl StringData {
    /// Create the appropriate physical form for a byte string
    pub fn new(bytes: &[u8]) -> Self {
        if bytes.len() <= SHORT_STRING_MAX {
            let mut buf = [0u8; SHORT_STRING_MAX];
            buf[..bytes.len()].copy_from_slice(bytes);
            StringData::Short {
                len: bytes.len() as u8,
                bytes: buf,
            }
        } else {
            StringData::Spilled(bytes.to_vec())
        }
    }

    /// Borrow the string bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StringData::Short { len, bytes } => &bytes[..*len as usize],
            StringData::Spilled(data) => data,
        }
    }

    /// Byte length
    pub fn len(&self) -> usize {
        match self {
            StringData::Short { len, .. } => *len as usize,
            StringData::Spilled(data) => data.len(),
        }
    }

    /// Whether the string is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Function payload
#[derive(Debug)]
pub struct FunctionData {
    /// Name symbol
    pub name: Value,
    /// Declared argument count
    pub argc: u32,
    /// Arguments required before the call is accepted
    pub minimum_argc: u32,
    /// Local slot count of the frame this function pushes
    pub lvarcount: u32,
    /// Captured lexical frame
    pub context: Option<CellRef>,
    /// Entry offset into the instruction block
    pub body_address: usize,
    /// Explicitly bound self, if any
    pub bound_self: Option<Value>,
    /// Class this function is a method of (null when free-standing)
    pub host_class: Value,
    /// Per-function property map
    pub container: Box<Container>,
    /// Function has no source-level name
    pub anonymous: bool,
    /// Materialise an `arguments` array on arity overrun
    pub needs_arguments: bool,
}

/// Host function payload
#[derive(Debug)]
pub struct CFunctionData {
    /// Name symbol
    pub name: Value,
    /// The native callable; the variant encodes the thread policy
    pub callable: HostCallable,
    /// Declared argument count
    pub argc: u32,
    /// Whether the interpreter pushes the return value
    pub push_return: bool,
    /// Per-function property map
    pub container: Box<Container>,
}

/// Generator payload
///
/// While suspended these fields hold the generator's own execution state;
/// while running they hold the resumer's swapped-out state. The interpreter
/// moves state in and out, never aliases it.
#[derive(Debug)]
pub struct GeneratorData {
    /// Name symbol
    pub name: Value,
    /// Saved frame
    pub frame: Option<CellRef>,
    /// Saved catch-table chain head
    pub catchtable: Option<CellRef>,
    /// Saved operand stack
    pub stack: Vec<Value>,
    /// Offset execution continues from
    pub resume_address: usize,
    /// Explicitly bound self, if any
    pub bound_self: Option<Value>,
    /// Per-generator property map
    pub container: Box<Container>,
    /// The generator ran to completion
    pub finished: bool,
    /// The generator has been resumed at least once
    pub started: bool,
}

/// Class payload
#[derive(Debug)]
pub struct ClassData {
    /// Name symbol
    pub name: Value,
    /// Constructor function (null when absent)
    pub constructor: Value,
    /// Prototype object holding the methods
    pub prototype: Value,
    /// Parent class (null at the root)
    pub parent_class: Value,
    /// Member property name symbols, initialised to null on construction
    pub member_properties: Box<Vec<Value>>,
    /// Static property map
    pub container: Box<Container>,
}

/// Frame locals: inline for small frames, spilled otherwise
#[derive(Debug)]
pub enum Locals {
    /// At most [`SMALL_FRAME_SLOTS`] slots stored inline
    Inline {
        /// Number of valid slots
        len: u8,
        /// The slots
        slots: [Value; SMALL_FRAME_SLOTS],
    },
    /// Spilled local vector
    Spilled(Box<Vec<Value>>),
}

impl Locals {
    /// Allocate `count` null-initialised locals, choosing the physical form
    pub fn new(count: usize) -> Self {
        if count <= SMALL_FRAME_SLOTS {
            Locals::Inline {
                len: count as u8,
                slots: [Value::null(); SMALL_FRAME_SLOTS],
            }
        } else {
            Locals::Spilled(Box::new(vec![Value::null(); count]))
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        match self {
            Locals::Inline { len, .. } => *len as usize,
            Locals::Spilled(slots) => slots.len(),
        }
    }

    /// Whether the frame has no locals
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a slot
    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            Locals::Inline { len, slots } => {
                if index < *len as usize {
                    Some(slots[index])
                } else {
                    None
                }
            }
            Locals::Spilled(slots) => slots.get(index).copied(),
        }
    }

    /// Write a slot; false when out of range
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match self {
            Locals::Inline { len, slots } => {
                if index < *len as usize {
                    slots[index] = value;
                    true
                } else {
                    false
                }
            }
            Locals::Spilled(slots) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = value;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Iterate over the live slots
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).map(move |i| self.get(i).unwrap_or_default())
    }
}

/// Frame payload: one function activation
#[derive(Debug)]
pub struct FrameData {
    /// Dynamic caller frame
    pub parent: Option<CellRef>,
    /// Frame whose locals implement the enclosing lexical scope
    pub environment: Option<CellRef>,
    /// Catch-table chain head at frame entry, restored on return
    pub catchtable: Option<CellRef>,
    /// The function value being executed
    pub caller: Value,
    /// Self value
    pub self_value: Value,
    /// Entry offset of the executing body
    pub origin_address: usize,
    /// Offset execution resumes at after return (None at the root)
    pub return_address: Option<usize>,
    /// Operand stack depth at frame entry, trimmed back to on return
    pub stacksize: usize,
    /// Return hands control back to the scheduler
    pub halt_after_return: bool,
    /// Return pushes self instead of the popped value (constructor calls)
    pub push_self_on_return: bool,
    /// Generator whose root frame this is
    pub generator: Option<CellRef>,
    /// Local variables
    pub locals: Locals,
}

/// Catch-table payload: one registered exception handler
#[derive(Debug)]
pub struct CatchTableData {
    /// Handler offset
    pub address: usize,
    /// Operand stack depth at registration, trimmed back to on unwind
    pub stacksize: usize,
    /// Frame the handler belongs to
    pub frame: Option<CellRef>,
    /// Next handler in the chain
    pub parent: Option<CellRef>,
}

/// Opaque host data payload
pub struct CPointerData {
    /// The host pointer
    pub data: *mut u8,
    /// Destructor invoked when the cell is swept
    pub dtor: Option<unsafe fn(*mut u8)>,
}

impl std::fmt::Debug for CPointerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CPointerData")
            .field("data", &self.data)
            .field("has_dtor", &self.dtor.is_some())
            .finish()
    }
}
