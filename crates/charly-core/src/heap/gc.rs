//! Cell heap and mark-sweep collector
//!
//! The heap is a vector of arenas, each a contiguous run of fixed-size
//! cells. A singly-linked freelist threads through the dead cells; allocation
//! pops its head and sweep pushes freed cells back, so reuse is LIFO.
//!
//! Collection is mark-sweep: the machine hands the collector the root value
//! set, marking walks an explicit gray worklist (no native recursion, so
//! arbitrarily deep frame or catch chains cannot overflow the stack), and
//! sweep runs the kind-specific destructor of every unmarked live cell
//! before threading it back onto the freelist.

use crate::heap::cell::{
    ArrayData, CatchTableData, Cell, CellKind, CellRef, ClassData, FrameData, FunctionData,
    GeneratorData, ObjectData, StringData,
};
use crate::value::Value;
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// Heap configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Cells per arena
    pub cells_per_arena: usize,
    /// Arenas allocated up front
    pub initial_arenas: usize,
    /// Free-cell watermark under which allocation triggers a collection
    pub min_free_cells: usize,
    /// Arena growth factor applied when a collection frees nothing
    pub growth_factor: usize,
    /// Log collection pauses to stderr
    pub trace: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            cells_per_arena: 1 << 12,
            initial_arenas: 2,
            min_free_cells: 256,
            growth_factor: 2,
            trace: false,
        }
    }
}

/// Collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed collections
    pub collections: usize,
    /// Cells freed across all collections
    pub cells_freed: usize,
    /// Duration of the last collection
    pub last_pause: Duration,
    /// Total time spent collecting
    pub total_pause: Duration,
}

/// The cell heap
pub struct Heap {
    config: GcConfig,
    arenas: Vec<Vec<Cell>>,
    free_head: Option<CellRef>,
    remaining_free: usize,
    pinned: FxHashMap<u64, usize>,
    stats: GcStats,
}

impl Heap {
    /// Create a heap with the given configuration
    pub fn new(config: GcConfig) -> Self {
        let mut heap = Self {
            config,
            arenas: Vec::new(),
            free_head: None,
            remaining_free: 0,
            pinned: FxHashMap::default(),
            stats: GcStats::default(),
        };
        for _ in 0..heap.config.initial_arenas.max(1) {
            heap.add_arena();
        }
        heap
    }

    /// Heap configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Collector statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Number of free cells remaining
    pub fn free_cells(&self) -> usize {
        self.remaining_free
    }

    /// Total cell capacity
    pub fn capacity(&self) -> usize {
        self.arenas.len() * self.config.cells_per_arena
    }

    /// Number of live (non-dead) cells
    pub fn live_cells(&self) -> usize {
        self.capacity() - self.remaining_free
    }

    // ========================================================================
    // Arenas & freelist
    // ========================================================================

    fn add_arena(&mut self) {
        let arena_index = self.arenas.len();
        let count = self.config.cells_per_arena;
        let mut arena = Vec::with_capacity(count);
        for i in 0..count {
            let slot = (arena_index * count + i) as u64;
            arena.push(Cell::dead(self.free_head));
            self.free_head = Some(CellRef::new(slot));
        }
        self.arenas.push(arena);
        self.remaining_free += count;
    }

    /// Grow the heap by the configured factor
    pub fn grow(&mut self) {
        let arena_count = self.arenas.len();
        let mut to_add = (arena_count * self.config.growth_factor + 1) - arena_count;
        while to_add > 0 {
            self.add_arena();
            to_add -= 1;
        }
    }

    /// Whether the free-cell watermark has been reached
    #[inline]
    pub fn needs_collection(&self) -> bool {
        self.remaining_free <= self.config.min_free_cells
    }

    /// Pop the freelist head and install a payload
    ///
    /// Returns `None` when the freelist is empty; the machine is responsible
    /// for collecting and growing first (it can see the root set).
    pub fn allocate(&mut self, kind: CellKind) -> Option<CellRef> {
        let slot = self.free_head?;
        let cell = self.cell_mut(slot).expect("freelist points at valid cell");
        let next = match cell.kind {
            CellKind::Dead { next } => next,
            _ => unreachable!("freelist entry is not dead"),
        };
        cell.marked = false;
        cell.kind = kind;
        self.free_head = next;
        self.remaining_free -= 1;
        Some(slot)
    }

    // ========================================================================
    // Cell access
    // ========================================================================

    #[inline]
    fn locate(&self, cell: CellRef) -> (usize, usize) {
        let slot = cell.raw() as usize;
        (slot / self.config.cells_per_arena, slot % self.config.cells_per_arena)
    }

    /// Borrow a cell
    #[inline]
    pub fn cell(&self, cell: CellRef) -> Option<&Cell> {
        let (arena, index) = self.locate(cell);
        self.arenas.get(arena)?.get(index)
    }

    /// Mutably borrow a cell
    #[inline]
    pub fn cell_mut(&mut self, cell: CellRef) -> Option<&mut Cell> {
        let (arena, index) = self.locate(cell);
        self.arenas.get_mut(arena)?.get_mut(index)
    }

    fn kind(&self, cell: CellRef) -> VmResult<&CellKind> {
        self.cell(cell)
            .map(|c| &c.kind)
            .ok_or_else(|| VmError::Panic(format!("dangling cell reference {}", cell.raw())))
    }

    fn kind_mut(&mut self, cell: CellRef) -> VmResult<&mut CellKind> {
        self.cell_mut(cell)
            .map(|c| &mut c.kind)
            .ok_or_else(|| VmError::Panic(format!("dangling cell reference {}", cell.raw())))
    }

    /// Kind name of the cell behind a value (for `typeof` and diagnostics)
    pub fn kind_name(&self, value: Value) -> &'static str {
        if !value.is_cell() {
            return value.immediate_type_name();
        }
        match self.cell(value.as_cell()) {
            Some(cell) => match cell.kind {
                CellKind::Str(_) => "string",
                ref kind => kind.name(),
            },
            None => "unknown",
        }
    }
}

macro_rules! typed_accessors {
    ($(($ref_fn:ident, $mut_fn:ident, $variant:ident, $data:ty, $what:literal)),* $(,)?) => {
        impl Heap {
            $(
                /// Borrow the payload, failing with a type error otherwise
                pub fn $ref_fn(&self, cell: CellRef) -> VmResult<&$data> {
                    match self.kind(cell)? {
                        CellKind::$variant(data) => Ok(data),
                        other => Err(VmError::TypeError(format!(
                            concat!("expected ", $what, ", found {}"),
                            other.name()
                        ))),
                    }
                }

                /// Mutably borrow the payload, failing with a type error otherwise
                pub fn $mut_fn(&mut self, cell: CellRef) -> VmResult<&mut $data> {
                    match self.kind_mut(cell)? {
                        CellKind::$variant(data) => Ok(data),
                        other => Err(VmError::TypeError(format!(
                            concat!("expected ", $what, ", found {}"),
                            other.name()
                        ))),
                    }
                }
            )*
        }
    };
}

typed_accessors!(
    (object, object_mut, Object, ObjectData, "object"),
    (array, array_mut, Array, ArrayData, "array"),
    (string, string_mut, Str, StringData, "string"),
    (function, function_mut, Function, FunctionData, "function"),
    (cfunction, cfunction_mut, CFunction, crate::heap::cell::CFunctionData, "cfunction"),
    (generator, generator_mut, Generator, GeneratorData, "generator"),
    (class, class_mut, Class, ClassData, "class"),
    (frame, frame_mut, Frame, FrameData, "frame"),
    (catchtable, catchtable_mut, CatchTable, CatchTableData, "catchtable"),
);

impl Heap {
    // ========================================================================
    // Pinned temporaries
    // ========================================================================

    /// Pin a value so it survives collections without any other root
    pub fn pin(&mut self, value: Value) {
        if value.is_cell() {
            *self.pinned.entry(value.raw()).or_insert(0) += 1;
        }
    }

    /// Release one pin of a value
    pub fn unpin(&mut self, value: Value) {
        if let Some(count) = self.pinned.get_mut(&value.raw()) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(&value.raw());
            }
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Run a full mark-sweep collection over the given root values
    pub fn collect(&mut self, roots: &[Value]) {
        let start = Instant::now();
        if self.config.trace {
            eprintln!("#-- GC: pause --#");
        }

        // Mark phase: seed the worklist with the roots and the pinned set,
        // then drain it. The mark bit short-circuits cycles.
        let mut worklist: Vec<CellRef> = Vec::new();
        for &root in roots {
            self.mark_value(root, &mut worklist);
        }
        let pinned: Vec<u64> = self.pinned.keys().copied().collect();
        for bits in pinned {
            self.mark_value(Value::from_raw(bits), &mut worklist);
        }

        let mut children: Vec<Value> = Vec::new();
        while let Some(cell) = worklist.pop() {
            children.clear();
            if let Some(cell) = self.cell(cell) {
                trace_kind(&cell.kind, &mut children);
            }
            for i in 0..children.len() {
                self.mark_value(children[i], &mut worklist);
            }
        }

        // Sweep phase
        let freed = self.sweep();

        let pause = start.elapsed();
        self.stats.collections += 1;
        self.stats.cells_freed += freed;
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;

        if self.config.trace {
            eprintln!("#-- GC: freed {} cells in {:?} --#", freed, pause);
        }
    }

    fn mark_value(&mut self, value: Value, worklist: &mut Vec<CellRef>) {
        if !value.is_cell() {
            return;
        }
        let cell = value.as_cell();
        if let Some(slot) = self.cell_mut(cell) {
            if !slot.marked && !matches!(slot.kind, CellKind::Dead { .. }) {
                slot.marked = true;
                worklist.push(cell);
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let cells_per_arena = self.config.cells_per_arena;
        for arena_index in 0..self.arenas.len() {
            for index in 0..cells_per_arena {
                let slot = CellRef::new((arena_index * cells_per_arena + index) as u64);
                let cell = &mut self.arenas[arena_index][index];
                if cell.marked {
                    cell.marked = false;
                    continue;
                }
                if matches!(cell.kind, CellKind::Dead { .. }) {
                    continue;
                }

                // Run the kind-specific destructor, then thread the cell
                // back onto the freelist
                if let CellKind::CPointer(ref pointer) = cell.kind {
                    if let Some(dtor) = pointer.dtor {
                        unsafe { dtor(pointer.data) };
                    }
                }
                cell.kind = CellKind::Dead { next: self.free_head };
                self.free_head = Some(slot);
                self.remaining_free += 1;
                freed += 1;
            }
        }
        freed
    }
}

/// Push every value a cell payload references
///
/// This is the single tracing routine used both by the mark phase and by the
/// machine when it roots a staged payload during an allocation-triggered
/// collection.
pub fn trace_kind(kind: &CellKind, out: &mut Vec<Value>) {
    fn cell_field(cell: Option<CellRef>, out: &mut Vec<Value>) {
        if let Some(cell) = cell {
            out.push(Value::cell(cell));
        }
    }

    match kind {
        CellKind::Dead { .. } | CellKind::Str(_) | CellKind::CPointer(_) => {}

        CellKind::Object(object) => {
            out.push(object.klass);
            out.extend(object.container.values().copied());
        }

        CellKind::Array(array) => {
            out.extend(array.data.iter().copied());
        }

        CellKind::Function(function) => {
            cell_field(function.context, out);
            out.push(function.host_class);
            if let Some(bound) = function.bound_self {
                out.push(bound);
            }
            out.extend(function.container.values().copied());
        }

        CellKind::CFunction(cfunction) => {
            out.extend(cfunction.container.values().copied());
        }

        CellKind::Generator(generator) => {
            // Saved state is only alive while the generator can still run
            if !generator.finished {
                cell_field(generator.frame, out);
                cell_field(generator.catchtable, out);
                out.extend(generator.stack.iter().copied());
                if let Some(bound) = generator.bound_self {
                    out.push(bound);
                }
            }
            out.extend(generator.container.values().copied());
        }

        CellKind::Class(class) => {
            out.push(class.constructor);
            out.push(class.prototype);
            out.push(class.parent_class);
            out.extend(class.container.values().copied());
        }

        CellKind::Frame(frame) => {
            cell_field(frame.parent, out);
            cell_field(frame.environment, out);
            cell_field(frame.catchtable, out);
            cell_field(frame.generator, out);
            out.push(frame.caller);
            out.push(frame.self_value);
            out.extend(frame.locals.iter());
        }

        CellKind::CatchTable(table) => {
            cell_field(table.frame, out);
            cell_field(table.parent, out);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::cell::ObjectData;

    fn small_heap() -> Heap {
        Heap::new(GcConfig {
            cells_per_arena: 16,
            initial_arenas: 1,
            min_free_cells: 2,
            growth_factor: 2,
            trace: false,
        })
    }

    #[test]
    fn test_fresh_heap_is_all_free() {
        let heap = small_heap();
        assert_eq!(heap.free_cells(), 16);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_allocate_pops_freelist() {
        let mut heap = small_heap();
        let before = heap.free_cells();
        let cell = heap
            .allocate(CellKind::Array(ArrayData::new(vec![])))
            .unwrap();
        assert_eq!(heap.free_cells(), before - 1);
        assert!(heap.array(cell).is_ok());
    }

    #[test]
    fn test_typed_accessor_mismatch() {
        let mut heap = small_heap();
        let cell = heap
            .allocate(CellKind::Array(ArrayData::new(vec![])))
            .unwrap();
        assert!(matches!(heap.object(cell), Err(VmError::TypeError(_))));
    }

    #[test]
    fn test_collect_frees_unrooted() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        let _b = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();

        heap.collect(&[Value::cell(a)]);

        assert!(heap.object(a).is_ok());
        assert_eq!(heap.live_cells(), 1);
    }

    #[test]
    fn test_collect_clears_marks() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        heap.collect(&[Value::cell(a)]);
        assert!(!heap.cell(a).unwrap().marked);
    }

    #[test]
    fn test_freelist_is_lifo() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();

        // Free it, then the very next allocation must reuse it
        heap.collect(&[]);
        let b = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_collection_idempotent() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        let _dead = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();

        heap.collect(&[Value::cell(a)]);
        let freed_first = heap.stats().cells_freed;
        heap.collect(&[Value::cell(a)]);

        // Second collection over the same graph frees nothing
        assert_eq!(heap.stats().cells_freed, freed_first);
    }

    #[test]
    fn test_object_graph_survives() {
        let mut heap = small_heap();
        let inner = heap
            .allocate(CellKind::Array(ArrayData::new(vec![Value::integer(1)])))
            .unwrap();
        let mut object = ObjectData::new(Value::null());
        object
            .container
            .insert(Value::symbol(1), Value::cell(inner));
        let outer = heap.allocate(CellKind::Object(object)).unwrap();

        heap.collect(&[Value::cell(outer)]);

        assert!(heap.array(inner).is_ok());
        assert_eq!(heap.live_cells(), 2);
    }

    #[test]
    fn test_cycle_collection() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        let b = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();

        heap.object_mut(a)
            .unwrap()
            .container
            .insert(Value::symbol(1), Value::cell(b));
        heap.object_mut(b)
            .unwrap()
            .container
            .insert(Value::symbol(1), Value::cell(a));

        // The cycle is unreachable and must be collected whole
        heap.collect(&[]);
        assert_eq!(heap.live_cells(), 0);

        // A rooted cycle must survive and terminate marking
        let c = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        heap.object_mut(c)
            .unwrap()
            .container
            .insert(Value::symbol(1), Value::cell(c));
        heap.collect(&[Value::cell(c)]);
        assert_eq!(heap.live_cells(), 1);
    }

    #[test]
    fn test_pinned_values_survive() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        let value = Value::cell(a);

        heap.pin(value);
        heap.collect(&[]);
        assert!(heap.object(a).is_ok());

        heap.unpin(value);
        heap.collect(&[]);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_nested_pins() {
        let mut heap = small_heap();
        let a = heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .unwrap();
        let value = Value::cell(a);

        heap.pin(value);
        heap.pin(value);
        heap.unpin(value);
        heap.collect(&[]);
        assert!(heap.object(a).is_ok(), "still pinned once");

        heap.unpin(value);
        heap.collect(&[]);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_grow_adds_arenas() {
        let mut heap = small_heap();
        let capacity = heap.capacity();
        heap.grow();
        assert!(heap.capacity() > capacity);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut heap = small_heap();
        for _ in 0..16 {
            assert!(heap
                .allocate(CellKind::Object(ObjectData::new(Value::null())))
                .is_some());
        }
        assert!(heap
            .allocate(CellKind::Object(ObjectData::new(Value::null())))
            .is_none());
    }

    #[test]
    fn test_cpointer_destructor_runs_once() {
        use crate::heap::cell::CPointerData;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn dtor(_: *mut u8) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = small_heap();
        let _cell = heap
            .allocate(CellKind::CPointer(CPointerData {
                data: std::ptr::null_mut(),
                dtor: Some(dtor),
            }))
            .unwrap();

        heap.collect(&[]);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);

        // Double collection over the already-dead cell is a no-op
        heap.collect(&[]);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}
