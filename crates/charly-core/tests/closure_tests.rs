//! Closure capture semantics
//!
//! A function literal captures the frame it was created in as its lexical
//! environment; that frame must stay alive after its call returns for as
//! long as the closure does.

use charly_bytecode::Assembler;
use charly_core::symbol::symbol_hash;
use charly_core::value::Value;
use charly_core::Machine;

#[test]
fn captured_frame_survives_the_creating_call() {
    // const mk = func(x) { func() { x = x + 1; x } }
    // const c = mk(10); [c(), c(), c()] == [11, 12, 13]
    let mut asm = Assembler::new();
    let inner_body = asm.label();
    let mk_body = asm.label();
    let main = asm.label();
    asm.branch(main);

    // inner: increments the captured x and returns it
    asm.place(inner_body);
    asm.read_local(0, 1);
    asm.put_int(1);
    asm.add();
    asm.set_local(0, 1);
    asm.read_local(0, 1);
    asm.ret();

    // mk: returns the inner closure
    asm.place(mk_body);
    asm.put_function(symbol_hash("inner"), inner_body, 0, 0, 0, 0);
    asm.ret();

    asm.place(main);
    asm.put_function(symbol_hash("mk"), mk_body, 1, 1, 1, 0);
    asm.put_int(10);
    asm.call(1);
    asm.set_local(0, 0); // c

    asm.read_local(0, 0);
    asm.call(0);
    asm.read_local(0, 0);
    asm.call(0);
    asm.read_local(0, 0);
    asm.call(0);
    asm.put_array(3);
    asm.halt();
    let block = asm.assemble().unwrap();

    let mut machine = Machine::default();
    let result = machine.execute(block, 1).unwrap();

    let array = machine.heap().array(result.as_cell()).unwrap();
    assert_eq!(
        *array.data,
        vec![Value::integer(11), Value::integer(12), Value::integer(13)]
    );
}

#[test]
fn sibling_closures_share_one_environment() {
    // Both closures from the same mk(x) call see the same x
    let mut asm = Assembler::new();
    let bump_body = asm.label();
    let read_body = asm.label();
    let mk_body = asm.label();
    let main = asm.label();
    asm.branch(main);

    asm.place(bump_body);
    asm.read_local(0, 1);
    asm.put_int(1);
    asm.add();
    asm.set_local(0, 1);
    asm.put_null();
    asm.ret();

    asm.place(read_body);
    asm.read_local(0, 1);
    asm.ret();

    asm.place(mk_body);
    asm.put_function(symbol_hash("bump"), bump_body, 0, 0, 0, 0);
    asm.put_function(symbol_hash("read"), read_body, 0, 0, 0, 0);
    asm.put_array(2);
    asm.ret();

    asm.place(main);
    asm.put_function(symbol_hash("mk"), mk_body, 1, 1, 1, 0);
    asm.put_int(100);
    asm.call(1);
    asm.set_local(0, 0); // pair

    // pair[0]() twice, then pair[1]()
    asm.read_local(0, 0);
    asm.read_array_index(0);
    asm.call(0);
    asm.pop();
    asm.read_local(0, 0);
    asm.read_array_index(0);
    asm.call(0);
    asm.pop();
    asm.read_local(0, 0);
    asm.read_array_index(1);
    asm.call(0);
    asm.halt();
    let block = asm.assemble().unwrap();

    let mut machine = Machine::default();
    let result = machine.execute(block, 1).unwrap();
    assert_eq!(result, Value::integer(102));
}

#[test]
fn closures_survive_garbage_collection() {
    use charly_core::heap::GcConfig;
    use charly_core::MachineOptions;

    let mut asm = Assembler::new();
    let inner_body = asm.label();
    let mk_body = asm.label();
    let main = asm.label();
    asm.branch(main);

    asm.place(inner_body);
    asm.read_local(0, 1);
    asm.ret();

    asm.place(mk_body);
    asm.put_function(symbol_hash("inner"), inner_body, 0, 0, 0, 0);
    asm.ret();

    asm.place(main);
    asm.put_function(symbol_hash("mk"), mk_body, 1, 1, 1, 0);
    asm.put_int(77);
    asm.call(1);
    asm.set_local(0, 0);

    // Heavy transient allocation so collections run between creation and call
    let loop_top = asm.label();
    let loop_end = asm.label();
    asm.put_int(0);
    asm.set_local(1, 0);
    asm.place(loop_top);
    asm.read_local(1, 0);
    asm.put_int(2000);
    asm.branch_ge(loop_end);
    asm.put_string("a transient heap string that outgrows the inline form");
    asm.pop();
    asm.read_local(1, 0);
    asm.put_int(1);
    asm.add();
    asm.set_local(1, 0);
    asm.branch(loop_top);
    asm.place(loop_end);

    asm.read_local(0, 0);
    asm.call(0);
    asm.halt();
    let block = asm.assemble().unwrap();

    let mut machine = Machine::new(MachineOptions {
        gc: GcConfig {
            cells_per_arena: 128,
            initial_arenas: 1,
            min_free_cells: 8,
            growth_factor: 2,
            trace: false,
        },
        ..Default::default()
    });
    let result = machine.execute(block, 2).unwrap();

    assert!(machine.heap().stats().collections > 0);
    assert_eq!(result, Value::integer(77));
}
