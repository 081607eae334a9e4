//! Primitive-prototype methods the runtime itself needs
//!
//! Standard-library host functions live outside this crate; the handful of
//! methods here exist because the core semantics reference them (generator
//! finished-ness, container lengths, explicit array growth). They are
//! installed into the primitive-class prototypes during bootstrap.

use crate::value::Value;
use crate::vm::{HostCallable, Machine};
use crate::{VmError, VmResult};

/// Install the built-in prototype methods
pub fn install(machine: &mut Machine) {
    let generator = machine.primitives().generator;
    let array = machine.primitives().array;
    let string = machine.primitives().string;

    install_method(machine, generator, "finished", 0, HostCallable::Main(generator_finished));
    install_method(machine, array, "length", 0, HostCallable::Main(array_length));
    install_method(machine, array, "push", 1, HostCallable::Main(array_push));
    install_method(machine, string, "length", 0, HostCallable::Main(string_length));
}

fn install_method(
    machine: &mut Machine,
    primitive: Value,
    name: &str,
    argc: u32,
    callable: HostCallable,
) {
    let method = machine
        .create_cfunction(name, argc, callable)
        .expect("bootstrap allocation");
    let prototype = machine
        .heap()
        .class(primitive.as_cell())
        .expect("primitive class exists")
        .prototype;
    let symbol = machine.symbols_mut().intern(name);
    machine
        .heap_mut()
        .object_mut(prototype.as_cell())
        .expect("primitive prototype exists")
        .container
        .insert(symbol, method);
}

fn generator_finished(machine: &mut Machine, receiver: Value, _args: &[Value]) -> VmResult<Value> {
    if !receiver.is_cell() {
        return Err(VmError::TypeError("finished() needs a generator".to_string()));
    }
    let generator = machine.heap().generator(receiver.as_cell())?;
    Ok(Value::boolean(generator.finished))
}

fn array_length(machine: &mut Machine, receiver: Value, _args: &[Value]) -> VmResult<Value> {
    if !receiver.is_cell() {
        return Err(VmError::TypeError("length() needs an array".to_string()));
    }
    let array = machine.heap().array(receiver.as_cell())?;
    Ok(Value::number(array.data.len() as i64))
}

fn array_push(machine: &mut Machine, receiver: Value, args: &[Value]) -> VmResult<Value> {
    if !receiver.is_cell() {
        return Err(VmError::TypeError("push() needs an array".to_string()));
    }
    let value = args.first().copied().unwrap_or_default();
    let array = machine.heap_mut().array_mut(receiver.as_cell())?;
    array.data.push(value);
    Ok(Value::number(array.data.len() as i64))
}

fn string_length(machine: &mut Machine, receiver: Value, _args: &[Value]) -> VmResult<Value> {
    match machine.string_length(receiver) {
        Some(length) => Ok(Value::number(length as i64)),
        None => Err(VmError::TypeError("length() needs a string".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::symbol_hash;
    use charly_bytecode::Assembler;

    #[test]
    fn test_array_length_via_call_member() {
        let mut asm = Assembler::new();
        asm.put_int(1);
        asm.put_int(2);
        asm.put_int(3);
        asm.put_array(3);
        asm.call_member(symbol_hash("length"), 0);
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(result, Value::integer(3));
    }

    #[test]
    fn test_array_push_grows() {
        let mut asm = Assembler::new();
        asm.put_array(0);
        asm.set_local(0, 0);
        asm.read_local(0, 0);
        asm.put_int(42);
        asm.call_member(symbol_hash("push"), 1);
        asm.pop();
        asm.read_local(0, 0);
        asm.read_array_index(0);
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 1).unwrap();
        assert_eq!(result, Value::integer(42));
    }

    #[test]
    fn test_string_length_on_immediate() {
        let mut asm = Assembler::new();
        asm.put_string("abc");
        asm.call_member(symbol_hash("length"), 0);
        asm.halt();
        let block = asm.assemble().unwrap();

        let mut machine = Machine::default();
        let result = machine.execute(block, 0).unwrap();
        assert_eq!(result, Value::integer(3));
    }
}
