//! Scheduler ordering, timers, tickers, fibers and worker threads
//!
//! The host functions here mirror the shape of the real standard library:
//! everything is registered as a global CFunction and all cross-call state
//! travels through the globals object.

use charly_bytecode::Assembler;
use charly_core::scheduler::WorkerValue;
use charly_core::symbol::symbol_hash;
use charly_core::value::Value;
use charly_core::vm::HostCallable;
use charly_core::{Machine, VmError, VmResult};
use std::time::Duration;

fn record(machine: &mut Machine, _receiver: Value, args: &[Value]) -> VmResult<Value> {
    let log = machine.global("log").expect("log array installed");
    let value = args.first().copied().unwrap_or_default();
    machine
        .heap_mut()
        .array_mut(log.as_cell())?
        .data
        .push(value);
    Ok(Value::null())
}

fn set_timer(machine: &mut Machine, _receiver: Value, args: &[Value]) -> VmResult<Value> {
    let delay = Duration::from_millis(args[0].to_int().max(0) as u64);
    let func = args[1];
    let id = machine.register_timer(delay, func, &args[2..]);
    Ok(Value::number(id as i64))
}

fn set_ticker(machine: &mut Machine, _receiver: Value, args: &[Value]) -> VmResult<Value> {
    let period = Duration::from_millis(args[0].to_int().max(0) as u64);
    let func = args[1];
    let id = machine.register_ticker(period, func, &args[2..]);
    Ok(Value::number(id as i64))
}

fn stop_ticker(machine: &mut Machine, _receiver: Value, args: &[Value]) -> VmResult<Value> {
    machine.clear_ticker(args[0].to_int().max(0) as u64);
    Ok(Value::null())
}

fn tick(machine: &mut Machine, _receiver: Value, _args: &[Value]) -> VmResult<Value> {
    let count = machine.global("ticks").unwrap_or_default().to_int() + 1;
    machine.set_global("ticks", Value::number(count))?;
    if count >= 3 {
        let id = machine.global("ticker_id").unwrap_or_default().to_int();
        machine.clear_ticker(id.max(0) as u64);
    }
    Ok(Value::null())
}

fn pause(machine: &mut Machine, _receiver: Value, _args: &[Value]) -> VmResult<Value> {
    let id = machine.suspend_fiber();
    machine.set_global("fiber_id", Value::number(id as i64))?;
    Ok(Value::null())
}

fn wake(machine: &mut Machine, _receiver: Value, _args: &[Value]) -> VmResult<Value> {
    let id = machine.global("fiber_id").expect("fiber parked").to_int();
    let argument = machine.create_str("resumed")?;
    machine.resume_fiber(id.max(0) as u64, argument);
    Ok(Value::null())
}

fn slow_answer(_args: &[WorkerValue]) -> Result<WorkerValue, String> {
    std::thread::sleep(Duration::from_millis(10));
    Ok(WorkerValue::Int(42))
}

fn failing_worker(_args: &[WorkerValue]) -> Result<WorkerValue, String> {
    Err("worker exploded".to_string())
}

fn spawn_worker(machine: &mut Machine, _receiver: Value, args: &[Value]) -> VmResult<Value> {
    let id = machine.start_worker_thread(args[0], &args[2..], args[1])?;
    Ok(Value::number(id as i64))
}

fn setup(machine: &mut Machine) {
    let log = machine.create_array(vec![]).unwrap();
    machine.set_global("log", log).unwrap();

    let installs: [(&str, u32, HostCallable); 7] = [
        ("record", 1, HostCallable::Main(record)),
        ("set_timer", 2, HostCallable::Main(set_timer)),
        ("set_ticker", 2, HostCallable::Main(set_ticker)),
        ("stop_ticker", 1, HostCallable::Main(stop_ticker)),
        ("tick", 0, HostCallable::Main(tick)),
        ("wake", 0, HostCallable::Main(wake)),
        ("spawn_worker", 2, HostCallable::Main(spawn_worker)),
    ];
    for (name, argc, callable) in installs {
        let func = machine.create_cfunction(name, argc, callable).unwrap();
        machine.set_global(name, func).unwrap();
    }

    // pause never pushes a call-time result; the resume argument becomes
    // the call's value instead
    let pause_fn = machine
        .create_cfunction("pause", 0, HostCallable::Main(pause))
        .unwrap();
    machine
        .heap_mut()
        .cfunction_mut(pause_fn.as_cell())
        .unwrap()
        .push_return = false;
    machine.set_global("pause", pause_fn).unwrap();

    let slow = machine
        .create_cfunction("slow_answer", 0, HostCallable::Blocking(slow_answer))
        .unwrap();
    machine.set_global("slow_answer", slow).unwrap();

    let failing = machine
        .create_cfunction("failing_worker", 0, HostCallable::Blocking(failing_worker))
        .unwrap();
    machine.set_global("failing_worker", failing).unwrap();
}

fn log_entries(machine: &Machine) -> Vec<Value> {
    let log = machine.global("log").expect("log array installed");
    machine.heap().array(log.as_cell()).unwrap().data.to_vec()
}

#[test]
fn zero_delay_timer_fires_after_the_synchronous_task() {
    // setTimer(0, record("B")); record("A")  =>  log == [A, B]
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("set_timer"));
    asm.put_int(0);
    asm.read_global(symbol_hash("record"));
    asm.put_string("B");
    asm.call(3);
    asm.pop();
    asm.read_global(symbol_hash("record"));
    asm.put_string("A");
    asm.call(1);
    asm.pop();
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    let log = log_entries(&machine);
    assert_eq!(log.len(), 2);
    assert_eq!(machine.string_bytes(&log[0]).unwrap(), b"A");
    assert_eq!(machine.string_bytes(&log[1]).unwrap(), b"B");
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    // Registered out of order; deadlines sort them
    asm.read_global(symbol_hash("set_timer"));
    asm.put_int(20);
    asm.read_global(symbol_hash("record"));
    asm.put_string("late");
    asm.call(3);
    asm.pop();
    asm.read_global(symbol_hash("set_timer"));
    asm.put_int(1);
    asm.read_global(symbol_hash("record"));
    asm.put_string("early");
    asm.call(3);
    asm.pop();
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    let log = log_entries(&machine);
    assert_eq!(machine.string_bytes(&log[0]).unwrap(), b"early");
    assert_eq!(machine.string_bytes(&log[1]).unwrap(), b"late");
}

#[test]
fn cleared_timers_never_fire() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("set_timer"));
    asm.put_int(5);
    asm.read_global(symbol_hash("record"));
    asm.put_string("never");
    asm.call(3);
    asm.halt();
    let block = asm.assemble().unwrap();

    // Cancel through the machine facade before the scheduler runs
    let id = machine.execute(block, 0).unwrap().to_int();
    machine.clear_timer(id.max(0) as u64);
    machine.run_scheduler().unwrap();

    assert!(log_entries(&machine).is_empty());
}

#[test]
fn tickers_repeat_until_cleared() {
    let mut machine = Machine::default();
    setup(&mut machine);
    machine.set_global("ticks", Value::integer(0)).unwrap();

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("set_ticker"));
    asm.put_int(1);
    asm.read_global(symbol_hash("tick"));
    asm.call(2);
    asm.set_global(symbol_hash("ticker_id"));
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    assert_eq!(
        machine.global("ticks").unwrap_or_default(),
        Value::integer(3),
        "the ticker fires until its third tick clears it"
    );
}

#[test]
fn suspended_fiber_resumes_with_the_argument() {
    // setTimer(0, wake); x = pause(); record(x)
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("set_timer"));
    asm.put_int(0);
    asm.read_global(symbol_hash("wake"));
    asm.call(2);
    asm.pop();
    asm.read_global(symbol_hash("pause"));
    asm.call(0);
    // The resume argument is now on top; call record with it
    asm.read_global(symbol_hash("record"));
    asm.swap();
    asm.call(1);
    asm.pop();
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    let log = log_entries(&machine);
    assert_eq!(log.len(), 1);
    assert_eq!(machine.string_bytes(&log[0]).unwrap(), b"resumed");
    assert_eq!(machine.scheduler().paused_fibers(), 0);
}

#[test]
fn worker_thread_completion_runs_the_callback() {
    // Spawning the blocking call must not stop the main task from
    // finishing first; the callback observes 42 afterwards
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("spawn_worker"));
    asm.read_global(symbol_hash("slow_answer"));
    asm.read_global(symbol_hash("record"));
    asm.call(2);
    asm.pop();
    asm.read_global(symbol_hash("record"));
    asm.put_string("main done");
    asm.call(1);
    asm.pop();
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    let log = log_entries(&machine);
    assert_eq!(log.len(), 2);
    assert_eq!(machine.string_bytes(&log[0]).unwrap(), b"main done");
    assert_eq!(log[1], Value::integer(42));
    assert_eq!(machine.scheduler().active_workers(), 0);
}

#[test]
fn failing_worker_delivers_an_error_value() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("spawn_worker"));
    asm.read_global(symbol_hash("failing_worker"));
    asm.read_global(symbol_hash("record"));
    asm.call(2);
    asm.pop();
    asm.halt();
    let block = asm.assemble().unwrap();

    machine.start_runtime(block, 0).unwrap();

    let log = log_entries(&machine);
    assert_eq!(log.len(), 1);
    // The callback received an error object carrying the thrown message
    let message = machine
        .resolve_member(log[0], Value::symbol(symbol_hash("message")))
        .expect("error object has a message");
    assert_eq!(machine.string_bytes(&message).unwrap(), b"worker exploded");
}

#[test]
fn worker_only_cfunctions_cannot_run_on_the_main_thread() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let mut asm = Assembler::new();
    asm.read_global(symbol_hash("slow_answer"));
    asm.call(0);
    asm.halt();
    let block = asm.assemble().unwrap();

    let result = machine.execute(block, 0);
    assert!(matches!(result, Err(VmError::ThreadPolicy(_))));
}

#[test]
fn main_only_cfunctions_cannot_be_offloaded() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let record_fn = machine.global("record").unwrap();
    let result = machine.start_worker_thread(record_fn, &[], Value::null());
    assert!(matches!(result, Err(VmError::ThreadPolicy(_))));
}

#[test]
fn mutable_arguments_are_rejected_at_the_worker_boundary() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let slow = machine.global("slow_answer").unwrap();
    let object = machine.create_object(Value::null()).unwrap();
    let result = machine.start_worker_thread(slow, &[object], Value::null());
    assert!(matches!(result, Err(VmError::Exception(_))));
}

#[test]
fn callback_tasks_run_in_enqueue_order() {
    let mut machine = Machine::default();
    setup(&mut machine);

    let record_fn = machine.global("record").unwrap();
    for i in 0..5 {
        machine.enqueue_callback(record_fn, &[Value::integer(i)]);
    }
    machine.run_scheduler().unwrap();

    let log = log_entries(&machine);
    let observed: Vec<i64> = log.iter().map(|v| v.as_integer()).collect();
    assert_eq!(observed, vec![0, 1, 2, 3, 4]);
}
