//! End-to-end interpreter tests: modules are assembled in memory, loaded,
//! and run with console port output captured.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use raum::{
    CodeWriter, GcPolicy, ModuleBuilder, Op, Vm, VmCreateInfo, VmError, flags,
};

/// Captures everything the VM writes to its console ports.
#[derive(Clone, Default)]
struct Console(Rc<RefCell<Vec<u8>>>);

impl Console {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn vm_with_console(info: VmCreateInfo) -> (Vm, Console) {
    let mut vm = Vm::new(info).unwrap();
    let console = Console::default();
    vm.set_output(Box::new(console.clone()));
    (vm, console)
}

fn run(builder: ModuleBuilder) -> String {
    let (mut vm, console) = vm_with_console(VmCreateInfo::default());
    vm.load_and_run(&builder.encode()).unwrap();
    console.contents()
}

#[test]
fn addition_prints_five() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    code.push_int(2)
        .push_int(3)
        .simple(Op::AddInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "", code.finish());
    assert_eq!(run(builder), "5");
}

#[test]
fn arithmetic_wraps_and_compares() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    // i32::MAX + 1 wraps to i32::MIN.
    code.push_int(i32::MAX)
        .push_int(1)
        .simple(Op::AddInt)
        .push_int(i32::MIN)
        .simple(Op::CmpEq)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "", code.finish());
    assert_eq!(run(builder), "1");
}

#[test]
fn division_by_zero_is_fatal() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    code.push_int(1).push_int(0).simple(Op::DivInt).ret();
    builder.method(main, "main", "()V", "", code.finish());

    let (mut vm, _console) = vm_with_console(VmCreateInfo::default());
    let err = vm.load_and_run(&builder.encode()).unwrap_err();
    assert!(matches!(err, VmError::Execution(_)), "{err}");
}

#[test]
fn unknown_opcode_is_fatal() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    builder.method(main, "main", "()V", "", vec![0xEE]);

    let (mut vm, _console) = vm_with_console(VmCreateInfo::default());
    let err = vm.load_and_run(&builder.encode()).unwrap_err();
    assert!(matches!(err, VmError::Execution(_)), "{err}");
}

#[test]
fn locals_round_trip_through_the_stack_region() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    // local0 = 41 + 1, then print it back.
    code.push_int(41)
        .push_int(1)
        .simple(Op::AddInt)
        .local_addr(0)
        .simple(Op::StoreInt)
        .local_addr(0)
        .simple(Op::LoadInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "I", code.finish());
    assert_eq!(run(builder), "42");
}

#[test]
fn doubles_convert_and_round_trip() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    code.push_double(7.9)
        .local_addr(0)
        .simple(Op::StoreDouble)
        .local_addr(0)
        .simple(Op::LoadDouble)
        .simple(Op::DoubleToInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "D", code.finish());
    assert_eq!(run(builder), "7");
}

#[test]
fn recursive_factorial_balances_the_stack() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");

    // fact(n) = n <= 1 ? 1 : n * fact(n - 1); the parameter sits one slot
    // below the frame pointer.
    let mut fact = CodeWriter::new();
    fact.local_addr(-1)
        .simple(Op::LoadInt)
        .push_int(1)
        .simple(Op::CmpLe);
    let to_recurse = fact.branch(Op::JumpIfZero);
    fact.push_int(1).ret();
    let recurse = fact.here();
    fact.patch(to_recurse, recurse);
    fact.local_addr(-1)
        .simple(Op::LoadInt)
        .local_addr(-1)
        .simple(Op::LoadInt)
        .push_int(1)
        .simple(Op::SubInt)
        .call(2)
        .simple(Op::MulInt)
        .ret();

    let mut code = CodeWriter::new();
    code.push_int(5).call(2).simple(Op::PutInt).ret();
    builder.method(main, "main", "()V", "", code.finish());
    builder.method(main, "fact", "(I)I", "", fact.finish());

    let (mut vm, console) = vm_with_console(VmCreateInfo::default());
    vm.load_and_run(&builder.encode()).unwrap();
    assert_eq!(console.contents(), "120");
    // The entry frame has fully unwound.
    assert_eq!(vm.stack.sp(), 0);
    assert_eq!(vm.stack.fp(), 0);
}

#[test]
fn call_pushes_default_locals_per_descriptor() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");

    // helper has locals "DI": reading them uninitialized yields zero.
    let mut helper = CodeWriter::new();
    helper
        .local_addr(0)
        .simple(Op::LoadDouble)
        .simple(Op::DoubleToInt)
        .local_addr(2)
        .simple(Op::LoadInt)
        .simple(Op::AddInt)
        .ret();

    let mut code = CodeWriter::new();
    code.call(2).simple(Op::PutInt).ret();
    builder.method(main, "main", "()V", "", code.finish());
    builder.method(main, "helper", "()I", "DI", helper.finish());
    assert_eq!(run(builder), "0");
}

#[test]
fn loops_branch_backwards() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");

    // local0 = 0; while (local0 < 5) local0 += 1; print local0.
    let mut code = CodeWriter::new();
    code.push_int(0).local_addr(0).simple(Op::StoreInt);
    let top = code.here();
    code.local_addr(0)
        .simple(Op::LoadInt)
        .push_int(5)
        .simple(Op::CmpLt);
    let to_exit = code.branch(Op::JumpIfZero);
    code.local_addr(0)
        .simple(Op::LoadInt)
        .push_int(1)
        .simple(Op::AddInt)
        .local_addr(0)
        .simple(Op::StoreInt);
    let back = code.branch(Op::Jump);
    code.patch(back, top);
    let exit = code.here();
    code.patch(to_exit, exit);
    code.local_addr(0)
        .simple(Op::LoadInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "I", code.finish());
    assert_eq!(run(builder), "5");
}

#[test]
fn objects_hold_fields_in_the_heap() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let boxed = builder.class("main", "Box");
    let value_field = builder.field(boxed, "value", "I", 0);

    let mut code = CodeWriter::new();
    code.new_object(boxed)
        .local_addr(0)
        .simple(Op::StoreAddr)
        // box.value = 42
        .push_int(42)
        .local_addr(0)
        .simple(Op::LoadAddr)
        .field_addr(value_field)
        .simple(Op::StoreInt)
        // print box.value
        .local_addr(0)
        .simple(Op::LoadAddr)
        .field_addr(value_field)
        .simple(Op::LoadInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "L", code.finish());
    assert_eq!(run(builder), "42");
}

#[test]
fn static_fields_persist_across_calls() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let counter = builder.field(main, "counter", "I", flags::STATIC);

    // bump() increments Main.counter.
    let mut bump = CodeWriter::new();
    bump.static_addr(counter)
        .simple(Op::LoadInt)
        .push_int(1)
        .simple(Op::AddInt)
        .static_addr(counter)
        .simple(Op::StoreInt)
        .ret();

    let mut code = CodeWriter::new();
    code.call(2)
        .call(2)
        .call(2)
        .static_addr(counter)
        .simple(Op::LoadInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "", code.finish());
    builder.method(main, "bump", "()V", "", bump.finish());
    assert_eq!(run(builder), "3");
}

#[test]
fn arrays_store_elements_and_length() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");

    let mut code = CodeWriter::new();
    // local0 = new int[3]; local0[2] = 9; print local0[2] + len(local0).
    code.push_int(3)
        .new_array('I')
        .local_addr(0)
        .simple(Op::StoreAddr)
        .push_int(9)
        .local_addr(0)
        .simple(Op::LoadAddr)
        // Element 2 sits at header (12) + 2 * 4 bytes.
        .push_int(20)
        .simple(Op::AddInt)
        .simple(Op::StoreInt)
        .local_addr(0)
        .simple(Op::LoadAddr)
        .push_int(20)
        .simple(Op::AddInt)
        .simple(Op::LoadInt)
        .local_addr(0)
        .simple(Op::LoadAddr)
        .simple(Op::ArrayLen)
        .simple(Op::AddInt)
        .simple(Op::PutInt)
        .ret();
    builder.method(main, "main", "()V", "L", code.finish());
    assert_eq!(run(builder), "12");
}

#[test]
fn string_and_char_ports_write_text() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let greeting = builder.string("hello");

    let mut code = CodeWriter::new();
    code.const_str_addr(greeting)
        .simple(Op::PutString)
        .push_int('!' as i32)
        .simple(Op::PutChar)
        .push_int('\n' as i32)
        .simple(Op::PutChar)
        .ret();
    builder.method(main, "main", "()V", "", code.finish());
    assert_eq!(run(builder), "hello!\n");
}

#[test]
fn null_dereference_is_a_memory_error() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    code.push_null().simple(Op::LoadInt).ret();
    builder.method(main, "main", "()V", "", code.finish());

    let (mut vm, _console) = vm_with_console(VmCreateInfo::default());
    let err = vm.load_and_run(&builder.encode()).unwrap_err();
    assert!(matches!(err, VmError::Memory(_)), "{err}");
}

#[test]
fn allocation_pressure_recovers_under_gc_policy() {
    fn churn() -> ModuleBuilder {
        let mut builder = ModuleBuilder::new("main");
        let main = builder.class("main", "Main");
        // Allocate ten 28-byte arrays, dropping each immediately.
        let mut code = CodeWriter::new();
        code.push_int(0).local_addr(0).simple(Op::StoreInt);
        let top = code.here();
        code.local_addr(0)
            .simple(Op::LoadInt)
            .push_int(10)
            .simple(Op::CmpLt);
        let to_exit = code.branch(Op::JumpIfZero);
        code.push_int(4).new_array('I').pop();
        code.local_addr(0)
            .simple(Op::LoadInt)
            .push_int(1)
            .simple(Op::AddInt)
            .local_addr(0)
            .simple(Op::StoreInt);
        let back = code.branch(Op::Jump);
        code.patch(back, top);
        let exit = code.here();
        code.patch(to_exit, exit);
        code.ret();
        builder.method(main, "main", "()V", "I", code.finish());
        builder
    }

    // A 64-byte heap fits two arrays at a time; without collection the
    // loop starves, with collect-and-retry it finishes.
    let starved = VmCreateInfo {
        heap_size: 64,
        gc: GcPolicy::Never,
        ..Default::default()
    };
    let (mut vm, _console) = vm_with_console(starved);
    let err = vm.load_and_run(&churn().encode()).unwrap_err();
    assert!(matches!(err, VmError::Memory(_)), "{err}");

    let recovering = VmCreateInfo {
        heap_size: 64,
        gc: GcPolicy::OnAllocFailure,
        ..Default::default()
    };
    let (mut vm, _console) = vm_with_console(recovering);
    vm.load_and_run(&churn().encode()).unwrap();
    // Whatever the loop left behind is unreachable once the stack unwinds.
    vm.collect().unwrap();
    assert_eq!(vm.heap.object_count(), 0);
}

#[test]
fn periodic_policy_collects_unrooted_garbage() {
    let mut builder = ModuleBuilder::new("main");
    let main = builder.class("main", "Main");
    let mut code = CodeWriter::new();
    code.push_int(4).new_array('I').pop();
    code.push_int(4).new_array('I').pop();
    // Enough instructions follow for the periodic trigger to fire.
    for _ in 0..8 {
        code.push_int(0).pop();
    }
    code.ret();
    builder.method(main, "main", "()V", "", code.finish());

    let info = VmCreateInfo {
        gc: GcPolicy::Periodic(4),
        ..Default::default()
    };
    let (mut vm, _console) = vm_with_console(info);
    vm.load_and_run(&builder.encode()).unwrap();
    assert_eq!(vm.heap.object_count(), 0);
}
