//! Garbage collector soundness through full programs.

use mallard::{
    AssemblerOptions, Instruction, Object, Vm, VmOptions, assembler::assemble,
};
use pretty_assertions::assert_eq;

fn run_with(ir: &[Instruction], options: VmOptions) -> (Vm, Object) {
    let blob = assemble(ir, &AssemblerOptions::default()).unwrap().bytecode;
    let mut vm = Vm::new(options);
    let result = vm.execute(&blob).unwrap();
    (vm, result)
}

#[test]
fn garbage_is_collected_while_live_data_survives() {
    // Keep one list alive on the stack while churning through hundreds
    // of dead allocations with a tiny collection threshold.
    let mut ir = vec![
        Instruction::push_string(*b"keep"),
        Instruction::push_integer(1),
        Instruction::push_integer(2),
        Instruction::cons(1, 0),
    ];
    for _ in 0..100 {
        ir.push(Instruction::push_string(*b"waste"));
        ir.push(Instruction::push_string(*b"waste"));
        ir.push(Instruction::concatenate(1, 0));
        ir.push(Instruction::pop(3));
    }
    ir.push(Instruction::halt());

    let (vm, result) = run_with(
        &ir,
        VmOptions {
            max_heap_objects: 12,
            ..VmOptions::default()
        },
    );

    assert!(
        vm.heap_live() <= 24,
        "{} live objects left behind",
        vm.heap_live()
    );

    // The survivors kept their contents through every collection.
    match result {
        Object::List(Some(_)) => {}
        other => panic!("expected list, got {:?}", other),
    }
    assert_eq!(vm.string_bytes(&vm.stack()[0]).unwrap(), b"keep");
}

#[test]
fn reachable_objects_survive_explicit_collection() {
    // After a run, everything reachable from the stack must survive a
    // collection with identical observable content.
    let ir = [
        Instruction::push_string(*b"mal"),
        Instruction::push_string(*b"lard"),
        Instruction::concatenate(1, 0),
        Instruction::push_integer(1),
        Instruction::push_index(1),
        Instruction::cons(1, 0),
        Instruction::halt(),
    ];
    let (mut vm, _) = run_with(&ir, VmOptions::default());

    let live_before = vm.heap_live();
    vm.collect_garbage();
    vm.collect_garbage();
    assert_eq!(vm.heap_live(), live_before);

    assert_eq!(vm.string_bytes(&vm.stack()[2]).unwrap(), b"mallard");
}

#[test]
fn closed_upvalues_are_traced() {
    // The only route to the closed-over value is closure -> upvalue
    // array -> cell -> heap object; heavy churn afterwards must not
    // disturb it.
    let mut ir = vec![
        Instruction::push_closure(0, 0, &[]),
        Instruction::funcall(0, 0),
    ];
    for _ in 0..50 {
        ir.push(Instruction::push_integer(1));
        ir.push(Instruction::push_integer(2));
        ir.push(Instruction::cons(1, 0));
        ir.push(Instruction::pop(3));
    }
    ir.push(Instruction::funcall(0, 0));
    ir.push(Instruction::halt());
    ir.extend([
        // factory: local 907 captured by the returned closure
        Instruction::label(0),
        Instruction::push_integer(907),
        Instruction::push_closure(1, 0, &[1]),
        Instruction::return_(1),
        Instruction::label(1),
        Instruction::push_upvalue(0),
        Instruction::return_(0),
    ]);

    let (_, result) = run_with(
        &ir,
        VmOptions {
            max_heap_objects: 6,
            ..VmOptions::default()
        },
    );
    match result {
        Object::Integer(value) => assert_eq!(value, 907),
        other => panic!("expected integer, got {:?}", other),
    }
}

#[test]
fn globals_are_roots() {
    let ir = [
        Instruction::push_string(*b"global"),
        Instruction::set_static(0, 1),
        Instruction::pop(1),
        Instruction::halt(),
    ];
    let (mut vm, _) = run_with(&ir, VmOptions::default());
    vm.collect_garbage();
    let global = vm.global(1).cloned().expect("global must exist");
    assert_eq!(vm.string_bytes(&global).unwrap(), b"global");
}
