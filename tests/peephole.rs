//! Peephole laws: the optimized stream must execute identically to the
//! original on all inputs, and labels must block the rewrites.

use mallard::{AssemblerOptions, Instruction, Object, Vm, VmOptions, assembler::assemble};
use pretty_assertions::assert_eq;

/// Run `ir` twice, with and without push/pop optimization, and require
/// identical results and identical final stacks.
#[track_caller]
fn assert_equivalent(ir: &[Instruction]) -> Object {
    let optimized = assemble(ir, &AssemblerOptions::default()).unwrap().bytecode;
    let unoptimized = assemble(
        ir,
        &AssemblerOptions {
            optimize_pushpops: false,
            ..AssemblerOptions::default()
        },
    )
    .unwrap()
    .bytecode;

    let mut vm_a = Vm::new(VmOptions::default());
    let result_a = vm_a.execute(&optimized).unwrap();
    let mut vm_b = Vm::new(VmOptions::default());
    let result_b = vm_b.execute(&unoptimized).unwrap();

    assert_eq!(format!("{:?}", result_a), format!("{:?}", result_b));
    assert_eq!(
        format!("{:?}", vm_a.stack()),
        format!("{:?}", vm_b.stack())
    );
    result_a
}

#[test]
fn push_then_pop_one_executes_identically() {
    let result = assert_equivalent(&[
        Instruction::push_integer(7),
        Instruction::push_boolean(true),
        Instruction::pop(1),
        Instruction::halt(),
    ]);
    assert!(matches!(result, Object::Integer(7)));
}

#[test]
fn every_push_shape_cancels_against_pop() {
    let result = assert_equivalent(&[
        Instruction::push_integer(1),
        Instruction::nil(),
        Instruction::pop(1),
        Instruction::push_string(*b"gone"),
        Instruction::pop(1),
        Instruction::push_double_float(2.5),
        Instruction::pop(1),
        Instruction::make_type(),
        Instruction::pop(1),
        Instruction::halt(),
    ]);
    assert!(matches!(result, Object::Integer(1)));
}

#[test]
fn adjacent_pops_fuse() {
    let result = assert_equivalent(&[
        Instruction::push_integer(9),
        Instruction::push_integer(1),
        Instruction::push_integer(2),
        Instruction::push_integer(3),
        Instruction::pop(2),
        Instruction::pop(1),
        Instruction::halt(),
    ]);
    assert!(matches!(result, Object::Integer(9)));
}

#[test]
fn label_between_candidates_blocks_both_rules() {
    // The pop after the label is a branch target: the branch path skips
    // the push, so cancelling the pair would change what the pop removes.
    let ir = [
        Instruction::push_integer(7),
        Instruction::push_integer(1),
        Instruction::brnz(0, 1),
        Instruction::push_integer(99),
        Instruction::label(0),
        Instruction::pop(1),
        Instruction::push_integer(123),
        Instruction::halt(),
    ];
    let result = assert_equivalent(&ir);
    assert!(matches!(result, Object::Integer(123)));

    let blob = assemble(&ir, &AssemblerOptions::default()).unwrap().bytecode;
    let mut vm = Vm::new(VmOptions::default());
    vm.execute(&blob).unwrap();
    assert_eq!(vm.stack().len(), 1, "the branch path must still pop");
}
