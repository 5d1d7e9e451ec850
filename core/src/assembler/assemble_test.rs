//! Tests for the full assembly pipeline.

use pretty_assertions::assert_eq;

use crate::{
    assembler::{AssembleError, AssemblerOptions, assemble},
    bytecode::Opcode,
    ir::{Arg, Instruction},
    vec,
};

fn assemble_default(ir: &[Instruction]) -> crate::Vec<u8> {
    assemble(ir, &AssemblerOptions::default()).unwrap().bytecode
}

#[test]
fn test_trivial_push_halt() {
    let ir = [Instruction::push_integer(42), Instruction::halt()];
    let bytecode = assemble_default(&ir);
    assert_eq!(
        bytecode,
        vec![Opcode::PushInteger8 as u8, 42, Opcode::Halt as u8]
    );
}

#[test]
fn test_integer_width_selection() {
    // 127 fits in 8 bits, 128 does not (the operand is signed).
    let bytecode = assemble_default(&[Instruction::push_integer(127)]);
    assert_eq!(bytecode, vec![Opcode::PushInteger8 as u8, 127]);

    let bytecode = assemble_default(&[Instruction::push_integer(128)]);
    assert_eq!(bytecode, vec![Opcode::PushInteger16 as u8, 0x00, 0x80]);

    let bytecode = assemble_default(&[Instruction::push_integer(-300)]);
    assert_eq!(bytecode, vec![Opcode::PushInteger16 as u8, 0xFE, 0xD4]);

    let bytecode = assemble_default(&[Instruction::push_integer(0x12345)]);
    assert_eq!(
        bytecode,
        vec![Opcode::PushInteger32 as u8, 0x00, 0x01, 0x23, 0x45]
    );
}

#[test]
fn test_string_embeds_payload() {
    let bytecode = assemble_default(&[Instruction::push_string(*b"duck")]);
    assert_eq!(
        bytecode,
        vec![Opcode::PushString8 as u8, 4, b'd', b'u', b'c', b'k']
    );
}

#[test]
fn test_symbol_width_covers_id_and_length() {
    // Length 3 but id 700: both fields must be encoded at 16 bits.
    let bytecode = assemble_default(&[Instruction::push_symbol(700, *b"abc")]);
    assert_eq!(
        bytecode,
        vec![
            Opcode::PushSymbol16 as u8,
            0x02,
            0xBC,
            0x00,
            0x03,
            b'a',
            b'b',
            b'c'
        ]
    );
}

#[test]
fn test_push_pop_elimination() {
    let ir = [
        Instruction::push_boolean(true),
        Instruction::pop(1),
        Instruction::halt(),
    ];
    let bytecode = assemble_default(&ir);
    assert_eq!(bytecode, vec![Opcode::Halt as u8]);
}

#[test]
fn test_push_pop_kept_when_disabled() {
    let ir = [
        Instruction::push_boolean(true),
        Instruction::pop(1),
        Instruction::halt(),
    ];
    let options = AssemblerOptions {
        optimize_pushpops: false,
        ..AssemblerOptions::default()
    };
    let bytecode = assemble(&ir, &options).unwrap().bytecode;
    assert_eq!(
        bytecode,
        vec![
            Opcode::PushBooleanTrue as u8,
            Opcode::Pop8 as u8,
            1,
            Opcode::Halt as u8
        ]
    );
}

#[test]
fn test_backward_jump_shrinks_to_8_bits() {
    let ir = [
        Instruction::label(0),
        Instruction::push_integer(0),
        Instruction::jump(0),
    ];
    let bytecode = assemble_default(&ir);
    // Displacement is relative to the byte after the displacement field:
    // target 0, field ends at 4, so -4.
    assert_eq!(
        bytecode,
        vec![
            Opcode::PushInteger8 as u8,
            0,
            Opcode::Jump8 as u8,
            (-4i8) as u8
        ]
    );
}

#[test]
fn test_forward_jump_forced_to_16_bits() {
    let mut ir = vec![Instruction::jump(0)];
    for _ in 0..200 {
        ir.push(Instruction::nop());
    }
    ir.push(Instruction::label(0));
    ir.push(Instruction::halt());

    let bytecode = assemble_default(&ir);
    assert_eq!(bytecode[0], Opcode::Jump16 as u8);
    assert_eq!(&bytecode[1..3], &[0x00, 0xC8], "displacement must be 200");
    assert_eq!(bytecode.len(), 1 + 2 + 200 + 1);
    assert_eq!(bytecode[203], Opcode::Halt as u8);
}

#[test]
fn test_eight_bit_boundary_is_minimal() {
    // Backward distance of exactly -128 still fits in one byte.
    let mut ir = vec![Instruction::label(0)];
    for _ in 0..126 {
        ir.push(Instruction::nop());
    }
    ir.push(Instruction::jump(0));
    let bytecode = assemble_default(&ir);
    assert_eq!(bytecode[126], Opcode::Jump8 as u8);
    assert_eq!(bytecode[127], (-128i8) as u8);

    // One more instruction pushes it past the 8-bit range.
    let mut ir = vec![Instruction::label(0)];
    for _ in 0..127 {
        ir.push(Instruction::nop());
    }
    ir.push(Instruction::jump(0));
    let bytecode = assemble_default(&ir);
    assert_eq!(bytecode[127], Opcode::Jump16 as u8);
    let displacement = i16::from_be_bytes([bytecode[128], bytecode[129]]);
    assert_eq!(displacement, -130);
}

#[test]
fn test_jump_optimization_disabled_uses_32_bits() {
    let ir = [
        Instruction::label(0),
        Instruction::push_integer(0),
        Instruction::jump(0),
    ];
    let options = AssemblerOptions {
        optimize_jumps: false,
        ..AssemblerOptions::default()
    };
    let bytecode = assemble(&ir, &options).unwrap().bytecode;
    assert_eq!(bytecode[2], Opcode::Jump32 as u8);
    let displacement = i32::from_be_bytes([bytecode[3], bytecode[4], bytecode[5], bytecode[6]]);
    assert_eq!(displacement, -7);
}

#[test]
fn test_tie_breaker_collision() {
    // (label l1) (goto l2) (nop) (goto l1) (label l2): the source byte of
    // the second goto collides with the target byte of l2 before
    // displacements exist. Both jumps must still land correctly.
    let ir = [
        Instruction::label(0),
        Instruction::jump(1),
        Instruction::nop(),
        Instruction::jump(0),
        Instruction::label(1),
    ];
    let bytecode = assemble_default(&ir);
    assert_eq!(
        bytecode,
        vec![
            Opcode::Jump8 as u8,
            3, // forward to one past the end, after the label
            Opcode::Nop as u8,
            Opcode::Jump8 as u8,
            (-5i8) as u8, // backward to byte 0
        ]
    );

    // Decode both displacements and confirm the control-flow graph.
    let first_target = 2usize as i64 + bytecode[1] as i8 as i64;
    assert_eq!(first_target, 5, "first jump lands after label l2");
    let second_target = 5i64 + bytecode[4] as i8 as i64;
    assert_eq!(second_target, 0, "second jump lands on label l1");
}

#[test]
fn test_closure_address_is_absolute_32_bits() {
    let ir = [
        Instruction::push_closure(0, 1, &[]),
        Instruction::halt(),
        Instruction::label(0),
        Instruction::push_integer(1),
        Instruction::return_(0),
    ];
    let bytecode = assemble_default(&ir);
    assert_eq!(
        bytecode,
        vec![
            Opcode::PushClosure32 as u8,
            0,
            0,
            0,
            11, // absolute address of the function body
            1,  // arity
            0,
            0,
            0,
            0, // capture count
            Opcode::Halt as u8,
            Opcode::PushInteger8 as u8,
            1,
            Opcode::Return0 as u8,
        ]
    );
}

#[test]
fn test_closure_captures_are_encoded_signed() {
    let ir = [
        Instruction::label(0),
        Instruction::push_closure(0, 0, &[2, -1]),
    ];
    let bytecode = assemble_default(&ir);
    assert_eq!(bytecode[0], Opcode::PushClosure32 as u8);
    // arity 0, capture count 2, captures [2, -1].
    assert_eq!(bytecode[5], 0);
    assert_eq!(&bytecode[6..10], &[0, 0, 0, 2]);
    assert_eq!(&bytecode[10..14], &[0, 0, 0, 2]);
    assert_eq!(&bytecode[14..18], &[0xFF, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_branch_pop_count_trails_displacement() {
    let ir = [
        Instruction::label(0),
        Instruction::nop(),
        Instruction::brz(0, 2),
    ];
    let bytecode = assemble_default(&ir);
    // nop, brz8, displacement, pops.
    assert_eq!(
        bytecode,
        vec![Opcode::Nop as u8, Opcode::Brz8 as u8, (-3i8) as u8, 2]
    );
}

#[test]
fn test_idempotence() {
    let mut ir = vec![
        Instruction::label(3),
        Instruction::push_integer(1),
        Instruction::push_integer(2),
        Instruction::add(1, 0),
        Instruction::brnz(3, 1),
        Instruction::jump(7),
    ];
    for _ in 0..150 {
        ir.push(Instruction::nop());
    }
    ir.push(Instruction::label(7));
    ir.push(Instruction::halt());

    let first = assemble_default(&ir);
    let second = assemble_default(&ir);
    assert_eq!(first, second);
}

#[test]
fn test_label_redefinition_is_an_error() {
    let ir = [Instruction::label(1), Instruction::label(1)];
    let result = assemble(&ir, &AssemblerOptions::default());
    assert_eq!(
        result.unwrap_err(),
        AssembleError::LabelRedefined {
            label: 1,
            instruction: 1
        }
    );
}

#[test]
fn test_undeclared_label_is_an_error() {
    let ir = [Instruction::jump(7)];
    let result = assemble(&ir, &AssemblerOptions::default());
    assert_eq!(result.unwrap_err(), AssembleError::UndeclaredLabel { label: 7 });
}

#[test]
fn test_argument_class_mismatch_is_an_error() {
    use crate::ir::InstructionClass;
    let ir = [Instruction::new(
        InstructionClass::PushInteger,
        vec![Arg::String(b"not an integer".to_vec())],
    )];
    let result = assemble(&ir, &AssemblerOptions::default());
    assert_eq!(
        result.unwrap_err(),
        AssembleError::ArgumentClass {
            class: InstructionClass::PushInteger,
            instruction: 0
        }
    );
}

#[test]
fn test_negative_label_is_an_error() {
    let ir = [Instruction::label(-1)];
    let result = assemble(&ir, &AssemblerOptions::default());
    assert_eq!(
        result.unwrap_err(),
        AssembleError::InvalidLabel {
            label: -1,
            instruction: 0
        }
    );
}

#[test]
fn test_resolved_links_are_reachable() {
    // Assemble a program with a mix of branch shapes, then decode every
    // displacement and confirm it lands on an opcode boundary we expect.
    let ir = [
        Instruction::jump(0),
        Instruction::nop(),
        Instruction::nop(),
        Instruction::label(0),
        Instruction::push_integer(5),
        Instruction::brnz(1, 1),
        Instruction::nop(),
        Instruction::label(1),
        Instruction::halt(),
    ];
    let bytecode = assemble_default(&ir);

    // jump8 at 0: displacement ends at byte 2.
    assert_eq!(bytecode[0], Opcode::Jump8 as u8);
    let jump_target = 2 + bytecode[1] as i8 as isize;
    assert_eq!(bytecode[jump_target as usize], Opcode::PushInteger8 as u8);

    // brnz8 follows the push.
    let brnz_at = jump_target as usize + 2;
    assert_eq!(bytecode[brnz_at], Opcode::Brnz8 as u8);
    let brnz_target = brnz_at as isize + 2 + bytecode[brnz_at + 1] as i8 as isize;
    assert_eq!(bytecode[brnz_target as usize], Opcode::Halt as u8);
}

#[test]
fn test_multi_index_operands_share_width() {
    // Both indices fit in a byte: 8-bit variant, two operand bytes.
    let bytecode = assemble_default(&[Instruction::add(1, 0)]);
    assert_eq!(bytecode, vec![Opcode::Add8 as u8, 1, 0]);

    // One wide index drags both to 16 bits.
    let bytecode = assemble_default(&[Instruction::add(300, 0)]);
    assert_eq!(
        bytecode,
        vec![Opcode::Add16 as u8, 0x01, 0x2C, 0x00, 0x00]
    );
}

#[test]
fn test_return_zero_has_dedicated_opcode() {
    let bytecode = assemble_default(&[Instruction::return_(0)]);
    assert_eq!(bytecode, vec![Opcode::Return0 as u8]);

    let bytecode = assemble_default(&[Instruction::return_(3)]);
    assert_eq!(bytecode, vec![Opcode::Return8 as u8, 3]);
}

#[test]
fn test_double_float_payload() {
    let bytecode = assemble_default(&[Instruction::push_double_float(1.5)]);
    let mut expected = vec![Opcode::PushDoubleFloat as u8];
    expected.extend_from_slice(&1.5f64.to_bits().to_be_bytes());
    assert_eq!(bytecode, expected);
}

#[test]
fn test_release_upvalues_layout() {
    let bytecode = assemble_default(&[Instruction::release_upvalues(&[4, 9])]);
    assert_eq!(
        bytecode,
        vec![Opcode::ReleaseUpvalues8 as u8, 2, 4, 9]
    );
}
