//! Linearizer and byte emitter.
//!
//! Assembly proceeds in five stages:
//! 1. Peephole-optimize the IR (push/pop cancellation, pop fusion).
//! 2. Collect label targets and branch sources while emitting every
//!    non-branch byte into the byte-link list. Branches emit only their
//!    opcode (plus any trailing non-displacement operands); the
//!    displacement itself is left for later.
//! 3. Build one jump link per branch from the label table.
//! 4. Relax link widths to their fixed point.
//! 5. Patch each branch opcode to its final width variant, splice the
//!    displacement bytes in behind it, and flatten the list.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{
    Vec,
    bytecode::Opcode,
    ir::{Arg, Instruction, InstructionClass},
};

use super::{
    AssemblerOptions, Assembly,
    byte_list::ByteList,
    error::{AssembleError, AssembleWarning},
    peephole,
    relax::{JumpLink, relax},
};

/// Operand width class shared by a family of opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Width {
    One,
    Two,
    Four,
}

impl Width {
    fn bytes(self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
            Width::Four => 4,
        }
    }

    /// Offset added to the family's 8-bit opcode.
    fn opcode_offset(self) -> u8 {
        match self {
            Width::One => 0,
            Width::Two => 1,
            Width::Four => 2,
        }
    }

    fn for_unsigned(value: u64) -> Self {
        if value < 0x100 {
            Width::One
        } else if value < 0x1_0000 {
            Width::Two
        } else {
            Width::Four
        }
    }

    fn for_signed(value: i64) -> Self {
        let magnitude = value.unsigned_abs();
        if magnitude < 0x80 {
            Width::One
        } else if magnitude < 0x8000 {
            Width::Two
        } else {
            Width::Four
        }
    }
}

/// Append `count` bytes of `value`, most significant byte first.
fn push_be(bytes: &mut SmallVec<[u8; 16]>, value: u64, count: usize) {
    for shift in (0..count).rev() {
        bytes.push((value >> (8 * shift)) as u8);
    }
}

fn integer_arg(
    instruction: &Instruction,
    n: usize,
    at: usize,
) -> Result<i64, AssembleError> {
    match instruction.args.get(n) {
        Some(Arg::Integer(value)) => Ok(*value),
        _ => Err(AssembleError::ArgumentClass {
            class: instruction.class,
            instruction: at,
        }),
    }
}

fn index_arg(instruction: &Instruction, n: usize, at: usize) -> Result<i64, AssembleError> {
    match instruction.args.get(n) {
        Some(Arg::Index(value)) => Ok(*value),
        _ => Err(AssembleError::ArgumentClass {
            class: instruction.class,
            instruction: at,
        }),
    }
}

fn double_arg(instruction: &Instruction, n: usize, at: usize) -> Result<f64, AssembleError> {
    match instruction.args.get(n) {
        Some(Arg::Double(value)) => Ok(*value),
        _ => Err(AssembleError::ArgumentClass {
            class: instruction.class,
            instruction: at,
        }),
    }
}

fn string_arg<'a>(
    instruction: &'a Instruction,
    n: usize,
    at: usize,
) -> Result<&'a [u8], AssembleError> {
    match instruction.args.get(n) {
        Some(Arg::String(bytes)) => Ok(bytes),
        _ => Err(AssembleError::ArgumentClass {
            class: instruction.class,
            instruction: at,
        }),
    }
}

/// Gather all index operands, selecting one shared width that fits the
/// largest of them, and encode each at that width.
fn encode_indices(
    instruction: &Instruction,
    count: usize,
    at: usize,
    operands: &mut SmallVec<[u8; 16]>,
) -> Result<Width, AssembleError> {
    let mut indices: SmallVec<[i64; 4]> = SmallVec::new();
    let mut largest = 0u64;
    for n in 0..count {
        let index = index_arg(instruction, n, at)?;
        largest = largest.max(index as u64);
        indices.push(index);
    }
    let width = Width::for_unsigned(largest);
    for index in indices {
        push_be(operands, index as u64, width.bytes());
    }
    Ok(width)
}

#[derive(Debug, Clone, Copy)]
struct LabelSource {
    source: usize,
    absolute: bool,
}

#[derive(Debug, Default)]
struct Label {
    target: Option<usize>,
    sources: Vec<LabelSource>,
}

fn label_slot<'a>(
    labels: &'a mut Vec<Label>,
    id: i64,
    at: usize,
) -> Result<&'a mut Label, AssembleError> {
    if id < 0 {
        return Err(AssembleError::InvalidLabel {
            label: id,
            instruction: at,
        });
    }
    let index = id as usize;
    if index >= labels.len() {
        labels.resize_with(index + 1, Label::default);
    }
    Ok(&mut labels[index])
}

/// Assemble an IR sequence into a bytecode blob.
pub(crate) fn assemble(
    ir: &[Instruction],
    options: &AssemblerOptions,
) -> Result<Assembly, AssembleError> {
    let mut ir: Vec<Instruction> = ir.to_vec();
    if options.optimize_pushpops {
        peephole::optimize(&mut ir);
    }

    let mut list = ByteList::new();
    let mut labels: Vec<Label> = Vec::new();
    let mut warnings: Vec<AssembleWarning> = Vec::new();
    let mut link_count = 0usize;

    // Stage 2: linearize.
    for (at, instruction) in ir.iter().enumerate() {
        let mut operands: SmallVec<[u8; 16]> = SmallVec::new();

        let opcode: u8 = match instruction.class {
            InstructionClass::InternalNop => {
                // Does not reach bytecode.
                continue;
            }

            InstructionClass::Label => {
                let id = integer_arg(instruction, 0, at)?;
                let slot = label_slot(&mut labels, id, at)?;
                if slot.target.is_some() {
                    return Err(AssembleError::LabelRedefined {
                        label: id,
                        instruction: at,
                    });
                }
                slot.target = Some(list.len());
                continue;
            }

            // Branches and closure pushes: the displacement is not
            // emitted here. The link's source is the index the first
            // displacement byte will occupy, right after the opcode.
            InstructionClass::Jump
            | InstructionClass::Brz
            | InstructionClass::Brnz
            | InstructionClass::Call
            | InstructionClass::PushClosure
            | InstructionClass::PushVaClosure => {
                let id = integer_arg(instruction, 0, at)?;
                let absolute = matches!(
                    instruction.class,
                    InstructionClass::PushClosure | InstructionClass::PushVaClosure
                );
                let slot = label_slot(&mut labels, id, at)?;
                slot.sources.push(LabelSource {
                    source: list.len() + 1,
                    absolute,
                });
                link_count += 1;

                match instruction.class {
                    InstructionClass::Brz | InstructionClass::Brnz | InstructionClass::Call => {
                        // Trailing pop count; not part of the displacement.
                        let pops = integer_arg(instruction, 1, at)?;
                        operands.push(pops as u8);
                    }
                    InstructionClass::PushClosure | InstructionClass::PushVaClosure => {
                        let arity = integer_arg(instruction, 1, at)?;
                        operands.push(arity as u8);
                        let captures = instruction.args.len().saturating_sub(2);
                        push_be(&mut operands, captures as u64, 4);
                        for n in 0..captures {
                            let capture = integer_arg(instruction, 2 + n, at)?;
                            push_be(&mut operands, capture as i32 as u32 as u64, 4);
                        }
                    }
                    _ => {}
                }

                match instruction.class {
                    InstructionClass::Jump => Opcode::Jump8 as u8,
                    InstructionClass::Brz => Opcode::Brz8 as u8,
                    InstructionClass::Brnz => Opcode::Brnz8 as u8,
                    InstructionClass::Call => Opcode::Call8 as u8,
                    InstructionClass::PushClosure => Opcode::PushClosure8 as u8,
                    InstructionClass::PushVaClosure => Opcode::PushVaClosure8 as u8,
                    _ => unreachable!(),
                }
            }

            InstructionClass::Nop => Opcode::Nop as u8,

            InstructionClass::PushString => {
                let mut payload = string_arg(instruction, 1, at)?;
                if payload.len() > u32::MAX as usize {
                    warn!(
                        instruction = at,
                        length = payload.len(),
                        "string payload exceeds the 32-bit length field; truncating"
                    );
                    warnings.push(AssembleWarning::StringTruncated {
                        instruction: at,
                        original_length: payload.len(),
                    });
                    payload = &payload[..u32::MAX as usize];
                }
                let width = Width::for_unsigned(payload.len() as u64);
                push_be(&mut operands, payload.len() as u64, width.bytes());
                operands.extend_from_slice(payload);
                Opcode::PushString8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushBoolean => {
                let value = integer_arg(instruction, 0, at)?;
                if value != 0 {
                    Opcode::PushBooleanTrue as u8
                } else {
                    Opcode::PushBooleanFalse as u8
                }
            }

            InstructionClass::PushInteger => {
                let value = integer_arg(instruction, 0, at)?;
                let width = Width::for_signed(value);
                push_be(&mut operands, value as u64, width.bytes());
                Opcode::PushInteger8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushDoubleFloat => {
                let value = double_arg(instruction, 0, at)?;
                push_be(&mut operands, value.to_bits(), 8);
                Opcode::PushDoubleFloat as u8
            }

            InstructionClass::PushIndex => {
                let index = index_arg(instruction, 0, at)?;
                let width = Width::for_unsigned(index as u64);
                push_be(&mut operands, index as u64, width.bytes());
                Opcode::PushIndex8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushSymbol => {
                let id = integer_arg(instruction, 0, at)?;
                let length = integer_arg(instruction, 1, at)?;
                let name = string_arg(instruction, 2, at)?;
                let width =
                    Width::for_unsigned(id.unsigned_abs().max(length.unsigned_abs()));
                push_be(&mut operands, id as u64, width.bytes());
                push_be(&mut operands, length as u64, width.bytes());
                operands.extend_from_slice(name);
                Opcode::PushSymbol8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushCompressedSymbol => {
                // The name is not embedded; the executing VM must already
                // have this id interned. Width still covers the length so
                // that both symbol forms agree on their variant.
                let id = integer_arg(instruction, 0, at)?;
                let length = integer_arg(instruction, 1, at)?;
                let width =
                    Width::for_unsigned(id.unsigned_abs().max(length.unsigned_abs()));
                push_be(&mut operands, id as u64, width.bytes());
                Opcode::PushCompressedSymbol8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushUpvalue => {
                let index = index_arg(instruction, 0, at)?;
                let width = Width::for_unsigned(index as u64);
                push_be(&mut operands, index as u64, width.bytes());
                Opcode::PushUpvalue8 as u8 + width.opcode_offset()
            }

            InstructionClass::PushGlobal => {
                let key = index_arg(instruction, 0, at)?;
                operands.push(key as u8);
                Opcode::PushGlobal8 as u8
            }

            InstructionClass::SetUpvalue => {
                // The upvalue index is always one byte; only the stack
                // source operand is width-selected.
                let upvalue = index_arg(instruction, 0, at)?;
                let source = index_arg(instruction, 1, at)?;
                let width = Width::for_unsigned(source as u64);
                operands.push(upvalue as u8);
                push_be(&mut operands, source as u64, width.bytes());
                Opcode::SetUpvalue8 as u8 + width.opcode_offset()
            }

            InstructionClass::SetStatic => {
                let source = index_arg(instruction, 0, at)?;
                let key = index_arg(instruction, 1, at)?;
                operands.push(source as u8);
                operands.push(key as u8);
                Opcode::SetStatic8 as u8
            }

            InstructionClass::ReleaseUpvalues => {
                let mut largest = 0u64;
                let mut indices: SmallVec<[i64; 8]> = SmallVec::new();
                for n in 0..instruction.args.len() {
                    let index = integer_arg(instruction, n, at)?;
                    largest = largest.max(index as u64);
                    indices.push(index);
                }
                let width = Width::for_unsigned(largest);
                push_be(&mut operands, indices.len() as u64, width.bytes());
                for index in indices {
                    push_be(&mut operands, index as u64, width.bytes());
                }
                Opcode::ReleaseUpvalues8 as u8 + width.opcode_offset()
            }

            InstructionClass::Funcall | InstructionClass::Apply | InstructionClass::Acall => {
                let function = index_arg(instruction, 0, at)?;
                let arity = integer_arg(instruction, 1, at)?;
                let width = Width::for_unsigned(function as u64);
                push_be(&mut operands, function as u64, width.bytes());
                operands.push(arity as u8);
                let base = match instruction.class {
                    InstructionClass::Funcall => Opcode::Funcall8,
                    InstructionClass::Apply => Opcode::Apply8,
                    _ => Opcode::Acall8,
                };
                base as u8 + width.opcode_offset()
            }

            InstructionClass::Ccall => {
                let callback = integer_arg(instruction, 0, at)?;
                let width = Width::for_unsigned(callback as u64);
                push_be(&mut operands, callback as u64, width.bytes());
                Opcode::Ccall8 as u8 + width.opcode_offset()
            }

            InstructionClass::Vector => {
                let count = instruction.args.len();
                let mut largest = count as u64;
                let mut indices: SmallVec<[i64; 8]> = SmallVec::new();
                for n in 0..count {
                    let index = index_arg(instruction, n, at)?;
                    largest = largest.max(index as u64);
                    indices.push(index);
                }
                let width = Width::for_unsigned(largest);
                push_be(&mut operands, count as u64, width.bytes());
                for index in indices {
                    push_be(&mut operands, index as u64, width.bytes());
                }
                Opcode::Vector8 as u8 + width.opcode_offset()
            }

            InstructionClass::Pop => {
                let count = integer_arg(instruction, 0, at)?;
                let width = Width::for_unsigned(count as u64);
                push_be(&mut operands, count as u64, width.bytes());
                Opcode::Pop8 as u8 + width.opcode_offset()
            }

            InstructionClass::Return => {
                let pops = integer_arg(instruction, 0, at)?;
                if pops == 0 {
                    Opcode::Return0 as u8
                } else {
                    let width = Width::for_unsigned(pops as u64);
                    push_be(&mut operands, pops as u64, width.bytes());
                    Opcode::Return8 as u8 + width.opcode_offset()
                }
            }

            InstructionClass::Nil => Opcode::Nil as u8,
            InstructionClass::MakeType => Opcode::MakeType as u8,
            InstructionClass::Halt => Opcode::Halt as u8,

            // Single stack-index operand.
            InstructionClass::Not
            | InstructionClass::Car
            | InstructionClass::Cdr
            | InstructionClass::NullP
            | InstructionClass::TypeOf
            | InstructionClass::CompositeValue
            | InstructionClass::CompositeFunction
            | InstructionClass::MakeString
            | InstructionClass::Length
            | InstructionClass::SymbolString
            | InstructionClass::SymbolId => {
                let width = encode_indices(instruction, 1, at, &mut operands)?;
                let base = match instruction.class {
                    InstructionClass::Not => Opcode::Not8,
                    InstructionClass::Car => Opcode::Car8,
                    InstructionClass::Cdr => Opcode::Cdr8,
                    InstructionClass::NullP => Opcode::NullP8,
                    InstructionClass::TypeOf => Opcode::TypeOf8,
                    InstructionClass::CompositeValue => Opcode::CompositeValue8,
                    InstructionClass::CompositeFunction => Opcode::CompositeFunction8,
                    InstructionClass::MakeString => Opcode::MakeString8,
                    InstructionClass::Length => Opcode::Length8,
                    InstructionClass::SymbolString => Opcode::SymbolString8,
                    _ => Opcode::SymbolId8,
                };
                base as u8 + width.opcode_offset()
            }

            // Two stack-index operands, both encoded at the width of the
            // larger one.
            InstructionClass::Move
            | InstructionClass::Mul
            | InstructionClass::Div
            | InstructionClass::Add
            | InstructionClass::Sub
            | InstructionClass::Equal
            | InstructionClass::Less
            | InstructionClass::Greater
            | InstructionClass::Cons
            | InstructionClass::MakeVector
            | InstructionClass::GetVecElt
            | InstructionClass::SetCar
            | InstructionClass::SetCdr
            | InstructionClass::Concatenate
            | InstructionClass::SetCompositeValue
            | InstructionClass::SetCompositeFunction => {
                let width = encode_indices(instruction, 2, at, &mut operands)?;
                let base = match instruction.class {
                    InstructionClass::Move => Opcode::Move8,
                    InstructionClass::Mul => Opcode::Mul8,
                    InstructionClass::Div => Opcode::Div8,
                    InstructionClass::Add => Opcode::Add8,
                    InstructionClass::Sub => Opcode::Sub8,
                    InstructionClass::Equal => Opcode::Equal8,
                    InstructionClass::Less => Opcode::Less8,
                    InstructionClass::Greater => Opcode::Greater8,
                    InstructionClass::Cons => Opcode::Cons8,
                    InstructionClass::MakeVector => Opcode::MakeVector8,
                    InstructionClass::GetVecElt => Opcode::GetVecElt8,
                    InstructionClass::SetCar => Opcode::SetCar8,
                    InstructionClass::SetCdr => Opcode::SetCdr8,
                    InstructionClass::Concatenate => Opcode::Concatenate8,
                    InstructionClass::SetCompositeValue => Opcode::SetCompositeValue8,
                    _ => Opcode::SetCompositeFunction8,
                };
                base as u8 + width.opcode_offset()
            }

            // Three stack-index operands.
            InstructionClass::SetVecElt
            | InstructionClass::MakeInstance
            | InstructionClass::Substring => {
                let width = encode_indices(instruction, 3, at, &mut operands)?;
                let base = match instruction.class {
                    InstructionClass::SetVecElt => Opcode::SetVecElt8,
                    InstructionClass::MakeInstance => Opcode::MakeInstance8,
                    _ => Opcode::Substring8,
                };
                base as u8 + width.opcode_offset()
            }
        };

        list.push(opcode);
        for &byte in &operands {
            list.push(byte);
        }
    }

    // Stage 3: one jump link per branch, in label order.
    let mut links: Vec<JumpLink> = Vec::with_capacity(link_count);
    for (id, label) in labels.iter().enumerate() {
        if label.sources.is_empty() {
            continue;
        }
        let target = label.target.ok_or(AssembleError::UndeclaredLabel {
            label: id as i64,
        })?;
        for source in &label.sources {
            links.push(JumpLink {
                source: source.source as isize,
                target: target as isize,
                size: 0,
                absolute: source.absolute,
                forward: target > source.source,
            });
        }
    }

    // Stage 4: width relaxation. The originals keep the byte-list indices
    // captured at emit time; the relaxed copies hold final offsets.
    let original_links = links.clone();
    relax(&mut links, !options.optimize_jumps)?;

    // Stage 5: patch opcodes and splice displacements.
    let mut displacement: SmallVec<[u8; 16]> = SmallVec::new();
    for (original, resolved) in original_links.iter().zip(links.iter()) {
        let base = (original.source - 1) as usize;
        let bump = if resolved.absolute {
            2
        } else {
            match resolved.size {
                1 => 0,
                2 => 1,
                _ => 2,
            }
        };
        list.set_byte(base, list.byte(base) + bump);

        let value = if resolved.absolute {
            resolved.target as u64
        } else {
            (resolved.target - (resolved.source + resolved.size as isize)) as u64
        };
        displacement.clear();
        push_be(&mut displacement, value, resolved.size as usize);
        list.insert_after(base, &displacement);
    }

    debug!(
        instructions = ir.len(),
        links = links.len(),
        bytes = list.len(),
        "assembly complete"
    );

    Ok(Assembly {
        bytecode: list.into_bytes(),
        warnings,
    })
}
