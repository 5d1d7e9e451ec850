//! IR instruction objects.
//!
//! An instruction is an opcode class plus an ordered list of typed
//! arguments. Stack-index arguments are distances from the top of the
//! stack at the point the instruction executes (0 is the top), already
//! relativized by the generator. Label arguments are abstract ids; the
//! assembler turns them into PC-relative displacements.

use core::fmt;

use crate::{String, Vec, vec};

/// Instruction argument, tagged by class.
///
/// The assembler checks that each instruction carries the argument
/// classes it expects and reports a structural error otherwise.
#[derive(Clone, PartialEq)]
pub enum Arg {
    /// Plain integer: label ids, pop counts, arities, symbol ids, capture
    /// descriptors.
    Integer(i64),
    /// Stack index, measured from the top of the stack.
    Index(i64),
    /// IEEE-754 double payload.
    Double(f64),
    /// Raw byte payload for strings and symbol names.
    String(Vec<u8>),
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Integer(v) => write!(f, "{}", v),
            Arg::Index(v) => write!(f, "#{}", v),
            Arg::Double(v) => write!(f, "{}", v),
            Arg::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// The closed set of instruction classes the assembler understands.
///
/// `Label` and `InternalNop` are pseudo-instructions: a `Label` marks a
/// branch target and emits nothing, an `InternalNop` is the tombstone the
/// peephole optimizer leaves behind and also emits nothing. `Nop` is a
/// real instruction that emits one byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionClass {
    Nop,
    PushString,
    PushBoolean,
    PushInteger,
    PushDoubleFloat,
    PushIndex,
    PushSymbol,
    PushCompressedSymbol,
    PushUpvalue,
    PushClosure,
    PushVaClosure,
    PushGlobal,
    SetUpvalue,
    SetStatic,
    ReleaseUpvalues,
    Funcall,
    Apply,
    Call,
    Ccall,
    Acall,
    Jump,
    Brz,
    Brnz,
    Move,
    Not,
    Mul,
    Div,
    Add,
    Sub,
    Equal,
    Less,
    Greater,
    Cons,
    Vector,
    MakeVector,
    GetVecElt,
    SetVecElt,
    Car,
    Cdr,
    SetCar,
    SetCdr,
    NullP,
    TypeOf,
    MakeType,
    MakeInstance,
    CompositeValue,
    CompositeFunction,
    SetCompositeValue,
    SetCompositeFunction,
    MakeString,
    Concatenate,
    Substring,
    Length,
    SymbolString,
    SymbolId,
    Pop,
    Return,
    Nil,
    Halt,
    Label,
    InternalNop,
}

impl InstructionClass {
    /// True for every instruction that leaves exactly one new value on the
    /// stack and has no other effect, making it a candidate for push/pop
    /// cancellation in the peephole pass.
    pub const fn is_pure_push(self) -> bool {
        matches!(
            self,
            InstructionClass::Nil
                | InstructionClass::MakeType
                | InstructionClass::PushString
                | InstructionClass::PushBoolean
                | InstructionClass::PushInteger
                | InstructionClass::PushDoubleFloat
                | InstructionClass::PushIndex
                | InstructionClass::PushSymbol
                | InstructionClass::PushCompressedSymbol
                | InstructionClass::PushUpvalue
                | InstructionClass::PushClosure
                | InstructionClass::PushVaClosure
                | InstructionClass::PushGlobal
        )
    }

    /// True for the branch-carrying classes that record a jump link during
    /// linearization.
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            InstructionClass::Jump
                | InstructionClass::Brz
                | InstructionClass::Brnz
                | InstructionClass::Call
                | InstructionClass::PushClosure
                | InstructionClass::PushVaClosure
        )
    }
}

/// A single IR instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub class: InstructionClass,
    pub args: Vec<Arg>,
}

impl Instruction {
    pub fn new(class: InstructionClass, args: Vec<Arg>) -> Self {
        Self { class, args }
    }

    fn nullary(class: InstructionClass) -> Self {
        Self::new(class, Vec::new())
    }

    fn unary_index(class: InstructionClass, index: i64) -> Self {
        Self::new(class, vec![Arg::Index(index)])
    }

    fn binary_index(class: InstructionClass, a: i64, b: i64) -> Self {
        Self::new(class, vec![Arg::Index(a), Arg::Index(b)])
    }

    fn ternary_index(class: InstructionClass, a: i64, b: i64, c: i64) -> Self {
        Self::new(class, vec![Arg::Index(a), Arg::Index(b), Arg::Index(c)])
    }

    // === Pseudo-instructions ===

    /// Marks a branch target. Each id may be declared at most once.
    pub fn label(id: i64) -> Self {
        Self::new(InstructionClass::Label, vec![Arg::Integer(id)])
    }

    /// Tombstone left by the peephole optimizer; emits no bytes.
    pub fn internal_nop() -> Self {
        Self::nullary(InstructionClass::InternalNop)
    }

    // === Pushes ===

    pub fn nop() -> Self {
        Self::nullary(InstructionClass::Nop)
    }

    pub fn nil() -> Self {
        Self::nullary(InstructionClass::Nil)
    }

    pub fn push_boolean(value: bool) -> Self {
        Self::new(InstructionClass::PushBoolean, vec![Arg::Integer(value as i64)])
    }

    pub fn push_integer(value: i64) -> Self {
        Self::new(InstructionClass::PushInteger, vec![Arg::Integer(value)])
    }

    pub fn push_double_float(value: f64) -> Self {
        Self::new(InstructionClass::PushDoubleFloat, vec![Arg::Double(value)])
    }

    pub fn push_string(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self::new(
            InstructionClass::PushString,
            vec![Arg::Integer(bytes.len() as i64), Arg::String(bytes)],
        )
    }

    /// Push a copy of the stack slot `index` positions below the top.
    pub fn push_index(index: i64) -> Self {
        Self::unary_index(InstructionClass::PushIndex, index)
    }

    pub fn push_symbol(id: i64, name: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        Self::new(
            InstructionClass::PushSymbol,
            vec![
                Arg::Integer(id),
                Arg::Integer(name.len() as i64),
                Arg::String(name),
            ],
        )
    }

    /// Symbol push that carries only the id; the textual name is expected
    /// to already be interned in the executing VM.
    pub fn push_compressed_symbol(id: i64, name_length: i64) -> Self {
        Self::new(
            InstructionClass::PushCompressedSymbol,
            vec![Arg::Integer(id), Arg::Integer(name_length)],
        )
    }

    pub fn push_upvalue(index: i64) -> Self {
        Self::unary_index(InstructionClass::PushUpvalue, index)
    }

    /// `captures` entries are the capture descriptors of §pushClosure: a
    /// positive value is a stack distance, a negative value names an
    /// upvalue of the enclosing closure.
    pub fn push_closure(label: i64, arity: i64, captures: &[i64]) -> Self {
        let mut args = vec![Arg::Integer(label), Arg::Integer(arity)];
        args.extend(captures.iter().map(|&c| Arg::Integer(c)));
        Self::new(InstructionClass::PushClosure, args)
    }

    pub fn push_va_closure(label: i64, arity: i64, captures: &[i64]) -> Self {
        let mut args = vec![Arg::Integer(label), Arg::Integer(arity)];
        args.extend(captures.iter().map(|&c| Arg::Integer(c)));
        Self::new(InstructionClass::PushVaClosure, args)
    }

    pub fn push_global(key: i64) -> Self {
        Self::unary_index(InstructionClass::PushGlobal, key)
    }

    // === Stores ===

    pub fn set_upvalue(upvalue: i64, source: i64) -> Self {
        Self::new(
            InstructionClass::SetUpvalue,
            vec![Arg::Index(upvalue), Arg::Index(source)],
        )
    }

    pub fn set_static(source: i64, key: i64) -> Self {
        Self::new(
            InstructionClass::SetStatic,
            vec![Arg::Index(source), Arg::Index(key)],
        )
    }

    /// `move src, dst`: copy the object at stack index `source` into the
    /// slot at stack index `destination`.
    pub fn move_object(source: i64, destination: i64) -> Self {
        Self::binary_index(InstructionClass::Move, source, destination)
    }

    // === Calls and control flow ===

    pub fn funcall(function: i64, arity: i64) -> Self {
        Self::new(
            InstructionClass::Funcall,
            vec![Arg::Index(function), Arg::Integer(arity)],
        )
    }

    pub fn apply(function: i64, arity: i64) -> Self {
        Self::new(
            InstructionClass::Apply,
            vec![Arg::Index(function), Arg::Integer(arity)],
        )
    }

    pub fn ccall(callback: i64) -> Self {
        Self::new(InstructionClass::Ccall, vec![Arg::Integer(callback)])
    }

    pub fn call(label: i64, pops: i64) -> Self {
        Self::new(
            InstructionClass::Call,
            vec![Arg::Integer(label), Arg::Integer(pops)],
        )
    }

    pub fn acall(function: i64, arity: i64) -> Self {
        Self::new(
            InstructionClass::Acall,
            vec![Arg::Index(function), Arg::Integer(arity)],
        )
    }

    pub fn jump(label: i64) -> Self {
        Self::new(InstructionClass::Jump, vec![Arg::Integer(label)])
    }

    /// Branch if the top of stack is falsy, popping `pops` objects either way.
    pub fn brz(label: i64, pops: i64) -> Self {
        Self::new(
            InstructionClass::Brz,
            vec![Arg::Integer(label), Arg::Integer(pops)],
        )
    }

    /// Branch if the top of stack is truthy, popping `pops` objects either way.
    pub fn brnz(label: i64, pops: i64) -> Self {
        Self::new(
            InstructionClass::Brnz,
            vec![Arg::Integer(label), Arg::Integer(pops)],
        )
    }

    pub fn release_upvalues(indices: &[i64]) -> Self {
        Self::new(
            InstructionClass::ReleaseUpvalues,
            indices.iter().map(|&i| Arg::Integer(i)).collect(),
        )
    }

    pub fn pop(count: i64) -> Self {
        Self::new(InstructionClass::Pop, vec![Arg::Integer(count)])
    }

    pub fn return_(pops: i64) -> Self {
        Self::new(InstructionClass::Return, vec![Arg::Integer(pops)])
    }

    pub fn halt() -> Self {
        Self::nullary(InstructionClass::Halt)
    }

    // === Operators ===

    pub fn not(a: i64) -> Self {
        Self::unary_index(InstructionClass::Not, a)
    }

    pub fn mul(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Mul, a, b)
    }

    pub fn div(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Div, a, b)
    }

    pub fn add(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Add, a, b)
    }

    pub fn sub(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Sub, a, b)
    }

    pub fn equal(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Equal, a, b)
    }

    pub fn less(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Less, a, b)
    }

    pub fn greater(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Greater, a, b)
    }

    // === Lists ===

    pub fn cons(car: i64, cdr: i64) -> Self {
        Self::binary_index(InstructionClass::Cons, car, cdr)
    }

    pub fn car(a: i64) -> Self {
        Self::unary_index(InstructionClass::Car, a)
    }

    pub fn cdr(a: i64) -> Self {
        Self::unary_index(InstructionClass::Cdr, a)
    }

    pub fn set_car(cons: i64, value: i64) -> Self {
        Self::binary_index(InstructionClass::SetCar, cons, value)
    }

    pub fn set_cdr(cons: i64, value: i64) -> Self {
        Self::binary_index(InstructionClass::SetCdr, cons, value)
    }

    pub fn nullp(a: i64) -> Self {
        Self::unary_index(InstructionClass::NullP, a)
    }

    // === Vectors ===

    pub fn vector(elements: &[i64]) -> Self {
        Self::new(
            InstructionClass::Vector,
            elements.iter().map(|&i| Arg::Index(i)).collect(),
        )
    }

    pub fn make_vector(length: i64, fill: i64) -> Self {
        Self::binary_index(InstructionClass::MakeVector, length, fill)
    }

    pub fn get_vec_elt(vector: i64, index: i64) -> Self {
        Self::binary_index(InstructionClass::GetVecElt, vector, index)
    }

    pub fn set_vec_elt(vector: i64, index: i64, value: i64) -> Self {
        Self::ternary_index(InstructionClass::SetVecElt, vector, index, value)
    }

    // === Strings and symbols ===

    pub fn make_string(source: i64) -> Self {
        Self::unary_index(InstructionClass::MakeString, source)
    }

    pub fn concatenate(a: i64, b: i64) -> Self {
        Self::binary_index(InstructionClass::Concatenate, a, b)
    }

    pub fn substring(string: i64, start: i64, end: i64) -> Self {
        Self::ternary_index(InstructionClass::Substring, string, start, end)
    }

    pub fn length(a: i64) -> Self {
        Self::unary_index(InstructionClass::Length, a)
    }

    pub fn symbol_string(a: i64) -> Self {
        Self::unary_index(InstructionClass::SymbolString, a)
    }

    pub fn symbol_id(a: i64) -> Self {
        Self::unary_index(InstructionClass::SymbolId, a)
    }

    // === Types and composites ===

    pub fn type_of(a: i64) -> Self {
        Self::unary_index(InstructionClass::TypeOf, a)
    }

    pub fn make_type() -> Self {
        Self::nullary(InstructionClass::MakeType)
    }

    pub fn make_instance(ty: i64, value: i64, function: i64) -> Self {
        Self::ternary_index(InstructionClass::MakeInstance, ty, value, function)
    }

    pub fn composite_value(a: i64) -> Self {
        Self::unary_index(InstructionClass::CompositeValue, a)
    }

    pub fn composite_function(a: i64) -> Self {
        Self::unary_index(InstructionClass::CompositeFunction, a)
    }

    pub fn set_composite_value(composite: i64, value: i64) -> Self {
        Self::binary_index(InstructionClass::SetCompositeValue, composite, value)
    }

    pub fn set_composite_function(composite: i64, function: i64) -> Self {
        Self::binary_index(InstructionClass::SetCompositeFunction, composite, function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_string_records_length() {
        let instr = Instruction::push_string(*b"duck");
        assert_eq!(instr.class, InstructionClass::PushString);
        assert_eq!(instr.args[0], Arg::Integer(4));
        assert_eq!(instr.args[1], Arg::String(b"duck".to_vec()));
    }

    #[test]
    fn test_push_closure_captures() {
        let instr = Instruction::push_closure(3, 2, &[1, -1]);
        assert_eq!(instr.args.len(), 4);
        assert_eq!(instr.args[2], Arg::Integer(1));
        assert_eq!(instr.args[3], Arg::Integer(-1));
    }

    #[test]
    fn test_pure_push_classification() {
        assert!(Instruction::push_integer(1).class.is_pure_push());
        assert!(Instruction::nil().class.is_pure_push());
        assert!(!Instruction::pop(1).class.is_pure_push());
        assert!(!Instruction::add(0, 1).class.is_pure_push());
    }

    #[test]
    fn test_branch_classification() {
        assert!(Instruction::jump(0).class.is_branch());
        assert!(Instruction::push_closure(0, 0, &[]).class.is_branch());
        assert!(!Instruction::pop(1).class.is_branch());
    }
}
