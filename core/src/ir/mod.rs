//! High-level instruction IR consumed by the assembler.
//!
//! The generator layer lowers an AST into this representation: a flat,
//! ordered sequence of instructions with symbolic label ids and typed
//! arguments. Nothing here has a byte address yet; the assembler is
//! responsible for width selection and label resolution.

mod instruction;

pub use instruction::{Arg, Instruction, InstructionClass};
