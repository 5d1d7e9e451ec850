//! Assembly errors and warnings.
//!
//! Structural errors abort the assembly; the partially built byte stream
//! is discarded. Warnings accompany a successful assembly and describe
//! places where the assembler had to alter the program to fit the format
//! (today: string truncation).

use core::fmt;

use crate::ir::InstructionClass;

/// Error aborting an assembly.
///
/// `instruction` is the index of the offending instruction within the IR
/// sequence, for the generator layer to map back to a source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// The same label id was declared by two `Label` pseudo-instructions.
    LabelRedefined { label: i64, instruction: usize },

    /// A branch names a label id that no `Label` declares.
    UndeclaredLabel { label: i64 },

    /// A label id is negative and cannot index the label table.
    InvalidLabel { label: i64, instruction: usize },

    /// An instruction carried an argument of the wrong class, or too few
    /// arguments.
    ArgumentClass {
        class: InstructionClass,
        instruction: usize,
    },

    /// The branch-width relaxation failed to reach a fixed point within
    /// its iteration bound. Sizes only ever grow, so hitting the bound
    /// means the link graph is inconsistent.
    RelaxationDiverged { iterations: usize },
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::LabelRedefined { label, instruction } => {
                write!(
                    f,
                    "Redefinition of label {} (instruction {})",
                    label, instruction
                )
            }
            AssembleError::UndeclaredLabel { label } => {
                write!(f, "Branch references undeclared label {}", label)
            }
            AssembleError::InvalidLabel { label, instruction } => {
                write!(f, "Invalid label id {} (instruction {})", label, instruction)
            }
            AssembleError::ArgumentClass { class, instruction } => {
                write!(
                    f,
                    "Invalid argument class for {:?} (instruction {})",
                    class, instruction
                )
            }
            AssembleError::RelaxationDiverged { iterations } => {
                write!(
                    f,
                    "Branch-width relaxation did not converge after {} iterations",
                    iterations
                )
            }
        }
    }
}

impl core::error::Error for AssembleError {}

/// Non-fatal condition reported alongside a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleWarning {
    /// A string payload was longer than the 32-bit length field allows and
    /// was truncated to fit.
    StringTruncated {
        instruction: usize,
        original_length: usize,
    },
}

impl fmt::Display for AssembleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleWarning::StringTruncated {
                instruction,
                original_length,
            } => {
                write!(
                    f,
                    "String of {} bytes truncated to fit the length field (instruction {})",
                    original_length, instruction
                )
            }
        }
    }
}
