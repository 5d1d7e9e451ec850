//! The compact bytecode format executed by the VM.
//!
//! A program is a single contiguous byte blob: one opcode byte followed by
//! that opcode's operand bytes. Opcode numbering is fixed and part of the
//! external format; all multi-byte operands are big-endian, and branch
//! displacements are signed, relative to the first byte after the
//! displacement field. Closure function addresses are absolute from the
//! start of the blob and always 32 bits wide.

mod opcode;

pub use opcode::Opcode;
