//! Mallard - a bytecode assembler and virtual machine for a Lisp dialect
//!
//! # Overview
//!
//! Mallard is the execution core of a small Lisp: a compiler backend that
//! assembles a label-addressed instruction IR into compact bytecode, and
//! a stack-based virtual machine that runs it. The front end (reader,
//! parenthesis inference, code generation) lives elsewhere; this crate
//! owns everything from the IR down:
//!
//! - push/pop peephole optimization over the IR
//! - variable-width opcode selection and big-endian operand encoding
//! - label resolution with iterative branch-displacement minimization
//! - a VM with first-class closures, upvalues captured by reference,
//!   host callbacks, and a precise mark-and-sweep garbage collector
//!
//! # Quick Start
//!
//! ```
//! use mallard::{Instruction, Object, run};
//!
//! let ir = [
//!     Instruction::push_integer(40),
//!     Instruction::push_integer(2),
//!     Instruction::add(1, 0),
//!     Instruction::halt(),
//! ];
//! match run(&ir).unwrap() {
//!     Object::Integer(value) => assert_eq!(value, 42),
//!     other => panic!("unexpected result {:?}", other),
//! }
//! ```
//!
//! # Going further
//!
//! Use [`assembler::assemble`] directly to get the bytecode blob (the
//! stable interchange format), and drive a [`Vm`] yourself to register
//! host callbacks, bind globals, or set execution limits:
//!
//! ```
//! use mallard::{AssemblerOptions, Instruction, Object, Vm, VmOptions, assembler};
//!
//! let ir = [
//!     Instruction::push_integer(2),
//!     Instruction::push_integer(3),
//!     Instruction::ccall(0),
//!     Instruction::halt(),
//! ];
//! let assembly = assembler::assemble(&ir, &AssemblerOptions::default()).unwrap();
//!
//! let mut vm = Vm::new(VmOptions::default());
//! vm.register_callback(|vm| {
//!     let (a, b) = match (vm.peek(1)?, vm.peek(0)?) {
//!         (Object::Integer(a), Object::Integer(b)) => (*a, *b),
//!         _ => return Err(vm.error("expected two integers")),
//!     };
//!     vm.push(Object::Integer(a * b));
//!     Ok(())
//! });
//! match vm.execute(&assembly.bytecode).unwrap() {
//!     Object::Integer(value) => assert_eq!(value, 6),
//!     other => panic!("unexpected result {:?}", other),
//! }
//! ```

pub use mallard_core::{assembler, bytecode, ir, vm};

pub use mallard_core::assembler::{AssembleError, AssembleWarning, Assembly, AssemblerOptions};
pub use mallard_core::ir::{Arg, Instruction, InstructionClass};
pub use mallard_core::vm::{Object, Vm, VmError, VmOptions};

use thiserror::Error;

/// Top-level error for the combined assemble-and-execute path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("assembly failed: {0}")]
    Assemble(#[from] AssembleError),
    #[error("execution failed: {0}")]
    Vm(#[from] VmError),
}

/// Assemble `ir` with default options and execute it in a fresh VM,
/// returning the topmost stack object.
pub fn run(ir: &[Instruction]) -> Result<Object, Error> {
    let assembly = assembler::assemble(ir, &AssemblerOptions::default())?;
    let mut vm = Vm::new(VmOptions::default());
    Ok(vm.execute(&assembly.bytecode)?)
}
