//! The dispatch loop.
//!
//! Execution state is a value stack (also holding locals), a parallel
//! stack of open upvalue cells, a call stack of return sites, and a stack
//! of the active closure's upvalue array. Stack-index operands are
//! distances from the top at decode time: operand `k` names
//! `stack[len - 1 - k]`, so no frame-base arithmetic happens here.
//!
//! Errors unwind out of `execute` but leave the stacks intact, so a
//! driver can inspect the state that produced the failure.

use alloc::rc::Rc;
use ecow::EcoVec;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{
    Vec,
    bytecode::Opcode,
    vec,
};

use super::{
    VmOptions,
    error::VmError,
    heap::Heap,
    object::{
        self, Object, ObjectRef, UpvalueState,
    },
    stack::Stack,
};

/// Host function invoked by `ccall`. Must leave exactly one more object
/// on the stack than it found.
pub type HostCallback = Rc<dyn Fn(&mut Vm) -> Result<(), VmError>>;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    return_pc: usize,
    frame_base: usize,
}

/// A virtual machine instance.
///
/// All state is owned: two instances share nothing. The VM may be reused
/// for several `execute` calls; globals, interned symbols and the value
/// stack persist between runs.
pub struct Vm {
    pub(super) options: VmOptions,
    pub(super) heap: Heap,
    pub(super) stack: Stack<Object>,
    /// Parallel to `stack`: the open upvalue cell aliasing each slot, if
    /// any. Kept in lockstep by `push`/`pop`.
    upvalue_refs: Vec<Option<ObjectRef>>,
    call_stack: Vec<CallFrame>,
    /// The active closure's upvalue array per call frame; `None` for
    /// frames that were not entered through a closure.
    upvalue_array_stack: Vec<Option<ObjectRef>>,
    pub(super) globals: HashMap<i64, Object>,
    /// Symbol interning: id to name string, name bytes to id.
    pub(super) symbols_by_id: HashMap<u64, ObjectRef>,
    pub(super) symbol_ids: HashMap<EcoVec<u8>, u64>,
    pub(super) next_symbol_id: u64,
    pub(super) next_type_id: u64,
    pub(super) callbacks: Vec<HostCallback>,
    /// Host-pinned objects, traced as roots.
    pub(super) pins: Vec<Object>,
    /// References allocated by the instruction currently executing.
    /// Traced as roots so a collection in the middle of a multi-allocation
    /// instruction cannot reclaim half-built structures.
    scratch: Vec<ObjectRef>,
    pc: usize,
    executed: u64,
}

enum ArithKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let max_stack_size = options.max_stack_size;
        Self {
            options,
            heap: Heap::new(),
            stack: Stack::new(max_stack_size),
            upvalue_refs: Vec::new(),
            call_stack: Vec::new(),
            upvalue_array_stack: Vec::new(),
            globals: HashMap::new(),
            symbols_by_id: HashMap::new(),
            symbol_ids: HashMap::new(),
            next_symbol_id: 0,
            next_type_id: object::FIRST_USER_TYPE,
            callbacks: Vec::new(),
            pins: Vec::new(),
            scratch: Vec::new(),
            pc: 0,
            executed: 0,
        }
    }

    /// The value stack, bottom to top. Preserved after an error for
    /// inspection.
    pub fn stack(&self) -> &[Object] {
        self.stack.as_slice()
    }

    /// Number of live heap objects.
    pub fn heap_live(&self) -> usize {
        self.heap.live()
    }

    // === Stack primitives ===

    /// Push a value. Part of the host-callback ABI.
    pub fn push(&mut self, object: Object) {
        self.stack.push(object);
        self.upvalue_refs.push(None);
    }

    /// Pop the top value. Part of the host-callback ABI.
    pub fn pop(&mut self) -> Result<Object, VmError> {
        self.upvalue_refs.pop();
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Borrow the value `depth` positions below the top. Part of the
    /// host-callback ABI.
    pub fn peek(&self, depth: usize) -> Result<&Object, VmError> {
        self.stack.peek_at(depth).ok_or(VmError::StackUnderflow)
    }

    fn pop_many(&mut self, count: usize) -> Result<(), VmError> {
        if count > self.stack.len() {
            return Err(VmError::StackUnderflow);
        }
        self.stack.pop_n(count);
        self.upvalue_refs.truncate(self.stack.len());
        Ok(())
    }

    /// Resolve a stack-index operand to an absolute slot.
    fn slot(&self, distance: u64) -> Result<usize, VmError> {
        let distance = distance as usize;
        let len = self.stack.len();
        if distance >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(len - 1 - distance)
    }

    fn read_slot(&self, distance: u64) -> Result<Object, VmError> {
        let slot = self.slot(distance)?;
        Ok(self.stack.get(slot).cloned().expect("slot bounds checked"))
    }

    // === Heap primitives ===

    /// Allocate on the heap, collecting first if the live count is at the
    /// threshold. The new reference is recorded in the operand scratch so
    /// it survives collections triggered later in the same instruction.
    pub(super) fn alloc(&mut self, object: Object) -> Result<ObjectRef, VmError> {
        if self.heap.live() >= self.options.max_heap_objects {
            self.collect_garbage();
            if let Some(limit) = self.options.heap_limit {
                if self.heap.live() >= limit {
                    return Err(VmError::OutOfMemory {
                        live: self.heap.live(),
                        limit,
                    });
                }
            }
        }
        let reference = self.heap.alloc(object);
        self.scratch.push(reference);
        Ok(reference)
    }

    /// Trace from the full root set and free everything unreachable.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<ObjectRef> = Vec::new();
        for object in self.stack.iter() {
            object.for_each_child(&mut |child| roots.push(child));
        }
        for cell in &self.upvalue_refs {
            if let Some(reference) = cell {
                roots.push(*reference);
            }
        }
        for array in &self.upvalue_array_stack {
            if let Some(reference) = array {
                roots.push(*reference);
            }
        }
        for object in self.globals.values() {
            object.for_each_child(&mut |child| roots.push(child));
        }
        for reference in self.symbols_by_id.values() {
            roots.push(*reference);
        }
        for object in &self.pins {
            object.for_each_child(&mut |child| roots.push(child));
        }
        roots.extend_from_slice(&self.scratch);
        self.heap.collect(roots);
    }

    // === Operand decoding ===

    fn read_u8(&mut self, code: &[u8]) -> Result<u8, VmError> {
        let byte = *code
            .get(self.pc)
            .ok_or(VmError::TruncatedBytecode { offset: self.pc })?;
        self.pc += 1;
        Ok(byte)
    }

    fn read_uint(&mut self, code: &[u8], width: usize) -> Result<u64, VmError> {
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 8) | self.read_u8(code)? as u64;
        }
        Ok(value)
    }

    fn read_int(&mut self, code: &[u8], width: usize) -> Result<i64, VmError> {
        let raw = self.read_uint(code, width)?;
        let shift = 64 - 8 * width as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn read_payload<'c>(&mut self, code: &'c [u8], length: usize) -> Result<&'c [u8], VmError> {
        let start = self.pc;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= code.len())
            .ok_or(VmError::TruncatedBytecode { offset: start })?;
        self.pc = end;
        Ok(&code[start..end])
    }

    // === Upvalues ===

    fn current_upvalue_array(&self) -> Result<ObjectRef, VmError> {
        self.upvalue_array_stack
            .last()
            .copied()
            .flatten()
            .ok_or(VmError::CorruptUpvalue)
    }

    fn upvalue_cell(&self, index: usize) -> Result<ObjectRef, VmError> {
        let array = self.current_upvalue_array()?;
        match self.heap.get(array) {
            Object::UpvalueArray(cells) => {
                cells.get(index).copied().ok_or(VmError::CorruptUpvalue)
            }
            _ => Err(VmError::CorruptUpvalue),
        }
    }

    /// Follow a `HeapUpvalue` chain to its terminal cell.
    fn resolve_cell(&self, mut cell: ObjectRef) -> Result<ObjectRef, VmError> {
        // A chain longer than this is a cycle.
        for _ in 0..256 {
            match self.heap.get(cell) {
                Object::Upvalue(UpvalueState::HeapUpvalue(next)) => cell = *next,
                Object::Upvalue(_) => return Ok(cell),
                _ => return Err(VmError::CorruptUpvalue),
            }
        }
        Err(VmError::CorruptUpvalue)
    }

    fn read_cell(&self, cell: ObjectRef) -> Result<Object, VmError> {
        match self.heap.get(cell) {
            Object::Upvalue(UpvalueState::StackIndex(slot)) => self
                .stack
                .get(*slot)
                .cloned()
                .ok_or(VmError::CorruptUpvalue),
            Object::Upvalue(UpvalueState::HeapObject(target)) => {
                Ok(self.heap.get(*target).clone())
            }
            _ => Err(VmError::CorruptUpvalue),
        }
    }

    fn write_cell(&mut self, cell: ObjectRef, value: Object) -> Result<(), VmError> {
        match self.heap.get(cell) {
            Object::Upvalue(UpvalueState::StackIndex(slot)) => {
                let slot = *slot;
                *self
                    .stack
                    .get_mut(slot)
                    .ok_or(VmError::CorruptUpvalue)? = value;
                Ok(())
            }
            Object::Upvalue(UpvalueState::HeapObject(target)) => {
                let target = *target;
                *self.heap.get_mut(target) = value;
                Ok(())
            }
            _ => Err(VmError::CorruptUpvalue),
        }
    }

    /// Close the open cell aliasing `slot`, if any: copy the slot's value
    /// to the heap and retag the cell. A closed cell never reopens.
    fn close_slot(&mut self, slot: usize) -> Result<(), VmError> {
        let Some(cell) = self.upvalue_refs[slot].take() else {
            return Ok(());
        };
        let value = self
            .stack
            .get(slot)
            .cloned()
            .ok_or(VmError::CorruptUpvalue)?;
        // The cell itself may have no other root while we allocate.
        self.scratch.push(cell);
        let target = self.alloc(value)?;
        *self.heap.get_mut(cell) = Object::Upvalue(UpvalueState::HeapObject(target));
        Ok(())
    }

    // === Symbols ===

    pub(super) fn intern_symbol(&mut self, id: u64, name: &[u8]) -> Result<ObjectRef, VmError> {
        if let Some(&existing) = self.symbols_by_id.get(&id) {
            return Ok(existing);
        }
        let reference = self.alloc(Object::InternalString(name.to_vec()))?;
        self.symbols_by_id.insert(id, reference);
        let key: EcoVec<u8> = name.iter().copied().collect();
        self.symbol_ids.insert(key, id);
        if id >= self.next_symbol_id {
            self.next_symbol_id = id + 1;
        }
        Ok(reference)
    }

    // === Value helpers ===

    /// The byte window of a string object.
    pub fn string_bytes(&self, object: &Object) -> Result<&[u8], VmError> {
        let Object::Str {
            backing,
            offset,
            length,
        } = object
        else {
            return Err(VmError::TypeMismatch {
                expected: "string",
                found: object.kind_name(),
            });
        };
        match self.heap.get(*backing) {
            Object::InternalString(bytes) => Ok(&bytes[*offset..*offset + *length]),
            _ => Err(VmError::TypeMismatch {
                expected: "string",
                found: "corrupt backing",
            }),
        }
    }

    fn integer_of(&self, object: &Object) -> Result<i64, VmError> {
        match object {
            Object::Integer(value) => Ok(*value),
            _ => Err(VmError::TypeMismatch {
                expected: "integer",
                found: object.kind_name(),
            }),
        }
    }

    fn binary_arith(
        &self,
        kind: ArithKind,
        lhs: &Object,
        rhs: &Object,
    ) -> Result<Object, VmError> {
        use Object::{Float, Integer};
        match (lhs, rhs) {
            (Integer(a), Integer(b)) => {
                let (a, b) = (*a, *b);
                if matches!(kind, ArithKind::Div) && b == 0 {
                    return Err(VmError::DivisionByZero);
                }
                let value = if self.options.strict_arithmetic {
                    match kind {
                        ArithKind::Add => a.checked_add(b),
                        ArithKind::Sub => a.checked_sub(b),
                        ArithKind::Mul => a.checked_mul(b),
                        ArithKind::Div => a.checked_div(b),
                    }
                    .ok_or(VmError::IntegerOverflow)?
                } else {
                    match kind {
                        ArithKind::Add => a.wrapping_add(b),
                        ArithKind::Sub => a.wrapping_sub(b),
                        ArithKind::Mul => a.wrapping_mul(b),
                        ArithKind::Div => a.wrapping_div(b),
                    }
                };
                Ok(Integer(value))
            }
            _ => {
                // Mixed operands promote to float; float division by
                // zero keeps its IEEE-754 result.
                let a = self.float_of(lhs)?;
                let b = self.float_of(rhs)?;
                let value = match kind {
                    ArithKind::Add => a + b,
                    ArithKind::Sub => a - b,
                    ArithKind::Mul => a * b,
                    ArithKind::Div => a / b,
                };
                Ok(Float(value))
            }
        }
    }

    fn float_of(&self, object: &Object) -> Result<f64, VmError> {
        match object {
            Object::Integer(value) => Ok(*value as f64),
            Object::Float(value) => Ok(*value),
            _ => Err(VmError::TypeMismatch {
                expected: "number",
                found: object.kind_name(),
            }),
        }
    }

    fn objects_equal(&self, lhs: &Object, rhs: &Object) -> Result<bool, VmError> {
        use Object::*;
        Ok(match (lhs, rhs) {
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Integer(a), Float(b)) | (Float(b), Integer(a)) => *a as f64 == *b,
            (Bool(a), Bool(b)) => a == b,
            (Symbol { id: a, .. }, Symbol { id: b, .. }) => a == b,
            (Str { .. }, Str { .. }) => self.string_bytes(lhs)? == self.string_bytes(rhs)?,
            (Type(a), Type(b)) => a == b,
            (a, b) if a.is_null() && b.is_null() => true,
            (List(Some(a)), List(Some(b))) => a == b,
            (
                Vector {
                    backing: a,
                    offset: ao,
                },
                Vector {
                    backing: b,
                    offset: bo,
                },
            ) => a == b && ao == bo,
            (
                Closure {
                    address: a,
                    upvalues: au,
                    ..
                },
                Closure {
                    address: b,
                    upvalues: bu,
                    ..
                },
            ) => a == b && au == bu,
            (Composite(a), Composite(b)) => a == b,
            _ => false,
        })
    }

    fn object_less(&self, lhs: &Object, rhs: &Object) -> Result<bool, VmError> {
        use Object::*;
        match (lhs, rhs) {
            (Integer(a), Integer(b)) => Ok(a < b),
            (Float(a), Float(b)) => Ok(a < b),
            (Integer(a), Float(b)) => Ok((*a as f64) < *b),
            (Float(a), Integer(b)) => Ok(*a < *b as f64),
            (Bool(a), Bool(b)) => Ok(!*a & *b),
            (Str { .. }, Str { .. }) => {
                Ok(self.string_bytes(lhs)? < self.string_bytes(rhs)?)
            }
            (Symbol { .. }, Symbol { .. }) => {
                Ok(self.symbol_name(lhs)? < self.symbol_name(rhs)?)
            }
            _ => Err(VmError::TypeMismatch {
                expected: "comparable operands",
                found: rhs.kind_name(),
            }),
        }
    }

    fn symbol_name(&self, object: &Object) -> Result<&[u8], VmError> {
        let Object::Symbol { name, .. } = object else {
            return Err(VmError::TypeMismatch {
                expected: "symbol",
                found: object.kind_name(),
            });
        };
        match self.heap.get(*name) {
            Object::InternalString(bytes) => Ok(bytes),
            _ => Err(VmError::CorruptUpvalue),
        }
    }

    fn type_code_of(&self, object: &Object) -> u64 {
        match object {
            Object::Nil => object::TYPE_NIL,
            Object::Bool(_) => object::TYPE_BOOL,
            Object::Integer(_) => object::TYPE_INTEGER,
            Object::Float(_) => object::TYPE_FLOAT,
            Object::Str { .. } => object::TYPE_STRING,
            Object::Symbol { .. } => object::TYPE_SYMBOL,
            Object::List(_) | Object::Cons { .. } => object::TYPE_LIST,
            Object::Closure { .. } => object::TYPE_CLOSURE,
            Object::Vector { .. } => object::TYPE_VECTOR,
            Object::Type(_) => object::TYPE_TYPE,
            Object::Composite(record) => match self.heap.get(*record) {
                Object::InternalComposite { type_id, .. } => *type_id,
                _ => object::TYPE_NIL,
            },
            _ => object::TYPE_USER,
        }
    }

    /// Number of cons cells in a list; an improper tail ends the count.
    fn list_length(&self, object: &Object) -> Result<usize, VmError> {
        let mut cursor = object.clone();
        let mut count = 0usize;
        loop {
            match cursor {
                Object::Nil | Object::List(None) => return Ok(count),
                Object::List(Some(cell)) => {
                    let Object::Cons { cdr, .. } = self.heap.get(cell) else {
                        return Err(VmError::TypeMismatch {
                            expected: "cons",
                            found: "corrupt list",
                        });
                    };
                    count += 1;
                    cursor = self.heap.get(*cdr).clone();
                }
                _ => return Ok(count),
            }
        }
    }

    // === Calls ===

    fn call_closure(&mut self, closure: Object, call_arity: usize) -> Result<(), VmError> {
        let Object::Closure {
            address,
            arity,
            variadic,
            upvalues,
            ..
        } = closure
        else {
            return Err(VmError::TypeMismatch {
                expected: "closure",
                found: closure.kind_name(),
            });
        };

        let effective = if variadic {
            if call_arity < arity as usize {
                return Err(VmError::ArityMismatch {
                    expected: arity,
                    found: call_arity.min(u8::MAX as usize) as u8,
                });
            }
            // Cons the excess arguments into a trailing list, last
            // argument innermost.
            let excess = call_arity - arity as usize;
            let mut rest = Object::List(None);
            for _ in 0..excess {
                let value = self
                    .stack
                    .peek()
                    .cloned()
                    .ok_or(VmError::StackUnderflow)?;
                let car = self.alloc(value)?;
                let cdr = self.alloc(rest)?;
                let cell = self.alloc(Object::Cons { car, cdr })?;
                self.pop()?;
                rest = Object::List(Some(cell));
            }
            self.push(rest);
            arity as usize + 1
        } else {
            if call_arity != arity as usize {
                return Err(VmError::ArityMismatch {
                    expected: arity,
                    found: call_arity.min(u8::MAX as usize) as u8,
                });
            }
            arity as usize
        };

        if effective > self.stack.len() {
            return Err(VmError::StackUnderflow);
        }
        self.call_stack.push(CallFrame {
            return_pc: self.pc,
            frame_base: self.stack.len() - effective,
        });
        self.upvalue_array_stack.push(Some(upvalues));
        self.pc = address as usize;
        Ok(())
    }

    /// Shared by `return0`..`return32`. Returns the program result when
    /// the call stack is already empty (top-level return ends execution).
    fn do_return(&mut self, pops: usize) -> Result<Option<Object>, VmError> {
        let frame = self.call_stack.pop();
        let frame_base = frame.as_ref().map_or(0, |frame| frame.frame_base);

        // Close everything the frame is about to tear down.
        for slot in frame_base..self.stack.len() {
            self.close_slot(slot)?;
        }

        let result = self.pop()?;
        self.pop_many(pops)?;
        self.push(result.clone());

        match frame {
            Some(frame) => {
                self.pc = frame.return_pc;
                self.upvalue_array_stack
                    .pop()
                    .ok_or(VmError::CallStackUnderflow)?;
                Ok(None)
            }
            None => Ok(Some(result)),
        }
    }

    // === Dispatch ===

    /// Execute `bytecode` from its first byte until `halt` or a top-level
    /// `return`, yielding the topmost stack object.
    pub fn execute(&mut self, bytecode: &[u8]) -> Result<Object, VmError> {
        use Opcode::*;

        self.pc = 0;
        self.executed = 0;

        loop {
            self.scratch.clear();
            if let Some(budget) = self.options.instruction_budget {
                if self.executed >= budget {
                    return Err(VmError::BudgetExhausted);
                }
            }
            self.executed += 1;

            let at = self.pc;
            let byte = self.read_u8(bytecode)?;
            let op = Opcode::try_from(byte)
                .map_err(|invalid| VmError::UnknownOpcode {
                    byte: invalid.0,
                    offset: at,
                })?;

            match op {
                Nop => {}

                Halt => {
                    return Ok(self.stack.peek().cloned().unwrap_or(Object::Nil));
                }

                Nil => self.push(Object::Nil),

                PushBooleanFalse => self.push(Object::Bool(false)),
                PushBooleanTrue => self.push(Object::Bool(true)),

                op @ (PushInteger8 | PushInteger16 | PushInteger32) => {
                    let width = op.operand_width(PushInteger8);
                    let value = self.read_int(bytecode, width)?;
                    self.push(Object::Integer(value));
                }

                PushDoubleFloat => {
                    let bits = self.read_uint(bytecode, 8)?;
                    self.push(Object::Float(f64::from_bits(bits)));
                }

                op @ (PushString8 | PushString16 | PushString32) => {
                    let width = op.operand_width(PushString8);
                    let length = self.read_uint(bytecode, width)? as usize;
                    let payload = self.read_payload(bytecode, length)?.to_vec();
                    let backing = self.alloc(Object::InternalString(payload))?;
                    self.push(Object::Str {
                        backing,
                        offset: 0,
                        length,
                    });
                }

                op @ (PushSymbol8 | PushSymbol16 | PushSymbol32) => {
                    let width = op.operand_width(PushSymbol8);
                    let id = self.read_uint(bytecode, width)?;
                    let length = self.read_uint(bytecode, width)? as usize;
                    let payload = self.read_payload(bytecode, length)?.to_vec();
                    let name = self.intern_symbol(id, &payload)?;
                    self.push(Object::Symbol { id, name });
                }

                op @ (PushCompressedSymbol8 | PushCompressedSymbol16 | PushCompressedSymbol32) => {
                    let width = op.operand_width(PushCompressedSymbol8);
                    let id = self.read_uint(bytecode, width)?;
                    let name = match self.symbols_by_id.get(&id) {
                        Some(&reference) => reference,
                        None => self.intern_symbol(id, b"")?,
                    };
                    self.push(Object::Symbol { id, name });
                }

                op @ (PushIndex8 | PushIndex16 | PushIndex32) => {
                    let width = op.operand_width(PushIndex8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    self.push(value);
                }

                op @ (PushUpvalue8 | PushUpvalue16 | PushUpvalue32) => {
                    let width = op.operand_width(PushUpvalue8);
                    let index = self.read_uint(bytecode, width)? as usize;
                    let cell = self.upvalue_cell(index)?;
                    let cell = self.resolve_cell(cell)?;
                    let value = self.read_cell(cell)?;
                    self.push(value);
                }

                op @ (SetUpvalue8 | SetUpvalue16 | SetUpvalue32) => {
                    let width = op.operand_width(SetUpvalue8);
                    // The upvalue index is always one byte; only the
                    // source operand is width-selected.
                    let index = self.read_u8(bytecode)? as usize;
                    let source = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(source)?;
                    let cell = self.upvalue_cell(index)?;
                    let cell = self.resolve_cell(cell)?;
                    self.write_cell(cell, value)?;
                }

                op @ (PushClosure8 | PushClosure16 | PushClosure32 | PushVaClosure8
                | PushVaClosure16 | PushVaClosure32) => {
                    let variadic = matches!(
                        op,
                        PushVaClosure8 | PushVaClosure16 | PushVaClosure32
                    );
                    let base = if variadic { PushVaClosure8 } else { PushClosure8 };
                    let width = op.operand_width(base);
                    let address = self.read_uint(bytecode, width)? as u32;
                    let arity = self.read_u8(bytecode)?;
                    let count = self.read_uint(bytecode, 4)? as usize;

                    let mut cells: Vec<ObjectRef> = Vec::with_capacity(count);
                    for _ in 0..count {
                        let capture = self.read_int(bytecode, 4)?;
                        let cell = if capture > 0 {
                            // Positive captures are stack distances; share
                            // the open cell if the slot already has one.
                            let slot = self
                                .stack
                                .len()
                                .checked_sub(capture as usize)
                                .ok_or(VmError::StackUnderflow)?;
                            match self.upvalue_refs[slot] {
                                Some(cell) => cell,
                                None => {
                                    let cell = self.alloc(Object::Upvalue(
                                        UpvalueState::StackIndex(slot),
                                    ))?;
                                    self.upvalue_refs[slot] = Some(cell);
                                    cell
                                }
                            }
                        } else if capture < 0 {
                            // Negative captures name an upvalue of the
                            // enclosing closure; forward to its cell.
                            let index = (-(capture + 1)) as usize;
                            let parent = self.upvalue_cell(index)?;
                            self.alloc(Object::Upvalue(UpvalueState::HeapUpvalue(parent)))?
                        } else {
                            return Err(VmError::CorruptUpvalue);
                        };
                        cells.push(cell);
                    }

                    let upvalues = self.alloc(Object::UpvalueArray(cells))?;
                    self.push(Object::Closure {
                        name: 0,
                        address,
                        arity,
                        variadic,
                        upvalues,
                    });
                }

                op @ (ReleaseUpvalues8 | ReleaseUpvalues16 | ReleaseUpvalues32) => {
                    let width = op.operand_width(ReleaseUpvalues8);
                    let count = self.read_uint(bytecode, width)? as usize;
                    for _ in 0..count {
                        let distance = self.read_uint(bytecode, width)?;
                        let slot = self.slot(distance)?;
                        self.close_slot(slot)?;
                    }
                }

                PushGlobal8 => {
                    let key = self.read_u8(bytecode)? as i64;
                    let value = self
                        .globals
                        .get(&key)
                        .cloned()
                        .ok_or(VmError::UndefinedGlobal { key })?;
                    self.push(value);
                }

                SetStatic8 => {
                    let source = self.read_u8(bytecode)? as u64;
                    let key = self.read_u8(bytecode)? as i64;
                    let value = self.read_slot(source)?;
                    self.globals.insert(key, value);
                }

                op @ (Funcall8 | Funcall16 | Funcall32) => {
                    let width = op.operand_width(Funcall8);
                    let function = self.read_uint(bytecode, width)?;
                    let arity = self.read_u8(bytecode)? as usize;
                    let closure = self.read_slot(function)?;
                    self.call_closure(closure, arity)?;
                }

                // Obsolete alias kept so old bytecode still loads; the
                // operand layout matches funcall.
                op @ (Acall8 | Acall16 | Acall32) => {
                    let width = op.operand_width(Acall8);
                    let function = self.read_uint(bytecode, width)?;
                    let arity = self.read_u8(bytecode)? as usize;
                    let closure = self.read_slot(function)?;
                    self.call_closure(closure, arity)?;
                }

                op @ (Apply8 | Apply16 | Apply32) => {
                    let width = op.operand_width(Apply8);
                    let function = self.read_uint(bytecode, width)?;
                    let arity = self.read_u8(bytecode)? as usize;
                    if arity == 0 {
                        return Err(VmError::ArityMismatch {
                            expected: 1,
                            found: 0,
                        });
                    }
                    let closure = self.read_slot(function)?;

                    // The last argument is a list; splice its elements
                    // onto the stack in order.
                    let list = self.pop()?;
                    let mut spliced = 0usize;
                    let mut cursor = list;
                    loop {
                        match cursor {
                            Object::Nil | Object::List(None) => break,
                            Object::List(Some(cell)) => {
                                let (car, cdr) = match self.heap.get(cell) {
                                    Object::Cons { car, cdr } => (*car, *cdr),
                                    _ => {
                                        return Err(VmError::TypeMismatch {
                                            expected: "cons",
                                            found: "corrupt list",
                                        });
                                    }
                                };
                                self.push(self.heap.get(car).clone());
                                cursor = self.heap.get(cdr).clone();
                                spliced += 1;
                            }
                            other => {
                                return Err(VmError::TypeMismatch {
                                    expected: "list",
                                    found: other.kind_name(),
                                });
                            }
                        }
                    }
                    self.call_closure(closure, arity - 1 + spliced)?;
                }

                op @ (Ccall8 | Ccall16 | Ccall32) => {
                    let width = op.operand_width(Ccall8);
                    let index = self.read_uint(bytecode, width)? as usize;
                    let callback = self
                        .callbacks
                        .get(index)
                        .cloned()
                        .ok_or(VmError::UnknownCallback { index })?;
                    let before = self.stack.len();
                    callback(self)?;
                    let net_effect = self.stack.len() as isize - before as isize;
                    if net_effect != 1 {
                        return Err(VmError::CallbackContract { net_effect });
                    }
                }

                // Obsolete plain internal call; the trailing byte is the
                // callee's argument count.
                op @ (Call8 | Call16 | Call32) => {
                    let width = op.operand_width(Call8);
                    let displacement = self.read_int(bytecode, width)?;
                    let after = self.pc;
                    let pops = self.read_u8(bytecode)? as usize;
                    if pops > self.stack.len() {
                        return Err(VmError::StackUnderflow);
                    }
                    self.call_stack.push(CallFrame {
                        return_pc: self.pc,
                        frame_base: self.stack.len() - pops,
                    });
                    self.upvalue_array_stack.push(None);
                    self.pc = (after as i64 + displacement) as usize;
                }

                op @ (Jump8 | Jump16 | Jump32) => {
                    let width = op.operand_width(Jump8);
                    let displacement = self.read_int(bytecode, width)?;
                    self.pc = (self.pc as i64 + displacement) as usize;
                }

                op @ (Brz8 | Brz16 | Brz32 | Brnz8 | Brnz16 | Brnz32) => {
                    let branch_if_truthy = matches!(op, Brnz8 | Brnz16 | Brnz32);
                    let base = if branch_if_truthy { Brnz8 } else { Brz8 };
                    let width = op.operand_width(base);
                    let displacement = self.read_int(bytecode, width)?;
                    let after = self.pc;
                    let pops = self.read_u8(bytecode)? as usize;
                    let condition = self
                        .stack
                        .peek()
                        .ok_or(VmError::StackUnderflow)?
                        .is_truthy();
                    self.pop_many(pops)?;
                    if condition == branch_if_truthy {
                        self.pc = (after as i64 + displacement) as usize;
                    }
                }

                op @ (Move8 | Move16 | Move32) => {
                    let width = op.operand_width(Move8);
                    let source = self.read_uint(bytecode, width)?;
                    let destination = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(source)?;
                    let slot = self.slot(destination)?;
                    *self.stack.get_mut(slot).expect("slot bounds checked") = value;
                }

                op @ (Not8 | Not16 | Not32) => {
                    let width = op.operand_width(Not8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    self.push(Object::Bool(!value.is_truthy()));
                }

                op @ (Add8 | Add16 | Add32 | Sub8 | Sub16 | Sub32 | Mul8 | Mul16 | Mul32
                | Div8 | Div16 | Div32) => {
                    let (base, kind) = match op {
                        Add8 | Add16 | Add32 => (Add8, ArithKind::Add),
                        Sub8 | Sub16 | Sub32 => (Sub8, ArithKind::Sub),
                        Mul8 | Mul16 | Mul32 => (Mul8, ArithKind::Mul),
                        _ => (Div8, ArithKind::Div),
                    };
                    let width = op.operand_width(base);
                    let a = self.read_uint(bytecode, width)?;
                    let b = self.read_uint(bytecode, width)?;
                    let lhs = self.read_slot(a)?;
                    let rhs = self.read_slot(b)?;
                    let result = self.binary_arith(kind, &lhs, &rhs)?;
                    self.push(result);
                }

                op @ (Equal8 | Equal16 | Equal32) => {
                    let width = op.operand_width(Equal8);
                    let a = self.read_uint(bytecode, width)?;
                    let b = self.read_uint(bytecode, width)?;
                    let lhs = self.read_slot(a)?;
                    let rhs = self.read_slot(b)?;
                    let equal = self.objects_equal(&lhs, &rhs)?;
                    self.push(Object::Bool(equal));
                }

                op @ (Less8 | Less16 | Less32 | Greater8 | Greater16 | Greater32) => {
                    let greater = matches!(op, Greater8 | Greater16 | Greater32);
                    let base = if greater { Greater8 } else { Less8 };
                    let width = op.operand_width(base);
                    let a = self.read_uint(bytecode, width)?;
                    let b = self.read_uint(bytecode, width)?;
                    let lhs = self.read_slot(a)?;
                    let rhs = self.read_slot(b)?;
                    let result = if greater {
                        self.object_less(&rhs, &lhs)?
                    } else {
                        self.object_less(&lhs, &rhs)?
                    };
                    self.push(Object::Bool(result));
                }

                op @ (Cons8 | Cons16 | Cons32) => {
                    let width = op.operand_width(Cons8);
                    let a = self.read_uint(bytecode, width)?;
                    let b = self.read_uint(bytecode, width)?;
                    let car_value = self.read_slot(a)?;
                    let cdr_value = self.read_slot(b)?;
                    let car = self.alloc(car_value)?;
                    let cdr = self.alloc(cdr_value)?;
                    let cell = self.alloc(Object::Cons { car, cdr })?;
                    self.push(Object::List(Some(cell)));
                }

                op @ (Car8 | Car16 | Car32 | Cdr8 | Cdr16 | Cdr32) => {
                    let take_car = matches!(op, Car8 | Car16 | Car32);
                    let base = if take_car { Car8 } else { Cdr8 };
                    let width = op.operand_width(base);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    match value {
                        Object::List(Some(cell)) => {
                            let field = match self.heap.get(cell) {
                                Object::Cons { car, cdr } => {
                                    if take_car { *car } else { *cdr }
                                }
                                _ => {
                                    return Err(VmError::TypeMismatch {
                                        expected: "cons",
                                        found: "corrupt list",
                                    });
                                }
                            };
                            self.push(self.heap.get(field).clone());
                        }
                        value if value.is_null() => self.push(Object::Nil),
                        other => {
                            return Err(VmError::TypeMismatch {
                                expected: "list",
                                found: other.kind_name(),
                            });
                        }
                    }
                }

                op @ (SetCar8 | SetCar16 | SetCar32 | SetCdr8 | SetCdr16 | SetCdr32) => {
                    let set_car = matches!(op, SetCar8 | SetCar16 | SetCar32);
                    let base = if set_car { SetCar8 } else { SetCdr8 };
                    let width = op.operand_width(base);
                    let target = self.read_uint(bytecode, width)?;
                    let source = self.read_uint(bytecode, width)?;
                    let container = self.read_slot(target)?;
                    let value = self.read_slot(source)?;
                    let Object::List(Some(cell)) = container else {
                        return Err(VmError::TypeMismatch {
                            expected: "cons",
                            found: container.kind_name(),
                        });
                    };
                    let reference = self.alloc(value)?;
                    match self.heap.get_mut(cell) {
                        Object::Cons { car, cdr } => {
                            if set_car {
                                *car = reference;
                            } else {
                                *cdr = reference;
                            }
                        }
                        _ => {
                            return Err(VmError::TypeMismatch {
                                expected: "cons",
                                found: "corrupt list",
                            });
                        }
                    }
                    self.push(Object::List(Some(cell)));
                }

                op @ (NullP8 | NullP16 | NullP32) => {
                    let width = op.operand_width(NullP8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    self.push(Object::Bool(value.is_null()));
                }

                op @ (TypeOf8 | TypeOf16 | TypeOf32) => {
                    let width = op.operand_width(TypeOf8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    let code = self.type_code_of(&value);
                    self.push(Object::Type(code));
                }

                MakeType => {
                    let id = self.next_type_id;
                    self.next_type_id += 1;
                    self.push(Object::Type(id));
                }

                op @ (MakeInstance8 | MakeInstance16 | MakeInstance32) => {
                    let width = op.operand_width(MakeInstance8);
                    let ty = self.read_uint(bytecode, width)?;
                    let value = self.read_uint(bytecode, width)?;
                    let function = self.read_uint(bytecode, width)?;
                    let ty = self.read_slot(ty)?;
                    let Object::Type(type_id) = ty else {
                        return Err(VmError::TypeMismatch {
                            expected: "type",
                            found: ty.kind_name(),
                        });
                    };
                    let value = self.read_slot(value)?;
                    let function = self.read_slot(function)?;
                    let value = self.alloc(value)?;
                    let function = self.alloc(function)?;
                    let record = self.alloc(Object::InternalComposite {
                        type_id,
                        value,
                        function,
                    })?;
                    self.push(Object::Composite(record));
                }

                op @ (CompositeValue8 | CompositeValue16 | CompositeValue32
                | CompositeFunction8 | CompositeFunction16 | CompositeFunction32) => {
                    let take_value = matches!(
                        op,
                        CompositeValue8 | CompositeValue16 | CompositeValue32
                    );
                    let base = if take_value {
                        CompositeValue8
                    } else {
                        CompositeFunction8
                    };
                    let width = op.operand_width(base);
                    let distance = self.read_uint(bytecode, width)?;
                    let composite = self.read_slot(distance)?;
                    let Object::Composite(record) = composite else {
                        return Err(VmError::TypeMismatch {
                            expected: "composite",
                            found: composite.kind_name(),
                        });
                    };
                    let field = match self.heap.get(record) {
                        Object::InternalComposite {
                            value, function, ..
                        } => {
                            if take_value { *value } else { *function }
                        }
                        _ => {
                            return Err(VmError::TypeMismatch {
                                expected: "composite",
                                found: "corrupt record",
                            });
                        }
                    };
                    self.push(self.heap.get(field).clone());
                }

                op @ (SetCompositeValue8 | SetCompositeValue16 | SetCompositeValue32
                | SetCompositeFunction8 | SetCompositeFunction16 | SetCompositeFunction32) => {
                    let set_value = matches!(
                        op,
                        SetCompositeValue8 | SetCompositeValue16 | SetCompositeValue32
                    );
                    let base = if set_value {
                        SetCompositeValue8
                    } else {
                        SetCompositeFunction8
                    };
                    let width = op.operand_width(base);
                    let target = self.read_uint(bytecode, width)?;
                    let source = self.read_uint(bytecode, width)?;
                    let composite = self.read_slot(target)?;
                    let new_value = self.read_slot(source)?;
                    let Object::Composite(record) = composite else {
                        return Err(VmError::TypeMismatch {
                            expected: "composite",
                            found: composite.kind_name(),
                        });
                    };
                    let reference = self.alloc(new_value)?;
                    match self.heap.get_mut(record) {
                        Object::InternalComposite {
                            value, function, ..
                        } => {
                            if set_value {
                                *value = reference;
                            } else {
                                *function = reference;
                            }
                        }
                        _ => {
                            return Err(VmError::TypeMismatch {
                                expected: "composite",
                                found: "corrupt record",
                            });
                        }
                    }
                    self.push(Object::Composite(record));
                }

                op @ (Vector8 | Vector16 | Vector32) => {
                    let width = op.operand_width(Vector8);
                    let count = self.read_uint(bytecode, width)? as usize;
                    let mut distances: SmallVec<[u64; 8]> = SmallVec::new();
                    for _ in 0..count {
                        distances.push(self.read_uint(bytecode, width)?);
                    }
                    let mut elements: Vec<ObjectRef> = Vec::with_capacity(count);
                    for distance in distances {
                        let value = self.read_slot(distance)?;
                        elements.push(self.alloc(value)?);
                    }
                    let backing = self.alloc(Object::InternalVector(elements))?;
                    self.push(Object::Vector { backing, offset: 0 });
                }

                op @ (MakeVector8 | MakeVector16 | MakeVector32) => {
                    let width = op.operand_width(MakeVector8);
                    let length = self.read_uint(bytecode, width)?;
                    let fill = self.read_uint(bytecode, width)?;
                    let length = self.integer_of(&self.read_slot(length)?)?;
                    if length < 0 {
                        return Err(VmError::OutOfBounds {
                            index: length,
                            length: 0,
                        });
                    }
                    let fill = self.read_slot(fill)?;
                    // All slots share one fill object, like a pointer copy.
                    let fill = self.alloc(fill)?;
                    let backing =
                        self.alloc(Object::InternalVector(vec![fill; length as usize]))?;
                    self.push(Object::Vector { backing, offset: 0 });
                }

                op @ (GetVecElt8 | GetVecElt16 | GetVecElt32) => {
                    let width = op.operand_width(GetVecElt8);
                    let vector = self.read_uint(bytecode, width)?;
                    let index = self.read_uint(bytecode, width)?;
                    let vector = self.read_slot(vector)?;
                    let index = self.integer_of(&self.read_slot(index)?)?;
                    let element = self.vector_element(&vector, index)?;
                    self.push(self.heap.get(element).clone());
                }

                op @ (SetVecElt8 | SetVecElt16 | SetVecElt32) => {
                    let width = op.operand_width(SetVecElt8);
                    let vector = self.read_uint(bytecode, width)?;
                    let index = self.read_uint(bytecode, width)?;
                    let source = self.read_uint(bytecode, width)?;
                    let container = self.read_slot(vector)?;
                    let index = self.integer_of(&self.read_slot(index)?)?;
                    let value = self.read_slot(source)?;

                    // Bounds check against the current backing before the
                    // store.
                    self.vector_element(&container, index)?;
                    let reference = self.alloc(value)?;
                    let Object::Vector { backing, offset } = container else {
                        unreachable!("vector_element checked the variant");
                    };
                    match self.heap.get_mut(backing) {
                        Object::InternalVector(elements) => {
                            elements[offset + index as usize] = reference;
                        }
                        _ => {
                            return Err(VmError::TypeMismatch {
                                expected: "vector",
                                found: "corrupt backing",
                            });
                        }
                    }
                    self.push(Object::Vector { backing, offset });
                }

                op @ (MakeString8 | MakeString16 | MakeString32) => {
                    let width = op.operand_width(MakeString8);
                    let distance = self.read_uint(bytecode, width)?;
                    let source = self.read_slot(distance)?;
                    let bytes = self.bytes_for_make_string(&source)?;
                    let length = bytes.len();
                    let backing = self.alloc(Object::InternalString(bytes))?;
                    self.push(Object::Str {
                        backing,
                        offset: 0,
                        length,
                    });
                }

                op @ (Concatenate8 | Concatenate16 | Concatenate32) => {
                    let width = op.operand_width(Concatenate8);
                    let a = self.read_uint(bytecode, width)?;
                    let b = self.read_uint(bytecode, width)?;
                    let lhs = self.read_slot(a)?;
                    let rhs = self.read_slot(b)?;
                    let mut joined = self.string_bytes(&lhs)?.to_vec();
                    joined.extend_from_slice(self.string_bytes(&rhs)?);
                    let length = joined.len();
                    let backing = self.alloc(Object::InternalString(joined))?;
                    self.push(Object::Str {
                        backing,
                        offset: 0,
                        length,
                    });
                }

                op @ (Substring8 | Substring16 | Substring32) => {
                    let width = op.operand_width(Substring8);
                    let string = self.read_uint(bytecode, width)?;
                    let start = self.read_uint(bytecode, width)?;
                    let end = self.read_uint(bytecode, width)?;
                    let string = self.read_slot(string)?;
                    let start = self.integer_of(&self.read_slot(start)?)?;
                    let end = self.integer_of(&self.read_slot(end)?)?;
                    let Object::Str {
                        backing,
                        offset,
                        length,
                    } = string
                    else {
                        return Err(VmError::TypeMismatch {
                            expected: "string",
                            found: string.kind_name(),
                        });
                    };
                    if start < 0 || end < start || end as usize > length {
                        return Err(VmError::OutOfBounds {
                            index: if start < 0 { start } else { end },
                            length,
                        });
                    }
                    self.push(Object::Str {
                        backing,
                        offset: offset + start as usize,
                        length: (end - start) as usize,
                    });
                }

                op @ (Length8 | Length16 | Length32) => {
                    let width = op.operand_width(Length8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    let length = match &value {
                        Object::Str { length, .. } => *length,
                        Object::Vector { backing, offset } => match self.heap.get(*backing) {
                            Object::InternalVector(elements) => elements.len() - offset,
                            _ => {
                                return Err(VmError::TypeMismatch {
                                    expected: "vector",
                                    found: "corrupt backing",
                                });
                            }
                        },
                        Object::Nil | Object::List(_) => self.list_length(&value)?,
                        other => {
                            return Err(VmError::TypeMismatch {
                                expected: "string, vector or list",
                                found: other.kind_name(),
                            });
                        }
                    };
                    self.push(Object::Integer(length as i64));
                }

                op @ (SymbolString8 | SymbolString16 | SymbolString32) => {
                    let width = op.operand_width(SymbolString8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    let Object::Symbol { name, .. } = value else {
                        return Err(VmError::TypeMismatch {
                            expected: "symbol",
                            found: value.kind_name(),
                        });
                    };
                    let length = match self.heap.get(name) {
                        Object::InternalString(bytes) => bytes.len(),
                        _ => return Err(VmError::CorruptUpvalue),
                    };
                    self.push(Object::Str {
                        backing: name,
                        offset: 0,
                        length,
                    });
                }

                op @ (SymbolId8 | SymbolId16 | SymbolId32) => {
                    let width = op.operand_width(SymbolId8);
                    let distance = self.read_uint(bytecode, width)?;
                    let value = self.read_slot(distance)?;
                    let Object::Symbol { id, .. } = value else {
                        return Err(VmError::TypeMismatch {
                            expected: "symbol",
                            found: value.kind_name(),
                        });
                    };
                    self.push(Object::Integer(id as i64));
                }

                op @ (Pop8 | Pop16 | Pop32) => {
                    let width = op.operand_width(Pop8);
                    let count = self.read_uint(bytecode, width)? as usize;
                    self.pop_many(count)?;
                }

                Return0 => {
                    if let Some(result) = self.do_return(0)? {
                        return Ok(result);
                    }
                }

                op @ (Return8 | Return16 | Return32) => {
                    let width = op.operand_width(Return8);
                    let pops = self.read_uint(bytecode, width)? as usize;
                    if let Some(result) = self.do_return(pops)? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    fn vector_element(&self, vector: &Object, index: i64) -> Result<ObjectRef, VmError> {
        let Object::Vector { backing, offset } = vector else {
            return Err(VmError::TypeMismatch {
                expected: "vector",
                found: vector.kind_name(),
            });
        };
        let elements = match self.heap.get(*backing) {
            Object::InternalVector(elements) => elements,
            _ => {
                return Err(VmError::TypeMismatch {
                    expected: "vector",
                    found: "corrupt backing",
                });
            }
        };
        let available = elements.len() - offset;
        if index < 0 || index as usize >= available {
            return Err(VmError::OutOfBounds {
                index,
                length: available,
            });
        }
        Ok(elements[offset + index as usize])
    }

    /// `makeString` accepts a string (copied), or a list or vector of
    /// byte-sized integers.
    fn bytes_for_make_string(&self, source: &Object) -> Result<Vec<u8>, VmError> {
        fn byte_of(value: i64) -> Result<u8, VmError> {
            u8::try_from(value).map_err(|_| VmError::OutOfBounds {
                index: value,
                length: 256,
            })
        }

        match source {
            Object::Str { .. } => Ok(self.string_bytes(source)?.to_vec()),
            Object::Nil | Object::List(None) => Ok(Vec::new()),
            Object::List(Some(_)) => {
                let mut bytes = Vec::new();
                let mut cursor = source.clone();
                while let Object::List(Some(cell)) = cursor {
                    let (car, cdr) = match self.heap.get(cell) {
                        Object::Cons { car, cdr } => (*car, *cdr),
                        _ => {
                            return Err(VmError::TypeMismatch {
                                expected: "cons",
                                found: "corrupt list",
                            });
                        }
                    };
                    bytes.push(byte_of(self.integer_of(self.heap.get(car))?)?);
                    cursor = self.heap.get(cdr).clone();
                }
                Ok(bytes)
            }
            Object::Vector { backing, offset } => {
                let elements = match self.heap.get(*backing) {
                    Object::InternalVector(elements) => elements,
                    _ => {
                        return Err(VmError::TypeMismatch {
                            expected: "vector",
                            found: "corrupt backing",
                        });
                    }
                };
                let mut bytes = Vec::with_capacity(elements.len() - offset);
                for element in &elements[*offset..] {
                    bytes.push(byte_of(self.integer_of(self.heap.get(*element))?)?);
                }
                Ok(bytes)
            }
            other => Err(VmError::TypeMismatch {
                expected: "string, list or vector",
                found: other.kind_name(),
            }),
        }
    }
}
