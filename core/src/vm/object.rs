//! The tagged runtime object model.
//!
//! Stack slots hold [`Object`] values directly; anything with identity or
//! shared mutable state lives on the heap behind an [`ObjectRef`]. A
//! string on the stack is a cheap immutable window over a heap
//! `InternalString`; a vector is a window over a mutable
//! `InternalVector`; a list value points at a heap cons cell (or at
//! nothing, for the empty list); a composite points at its heap record so
//! that two copies of the same composite observe each other's mutations.
//!
//! The `Internal*` variants, `Cons`, `Upvalue` and `UpvalueArray` only
//! ever appear on the heap, never in a stack slot.

use alloc::rc::Rc;
use core::any::Any;
use core::cell::RefCell;
use core::fmt;

use crate::{Box, Vec};

/// Stable handle to a heap object. Object identity is identity of the
/// handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectRef(pub(crate) u32);

/// Marker callback for user objects: must invoke the sink for every
/// interior reference so the collector can trace through host data.
pub type UserMarker = fn(&dyn Any, &mut dyn FnMut(ObjectRef));

/// Destructor callback, run when the collector frees the object.
pub type UserDestructor = fn(&mut dyn Any);

/// Host-defined payload carried by a `User` object.
pub struct UserData {
    pub data: RefCell<Box<dyn Any>>,
    pub destructor: Option<UserDestructor>,
    pub marker: Option<UserMarker>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("destructor", &self.destructor.is_some())
            .field("marker", &self.marker.is_some())
            .finish()
    }
}

/// State of an upvalue cell.
///
/// A cell starts out aliasing a stack slot. When the frame that owns the
/// slot is torn down, the value is copied to the heap and the cell is
/// rewritten to point at it; that transition never reverses. A cell may
/// also forward to another cell, which happens when a nested closure
/// captures a parent capture that is still open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpvalueState {
    /// Aliases `stack[i]`; reads and writes go through the slot.
    StackIndex(usize),
    /// Closed; the value lives on the heap.
    HeapObject(ObjectRef),
    /// Forwards to another cell, followed transitively at dereference.
    HeapUpvalue(ObjectRef),
}

/// A VM object.
#[derive(Clone, Debug)]
pub enum Object {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    /// Interned symbol; `name` points at the interned `InternalString`.
    /// Equal names within one VM share one id and one name ref.
    Symbol { id: u64, name: ObjectRef },
    /// Immutable window over an `InternalString`.
    /// Invariant: `offset + length <= backing.len()`.
    Str {
        backing: ObjectRef,
        offset: usize,
        length: usize,
    },
    /// A list value: a cons cell, or nothing for the empty list.
    List(Option<ObjectRef>),
    /// Heap cons cell.
    Cons { car: ObjectRef, cdr: ObjectRef },
    /// Window over a mutable `InternalVector`.
    /// Invariant: `offset <= backing.len()`.
    Vector { backing: ObjectRef, offset: usize },
    /// First-class function: entry address plus captured environment.
    /// `upvalues` points at an `UpvalueArray`.
    Closure {
        name: u64,
        address: u32,
        arity: u8,
        variadic: bool,
        upvalues: ObjectRef,
    },
    Upvalue(UpvalueState),
    /// User-defined tagged record; points at an `InternalComposite`.
    Composite(ObjectRef),
    /// Unique type tag minted by `makeType`.
    Type(u64),
    /// Host object with optional tracing and finalization hooks.
    User(Rc<UserData>),

    // Heap-internal variants.
    InternalString(Vec<u8>),
    InternalVector(Vec<ObjectRef>),
    InternalComposite {
        type_id: u64,
        value: ObjectRef,
        function: ObjectRef,
    },
    UpvalueArray(Vec<ObjectRef>),
}

// Builtin type codes returned by `typeof`. User types minted by
// `makeType` start at FIRST_USER_TYPE.
pub const TYPE_NIL: u64 = 0;
pub const TYPE_BOOL: u64 = 1;
pub const TYPE_INTEGER: u64 = 2;
pub const TYPE_FLOAT: u64 = 3;
pub const TYPE_STRING: u64 = 4;
pub const TYPE_SYMBOL: u64 = 5;
pub const TYPE_LIST: u64 = 6;
pub const TYPE_CLOSURE: u64 = 7;
pub const TYPE_VECTOR: u64 = 8;
pub const TYPE_TYPE: u64 = 9;
pub const TYPE_USER: u64 = 10;
pub const FIRST_USER_TYPE: u64 = 32;

impl Object {
    /// Variant name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Nil => "nil",
            Object::Bool(_) => "bool",
            Object::Integer(_) => "integer",
            Object::Float(_) => "float",
            Object::Symbol { .. } => "symbol",
            Object::Str { .. } => "string",
            Object::List(_) => "list",
            Object::Cons { .. } => "cons",
            Object::Vector { .. } => "vector",
            Object::Closure { .. } => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Composite(_) => "composite",
            Object::Type(_) => "type",
            Object::User(_) => "user",
            Object::InternalString(_) => "internal-string",
            Object::InternalVector(_) => "internal-vector",
            Object::InternalComposite { .. } => "internal-composite",
            Object::UpvalueArray(_) => "upvalue-array",
        }
    }

    /// Everything is truthy except false, nil and the empty list, and the
    /// integer zero.
    pub fn is_truthy(&self) -> bool {
        !matches!(
            self,
            Object::Bool(false) | Object::Nil | Object::List(None) | Object::Integer(0)
        )
    }

    /// True for nil and the empty list.
    pub fn is_null(&self) -> bool {
        matches!(self, Object::Nil | Object::List(None))
    }

    /// Invoke `sink` for every heap reference held by this object.
    ///
    /// This is the collector's edge enumeration; every variant that can
    /// reach the heap must be covered here.
    pub(crate) fn for_each_child(&self, sink: &mut dyn FnMut(ObjectRef)) {
        match self {
            Object::Nil
            | Object::Bool(_)
            | Object::Integer(_)
            | Object::Float(_)
            | Object::Type(_)
            | Object::List(None)
            | Object::Upvalue(UpvalueState::StackIndex(_))
            | Object::InternalString(_) => {}
            Object::Symbol { name, .. } => sink(*name),
            Object::Str { backing, .. } => sink(*backing),
            Object::List(Some(cell)) => sink(*cell),
            Object::Cons { car, cdr } => {
                sink(*car);
                sink(*cdr);
            }
            Object::Vector { backing, .. } => sink(*backing),
            Object::Closure { upvalues, .. } => sink(*upvalues),
            Object::Upvalue(UpvalueState::HeapObject(target))
            | Object::Upvalue(UpvalueState::HeapUpvalue(target)) => sink(*target),
            Object::Composite(record) => sink(*record),
            Object::User(user) => {
                if let Some(marker) = user.marker {
                    marker(&**user.data.borrow(), sink);
                }
            }
            Object::InternalVector(elements) | Object::UpvalueArray(elements) => {
                for element in elements {
                    sink(*element);
                }
            }
            Object::InternalComposite {
                value, function, ..
            } => {
                sink(*value);
                sink(*function);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec;

    #[test]
    fn test_truthiness() {
        assert!(!Object::Bool(false).is_truthy());
        assert!(!Object::Nil.is_truthy());
        assert!(!Object::List(None).is_truthy());
        assert!(!Object::Integer(0).is_truthy());
        assert!(Object::Bool(true).is_truthy());
        assert!(Object::Integer(-1).is_truthy());
        assert!(Object::Float(0.0).is_truthy());
    }

    #[test]
    fn test_child_enumeration() {
        let mut children = vec![];
        Object::Cons {
            car: ObjectRef(3),
            cdr: ObjectRef(7),
        }
        .for_each_child(&mut |child| children.push(child));
        assert_eq!(children, vec![ObjectRef(3), ObjectRef(7)]);

        children.clear();
        Object::Integer(5).for_each_child(&mut |child| children.push(child));
        assert!(children.is_empty());

        children.clear();
        Object::Upvalue(UpvalueState::StackIndex(4)).for_each_child(&mut |c| children.push(c));
        assert!(children.is_empty());

        children.clear();
        Object::Upvalue(UpvalueState::HeapObject(ObjectRef(1)))
            .for_each_child(&mut |c| children.push(c));
        assert_eq!(children, vec![ObjectRef(1)]);
    }
}
