//! Host-facing ABI.
//!
//! A callback registered with [`Vm::register_callback`] is invoked by the
//! `ccall` opcode with the VM itself as its only argument. It interacts
//! with the machine exclusively through the methods here (plus
//! `push`/`pop`/`peek` on [`Vm`]), and must leave the stack exactly one
//! object taller than it found it.
//!
//! Object values handed out by `alloc_*` contain raw heap references. A
//! host that keeps one across a collection must pin it first; the only
//! alternative is to re-fetch it through a root-anchored reference after
//! the collection.

use core::any::Any;

use crate::{Box, String, Vec};

use super::{
    error::VmError,
    object::{Object, UserData, UserDestructor, UserMarker},
    runtime::{HostCallback, Vm},
};

impl Vm {
    /// Register a host function; returns the index `ccall` uses to name
    /// it. Indices are assigned in registration order, so the generator
    /// layer and the VM must agree on bind order.
    pub fn register_callback(
        &mut self,
        callback: impl Fn(&mut Vm) -> Result<(), VmError> + 'static,
    ) -> usize {
        let index = self.callbacks.len();
        let callback: HostCallback = alloc::rc::Rc::new(callback);
        self.callbacks.push(callback);
        index
    }

    /// Build an error value for a callback to return.
    pub fn error(&self, message: impl Into<String>) -> VmError {
        VmError::UserError {
            message: message.into(),
        }
    }

    /// Allocate a string object over a fresh backing buffer.
    pub fn alloc_string(&mut self, bytes: &[u8]) -> Result<Object, VmError> {
        let length = bytes.len();
        let backing = self.alloc(Object::InternalString(bytes.to_vec()))?;
        Ok(Object::Str {
            backing,
            offset: 0,
            length,
        })
    }

    /// Intern `name` and return the symbol for it. Repeated calls with
    /// the same name yield the same id.
    pub fn alloc_symbol(&mut self, name: &[u8]) -> Result<Object, VmError> {
        let key: ecow::EcoVec<u8> = name.iter().copied().collect();
        let id = match self.symbol_ids.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.next_symbol_id;
                self.next_symbol_id += 1;
                id
            }
        };
        let name = self.intern_symbol(id, name)?;
        Ok(Object::Symbol { id, name })
    }

    /// Allocate a cons cell and return the list value pointing at it.
    pub fn alloc_cons(&mut self, car: Object, cdr: Object) -> Result<Object, VmError> {
        let car = self.alloc(car)?;
        let cdr = self.alloc(cdr)?;
        let cell = self.alloc(Object::Cons { car, cdr })?;
        Ok(Object::List(Some(cell)))
    }

    /// Allocate a vector holding `elements`.
    pub fn alloc_vector(&mut self, elements: Vec<Object>) -> Result<Object, VmError> {
        let mut references = Vec::with_capacity(elements.len());
        for element in elements {
            references.push(self.alloc(element)?);
        }
        let backing = self.alloc(Object::InternalVector(references))?;
        Ok(Object::Vector { backing, offset: 0 })
    }

    /// Wrap host data in a user object. The marker must report every
    /// interior object reference; the destructor runs when the collector
    /// frees the object.
    pub fn alloc_user(
        &mut self,
        data: Box<dyn Any>,
        marker: Option<UserMarker>,
        destructor: Option<UserDestructor>,
    ) -> Object {
        Object::User(alloc::rc::Rc::new(UserData {
            data: core::cell::RefCell::new(data),
            destructor,
            marker,
        }))
    }

    /// Mint a fresh unique type tag, as the `makeType` opcode does.
    pub fn make_type(&mut self) -> Object {
        let id = self.next_type_id;
        self.next_type_id += 1;
        Object::Type(id)
    }

    /// Root `object` against collection until the returned handle is
    /// passed to [`Vm::gc_unpin`].
    pub fn gc_pin(&mut self, object: Object) -> usize {
        let handle = self.pins.len();
        self.pins.push(object);
        handle
    }

    /// Release a pin taken with [`Vm::gc_pin`].
    pub fn gc_unpin(&mut self, handle: usize) {
        if let Some(slot) = self.pins.get_mut(handle) {
            *slot = Object::Nil;
        }
    }

    /// Bind a value into the global table, as `setStatic` does from
    /// bytecode. Useful for making host objects reachable by key.
    pub fn set_global(&mut self, key: i64, value: Object) {
        self.globals.insert(key, value);
    }

    /// Read a value from the global table.
    pub fn global(&self, key: i64) -> Option<&Object> {
        self.globals.get(&key)
    }
}
