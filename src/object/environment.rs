use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::object::Value;

/// One lexical frame: a name→value map plus a parent pointer. Cloning an
/// `Env` clones the handle, so closures share their defining frame.
///
/// Only function calls and module evaluation create frames; blocks and
/// loops assign into the frame they run in.
#[derive(Clone, Debug)]
pub struct Env(Rc<RefCell<Frame>>);

#[derive(Debug)]
struct Frame {
    store: HashMap<String, Value>,
    parent: Option<Env>,
    is_global: bool,
}

impl Env {
    /// The top-level frame of an interpreter or module.
    pub fn global() -> Env {
        Env(Rc::new(RefCell::new(Frame {
            store: HashMap::new(),
            parent: None,
            is_global: true,
        })))
    }

    /// A child frame for a function call, parented to the function's
    /// defining frame rather than the caller's.
    pub fn extend(parent: &Env) -> Env {
        Env(Rc::new(RefCell::new(Frame {
            store: HashMap::new(),
            parent: Some(parent.clone()),
            is_global: false,
        })))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let frame = self.0.borrow();
        match frame.store.get(name) {
            Some(value) => Some(value.clone()),
            None => frame.parent.as_ref().and_then(|parent| parent.get(name)),
        }
    }

    /// Binds in this frame unconditionally (parameters, builtins, imports).
    pub fn set_local(&self, name: &str, value: Value) {
        self.0.borrow_mut().store.insert(name.to_string(), value);
    }

    /// The assignment rule: mutate the binding in the nearest enclosing
    /// non-global frame that has one, otherwise create it here (the current
    /// function frame, or globals when executing at top level).
    pub fn assign(&self, name: &str, value: Value) {
        let mut cursor = self.clone();
        loop {
            let next = {
                let frame = cursor.0.borrow();
                if frame.is_global {
                    break;
                }
                if frame.store.contains_key(name) {
                    drop(frame);
                    cursor.set_local(name, value);
                    return;
                }
                frame.parent.clone()
            };
            match next {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        self.set_local(name, value);
    }

    pub fn is_global(&self) -> bool {
        self.0.borrow().is_global
    }

    /// The names bound directly in this frame, in no particular order.
    /// Used to copy a module's top level into the importing scope.
    pub fn local_names(&self) -> Vec<String> {
        self.0.borrow().store.keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
