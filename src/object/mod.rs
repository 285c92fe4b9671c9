use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use ordered_float::OrderedFloat;

use crate::ast::Statement;
use crate::error::{ErrorKind, Exception};
use crate::scheduler::TaskRef;
use crate::token::{format_float, Span};

pub use crate::object::builtins::BuiltIn;
pub use crate::object::environment::Env;

pub mod builtins;
pub mod environment;

pub type EvalResult = std::result::Result<Value, Exception>;

/// A runtime value. Lists, dicts, and sets are reference-shared: cloning a
/// `Value` clones the handle, and mutation through any alias is visible
/// through all of them.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<IndexMap<Key, Value>>>),
    Set(Rc<RefCell<IndexSet<Key>>>),
    Tuple(Rc<Vec<Value>>),
    Function(Rc<Function>),
    BuiltIn(&'static BuiltIn),
    Task(TaskRef),
    Error(Rc<Exception>),
    File(Rc<RefCell<FileHandle>>),
}

/// A user-defined function closing over its defining frame.
pub struct Function {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Rc<Vec<Statement>>,
    pub env: Env,
    pub is_async: bool,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Deliberately shallow: the captured env can reach this function.
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}

/// Dict and set keys: strings, numbers, and booleans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i64),
    Float(OrderedFloat<f64>),
    Bool(bool),
    Str(Rc<str>),
}

impl Key {
    pub fn from_value(value: &Value, span: Span) -> Result<Key, Exception> {
        match value {
            Value::Integer(v) => Ok(Key::Int(*v)),
            Value::Float(v) => Ok(Key::Float(OrderedFloat(*v))),
            Value::Boolean(b) => Ok(Key::Bool(*b)),
            Value::Str(s) => Ok(Key::Str(Rc::clone(s))),
            other => Err(Exception::new(
                ErrorKind::Type,
                format!("'{}' is not usable as a dict or set key", other.type_name()),
                span,
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(v) => Value::Integer(*v),
            Key::Float(v) => Value::Float(v.0),
            Key::Bool(b) => Value::Boolean(*b),
            Key::Str(s) => Value::Str(Rc::clone(s)),
        }
    }
}

/// An open file; `close` drops the underlying handle but keeps the value
/// printable.
#[derive(Debug)]
pub struct FileHandle {
    pub path: String,
    pub file: Option<fs::File>,
    pub writable: bool,
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::from(s.into().into_boxed_str()))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::Boolean(_) => "bool",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Function(_) => "function",
            Value::BuiltIn(_) => "builtin",
            Value::Task(_) => "task",
            Value::Error(_) => "error",
            Value::File(_) => "file",
        }
    }

    /// Object identity for `is`: value equality for primitives, pointer
    /// equality for shared heap values.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::BuiltIn(a), Value::BuiltIn(b)) => std::ptr::eq(*a, *b),
            (Value::Task(a), Value::Task(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The quoted form used inside containers, mirroring the language's own
    /// literal syntax.
    fn repr(&self) -> String {
        match self {
            Value::Str(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        other => out.push(other),
                    }
                }
                out.push('\'');
                out
            }
            other => other.to_string(),
        }
    }
}

/// Ordering for `<`/`>` and for `sorted`: numbers compare numerically,
/// strings lexicographically, everything else is unordered.
pub fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl PartialEq for Value {
    /// Structural equality for `==`: primitives by value (ints and floats
    /// compare numerically), containers element-wise, everything else by
    /// identity.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => {
                a.kind == b.kind && a.message == b.message
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::BuiltIn(a), Value::BuiltIn(b)) => std::ptr::eq(*a, *b),
            (Value::Task(a), Value::Task(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(values) => {
                write!(f, "[")?;
                for (i, v) in values.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v.repr())?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.to_value().repr(), v.repr())?;
                }
                write!(f, "}}")
            }
            Value::Set(entries) => {
                let entries = entries.borrow();
                if entries.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, k) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k.to_value().repr())?;
                }
                write!(f, "}}")
            }
            Value::Tuple(values) => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v.repr())?;
                }
                if values.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Function(func) => {
                if func.is_async {
                    write!(f, "<async function {}>", func.name)
                } else {
                    write!(f, "<function {}>", func.name)
                }
            }
            Value::BuiltIn(builtin) => write!(f, "<built-in function {}>", builtin.name),
            Value::Task(_) => write!(f, "<task>"),
            Value::Error(e) => write!(f, "{}", e.message),
            Value::File(handle) => write!(f, "<file '{}'>", handle.borrow().path),
        }
    }
}
