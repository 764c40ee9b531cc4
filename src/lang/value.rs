use crate::runtime::upvalue::Closure;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// Scalar types the front end can attach to a value.
///
/// These are the only types eligible for the unboxed register fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ScalarType::Bool)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An unboxed scalar, as held in a typed register shadow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
}

impl Scalar {
    pub fn ty(self) -> ScalarType {
        match self {
            Scalar::I32(_) => ScalarType::I32,
            Scalar::I64(_) => ScalarType::I64,
            Scalar::U32(_) => ScalarType::U32,
            Scalar::U64(_) => ScalarType::U64,
            Scalar::F64(_) => ScalarType::F64,
            Scalar::Bool(_) => ScalarType::Bool,
        }
    }

    /// Box the scalar into a tagged value.
    pub fn to_value(self) -> Value {
        match self {
            Scalar::I32(n) => Value::I32(n),
            Scalar::I64(n) => Value::I64(n),
            Scalar::U32(n) => Value::U32(n),
            Scalar::U64(n) => Value::U64(n),
            Scalar::F64(n) => Value::F64(n),
            Scalar::Bool(b) => Value::Bool(b),
        }
    }

    pub fn from_value(value: &Value) -> Option<Scalar> {
        match value {
            Value::I32(n) => Some(Scalar::I32(*n)),
            Value::I64(n) => Some(Scalar::I64(*n)),
            Value::U32(n) => Some(Scalar::U32(*n)),
            Value::U64(n) => Some(Scalar::U64(*n)),
            Value::F64(n) => Some(Scalar::F64(*n)),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            _ => None,
        }
    }
}

/// Error object carried by `throw` and delivered to catch registers.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Boxed runtime value held in registers.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(Rc<str>),

    /// Index into the program's function table.
    Function(u16),

    Closure(Rc<Closure>),
    Error(Rc<ErrorValue>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::Error(_) => "error",
        }
    }

    pub fn string(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn error(kind: &str, message: &str) -> Self {
        Value::Error(Rc::new(ErrorValue {
            kind: kind.to_string(),
            message: message.to_string(),
        }))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I32(n) => write!(f, "{}", n),
            Value::I64(n) => write!(f, "{}", n),
            Value::U32(n) => write!(f, "{}", n),
            Value::U64(n) => write!(f, "{}", n),
            Value::F64(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Function(index) => write!(f, "<fn #{}>", index),
            Value::Closure(c) => write!(f, "<closure #{}>", c.function),
            Value::Error(e) => write!(f, "{}", e),
        }
    }
}
