//! Managed values passed to and returned from bridged calls.

use std::fmt;

use crate::heap::ObjRef;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Object or array reference, `None` is null.
    Ref(Option<ObjRef>),
}

impl Value {
    pub const NULL: Value = Value::Ref(None);

    pub fn from_ref(obj: ObjRef) -> Self {
        Value::Ref(Some(obj))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Ref(_) => "reference",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<ObjRef> {
        match *self {
            Value::Ref(r) => r,
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Char(v) => match char::from_u32(u32::from(*v)) {
                Some(c) => write!(f, "{:?}", c),
                None => write!(f, "\\u{:04x}", v),
            },
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{:.2}f", v),
            Value::Double(v) => write!(f, "{:.2}", v),
            Value::Ref(Some(r)) => write!(f, "{}", r),
            Value::Ref(None) => f.write_str("null"),
        }
    }
}
