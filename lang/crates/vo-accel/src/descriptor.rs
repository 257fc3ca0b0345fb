//! Managed method identity, method descriptors and calling conventions.
//!
//! Method descriptors use the classfile form: `(I[BLjava/lang/Object;S)V`.
//! A calling convention is the tag list an entry declares; it must agree with
//! the descriptor of the method it replaces, with an optional leading
//! implicit receiver.

use std::fmt;

use crate::abi::tag;

// ==================== MethodId ====================

/// Declaring class + method name + descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodId {
    pub fn new(class: impl Into<String>, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}{}", self.class, self.name, self.descriptor)
    }
}

// ==================== Kinds ====================

/// Primitive element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl ElemKind {
    pub const ALL: [ElemKind; 8] = [
        ElemKind::Boolean,
        ElemKind::Byte,
        ElemKind::Char,
        ElemKind::Short,
        ElemKind::Int,
        ElemKind::Long,
        ElemKind::Float,
        ElemKind::Double,
    ];

    pub fn tag(self) -> u8 {
        match self {
            ElemKind::Boolean => tag::BOOLEAN,
            ElemKind::Byte => tag::BYTE,
            ElemKind::Char => tag::CHAR,
            ElemKind::Short => tag::SHORT,
            ElemKind::Int => tag::INT,
            ElemKind::Long => tag::LONG,
            ElemKind::Float => tag::FLOAT,
            ElemKind::Double => tag::DOUBLE,
        }
    }

    pub fn from_tag(t: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == t)
    }

    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            ElemKind::Boolean | ElemKind::Byte => 1,
            ElemKind::Char | ElemKind::Short => 2,
            ElemKind::Int | ElemKind::Float => 4,
            ElemKind::Long | ElemKind::Double => 8,
        }
    }

    fn from_descriptor_char(c: u8) -> Option<Self> {
        Some(match c {
            b'Z' => ElemKind::Boolean,
            b'B' => ElemKind::Byte,
            b'C' => ElemKind::Char,
            b'S' => ElemKind::Short,
            b'I' => ElemKind::Int,
            b'J' => ElemKind::Long,
            b'F' => ElemKind::Float,
            b'D' => ElemKind::Double,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ElemKind::Boolean => "boolean",
            ElemKind::Byte => "byte",
            ElemKind::Char => "char",
            ElemKind::Short => "short",
            ElemKind::Int => "int",
            ElemKind::Long => "long",
            ElemKind::Float => "float",
            ElemKind::Double => "double",
        }
    }
}

/// Kind of one native parameter or return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Void,
    Prim(ElemKind),
    ObjectRef,
    Array(ElemKind),
    ImplicitReceiver,
}

impl ParamKind {
    pub fn tag(self) -> u8 {
        match self {
            ParamKind::Void => tag::VOID,
            ParamKind::Prim(k) => k.tag(),
            ParamKind::ObjectRef => tag::OBJECT_REF,
            ParamKind::Array(k) => tag::ARRAY | k.tag(),
            ParamKind::ImplicitReceiver => tag::IMPLICIT_RECEIVER,
        }
    }

    pub fn from_tag(t: u8) -> Option<Self> {
        match t {
            tag::VOID => Some(ParamKind::Void),
            tag::OBJECT_REF => Some(ParamKind::ObjectRef),
            tag::IMPLICIT_RECEIVER => Some(ParamKind::ImplicitReceiver),
            t if t & tag::ARRAY != 0 => ElemKind::from_tag(t & !tag::ARRAY).map(ParamKind::Array),
            t => ElemKind::from_tag(t).map(ParamKind::Prim),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Void => f.write_str("void"),
            ParamKind::Prim(k) => f.write_str(k.name()),
            ParamKind::ObjectRef => f.write_str("object"),
            ParamKind::Array(k) => write!(f, "{}[]", k.name()),
            ParamKind::ImplicitReceiver => f.write_str("receiver"),
        }
    }
}

// ==================== MethodDescriptor ====================

/// Parsed method descriptor.
///
/// Reference types (classes and reference arrays) are `ObjectRef`; only
/// one-dimensional primitive arrays are `Array`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<ParamKind>,
    pub ret: ParamKind,
}

impl MethodDescriptor {
    pub fn parse(text: &str) -> Result<Self, String> {
        let bytes = text.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(format!("descriptor `{}` must start with `(`", text));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        loop {
            match bytes.get(pos) {
                Some(b')') => {
                    pos += 1;
                    break;
                }
                Some(_) => {
                    let (kind, next) = parse_field(bytes, pos)
                        .map_err(|reason| format!("malformed parameter at offset {} in `{}`: {}", pos, text, reason))?;
                    params.push(kind);
                    pos = next;
                }
                None => return Err(format!("unterminated parameter list in `{}`", text)),
            }
        }
        let ret = if bytes.get(pos) == Some(&b'V') && pos + 1 == bytes.len() {
            ParamKind::Void
        } else {
            match parse_field(bytes, pos) {
                Ok((kind, end)) if end == bytes.len() => kind,
                Ok(_) => return Err(format!("malformed return type in `{}`: trailing characters", text)),
                Err(reason) => return Err(format!("malformed return type in `{}`: {}", text, reason)),
            }
        };
        Ok(Self { params, ret })
    }
}

/// Array types may have at most this many dimensions.
pub const MAX_ARRAY_DIMENSIONS: usize = 255;

fn parse_field(bytes: &[u8], pos: usize) -> Result<(ParamKind, usize), &'static str> {
    let dims = bytes[pos..].iter().take_while(|&&b| b == b'[').count();
    if dims > MAX_ARRAY_DIMENSIONS {
        return Err("more than 255 array dimensions");
    }
    let at = pos + dims;
    let c = *bytes.get(at).ok_or("missing type")?;
    let (elem, end) = match c {
        b'L' => {
            let len = bytes[at + 1..]
                .iter()
                .position(|&b| b == b';')
                .ok_or("unterminated class name")?;
            if len == 0 {
                return Err("empty class name");
            }
            (None, at + len + 2)
        }
        _ => (Some(ElemKind::from_descriptor_char(c).ok_or("unknown type")?), at + 1),
    };
    let kind = match (dims, elem) {
        (0, Some(k)) => ParamKind::Prim(k),
        (1, Some(k)) => ParamKind::Array(k),
        // Reference arrays and nested arrays are passed as plain references.
        _ => ParamKind::ObjectRef,
    };
    Ok((kind, end))
}

// ==================== CallingConvention ====================

/// Native signature declared by an export entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    receiver: bool,
    params: Vec<ParamKind>,
    ret: ParamKind,
}

impl CallingConvention {
    /// Decode tags: parameters in native order, then exactly one return tag.
    pub fn from_tags(tags: &[u8]) -> Result<Self, String> {
        let (&ret_tag, param_tags) = tags
            .split_last()
            .ok_or_else(|| "empty calling convention".to_string())?;
        let ret = ParamKind::from_tag(ret_tag).ok_or_else(|| format!("unknown tag {:#x}", ret_tag))?;
        if ret == ParamKind::ImplicitReceiver {
            return Err("implicit receiver in return position".to_string());
        }

        let mut receiver = false;
        let mut params = Vec::with_capacity(param_tags.len());
        for (i, &t) in param_tags.iter().enumerate() {
            match ParamKind::from_tag(t) {
                None => return Err(format!("unknown tag {:#x} at position {}", t, i)),
                Some(ParamKind::Void) => return Err(format!("void in parameter position {}", i)),
                Some(ParamKind::ImplicitReceiver) if i == 0 => receiver = true,
                Some(ParamKind::ImplicitReceiver) => {
                    return Err(format!("implicit receiver at position {}, must be first", i));
                }
                Some(kind) => params.push(kind),
            }
        }
        Ok(Self { receiver, params, ret })
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver
    }

    /// Declared parameters, receiver excluded.
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn ret(&self) -> ParamKind {
        self.ret
    }

    /// Native parameter kinds in call order, receiver included.
    pub fn native_params(&self) -> impl Iterator<Item = ParamKind> + '_ {
        self.receiver
            .then_some(ParamKind::ImplicitReceiver)
            .into_iter()
            .chain(self.params.iter().copied())
    }

    /// Number of managed arguments a call supplies, receiver included.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.receiver)
    }

    /// Check arity and kind order against the replaced method's descriptor.
    pub fn check(&self, descriptor: &MethodDescriptor) -> Result<(), String> {
        if self.params.len() != descriptor.params.len() {
            return Err(format!(
                "declares {} parameters, method has {}",
                self.params.len(),
                descriptor.params.len()
            ));
        }
        for (i, (declared, actual)) in self.params.iter().zip(&descriptor.params).enumerate() {
            if declared != actual {
                return Err(format!("parameter {} is {}, method has {}", i, declared, actual));
            }
        }
        if self.ret != descriptor.ret {
            return Err(format!("returns {}, method returns {}", self.ret, descriptor.ret));
        }
        Ok(())
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, kind) in self.native_params().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", kind)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
