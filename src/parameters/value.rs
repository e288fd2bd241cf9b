//! Parameter values and type tags
//!
//! A parameter's type is fixed when it is registered. Values travel as the
//! tagged union [`ParamValue`]; typed access goes through the [`Parameter`]
//! trait, implemented for the five supported Rust types.

use alloc::string::{String as AllocString, ToString};
use bitflags::bitflags;
use core::fmt;
use heapless::String;

/// Maximum string parameter length
pub const MAX_STRING_LEN: usize = 63;

/// Bounded string parameter value
pub type ParamString = String<MAX_STRING_LEN>;

bitflags! {
    /// Parameter flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamFlags: u8 {
        /// Parameter is left out of catalogue broadcasts
        const HIDDEN = 0b00000001;
        /// Parameter cannot be modified by remote update requests
        const READ_ONLY = 0b00000010;
    }
}

/// Parameter type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamKind {
    Int,
    Float,
    Double,
    Bool,
    Str,
}

impl ParamKind {
    /// Storage discriminant used by the flash block format
    pub(crate) fn type_id(self) -> u8 {
        match self {
            ParamKind::Str => 0,
            ParamKind::Bool => 1,
            ParamKind::Int => 2,
            ParamKind::Float => 3,
            ParamKind::Double => 4,
        }
    }

    pub(crate) fn from_type_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ParamKind::Str),
            1 => Some(ParamKind::Bool),
            2 => Some(ParamKind::Int),
            3 => Some(ParamKind::Float),
            4 => Some(ParamKind::Double),
            _ => None,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Double => "double",
            ParamKind::Bool => "bool",
            ParamKind::Str => "string",
        };
        f.write_str(name)
    }
}

/// Parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// 32-bit signed integer
    Int(i32),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// Boolean
    Bool(bool),
    /// String (max 63 bytes)
    Str(ParamString),
}

impl ParamValue {
    /// Type tag of this value
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Double(_) => ParamKind::Double,
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Str(_) => ParamKind::Str,
        }
    }

    /// Text form used in catalogue broadcasts
    pub fn stringify(&self) -> AllocString {
        self.to_string()
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Double(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for bool {}
    impl Sealed for super::ParamString {}
}

/// Rust types that can back a parameter
///
/// Sealed: implemented for `i32`, `f32`, `f64`, `bool` and [`ParamString`].
pub trait Parameter: Sized + private::Sealed {
    /// Type tag for this Rust type
    const KIND: ParamKind;

    fn into_value(self) -> ParamValue;

    /// Extract a value of this type; `None` if `value` has another kind
    fn from_value(value: &ParamValue) -> Option<Self>;
}

impl Parameter for i32 {
    const KIND: ParamKind = ParamKind::Int;

    fn into_value(self) -> ParamValue {
        ParamValue::Int(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl Parameter for f32 {
    const KIND: ParamKind = ParamKind::Float;

    fn into_value(self) -> ParamValue {
        ParamValue::Float(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl Parameter for f64 {
    const KIND: ParamKind = ParamKind::Double;

    fn into_value(self) -> ParamValue {
        ParamValue::Double(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl Parameter for bool {
    const KIND: ParamKind = ParamKind::Bool;

    fn into_value(self) -> ParamValue {
        ParamValue::Bool(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl Parameter for ParamString {
    const KIND: ParamKind = ParamKind::Str;

    fn into_value(self) -> ParamValue {
        ParamValue::Str(self)
    }

    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}
