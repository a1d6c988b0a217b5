//! HAL scalar types and entity enums.
//!
//! This module defines the data contract shared by every HAL entity:
//! - `HalType` - Supported scalar types (bit, float, s32, u32)
//! - `HalValue` - Tagged scalar value with its 64-bit storage encoding
//! - `PinDir` / `ParamDir` - Pin and parameter directions
//! - `ObjectType` - Registry type tags
//! - `CompType` / `CompState` - Component kind and lifecycle state
//! - `FunctType` - Function calling conventions
//!
//! Numeric tags match the values used in the shared segment, so
//! `from_u32` on a tag read back from memory is the only validation needed.

use std::fmt;

use crate::hal::error::{HalError, HalResult};

/// Scalar data type of pins, signals and parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HalType {
    /// Boolean with single-bit semantics
    Bit = 1,
    /// IEEE double precision float
    Float = 2,
    /// Signed 32-bit integer
    S32 = 3,
    /// Unsigned 32-bit integer
    U32 = 4,
}

impl HalType {
    /// Convert from raw tag. Returns `None` for unsupported types.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Bit),
            2 => Some(Self::Float),
            3 => Some(Self::S32),
            4 => Some(Self::U32),
            _ => None,
        }
    }

    /// Lowercase name used by the command interpreter.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::Float => "float",
            Self::S32 => "s32",
            Self::U32 => "u32",
        }
    }

    /// Parse a type name (`bit`, `float`, `s32`, `u32`).
    pub fn parse(s: &str) -> HalResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bit" => Ok(Self::Bit),
            "float" => Ok(Self::Float),
            "s32" => Ok(Self::S32),
            "u32" => Ok(Self::U32),
            _ => Err(HalError::Invalid(format!("unknown type '{s}'"))),
        }
    }

    /// Zero value of this type.
    pub const fn zero(self) -> HalValue {
        match self {
            Self::Bit => HalValue::Bit(false),
            Self::Float => HalValue::Float(0.0),
            Self::S32 => HalValue::S32(0),
            Self::U32 => HalValue::U32(0),
        }
    }
}

impl fmt::Display for HalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar value together with its type.
///
/// In the arena every value occupies one 8-byte atomic word; `to_bits`
/// and `from_bits` define that encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HalValue {
    /// Boolean value
    Bit(bool),
    /// Float value
    Float(f64),
    /// Signed 32-bit value
    S32(i32),
    /// Unsigned 32-bit value
    U32(u32),
}

impl HalValue {
    /// Type tag of this value.
    pub const fn ty(&self) -> HalType {
        match self {
            Self::Bit(_) => HalType::Bit,
            Self::Float(_) => HalType::Float,
            Self::S32(_) => HalType::S32,
            Self::U32(_) => HalType::U32,
        }
    }

    /// Encode into the 8-byte storage word.
    #[inline]
    pub fn to_bits(self) -> u64 {
        match self {
            Self::Bit(b) => b as u64,
            Self::Float(f) => f.to_bits(),
            Self::S32(v) => v as u32 as u64,
            Self::U32(v) => v as u64,
        }
    }

    /// Decode a storage word as `ty`.
    #[inline]
    pub fn from_bits(ty: HalType, bits: u64) -> Self {
        match ty {
            HalType::Bit => Self::Bit(bits & 1 != 0),
            HalType::Float => Self::Float(f64::from_bits(bits)),
            HalType::S32 => Self::S32(bits as u32 as i32),
            HalType::U32 => Self::U32(bits as u32),
        }
    }

    /// Parse text as a value of type `ty`.
    ///
    /// Bits accept `0`/`1`/`true`/`false`; integers accept a `0x` prefix.
    pub fn parse(ty: HalType, s: &str) -> HalResult<Self> {
        let s = s.trim();
        let bad = || HalError::Invalid(format!("value '{s}' is not a valid {ty}"));
        match ty {
            HalType::Bit => match s.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(Self::Bit(true)),
                "0" | "false" | "off" => Ok(Self::Bit(false)),
                _ => Err(bad()),
            },
            HalType::Float => s.parse::<f64>().map(Self::Float).map_err(|_| bad()),
            HalType::S32 => parse_int(s)
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::S32)
                .ok_or_else(bad),
            HalType::U32 => parse_int(s)
                .and_then(|v| u32::try_from(v).ok())
                .map(Self::U32)
                .ok_or_else(bad),
        }
    }

    /// Float view used by epsilon comparison and reporting.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bit(b) => b as u8 as f64,
            Self::Float(f) => f,
            Self::S32(v) => v as f64,
            Self::U32(v) => v as f64,
        }
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let v = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if neg { -v } else { v })
}

impl fmt::Display for HalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Self::Float(v) => write!(f, "{v}"),
            Self::S32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
        }
    }
}

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PinDir {
    /// Input: reads its signal
    In = 16,
    /// Output: drives its signal
    Out = 32,
    /// Bidirectional
    Io = 48,
}

impl PinDir {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            16 => Some(Self::In),
            32 => Some(Self::Out),
            48 => Some(Self::Io),
            _ => None,
        }
    }

    /// Parse `in`, `out` or `io`.
    pub fn parse(s: &str) -> HalResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "io" => Ok(Self::Io),
            _ => Err(HalError::Invalid(format!("unknown pin direction '{s}'"))),
        }
    }
}

impl fmt::Display for PinDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Io => "I/O",
        })
    }
}

/// Parameter direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ParamDir {
    /// Read-only from the outside
    Ro = 64,
    /// Read-write
    Rw = 192,
}

impl ParamDir {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            64 => Some(Self::Ro),
            192 => Some(Self::Rw),
            _ => None,
        }
    }
}

impl fmt::Display for ParamDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ro => "RO",
            Self::Rw => "RW",
        })
    }
}

/// Registry type tag carried in every object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ObjectType {
    /// Pin
    Pin = 1,
    /// Signal
    Signal = 2,
    /// Parameter
    Param = 3,
    /// Thread
    Thread = 4,
    /// Function
    Funct = 5,
    /// Component
    Component = 6,
    /// Instance
    Instance = 7,
    /// Group
    Group = 8,
    /// Group member
    Member = 9,
}

impl ObjectType {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Pin),
            2 => Some(Self::Signal),
            3 => Some(Self::Param),
            4 => Some(Self::Thread),
            5 => Some(Self::Funct),
            6 => Some(Self::Component),
            7 => Some(Self::Instance),
            8 => Some(Self::Group),
            9 => Some(Self::Member),
            _ => None,
        }
    }

    /// Lowercase name used in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pin => "pin",
            Self::Signal => "signal",
            Self::Param => "param",
            Self::Thread => "thread",
            Self::Funct => "funct",
            Self::Component => "component",
            Self::Instance => "instance",
            Self::Group => "group",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompType {
    /// Realtime component
    Realtime = 0,
    /// User-space component owned by a process
    User = 1,
    /// Remote/proxy component, bound and unbound by a peer
    Remote = 2,
    /// The bootstrap library component
    HalLib = 3,
}

impl CompType {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Realtime),
            1 => Some(Self::User),
            2 => Some(Self::Remote),
            3 => Some(Self::HalLib),
            _ => None,
        }
    }
}

impl fmt::Display for CompType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Realtime => "RT",
            Self::User => "User",
            Self::Remote => "Remote",
            Self::HalLib => "HAL",
        })
    }
}

/// Component lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompState {
    /// Still creating pins and parameters
    Initializing = 0,
    /// Remote component without a peer
    Unbound = 1,
    /// Remote component with a peer
    Bound = 2,
    /// Fully initialized
    Ready = 3,
}

impl CompState {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Initializing),
            1 => Some(Self::Unbound),
            2 => Some(Self::Bound),
            3 => Some(Self::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for CompState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Ready => "ready",
        })
    }
}

/// Function calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FunctType {
    /// Receives the thread period only
    Legacy = 0,
    /// Receives per-invocation metadata
    Thread = 1,
    /// Argument-vector callable, invoked by name, never attached to threads
    User = 2,
}

impl FunctType {
    /// Convert from raw tag.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Legacy),
            1 => Some(Self::Thread),
            2 => Some(Self::User),
            _ => None,
        }
    }
}

impl fmt::Display for FunctType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Thread => "thread",
            Self::User => "user",
        })
    }
}
