//! Encoding and decoding of primitive PLC values.
//!
//! Covers the IEC 61131 scalar types plus fixed-width `STRING`.  The
//! codec is deliberately minimal: it exists so that notification samples
//! and struct fields can be turned into typed values, not to be a general
//! pretty-printer.

use std::fmt::{self, Display};

use byteorder::{ByteOrder, LE};

use crate::errors::{Error, Result};

/// A decoded PLC value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// `BOOL`: one byte, nonzero is true.
    Bool(bool),
    /// `SINT`.
    Sint(i8),
    /// `USINT` or `BYTE`.
    Byte(u8),
    /// `INT`.
    Int(i16),
    /// `UINT` or `WORD`.
    Word(u16),
    /// `DINT`.
    Dint(i32),
    /// `UDINT` or `DWORD`.
    Dword(u32),
    /// `LINT`.
    Lint(i64),
    /// `ULINT` or `LWORD`.
    Lword(u64),
    /// `REAL`.
    Real(f32),
    /// `LREAL`.
    Lreal(f64),
    /// `STRING(n)`, cut at the first NUL.
    String(String),
    /// Raw bytes of a type the codec does not know.
    Raw(Vec<u8>),
}

/// Whether the codec knows `data_type` as a scalar (or string) type.
pub fn is_primitive(data_type: &str) -> bool {
    matches!(data_type,
             "BOOL" | "SINT" | "USINT" | "BYTE" | "INT" | "UINT" | "WORD"
             | "DINT" | "UDINT" | "DWORD" | "LINT" | "ULINT" | "LWORD"
             | "REAL" | "LREAL")
        || data_type.starts_with("STRING")
}

/// Decode `data` according to the PLC type name.
///
/// Unknown types decode to [`Value::Raw`]; input shorter than the type
/// requires is an error.
pub fn decode(data_type: &str, data: &[u8]) -> Result<Value> {
    let need = |n: usize| {
        if data.len() < n {
            Err(Error::Decode("decoding value", "input shorter than the data type"))
        } else {
            Ok(())
        }
    };
    Ok(match data_type {
        "BOOL" => {
            need(1)?;
            Value::Bool(data[0] != 0)
        }
        "SINT" => {
            need(1)?;
            Value::Sint(data[0] as i8)
        }
        "USINT" | "BYTE" => {
            need(1)?;
            Value::Byte(data[0])
        }
        "INT" => {
            need(2)?;
            Value::Int(LE::read_i16(data))
        }
        "UINT" | "WORD" => {
            need(2)?;
            Value::Word(LE::read_u16(data))
        }
        "DINT" => {
            need(4)?;
            Value::Dint(LE::read_i32(data))
        }
        "UDINT" | "DWORD" => {
            need(4)?;
            Value::Dword(LE::read_u32(data))
        }
        "LINT" => {
            need(8)?;
            Value::Lint(LE::read_i64(data))
        }
        "ULINT" | "LWORD" => {
            need(8)?;
            Value::Lword(LE::read_u64(data))
        }
        "REAL" => {
            need(4)?;
            Value::Real(LE::read_f32(data))
        }
        "LREAL" => {
            need(8)?;
            Value::Lreal(LE::read_f64(data))
        }
        ty if ty.starts_with("STRING") => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            Value::String(String::from_utf8_lossy(&data[..end]).into_owned())
        }
        _ => Value::Raw(data.to_vec()),
    })
}

/// Encode `value` as the PLC type `data_type`.
///
/// `size` is only consulted for `STRING`, which is fixed-width and NUL
/// padded; longer input is silently truncated.  Unknown type names, and
/// values that do not fit the named type, fail with
/// [`Error::UnsupportedType`].
pub fn encode(data_type: &str, value: &Value, size: usize) -> Result<Vec<u8>> {
    Ok(match (data_type, value) {
        ("BOOL", Value::Bool(v)) => vec![u8::from(*v)],
        ("SINT", Value::Sint(v)) => vec![*v as u8],
        ("USINT" | "BYTE", Value::Byte(v)) => vec![*v],
        ("INT", Value::Int(v)) => v.to_le_bytes().to_vec(),
        ("UINT" | "WORD", Value::Word(v)) => v.to_le_bytes().to_vec(),
        ("DINT", Value::Dint(v)) => v.to_le_bytes().to_vec(),
        ("UDINT" | "DWORD", Value::Dword(v)) => v.to_le_bytes().to_vec(),
        ("LINT", Value::Lint(v)) => v.to_le_bytes().to_vec(),
        ("ULINT" | "LWORD", Value::Lword(v)) => v.to_le_bytes().to_vec(),
        ("REAL", Value::Real(v)) => v.to_le_bytes().to_vec(),
        ("LREAL", Value::Lreal(v)) => v.to_le_bytes().to_vec(),
        (ty, Value::String(s)) if ty.starts_with("STRING") => {
            let mut buf = vec![0u8; size];
            let n = s.len().min(size);
            buf[..n].copy_from_slice(&s.as_bytes()[..n]);
            buf
        }
        _ => return Err(Error::UnsupportedType(data_type.to_string())),
    })
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Sint(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Word(v) => write!(f, "{}", v),
            Value::Dint(v) => write!(f, "{}", v),
            Value::Dword(v) => write!(f, "{}", v),
            Value::Lint(v) => write!(f, "{}", v),
            Value::Lword(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Lreal(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::Raw(bytes) => {
                for b in bytes {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
        }
    }
}
