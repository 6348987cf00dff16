//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer
//! data back and forth. These break down into seven basic array types, which
//! define the data, and five categories of attached metadata. This module
//! models this, and provides tools for handling generic data, converting
//! between data types, and serialization/deserialization for communication
//! over CA.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`] - all numeric data types in CA are signed, and all of them
//! can represent arrays here. The options, and the native type used to
//! represent them, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`Vec<u16>`]) - an index into up to 16 string
//!   choices, which travel in the [`DbrGraphics::Enum`] metadata.
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, represented
//!   here by [`Vec<String>`] and converted back and forth to fixed-length
//!   form as required for communication.
//!
//! The protocol also defines `SHORT` as an alias for `INT` - this is ignored
//! here to avoid excessive confusion.
//!
//! These seven data types can be sent with five kinds of metadata attached,
//! enumerated by [`DbrCategory`] and represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - Everything from [`Dbr::Status`] plus a timestamp.
//! - [`Dbr::Graphics`] - Alarm plus display information: units, precision
//!   for floating types, display/warning/alarm limits, or the choice labels
//!   for enum data.
//! - [`Dbr::Control`] - Everything from [`Dbr::Graphics`] plus the control
//!   limits.
//!
//! Both [`DbrCategory`] and [`DbrBasicType`] are combined in the [`DbrType`]
//! struct, which converts to/from the integer representation of types used
//! by the CA protocol.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

use nom::{
    Parser,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{Bounded, NumCast, cast::AsPrimitive, traits::ToBytes};
use std::{
    cmp,
    convert::TryFrom,
    io::{self, Cursor},
    num::NonZeroUsize,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::messages::ErrorCondition;

// Constants from EPICS
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
pub const MAX_STRING_SIZE: usize = 40;

/// Seconds between the unix epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a
/// length > the fixed length of the target field. But we can't convert and
/// truncate blindly because although we don't _expect_ to ever handle
/// non-ASCII it technically isn't guaranteed. So, convert
/// one-character-at-a-time until the length would go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(Vec<u16>),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(val) => val.len(),
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// The value an unwritten record of the given type holds
    pub fn default_for(basic_type: DbrBasicType) -> DbrValue {
        match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(vec![0]),
            DbrBasicType::String => DbrValue::String(vec![String::new()]),
            DbrBasicType::Char => DbrValue::Char(vec![0]),
            DbrBasicType::Int => DbrValue::Int(vec![0]),
            DbrBasicType::Long => DbrValue::Long(vec![0]),
            DbrBasicType::Float => DbrValue::Float(vec![0.0]),
            DbrBasicType::Double => DbrValue::Double(vec![0.0]),
        }
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &Vec<String>) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from.as_slice() {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Char(_try_convert_vec(val)?),
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Int(_try_convert_vec(val)?),
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(_try_convert_vec(val)?),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(_try_convert_vec(val)?),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(_try_convert_vec(val)?),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(val.iter().map(|c| *c as u8).collect())
                        .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                _ => return Err(ErrorCondition::NoConvert),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Enum(_try_convert_vec(val)?),
                _ => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| {
                        let mut buf = string_to_fixed_length_bytes(v, MAX_STRING_SIZE - 1);
                        buf.resize(MAX_STRING_SIZE, 0u8);
                        buf
                    })
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> Result<DbrValue, DbrError> {
        Ok(match data_type {
            DbrBasicType::Enum => DbrValue::Enum(be(count(be_u16, item_count).parse(data))?.1),
            DbrBasicType::String => DbrValue::String(
                data.chunks(MAX_STRING_SIZE)
                    .take(item_count)
                    .map(|d| {
                        let strlen = d.iter().position(|&c| c == 0x00).unwrap_or(d.len());
                        String::from_utf8_lossy(&d[0..strlen]).to_string()
                    })
                    .collect(),
            ),
            DbrBasicType::Char => DbrValue::Char(be(count(be_i8, item_count).parse(data))?.1),
            DbrBasicType::Int => DbrValue::Int(be(count(be_i16, item_count).parse(data))?.1),
            DbrBasicType::Long => DbrValue::Long(be(count(be_i32, item_count).parse(data))?.1),
            DbrBasicType::Float => DbrValue::Float(be(count(be_f32, item_count).parse(data))?.1),
            DbrBasicType::Double => DbrValue::Double(be(count(be_f64, item_count).parse(data))?.1),
        })
    }
}

/// Errors arising when decoding DBR structures out of payload bytes
#[derive(Debug)]
pub enum DbrError {
    UnknownType(u16),
    Truncated,
    Malformed(String),
}

impl std::fmt::Display for DbrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbrError::UnknownType(code) => write!(f, "Unknown DBR type code: {code}"),
            DbrError::Truncated => write!(f, "DBR payload ends before the advertised data"),
            DbrError::Malformed(msg) => write!(f, "Malformed DBR payload: {msg}"),
        }
    }
}

impl std::error::Error for DbrError {}

/// Pin nom's error type so parse results convert cleanly to [`DbrError`]
fn be<'a, T>(
    result: Result<(&'a [u8], T), nom::Err<nom::error::Error<&'a [u8]>>>,
) -> Result<(&'a [u8], T), DbrError> {
    result.map_err(|_| DbrError::Truncated)
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);

impl From<String> for DbrValue {
    fn from(value: String) -> Self {
        DbrValue::String(vec![value])
    }
}

/// Alarm condition of a record, as carried in all non-Basic DBR categories
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AlarmStatus {
    #[default]
    NoAlarm = 0,
    Read = 1,
    Write = 2,
    HiHi = 3,
    High = 4,
    LoLo = 5,
    Low = 6,
    State = 7,
    Cos = 8,
    Comm = 9,
    Timeout = 10,
    HwLimit = 11,
    Calc = 12,
    Scan = 13,
    Link = 14,
    Soft = 15,
    BadSub = 16,
    Udf = 17,
    Disable = 18,
    Simm = 19,
    ReadAccess = 20,
    WriteAccess = 21,
}

impl TryFrom<i16> for AlarmStatus {
    type Error = DbrError;
    fn try_from(value: i16) -> Result<Self, DbrError> {
        use AlarmStatus::*;
        Ok(match value {
            0 => NoAlarm,
            1 => Read,
            2 => Write,
            3 => HiHi,
            4 => High,
            5 => LoLo,
            6 => Low,
            7 => State,
            8 => Cos,
            9 => Comm,
            10 => Timeout,
            11 => HwLimit,
            12 => Calc,
            13 => Scan,
            14 => Link,
            15 => Soft,
            16 => BadSub,
            17 => Udf,
            18 => Disable,
            19 => Simm,
            20 => ReadAccess,
            21 => WriteAccess,
            other => return Err(DbrError::Malformed(format!("bad alarm status {other}"))),
        })
    }
}

/// How seriously to take the current [`AlarmStatus`]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmSeverity {
    #[default]
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

impl TryFrom<i16> for AlarmSeverity {
    type Error = DbrError;
    fn try_from(value: i16) -> Result<Self, DbrError> {
        Ok(match value {
            0 => AlarmSeverity::NoAlarm,
            1 => AlarmSeverity::Minor,
            2 => AlarmSeverity::Major,
            3 => AlarmSeverity::Invalid,
            other => return Err(DbrError::Malformed(format!("bad alarm severity {other}"))),
        })
    }
}

/// Represent alarm state of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Alarm {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
}

impl Alarm {
    fn parse(data: &[u8]) -> Result<(&[u8], Alarm), DbrError> {
        let (rest, (status, severity)) = be((be_i16, be_i16).parse(data))?;
        Ok((
            rest,
            Alarm {
                status: status.try_into()?,
                severity: severity.try_into()?,
            },
        ))
    }
    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.status as i16).to_be_bytes())?;
        writer.write_all(&(self.severity as i16).to_be_bytes())?;
        Ok(())
    }
}

/// Display/warning/alarm bounds attached to Graphics and Control categories
#[derive(Clone, Debug, PartialEq)]
pub struct Limits<T: Bounded + ToBytes> {
    /// (lower, upper)
    pub display_limits: (T, T),
    pub alarm_limits: (T, T),
    pub warning_limits: (T, T),
}

impl<T: Bounded + ToBytes + Copy> Limits<T> {
    fn to_be_bytes(&self) -> Vec<u8> {
        let (d_l, d_u) = &self.display_limits;
        let (a_l, a_u) = &self.alarm_limits;
        let (w_l, w_u) = &self.warning_limits;

        // Wire order: upper_disp, lower_disp, upper_alarm, upper_warning,
        // lower_warning, lower_alarm
        let values = [d_u, d_l, a_u, w_u, w_l, a_l];
        values
            .iter()
            .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
            .collect()
    }

    fn parse<'a, F>(data: &'a [u8], mut item: F) -> Result<(&'a [u8], Limits<T>), DbrError>
    where
        F: FnMut(&'a [u8]) -> Result<(&'a [u8], T), DbrError>,
    {
        let (data, d_u) = item(data)?;
        let (data, d_l) = item(data)?;
        let (data, a_u) = item(data)?;
        let (data, w_u) = item(data)?;
        let (data, w_l) = item(data)?;
        let (data, a_l) = item(data)?;
        Ok((
            data,
            Limits {
                display_limits: (d_l, d_u),
                alarm_limits: (a_l, a_u),
                warning_limits: (w_l, w_u),
            },
        ))
    }
}

impl<T: Bounded + ToBytes> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display_limits: (T::min_value(), T::max_value()),
            alarm_limits: (T::min_value(), T::max_value()),
            warning_limits: (T::min_value(), T::max_value()),
        }
    }
}

macro_rules! limit_reader {
    ($parser:expr) => {
        |d| be($parser.parse(d))
    };
}

/// Display metadata for the Graphics and Control categories
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    /// Enum data carries its choice labels instead of units and limits
    Enum { labels: Vec<String> },
    /// String data has no graphics beyond the alarm state
    String,
    Char {
        units: String,
        limits: Limits<i8>,
    },
    Int {
        units: String,
        limits: Limits<i16>,
    },
    Long {
        units: String,
        limits: Limits<i32>,
    },
    Float {
        units: String,
        limits: Limits<f32>,
        precision: i16,
    },
    Double {
        units: String,
        limits: Limits<f64>,
        precision: i16,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum { labels: Vec::new() },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    /// The enum choice labels, where this is enum graphics
    pub fn labels(&self) -> Option<&[String]> {
        match self {
            DbrGraphics::Enum { labels } => Some(labels),
            _ => None,
        }
    }

    pub fn units(&self) -> Option<&str> {
        match self {
            DbrGraphics::Char { units, .. }
            | DbrGraphics::Int { units, .. }
            | DbrGraphics::Long { units, .. }
            | DbrGraphics::Float { units, .. }
            | DbrGraphics::Double { units, .. } => Some(units),
            _ => None,
        }
    }

    pub fn precision(&self) -> Option<i16> {
        match self {
            DbrGraphics::Float { precision, .. } | DbrGraphics::Double { precision, .. } => {
                Some(*precision)
            }
            _ => None,
        }
    }

    fn write_units<W: io::Write>(units: &str, writer: &mut W) -> io::Result<()> {
        let mut buf = string_to_fixed_length_bytes(units, MAX_UNITS_SIZE - 1);
        buf.resize(MAX_UNITS_SIZE, 0u8);
        writer.write_all(&buf)
    }

    fn write_labels<W: io::Write>(labels: &[String], writer: &mut W) -> io::Result<()> {
        writer.write_all(&(labels.len().min(MAX_ENUM_STATES) as i16).to_be_bytes())?;
        for slot in 0..MAX_ENUM_STATES {
            let mut buf = match labels.get(slot) {
                Some(label) => string_to_fixed_length_bytes(label, MAX_ENUM_STRING_SIZE - 1),
                None => Vec::new(),
            };
            buf.resize(MAX_ENUM_STRING_SIZE, 0u8);
            writer.write_all(&buf)?;
        }
        Ok(())
    }

    /// Write the graphics block. Float/double precision leads, then units
    /// and limits; enum writes the label table instead.
    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            DbrGraphics::Enum { labels } => Self::write_labels(labels, writer),
            DbrGraphics::String => Ok(()),
            DbrGraphics::Char { units, limits } => {
                Self::write_units(units, writer)?;
                writer.write_all(&limits.to_be_bytes())
            }
            DbrGraphics::Int { units, limits } => {
                Self::write_units(units, writer)?;
                writer.write_all(&limits.to_be_bytes())
            }
            DbrGraphics::Long { units, limits } => {
                Self::write_units(units, writer)?;
                writer.write_all(&limits.to_be_bytes())
            }
            DbrGraphics::Float {
                units,
                limits,
                precision,
            } => {
                writer.write_all(&precision.to_be_bytes())?;
                writer.write_all(&0i16.to_be_bytes())?;
                Self::write_units(units, writer)?;
                writer.write_all(&limits.to_be_bytes())
            }
            DbrGraphics::Double {
                units,
                limits,
                precision,
            } => {
                writer.write_all(&precision.to_be_bytes())?;
                writer.write_all(&0i16.to_be_bytes())?;
                Self::write_units(units, writer)?;
                writer.write_all(&limits.to_be_bytes())
            }
        }
    }

    fn parse_units(data: &[u8]) -> Result<(&[u8], String), DbrError> {
        if data.len() < MAX_UNITS_SIZE {
            return Err(DbrError::Truncated);
        }
        let strlen = data[..MAX_UNITS_SIZE]
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MAX_UNITS_SIZE);
        Ok((
            &data[MAX_UNITS_SIZE..],
            String::from_utf8_lossy(&data[..strlen]).to_string(),
        ))
    }

    fn parse_labels(data: &[u8]) -> Result<(&[u8], Vec<String>), DbrError> {
        let (data, no_str) = be(be_i16.parse(data))?;
        let table_size = MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE;
        if data.len() < table_size {
            return Err(DbrError::Truncated);
        }
        let labels = data[..table_size]
            .chunks(MAX_ENUM_STRING_SIZE)
            .take(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize)
            .map(|chunk| {
                let strlen = chunk.iter().position(|&c| c == 0).unwrap_or(chunk.len());
                String::from_utf8_lossy(&chunk[..strlen]).to_string()
            })
            .collect();
        Ok((&data[table_size..], labels))
    }

    fn parse(data: &[u8], kind: DbrBasicType) -> Result<(&[u8], DbrGraphics), DbrError> {
        Ok(match kind {
            DbrBasicType::Enum => {
                let (data, labels) = Self::parse_labels(data)?;
                (data, DbrGraphics::Enum { labels })
            }
            DbrBasicType::String => (data, DbrGraphics::String),
            DbrBasicType::Char => {
                let (data, units) = Self::parse_units(data)?;
                let (data, limits) = Limits::parse(data, limit_reader!(be_i8))?;
                (data, DbrGraphics::Char { units, limits })
            }
            DbrBasicType::Int => {
                let (data, units) = Self::parse_units(data)?;
                let (data, limits) = Limits::parse(data, limit_reader!(be_i16))?;
                (data, DbrGraphics::Int { units, limits })
            }
            DbrBasicType::Long => {
                let (data, units) = Self::parse_units(data)?;
                let (data, limits) = Limits::parse(data, limit_reader!(be_i32))?;
                (data, DbrGraphics::Long { units, limits })
            }
            DbrBasicType::Float => {
                let (data, (precision, _pad)) = be((be_i16, be_i16).parse(data))?;
                let (data, units) = Self::parse_units(data)?;
                let (data, limits) = Limits::parse(data, limit_reader!(be_f32))?;
                (
                    data,
                    DbrGraphics::Float {
                        units,
                        limits,
                        precision,
                    },
                )
            }
            DbrBasicType::Double => {
                let (data, (precision, _pad)) = be((be_i16, be_i16).parse(data))?;
                let (data, units) = Self::parse_units(data)?;
                let (data, limits) = Limits::parse(data, limit_reader!(be_f64))?;
                (
                    data,
                    DbrGraphics::Double {
                        units,
                        limits,
                        precision,
                    },
                )
            }
        })
    }
}

/// Control bounds, only present in the Control category
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    /// Enum and string data carry no control limits
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }

    /// Wire order: upper control limit, then lower
    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            DbrControl::Enum => Ok(()),
            DbrControl::String => Ok(()),
            DbrControl::Char(l, u) => {
                writer.write_all(&u.to_be_bytes())?;
                writer.write_all(&l.to_be_bytes())
            }
            DbrControl::Int(l, u) => {
                writer.write_all(&u.to_be_bytes())?;
                writer.write_all(&l.to_be_bytes())
            }
            DbrControl::Long(l, u) => {
                writer.write_all(&u.to_be_bytes())?;
                writer.write_all(&l.to_be_bytes())
            }
            DbrControl::Float(l, u) => {
                writer.write_all(&u.to_be_bytes())?;
                writer.write_all(&l.to_be_bytes())
            }
            DbrControl::Double(l, u) => {
                writer.write_all(&u.to_be_bytes())?;
                writer.write_all(&l.to_be_bytes())
            }
        }
    }

    fn parse(data: &[u8], kind: DbrBasicType) -> Result<(&[u8], DbrControl), DbrError> {
        Ok(match kind {
            DbrBasicType::Enum => (data, DbrControl::Enum),
            DbrBasicType::String => (data, DbrControl::String),
            DbrBasicType::Char => {
                let (data, (u, l)) = be((be_i8, be_i8).parse(data))?;
                (data, DbrControl::Char(l, u))
            }
            DbrBasicType::Int => {
                let (data, (u, l)) = be((be_i16, be_i16).parse(data))?;
                (data, DbrControl::Int(l, u))
            }
            DbrBasicType::Long => {
                let (data, (u, l)) = be((be_i32, be_i32).parse(data))?;
                (data, DbrControl::Long(l, u))
            }
            DbrBasicType::Float => {
                let (data, (u, l)) = be((be_f32, be_f32).parse(data))?;
                (data, DbrControl::Float(l, u))
            }
            DbrBasicType::Double => {
                let (data, (u, l)) = be((be_f64, be_f64).parse(data))?;
                (data, DbrControl::Double(l, u))
            }
        })
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, DbrError> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(DbrError::UnknownType(value)),
        }
    }
}

impl DbrBasicType {
    /// Size in bytes of one element of this type on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Int => 2,
            DbrBasicType::Float => 4,
            DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DbrBasicType::String => "string",
            DbrBasicType::Int => "short",
            DbrBasicType::Float => "float",
            DbrBasicType::Enum => "enum",
            DbrBasicType::Char => "char",
            DbrBasicType::Long => "int",
            DbrBasicType::Double => "double",
        }
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

impl TryFrom<u16> for DbrCategory {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, DbrError> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(DbrError::UnknownType(value)),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl TryFrom<u16> for DbrType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, DbrError> {
        if value >= 35 {
            return Err(DbrError::UnknownType(value));
        }
        Ok(Self {
            basic_type: (value % 7).try_into()?,
            category: (value / 7).try_into()?,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a packet, there is a datatype-specific padding to be
    /// inserted between the metadata about the value and the actual value
    /// itself. This is given as a lookup table rather than a calculation.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm state metadata alongside the record value
    Status { status: Alarm, value: DbrValue },
    /// Timestamp, alarm state, and value
    Time {
        status: Alarm,
        timestamp: SystemTime,
        value: DbrValue,
    },
    /// Alarm state plus display metadata (units/limits, or enum labels)
    Graphics {
        status: Alarm,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    /// Everything in Graphics, plus control limits
    Control {
        status: Alarm,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }

    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }

    /// If a DBR type encoding alarm state, fetch that
    pub fn status(&self) -> Option<Alarm> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } => Some(graphics),
            Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }

    pub fn control(&self) -> Option<&DbrControl> {
        match self {
            Dbr::Control { control, .. } => Some(control),
            _ => None,
        }
    }

    /// The enum choice labels, where this DBR carries enum graphics
    pub fn labels(&self) -> Option<&[String]> {
        self.graphics().and_then(|g| g.labels())
    }

    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType {
            basic_type: self.value().get_type(),
            category,
        }
    }

    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, DbrError> {
        let (data, status) = if data_type.category != DbrCategory::Basic {
            let (d, alarm) = Alarm::parse(data)?;
            (d, Some(alarm))
        } else {
            (data, None)
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = be((be_i32, be_u32).parse(data))?;
            (
                input,
                Some(
                    UNIX_EPOCH
                        .checked_add(Duration::new(
                            time_s as u64 + EPICS_EPOCH_OFFSET,
                            time_ns % 1_000_000_000,
                        ))
                        .ok_or(DbrError::Malformed("timestamp overflow".to_string()))?,
                ),
            )
        } else {
            (data, None)
        };

        let (data, graphics) = if matches!(
            data_type.category,
            DbrCategory::Graphics | DbrCategory::Control
        ) {
            let (d, graphics) = DbrGraphics::parse(data, data_type.basic_type)?;
            (d, Some(graphics))
        } else {
            (data, None)
        };

        let (data, control) = if data_type.category == DbrCategory::Control {
            let (d, control) = DbrControl::parse(data, data_type.basic_type)?;
            (d, Some(control))
        } else {
            (data, None)
        };

        // Offset the read buffer to account for metadata padding
        let padding = data_type.get_metadata_padding();
        if data.len() < padding {
            return Err(DbrError::Truncated);
        }
        let data = &data[padding..];
        let value = DbrValue::decode_value(data_type.basic_type, data_count, data)?;

        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status {
                status: status.unwrap(),
                value,
            },
            DbrCategory::Time => Dbr::Time {
                status: status.unwrap(),
                timestamp: timestamp.unwrap(),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status: status.unwrap(),
                graphics: graphics.unwrap(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status: status.unwrap(),
                graphics: graphics.unwrap(),
                control: control.unwrap(),
                value,
            },
        })
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        let real_count = self.write_be(&mut buffer, max_elems).unwrap();
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        if let Some(status) = self.status() {
            status.write(writer)?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| io::Error::other("timestamp before unix epoch"))?;
                let time_s = unix_time.as_secs() as i64 - EPICS_EPOCH_OFFSET as i64;
                let time_ns = unix_time.subsec_nanos();
                writer.write_all(&(time_s as i32).to_be_bytes())?;
                writer.write_all(&time_ns.to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => {
                graphics.write(writer)?;
            }
            Dbr::Control {
                graphics, control, ..
            } => {
                graphics.write(writer)?;
                control.write(writer)?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }

    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        let timestamp = self.timestamp().unwrap_or_else(SystemTime::now);
        let graphics = || {
            self.graphics()
                .cloned()
                .unwrap_or_else(|| DbrGraphics::default_for(dbr_type.basic_type))
        };
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics: graphics(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics: graphics(),
                control: self
                    .control()
                    .cloned()
                    .unwrap_or_else(|| DbrControl::default_for(dbr_type.basic_type)),
                value,
            },
        })
    }
}

/// Marks a Rust type as usable through a typed channel.
///
/// Implementations map the type to the CA basic type requested on the wire,
/// a forced element count (scalars request exactly one element, array types
/// the server's native count), and conversion to/from the interchange
/// [`DbrValue`].
pub trait CaType: Clone + Send + Sync + 'static {
    const BASIC_TYPE: DbrBasicType;
    /// `Some(1)` for scalars; `None` requests the native element count
    const FORCED_COUNT: Option<u32>;
    fn type_name() -> &'static str;
    fn from_value(value: &DbrValue) -> Option<Self>;
    fn into_value(self) -> DbrValue;
}

macro_rules! impl_ca_type {
    ($typ:ty, $variant:ident, $name:literal) => {
        impl CaType for $typ {
            const BASIC_TYPE: DbrBasicType = DbrBasicType::$variant;
            const FORCED_COUNT: Option<u32> = Some(1);
            fn type_name() -> &'static str {
                $name
            }
            fn from_value(value: &DbrValue) -> Option<Self> {
                let v: Vec<$typ> = value.try_into().ok()?;
                v.into_iter().next()
            }
            fn into_value(self) -> DbrValue {
                self.into()
            }
        }
        impl CaType for Vec<$typ> {
            const BASIC_TYPE: DbrBasicType = DbrBasicType::$variant;
            const FORCED_COUNT: Option<u32> = None;
            fn type_name() -> &'static str {
                concat!($name, "[]")
            }
            fn from_value(value: &DbrValue) -> Option<Self> {
                value.try_into().ok()
            }
            fn into_value(self) -> DbrValue {
                self.into()
            }
        }
    };
}

impl_ca_type!(i8, Char, "char");
impl_ca_type!(i16, Int, "short");
impl_ca_type!(i32, Long, "int");
impl_ca_type!(f32, Float, "float");
impl_ca_type!(f64, Double, "double");
impl_ca_type!(String, String, "string");

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(None).1,
            data.iter()
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);

        assert_eq!(
            DbrValue::Float(vec![455.9f32])
                .convert_to(DbrBasicType::Long)
                .unwrap()
                .to_bytes(NonZeroUsize::new(5))
                .1,
            vec![0x00, 0x00, 0x01, 0xc7]
        );
    }

    #[test]
    fn encode_time_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Alarm::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr
            .convert_to(DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Time,
            })
            .unwrap()
            .to_bytes(None);
        assert_eq!(out_data.len(), example_packet.len());
        assert_eq!(out_data, example_packet);

        // And it comes back out the same
        let reparsed = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Long, DbrCategory::Time),
            1,
            &out_data,
        )
        .unwrap();
        assert_eq!(reparsed.value(), &DbrValue::Long(vec![42]));
        assert_eq!(reparsed.timestamp(), dbr.timestamp());
    }

    #[test]
    fn string_to_char_roundtrip() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn type_code_mapping() {
        // DBR_GR_ENUM is 3 * 7 + 3 = 24, DBR_TIME_DOUBLE 2 * 7 + 6 = 20
        let gr_enum = DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics);
        assert_eq!(<u16 as From<DbrType>>::from(gr_enum), 24);
        assert_eq!(DbrType::try_from(24u16).unwrap(), gr_enum);

        let time_double = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        assert_eq!(<u16 as From<DbrType>>::from(time_double), 20);
        assert_eq!(DbrType::try_from(20u16).unwrap(), time_double);

        assert!(DbrType::try_from(35u16).is_err());
    }

    #[test]
    fn graphics_enum_roundtrip() {
        let labels: Vec<String> = ["zero", "one", "two", "three"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let dbr = Dbr::Graphics {
            status: Alarm {
                status: AlarmStatus::Udf,
                severity: AlarmSeverity::Invalid,
            },
            graphics: DbrGraphics::Enum {
                labels: labels.clone(),
            },
            value: DbrValue::Enum(vec![2]),
        };
        let (count, bytes) = dbr.to_bytes(None);
        assert_eq!(count, 1);
        // status + severity + no_str + 16*26 label table + one u16 value
        assert_eq!(bytes.len(), 2 + 2 + 2 + 416 + 2);

        let parsed = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics),
            1,
            &bytes,
        )
        .unwrap();
        assert_eq!(parsed.labels(), Some(labels.as_slice()));
        assert_eq!(parsed.value(), &DbrValue::Enum(vec![2]));
        assert_eq!(
            parsed.status(),
            Some(Alarm {
                status: AlarmStatus::Udf,
                severity: AlarmSeverity::Invalid,
            })
        );
    }

    #[test]
    fn control_double_roundtrip() {
        let dbr = Dbr::Control {
            status: Alarm::default(),
            graphics: DbrGraphics::Double {
                units: "mA".to_string(),
                limits: Limits {
                    display_limits: (-10.0, 10.0),
                    alarm_limits: (-8.0, 8.0),
                    warning_limits: (-5.0, 5.0),
                },
                precision: 3,
            },
            control: DbrControl::Double(-2.0, 2.0),
            value: DbrValue::Double(vec![1.25]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        let parsed = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Double, DbrCategory::Control),
            1,
            &bytes,
        )
        .unwrap();
        assert_eq!(parsed, dbr);
        let graphics = parsed.graphics().unwrap();
        assert_eq!(graphics.units(), Some("mA"));
        assert_eq!(graphics.precision(), Some(3));
    }

    #[test]
    fn status_char_padding() {
        // STS_CHAR has a single padding byte between metadata and value
        let dbr = Dbr::Status {
            status: Alarm::default(),
            value: DbrValue::Char(vec![7, 8]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 2 + 2 + 1 + 2);
        let parsed = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Char, DbrCategory::Status),
            2,
            &bytes,
        )
        .unwrap();
        assert_eq!(parsed.value(), &DbrValue::Char(vec![7, 8]));
    }

    #[test]
    fn ca_type_conversions() {
        assert_eq!(f64::from_value(&DbrValue::Double(vec![3.5, 4.5])), Some(3.5));
        assert_eq!(
            <Vec<i32>>::from_value(&DbrValue::Int(vec![1, 2, 3])),
            Some(vec![1, 2, 3])
        );
        assert_eq!(i16::from_value(&DbrValue::Enum(vec![2])), Some(2));
        assert_eq!(<Vec<f64> as CaType>::FORCED_COUNT, None);
        assert_eq!(<f64 as CaType>::FORCED_COUNT, Some(1));
        assert_eq!(<f64 as CaType>::type_name(), "double");
        assert_eq!(<Vec<i32> as CaType>::type_name(), "int[]");
    }

    #[test]
    fn oversized_string_truncates() {
        let long = "x".repeat(100);
        let value = DbrValue::String(vec![long]);
        let (_, bytes) = value.to_bytes(None);
        assert_eq!(bytes.len(), MAX_STRING_SIZE);
        // Final byte is always the terminator
        assert_eq!(bytes[MAX_STRING_SIZE - 1], 0);
    }
}
