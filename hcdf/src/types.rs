//! The canonical set of primitive element types, their widths and their default fill values.
//!
use std::fmt::{self, Debug};
use std::mem;

use num_traits::{FromBytes, ToBytes};
use serde::{Deserialize, Serialize};

use crate::{
    attribute::AttributeValue,
    errors::{Error, Result},
};

/// Width, in bytes, of a variable length string handle.
pub(crate) const HANDLE_WIDTH: usize = 8;

/// Primitive element types.
///
/// The discriminants are the stable type codes written into the schema image.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum NcType {
    /// signed 8-bit integer
    Byte = 1,
    /// ISO/ASCII character
    Char = 2,
    /// signed 16-bit integer
    Short = 3,
    /// signed 32-bit integer
    Int = 4,
    /// 32-bit floating point
    Float = 5,
    /// 64-bit floating point
    Double = 6,
    /// unsigned 8-bit integer
    UByte = 7,
    /// unsigned 16-bit integer
    UShort = 8,
    /// unsigned 32-bit integer
    UInt = 9,
    /// signed 64-bit integer
    Int64 = 10,
    /// unsigned 64-bit integer
    UInt64 = 11,
    /// variable length string
    String = 12,
}

impl NcType {
    pub const ALL: [NcType; 12] = [
        NcType::Byte,
        NcType::Char,
        NcType::Short,
        NcType::Int,
        NcType::Float,
        NcType::Double,
        NcType::UByte,
        NcType::UShort,
        NcType::UInt,
        NcType::Int64,
        NcType::UInt64,
        NcType::String,
    ];

    /// Look up a type by its numeric code
    ///
    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|dtype| dtype.code() == code)
            .ok_or(Error::UnknownType(code))
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Number of bytes one element occupies in memory.
    ///
    /// Strings are not stored inline, their width is the width of a handle.
    ///
    pub fn size(&self) -> usize {
        match self {
            NcType::Byte | NcType::Char | NcType::UByte => 1,
            NcType::Short | NcType::UShort => 2,
            NcType::Int | NcType::UInt | NcType::Float => 4,
            NcType::Int64 | NcType::UInt64 | NcType::Double => 8,
            NcType::String => mem::size_of::<*const u8>(),
        }
    }

    /// Number of bytes one element occupies in a chunk or contiguous block.
    pub(crate) fn stored_size(&self) -> usize {
        match self {
            NcType::String => HANDLE_WIDTH,
            _ => self.size(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NcType::Byte => "byte",
            NcType::Char => "char",
            NcType::Short => "short",
            NcType::Int => "int",
            NcType::Float => "float",
            NcType::Double => "double",
            NcType::UByte => "ubyte",
            NcType::UShort => "ushort",
            NcType::UInt => "uint",
            NcType::Int64 => "int64",
            NcType::UInt64 => "uint64",
            NcType::String => "string",
        }
    }

    /// Whether the type exists in the classic data model
    pub fn is_classic(&self) -> bool {
        matches!(
            self,
            NcType::Byte
                | NcType::Char
                | NcType::Short
                | NcType::Int
                | NcType::Float
                | NcType::Double
        )
    }

    /// The value stored in never written elements, unless a variable overrides it with a
    /// `_FillValue` attribute.
    ///
    pub fn default_fill_value(&self) -> AttributeValue {
        match self {
            NcType::Byte => AttributeValue::I8(vec![-127]),
            NcType::Char => AttributeValue::Text(String::from("\0")),
            NcType::Short => AttributeValue::I16(vec![-32767]),
            NcType::Int => AttributeValue::I32(vec![-2147483647]),
            NcType::Float => AttributeValue::F32(vec![9.96921e36]),
            NcType::Double => AttributeValue::F64(vec![9.969209968386869e36]),
            NcType::UByte => AttributeValue::U8(vec![255]),
            NcType::UShort => AttributeValue::U16(vec![65535]),
            NcType::UInt => AttributeValue::U32(vec![4294967295]),
            NcType::Int64 => AttributeValue::I64(vec![-9223372036854775806]),
            NcType::UInt64 => AttributeValue::U64(vec![18446744073709551614]),
            NcType::String => AttributeValue::Strings(vec![String::new()]),
        }
    }
}

impl fmt::Display for NcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Width, in bytes, of the type identified by `code`.
///
pub fn width_of(code: i32) -> Result<usize> {
    Ok(NcType::from_code(code)?.size())
}

/// Canonical fill value for the type identified by `code`.
///
pub fn default_fill_value(code: i32) -> Result<AttributeValue> {
    Ok(NcType::from_code(code)?.default_fill_value())
}

/// Declared byte order of a variable's stored data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    Native,
    Little,
    Big,
}

impl Endianness {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Endianness::Native => 0,
            Endianness::Little => 1,
            Endianness::Big => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Endianness::Native),
            1 => Ok(Endianness::Little),
            2 => Ok(Endianness::Big),
            _ => Err(Error::Format(format!("bad endianness code {code}"))),
        }
    }

    /// Concrete byte order for this host
    pub(crate) fn resolve(&self) -> ByteOrder {
        match self {
            Endianness::Little => ByteOrder::Little,
            Endianness::Big => ByteOrder::Big,
            Endianness::Native => {
                if cfg!(target_endian = "little") {
                    ByteOrder::Little
                } else {
                    ByteOrder::Big
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ByteOrder {
    Little,
    Big,
}

/// A Rust primitive that can be moved in and out of a variable.
///
/// Reads and writes never convert between types. The element type requested by the caller must
/// be the variable's declared type, with the one exception that `u8` may be used to move the raw
/// bytes of a `Char` variable.
///
pub trait Element:
    Copy + Debug + Default + PartialEq + Send + 'static + ToBytes + FromBytes<Bytes = <Self as ToBytes>::Bytes>
{
    const NC_TYPE: NcType;

    fn accepts(dtype: NcType) -> bool {
        dtype == Self::NC_TYPE
    }

    /// Wrap a vector of this element type as an attribute value
    fn wrap(values: Vec<Self>) -> AttributeValue;

    /// Borrow the values of an attribute, if it holds this element type
    fn unwrap(value: &AttributeValue) -> Option<&[Self]>;
}

macro_rules! element {
    ($type:ty, $nc_type:ident, $variant:ident) => {
        impl Element for $type {
            const NC_TYPE: NcType = NcType::$nc_type;

            fn wrap(values: Vec<Self>) -> AttributeValue {
                AttributeValue::$variant(values)
            }

            fn unwrap(value: &AttributeValue) -> Option<&[Self]> {
                match value {
                    AttributeValue::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

element!(i8, Byte, I8);
element!(i16, Short, I16);
element!(i32, Int, I32);
element!(i64, Int64, I64);
element!(u16, UShort, U16);
element!(u32, UInt, U32);
element!(u64, UInt64, U64);
element!(f32, Float, F32);
element!(f64, Double, F64);

impl Element for u8 {
    const NC_TYPE: NcType = NcType::UByte;

    fn accepts(dtype: NcType) -> bool {
        matches!(dtype, NcType::UByte | NcType::Char)
    }

    fn wrap(values: Vec<Self>) -> AttributeValue {
        AttributeValue::U8(values)
    }

    fn unwrap(value: &AttributeValue) -> Option<&[Self]> {
        match value {
            AttributeValue::U8(values) => Some(values),
            _ => None,
        }
    }
}

/// Check that elements of type `T` may be moved in and out of a `dtype` variable
pub(crate) fn check_element<T: Element>(dtype: NcType) -> Result<()> {
    if T::accepts(dtype) {
        Ok(())
    } else {
        Err(Error::TypeMismatch {
            expected: dtype,
            found: T::NC_TYPE,
        })
    }
}

/// Encode values using the given byte order
///
pub(crate) fn encode<T: Element>(values: &[T], order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * mem::size_of::<T>());
    for value in values {
        match order {
            ByteOrder::Little => bytes.extend_from_slice(ToBytes::to_le_bytes(value).as_ref()),
            ByteOrder::Big => bytes.extend_from_slice(ToBytes::to_be_bytes(value).as_ref()),
        }
    }

    bytes
}

/// Decode values using the given byte order
///
/// Any trailing partial element is ignored.
///
pub(crate) fn decode<T: Element>(bytes: &[u8], order: ByteOrder) -> Vec<T> {
    let mut scratch = ToBytes::to_le_bytes(&T::default());
    bytes
        .chunks_exact(mem::size_of::<T>())
        .map(|raw| {
            scratch.as_mut().copy_from_slice(raw);
            match order {
                ByteOrder::Little => <T as FromBytes>::from_le_bytes(&scratch),
                ByteOrder::Big => <T as FromBytes>::from_be_bytes(&scratch),
            }
        })
        .collect()
}
