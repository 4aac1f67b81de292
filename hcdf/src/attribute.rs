//! Typed key/value metadata attached to groups and variables.
//!
use std::io::{Read, Write};

use paste::paste;

use crate::{
    errors::{Error, Result},
    extio::{capacity, ExtendedRead, ExtendedWrite, Serialize},
    group::GroupId,
    types::{decode, encode, ByteOrder, Element, NcType},
    variable::VariableId,
};

/// Name of the attribute that overrides a variable's default fill value
pub const FILL_VALUE: &str = "_FillValue";

/// The owner of a set of attributes.
///
/// Attributes attached to the root group are the dataset's global attributes.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Group(GroupId),
    Variable(VariableId),
}

impl Scope {
    /// Scope of the dataset-global attributes
    pub const GLOBAL: Scope = Scope::Group(GroupId::ROOT);
}

impl From<GroupId> for Scope {
    fn from(group: GroupId) -> Self {
        Scope::Group(group)
    }
}

impl From<VariableId> for Scope {
    fn from(variable: VariableId) -> Self {
        Scope::Variable(variable)
    }
}

/// The payload of an attribute, tagged with its element type.
///
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    /// Character data (`Char` type), one element per byte
    Text(String),
    /// Variable length strings (`String` type)
    Strings(Vec<String>),
}

macro_rules! accessors {
    ($($variant:ident: $type:ident),*) => {
        paste! {
            impl AttributeValue {
                $(
                    #[doc = "Borrow the values if this attribute holds `" $type "` data"]
                    pub fn [<as_ $type>](&self) -> Option<&[$type]> {
                        match self {
                            AttributeValue::$variant(values) => Some(values),
                            _ => None,
                        }
                    }
                )*
            }
        }
    };
}

accessors!(I8: i8, I16: i16, I32: i32, I64: i64, U8: u8, U16: u16, U32: u32, U64: u64, F32: f32, F64: f64);

impl AttributeValue {
    pub fn dtype(&self) -> NcType {
        match self {
            AttributeValue::I8(_) => NcType::Byte,
            AttributeValue::I16(_) => NcType::Short,
            AttributeValue::I32(_) => NcType::Int,
            AttributeValue::I64(_) => NcType::Int64,
            AttributeValue::U8(_) => NcType::UByte,
            AttributeValue::U16(_) => NcType::UShort,
            AttributeValue::U32(_) => NcType::UInt,
            AttributeValue::U64(_) => NcType::UInt64,
            AttributeValue::F32(_) => NcType::Float,
            AttributeValue::F64(_) => NcType::Double,
            AttributeValue::Text(_) => NcType::Char,
            AttributeValue::Strings(_) => NcType::String,
        }
    }

    /// Number of elements. For text this is the number of bytes.
    pub fn len(&self) -> usize {
        match self {
            AttributeValue::I8(values) => values.len(),
            AttributeValue::I16(values) => values.len(),
            AttributeValue::I32(values) => values.len(),
            AttributeValue::I64(values) => values.len(),
            AttributeValue::U8(values) => values.len(),
            AttributeValue::U16(values) => values.len(),
            AttributeValue::U32(values) => values.len(),
            AttributeValue::U64(values) => values.len(),
            AttributeValue::F32(values) => values.len(),
            AttributeValue::F64(values) => values.len(),
            AttributeValue::Text(text) => text.len(),
            AttributeValue::Strings(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            AttributeValue::Strings(values) => Some(values),
            _ => None,
        }
    }

    /// Encode the first element in the given byte order.
    ///
    /// Returns `None` for empty values and for `String` values, which have no fixed width
    /// representation.
    ///
    pub(crate) fn first_element_bytes(&self, order: ByteOrder) -> Option<Vec<u8>> {
        match self {
            AttributeValue::I8(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::I16(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::I32(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::I64(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::U8(values) => values.first().map(|v| vec![*v]),
            AttributeValue::U16(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::U32(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::U64(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::F32(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::F64(values) => values.first().map(|v| encode(&[*v], order)),
            AttributeValue::Text(text) => text.as_bytes().first().map(|b| vec![*b]),
            AttributeValue::Strings(_) => None,
        }
    }
}

impl<T: Element> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        T::wrap(values)
    }
}

impl From<&str> for AttributeValue {
    fn from(text: &str) -> Self {
        AttributeValue::Text(text.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(text: String) -> Self {
        AttributeValue::Text(text)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::Strings(values)
    }
}

impl Serialize for AttributeValue {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_byte(self.dtype().code() as u8)?;
        stream.write_usize(self.len())?;
        let order = ByteOrder::Little;
        match self {
            AttributeValue::I8(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::I16(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::I32(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::I64(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::U8(values) => stream.write_all(values)?,
            AttributeValue::U16(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::U32(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::U64(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::F32(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::F64(values) => stream.write_all(&encode(values, order))?,
            AttributeValue::Text(text) => stream.write_all(text.as_bytes())?,
            AttributeValue::Strings(values) => {
                for value in values {
                    stream.write_string(value)?;
                }
            }
        }

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        let dtype = NcType::from_code(stream.read_byte()? as i32)?;
        let len = stream.read_usize()?;
        if dtype == NcType::String {
            let mut values = Vec::with_capacity(capacity(len));
            for _ in 0..len {
                values.push(stream.read_string()?);
            }
            return Ok(AttributeValue::Strings(values));
        }

        let size = len
            .checked_mul(dtype.size())
            .ok_or_else(|| Error::Format(format!("attribute of {len} elements is too large")))?;
        let bytes = stream.read_exactly(size)?;
        let order = ByteOrder::Little;
        let value = match dtype {
            NcType::Byte => AttributeValue::I8(decode(&bytes, order)),
            NcType::Short => AttributeValue::I16(decode(&bytes, order)),
            NcType::Int => AttributeValue::I32(decode(&bytes, order)),
            NcType::Int64 => AttributeValue::I64(decode(&bytes, order)),
            NcType::UByte => AttributeValue::U8(bytes),
            NcType::UShort => AttributeValue::U16(decode(&bytes, order)),
            NcType::UInt => AttributeValue::U32(decode(&bytes, order)),
            NcType::UInt64 => AttributeValue::U64(decode(&bytes, order)),
            NcType::Float => AttributeValue::F32(decode(&bytes, order)),
            NcType::Double => AttributeValue::F64(decode(&bytes, order)),
            NcType::Char => AttributeValue::Text(
                String::from_utf8(bytes)
                    .map_err(|err| Error::Format(format!("bad attribute text: {err}")))?,
            ),
            NcType::String => unreachable!(),
        };

        Ok(value)
    }
}

/// A named attribute
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// The attributes of a single scope, kept in insertion order.
///
/// Replacing an attribute's value keeps its position, so an attribute's index is stable until
/// an attribute before it is deleted.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeStore {
    attributes: Vec<Attribute>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute, or fully replace the value of an existing one
    pub fn put<S: Into<String>>(&mut self, name: S, value: AttributeValue) {
        let name = name.into();
        match self.position(&name) {
            Some(index) => self.attributes[index].value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Result<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| &attribute.value)
            .ok_or_else(|| Error::AttributeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn delete(&mut self, name: &str) -> Result<AttributeValue> {
        let index = self
            .position(name)
            .ok_or_else(|| Error::AttributeNotFound(name.to_string()))?;

        Ok(self.attributes.remove(index).value)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let index = self
            .position(old)
            .ok_or_else(|| Error::AttributeNotFound(old.to_string()))?;
        if old != new && self.contains(new) {
            return Err(Error::NameCollision(new.to_string()));
        }
        self.attributes[index].name = new.to_string();

        Ok(())
    }

    /// Attribute names in insertion order
    pub fn names(&self) -> Vec<String> {
        self.attributes
            .iter()
            .map(|attribute| attribute.name.clone())
            .collect()
    }

    /// Position of an attribute in insertion order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.name == name)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }
}

impl Serialize for AttributeStore {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_usize(self.attributes.len())?;
        for attribute in &self.attributes {
            stream.write_string(&attribute.name)?;
            attribute.value.write_to(stream)?;
        }

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        let count = stream.read_usize()?;
        let mut attributes = Vec::with_capacity(capacity(count));
        for _ in 0..count {
            let name = stream.read_string()?;
            let value = AttributeValue::read_from(stream)?;
            attributes.push(Attribute { name, value });
        }

        Ok(Self { attributes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn store() -> AttributeStore {
        let mut store = AttributeStore::new();
        store.put("units", AttributeValue::from("K"));
        store.put("valid_range", AttributeValue::from(vec![0.0_f32, 400.0]));
        store.put("flags", AttributeValue::from(vec![1_i8, 2, 4]));

        store
    }

    #[test]
    fn test_put_get() -> Result<()> {
        let store = store();
        assert_eq!(store.get("units")?, &AttributeValue::Text(String::from("K")));
        assert_eq!(
            store.get("valid_range")?.as_f32(),
            Some(&[0.0_f32, 400.0][..])
        );
        assert_eq!(store.get("flags")?.dtype(), NcType::Byte);
        assert_eq!(store.get("flags")?.len(), 3);

        Ok(())
    }

    #[test]
    fn test_put_replaces() -> Result<()> {
        let mut store = store();
        store.put("valid_range", AttributeValue::from(vec![-1_i32]));

        assert_eq!(store.get("valid_range")?, &AttributeValue::I32(vec![-1]));
        assert_eq!(store.len(), 3);
        assert_eq!(store.names(), vec!["units", "valid_range", "flags"]);

        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let mut store = store();
        let value = store.delete("units")?;
        assert_eq!(value.as_text(), Some("K"));
        assert!(matches!(store.get("units"), Err(Error::AttributeNotFound(_))));
        assert!(matches!(
            store.delete("units"),
            Err(Error::AttributeNotFound(_))
        ));
        assert_eq!(store.names(), vec!["valid_range", "flags"]);

        Ok(())
    }

    #[test]
    fn test_rename() -> Result<()> {
        let mut store = store();
        store.rename("units", "unit")?;
        assert_eq!(store.names(), vec!["unit", "valid_range", "flags"]);

        assert!(matches!(
            store.rename("unit", "flags"),
            Err(Error::NameCollision(_))
        ));
        assert!(matches!(
            store.rename("nope", "other"),
            Err(Error::AttributeNotFound(_))
        ));
        assert_eq!(store.names(), vec!["unit", "valid_range", "flags"]);

        Ok(())
    }

    #[test]
    fn test_serialize() -> Result<()> {
        let mut store = store();
        store.put("names", AttributeValue::from(vec![String::from("a"), String::new()]));
        store.put("big", AttributeValue::from(vec![u64::MAX, 0]));
        store.put("empty", AttributeValue::F64(vec![]));

        let mut buffer: Vec<u8> = vec![];
        store.write_to(&mut buffer)?;
        let loaded = AttributeStore::read_from(&mut Cursor::new(buffer))?;
        assert_eq!(loaded, store);

        Ok(())
    }

    #[test]
    fn test_corrupt_length() -> Result<()> {
        for (dtype, len) in [(NcType::Double, usize::MAX >> 1), (NcType::Int, 1 << 40)] {
            let mut buffer: Vec<u8> = vec![];
            buffer.write_byte(dtype.code() as u8)?;
            buffer.write_usize(len)?;
            buffer.extend_from_slice(&[0; 16]);
            assert!(matches!(
                AttributeValue::read_from(&mut Cursor::new(buffer)),
                Err(Error::Format(_))
            ));
        }

        let mut buffer: Vec<u8> = vec![];
        buffer.write_usize(1 << 40)?;
        assert!(matches!(
            AttributeStore::read_from(&mut Cursor::new(buffer)),
            Err(Error::Format(_) | Error::BlockStore(_))
        ));

        Ok(())
    }

    #[test]
    fn test_first_element_bytes() {
        let value = AttributeValue::from(vec![258_u16, 7]);
        assert_eq!(value.first_element_bytes(ByteOrder::Big), Some(vec![1, 2]));
        assert_eq!(value.first_element_bytes(ByteOrder::Little), Some(vec![2, 1]));
        assert_eq!(AttributeValue::I32(vec![]).first_element_bytes(ByteOrder::Big), None);
    }
}
