//! Named, typed, multi-dimensional arrays and their storage properties.
//!
use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use crate::{
    attribute::{AttributeStore, AttributeValue, FILL_VALUE},
    codec::Filters,
    dimension::DimensionId,
    errors::{Error, Result},
    extio::{ExtendedRead, ExtendedWrite, Serialize},
    group::{check_name, read_ids, write_ids, GroupId},
    schema::Schema,
    store::BlockId,
    types::{Endianness, NcType},
};

/// Index of a variable in a dataset's schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub(crate) usize);

impl VariableId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Physical storage arrangement of a variable's data
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    /// All elements in a single block, in row-major order
    Contiguous,

    /// Elements grouped in chunks of the given shape, each chunk stored and filtered
    /// independently
    Chunked(Vec<usize>),
}

/// Location of an encoded chunk in the block store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkEntry {
    pub block: BlockId,

    /// Length of the encoded chunk, which may be shorter than its block
    pub len: u64,
}

pub(crate) type ChunkIndex = BTreeMap<Vec<usize>, ChunkEntry>;

/// A named, typed array bound to an ordered list of dimensions
///
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) group: GroupId,
    pub(crate) dtype: NcType,
    pub(crate) dimensions: Vec<DimensionId>,
    pub(crate) storage: Storage,
    pub(crate) filters: Filters,
    pub(crate) no_fill: bool,
    pub(crate) endianness: Endianness,
    pub(crate) attributes: AttributeStore,

    /// Set by the first data write. Storage properties are frozen from then on.
    pub(crate) written: bool,

    /// Block holding a contiguous variable's data, once allocated
    pub(crate) block: Option<BlockId>,

    /// Blocks holding a chunked variable's chunks, by chunk coordinates
    pub(crate) chunks: ChunkIndex,

    /// The physical layout no longer matches the storage properties and has to be
    /// (re)initialized at the next schema commit. Never persisted.
    pub(crate) layout_stale: bool,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group the variable was defined in
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn dtype(&self) -> NcType {
        self.dtype
    }

    pub fn dimensions(&self) -> &[DimensionId] {
        &self.dimensions
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn chunk_shape(&self) -> Option<&[usize]> {
        match &self.storage {
            Storage::Contiguous => None,
            Storage::Chunked(shape) => Some(shape),
        }
    }

    pub fn filters(&self) -> Filters {
        self.filters
    }

    pub fn no_fill(&self) -> bool {
        self.no_fill
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Whether the variable has received any data
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// The value never written elements read as: the `_FillValue` attribute, if set, or the
    /// type's default.
    ///
    pub fn fill_value(&self) -> AttributeValue {
        match self.attributes.get(FILL_VALUE) {
            Ok(value) => value.clone(),
            Err(_) => self.dtype.default_fill_value(),
        }
    }

    /// The stored representation of one never written element.
    ///
    /// String elements are handles, a zero handle stands for the fill string. Without fill, never
    /// written elements are zeroed.
    ///
    pub(crate) fn fill_bytes(&self) -> Vec<u8> {
        let width = self.dtype.stored_size();
        if self.no_fill || self.dtype == NcType::String {
            return vec![0; width];
        }

        self.fill_value()
            .first_element_bytes(self.endianness.resolve())
            .filter(|bytes| bytes.len() == width)
            .unwrap_or_else(|| vec![0; width])
    }

    pub(crate) fn check_not_written(&self) -> Result<()> {
        if self.written {
            Err(Error::AlreadyFinalized(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

impl Serialize for Variable {
    fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_string(&self.name)?;
        stream.write_usize(self.group.0)?;
        stream.write_byte(self.dtype.code() as u8)?;
        write_ids(stream, self.dimensions.iter().map(|id| id.0))?;
        match &self.storage {
            Storage::Contiguous => stream.write_byte(0)?,
            Storage::Chunked(shape) => {
                stream.write_byte(1)?;
                write_ids(stream, shape.iter().copied())?;
            }
        }
        stream.write_bool(self.filters.shuffle)?;
        match self.filters.deflate {
            Some(level) => {
                stream.write_bool(true)?;
                stream.write_byte(level as u8)?;
            }
            None => stream.write_bool(false)?,
        }
        stream.write_bool(self.filters.fletcher32)?;
        stream.write_bool(self.no_fill)?;
        stream.write_byte(self.endianness.code())?;
        self.attributes.write_to(stream)?;
        stream.write_bool(self.written)?;
        match self.block {
            Some(block) => {
                stream.write_bool(true)?;
                stream.write_varint(block)?;
            }
            None => stream.write_bool(false)?,
        }
        stream.write_usize(self.chunks.len())?;
        for (coords, entry) in &self.chunks {
            write_ids(stream, coords.iter().copied())?;
            stream.write_varint(entry.block)?;
            stream.write_varint(entry.len)?;
        }

        Ok(())
    }

    fn read_from(stream: &mut impl Read) -> Result<Self> {
        let name = stream.read_string()?;
        let group = GroupId(stream.read_usize()?);
        let dtype = NcType::from_code(stream.read_byte()? as i32)?;
        let dimensions = read_ids(stream)?.into_iter().map(DimensionId).collect();
        let storage = match stream.read_byte()? {
            0 => Storage::Contiguous,
            1 => Storage::Chunked(read_ids(stream)?),
            code => return Err(Error::Format(format!("bad storage code {code}"))),
        };
        let shuffle = stream.read_bool()?;
        let deflate = if stream.read_bool()? {
            Some(stream.read_byte()? as u32)
        } else {
            None
        };
        let fletcher32 = stream.read_bool()?;
        let no_fill = stream.read_bool()?;
        let endianness = Endianness::from_code(stream.read_byte()?)?;
        let attributes = AttributeStore::read_from(stream)?;
        let written = stream.read_bool()?;
        let block = if stream.read_bool()? {
            Some(stream.read_varint()?)
        } else {
            None
        };
        let mut chunks = ChunkIndex::new();
        let count = stream.read_usize()?;
        for _ in 0..count {
            let coords = read_ids(stream)?;
            let block = stream.read_varint()?;
            let len = stream.read_varint()?;
            chunks.insert(coords, ChunkEntry { block, len });
        }

        Ok(Self {
            name,
            group,
            dtype,
            dimensions,
            storage,
            filters: Filters {
                shuffle,
                deflate,
                fletcher32,
            },
            no_fill,
            endianness,
            attributes,
            written,
            block,
            chunks,
            layout_stale: false,
        })
    }
}

impl Schema {
    pub(crate) fn variable(&self, id: VariableId) -> Result<&Variable> {
        self.variables
            .get(id.0)
            .ok_or_else(|| Error::VariableNotFound(format!("no variable with index {}", id.0)))
    }

    pub(crate) fn variable_mut(&mut self, id: VariableId) -> Result<&mut Variable> {
        self.variables
            .get_mut(id.0)
            .ok_or_else(|| Error::VariableNotFound(format!("no variable with index {}", id.0)))
    }

    /// Define a new variable in `group`.
    ///
    /// # Arguments
    ///
    /// * `group` - The group the variable belongs to.
    /// * `name` - Must be unique among the group's variables.
    /// * `dtype` - The element type.
    /// * `dimensions` - The variable's axes, outermost first. Each must be defined in `group` or
    ///   one of its ancestors. An empty list defines a scalar.
    /// * `no_fill` - Initial fill policy.
    ///
    pub(crate) fn define_variable(
        &mut self,
        group: GroupId,
        name: &str,
        dtype: NcType,
        dimensions: &[DimensionId],
        no_fill: bool,
    ) -> Result<VariableId> {
        check_name(name)?;
        if self.lookup_variable(group, name).is_ok() {
            return Err(Error::DuplicateName(name.to_string()));
        }
        if self.classic_model && !dtype.is_classic() {
            return Err(Error::ClassicModel(format!("type {dtype} is not supported")));
        }

        let lineage = self.lineage(group)?;
        for (axis, id) in dimensions.iter().enumerate() {
            let dimension = self
                .dimension(*id)
                .map_err(|_| Error::DimensionNotFound(format!("index {}", id.0)))?;
            if !lineage.contains(&dimension.group) {
                return Err(Error::DimensionNotFound(format!(
                    "{} is not visible from {}",
                    dimension.name,
                    self.full_name(group)?
                )));
            }
            if self.classic_model && dimension.unlimited && axis != 0 {
                return Err(Error::ClassicModel(String::from(
                    "the unlimited dimension must be the first dimension",
                )));
            }
        }

        let storage = if dimensions
            .iter()
            .any(|id| self.dimensions[id.0].unlimited)
        {
            Storage::Chunked(self.default_chunk_shape(dimensions))
        } else {
            Storage::Contiguous
        };

        let id = VariableId(self.variables.len());
        self.variables.push(Variable {
            name: name.to_string(),
            group,
            dtype,
            dimensions: dimensions.to_vec(),
            storage,
            filters: Filters::default(),
            no_fill,
            endianness: Endianness::Native,
            attributes: AttributeStore::new(),
            written: false,
            block: None,
            chunks: ChunkIndex::new(),
            layout_stale: true,
        });
        self.group_mut(group)?.variables.push(id);

        Ok(id)
    }

    /// One element along unlimited axes, the whole axis along fixed ones
    ///
    fn default_chunk_shape(&self, dimensions: &[DimensionId]) -> Vec<usize> {
        dimensions
            .iter()
            .map(|id| {
                let dimension = &self.dimensions[id.0];
                if dimension.unlimited {
                    1
                } else {
                    dimension.length.max(1)
                }
            })
            .collect()
    }

    pub(crate) fn lookup_variable(&self, group: GroupId, name: &str) -> Result<VariableId> {
        self.group(group)?
            .variables
            .iter()
            .copied()
            .find(|id| self.variables[id.0].name == name)
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    pub(crate) fn rename_variable(&mut self, id: VariableId, name: &str) -> Result<()> {
        check_name(name)?;
        let group = self.variable(id)?.group;
        match self.lookup_variable(group, name) {
            Ok(existing) if existing != id => Err(Error::DuplicateName(name.to_string())),
            _ => {
                self.variable_mut(id)?.name = name.to_string();
                Ok(())
            }
        }
    }

    /// Current shape of a variable, read live from its dimensions
    ///
    pub(crate) fn shape_of(&self, id: VariableId) -> Result<Vec<usize>> {
        Ok(self
            .variable(id)?
            .dimensions
            .iter()
            .map(|dimension| self.dimensions[dimension.0].length)
            .collect())
    }

    /// A storage property is about to change. Fails once the variable has data.
    ///
    fn storage_mut(&mut self, id: VariableId) -> Result<&mut Variable> {
        let variable = self.variable_mut(id)?;
        variable.check_not_written()?;
        variable.layout_stale = true;

        Ok(variable)
    }

    pub(crate) fn set_chunking(&mut self, id: VariableId, storage: Storage) -> Result<()> {
        let variable = self.variable(id)?;
        variable.check_not_written()?;
        match &storage {
            Storage::Contiguous => {
                if variable
                    .dimensions
                    .iter()
                    .any(|dimension| self.dimensions[dimension.0].unlimited)
                {
                    return Err(Error::InvalidArgument(format!(
                        "{} has an unlimited dimension and must be chunked",
                        variable.name
                    )));
                }
                if !variable.filters.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "{} is filtered and must be chunked",
                        variable.name
                    )));
                }
            }
            Storage::Chunked(shape) => {
                if variable.dimensions.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "{} is a scalar and cannot be chunked",
                        variable.name
                    )));
                }
                if shape.len() != variable.dimensions.len() {
                    return Err(Error::ShapeMismatch(format!(
                        "chunk shape has rank {}, {} has rank {}",
                        shape.len(),
                        variable.name,
                        variable.dimensions.len()
                    )));
                }
                if shape.iter().any(|extent| *extent == 0) {
                    return Err(Error::InvalidArgument(String::from(
                        "chunk extents must be at least 1",
                    )));
                }
            }
        }

        let variable = self.storage_mut(id)?;
        variable.storage = storage;
        variable.block = None;

        Ok(())
    }

    /// Filters require chunked storage, so a contiguous variable switches to the default chunk
    /// shape.
    ///
    fn set_filters(&mut self, id: VariableId, filters: Filters) -> Result<()> {
        let variable = self.variable(id)?;
        variable.check_not_written()?;
        let switch = if !filters.is_empty() && variable.storage == Storage::Contiguous {
            if variable.dimensions.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "{} is a scalar and cannot be filtered",
                    variable.name
                )));
            }
            Some(self.default_chunk_shape(&variable.dimensions))
        } else {
            None
        };

        let variable = self.storage_mut(id)?;
        variable.filters = filters;
        if let Some(shape) = switch {
            variable.storage = Storage::Chunked(shape);
            variable.block = None;
        }

        Ok(())
    }

    pub(crate) fn set_compression(
        &mut self,
        id: VariableId,
        shuffle: bool,
        deflate_level: Option<u32>,
    ) -> Result<()> {
        if let Some(level) = deflate_level {
            if level > 9 {
                return Err(Error::InvalidArgument(format!(
                    "deflate level must be in 0..=9, got {level}"
                )));
            }
        }
        let filters = Filters {
            shuffle,
            deflate: deflate_level,
            ..self.variable(id)?.filters
        };

        self.set_filters(id, filters)
    }

    pub(crate) fn set_fletcher32(&mut self, id: VariableId, enabled: bool) -> Result<()> {
        let filters = Filters {
            fletcher32: enabled,
            ..self.variable(id)?.filters
        };

        self.set_filters(id, filters)
    }

    /// Set the no-fill flag and, optionally, the fill value.
    ///
    pub(crate) fn set_fill_policy(
        &mut self,
        id: VariableId,
        no_fill: bool,
        fill_value: Option<AttributeValue>,
    ) -> Result<()> {
        self.variable(id)?.check_not_written()?;
        if let Some(value) = &fill_value {
            check_fill_value(self.variable(id)?, value)?;
        }

        let variable = self.storage_mut(id)?;
        variable.no_fill = no_fill;
        if let Some(value) = fill_value {
            variable.attributes.put(FILL_VALUE, value);
        }

        Ok(())
    }

    pub(crate) fn set_endian(&mut self, id: VariableId, endianness: Endianness) -> Result<()> {
        self.storage_mut(id)?.endianness = endianness;

        Ok(())
    }
}

/// A fill value must be a single element of the variable's type
///
pub(crate) fn check_fill_value(variable: &Variable, value: &AttributeValue) -> Result<()> {
    if value.dtype() != variable.dtype {
        return Err(Error::TypeMismatch {
            expected: variable.dtype,
            found: value.dtype(),
        });
    }
    if value.len() != 1 {
        return Err(Error::ShapeMismatch(format!(
            "{FILL_VALUE} must have exactly one element, got {}",
            value.len()
        )));
    }

    Ok(())
}
