use ndarray::{ArrayD, ArrayView};
use tracing::{debug, info, warn};

use crate::{
    attribute::{AttributeValue, Scope},
    cache::CachePolicy,
    codec::{CodecRegistry, StandardCodecs},
    dimension::{Dimension, DimensionId, Length},
    errors::{Error, Result},
    geom::Selection,
    group::{Group, GroupId},
    io::{CancelHandle, Context, Engine},
    resolver::Resolver,
    schema::Schema,
    session::{Config, FillMode, Format, Mode, Session},
    store::BlockStore,
    types::{Element, Endianness, NcType},
    variable::{Storage, Variable, VariableId},
};

/// Summary counts for a group
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inquiry {
    /// Dimensions defined directly in the group
    pub dimensions: usize,

    /// Variables defined directly in the group
    pub variables: usize,

    /// Attributes attached to the group
    pub attributes: usize,

    /// Unlimited dimensions defined directly in the group
    pub unlimited: Vec<DimensionId>,
}

/// An open dataset.
///
/// A dataset is either in define mode, where its schema may change, or in data mode, where
/// variable data may be read and written. A new dataset starts in define mode, an opened one in
/// data mode.
///
/// Dropping a dataset closes it, but errors can only be observed by calling `close`.
///
pub struct Dataset {
    schema: Schema,

    /// The schema as of the last commit made through this handle, or as opened
    committed: Option<Schema>,

    resolver: Resolver,
    codecs: Box<dyn CodecRegistry>,
    engine: Engine,
    session: Session,
    closed: bool,
}

impl Dataset {
    /// Create a new dataset in `store`, using the standard codecs.
    ///
    pub fn create(store: impl BlockStore + 'static, config: Config) -> Result<Self> {
        Self::create_with(store, StandardCodecs, config)
    }

    /// Create a new dataset in `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Where the dataset keeps its blocks. If the store already holds a dataset,
    ///   it is replaced when `config.clobber` is set, otherwise `Error::Exists` is returned.
    /// * `codecs` - The chunk filter implementations.
    /// * `config` - Options for the new dataset.
    ///
    pub fn create_with(
        store: impl BlockStore + 'static,
        codecs: impl CodecRegistry + 'static,
        config: Config,
    ) -> Result<Self> {
        let mut resolver = Resolver::init(Box::new(store), config.clobber)?;
        let schema = Schema::new(config.classic_model);
        resolver.commit(&schema)?;
        info!(
            location = ?resolver.location(),
            classic_model = config.classic_model,
            "created dataset"
        );

        Ok(Self {
            schema,
            committed: None,
            resolver,
            codecs: Box::new(codecs),
            engine: Engine::new(config.cache, config.share),
            session: Session::new(Mode::Define, true, config.fill),
            closed: false,
        })
    }

    /// Open an existing dataset in `store`, using the standard codecs.
    ///
    pub fn open(store: impl BlockStore + 'static, config: Config) -> Result<Self> {
        Self::open_with(store, StandardCodecs, config)
    }

    /// Open an existing dataset in `store`. The dataset starts in data mode.
    ///
    pub fn open_with(
        store: impl BlockStore + 'static,
        codecs: impl CodecRegistry + 'static,
        config: Config,
    ) -> Result<Self> {
        let (resolver, schema) = Resolver::load(Box::new(store))?;
        info!(
            location = ?resolver.location(),
            write = config.write,
            variables = schema.variables.len(),
            "opened dataset"
        );

        Ok(Self {
            committed: Some(schema.clone()),
            schema,
            resolver,
            codecs: Box::new(codecs),
            engine: Engine::new(config.cache, config.share),
            session: Session::new(Mode::Data, config.write, config.fill),
            closed: false,
        })
    }

    fn parts(&mut self) -> (&mut Engine, Context<'_>) {
        (
            &mut self.engine,
            Context {
                schema: &mut self.schema,
                store: self.resolver.store(),
                codecs: self.codecs.as_ref(),
            },
        )
    }

    pub fn mode(&self) -> Mode {
        self.session.mode
    }

    pub fn is_writable(&self) -> bool {
        self.session.writable
    }

    /// Switch from data mode to define mode.
    ///
    /// Pending data is synced first, so `abort` can return to this point.
    ///
    pub fn enter_define(&mut self) -> Result<()> {
        self.session.require_writable()?;
        self.session.require(Mode::Data)?;
        self.sync()?;
        self.session.mode = Mode::Define;

        Ok(())
    }

    /// Commit the schema and switch to data mode.
    ///
    /// Variables whose storage properties changed get their physical layout here. If writing
    /// the schema fails, the dataset stays in define mode with its changes intact, and the
    /// previously committed schema remains what other handles see.
    ///
    pub fn leave_define(&mut self) -> Result<()> {
        self.session.require_define()?;
        let (engine, mut ctx) = self.parts();
        for index in 0..ctx.schema.variables.len() {
            engine.initialize_layout(&mut ctx, VariableId(index))?;
        }
        self.resolver.commit(&self.schema)?;
        self.committed = Some(self.schema.clone());
        self.session.mode = Mode::Data;
        debug!(
            groups = self.schema.groups.len(),
            dimensions = self.schema.dimensions.len(),
            variables = self.schema.variables.len(),
            "left define mode"
        );

        Ok(())
    }

    /// Write all cached data and the current schema to the block store.
    ///
    /// A no-op for read only datasets.
    ///
    pub fn sync(&mut self) -> Result<()> {
        self.session.require(Mode::Data)?;
        if !self.session.writable {
            return Ok(());
        }
        let (engine, mut ctx) = self.parts();
        engine.flush(&mut ctx)?;
        self.resolver.commit(&self.schema)?;
        self.committed = Some(self.schema.clone());

        Ok(())
    }

    /// Discard schema changes made since define mode was entered.
    ///
    /// Returns to data mode with the last committed schema. A dataset that has never left
    /// define mode goes back to an empty schema and stays in define mode. In data mode there is
    /// nothing to discard.
    ///
    pub fn abort(&mut self) -> Result<()> {
        if self.session.mode == Mode::Data {
            return Ok(());
        }
        self.engine.discard();
        match &self.committed {
            Some(committed) => {
                self.schema = committed.clone();
                self.session.mode = Mode::Data;
            }
            None => self.schema = Schema::new(self.schema.classic_model),
        }
        debug!(mode = %self.session.mode, "aborted schema changes");

        Ok(())
    }

    /// Close the dataset, committing the schema if in define mode and writing all cached data.
    ///
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.session.writable {
            if self.session.mode == Mode::Define {
                self.leave_define()?;
            }
            self.sync()?;
        }
        self.resolver.close()?;
        info!(location = ?self.resolver.location(), "closed dataset");

        Ok(())
    }

    /// Set the fill mode for variables defined from now on, returning the previous mode.
    ///
    pub fn set_fill(&mut self, fill: FillMode) -> Result<FillMode> {
        self.session.require_writable()?;

        Ok(std::mem::replace(&mut self.session.fill, fill))
    }

    pub fn format(&self) -> Format {
        if self.schema.classic_model {
            Format::ClassicModel
        } else {
            Format::Extended
        }
    }

    /// Where the block store keeps the dataset, if it is anywhere in particular
    pub fn path(&self) -> Option<String> {
        self.resolver.location()
    }

    /// A handle that can cancel a running transfer from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.engine.cancel_handle()
    }

    pub fn inquire(&self, group: GroupId) -> Result<Inquiry> {
        let info = self.schema.group(group)?;

        Ok(Inquiry {
            dimensions: info.dimensions.len(),
            variables: info.variables.len(),
            attributes: info.attributes.len(),
            unlimited: self.schema.unlimited(group)?,
        })
    }

    // Groups

    pub fn define_group(&mut self, parent: GroupId, name: &str) -> Result<GroupId> {
        self.session.require_define()?;
        self.schema.define_group(parent, name)
    }

    /// Find a group by its absolute path, e.g. `/forecast/surface`
    pub fn group(&self, path: &str) -> Result<GroupId> {
        self.schema.resolve_path(GroupId::ROOT, path)
    }

    /// Find a group by a path relative to `from`, or by an absolute path
    pub fn resolve_group(&self, from: GroupId, path: &str) -> Result<GroupId> {
        self.schema.resolve_path(from, path)
    }

    pub fn group_info(&self, id: GroupId) -> Result<&Group> {
        self.schema.group(id)
    }

    pub fn full_name(&self, id: GroupId) -> Result<String> {
        self.schema.full_name(id)
    }

    pub fn parent_of(&self, id: GroupId) -> Result<Option<GroupId>> {
        Ok(self.schema.group(id)?.parent)
    }

    pub fn children(&self, id: GroupId) -> Result<&[GroupId]> {
        Ok(&self.schema.group(id)?.children)
    }

    pub fn rename_group(&mut self, id: GroupId, name: &str) -> Result<()> {
        self.session.require_define()?;
        self.schema.rename_group(id, name)
    }

    // Dimensions

    pub fn define_dimension(
        &mut self,
        group: GroupId,
        name: &str,
        length: Length,
    ) -> Result<DimensionId> {
        self.session.require_define()?;
        self.schema.define_dimension(group, name, length)
    }

    /// Find a dimension visible from `group` by name
    pub fn dimension(&self, group: GroupId, name: &str) -> Result<DimensionId> {
        self.schema.lookup_dimension(group, name)
    }

    pub fn dimension_info(&self, id: DimensionId) -> Result<&Dimension> {
        self.schema.dimension(id)
    }

    /// Current length of a dimension
    pub fn dimension_len(&self, id: DimensionId) -> Result<usize> {
        Ok(self.schema.dimension(id)?.length)
    }

    pub fn rename_dimension(&mut self, id: DimensionId, name: &str) -> Result<()> {
        self.session.require_define()?;
        self.schema.rename_dimension(id, name)
    }

    /// Unlimited dimensions defined directly in `group`
    pub fn unlimited_dimensions(&self, group: GroupId) -> Result<Vec<DimensionId>> {
        self.schema.unlimited(group)
    }

    /// Dimensions usable by variables in `group`, nearest first
    pub fn visible_dimensions(&self, group: GroupId) -> Result<Vec<DimensionId>> {
        self.schema.visible_dimensions(group)
    }

    // Variables

    /// Define a variable. It is prefilled unless the dataset's fill mode is `NoFill`.
    ///
    pub fn define_variable(
        &mut self,
        group: GroupId,
        name: &str,
        dtype: NcType,
        dimensions: &[DimensionId],
    ) -> Result<VariableId> {
        self.session.require_define()?;
        let no_fill = self.session.fill == FillMode::NoFill;
        self.schema
            .define_variable(group, name, dtype, dimensions, no_fill)
    }

    /// Find a variable in `group` by name
    pub fn variable(&self, group: GroupId, name: &str) -> Result<VariableId> {
        self.schema.lookup_variable(group, name)
    }

    pub fn variable_info(&self, id: VariableId) -> Result<&Variable> {
        self.schema.variable(id)
    }

    /// Variables defined directly in `group`
    pub fn variables(&self, group: GroupId) -> Result<&[VariableId]> {
        Ok(&self.schema.group(group)?.variables)
    }

    /// Current shape of a variable, reflecting growth of its unlimited dimensions
    pub fn shape_of(&self, id: VariableId) -> Result<Vec<usize>> {
        self.schema.shape_of(id)
    }

    pub fn rename_variable(&mut self, id: VariableId, name: &str) -> Result<()> {
        self.session.require_define()?;
        self.schema.rename_variable(id, name)
    }

    pub fn set_chunking(&mut self, id: VariableId, storage: Storage) -> Result<()> {
        self.session.require_define()?;
        self.schema.set_chunking(id, storage)
    }

    /// Configure compression.
    ///
    /// # Arguments
    ///
    /// * `id` - The variable.
    /// * `shuffle` - Whether to byte shuffle chunks before compressing them.
    /// * `deflate_level` - Deflate level in `0..=9`, or `None` for no compression.
    ///
    pub fn set_compression(
        &mut self,
        id: VariableId,
        shuffle: bool,
        deflate_level: Option<u32>,
    ) -> Result<()> {
        self.session.require_define()?;
        self.schema.set_compression(id, shuffle, deflate_level)
    }

    pub fn set_fletcher32(&mut self, id: VariableId, enabled: bool) -> Result<()> {
        self.session.require_define()?;
        self.schema.set_fletcher32(id, enabled)
    }

    /// Set the no-fill flag and, optionally, a fill value, which is stored as the variable's
    /// `_FillValue` attribute.
    ///
    pub fn set_fill_policy(
        &mut self,
        id: VariableId,
        no_fill: bool,
        fill_value: Option<AttributeValue>,
    ) -> Result<()> {
        self.session.require_define()?;
        self.schema.set_fill_policy(id, no_fill, fill_value)
    }

    pub fn set_endian(&mut self, id: VariableId, endianness: Endianness) -> Result<()> {
        self.session.require_define()?;
        self.schema.set_endian(id, endianness)
    }

    /// Change a variable's chunk cache limits. Allowed in either mode.
    ///
    pub fn set_chunk_cache(&mut self, id: VariableId, policy: CachePolicy) -> Result<()> {
        let (engine, mut ctx) = self.parts();
        engine.set_chunk_cache(&mut ctx, id, policy)
    }

    pub fn chunk_cache(&self, id: VariableId) -> Result<CachePolicy> {
        self.schema.variable(id)?;

        Ok(self.engine.chunk_cache(id))
    }

    // Attributes

    /// Add an attribute, or replace the value of an existing one.
    ///
    pub fn put_attribute(
        &mut self,
        scope: impl Into<Scope>,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<()> {
        self.session.require_define()?;
        self.schema.put_attribute(scope.into(), name, value.into())
    }

    pub fn attribute(&self, scope: impl Into<Scope>, name: &str) -> Result<&AttributeValue> {
        self.schema.attributes(scope.into())?.get(name)
    }

    /// The values of a numeric attribute, which must hold elements of type `T`
    ///
    pub fn attribute_values<T: Element>(
        &self,
        scope: impl Into<Scope>,
        name: &str,
    ) -> Result<&[T]> {
        let value = self.attribute(scope, name)?;
        T::unwrap(value).ok_or(Error::TypeMismatch {
            expected: value.dtype(),
            found: T::NC_TYPE,
        })
    }

    /// The value of a text attribute
    pub fn attribute_text(&self, scope: impl Into<Scope>, name: &str) -> Result<&str> {
        let value = self.attribute(scope, name)?;
        value.as_text().ok_or(Error::TypeMismatch {
            expected: value.dtype(),
            found: NcType::Char,
        })
    }

    /// Attribute names in insertion order
    pub fn attribute_names(&self, scope: impl Into<Scope>) -> Result<Vec<String>> {
        Ok(self.schema.attributes(scope.into())?.names())
    }

    pub fn attribute_count(&self, scope: impl Into<Scope>) -> Result<usize> {
        Ok(self.schema.attributes(scope.into())?.len())
    }

    pub fn delete_attribute(&mut self, scope: impl Into<Scope>, name: &str) -> Result<()> {
        self.session.require_define()?;
        self.schema.delete_attribute(scope.into(), name)?;

        Ok(())
    }

    pub fn rename_attribute(&mut self, scope: impl Into<Scope>, old: &str, new: &str) -> Result<()> {
        self.session.require_define()?;
        self.schema.rename_attribute(scope.into(), old, new)
    }

    /// Copy an attribute to another scope, replacing any attribute of the same name there.
    ///
    pub fn copy_attribute(
        &mut self,
        source: impl Into<Scope>,
        name: &str,
        destination: impl Into<Scope>,
    ) -> Result<()> {
        self.session.require_define()?;
        self.schema
            .copy_attribute(source.into(), name, destination.into())
    }

    // Data

    /// Read the selected elements of a variable.
    ///
    /// The result has one axis per variable dimension, with the selection's counts as its shape.
    ///
    pub fn read<T: Element>(&mut self, id: VariableId, selection: &Selection) -> Result<ArrayD<T>> {
        self.session.require(Mode::Data)?;
        let (engine, mut ctx) = self.parts();
        engine.read(&mut ctx, id, selection)
    }

    pub fn read_all<T: Element>(&mut self, id: VariableId) -> Result<ArrayD<T>> {
        self.read(id, &Selection::All)
    }

    pub fn read_one<T: Element>(&mut self, id: VariableId, index: &[usize]) -> Result<T> {
        let array = self.read::<T>(id, &Selection::Point(index.to_vec()))?;
        array
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::OutOfBounds(format!("{index:?}")))
    }

    pub fn read_slab<T: Element>(
        &mut self,
        id: VariableId,
        start: &[usize],
        count: &[usize],
    ) -> Result<ArrayD<T>> {
        let selection = Selection::Slab {
            start: start.to_vec(),
            count: count.to_vec(),
        };

        self.read(id, &selection)
    }

    pub fn read_strided<T: Element>(
        &mut self,
        id: VariableId,
        start: &[usize],
        count: &[usize],
        stride: &[usize],
    ) -> Result<ArrayD<T>> {
        let selection = Selection::Strided {
            start: start.to_vec(),
            count: count.to_vec(),
            stride: stride.to_vec(),
        };

        self.read(id, &selection)
    }

    /// Write the selected elements of a variable from a row-major buffer.
    ///
    /// Selecting past the end of an unlimited dimension grows it.
    ///
    pub fn write<T: Element>(
        &mut self,
        id: VariableId,
        selection: &Selection,
        values: &[T],
    ) -> Result<()> {
        self.session.require_data_write()?;
        let (engine, mut ctx) = self.parts();
        engine.write(&mut ctx, id, selection, values)
    }

    pub fn write_all<T: Element>(&mut self, id: VariableId, values: &[T]) -> Result<()> {
        self.write(id, &Selection::All, values)
    }

    pub fn write_one<T: Element>(&mut self, id: VariableId, index: &[usize], value: T) -> Result<()> {
        self.write(id, &Selection::Point(index.to_vec()), &[value])
    }

    pub fn write_slab<T: Element>(
        &mut self,
        id: VariableId,
        start: &[usize],
        count: &[usize],
        values: &[T],
    ) -> Result<()> {
        let selection = Selection::Slab {
            start: start.to_vec(),
            count: count.to_vec(),
        };

        self.write(id, &selection, values)
    }

    pub fn write_strided<T: Element>(
        &mut self,
        id: VariableId,
        start: &[usize],
        count: &[usize],
        stride: &[usize],
        values: &[T],
    ) -> Result<()> {
        let selection = Selection::Strided {
            start: start.to_vec(),
            count: count.to_vec(),
            stride: stride.to_vec(),
        };

        self.write(id, &selection, values)
    }

    /// Write an array, with its first element at `start`
    ///
    pub fn write_array<T, D>(
        &mut self,
        id: VariableId,
        start: &[usize],
        array: ArrayView<T, D>,
    ) -> Result<()>
    where
        T: Element,
        D: ndarray::Dimension,
    {
        let values: Vec<T> = array.iter().copied().collect();
        self.write_slab(id, start, array.shape(), &values)
    }

    /// Read variable length strings
    pub fn read_strings(&mut self, id: VariableId, selection: &Selection) -> Result<ArrayD<String>> {
        self.session.require(Mode::Data)?;
        let (engine, mut ctx) = self.parts();
        engine.read_strings(&mut ctx, id, selection)
    }

    /// Write variable length strings
    pub fn write_strings<S: AsRef<str>>(
        &mut self,
        id: VariableId,
        selection: &Selection,
        values: &[S],
    ) -> Result<()> {
        self.session.require_data_write()?;
        let (engine, mut ctx) = self.parts();
        engine.write_strings(&mut ctx, id, selection, values)
    }

    /// Read a row of a `Char` variable as text.
    ///
    /// `index` selects the row, with one coordinate per dimension except the last. The text
    /// ends at the first NUL character or at the end of the row.
    ///
    pub fn read_text(&mut self, id: VariableId, index: &[usize]) -> Result<String> {
        let (start, count) = self.text_row(id, index, None)?;
        let bytes = self.read_slab::<u8>(id, &start, &count)?;
        let bytes: Vec<u8> = bytes.iter().copied().take_while(|byte| *byte != 0).collect();

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write text into a row of a `Char` variable, starting at the row's first element.
    ///
    pub fn write_text(&mut self, id: VariableId, index: &[usize], text: &str) -> Result<()> {
        let (start, count) = self.text_row(id, index, Some(text.len()))?;
        self.write_slab(id, &start, &count, text.as_bytes())
    }

    fn text_row(
        &self,
        id: VariableId,
        index: &[usize],
        len: Option<usize>,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        let variable = self.schema.variable(id)?;
        if variable.dtype != NcType::Char {
            return Err(Error::TypeMismatch {
                expected: variable.dtype,
                found: NcType::Char,
            });
        }
        let shape = self.schema.shape_of(id)?;
        if shape.is_empty() {
            return Ok((vec![], vec![]));
        }
        if index.len() + 1 != shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "text row needs {} coordinates, got {}",
                shape.len() - 1,
                index.len()
            )));
        }

        let mut start = index.to_vec();
        start.push(0);
        let mut count = vec![1; index.len()];
        count.push(len.unwrap_or(shape[shape.len() - 1]));

        Ok((start, count))
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(error = %err, "failed to close dataset");
        }
    }
}
