//! Moves typed array data between caller buffers and the block store.
//!
//! Requests are resolved to a hyperslab and checked against the variable's current shape. Writes
//! may grow unlimited dimensions. A contiguous variable is transferred as one byte extent of its
//! block. A chunked variable is transferred chunk by chunk through a write-back LRU cache, with
//! chunks filtered on their way to the store and unfiltered on their way back.
//!
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ndarray::{ArrayD, IxDyn};
use tracing::debug;

use crate::{
    cache::{Cache, CachePolicy, Cacheable},
    codec::CodecRegistry,
    dimension::DimensionId,
    errors::{Error, Result},
    geom::{chunk_pieces, checked_elements, copy_elements, elements, Hyperslab, Placement, Selection},
    schema::Schema,
    store::{BlockId, BlockStore},
    types::{check_element, decode, encode, ByteOrder, Element, NcType, HANDLE_WIDTH},
    variable::{ChunkEntry, Storage, VariableId},
};

/// Requests cancellation of a running transfer.
///
/// The flag is checked before each chunk is transferred. A transfer that sees it fails with
/// `Error::Cancelled` and clears the flag. Chunks transferred before that point stay written.
///
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// A decoded chunk
pub(crate) struct ChunkBuffer {
    bytes: Vec<u8>,

    /// Modified since it was last written to the store
    dirty: bool,
}

impl Cacheable for ChunkBuffer {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

type ChunkKey = Vec<usize>;

/// Everything a transfer touches besides the engine itself
pub(crate) struct Context<'a> {
    pub schema: &'a mut Schema,
    pub store: &'a mut dyn BlockStore,
    pub codecs: &'a dyn CodecRegistry,
}

/// A validated request
struct Transfer {
    slab: Hyperslab,

    /// New lengths for unlimited dimensions, applied before data moves
    growth: Vec<(DimensionId, usize)>,
}

pub(crate) struct Engine {
    caches: HashMap<VariableId, Cache<ChunkKey, ChunkBuffer>>,

    /// Dirty chunks evicted from a cache whose write back failed. They are retried by the next
    /// flush, and reads see them in the meantime.
    pending: HashMap<VariableId, BTreeMap<ChunkKey, ChunkBuffer>>,

    policies: HashMap<VariableId, CachePolicy>,
    default_policy: CachePolicy,

    /// Bypass caching entirely
    share: bool,

    cancel: CancelHandle,
}

impl Engine {
    pub fn new(default_policy: CachePolicy, share: bool) -> Self {
        Self {
            caches: HashMap::new(),
            pending: HashMap::new(),
            policies: HashMap::new(),
            default_policy,
            share,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.take() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The configured chunk cache limits of a variable
    pub fn chunk_cache(&self, id: VariableId) -> CachePolicy {
        self.policies
            .get(&id)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Change the chunk cache limits of a variable, writing back any dirty chunks that no
    /// longer fit.
    ///
    pub fn set_chunk_cache(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        policy: CachePolicy,
    ) -> Result<()> {
        ctx.schema.variable(id)?;
        self.policies.insert(id, policy);
        let effective = self.effective_policy(id);
        let evicted = match self.caches.get_mut(&id) {
            Some(cache) => {
                let evicted = cache.set_policy(effective);
                debug!(
                    variable = %ctx.schema.variable(id)?.name,
                    chunks = cache.len(),
                    bytes = cache.size(),
                    evicted = evicted.len(),
                    "resized chunk cache"
                );
                evicted
            }
            None => vec![],
        };

        self.write_back(ctx, id, evicted)
    }

    fn effective_policy(&self, id: VariableId) -> CachePolicy {
        if self.share {
            CachePolicy::DISABLED
        } else {
            self.chunk_cache(id)
        }
    }

    /// Write every dirty chunk back to the store. Chunks stay cached.
    ///
    pub fn flush(&mut self, ctx: &mut Context) -> Result<()> {
        let mut flushed = 0;
        for (id, chunks) in self.pending.iter_mut() {
            while let Some((key, chunk)) = chunks.pop_first() {
                if let Err(err) = write_chunk(ctx, *id, &key, &chunk.bytes) {
                    chunks.insert(key, chunk);
                    return Err(err);
                }
                flushed += 1;
            }
        }
        self.pending.clear();

        for (id, cache) in self.caches.iter_mut() {
            for (key, chunk) in cache.iter_mut() {
                if chunk.dirty {
                    write_chunk(ctx, *id, key, &chunk.bytes)?;
                    chunk.dirty = false;
                    flushed += 1;
                }
            }
        }
        if flushed > 0 {
            debug!(chunks = flushed, "flushed dirty chunks");
        }

        Ok(())
    }

    /// Drop every cached chunk, dirty or not
    pub fn discard(&mut self) {
        let mut dropped: usize = self.pending.drain().map(|(_, chunks)| chunks.len()).sum();
        for (_, mut cache) in self.caches.drain() {
            dropped += cache.drain().into_iter().filter(|(_, chunk)| chunk.dirty).count();
        }
        if dropped > 0 {
            debug!(chunks = dropped, "discarded unwritten chunks");
        }
    }

    /// Give a variable whose storage properties changed a fresh physical layout.
    ///
    /// A contiguous variable gets a new block, prefilled with its fill value. A chunked variable
    /// starts with an empty chunk index. Variables with data are never touched.
    ///
    pub fn initialize_layout(&mut self, ctx: &mut Context, id: VariableId) -> Result<()> {
        let variable = ctx.schema.variable(id)?;
        let needs_block = variable.storage == Storage::Contiguous && variable.block.is_none();
        if variable.written || !(variable.layout_stale || needs_block) {
            return Ok(());
        }

        self.caches.remove(&id);
        self.pending.remove(&id);
        let block = match variable.storage {
            Storage::Contiguous => {
                let count = elements(&ctx.schema.shape_of(id)?);
                let fill = variable.fill_bytes().repeat(count);
                let block = ctx.store.allocate(fill.len() as u64)?;
                ctx.store.write(block, 0, &fill)?;
                Some(block)
            }
            Storage::Chunked(_) => None,
        };

        let variable = ctx.schema.variable_mut(id)?;
        variable.block = block;
        variable.chunks.clear();
        variable.layout_stale = false;

        Ok(())
    }

    /// Check a request against the variable's current shape.
    ///
    /// Reads must stay within the current shape. Writes may run past the end of unlimited
    /// dimensions, which are grown to fit.
    ///
    fn prepare(
        &self,
        schema: &Schema,
        id: VariableId,
        selection: &Selection,
        write: bool,
    ) -> Result<Transfer> {
        let variable = schema.variable(id)?;
        let shape = schema.shape_of(id)?;
        let slab = selection.resolve(&shape)?;

        let mut growth = vec![];
        for (axis, dimension) in variable.dimensions.iter().enumerate() {
            let length = shape[axis];
            let end = slab.extent(axis).max(slab.start[axis]);
            if end <= length {
                continue;
            }
            if write && schema.dimension(*dimension)?.unlimited {
                growth.push((*dimension, slab.extent(axis)));
                continue;
            }

            return Err(Error::OutOfBounds(format!(
                "axis {axis} of {}: selection ends at {end}, length is {length}",
                variable.name
            )));
        }

        if !growth.is_empty() {
            let mut grown = shape.clone();
            for (axis, dimension) in variable.dimensions.iter().enumerate() {
                if let Some((_, extent)) = growth.iter().find(|(grow, _)| grow == dimension) {
                    grown[axis] = *extent;
                }
            }
            let bytes = checked_elements(&grown)
                .and_then(|count| count.checked_mul(variable.dtype.stored_size()))
                .filter(|bytes| *bytes <= isize::MAX as usize);
            if bytes.is_none() {
                return Err(Error::OutOfBounds(format!(
                    "{} cannot grow to {grown:?}",
                    variable.name
                )));
            }
        }

        Ok(Transfer { slab, growth })
    }

    /// Apply the side effects of a validated write: grown dimensions and a frozen layout
    ///
    fn begin_write(&mut self, ctx: &mut Context, id: VariableId, transfer: &Transfer) -> Result<()> {
        for (dimension, extent) in &transfer.growth {
            let dimension = ctx.schema.dimension_mut(*dimension)?;
            dimension.length = dimension.length.max(*extent);
        }
        self.initialize_layout(ctx, id)?;
        ctx.schema.variable_mut(id)?.written = true;

        Ok(())
    }

    pub fn read<T: Element>(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        selection: &Selection,
    ) -> Result<ArrayD<T>> {
        let variable = ctx.schema.variable(id)?;
        check_element::<T>(variable.dtype)?;
        let order = variable.endianness.resolve();
        let transfer = self.prepare(ctx.schema, id, selection, false)?;

        let bytes = self.read_bytes(ctx, id, &transfer.slab)?;
        let values = decode::<T>(&bytes, order);

        into_array(&transfer.slab, values)
    }

    pub fn write<T: Element>(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        selection: &Selection,
        values: &[T],
    ) -> Result<()> {
        let variable = ctx.schema.variable(id)?;
        check_element::<T>(variable.dtype)?;
        let order = variable.endianness.resolve();
        let transfer = self.prepare(ctx.schema, id, selection, true)?;
        check_len(&transfer.slab, values.len())?;

        self.begin_write(ctx, id, &transfer)?;
        self.write_bytes(ctx, id, &transfer.slab, &encode(values, order))
    }

    pub fn read_strings(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        selection: &Selection,
    ) -> Result<ArrayD<String>> {
        let variable = ctx.schema.variable(id)?;
        check_strings(variable.dtype)?;
        let fill = if variable.no_fill {
            String::new()
        } else {
            variable
                .fill_value()
                .as_strings()
                .and_then(|values| values.first().cloned())
                .unwrap_or_default()
        };
        let transfer = self.prepare(ctx.schema, id, selection, false)?;

        let handles = self.read_bytes(ctx, id, &transfer.slab)?;
        let mut values = Vec::with_capacity(transfer.slab.len());
        for handle in decode::<u64>(&handles, ByteOrder::Little) {
            let value = match handle {
                0 => fill.clone(),
                block => read_string(ctx.store, block)?,
            };
            values.push(value);
        }

        into_array(&transfer.slab, values)
    }

    /// Write variable length strings. Each element is stored in its own block, which is reused
    /// when the element is overwritten.
    ///
    pub fn write_strings<S: AsRef<str>>(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        selection: &Selection,
        values: &[S],
    ) -> Result<()> {
        check_strings(ctx.schema.variable(id)?.dtype)?;
        let transfer = self.prepare(ctx.schema, id, selection, true)?;
        check_len(&transfer.slab, values.len())?;

        self.begin_write(ctx, id, &transfer)?;
        let existing = self.read_bytes(ctx, id, &transfer.slab)?;
        let mut handles = decode::<u64>(&existing, ByteOrder::Little);
        for (handle, value) in handles.iter_mut().zip(values) {
            let value = value.as_ref().as_bytes();
            let mut content = Vec::with_capacity(HANDLE_WIDTH + value.len());
            content.extend_from_slice(&(value.len() as u64).to_le_bytes());
            content.extend_from_slice(value);
            if *handle == 0 {
                *handle = ctx.store.allocate(content.len() as u64)?;
            }
            ctx.store.write(*handle, 0, &content)?;
        }

        self.write_bytes(ctx, id, &transfer.slab, &encode(&handles, ByteOrder::Little))
    }

    /// Read the stored bytes of the selected elements into a dense row-major buffer
    ///
    fn read_bytes(&mut self, ctx: &mut Context, id: VariableId, slab: &Hyperslab) -> Result<Vec<u8>> {
        let variable = ctx.schema.variable(id)?;
        let width = variable.dtype.stored_size();
        let mut buffer = vec![0; slab.len() * width];
        if slab.is_empty() {
            return Ok(buffer);
        }
        let dense = Placement::dense(&slab.count);

        match variable.storage.clone() {
            Storage::Contiguous => {
                self.check_cancelled()?;
                let shape = ctx.schema.shape_of(id)?;
                let block = match variable.block {
                    Some(block) => block,
                    None => return Ok(variable.fill_bytes().repeat(slab.len())),
                };
                let (first, end) = slab.span(&shape);
                let extent = ctx.store.read(
                    block,
                    (first * width) as u64,
                    ((end - first) * width) as u64,
                )?;
                let from = Placement::new(&shape, &slab.start, &slab.stride).shifted(first);
                copy_elements(&slab.count, width, &extent, &from, &mut buffer, &dense);
            }
            Storage::Chunked(chunk_shape) => {
                let unit = vec![1; slab.rank()];
                for piece in chunk_pieces(slab, &chunk_shape) {
                    self.check_cancelled()?;
                    let chunk = self.fetch(ctx, id, &piece.chunk, &chunk_shape)?;
                    let from = Placement::new(&chunk_shape, &piece.local, &slab.stride);
                    let to = Placement::new(&slab.count, &piece.first, &unit);
                    copy_elements(&piece.count, width, &chunk.bytes, &from, &mut buffer, &to);
                    self.store_back(ctx, id, piece.chunk, chunk)?;
                }
            }
        }

        Ok(buffer)
    }

    /// Write a dense row-major buffer of stored bytes to the selected elements
    ///
    fn write_bytes(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        slab: &Hyperslab,
        bytes: &[u8],
    ) -> Result<()> {
        let variable = ctx.schema.variable(id)?;
        let width = variable.dtype.stored_size();
        if slab.is_empty() {
            return Ok(());
        }
        let dense = Placement::dense(&slab.count);

        match variable.storage.clone() {
            Storage::Contiguous => {
                self.check_cancelled()?;
                let shape = ctx.schema.shape_of(id)?;
                let block = variable.block.ok_or_else(|| {
                    Error::Format(format!("{} has no data block", variable.name))
                })?;
                let (first, end) = slab.span(&shape);
                let offset = (first * width) as u64;
                let length = (end - first) * width;
                let mut extent = if slab.len() == end - first {
                    vec![0; length]
                } else {
                    ctx.store.read(block, offset, length as u64)?
                };
                let to = Placement::new(&shape, &slab.start, &slab.stride).shifted(first);
                copy_elements(&slab.count, width, bytes, &dense, &mut extent, &to);
                ctx.store.write(block, offset, &extent)?;
            }
            Storage::Chunked(chunk_shape) => {
                let unit = vec![1; slab.rank()];
                for piece in chunk_pieces(slab, &chunk_shape) {
                    self.check_cancelled()?;
                    let mut chunk = self.fetch(ctx, id, &piece.chunk, &chunk_shape)?;
                    let from = Placement::new(&slab.count, &piece.first, &unit);
                    let to = Placement::new(&chunk_shape, &piece.local, &slab.stride);
                    copy_elements(&piece.count, width, bytes, &from, &mut chunk.bytes, &to);
                    chunk.dirty = true;
                    self.store_back(ctx, id, piece.chunk, chunk)?;
                }
            }
        }

        Ok(())
    }

    /// Take a chunk out of the cache, or load it from the store, or make a fresh one filled with
    /// the fill value.
    ///
    fn fetch(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        key: &ChunkKey,
        chunk_shape: &[usize],
    ) -> Result<ChunkBuffer> {
        if let Some(chunk) = self.caches.get_mut(&id).and_then(|cache| cache.remove(key)) {
            return Ok(chunk);
        }
        if let Some(chunk) = self.pending.get_mut(&id).and_then(|chunks| chunks.remove(key)) {
            return Ok(chunk);
        }

        let variable = ctx.schema.variable(id)?;
        let width = variable.dtype.stored_size();
        let expected = elements(chunk_shape) * width;
        let bytes = match variable.chunks.get(key) {
            Some(entry) => {
                let encoded = ctx.store.read(entry.block, 0, entry.len)?;
                let bytes = variable.filters.decode(ctx.codecs, encoded, width)?;
                if bytes.len() != expected {
                    return Err(Error::Compression(format!(
                        "chunk {key:?} of {} decoded to {} bytes, expected {expected}",
                        variable.name,
                        bytes.len()
                    )));
                }
                bytes
            }
            None => variable.fill_bytes().repeat(elements(chunk_shape)),
        };

        Ok(ChunkBuffer {
            bytes,
            dirty: false,
        })
    }

    /// Return a chunk to the cache, writing back whatever dirty chunks that evicts
    ///
    fn store_back(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        key: ChunkKey,
        chunk: ChunkBuffer,
    ) -> Result<()> {
        let policy = self.effective_policy(id);
        let evicted = self
            .caches
            .entry(id)
            .or_insert_with(|| Cache::new(policy))
            .insert(key, chunk);

        self.write_back(ctx, id, evicted)
    }

    /// Write evicted dirty chunks to the store.
    ///
    /// After the first failure nothing more is written. The failed chunk and the rest are kept
    /// as pending, so no acknowledged data is lost.
    ///
    fn write_back(
        &mut self,
        ctx: &mut Context,
        id: VariableId,
        evicted: Vec<(ChunkKey, ChunkBuffer)>,
    ) -> Result<()> {
        let mut result = Ok(());
        for (key, chunk) in evicted {
            if !chunk.dirty {
                continue;
            }
            if result.is_ok() {
                match write_chunk(ctx, id, &key, &chunk.bytes) {
                    Ok(()) => continue,
                    Err(err) => result = Err(err),
                }
            }
            self.pending.entry(id).or_default().insert(key, chunk);
        }

        result
    }
}

/// Encode a chunk and write it to its block, allocating one for a chunk not stored before
///
fn write_chunk(ctx: &mut Context, id: VariableId, key: &ChunkKey, bytes: &[u8]) -> Result<()> {
    let variable = ctx.schema.variable(id)?;
    let width = variable.dtype.stored_size();
    let encoded = variable.filters.encode(ctx.codecs, bytes.to_vec(), width)?;
    let block = match variable.chunks.get(key) {
        Some(entry) => entry.block,
        None => ctx.store.allocate(encoded.len() as u64)?,
    };
    ctx.store.write(block, 0, &encoded)?;
    debug!(variable = %variable.name, chunk = ?key, block, bytes = encoded.len(), "wrote chunk");

    let len = encoded.len() as u64;
    ctx.schema
        .variable_mut(id)?
        .chunks
        .insert(key.clone(), ChunkEntry { block, len });

    Ok(())
}

fn read_string(store: &dyn BlockStore, block: BlockId) -> Result<String> {
    let mut header = [0; HANDLE_WIDTH];
    header.copy_from_slice(&store.read(block, 0, HANDLE_WIDTH as u64)?);
    let length = u64::from_le_bytes(header);
    let bytes = store.read(block, HANDLE_WIDTH as u64, length)?;

    String::from_utf8(bytes).map_err(|err| Error::Format(format!("bad string in block {block}: {err}")))
}

fn check_strings(dtype: NcType) -> Result<()> {
    if dtype == NcType::String {
        Ok(())
    } else {
        Err(Error::TypeMismatch {
            expected: dtype,
            found: NcType::String,
        })
    }
}

fn check_len(slab: &Hyperslab, len: usize) -> Result<()> {
    if slab.len() == len {
        Ok(())
    } else {
        Err(Error::ShapeMismatch(format!(
            "selection has {} elements, buffer has {len}",
            slab.len()
        )))
    }
}

fn into_array<T>(slab: &Hyperslab, values: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(&slab.count), values)
        .map_err(|err| Error::ShapeMismatch(err.to_string()))
}
