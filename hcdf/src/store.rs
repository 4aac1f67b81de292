use std::{
    io::{self, ErrorKind},
    sync::Arc,
};

use parking_lot::Mutex;

/// Identifier of a block in a `BlockStore`
pub type BlockId = u64;

/// A trait for storing and loading numbered byte blocks in an arbitrary physical container.
///
/// Block ids are handed out by `allocate` in increasing order starting at 0. Blocks grow as
/// needed when written past their current end. All calls are blocking; implementations own
/// whatever locking their physical format requires.
///
pub trait BlockStore: Send {
    /// Allocate a new, empty block.
    ///
    /// `size_hint` is the expected size of the block in bytes, implementations may use it to
    /// preallocate space.
    ///
    fn allocate(&mut self, size_hint: u64) -> io::Result<BlockId>;

    /// Read `length` bytes starting at `offset` in `block`.
    ///
    /// Should fail with `ErrorKind::NotFound` if the block has never been allocated and with
    /// `ErrorKind::UnexpectedEof` if the requested range runs past the end of the block.
    ///
    fn read(&self, block: BlockId, offset: u64, length: u64) -> io::Result<Vec<u8>>;

    /// Write `bytes` at `offset` in `block`, growing the block if necessary.
    ///
    fn write(&mut self, block: BlockId, offset: u64, bytes: &[u8]) -> io::Result<()>;

    /// Make all previous writes durable
    fn flush(&mut self) -> io::Result<()>;

    /// Flush and release any resources held by the store
    fn close(&mut self) -> io::Result<()>;

    /// A human readable description of where the store keeps its data, if any
    fn location(&self) -> Option<String> {
        None
    }
}

/// A `BlockStore` that keeps all blocks in RAM.
///
/// Cloning a `MemoryStore` yields another handle to the same blocks, which allows a dataset to be
/// reopened, or read from several handles at once, for as long as any handle is alive.
///
#[derive(Clone, Default)]
pub struct MemoryStore {
    blocks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks allocated so far
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Total number of bytes stored in all blocks
    pub fn size(&self) -> u64 {
        self.blocks
            .lock()
            .iter()
            .map(|block| block.len() as u64)
            .sum()
    }
}

fn not_found(block: BlockId) -> io::Error {
    io::Error::new(ErrorKind::NotFound, format!("no such block: {block}"))
}

impl BlockStore for MemoryStore {
    fn allocate(&mut self, size_hint: u64) -> io::Result<BlockId> {
        let mut blocks = self.blocks.lock();
        let block = blocks.len() as BlockId;
        blocks.push(Vec::with_capacity(size_hint as usize));

        Ok(block)
    }

    fn read(&self, block: BlockId, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let blocks = self.blocks.lock();
        let bytes = blocks.get(block as usize).ok_or_else(|| not_found(block))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > bytes.len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("read past end of block {block}: {end} > {}", bytes.len()),
            ));
        }

        Ok(bytes[start..end].to_vec())
    }

    fn write(&mut self, block: BlockId, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut blocks = self.blocks.lock();
        let bytes = blocks
            .get_mut(block as usize)
            .ok_or_else(|| not_found(block))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);

        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_read_write() -> io::Result<()> {
        let mut store = MemoryStore::new();
        assert_eq!(store.allocate(0)?, 0);
        assert_eq!(store.allocate(16)?, 1);

        store.write(1, 4, &[1, 2, 3])?;
        assert_eq!(store.read(1, 0, 7)?, vec![0, 0, 0, 0, 1, 2, 3]);
        assert_eq!(store.read(1, 5, 2)?, vec![2, 3]);
        assert_eq!(store.read(0, 0, 0)?, Vec::<u8>::new());

        store.write(1, 0, &[9])?;
        assert_eq!(store.read(1, 0, 2)?, vec![9, 0]);

        Ok(())
    }

    #[test]
    fn test_read_errors() -> io::Result<()> {
        let mut store = MemoryStore::new();
        store.allocate(0)?;
        store.write(0, 0, &[1, 2])?;

        let err = store.read(0, 1, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let err = store.read(3, 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = store.write(3, 0, &[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        Ok(())
    }

    #[test]
    fn test_clones_share_blocks() -> io::Result<()> {
        let mut store = MemoryStore::new();
        let other = store.clone();
        let block = store.allocate(0)?;
        store.write(block, 0, b"shared")?;

        assert_eq!(other.read(block, 0, 6)?, b"shared".to_vec());
        assert_eq!(other.block_count(), 1);
        assert_eq!(other.size(), 6);

        Ok(())
    }
}
