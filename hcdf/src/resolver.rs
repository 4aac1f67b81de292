use std::io::{Cursor, ErrorKind};

use tracing::debug;

use crate::{
    codec::{CodecRegistry, StandardCodecs},
    errors::{Error, Result},
    extio::{ExtendedRead, ExtendedWrite, Serialize},
    schema::Schema,
    store::{BlockId, BlockStore},
};

const MAGIC_NUMBER: u32 = 0x4843_4446; // "HCDF"
const FORMAT_VERSION: u32 = 1;

const SUPERBLOCK: BlockId = 0;
const METADATA_SLOTS: [BlockId; 2] = [1, 2];

/// magic + version + active slot + image length + checksum
const SUPERBLOCK_LEN: u64 = 4 + 4 + 8 + 8 + 4;

/// Persists and loads schema images.
///
/// Block 0 of the store is a superblock naming the block that holds the current schema image.
/// Images alternate between two metadata blocks: a commit writes the new image into the slot
/// that is not current, flushes, and only then rewrites the superblock to point at it. A reader
/// therefore sees either the previous image or the new one, never a partially written one.
///
pub(crate) struct Resolver {
    store: Box<dyn BlockStore>,
    active: Option<BlockId>,
}

impl Resolver {
    /// Prepare a store for a new dataset.
    ///
    /// An empty store has its superblock and metadata blocks allocated. A store that already
    /// holds a dataset is reused if `clobber` is set, its old data is abandoned by the next
    /// commit, which still goes to the slot the superblock does not name. Otherwise fails with
    /// `Error::Exists`.
    ///
    pub fn init(mut store: Box<dyn BlockStore>, clobber: bool) -> Result<Self> {
        let mut active = None;
        match store.read(SUPERBLOCK, 0, 0) {
            Ok(_) => {
                if !clobber {
                    return Err(Error::Exists);
                }
                for block in METADATA_SLOTS {
                    store.read(block, 0, 0)?;
                }
                active = current_slot(store.as_ref());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                for expected in [SUPERBLOCK, METADATA_SLOTS[0], METADATA_SLOTS[1]] {
                    let block = store.allocate(SUPERBLOCK_LEN)?;
                    if block != expected {
                        return Err(Error::Format(format!(
                            "store allocated block {block}, expected {expected}"
                        )));
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self { store, active })
    }

    /// Open an existing dataset, returning the last committed schema
    ///
    pub fn load(store: Box<dyn BlockStore>) -> Result<(Self, Schema)> {
        let superblock = store.read(SUPERBLOCK, 0, SUPERBLOCK_LEN).map_err(|err| {
            if err.kind() == ErrorKind::NotFound || err.kind() == ErrorKind::UnexpectedEof {
                Error::Format(String::from("missing superblock"))
            } else {
                Error::BlockStore(err)
            }
        })?;
        let mut stream = Cursor::new(superblock);
        let magic_number = stream.read_u32()?;
        if magic_number != MAGIC_NUMBER {
            return Err(Error::Format(format!("bad magic number {magic_number:#010x}")));
        }
        let version = stream.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!("unsupported format version {version}")));
        }
        let active = stream.read_u64()?;
        if !METADATA_SLOTS.contains(&active) {
            return Err(Error::Format(format!("bad metadata block {active}")));
        }
        let length = stream.read_u64()?;
        let checksum = stream.read_u32()?;

        let image = store.read(active, 0, length)?;
        if StandardCodecs.fletcher32(&image) != checksum {
            return Err(Error::Format(String::from("schema image checksum mismatch")));
        }
        let schema = Schema::read_from(&mut Cursor::new(image))?;
        debug!(block = active, bytes = length, "loaded schema image");

        Ok((
            Self {
                store,
                active: Some(active),
            },
            schema,
        ))
    }

    /// Atomically replace the committed schema with `schema`.
    ///
    /// On failure the previously committed image stays current.
    ///
    pub fn commit(&mut self, schema: &Schema) -> Result<()> {
        let mut image: Vec<u8> = vec![];
        schema.write_to(&mut image)?;
        let target = match self.active {
            Some(block) if block == METADATA_SLOTS[0] => METADATA_SLOTS[1],
            _ => METADATA_SLOTS[0],
        };
        self.store.write(target, 0, &image)?;
        self.store.flush()?;

        let mut superblock: Vec<u8> = Vec::with_capacity(SUPERBLOCK_LEN as usize);
        superblock.write_u32(MAGIC_NUMBER)?;
        superblock.write_u32(FORMAT_VERSION)?;
        superblock.write_u64(target)?;
        superblock.write_u64(image.len() as u64)?;
        superblock.write_u32(StandardCodecs.fletcher32(&image))?;
        self.store.write(SUPERBLOCK, 0, &superblock)?;
        self.store.flush()?;

        self.active = Some(target);
        debug!(block = target, bytes = image.len(), "committed schema image");

        Ok(())
    }

    pub fn store(&mut self) -> &mut dyn BlockStore {
        self.store.as_mut()
    }

    pub fn location(&self) -> Option<String> {
        self.store.location()
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.close()?;

        Ok(())
    }
}

/// The metadata slot a readable superblock points at, if any
fn current_slot(store: &dyn BlockStore) -> Option<BlockId> {
    let superblock = store.read(SUPERBLOCK, 0, SUPERBLOCK_LEN).ok()?;
    let mut stream = Cursor::new(superblock);
    if stream.read_u32().ok()? != MAGIC_NUMBER || stream.read_u32().ok()? != FORMAT_VERSION {
        return None;
    }
    let active = stream.read_u64().ok()?;

    METADATA_SLOTS.contains(&active).then_some(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        attribute::Scope, dimension::Length, group::GroupId, store::MemoryStore,
        testing::FailingStore, types::NcType,
    };

    fn schema() -> Result<Schema> {
        let mut schema = Schema::new(false);
        let time = schema.define_dimension(GroupId::ROOT, "time", Length::Unlimited)?;
        let v = schema.define_variable(GroupId::ROOT, "v", NcType::Double, &[time], false)?;
        schema.put_attribute(v.into(), "units", "s".into())?;
        schema.variable_mut(v)?.layout_stale = false;

        Ok(schema)
    }

    #[test]
    fn test_commit_load() -> Result<()> {
        let store = MemoryStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        let schema = schema()?;
        resolver.commit(&schema)?;
        assert_eq!(store.block_count(), 3);

        let (_, loaded) = Resolver::load(Box::new(store.clone()))?;
        assert_eq!(loaded, schema);

        Ok(())
    }

    #[test]
    fn test_commits_alternate() -> Result<()> {
        let store = MemoryStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        let mut schema = schema()?;
        resolver.commit(&schema)?;
        assert_eq!(resolver.active, Some(1));

        schema.put_attribute(Scope::GLOBAL, "title", "second".into())?;
        resolver.commit(&schema)?;
        assert_eq!(resolver.active, Some(2));

        // A shorter image overwrites the start of a longer one
        let short = Schema::new(false);
        resolver.commit(&short)?;
        assert_eq!(resolver.active, Some(1));

        let (resolver, loaded) = Resolver::load(Box::new(store))?;
        assert_eq!(loaded, short);
        assert_eq!(resolver.active, Some(1));

        Ok(())
    }

    #[test]
    fn test_failed_commit_keeps_previous() -> Result<()> {
        let store = FailingStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        let schema = schema()?;
        resolver.commit(&schema)?;

        store.fail_writes(true);
        let mut changed = schema.clone();
        changed.put_attribute(Scope::GLOBAL, "title", "lost".into())?;
        assert!(matches!(resolver.commit(&changed), Err(Error::BlockStore(_))));

        let (_, loaded) = Resolver::load(Box::new(store.clone()))?;
        assert_eq!(loaded, schema);

        // A retry after the fault clears succeeds
        store.fail_writes(false);
        resolver.commit(&changed)?;
        let (_, loaded) = Resolver::load(Box::new(store))?;
        assert_eq!(loaded, changed);

        Ok(())
    }

    #[test]
    fn test_init_existing() -> Result<()> {
        let store = MemoryStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        resolver.commit(&schema()?)?;

        assert!(matches!(
            Resolver::init(Box::new(store.clone()), false),
            Err(Error::Exists)
        ));

        let mut resolver = Resolver::init(Box::new(store.clone()), true)?;
        resolver.commit(&Schema::new(true))?;
        let (_, loaded) = Resolver::load(Box::new(store))?;
        assert!(loaded.classic_model);
        assert!(loaded.variables.is_empty());

        Ok(())
    }

    #[test]
    fn test_clobber_spares_live_image() -> Result<()> {
        let store = MemoryStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        let schema = schema()?;
        resolver.commit(&schema)?;
        let mut image: Vec<u8> = vec![];
        schema.write_to(&mut image)?;

        let mut resolver = Resolver::init(Box::new(store.clone()), true)?;
        assert_eq!(resolver.active, Some(1));
        resolver.commit(&Schema::new(true))?;
        assert_eq!(resolver.active, Some(2));
        assert_eq!(store.read(1, 0, image.len() as u64)?, image);

        // A clobbered store with an unreadable superblock starts from the first slot
        let mut damaged = store.clone();
        damaged.write(SUPERBLOCK, 0, &[0; 4])?;
        let resolver = Resolver::init(Box::new(damaged), true)?;
        assert_eq!(resolver.active, None);

        Ok(())
    }

    #[test]
    fn test_load_garbage() -> Result<()> {
        let mut store = MemoryStore::new();
        assert!(matches!(
            Resolver::load(Box::new(store.clone())),
            Err(Error::Format(_))
        ));

        let block = store.allocate(0)?;
        store.write(block, 0, &[0xFF; SUPERBLOCK_LEN as usize])?;
        assert!(matches!(
            Resolver::load(Box::new(store)),
            Err(Error::Format(_))
        ));

        Ok(())
    }

    #[test]
    fn test_load_corrupt_image() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut resolver = Resolver::init(Box::new(store.clone()), false)?;
        resolver.commit(&schema()?)?;
        store.write(1, 3, &[0xAB])?;

        assert!(matches!(
            Resolver::load(Box::new(store)),
            Err(Error::Format(_))
        ));

        Ok(())
    }
}
