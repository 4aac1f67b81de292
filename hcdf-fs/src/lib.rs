//! A `hcdf::BlockStore` that keeps each block in its own file under a directory.
//!
//! Also provides path based `create` and `open`, which is the usual way to get at a dataset on
//! disk.
//!
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use hcdf::{BlockId, BlockStore, Config, Dataset, Error};

const EXTENSION: &str = "blk";

/// Blocks stored as `{id:016x}.blk` files in a directory
pub struct FileStore {
    root: PathBuf,
    writable: bool,

    /// Next id `allocate` will hand out
    next: BlockId,

    /// Open file handles, so repeated access doesn't reopen
    files: Mutex<HashMap<BlockId, File>>,

    /// Blocks written since the last flush
    dirty: HashSet<BlockId>,
}

impl FileStore {
    /// Create an empty store at `root`, creating the directory if needed.
    ///
    /// Fails with `ErrorKind::AlreadyExists` if the directory already holds blocks.
    ///
    pub fn create<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        if !block_ids(&root)?.is_empty() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already holds blocks", root.display()),
            ));
        }

        Ok(Self::new(root, true, 0))
    }

    /// Open the existing store at `root`
    pub fn open<P: AsRef<Path>>(root: P, writable: bool) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let next = block_ids(&root)?.into_iter().max().map_or(0, |id| id + 1);

        Ok(Self::new(root, writable, next))
    }

    fn new(root: PathBuf, writable: bool, next: BlockId) -> Self {
        Self {
            root,
            writable,
            next,
            files: Mutex::new(HashMap::new()),
            dirty: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, block: BlockId) -> PathBuf {
        self.root.join(format!("{block:016x}.{EXTENSION}"))
    }

    /// Run `f` against the open file for `block`, opening it first if necessary
    fn with_file<T>(&self, block: BlockId, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(&block) {
            let file = OpenOptions::new()
                .read(true)
                .write(self.writable)
                .open(self.path_for(block))?;
            files.insert(block, file);
        }
        match files.get_mut(&block) {
            Some(file) => f(file),
            None => Err(io::Error::new(ErrorKind::NotFound, format!("block {block}"))),
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is open read only", self.root.display()),
            ))
        }
    }
}

impl BlockStore for FileStore {
    fn allocate(&mut self, size_hint: u64) -> io::Result<BlockId> {
        self.check_writable()?;
        let block = self.next;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path_for(block))?;
        self.files.lock().insert(block, file);
        self.dirty.insert(block);
        self.next += 1;
        debug!(block, size_hint, "allocated block file");

        Ok(block)
    }

    fn read(&self, block: BlockId, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        self.with_file(block, |file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0; length as usize];
            file.read_exact(&mut buffer)?;

            Ok(buffer)
        })
    }

    fn write(&mut self, block: BlockId, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.check_writable()?;
        self.with_file(block, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)
        })?;
        self.dirty.insert(block);

        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut files = self.files.lock();
        let mut blocks: Vec<BlockId> = self.dirty.iter().copied().collect();
        blocks.sort_unstable();
        for block in blocks {
            if let Some(file) = files.get_mut(&block) {
                file.sync_all()?;
            }
            // Only forget a block once it is durable, so a failed flush is retried in full
            self.dirty.remove(&block);
        }

        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.writable {
            self.flush()?;
        }
        self.files.lock().clear();

        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }
}

/// Ids of the block files under `root`
fn block_ids(root: &Path) -> io::Result<Vec<BlockId>> {
    let mut ids = vec![];
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| BlockId::from_str_radix(stem, 16).ok());
        if let Some(id) = id {
            ids.push(id);
        }
    }

    Ok(ids)
}

/// Create a dataset in the directory at `path`.
///
/// If the directory already holds a dataset it is deleted when `config.clobber` is set,
/// otherwise this fails with `Error::Exists`.
///
pub fn create<P: AsRef<Path>>(path: P, config: Config) -> hcdf::Result<Dataset> {
    let path = path.as_ref();
    if path.exists() && !block_ids(path)?.is_empty() {
        if !config.clobber {
            return Err(Error::Exists);
        }
        fs::remove_dir_all(path)?;
        info!(path = %path.display(), "removed existing dataset");
    }

    Dataset::create(FileStore::create(path)?, config)
}

/// Open the dataset in the directory at `path`, for writing if `config.write` is set.
///
pub fn open<P: AsRef<Path>>(path: P, config: Config) -> hcdf::Result<Dataset> {
    let store = FileStore::open(path, config.write)?;

    Dataset::open(store, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    use hcdf::{GroupId, Length, NcType, Selection, Storage};
    use ndarray::arr2;
    use tempfile::tempdir;

    #[test]
    fn test_blocks() -> io::Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::create(dir.path())?;
        assert_eq!(store.allocate(0)?, 0);
        assert_eq!(store.allocate(0)?, 1);

        store.write(1, 4, b"data")?;
        assert_eq!(store.read(1, 0, 8)?, b"\0\0\0\0data");
        assert_eq!(store.read(1, 6, 2)?, b"ta");
        assert_eq!(store.read(0, 0, 1).unwrap_err().kind(), ErrorKind::UnexpectedEof);
        assert_eq!(store.read(2, 0, 0).unwrap_err().kind(), ErrorKind::NotFound);
        store.close()?;

        let mut store = FileStore::open(dir.path(), true)?;
        assert_eq!(store.allocate(0)?, 2);
        assert_eq!(store.read(1, 4, 4)?, b"data");
        assert_eq!(store.location(), Some(dir.path().display().to_string()));

        assert_eq!(
            FileStore::create(dir.path()).err().map(|err| err.kind()),
            Some(ErrorKind::AlreadyExists)
        );

        Ok(())
    }

    #[test]
    fn test_flush_forgets_synced_blocks() -> io::Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::create(dir.path())?;
        let first = store.allocate(0)?;
        let second = store.allocate(0)?;
        store.write(second, 0, b"kept")?;
        assert_eq!(store.dirty.len(), 2);

        store.flush()?;
        assert!(store.dirty.is_empty());

        store.write(first, 0, b"again")?;
        assert_eq!(store.dirty.iter().copied().collect::<Vec<_>>(), vec![first]);
        store.flush()?;
        assert!(store.dirty.is_empty());
        assert_eq!(store.read(second, 0, 4)?, b"kept");

        Ok(())
    }

    #[test]
    fn test_read_only_store() -> io::Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::create(dir.path())?;
        store.allocate(0)?;
        store.close()?;

        let mut store = FileStore::open(dir.path(), false)?;
        assert_eq!(
            store.write(0, 0, b"x").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            store.allocate(0).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        Ok(())
    }

    #[test]
    fn test_dataset_round_trip() -> hcdf::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("forecast.hcdf");

        let mut dataset = create(&path, Config::default())?;
        let time = dataset.define_dimension(GroupId::ROOT, "time", Length::Unlimited)?;
        let x = dataset.define_dimension(GroupId::ROOT, "x", Length::Fixed(3))?;
        let t = dataset.define_variable(GroupId::ROOT, "t", NcType::Double, &[time, x])?;
        dataset.set_chunking(t, Storage::Chunked(vec![2, 3]))?;
        dataset.set_compression(t, true, Some(4))?;
        dataset.put_attribute(t, "units", "K")?;
        dataset.leave_define()?;
        dataset.write_slab(t, &[0, 0], &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert_eq!(dataset.path(), Some(path.display().to_string()));
        dataset.close()?;

        let mut dataset = open(&path, Config::read_only())?;
        let t = dataset.variable(GroupId::ROOT, "t")?;
        assert_eq!(dataset.attribute_text(t, "units")?, "K");
        assert_eq!(
            dataset.read::<f64>(t, &Selection::All)?,
            arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn()
        );
        dataset.close()
    }

    #[test]
    fn test_clobber() -> hcdf::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data");
        let mut dataset = create(&path, Config::default())?;
        dataset.define_dimension(GroupId::ROOT, "x", Length::Fixed(3))?;
        dataset.close()?;

        let noclobber = Config {
            clobber: false,
            ..Config::default()
        };
        assert!(matches!(create(&path, noclobber), Err(Error::Exists)));

        create(&path, Config::default())?.close()?;
        let dataset = open(&path, Config::default())?;
        assert!(dataset.dimension(GroupId::ROOT, "x").is_err());

        Ok(())
    }

    #[test]
    fn test_open_missing() -> io::Result<()> {
        let dir = tempdir()?;
        assert!(matches!(
            open(dir.path().join("nope"), Config::default()),
            Err(Error::BlockStore(_))
        ));
        assert!(matches!(
            open(dir.path(), Config::default()),
            Err(Error::Format(_))
        ));

        Ok(())
    }
}
