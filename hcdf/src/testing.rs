use std::{
    io::{self, ErrorKind},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ndarray::Array2;
use parking_lot::Mutex;
use rand::{distributions::Standard, prelude::Distribution, rngs::StdRng, Rng, SeedableRng};

use crate::{
    codec::{CodecRegistry, StandardCodecs},
    errors::Result,
    io::CancelHandle,
    store::{BlockId, BlockStore, MemoryStore},
};

/// A memory store whose writes can be made to fail on demand
///
#[derive(Clone, Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `allocate`, `write` and `flush` fail
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::new(ErrorKind::Other, "injected write failure"))
        } else {
            Ok(())
        }
    }
}

impl BlockStore for FailingStore {
    fn allocate(&mut self, size_hint: u64) -> io::Result<BlockId> {
        self.check()?;
        self.inner.allocate(size_hint)
    }

    fn read(&self, block: BlockId, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        self.inner.read(block, offset, length)
    }

    fn write(&mut self, block: BlockId, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.write(block, offset, bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Standard codecs that trip a cancel handle the first time a chunk is deflated or inflated
/// after being armed
///
#[derive(Clone, Default)]
pub(crate) struct TripwireCodecs {
    armed: Arc<Mutex<Option<CancelHandle>>>,
}

impl TripwireCodecs {
    pub fn arm(&self, handle: CancelHandle) {
        *self.armed.lock() = Some(handle);
    }

    fn trip(&self) {
        if let Some(handle) = self.armed.lock().take() {
            handle.cancel();
        }
    }
}

impl CodecRegistry for TripwireCodecs {
    fn deflate(&self, bytes: &[u8], level: u32) -> Result<Vec<u8>> {
        self.trip();
        StandardCodecs.deflate(bytes, level)
    }

    fn inflate(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.trip();
        StandardCodecs.inflate(bytes)
    }

    fn shuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>> {
        StandardCodecs.shuffle(bytes, element_width)
    }

    fn unshuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>> {
        StandardCodecs.unshuffle(bytes, element_width)
    }

    fn fletcher32(&self, bytes: &[u8]) -> u32 {
        StandardCodecs.fletcher32(bytes)
    }
}

/// A seeded random number generator, so failures are reproducible
pub(crate) fn rng() -> StdRng {
    StdRng::seed_from_u64(0x4843)
}

/// An array of random values
pub(crate) fn random_array<T>(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<T>
where
    Standard: Distribution<T>,
{
    Array2::from_shape_simple_fn((rows, cols), || rng.gen())
}
