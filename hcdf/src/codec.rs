//! Chunk transforms: byte shuffle, deflate and the Fletcher-32 checksum.
//!
use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::errors::{Error, Result};

/// The transform functions applied to chunk bytes on their way to and from the block store.
///
pub trait CodecRegistry: Send {
    /// Compress `bytes` with zlib/deflate at `level` (0-9)
    fn deflate(&self, bytes: &[u8], level: u32) -> Result<Vec<u8>>;

    /// Decompress zlib/deflate compressed `bytes`
    fn inflate(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Group bytes by their position within each element of `element_width` bytes
    fn shuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>>;

    /// Inverse of `shuffle`
    fn unshuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>>;

    /// Fletcher-32 checksum of `bytes`
    fn fletcher32(&self, bytes: &[u8]) -> u32;
}

/// `CodecRegistry` implementation using `flate2` for deflate.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardCodecs;

impl CodecRegistry for StandardCodecs {
    fn deflate(&self, bytes: &[u8], level: u32) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
        encoder
            .write_all(bytes)
            .map_err(|err| Error::Compression(err.to_string()))?;
        encoder
            .finish()
            .map_err(|err| Error::Compression(err.to_string()))
    }

    fn inflate(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut result = Vec::new();
        decoder
            .read_to_end(&mut result)
            .map_err(|err| Error::Compression(err.to_string()))?;

        Ok(result)
    }

    fn shuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>> {
        if element_width <= 1 {
            return Ok(bytes.to_vec());
        }
        if bytes.len() % element_width != 0 {
            return Err(Error::Compression(String::from(
                "shuffle: data length not a multiple of element width",
            )));
        }

        let elements = bytes.len() / element_width;
        let mut result = vec![0; bytes.len()];
        for i in 0..elements {
            for j in 0..element_width {
                result[j * elements + i] = bytes[i * element_width + j];
            }
        }

        Ok(result)
    }

    fn unshuffle(&self, bytes: &[u8], element_width: usize) -> Result<Vec<u8>> {
        if element_width <= 1 {
            return Ok(bytes.to_vec());
        }
        if bytes.len() % element_width != 0 {
            return Err(Error::Compression(String::from(
                "unshuffle: data length not a multiple of element width",
            )));
        }

        let elements = bytes.len() / element_width;
        let mut result = vec![0; bytes.len()];
        for i in 0..elements {
            for j in 0..element_width {
                result[i * element_width + j] = bytes[j * elements + i];
            }
        }

        Ok(result)
    }

    fn fletcher32(&self, bytes: &[u8]) -> u32 {
        // Operates on big endian 16 bit words, an odd trailing byte is padded with zero.
        // Sums are reduced every 360 words, the largest block that can't overflow.
        const BLOCK_WORDS: usize = 360;

        let mut sum1: u32 = 0;
        let mut sum2: u32 = 0;
        for block in bytes.chunks(BLOCK_WORDS * 2) {
            for word in block.chunks(2) {
                let value = match word {
                    [high, low] => (*high as u32) << 8 | *low as u32,
                    [high] => (*high as u32) << 8,
                    _ => unreachable!(),
                };
                sum1 += value;
                sum2 += sum1;
            }
            sum1 %= 65535;
            sum2 %= 65535;
        }

        (sum2 << 16) | sum1
    }
}

/// The filters configured on a chunked variable.
///
/// Encoding applies shuffle, then deflate, then appends the checksum. Decoding reverses that
/// order.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Filters {
    pub shuffle: bool,

    /// Deflate level, if compression is enabled
    pub deflate: Option<u32>,

    pub fletcher32: bool,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        !self.shuffle && self.deflate.is_none() && !self.fletcher32
    }

    pub(crate) fn encode(
        &self,
        codecs: &dyn CodecRegistry,
        bytes: Vec<u8>,
        element_width: usize,
    ) -> Result<Vec<u8>> {
        let mut bytes = bytes;
        if self.shuffle {
            bytes = codecs.shuffle(&bytes, element_width)?;
        }
        if let Some(level) = self.deflate {
            bytes = codecs.deflate(&bytes, level)?;
        }
        if self.fletcher32 {
            let checksum = codecs.fletcher32(&bytes);
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(bytes)
    }

    pub(crate) fn decode(
        &self,
        codecs: &dyn CodecRegistry,
        bytes: Vec<u8>,
        element_width: usize,
    ) -> Result<Vec<u8>> {
        let mut bytes = bytes;
        if self.fletcher32 {
            if bytes.len() < 4 {
                return Err(Error::Compression(String::from(
                    "fletcher32: chunk too short for checksum",
                )));
            }
            let split = bytes.len() - 4;
            let mut stored = [0; 4];
            stored.copy_from_slice(&bytes[split..]);
            let stored = u32::from_le_bytes(stored);
            bytes.truncate(split);
            let computed = codecs.fletcher32(&bytes);
            if stored != computed {
                return Err(Error::Compression(format!(
                    "fletcher32 mismatch: stored {stored:#010x}, computed {computed:#010x}"
                )));
            }
        }
        if self.deflate.is_some() {
            bytes = codecs.inflate(&bytes)?;
        }
        if self.shuffle {
            bytes = codecs.unshuffle(&bytes, element_width)?;
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_inflate() -> Result<()> {
        let codecs = StandardCodecs;
        let data: Vec<u8> = (0..1000).map(|i| (i % 7) as u8).collect();
        let compressed = codecs.deflate(&data, 6)?;
        assert!(compressed.len() < data.len());
        assert_eq!(codecs.inflate(&compressed)?, data);

        Ok(())
    }

    #[test]
    fn test_inflate_python_zlib() -> Result<()> {
        // python3 -c "import zlib; print(list(zlib.compress(bytes(range(10)), 6)))"
        let compressed: Vec<u8> = vec![
            120, 156, 99, 96, 100, 98, 102, 97, 101, 99, 231, 224, 4, 0, 0, 175, 0, 46,
        ];
        assert_eq!(
            StandardCodecs.inflate(&compressed)?,
            vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]
        );

        Ok(())
    }

    #[test]
    fn test_inflate_garbage() {
        let result = StandardCodecs.inflate(&[1, 2, 3, 4, 5]);
        assert!(matches!(result, Err(Error::Compression(_))));
    }

    #[test]
    fn test_shuffle_known_pattern() -> Result<()> {
        let data = vec![0xA0, 0xA1, 0xA2, 0xA3, 0xB0, 0xB1, 0xB2, 0xB3];
        let shuffled = StandardCodecs.shuffle(&data, 4)?;
        assert_eq!(shuffled, vec![0xA0, 0xB0, 0xA1, 0xB1, 0xA2, 0xB2, 0xA3, 0xB3]);
        assert_eq!(StandardCodecs.unshuffle(&shuffled, 4)?, data);

        Ok(())
    }

    #[test]
    fn test_shuffle_bad_length() {
        let result = StandardCodecs.shuffle(&[1, 2, 3], 2);
        assert!(matches!(result, Err(Error::Compression(_))));
    }

    #[test]
    fn test_fletcher32() {
        // Reference values for the HDF5 flavor of the checksum
        assert_eq!(StandardCodecs.fletcher32(&[]), 0);
        assert_eq!(StandardCodecs.fletcher32(&[0x01, 0x02]), 0x0102_0102);
        assert_eq!(StandardCodecs.fletcher32(&[0x01]), 0x0100_0100);

        let long: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let mut changed = long.clone();
        changed[4321] ^= 1;
        assert_ne!(
            StandardCodecs.fletcher32(&long),
            StandardCodecs.fletcher32(&changed)
        );
    }

    #[test]
    fn test_filters_round_trip() -> Result<()> {
        let filters = Filters {
            shuffle: true,
            deflate: Some(9),
            fletcher32: true,
        };
        let data: Vec<u8> = (0..400_u32).flat_map(|i| i.to_le_bytes()).collect();
        let encoded = filters.encode(&StandardCodecs, data.clone(), 4)?;
        assert!(encoded.len() < data.len());
        assert_eq!(filters.decode(&StandardCodecs, encoded, 4)?, data);

        Ok(())
    }

    #[test]
    fn test_filters_detect_corruption() -> Result<()> {
        let filters = Filters {
            shuffle: false,
            deflate: None,
            fletcher32: true,
        };
        let mut encoded = filters.encode(&StandardCodecs, vec![1, 2, 3, 4], 1)?;
        assert_eq!(encoded.len(), 8);
        encoded[1] = 99;
        let result = filters.decode(&StandardCodecs, encoded, 1);
        assert!(matches!(result, Err(Error::Compression(_))));

        Ok(())
    }
}
