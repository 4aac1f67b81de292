//! Extend Read and Write with some convenience methods for binary i/o
//!
use std::io::{self, Read, Write};

use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use crate::errors::{Error, Result};

/// Upper bound on elements reserved up front for a length read from a stream. Longer
/// collections still load, growing as their contents actually arrive.
const PREALLOCATION_LIMIT: usize = 4096;

/// Capacity to reserve for `count` elements whose count came from an untrusted stream
pub(crate) fn capacity(count: usize) -> usize {
    count.min(PREALLOCATION_LIMIT)
}

pub(crate) trait Serialize: Sized {
    /// Write self to a stream
    fn write_to(&self, stream: &mut impl Write) -> Result<()>;

    /// Read Self from a stream
    fn read_from(stream: &mut impl Read) -> Result<Self>;
}

pub(crate) trait ExtendedRead: Read {
    /// Read a byte from a stream
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Read a Big Endian encoded 16 bit unsigned integer from a stream
    fn read_u16(&mut self) -> io::Result<u16>;

    /// Read a Big Endian encoded 32 bit unsigned integer from a stream
    fn read_u32(&mut self) -> io::Result<u32>;

    /// Read a Big Endian encoded 64 bit unsigned integer from a stream
    fn read_u64(&mut self) -> io::Result<u64>;

    /// Read an unsigned varint from a stream
    fn read_varint(&mut self) -> Result<u64>;

    /// Read a varint encoded length or index
    fn read_usize(&mut self) -> Result<usize>;

    /// Read a byte as a boolean
    fn read_bool(&mut self) -> io::Result<bool>;

    /// Read a length prefixed UTF-8 string from a stream
    fn read_string(&mut self) -> Result<String>;

    /// Read a length prefixed byte string from a stream
    fn read_bytes(&mut self) -> Result<Vec<u8>>;

    /// Read exactly `length` bytes, failing with a format error if the stream ends first
    fn read_exactly(&mut self, length: usize) -> Result<Vec<u8>>;
}

impl<R: Read> ExtendedRead for R {
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buffer = [0; 1];
        self.read_exact(&mut buffer)?;

        Ok(buffer[0])
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buffer = [0; 2];
        self.read_exact(&mut buffer)?;

        Ok(u16::from_be_bytes(buffer))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buffer = [0; 4];
        self.read_exact(&mut buffer)?;

        Ok(u32::from_be_bytes(buffer))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buffer = [0; 8];
        self.read_exact(&mut buffer)?;

        Ok(u64::from_be_bytes(buffer))
    }

    fn read_varint(&mut self) -> Result<u64> {
        // Collect bytes up to and including the first one without the continuation bit
        let mut buffer = [0; 10];
        for i in 0..buffer.len() {
            let byte = self.read_byte()?;
            buffer[i] = byte;
            if byte & 0x80 == 0 {
                let (value, _) = varint_decode::u64(&buffer[..=i])
                    .map_err(|err| Error::Format(format!("bad varint: {err}")))?;
                return Ok(value);
            }
        }

        Err(Error::Format(String::from("varint overflow")))
    }

    fn read_usize(&mut self) -> Result<usize> {
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| Error::Format(format!("{value} overflows usize")))
    }

    fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|err| Error::Format(format!("bad string: {err}")))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_usize()?;
        self.read_exactly(length)
    }

    fn read_exactly(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(capacity(length));
        self.by_ref().take(length as u64).read_to_end(&mut bytes)?;
        if bytes.len() != length {
            return Err(Error::Format(format!(
                "expected {length} bytes, stream ended after {}",
                bytes.len()
            )));
        }

        Ok(bytes)
    }
}

pub(crate) trait ExtendedWrite: Write {
    /// Write a byte to a stream
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Write a Big Endian encoded 16 bit unsigned integer to a stream
    fn write_u16(&mut self, word: u16) -> io::Result<()>;

    /// Write a Big Endian encoded 32 bit unsigned integer to a stream
    fn write_u32(&mut self, word: u32) -> io::Result<()>;

    /// Write a Big Endian encoded 64 bit unsigned integer to a stream
    fn write_u64(&mut self, word: u64) -> io::Result<()>;

    /// Write an unsigned varint to a stream
    fn write_varint(&mut self, value: u64) -> io::Result<()>;

    /// Write a length or index as a varint
    fn write_usize(&mut self, value: usize) -> io::Result<()>;

    /// Write a boolean as a single byte
    fn write_bool(&mut self, value: bool) -> io::Result<()>;

    /// Write a length prefixed UTF-8 string to a stream
    fn write_string(&mut self, value: &str) -> io::Result<()>;

    /// Write a length prefixed byte string to a stream
    fn write_bytes(&mut self, value: &[u8]) -> io::Result<()>;
}

impl<W: Write> ExtendedWrite for W {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    fn write_u16(&mut self, word: u16) -> io::Result<()> {
        self.write_all(&word.to_be_bytes())
    }

    fn write_u32(&mut self, word: u32) -> io::Result<()> {
        self.write_all(&word.to_be_bytes())
    }

    fn write_u64(&mut self, word: u64) -> io::Result<()> {
        self.write_all(&word.to_be_bytes())
    }

    fn write_varint(&mut self, value: u64) -> io::Result<()> {
        let mut buffer = varint_encode::u64_buffer();
        self.write_all(varint_encode::u64(value, &mut buffer))
    }

    fn write_usize(&mut self, value: usize) -> io::Result<()> {
        self.write_varint(value as u64)
    }

    fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_byte(u8::from(value))
    }

    fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.write_bytes(value.as_bytes())
    }

    fn write_bytes(&mut self, value: &[u8]) -> io::Result<()> {
        self.write_usize(value.len())?;
        self.write_all(value)
    }
}
