//! Append/consume byte buffer backing all binary serialization.
//!
//! Metadata, variant arrays and datasets serialize themselves into a
//! [`BinaryStream`]; the same buffer is what gets broadcast between ranks
//! and written into metadata cache files and native containers. All
//! primitives are little-endian; strings and byte blocks are length
//! prefixed. Consuming past the end is a [`Error::Stream`] error, never a
//! panic.

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct BinaryStream {
    buf: Vec<u8>,
    read: usize,
}

macro_rules! primitive_io {
    ($append:ident, $consume:ident, $ty:ty) => {
        pub fn $append(&mut self, value: $ty) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        pub fn $consume(&mut self) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.take(N)?;
            let mut raw = [0u8; N];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_le_bytes(raw))
        }
    };
}

impl BinaryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing buffer for consumption, e.g. bytes received from a
    /// broadcast or read from a cache file.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf, read: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Resets the read cursor to the start of the buffer.
    pub fn rewind(&mut self) {
        self.read = 0;
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::stream(format!(
                "underrun: need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.read..self.read + n];
        self.read += n;
        Ok(slice)
    }

    primitive_io!(append_u8, consume_u8, u8);
    primitive_io!(append_u16, consume_u16, u16);
    primitive_io!(append_u32, consume_u32, u32);
    primitive_io!(append_u64, consume_u64, u64);
    primitive_io!(append_i8, consume_i8, i8);
    primitive_io!(append_i16, consume_i16, i16);
    primitive_io!(append_i32, consume_i32, i32);
    primitive_io!(append_i64, consume_i64, i64);
    primitive_io!(append_f32, consume_f32, f32);
    primitive_io!(append_f64, consume_f64, f64);

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.append_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn consume_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.consume_u64()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn append_str(&mut self, value: &str) {
        self.append_bytes(value.as_bytes());
    }

    pub fn consume_str(&mut self) -> Result<String> {
        let bytes = self.consume_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::stream(format!("invalid utf-8: {e}")))
    }

    /// Appends raw bytes without a length prefix; used for fixed-width
    /// headers such as file magics.
    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn consume_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }
}
