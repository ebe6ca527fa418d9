//! Byte addressable non-volatile memory, the only state that survives a power cut.

mod fault;
mod file;

pub use fault::PowerCut;
pub use file::FileNvm;

use crate::{Result, fatal};

/// A durable, byte addressable medium.
///
/// A `write` may be interrupted after any byte: the bytes before the interruption are durable,
/// the others keep their previous content.
pub trait Nvm {
    /// Size of the medium in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Makes every previous write durable. A no-op for media without write-back caching.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<N: Nvm + ?Sized> Nvm for &mut N {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        (**self).write(offset, data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

pub(crate) fn check_bounds(len: usize, offset: usize, access: usize) -> Result<()> {
    match offset.checked_add(access) {
        Some(end) if end <= len => Ok(()),
        _ => Err(fatal!(
            "NVM access of {access} bytes at {offset} exceeds medium of {len} bytes"
        )),
    }
}

/// In-memory medium for tests and simulation.
#[derive(Clone, Debug)]
pub struct MemNvm {
    data: Vec<u8>,
}

impl MemNvm {
    pub fn new(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Nvm for MemNvm {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.data.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(self.data.len(), offset, data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
