use std::{fs::OpenOptions, path::Path};

use memmap2::MmapMut;
use tracing::debug;

use super::{Nvm, check_bounds};
use crate::Result;

/// File backed medium, memory mapped so that it behaves like a byte addressable chip.
pub struct FileNvm {
    map: MmapMut,
}

impl FileNvm {
    /// Opens `path`, creating it or growing it to `len` bytes if needed. New bytes read as zero.
    pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if (file.metadata()?.len() as usize) < len {
            debug!(path = %path.display(), len, "growing NVM file");
            file.set_len(len as u64)?;
        }
        // SAFETY: the mapping is only shared with other engine processes run sequentially.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }
}

impl Nvm for FileNvm {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.map.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.map[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(self.map.len(), offset, data.len())?;
        self.map[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_survive_reopening() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nvm.bin");
        {
            let mut nvm = FileNvm::open(&path, 64)?;
            nvm.write(10, &[0xAB, 0xCD])?;
            nvm.flush()?;
        }
        let nvm = FileNvm::open(&path, 64)?;
        let mut buf = [0u8; 3];
        nvm.read(9, &mut buf)?;
        assert_eq!(buf, [0, 0xAB, 0xCD]);
        assert_eq!(nvm.len(), 64);
        Ok(())
    }
}
