//! Crash consistent two-copy records.
//!
//! Every record is stored twice, each copy followed by a version byte:
//! `[payload A][version A][payload B][version B]`. A commit always overwrites the older copy and
//! writes its version byte last, so a power cut can tear at most the copy that is not trusted.

mod tally;

pub use tally::{TALLY_LEN, Tally};

use std::marker::PhantomData;

use tracing::debug;

use crate::{
    Result,
    codec::{Decoder, Encoder},
    fatal, invariant,
    nvm::Nvm,
    storage::Storage,
};

/// A fixed size value persisted through [`VersionedRecord`].
pub trait Record: Sized {
    fn encode(&self, enc: &mut Encoder);

    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;
}

/// Version following `version`. Zero means "never committed" and is skipped.
pub fn next_version(version: u8) -> u8 {
    match version {
        u8::MAX => 1,
        v => v + 1,
    }
}

/// Index of the copy holding the newest value, `None` if neither was ever committed.
///
/// Versions one apart compare numerically. A larger gap can only come from wrapping around
/// (e.g. 255 then 1), in which case the smaller number is the newer one.
pub fn newest_copy(versions: [u8; 2]) -> Option<usize> {
    match versions {
        [0, 0] => None,
        [_, 0] => Some(0),
        [0, _] => Some(1),
        [a, b] if a == b => Some(0),
        [a, b] if a.abs_diff(b) == 1 => Some(if a > b { 0 } else { 1 }),
        [a, b] => Some(if a < b { 0 } else { 1 }),
    }
}

/// Typed handle on a two-copy record at a fixed NVM offset.
#[derive(Debug)]
pub struct VersionedRecord<T> {
    base: usize,
    payload_len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for VersionedRecord<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            payload_len: self.payload_len,
            _marker: PhantomData,
        }
    }
}

impl<T: Record> VersionedRecord<T> {
    pub fn new(base: usize, payload_len: usize) -> Self {
        Self {
            base,
            payload_len,
            _marker: PhantomData,
        }
    }

    /// Distance between the two copies.
    pub fn stride(&self) -> usize {
        self.payload_len + 1
    }

    fn copy_offset(&self, copy: usize) -> usize {
        self.base + copy * self.stride()
    }

    fn version_offset(&self, copy: usize) -> usize {
        self.copy_offset(copy) + self.payload_len
    }

    pub fn versions<N: Nvm>(&self, storage: &Storage<N>) -> Result<[u8; 2]> {
        Ok([
            storage.read_u8(self.version_offset(0))?,
            storage.read_u8(self.version_offset(1))?,
        ])
    }

    /// Loads the newest committed value, `None` if the record was never committed.
    pub fn load<N: Nvm>(&self, storage: &Storage<N>) -> Result<Option<T>> {
        let versions = self.versions(storage)?;
        let Some(copy) = newest_copy(versions) else {
            return Ok(None);
        };
        let bytes = storage.read(self.copy_offset(copy), self.payload_len)?;
        let mut dec = Decoder::new(&bytes);
        let value = T::decode(&mut dec)?;
        invariant!(
            dec.remaining() == 0,
            "record at {} has {} trailing bytes",
            self.base,
            dec.remaining()
        );
        Ok(Some(value))
    }

    /// Like [`VersionedRecord::load`] for records that must have been committed already.
    pub fn load_committed<N: Nvm>(&self, storage: &Storage<N>) -> Result<T> {
        self.load(storage)?
            .ok_or_else(|| fatal!("record at {} was never committed", self.base))
    }

    /// Durably replaces the value, returning the new version.
    pub fn commit<N: Nvm>(&self, storage: &mut Storage<N>, value: &T) -> Result<u8> {
        let versions = self.versions(storage)?;
        let (target, version) = match newest_copy(versions) {
            Some(newest) => (1 - newest, next_version(versions[newest])),
            None => (0, next_version(0)),
        };
        let mut enc = Encoder::with_capacity(self.stride());
        value.encode(&mut enc);
        invariant!(
            enc.len() == self.payload_len,
            "record at {} encodes to {} bytes, expected {}",
            self.base,
            enc.len(),
            self.payload_len
        );
        enc.u8(version);
        storage.write(self.copy_offset(target), &enc.finish())?;
        debug!(base = self.base, copy = target, version, "committed record");
        Ok(version)
    }

    /// Marks both copies as never committed.
    pub fn invalidate<N: Nvm>(&self, storage: &mut Storage<N>) -> Result<()> {
        for copy in 0..2 {
            storage.write(self.version_offset(copy), &[0])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EngineError,
        layout::{NvmLayout, RegionKind, tests::sample_header},
        nvm::{MemNvm, PowerCut},
    };

    fn tally_record(layout: &NvmLayout) -> VersionedRecord<Tally> {
        VersionedRecord::new(layout.region(RegionKind::Tally).start, TALLY_LEN)
    }

    #[test]
    fn wraparound_picks_the_newer_version() {
        // reference order: start at 1, always increment, skipping 0
        let mut older = 1u8;
        for _ in 0..600 {
            let newer = next_version(older);
            assert_ne!(newer, 0);
            assert_eq!(newest_copy([older, newer]), Some(1), "{older} then {newer}");
            assert_eq!(newest_copy([newer, older]), Some(0), "{older} then {newer}");
            older = newer;
        }
        assert_eq!(next_version(255), 1);
        assert_eq!(newest_copy([255, 1]), Some(1));
        assert_eq!(newest_copy([0, 0]), None);
        assert_eq!(newest_copy([0, 9]), Some(1));
        assert_eq!(newest_copy([9, 0]), Some(0));
    }

    #[test]
    fn commits_alternate_copies() {
        let layout = NvmLayout::new(sample_header()).unwrap();
        let record = tally_record(&layout);
        let mut storage = Storage::new(MemNvm::new(layout.total_len()), layout).unwrap();
        assert_eq!(record.load(&storage).unwrap(), None);
        for i in 1..=300u32 {
            let tally = Tally {
                samples_done: i,
                correct: i / 2,
            };
            record.commit(&mut storage, &tally).unwrap();
            assert_eq!(record.load(&storage).unwrap(), Some(tally));
        }
        record.invalidate(&mut storage).unwrap();
        assert_eq!(record.load(&storage).unwrap(), None);
    }

    #[test]
    fn cloned_handles_address_the_same_copies() {
        let layout = NvmLayout::new(sample_header()).unwrap();
        let record = tally_record(&layout);
        let clone = record.clone();
        assert_eq!(clone.stride(), record.stride());
        let mut storage = Storage::new(MemNvm::new(layout.total_len()), layout).unwrap();
        let tally = Tally {
            samples_done: 3,
            correct: 2,
        };
        clone.commit(&mut storage, &tally).unwrap();
        assert_eq!(record.load(&storage).unwrap(), Some(tally));
        assert_eq!(record.versions(&storage).unwrap(), clone.versions(&storage).unwrap());
    }

    #[test]
    fn cut_commit_yields_previous_or_new_value() {
        let layout = NvmLayout::new(sample_header()).unwrap();
        let record = tally_record(&layout);
        let values = (1..=5u32)
            .map(|i| Tally {
                samples_done: i * 0x0101_0101,
                correct: !i,
            })
            .collect::<Vec<_>>();
        for k in 0..values.len() {
            for cut in 0..=record.stride() as u64 {
                let mut nvm = PowerCut::new(MemNvm::new(layout.total_len()));
                let mut storage = Storage::new(&mut nvm, layout.clone()).unwrap();
                for value in &values[..k] {
                    record.commit(&mut storage, value).unwrap();
                }
                drop(storage);
                nvm.arm(Some(cut));
                let mut storage = Storage::new(&mut nvm, layout.clone()).unwrap();
                let result = record.commit(&mut storage, &values[k]);
                let loaded = record.load(&storage).unwrap();
                if cut == record.stride() as u64 {
                    assert!(result.is_ok());
                    assert_eq!(loaded.as_ref(), Some(&values[k]));
                } else {
                    assert!(matches!(result, Err(EngineError::PowerFailure(_))));
                    let previous = k.checked_sub(1).map(|p| &values[p]);
                    assert_eq!(loaded.as_ref(), previous, "commit {k} cut after {cut} bytes");
                }
            }
        }
    }
}
