use super::{Record, VersionedRecord};
use crate::{
    Result,
    codec::{Decoder, Encoder},
    layout::{NvmLayout, RegionKind},
};

pub const TALLY_LEN: usize = 8;

/// Accuracy bookkeeping across samples, committed once per finished inference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub samples_done: u32,
    pub correct: u32,
}

impl Record for Tally {
    fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.samples_done).u32(self.correct);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            samples_done: dec.u32()?,
            correct: dec.u32()?,
        })
    }
}

impl Tally {
    pub fn record(layout: &NvmLayout) -> VersionedRecord<Tally> {
        VersionedRecord::new(layout.region(RegionKind::Tally).start, TALLY_LEN)
    }
}
