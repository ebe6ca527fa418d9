//! Progress kept as a footprint value after every batch of output values.
//!
//! Each job owns `batch + 1` slot positions: its values, padding when the job is short, then a
//! footprint of `1` or `-1`. The footprint is written after the job's values, with the
//! complement of the slot's effective state bit at its position, so recovery only reads
//! footprints. Values keep their full range. The slot's state bit and turning points evolve as
//! with [`super::StateBitTracker`], but only footprint positions are ever compared against them.

use tracing::{debug, trace};

use super::{
    LayerProgress, ProgressTracker, Recovery, Strategy, first_unfinished, first_unfinished_linear,
    state_bit::flip_state_bit,
};
use crate::{
    ELEMENT_BYTES, Element, Result, invariant, jobs::JobGeometry, layout::RegionKind,
    model::SlotInfo, nvm::Nvm, quantization, storage::Storage,
};

/// A footprint as stored in a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchFootprint(Element);

impl BatchFootprint {
    pub fn new(bit: bool) -> Self {
        Self(if bit { 1 } else { -1 })
    }

    /// Besides erased memory and whole footprints, a footprint cut after its low byte reads as
    /// 255 (`-1` over `1` or `0`) or -255 (`1` over `-1`). Anything else is corruption.
    pub fn from_stored(stored: Element) -> Result<Self> {
        invariant!(
            matches!(stored, 0 | 1 | -1 | 255 | -255),
            "{stored} is not a valid footprint"
        );
        Ok(Self(stored))
    }

    pub fn stored(&self) -> Element {
        self.0
    }

    /// Torn footprints keep the bit of the value they were overwriting.
    pub fn bit(&self) -> bool {
        self.0 >= 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct JapariTracker;

impl JapariTracker {
    /// Slot position of the footprint of `job`, a full batch after the job's first value.
    pub fn footprint_position(geometry: &JobGeometry, job: usize) -> Result<usize> {
        let range = geometry.job_range(job)?;
        Ok(Strategy::Japari.stored_position(range.start, geometry.batch()) + geometry.batch())
    }

    fn job_done<N: Nvm>(storage: &Storage<N>, layer: &LayerProgress<'_>, job: usize) -> Result<bool> {
        let position = Self::footprint_position(layer.geometry, job)?;
        let bytes = storage.read_slot(layer.slot, position * ELEMENT_BYTES, ELEMENT_BYTES)?;
        let footprint = BatchFootprint::from_stored(Element::from_le_bytes([bytes[0], bytes[1]]))?;
        let done = footprint.bit() != layer.slot_info.effective_bit(position);
        trace!(job, position, footprint = footprint.stored(), done, "footprint");
        Ok(done)
    }
}

impl ProgressTracker for JapariTracker {
    const STRATEGY: Strategy = Strategy::Japari;
    const RANGE: (Element, Element) = (quantization::MIN, quantization::MAX);

    fn reset<N: Nvm>(&mut self, storage: &mut Storage<N>) -> Result<()> {
        // erased footprints carry the default state bit
        storage.erase(RegionKind::Slots)
    }

    fn recover<N: Nvm>(
        &mut self,
        storage: &Storage<N>,
        layer: &LayerProgress<'_>,
    ) -> Result<Recovery> {
        let mut reads = 0;
        let first_unfinished = first_unfinished(layer.geometry.n_jobs(), |job| {
            reads += 1;
            Self::job_done(storage, layer, job)
        })?;
        debug!(
            node = layer.node,
            slot = layer.slot,
            first_unfinished,
            reads,
            "recovered from batch footprints"
        );
        Ok(Recovery {
            first_unfinished,
            probes: reads,
        })
    }

    fn verify<N: Nvm>(
        &self,
        storage: &Storage<N>,
        layer: &LayerProgress<'_>,
        recovery: &Recovery,
    ) -> Result<()> {
        let n_jobs = layer.geometry.n_jobs();
        for job in 0..n_jobs {
            let done = Self::job_done(storage, layer, job)?;
            invariant!(
                done == (job < recovery.first_unfinished),
                "footprint of job {job} of node {} reads {}, first unfinished job is {}",
                layer.node,
                if done { "done" } else { "pending" },
                recovery.first_unfinished
            );
        }
        let linear = first_unfinished_linear(n_jobs, |job| Self::job_done(storage, layer, job))?;
        invariant!(
            linear == recovery.first_unfinished,
            "binary search found job {} but a linear scan found job {linear}",
            recovery.first_unfinished
        );
        Ok(())
    }

    fn encode(&self, _slot: &SlotInfo, _offset: usize, raw: Element) -> Element {
        raw
    }

    fn decode(&self, stored: Element) -> Element {
        stored
    }

    fn job_marker(
        &self,
        slot: &SlotInfo,
        geometry: &JobGeometry,
        job: usize,
    ) -> Result<Option<(usize, Element)>> {
        let position = Self::footprint_position(geometry, job)?;
        let footprint = BatchFootprint::new(!slot.effective_bit(position));
        Ok(Some((position, footprint.stored())))
    }

    fn record_progress<N: Nvm>(
        &mut self,
        _storage: &mut Storage<N>,
        _node: usize,
        _values_done: usize,
    ) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self, slot: &mut SlotInfo, boundary: usize, capacity: usize) -> Result<()> {
        flip_state_bit(slot, boundary, capacity)
    }
}
