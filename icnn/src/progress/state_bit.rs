//! Progress embedded in the output values themselves.
//!
//! Every stored value carries a tag bit (its sign after offsetting by [`TAG`]). A layer writes
//! each value with the complement of the slot's effective bit at that offset, so on recovery a
//! value whose tag differs from the effective bit was written by the current layer. Once the
//! layer completes, [`StateBitTracker::finalize`] flips the slot's convention so that its freshly
//! written values read as "old" for the next layer using the slot. Values past the end of the
//! layer's output were not rewritten; a turning point at that boundary keeps their convention.

use tracing::{debug, trace};

use super::{LayerProgress, ProgressTracker, Recovery, Strategy, first_unfinished, first_unfinished_linear};
use crate::{
    ELEMENT_BYTES, Element, Result,
    codec::{Decoder, Encoder, decode_elements},
    fatal, invariant,
    layout::RegionKind,
    model::SlotInfo,
    nvm::Nvm,
    storage::Storage,
};

/// Maximum number of turning points per slot.
pub const TURNING_POINTS_LEN: usize = 8;

/// Offset applied to a raw value to move its tag into the sign bit.
const TAG: Element = 0x4000;

/// A value with its embedded state bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedValue(Element);

impl TaggedValue {
    pub const MIN_RAW: Element = -TAG;
    pub const MAX_RAW: Element = TAG - 1;

    /// Tags `raw`, which must lie in `[MIN_RAW, MAX_RAW]`.
    pub fn new(raw: Element, bit: bool) -> Self {
        debug_assert!((Self::MIN_RAW..=Self::MAX_RAW).contains(&raw));
        Self(if bit { raw + TAG } else { raw - TAG })
    }

    pub fn from_stored(stored: Element) -> Self {
        Self(stored)
    }

    pub fn stored(&self) -> Element {
        self.0
    }

    pub fn bit(&self) -> bool {
        self.0 >= 0
    }

    pub fn value(&self) -> Element {
        if self.bit() { self.0 - TAG } else { self.0 + TAG }
    }
}

/// Sorted offsets at which a slot's effective state bit toggles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurningPoints(Vec<u32>);

impl TurningPoints {
    pub const ENCODED_LEN: usize = 1 + 4 * TURNING_POINTS_LEN;

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Inserts a turning point at `offset`, or removes it if one is already there.
    pub fn toggle(&mut self, offset: u32) -> Result<()> {
        match self.0.binary_search(&offset) {
            Ok(index) => {
                self.0.remove(index);
            }
            Err(index) => {
                invariant!(
                    self.0.len() < TURNING_POINTS_LEN,
                    "turning point list overflow inserting {offset} into {:?}",
                    self.0
                );
                self.0.insert(index, offset);
            }
        }
        Ok(())
    }

    /// Whether an odd number of turning points lie at or before `offset`.
    pub fn parity_at(&self, offset: usize) -> bool {
        self.0.partition_point(|&tp| tp as usize <= offset) % 2 == 1
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.u8(self.0.len() as u8);
        for i in 0..TURNING_POINTS_LEN {
            enc.u32(self.0.get(i).copied().unwrap_or(0));
        }
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.u8()? as usize;
        invariant!(
            len <= TURNING_POINTS_LEN,
            "corrupt turning point count {len}"
        );
        let mut points = Vec::with_capacity(len);
        for i in 0..TURNING_POINTS_LEN {
            let point = dec.u32()?;
            if i < len {
                points.push(point);
            }
        }
        invariant!(
            points.windows(2).all(|w| w[0] < w[1]),
            "turning points {points:?} are not strictly increasing"
        );
        Ok(Self(points))
    }
}

#[derive(Clone, Debug, Default)]
pub struct StateBitTracker;

impl StateBitTracker {
    fn stored_at<N: Nvm>(storage: &Storage<N>, slot: u8, offset: usize) -> Result<Element> {
        let bytes = storage.read_slot(slot, offset * ELEMENT_BYTES, ELEMENT_BYTES)?;
        Ok(Element::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Whether `job` was written by the current, not yet finalized, layer.
    fn job_done<N: Nvm>(storage: &Storage<N>, layer: &LayerProgress<'_>, job: usize) -> Result<bool> {
        let offset = layer.geometry.job_index_to_offset(job)?;
        let stored = TaggedValue::from_stored(Self::stored_at(storage, layer.slot, offset)?);
        let done = stored.bit() != layer.slot_info.effective_bit(offset);
        trace!(job, offset, stored = stored.stored(), done, "probe");
        Ok(done)
    }
}

impl ProgressTracker for StateBitTracker {
    const STRATEGY: Strategy = Strategy::StateBit;
    const RANGE: (Element, Element) = (TaggedValue::MIN_RAW, TaggedValue::MAX_RAW);

    fn reset<N: Nvm>(&mut self, storage: &mut Storage<N>) -> Result<()> {
        // a reset slot expects the bit of erased memory everywhere
        storage.erase(RegionKind::Slots)
    }

    fn recover<N: Nvm>(
        &mut self,
        storage: &Storage<N>,
        layer: &LayerProgress<'_>,
    ) -> Result<Recovery> {
        let mut probes = 0;
        let first_unfinished = first_unfinished(layer.geometry.n_jobs(), |job| {
            probes += 1;
            Self::job_done(storage, layer, job)
        })?;
        debug!(
            node = layer.node,
            slot = layer.slot,
            first_unfinished,
            probes,
            "recovered from embedded state bits"
        );
        Ok(Recovery {
            first_unfinished,
            probes,
        })
    }

    fn verify<N: Nvm>(
        &self,
        storage: &Storage<N>,
        layer: &LayerProgress<'_>,
        recovery: &Recovery,
    ) -> Result<()> {
        let n_jobs = layer.geometry.n_jobs();
        let linear = first_unfinished_linear(n_jobs, |job| Self::job_done(storage, layer, job))?;
        invariant!(
            linear == recovery.first_unfinished,
            "binary search found job {} but a linear scan found job {linear}",
            recovery.first_unfinished
        );
        let done_values = match recovery.first_unfinished {
            0 => 0,
            job => layer.geometry.job_range(job - 1)?.end,
        };
        let stored = decode_elements(&storage.read_slot(
            layer.slot,
            0,
            done_values * ELEMENT_BYTES,
        )?);
        if let Some(offset) = stored.iter().enumerate().position(|(offset, &value)| {
            TaggedValue::from_stored(value).bit() == layer.slot_info.effective_bit(offset)
        }) {
            return Err(fatal!(
                "value {offset} of node {} is pending inside the done prefix",
                layer.node
            ));
        }
        for job in recovery.first_unfinished..n_jobs {
            invariant!(
                !Self::job_done(storage, layer, job)?,
                "job {job} of node {} is done past the first unfinished job",
                layer.node
            );
        }
        Ok(())
    }

    fn encode(&self, slot: &SlotInfo, offset: usize, raw: Element) -> Element {
        TaggedValue::new(raw, !slot.effective_bit(offset)).stored()
    }

    fn decode(&self, stored: Element) -> Element {
        TaggedValue::from_stored(stored).value()
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

/// Toggles the state bit of `slot` for a layer that wrote the first `boundary` positions.
pub(crate) fn flip_state_bit(slot: &mut SlotInfo, boundary: usize, capacity: usize) -> Result<()> {
    invariant!(
        boundary <= capacity,
        "flip boundary {boundary} past slot capacity {capacity}"
    );
    slot.state_bit = !slot.state_bit;
    // nothing lies past the end of the slot
    if boundary < capacity {
        let offset =
            u32::try_from(boundary).map_err(|_| fatal!("flip boundary {boundary} too large"))?;
        slot.turning_points.toggle(offset)?;
    }
    debug!(
        state_bit = slot.state_bit,
        turning_points = ?slot.turning_points.as_slice(),
        "flipped state bit"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::encode_elements,
        jobs::{JobGeometry, TileLayout},
        layout::{NvmLayout, tests::sample_header},
        nvm::MemNvm,
    };
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn tags_survive_every_raw_value() {
        for raw in TaggedValue::MIN_RAW..=TaggedValue::MAX_RAW {
            for bit in [false, true] {
                let tagged = TaggedValue::new(raw, bit);
                assert_eq!(tagged.bit(), bit);
                assert_eq!(tagged.value(), raw);
            }
        }
        // erased memory reads as a set bit
        assert!(TaggedValue::from_stored(0).bit());
    }

    #[test]
    fn turning_points_stay_sorted_and_bounded() {
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..200 {
            let mut points = TurningPoints::default();
            for _ in 0..50 {
                let offset = rng.gen_range(0..12);
                match points.toggle(offset) {
                    Ok(()) => {}
                    Err(_) => assert_eq!(points.len(), TURNING_POINTS_LEN),
                }
                assert!(points.as_slice().windows(2).all(|w| w[0] < w[1]));
                assert!(points.len() <= TURNING_POINTS_LEN);
            }
        }
    }

    #[test]
    fn toggling_twice_removes_the_point() {
        let mut points = TurningPoints::default();
        points.toggle(5).unwrap();
        points.toggle(2).unwrap();
        points.toggle(5).unwrap();
        assert_eq!(points.as_slice(), &[2]);
        assert!(points.parity_at(2));
        assert!(!points.parity_at(1));
    }

    #[test]
    fn overflow_is_fatal() {
        let mut points = TurningPoints::default();
        for i in 0..TURNING_POINTS_LEN as u32 {
            points.toggle(i * 3).unwrap();
        }
        assert!(points.toggle(1).is_err());
        // removal still works when full
        assert!(points.toggle(0).is_ok());
    }

    #[test]
    fn flips_keep_effective_bits_equal_to_stored_bits() {
        let mut rng = StdRng::seed_from_u64(42);
        let capacity = 32;
        let mut tracker = StateBitTracker;
        let mut slot = SlotInfo::default();
        let mut stored = vec![true; capacity];
        for _ in 0..(TURNING_POINTS_LEN * 3) {
            let boundary = rng.gen_range(1..=capacity);
            for (offset, bit) in stored.iter_mut().enumerate().take(boundary) {
                *bit = !slot.effective_bit(offset);
            }
            if tracker.finalize(&mut slot, boundary, capacity).is_err() {
                break;
            }
            for (offset, &bit) in stored.iter().enumerate() {
                assert_eq!(slot.effective_bit(offset), bit, "offset {offset}");
            }
        }
    }

    #[rstest::rstest]
    fn recovery_finds_the_interrupted_job(#[values(1, 3, 4)] batch: usize) {
        let layout = NvmLayout::new(sample_header()).unwrap();
        let mut storage = Storage::new(MemNvm::new(layout.total_len()), layout).unwrap();
        let mut tracker = StateBitTracker;
        let geometry = JobGeometry::new(TileLayout::new([1, 2, 3, 3], 0).unwrap(), batch).unwrap();
        let mut slot = SlotInfo::default();
        // a previous layer wrote 10 values and flipped
        storage.write_slot(1, 0, &encode_elements(&[TaggedValue::new(7, false).stored(); 10])).unwrap();
        tracker.finalize(&mut slot, 10, 32).unwrap();

        for written in 0..=geometry.layout().len() {
            let values = (0..written)
                .map(|offset| tracker.encode(&slot, offset, offset as Element))
                .collect::<Vec<_>>();
            storage.write_slot(1, 0, &encode_elements(&values)).unwrap();
            let layer = LayerProgress {
                node: 2,
                slot: 1,
                slot_info: &slot,
                geometry: &geometry,
            };
            let recovery = tracker.recover(&storage, &layer).unwrap();
            assert_eq!(recovery.first_unfinished, geometry.jobs_covering(written));
            tracker.verify(&storage, &layer, &recovery).unwrap();
        }
    }
}
