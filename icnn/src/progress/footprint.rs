//! Progress kept as an explicit two-copy counter per node.

use tracing::debug;

use super::{LayerProgress, ProgressTracker, Recovery, Strategy};
use crate::{
    Element, Result,
    codec::{Decoder, Encoder},
    fatal,
    layout::{NvmLayout, RegionKind},
    model::SlotInfo,
    nvm::Nvm,
    quantization,
    storage::Storage,
    store::{Record, VersionedRecord},
};

pub const FOOTPRINT_LEN: usize = 4;

/// Number of output values of a node known to be durable in the current run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Footprint {
    pub value: u32,
}

impl Record for Footprint {
    fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.value);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self { value: dec.u32()? })
    }
}

impl Footprint {
    pub fn record(layout: &NvmLayout, node: usize) -> VersionedRecord<Footprint> {
        let region = layout.region(RegionKind::Footprints);
        VersionedRecord::new(region.start + node * 2 * (FOOTPRINT_LEN + 1), FOOTPRINT_LEN)
    }
}

#[derive(Clone, Debug, Default)]
pub struct FootprintTracker;

impl ProgressTracker for FootprintTracker {
    const STRATEGY: Strategy = Strategy::Footprint;
    const RANGE: (Element, Element) = (quantization::MIN, quantization::MAX);

    fn reset<N: Nvm>(&mut self, storage: &mut Storage<N>) -> Result<()> {
        let layout = storage.layout().clone();
        for node in 0..layout.header.nodes_len as usize {
            Footprint::record(&layout, node).commit(storage, &Footprint::default())?;
        }
        Ok(())
    }

    fn recover<N: Nvm>(
        &mut self,
        storage: &Storage<N>,
        layer: &LayerProgress<'_>,
    ) -> Result<Recovery> {
        let footprint = Footprint::record(storage.layout(), layer.node).load_committed(storage)?;
        let first_unfinished = layer.geometry.jobs_covering(footprint.value as usize);
        debug!(
            node = layer.node,
            footprint = footprint.value,
            first_unfinished,
            "recovered from footprint"
        );
        Ok(Recovery {
            first_unfinished,
            probes: 1,
        })
    }

    fn encode(&self, _slot: &SlotInfo, _offset: usize, raw: Element) -> Element {
        raw
    }

    fn decode(&self, stored: Element) -> Element {
        stored
    }

    fn record_progress<N: Nvm>(
        &mut self,
        storage: &mut Storage<N>,
        node: usize,
        values_done: usize,
    ) -> Result<()> {
        let value = u32::try_from(values_done)
            .map_err(|_| fatal!("footprint {values_done} of node {node} overflows"))?;
        Footprint::record(storage.layout(), node).commit(storage, &Footprint { value })?;
        Ok(())
    }

    fn finalize(&mut self, _slot: &mut SlotInfo, _boundary: usize, _capacity: usize) -> Result<()> {
        Ok(())
    }
}
