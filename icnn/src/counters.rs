//! Per-layer statistics. Single copy and best effort: they are written outside the crash
//! consistency path and may lose the last update of an interrupted layer.

use serde::Serialize;

use crate::{
    Result,
    codec::{Decoder, Encoder},
    layout::RegionKind,
    nvm::Nvm,
    storage::Storage,
};

pub const COUNTER_RECORD_LEN: usize = 5 * 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LayerCounters {
    /// Boots that resumed inside this layer.
    pub power_cycles: u32,
    pub jobs: u32,
    pub probes: u32,
    /// Durable bytes written while running the layer.
    pub bytes: u32,
    pub micros: u32,
}

impl LayerCounters {
    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(COUNTER_RECORD_LEN);
        enc.u32(self.power_cycles)
            .u32(self.jobs)
            .u32(self.probes)
            .u32(self.bytes)
            .u32(self.micros);
        enc.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            power_cycles: dec.u32()?,
            jobs: dec.u32()?,
            probes: dec.u32()?,
            bytes: dec.u32()?,
            micros: dec.u32()?,
        })
    }

    fn accumulate(&mut self, delta: &LayerCounters) {
        self.power_cycles = self.power_cycles.saturating_add(delta.power_cycles);
        self.jobs = self.jobs.saturating_add(delta.jobs);
        self.probes = self.probes.saturating_add(delta.probes);
        self.bytes = self.bytes.saturating_add(delta.bytes);
        self.micros = self.micros.saturating_add(delta.micros);
    }
}

pub fn load<N: Nvm>(storage: &Storage<N>, node: usize) -> Result<LayerCounters> {
    LayerCounters::decode(&storage.read_record(RegionKind::Counters, node)?)
}

pub fn load_all<N: Nvm>(storage: &Storage<N>) -> Result<Vec<LayerCounters>> {
    (0..storage.header().nodes_len as usize)
        .map(|node| load(storage, node))
        .collect()
}

/// Adds `delta` to the counters of `node`.
pub fn add<N: Nvm>(storage: &mut Storage<N>, node: usize, delta: &LayerCounters) -> Result<()> {
    let mut counters = load(storage, node)?;
    counters.accumulate(delta);
    storage.write_record(RegionKind::Counters, node, &counters.encode())
}

pub fn reset<N: Nvm>(storage: &mut Storage<N>) -> Result<()> {
    storage.erase(RegionKind::Counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{NvmLayout, tests::sample_header},
        nvm::MemNvm,
    };

    #[test]
    fn counters_accumulate_per_node() {
        let layout = NvmLayout::new(sample_header()).unwrap();
        let mut storage = Storage::new(MemNvm::new(layout.total_len()), layout).unwrap();
        let delta = LayerCounters {
            jobs: 3,
            bytes: 10,
            ..Default::default()
        };
        add(&mut storage, 1, &delta).unwrap();
        add(&mut storage, 1, &delta).unwrap();
        let all = load_all(&storage).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], LayerCounters::default());
        assert_eq!(all[1].jobs, 6);
        assert_eq!(all[1].bytes, 20);
        reset(&mut storage).unwrap();
        assert_eq!(load(&storage, 1).unwrap(), LayerCounters::default());
    }
}
