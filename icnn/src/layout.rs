//! Placement of every durable region and the header describing it.

use std::env;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Result,
    codec::{Decoder, Encoder},
    counters::COUNTER_RECORD_LEN,
    fatal, invariant,
    model::{MODEL_FIXED_LEN, NODE_RECORD_LEN, PARAMETER_INFO_LEN, SLOT_INFO_LEN},
    progress::{FOOTPRINT_LEN, Strategy},
    store::TALLY_LEN,
};

/// Number of values per job, read from `ICNN_BATCH_SIZE` or 4 if unset or invalid.
pub static BATCH_SIZE: Lazy<u16> = Lazy::new(|| {
    env::var("ICNN_BATCH_SIZE")
        .ok()
        .and_then(|val| val.parse::<u16>().ok())
        .filter(|&val| val > 0)
        .unwrap_or(4)
});

pub const DEFAULT_NUM_SLOTS: u8 = 3;
pub const DEFAULT_SLOT_SIZE: u32 = 0x4000;

const MAGIC: [u8; 4] = *b"ICNN";
const FORMAT_VERSION: u8 = 1;

/// Build time sizing of the intermediate buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub num_slots: u8,
    /// Bytes per slot.
    pub slot_size: u32,
    /// Values per job.
    pub batch_size: u16,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            num_slots: DEFAULT_NUM_SLOTS,
            slot_size: DEFAULT_SLOT_SIZE,
            batch_size: *BATCH_SIZE,
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<()> {
        invariant!(self.num_slots > 0, "at least one slot is required");
        invariant!(
            self.num_slots < crate::model::SlotId::MAX_INTERMEDIATE,
            "too many slots: {}",
            self.num_slots
        );
        invariant!(
            self.slot_size > 0 && self.slot_size % crate::ELEMENT_BYTES as u32 == 0,
            "slot size {} is not a positive multiple of the value size",
            self.slot_size
        );
        invariant!(self.batch_size > 0, "batch size must be positive");
        Ok(())
    }

    /// Capacity of a slot in values.
    pub fn slot_capacity(&self) -> usize {
        self.slot_size as usize / crate::ELEMENT_BYTES
    }
}

/// First record of the NVM: what was provisioned and how the rest is laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub strategy: Strategy,
    pub config: LayoutConfig,
    pub nodes_len: u16,
    /// Number of constant tensors, the network input included.
    pub n_constants: u16,
    pub params_len: u32,
    /// Bytes per sample.
    pub sample_len: u32,
    pub n_samples: u16,
    pub labels_len: u16,
}

pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 4 + 2 + 2 + 2 + 4 + 4 + 2 + 2;

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(HEADER_LEN);
        enc.bytes(&MAGIC)
            .u8(FORMAT_VERSION)
            .u8(self.strategy as u8)
            .u8(self.config.num_slots)
            .u32(self.config.slot_size)
            .u16(self.config.batch_size)
            .u16(self.nodes_len)
            .u16(self.n_constants)
            .u32(self.params_len)
            .u32(self.sample_len)
            .u16(self.n_samples)
            .u16(self.labels_len);
        enc.finish()
    }

    /// Parses a header, returning `None` for media that were never provisioned.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let mut dec = Decoder::new(bytes);
        if dec.bytes(MAGIC.len())? != MAGIC {
            return Ok(None);
        }
        let format = dec.u8()?;
        invariant!(
            format == FORMAT_VERSION,
            "unsupported NVM format version {format}"
        );
        let strategy = Strategy::try_from(dec.u8()?)?;
        let config = LayoutConfig {
            num_slots: dec.u8()?,
            slot_size: dec.u32()?,
            batch_size: dec.u16()?,
        };
        Ok(Some(Self {
            strategy,
            config,
            nodes_len: dec.u16()?,
            n_constants: dec.u16()?,
            params_len: dec.u32()?,
            sample_len: dec.u32()?,
            n_samples: dec.u16()?,
            labels_len: dec.u16()?,
        }))
    }

    pub fn n_params(&self) -> usize {
        self.n_constants as usize + self.nodes_len as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum RegionKind {
    Header,
    Nodes,
    Footprints,
    Model,
    Tally,
    ParamInfos,
    Counters,
    Slots,
    Parameters,
    Samples,
    Labels,
}

/// Write granularity enforced by [`crate::storage::Storage`] inside a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granule {
    /// Any write within the region.
    Bytes,
    /// Whole single-copy records of the given length.
    Records(usize),
    /// Whole copies of two-copy records with the given stride, or a lone version byte.
    TwoCopy(usize),
    /// Writes that stay inside one slot of the given size.
    Slots(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub start: usize,
    pub len: usize,
    pub granule: Granule,
}

impl Region {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, offset: usize) -> bool {
        (self.start..self.end()).contains(&offset)
    }
}

/// Byte offsets of every region, derived from the header alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvmLayout {
    pub header: Header,
    regions: Vec<Region>,
}

impl NvmLayout {
    pub fn new(header: Header) -> Result<Self> {
        header.config.validate()?;
        let nodes = header.nodes_len as usize;
        let model_stride = MODEL_FIXED_LEN + header.config.num_slots as usize * SLOT_INFO_LEN + 1;
        let specs = [
            (RegionKind::Header, HEADER_LEN, Granule::Records(HEADER_LEN)),
            (
                RegionKind::Nodes,
                nodes * NODE_RECORD_LEN,
                Granule::Records(NODE_RECORD_LEN),
            ),
            (
                RegionKind::Footprints,
                nodes * 2 * (FOOTPRINT_LEN + 1),
                Granule::TwoCopy(FOOTPRINT_LEN + 1),
            ),
            (
                RegionKind::Model,
                2 * model_stride,
                Granule::TwoCopy(model_stride),
            ),
            (
                RegionKind::Tally,
                2 * (TALLY_LEN + 1),
                Granule::TwoCopy(TALLY_LEN + 1),
            ),
            (
                RegionKind::ParamInfos,
                header.n_params() * PARAMETER_INFO_LEN,
                Granule::Records(PARAMETER_INFO_LEN),
            ),
            (
                RegionKind::Counters,
                nodes * COUNTER_RECORD_LEN,
                Granule::Records(COUNTER_RECORD_LEN),
            ),
            (
                RegionKind::Slots,
                header.config.num_slots as usize * header.config.slot_size as usize,
                Granule::Slots(header.config.slot_size as usize),
            ),
            (
                RegionKind::Parameters,
                header.params_len as usize,
                Granule::Bytes,
            ),
            (
                RegionKind::Samples,
                header.n_samples as usize * header.sample_len as usize,
                Granule::Bytes,
            ),
            (RegionKind::Labels, header.labels_len as usize, Granule::Bytes),
        ];
        let mut start = 0;
        let regions = specs
            .into_iter()
            .map(|(kind, len, granule)| {
                let region = Region {
                    kind,
                    start,
                    len,
                    granule,
                };
                start += len;
                region
            })
            .collect::<Vec<_>>();
        debug!(total = start, "computed NVM layout");
        Ok(Self { header, regions })
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        // regions are built in declaration order of `RegionKind`
        self.regions[kind as usize]
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Region holding `offset`, skipping empty ones.
    pub fn region_at(&self, offset: usize) -> Result<Region> {
        self.regions
            .iter()
            .find(|r| r.contains(offset))
            .copied()
            .ok_or_else(|| fatal!("offset {offset} lies outside every NVM region"))
    }

    pub fn total_len(&self) -> usize {
        self.regions.last().map(Region::end).unwrap_or(0)
    }

    pub fn slot_start(&self, slot: u8) -> usize {
        self.region(RegionKind::Slots).start + slot as usize * self.header.config.slot_size as usize
    }
}
