//! The durable control record, static node records and the in-memory network description.

mod graph;
pub mod loader;
mod node;
mod params;

pub use graph::{Constant, Graph, GraphBuilder, ParamRef};
pub use node::{MAX_INPUTS, NODE_NAME_LEN, NODE_RECORD_LEN, Node, NodeFlags, OpType};
pub use params::{PARAMETER_INFO_LEN, ParameterInfo, SlotId};

use crate::{
    Result,
    codec::{Decoder, Encoder},
    fatal,
    layout::{NvmLayout, RegionKind},
    progress::TurningPoints,
    store::{Record, VersionedRecord},
};

/// Lifecycle of one inference run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum RunState {
    #[default]
    Idle = 0,
    Running = 1,
    Finished = 2,
}

impl TryFrom<u8> for RunState {
    type Error = crate::EngineError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RunState::Idle),
            1 => Ok(RunState::Running),
            2 => Ok(RunState::Finished),
            other => Err(fatal!("invalid run state {other}")),
        }
    }
}

/// Ownership and state bit bookkeeping of one reusable intermediate buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    /// Layer currently owning the slot, `None` when free.
    pub user: Option<u16>,
    pub state_bit: bool,
    pub turning_points: TurningPoints,
}

pub const SLOT_INFO_LEN: usize = 2 + 1 + TurningPoints::ENCODED_LEN;
const FREE_SLOT: u16 = u16::MAX;

impl Default for SlotInfo {
    fn default() -> Self {
        // erased memory reads as zero, whose embedded bit is set
        Self {
            user: None,
            state_bit: true,
            turning_points: TurningPoints::default(),
        }
    }
}

impl SlotInfo {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// State bit in effect at `offset`: `state_bit` flipped once per turning point at or before it.
    pub fn effective_bit(&self, offset: usize) -> bool {
        self.state_bit ^ self.turning_points.parity_at(offset)
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.u16(self.user.unwrap_or(FREE_SLOT)).bool(self.state_bit);
        self.turning_points.encode(enc);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let user = match dec.u16()? {
            FREE_SLOT => None,
            user => Some(user),
        };
        Ok(Self {
            user,
            state_bit: dec.bool()?,
            turning_points: TurningPoints::decode(dec)?,
        })
    }
}

/// The control record, read at every boot and committed once per layer transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    pub nodes_len: u16,
    pub n_input: u16,
    pub state: RunState,
    /// Number of completed inference runs.
    pub run_counter: u32,
    /// Layer currently executing, or next to execute.
    pub layer_idx: u16,
    pub sample_idx: u16,
    pub slots: Vec<SlotInfo>,
}

pub const MODEL_FIXED_LEN: usize = 2 + 2 + 1 + 4 + 2 + 2;

impl Model {
    pub fn new(nodes_len: u16, n_input: u16, num_slots: u8) -> Self {
        Self {
            nodes_len,
            n_input,
            state: RunState::Idle,
            run_counter: 0,
            layer_idx: 0,
            sample_idx: 0,
            slots: vec![SlotInfo::default(); num_slots as usize],
        }
    }

    pub fn running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn payload_len(num_slots: u8) -> usize {
        MODEL_FIXED_LEN + num_slots as usize * SLOT_INFO_LEN
    }

    /// Handle on the two-copy Model record of `layout`.
    pub fn record(layout: &NvmLayout) -> VersionedRecord<Model> {
        VersionedRecord::new(
            layout.region(RegionKind::Model).start,
            Self::payload_len(layout.header.config.num_slots),
        )
    }
}

impl Record for Model {
    fn encode(&self, enc: &mut Encoder) {
        enc.u16(self.nodes_len)
            .u16(self.n_input)
            .u8(self.state as u8)
            .u32(self.run_counter)
            .u16(self.layer_idx)
            .u16(self.sample_idx);
        for slot in &self.slots {
            slot.encode(enc);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut model = Self {
            nodes_len: dec.u16()?,
            n_input: dec.u16()?,
            state: RunState::try_from(dec.u8()?)?,
            run_counter: dec.u32()?,
            layer_idx: dec.u16()?,
            sample_idx: dec.u16()?,
            slots: Vec::new(),
        };
        while dec.remaining() > 0 {
            model.slots.push(SlotInfo::decode(dec)?);
        }
        Ok(model)
    }
}
