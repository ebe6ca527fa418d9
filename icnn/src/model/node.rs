use serde::{Deserialize, Serialize};

use crate::{
    Result,
    codec::{Decoder, Encoder},
    fatal, invariant,
};

pub const NODE_NAME_LEN: usize = 16;
pub const MAX_INPUTS: usize = 3;
pub const NODE_RECORD_LEN: usize = NODE_NAME_LEN + 1 + 1 + 2 * MAX_INPUTS + 1 + 1 + 2 + 2 + 2 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[repr(u8)]
pub enum OpType {
    Conv = 0,
    ConvMerge = 1,
    MaxPool = 2,
    Relu = 3,
    Gemm = 4,
}

impl TryFrom<u8> for OpType {
    type Error = crate::EngineError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => OpType::Conv,
            1 => OpType::ConvMerge,
            2 => OpType::MaxPool,
            3 => OpType::Relu,
            4 => OpType::Gemm,
            other => return Err(fatal!("invalid operator type {other}")),
        })
    }
}

/// Operator parameters. Zero means "operator default" for every field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFlags {
    pub stride: u8,
    pub kernel_size: u8,
    /// Input channels per partial sum region of a convolution.
    pub input_tile_c: u16,
    /// Channels per storage tile of the output.
    pub output_tile_c: u16,
    /// Input features per partial sum region of a dense layer.
    pub tile_channel: u16,
}

/// Static description of one layer, provisioned once and never modified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub op: OpType,
    /// Parameter indices; the first one is the data input.
    pub inputs: Vec<u16>,
    pub flags: NodeFlags,
    /// Last layer reading this node's output, the node itself if none does.
    pub max_output_id: u16,
}

impl Node {
    pub fn encode(&self) -> Result<Vec<u8>> {
        invariant!(
            self.name.len() <= NODE_NAME_LEN,
            "node name {:?} longer than {NODE_NAME_LEN} bytes",
            self.name
        );
        invariant!(
            !self.inputs.is_empty() && self.inputs.len() <= MAX_INPUTS,
            "node {} has {} inputs",
            self.name,
            self.inputs.len()
        );
        let mut name = [0u8; NODE_NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let mut enc = Encoder::with_capacity(NODE_RECORD_LEN);
        enc.bytes(&name)
            .u8(self.op as u8)
            .u8(self.inputs.len() as u8);
        for i in 0..MAX_INPUTS {
            enc.u16(self.inputs.get(i).copied().unwrap_or(0));
        }
        enc.u8(self.flags.stride)
            .u8(self.flags.kernel_size)
            .u16(self.flags.input_tile_c)
            .u16(self.flags.output_tile_c)
            .u16(self.flags.tile_channel)
            .u16(self.max_output_id);
        Ok(enc.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let raw_name = dec.bytes(NODE_NAME_LEN)?;
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_LEN);
        let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();
        let op = OpType::try_from(dec.u8()?)?;
        let n_inputs = dec.u8()? as usize;
        invariant!(
            (1..=MAX_INPUTS).contains(&n_inputs),
            "node {name} has {n_inputs} inputs"
        );
        let mut inputs = Vec::with_capacity(n_inputs);
        for i in 0..MAX_INPUTS {
            let input = dec.u16()?;
            if i < n_inputs {
                inputs.push(input);
            }
        }
        Ok(Self {
            name,
            op,
            inputs,
            flags: NodeFlags {
                stride: dec.u8()?,
                kernel_size: dec.u8()?,
                input_tile_c: dec.u16()?,
                output_tile_c: dec.u16()?,
                tile_channel: dec.u16()?,
            },
            max_output_id: dec.u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_record_has_fixed_length() {
        let node = Node {
            name: "conv1".into(),
            op: OpType::Conv,
            inputs: vec![0, 1, 2],
            flags: NodeFlags {
                stride: 1,
                input_tile_c: 2,
                ..Default::default()
            },
            max_output_id: 1,
        };
        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), NODE_RECORD_LEN);
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn oversized_names_are_rejected() {
        let node = Node {
            name: "a_very_long_layer_name".into(),
            op: OpType::Relu,
            inputs: vec![3],
            flags: NodeFlags::default(),
            max_output_id: 0,
        };
        assert!(node.encode().is_err());
    }
}
