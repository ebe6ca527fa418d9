//! Reference numeric kernels.
//!
//! Each operator has an allocator (`output_shape`), deriving the output tensor from the input
//! descriptions, and a pure per-value `compute`. Kernels know nothing about recovery: the
//! scheduler asks them for whichever values a job covers.
pub mod activation;
pub mod conv;
pub mod gemm;
pub mod merge;
pub mod pooling;

use crate::{
    Element, Result, invariant,
    model::{Node, OpType, ParameterInfo},
    quantization::FRACTIONAL_BITS,
    tensor::{Coords, Tensor},
};
use activation::Relu;
use conv::Conv;
use gemm::Gemm;
use merge::ConvMerge;
use pooling::MaxPool;

/// Output tensor derived by a layer's allocator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputShape {
    /// `[regions, channels, rows, cols]`
    pub dims: [usize; 4],
    /// Channels per storage tile, 0 when untiled.
    pub tile_c: usize,
    pub scale: f32,
}

/// An input tensor together with its description.
#[derive(Clone, Debug)]
pub struct Operand {
    pub info: ParameterInfo,
    pub tensor: Tensor,
}

#[derive(Clone, Debug, derive_more::Display)]
pub enum Layer {
    #[display("Conv{{ stride: {}, input tile: {} }}", _0.stride, _0.input_tile_c)]
    Conv(Conv),
    #[display("ConvMerge")]
    ConvMerge(ConvMerge),
    #[display("MaxPool{{ kernel size: {}, stride: {} }}", _0.kernel_size, _0.stride)]
    MaxPool(MaxPool),
    #[display("Relu")]
    Relu(Relu),
    #[display("Gemm{{ input tile: {} }}", _0.tile_channel)]
    Gemm(Gemm),
}

impl Layer {
    pub fn from_node(node: &Node) -> Self {
        let flags = node.flags;
        match node.op {
            OpType::Conv => Layer::Conv(Conv::new(flags)),
            OpType::ConvMerge => Layer::ConvMerge(ConvMerge::new(flags)),
            OpType::MaxPool => Layer::MaxPool(MaxPool::new(flags)),
            OpType::Relu => Layer::Relu(Relu::new(flags)),
            OpType::Gemm => Layer::Gemm(Gemm::new(flags)),
        }
    }

    /// Derives the output of the layer from its inputs, rejecting inconsistent shapes.
    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        match self {
            Layer::Conv(conv) => conv.output_shape(inputs),
            Layer::ConvMerge(merge) => merge.output_shape(inputs),
            Layer::MaxPool(pool) => pool.output_shape(inputs),
            Layer::Relu(relu) => relu.output_shape(inputs),
            Layer::Gemm(gemm) => gemm.output_shape(inputs),
        }
    }

    /// Unsaturated output value at `at`. `inputs` must match a successful `output_shape` call.
    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        match self {
            Layer::Conv(conv) => conv.compute(inputs, at),
            Layer::ConvMerge(merge) => merge.compute(inputs, at),
            Layer::MaxPool(pool) => pool.compute(inputs, at),
            Layer::Relu(relu) => relu.compute(inputs, at),
            Layer::Gemm(gemm) => gemm.compute(inputs, at),
        }
    }
}

pub(crate) fn check_arity(op: &str, inputs: &[ParameterInfo], min: usize, max: usize) -> Result<()> {
    invariant!(
        (min..=max).contains(&inputs.len()),
        "{op} takes {min} to {max} inputs, got {}",
        inputs.len()
    );
    Ok(())
}

/// Normalizes a tile size: 0 when the tile spans every channel.
pub(crate) fn normalize_tile(tile: u16, channels: usize) -> usize {
    match tile as usize {
        t if t == 0 || t >= channels => 0,
        t => t,
    }
}

/// Number of partial sum regions when `total` inputs are split in tiles of `tile` (0 = no split).
pub(crate) fn regions(total: usize, tile: usize) -> usize {
    if tile == 0 { 1 } else { total.div_ceil(tile) }
}

/// Rescales a product accumulator back to Q15.
pub(crate) fn rescale(acc: i64) -> i64 {
    acc >> FRACTIONAL_BITS
}

pub(crate) fn bias_at(inputs: &[Operand], channel: usize) -> i64 {
    inputs
        .get(2)
        .map(|bias| bias.tensor.data()[channel] as i64)
        .unwrap_or(0)
}

pub(crate) fn check_bias(op: &str, inputs: &[ParameterInfo], channels: usize) -> Result<()> {
    if let Some(bias) = inputs.get(2) {
        invariant!(
            bias.n_values() == channels,
            "{op} bias has {} values for {channels} output channels",
            bias.n_values()
        );
    }
    Ok(())
}

pub(crate) fn max_element(values: impl Iterator<Item = Element>) -> i64 {
    values.max().unwrap_or(Element::MIN) as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{NodeFlags, SlotId};

    pub(crate) fn info(index: u16, dims: [u16; 4], scale: f32) -> ParameterInfo {
        let values: usize = dims.iter().map(|&d| d as usize).product();
        ParameterInfo {
            index,
            slot: SlotId::Parameters,
            offset: 0,
            len: (values * 2) as u32,
            bitwidth: 16,
            dims,
            tile_c: 0,
            transposed: false,
            scale,
        }
    }

    pub(crate) fn operand(index: u16, dims: [u16; 4], data: Vec<Element>) -> Operand {
        let info = info(index, dims, 1.0);
        Operand {
            tensor: Tensor::new(info.dims(), data).unwrap(),
            info,
        }
    }

    #[test]
    fn tiles_normalize_to_zero_when_spanning() {
        assert_eq!(normalize_tile(0, 8), 0);
        assert_eq!(normalize_tile(8, 8), 0);
        assert_eq!(normalize_tile(3, 8), 3);
        assert_eq!(regions(8, 3), 3);
        assert_eq!(regions(8, 0), 1);
    }

    #[test]
    fn layers_display_their_geometry() {
        let pool = Layer::MaxPool(MaxPool::new(NodeFlags {
            kernel_size: 3,
            ..Default::default()
        }));
        assert_eq!(pool.to_string(), "MaxPool{ kernel size: 3, stride: 3 }");
        assert_eq!(Layer::Relu(Relu::new(NodeFlags::default())).to_string(), "Relu");
    }

    #[test]
    fn rescale_floors() {
        assert_eq!(rescale(1 << 15), 1);
        assert_eq!(rescale(-1), -1);
        assert_eq!(rescale((1 << 14) * (1 << 14)), 1 << 13);
    }
}
