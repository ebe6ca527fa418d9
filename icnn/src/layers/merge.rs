use super::{Operand, OutputShape, check_arity, normalize_tile};
use crate::{
    Result,
    model::{NodeFlags, ParameterInfo},
    tensor::Coords,
};

/// Sums the partial sum regions of a tiled convolution or dense layer.
#[derive(Clone, Debug)]
pub struct ConvMerge {
    output_tile_c: u16,
}

impl ConvMerge {
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            output_tile_c: flags.output_tile_c,
        }
    }

    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        check_arity("ConvMerge", inputs, 1, 1)?;
        let [_, c, h, w] = inputs[0].dims();
        Ok(OutputShape {
            dims: [1, c, h, w],
            tile_c: normalize_tile(self.output_tile_c, c),
            scale: inputs[0].scale,
        })
    }

    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        let x = &inputs[0].tensor;
        (0..x.dims()[0])
            .map(|r| x.at(r, at.channel, at.row, at.col) as i64)
            .sum()
    }
}
