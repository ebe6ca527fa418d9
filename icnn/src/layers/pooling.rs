use super::{Operand, OutputShape, check_arity, max_element, normalize_tile};
use crate::{
    Result, invariant,
    model::{NodeFlags, ParameterInfo},
    tensor::Coords,
};

pub const DEFAULT_KERNEL_SIZE: usize = 2;

/// Information about a max pooling step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaxPool {
    pub kernel_size: usize,
    pub stride: usize,
    output_tile_c: u16,
}

impl MaxPool {
    pub fn new(flags: NodeFlags) -> Self {
        let kernel_size = match flags.kernel_size {
            0 => DEFAULT_KERNEL_SIZE,
            k => k as usize,
        };
        let stride = match flags.stride {
            0 => kernel_size,
            s => s as usize,
        };
        Self {
            kernel_size,
            stride,
            output_tile_c: flags.output_tile_c,
        }
    }

    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        check_arity("MaxPool", inputs, 1, 1)?;
        let [regions, c, h, w] = inputs[0].dims();
        invariant!(regions == 1, "MaxPool input has {regions} unmerged regions");
        invariant!(
            self.kernel_size <= h && self.kernel_size <= w,
            "MaxPool kernel {} larger than input {h}x{w}",
            self.kernel_size
        );
        Ok(OutputShape {
            dims: [
                1,
                c,
                (h - self.kernel_size) / self.stride + 1,
                (w - self.kernel_size) / self.stride + 1,
            ],
            tile_c: normalize_tile(self.output_tile_c, c),
            scale: inputs[0].scale,
        })
    }

    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        let x = &inputs[0].tensor;
        let k = self.kernel_size;
        max_element((0..k * k).map(|i| {
            x.at(
                0,
                at.channel,
                at.row * self.stride + i / k,
                at.col * self.stride + i % k,
            )
        }))
    }
}
