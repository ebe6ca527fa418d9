use super::{Operand, OutputShape, bias_at, check_arity, check_bias, normalize_tile, regions, rescale};
use crate::{
    Result, invariant,
    model::{NodeFlags, ParameterInfo},
    tensor::Coords,
};

/// Unpadded 2D convolution. Splitting the input channels in tiles produces one partial sum
/// region per tile, to be summed by a following `ConvMerge`.
#[derive(Clone, Debug)]
pub struct Conv {
    pub stride: usize,
    pub input_tile_c: u16,
    output_tile_c: u16,
}

impl Conv {
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            stride: flags.stride.max(1) as usize,
            input_tile_c: flags.input_tile_c,
            output_tile_c: flags.output_tile_c,
        }
    }

    fn input_tile(&self, channels: usize) -> usize {
        match normalize_tile(self.input_tile_c, channels) {
            0 => channels,
            t => t,
        }
    }

    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        check_arity("Conv", inputs, 2, 3)?;
        let [regions_in, cin, h, w] = inputs[0].dims();
        let [cout, wcin, kh, kw] = inputs[1].dims();
        invariant!(regions_in == 1, "Conv input has {regions_in} unmerged regions");
        invariant!(
            wcin == cin,
            "Conv filter expects {wcin} input channels, input has {cin}"
        );
        invariant!(
            kh <= h && kw <= w,
            "Conv kernel {kh}x{kw} larger than input {h}x{w}"
        );
        check_bias("Conv", inputs, cout)?;
        let tile = normalize_tile(self.input_tile_c, cin);
        Ok(OutputShape {
            dims: [
                regions(cin, tile),
                cout,
                (h - kh) / self.stride + 1,
                (w - kw) / self.stride + 1,
            ],
            tile_c: normalize_tile(self.output_tile_c, cout),
            scale: inputs[0].scale * inputs[1].scale,
        })
    }

    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        let x = &inputs[0].tensor;
        let filter = &inputs[1].tensor;
        let cin = x.dims()[1];
        let [_, _, kh, kw] = filter.dims();
        let tile = self.input_tile(cin);
        let first = at.region * tile;
        let last = (first + tile).min(cin);
        let mut acc = 0i64;
        for ci in first..last {
            for i in 0..kh {
                for j in 0..kw {
                    let value = x.at(0, ci, at.row * self.stride + i, at.col * self.stride + j);
                    acc += value as i64 * filter.at(at.channel, ci, i, j) as i64;
                }
            }
        }
        let bias = if at.region == 0 {
            bias_at(inputs, at.channel)
        } else {
            0
        };
        rescale(acc) + bias
    }
}
