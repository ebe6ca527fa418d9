use super::{Operand, OutputShape, bias_at, check_arity, check_bias, normalize_tile, regions, rescale};
use crate::{
    Result, invariant,
    model::{NodeFlags, ParameterInfo},
    tensor::Coords,
};

/// Dense layer: the input is flattened to `K` features and multiplied by a `K x N` matrix, or an
/// `N x K` one when the weights are marked transposed. Splitting the features in tiles produces
/// partial sum regions like a tiled convolution.
#[derive(Clone, Debug)]
pub struct Gemm {
    pub tile_channel: u16,
    output_tile_c: u16,
}

impl Gemm {
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            tile_channel: flags.tile_channel,
            output_tile_c: flags.output_tile_c,
        }
    }

    fn features(x: &ParameterInfo) -> usize {
        let [_, c, h, w] = x.dims();
        c * h * w
    }

    /// `(K, N)` of the weights.
    fn weight_dims(weights: &ParameterInfo) -> (usize, usize) {
        let [rows, cols, _, _] = weights.dims();
        if weights.transposed {
            (cols, rows)
        } else {
            (rows, cols)
        }
    }

    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        check_arity("Gemm", inputs, 2, 3)?;
        let [regions_in, ..] = inputs[0].dims();
        invariant!(regions_in == 1, "Gemm input has {regions_in} unmerged regions");
        let [.., wh, ww] = inputs[1].dims();
        invariant!(
            wh == 1 && ww == 1,
            "Gemm weights must be a matrix, got {:?}",
            inputs[1].dims
        );
        let k = Self::features(&inputs[0]);
        let (wk, n) = Self::weight_dims(&inputs[1]);
        invariant!(wk == k, "Gemm weights expect {wk} features, input has {k}");
        check_bias("Gemm", inputs, n)?;
        Ok(OutputShape {
            dims: [regions(k, normalize_tile(self.tile_channel, k)), n, 1, 1],
            tile_c: normalize_tile(self.output_tile_c, n),
            scale: inputs[0].scale * inputs[1].scale,
        })
    }

    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        let x = inputs[0].tensor.region(0);
        let weights = &inputs[1];
        let k = x.len();
        let tile = match normalize_tile(self.tile_channel, k) {
            0 => k,
            t => t,
        };
        let first = at.region * tile;
        let last = (first + tile).min(k);
        let n = at.channel;
        let acc: i64 = (first..last)
            .map(|i| {
                let w = if weights.info.transposed {
                    weights.tensor.at(n, i, 0, 0)
                } else {
                    weights.tensor.at(i, n, 0, 0)
                };
                x[i] as i64 * w as i64
            })
            .sum();
        let bias = if at.region == 0 { bias_at(inputs, n) } else { 0 };
        rescale(acc) + bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{info, operand};

    const HALF: i16 = 1 << 14;

    #[test]
    fn transposed_weights_give_same_result() {
        // x = [0.5, 0.5, 0.5], W = [[0.5, 0], [0.5, 0.5], [0, 0.5]] (K x N)
        let x = operand(0, [1, 3, 1, 1], vec![HALF; 3]);
        let plain = operand(1, [3, 2, 1, 1], vec![HALF, 0, HALF, HALF, 0, HALF]);
        let mut transposed = operand(1, [2, 3, 1, 1], vec![HALF, HALF, 0, 0, HALF, HALF]);
        transposed.info.transposed = true;

        let gemm = Gemm::new(NodeFlags::default());
        let a = [x.clone(), plain];
        let b = [x, transposed];
        for n in 0..2 {
            let at = Coords::new(0, n, 0, 0);
            assert_eq!(gemm.compute(&a, at), 2 * (1 << 13));
            assert_eq!(gemm.compute(&a, at), gemm.compute(&b, at));
        }
    }

    #[test]
    fn feature_tiles_make_regions() {
        let gemm = Gemm::new(NodeFlags {
            tile_channel: 4,
            ..Default::default()
        });
        let shape = gemm
            .output_shape(&[info(0, [1, 2, 3, 2], 1.0), info(1, [12, 5, 1, 1], 0.5)])
            .unwrap();
        assert_eq!(shape.dims, [3, 5, 1, 1]);
        assert_eq!(shape.scale, 0.5);
    }

    #[test]
    fn feature_count_must_match() {
        let gemm = Gemm::new(NodeFlags::default());
        assert!(
            gemm.output_shape(&[info(0, [1, 2, 3, 2], 1.0), info(1, [10, 5, 1, 1], 1.0)])
                .is_err()
        );
    }
}
