use super::{Operand, OutputShape, check_arity, normalize_tile};
use crate::{
    Result,
    model::{NodeFlags, ParameterInfo},
    tensor::Coords,
};

#[derive(Clone, Debug)]
pub struct Relu {
    output_tile_c: u16,
}

impl Relu {
    pub fn new(flags: NodeFlags) -> Self {
        Self {
            output_tile_c: flags.output_tile_c,
        }
    }

    pub fn output_shape(&self, inputs: &[ParameterInfo]) -> Result<OutputShape> {
        check_arity("Relu", inputs, 1, 1)?;
        let dims = inputs[0].dims();
        Ok(OutputShape {
            dims,
            tile_c: normalize_tile(self.output_tile_c, dims[1]),
            scale: inputs[0].scale,
        })
    }

    pub fn compute(&self, inputs: &[Operand], at: Coords) -> i64 {
        (inputs[0].tensor.at(at.region, at.channel, at.row, at.col) as i64).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::operand;

    #[test]
    fn negative_values_are_clamped() {
        let relu = Relu::new(NodeFlags::default());
        let inputs = [operand(0, [1, 1, 1, 3], vec![-4, 0, 9])];
        let out = (0..3)
            .map(|col| relu.compute(&inputs, Coords::new(0, 0, 0, col)))
            .collect::<Vec<_>>();
        assert_eq!(out, vec![0, 0, 9]);
    }
}
