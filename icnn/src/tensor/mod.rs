//! Dense four dimensional tensors used by the kernels.
//!
//! Dimensions are always `[regions, channels, rows, cols]`. A region is an independent partial
//! result (one per input channel tile of a convolution); most tensors have a single one.

mod error;

pub use error::TensorError;

use itertools::Itertools;

use crate::Element;

/// Position of one value inside a `[regions, channels, rows, cols]` tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Coords {
    pub region: usize,
    pub channel: usize,
    pub row: usize,
    pub col: usize,
}

impl Coords {
    pub fn new(region: usize, channel: usize, row: usize, col: usize) -> Self {
        Self {
            region,
            channel,
            row,
            col,
        }
    }

    fn as_array(&self) -> [usize; 4] {
        [self.region, self.channel, self.row, self.col]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tensor {
    dims: [usize; 4],
    data: Vec<Element>,
}

impl Tensor {
    pub fn new(dims: [usize; 4], data: Vec<Element>) -> Result<Self, TensorError> {
        if dims.contains(&0) {
            return Err(TensorError::EmptyDimension(dims));
        }
        let expected = dims.iter().product();
        if data.len() != expected {
            return Err(TensorError::ShapeMismatch {
                dims,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    pub fn zeros(dims: [usize; 4]) -> Result<Self, TensorError> {
        Self::new(dims, vec![0; dims.iter().product()])
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn data(&self) -> &[Element] {
        &self.data
    }

    pub fn into_data(self) -> Vec<Element> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row major position of `coords` in the backing vector.
    pub fn flat_index(&self, coords: Coords) -> Result<usize, TensorError> {
        coords
            .as_array()
            .iter()
            .zip(self.dims.iter())
            .enumerate()
            .try_fold(0, |acc, (axis, (&index, &size))| {
                if index >= size {
                    Err(TensorError::OutOfBounds { axis, index, size })
                } else {
                    Ok(acc * size + index)
                }
            })
    }

    pub fn get(&self, coords: Coords) -> Result<Element, TensorError> {
        Ok(self.data[self.flat_index(coords)?])
    }

    pub fn set(&mut self, coords: Coords, value: Element) -> Result<(), TensorError> {
        let index = self.flat_index(coords)?;
        self.data[index] = value;
        Ok(())
    }

    /// Unchecked access for kernels whose shapes were validated up front.
    pub(crate) fn at(&self, region: usize, channel: usize, row: usize, col: usize) -> Element {
        let [_, c, h, w] = self.dims;
        self.data[((region * c + channel) * h + row) * w + col]
    }

    /// Values of one region in `[channel][row][col]` order.
    pub(crate) fn region(&self, region: usize) -> &[Element] {
        let size = self.dims[1] * self.dims[2] * self.dims[3];
        &self.data[region * size..(region + 1) * size]
    }

    /// Index of the largest value, the first one on ties.
    pub fn argmax(&self) -> Option<usize> {
        self.data
            .iter()
            .position_min_by_key(|&&v| std::cmp::Reverse(v))
    }

    pub fn dequantize(&self, scale: &crate::quantization::ScalingFactor) -> Vec<f32> {
        self.data.iter().map(|v| scale.dequantize(v)).collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_is_row_major() {
        let t = Tensor::new([2, 3, 2, 2], (0..24).collect()).unwrap();
        assert_eq!(t.flat_index(Coords::new(1, 2, 1, 0)).unwrap(), 12 + 8 + 2);
        assert_eq!(t.get(Coords::new(1, 2, 1, 1)).unwrap(), 23);
        assert_eq!(t.at(0, 1, 0, 1), 5);
        assert_eq!(t.region(1)[0], 12);
    }

    #[test]
    fn out_of_bounds_names_the_axis() {
        let t = Tensor::zeros([1, 2, 3, 4]).unwrap();
        assert_eq!(
            t.get(Coords::new(0, 0, 3, 0)),
            Err(TensorError::OutOfBounds {
                axis: 2,
                index: 3,
                size: 3
            })
        );
    }

    #[test]
    fn shape_must_match_data() {
        assert!(matches!(
            Tensor::new([1, 1, 2, 2], vec![0; 3]),
            Err(TensorError::ShapeMismatch { expected: 4, .. })
        ));
        assert!(Tensor::new([1, 0, 2, 2], vec![]).is_err());
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        let t = Tensor::new([1, 4, 1, 1], vec![3, 9, 9, -2]).unwrap();
        assert_eq!(t.argmax(), Some(1));
    }
}
