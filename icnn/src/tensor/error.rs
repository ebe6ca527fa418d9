//! Error enum for [`super::Tensor`] construction and indexing.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {dims:?} holds {expected} values but {actual} were given")]
    ShapeMismatch {
        dims: [usize; 4],
        expected: usize,
        actual: usize,
    },
    #[error("coordinate {index} is out of bounds for dimension {axis} of size {size}")]
    OutOfBounds {
        axis: usize,
        index: usize,
        size: usize,
    },
    #[error("degenerate shape {0:?}")]
    EmptyDimension([usize; 4]),
}
