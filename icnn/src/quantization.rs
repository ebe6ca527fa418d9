//! Q15 fixed point quantization.
//!
//! A stored value `q` with scale `s` represents `q * s / 2^15`. Scales are powers of two so that
//! products of scales stay exact in `f32`.
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Element;

/// Number of fractional bits of a stored value.
pub const FRACTIONAL_BITS: u32 = 15;
const ONE: f32 = (1u32 << FRACTIONAL_BITS) as f32;

/// Full storable range, before any bit is reserved by a progress tracker.
pub const MIN: Element = Element::MIN;
pub const MAX: Element = Element::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactor {
    scale: f32,
}

impl ScalingFactor {
    /// Smallest power of two scale able to represent `[-abs_max, abs_max]`.
    pub fn from_absolute_max(abs_max: f32) -> Self {
        let abs_max = abs_max.abs();
        let mut scale = 1.0f32;
        while scale < abs_max {
            scale *= 2.0;
        }
        Self { scale }
    }

    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f32>) -> Self {
        let abs_max = values.into_iter().fold(0.0f32, |a, b| a.max(b.abs()));
        Self::from_absolute_max(abs_max)
    }

    pub fn from_scale(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Scale of the product of two tensors.
    pub fn product(&self, other: &Self) -> Self {
        Self {
            scale: self.scale * other.scale,
        }
    }

    /// Take a floating point number and quantize it to a Q15 value, saturating out of range
    /// inputs.
    pub fn quantize(&self, value: &f32) -> Element {
        let scaled = (*value / self.scale * ONE).round();
        if scaled < MIN as f32 || scaled > MAX as f32 {
            warn!(
                "Quantized value {} from {} is out of range [{}, {}]",
                scaled, value, MIN, MAX
            );
        }
        scaled.clamp(MIN as f32, MAX as f32) as Element
    }

    pub fn dequantize(&self, value: &Element) -> f32 {
        *value as f32 * self.scale / ONE
    }
}

impl Default for ScalingFactor {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

/// Clamps an accumulator into `[range.0, range.1]`.
pub fn saturate(value: i64, range: (Element, Element)) -> Element {
    value.clamp(range.0 as i64, range.1 as i64) as Element
}
