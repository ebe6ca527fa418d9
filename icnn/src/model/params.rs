use crate::{
    ELEMENT_BITS, ELEMENT_BYTES, Result,
    codec::{Decoder, Encoder},
    fatal, invariant,
    layers::OutputShape,
};

/// Where a tensor lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SlotId {
    #[display("slot {_0}")]
    Intermediate(u8),
    /// Weights and biases blob.
    #[display("parameters")]
    Parameters,
    /// Network input, offset by the current sample.
    #[display("samples")]
    Samples,
    /// An intermediate tensor whose layer has not run yet.
    #[display("unassigned")]
    Unassigned,
}

impl SlotId {
    pub const MAX_INTERMEDIATE: u8 = 0xF0;

    fn to_byte(self) -> u8 {
        match self {
            SlotId::Intermediate(slot) => slot,
            SlotId::Unassigned => 0xFD,
            SlotId::Parameters => 0xFE,
            SlotId::Samples => 0xFF,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            slot if slot < Self::MAX_INTERMEDIATE => Ok(SlotId::Intermediate(slot)),
            0xFD => Ok(SlotId::Unassigned),
            0xFE => Ok(SlotId::Parameters),
            0xFF => Ok(SlotId::Samples),
            other => Err(fatal!("invalid slot id {other:#04x}")),
        }
    }
}

/// Description of one tensor: a constant, the network input or a layer output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterInfo {
    pub index: u16,
    pub slot: SlotId,
    /// Byte offset within the slot or blob.
    pub offset: u32,
    /// Length in bytes.
    pub len: u32,
    pub bitwidth: u8,
    /// `[regions, channels, rows, cols]`
    pub dims: [u16; 4],
    /// Channels per storage tile, 0 for untiled tensors.
    pub tile_c: u16,
    /// Set on dense weights stored output-major.
    pub transposed: bool,
    pub scale: f32,
}

pub const PARAMETER_INFO_LEN: usize = 2 + 1 + 4 + 4 + 1 + 8 + 2 + 1 + 4;

impl ParameterInfo {
    /// Output of layer `index`, not yet placed in a slot.
    pub fn planned(index: u16, shape: &OutputShape) -> Result<Self> {
        let mut dims = [0u16; 4];
        for (out, &d) in dims.iter_mut().zip(shape.dims.iter()) {
            *out = u16::try_from(d).map_err(|_| fatal!("dimension {d} of tensor {index} too large"))?;
        }
        let values: usize = shape.dims.iter().product();
        Ok(Self {
            index,
            slot: SlotId::Unassigned,
            offset: 0,
            len: u32::try_from(values * ELEMENT_BYTES)
                .map_err(|_| fatal!("tensor {index} too large"))?,
            bitwidth: ELEMENT_BITS,
            dims,
            tile_c: u16::try_from(shape.tile_c)
                .map_err(|_| fatal!("tile of tensor {index} too large"))?,
            transposed: false,
            scale: shape.scale,
        })
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims.map(usize::from)
    }

    pub fn n_values(&self) -> usize {
        self.len as usize / ELEMENT_BYTES
    }

    /// Checks the record is the one stored under `index` and describes a readable tensor.
    pub fn validate(&self, index: u16) -> Result<()> {
        invariant!(
            self.index == index,
            "parameter info {index} holds the record of tensor {}",
            self.index
        );
        invariant!(
            self.bitwidth == ELEMENT_BITS,
            "tensor {index} has unexpected bit-width {}",
            self.bitwidth
        );
        invariant!(
            !self.dims.contains(&0),
            "tensor {index} has a missing dimension: {:?}",
            self.dims
        );
        let values: usize = self.dims().iter().product();
        invariant!(
            values * ELEMENT_BYTES == self.len as usize,
            "tensor {index} is {} bytes long but its shape {:?} needs {}",
            self.len,
            self.dims,
            values * ELEMENT_BYTES
        );
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(PARAMETER_INFO_LEN);
        enc.u16(self.index)
            .u8(self.slot.to_byte())
            .u32(self.offset)
            .u32(self.len)
            .u8(self.bitwidth);
        for d in self.dims {
            enc.u16(d);
        }
        enc.u16(self.tile_c).bool(self.transposed).f32(self.scale);
        enc.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            index: dec.u16()?,
            slot: SlotId::from_byte(dec.u8()?)?,
            offset: dec.u32()?,
            len: dec.u32()?,
            bitwidth: dec.u8()?,
            dims: [dec.u16()?, dec.u16()?, dec.u16()?, dec.u16()?],
            tile_c: dec.u16()?,
            transposed: dec.bool()?,
            scale: dec.f32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ParameterInfo {
        ParameterInfo {
            index: 5,
            slot: SlotId::Intermediate(1),
            offset: 0,
            len: 2 * 3 * 4 * 4 * 2,
            bitwidth: 16,
            dims: [2, 3, 4, 4],
            tile_c: 2,
            transposed: false,
            scale: 0.25,
        }
    }

    #[test]
    fn record_has_fixed_length() {
        let bytes = info().encode();
        assert_eq!(bytes.len(), PARAMETER_INFO_LEN);
        assert_eq!(ParameterInfo::decode(&bytes).unwrap(), info());
    }

    #[test]
    fn validation_catches_corruption() {
        assert!(info().validate(5).is_ok());
        assert!(info().validate(6).is_err());
        let mut bad = info();
        bad.bitwidth = 8;
        assert!(bad.validate(5).is_err());
        let mut bad = info();
        bad.dims[2] = 0;
        assert!(bad.validate(5).is_err());
        let mut bad = info();
        bad.len -= 2;
        assert!(bad.validate(5).is_err());
    }

    #[test]
    fn slot_ids_survive_encoding() {
        for slot in [
            SlotId::Intermediate(0),
            SlotId::Intermediate(7),
            SlotId::Parameters,
            SlotId::Samples,
            SlotId::Unassigned,
        ] {
            assert_eq!(SlotId::from_byte(slot.to_byte()).unwrap(), slot);
        }
        assert!(SlotId::from_byte(0xF5).is_err());
    }
}
