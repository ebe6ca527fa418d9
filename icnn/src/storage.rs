//! Region aware access to the medium.
//!
//! Every write is checked against the layout: slot data may never spill into another slot or
//! into metadata, and metadata regions only accept whole records. The only partial metadata
//! write is a lone version byte, used to invalidate a two-copy record.

use tracing::trace;

use crate::{
    Result, invariant,
    layout::{Granule, HEADER_LEN, Header, NvmLayout, RegionKind},
    nvm::Nvm,
};

pub struct Storage<N> {
    nvm: N,
    layout: NvmLayout,
    bytes_written: u64,
}

impl<N: Nvm> Storage<N> {
    pub fn new(nvm: N, layout: NvmLayout) -> Result<Self> {
        invariant!(
            nvm.len() >= layout.total_len(),
            "NVM of {} bytes is too small for a layout of {} bytes",
            nvm.len(),
            layout.total_len()
        );
        Ok(Self {
            nvm,
            layout,
            bytes_written: 0,
        })
    }

    /// Reads the header of a medium, `None` if it was never provisioned.
    pub fn read_header(nvm: &N) -> Result<Option<Header>> {
        if nvm.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LEN];
        nvm.read(0, &mut buf)?;
        Header::decode(&buf)
    }

    pub fn layout(&self) -> &NvmLayout {
        &self.layout
    }

    pub fn header(&self) -> &Header {
        &self.layout.header
    }

    /// Durable bytes written through this handle since it was created.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> N {
        self.nvm
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.nvm.read(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.nvm.read(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_write(offset, data.len())?;
        trace!(offset, len = data.len(), "NVM write");
        self.raw_write(offset, data)
    }

    fn raw_write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        // counted before the call so that a cut write still shows up
        self.bytes_written += data.len() as u64;
        self.nvm.write(offset, data)
    }

    /// Zeroes a whole region.
    pub fn erase(&mut self, kind: RegionKind) -> Result<()> {
        let region = self.layout.region(kind);
        if region.len > 0 {
            self.raw_write(region.start, &vec![0u8; region.len])?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.nvm.flush()
    }

    /// Reads record `index` of a single-copy record region.
    pub fn read_record(&self, kind: RegionKind, index: usize) -> Result<Vec<u8>> {
        let (offset, len) = self.record_span(kind, index)?;
        self.read(offset, len)
    }

    pub fn write_record(&mut self, kind: RegionKind, index: usize, data: &[u8]) -> Result<()> {
        let (offset, len) = self.record_span(kind, index)?;
        invariant!(
            data.len() == len,
            "{kind} record is {len} bytes, got {}",
            data.len()
        );
        self.write(offset, data)
    }

    fn record_span(&self, kind: RegionKind, index: usize) -> Result<(usize, usize)> {
        let region = self.layout.region(kind);
        let Granule::Records(len) = region.granule else {
            return Err(crate::fatal!("{kind} is not a single-copy record region"));
        };
        invariant!(
            (index + 1) * len <= region.len,
            "{kind} record {index} out of range"
        );
        Ok((region.start + index * len, len))
    }

    pub fn read_slot(&self, slot: u8, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_slot_span(slot, offset, len)?;
        self.read(self.layout.slot_start(slot) + offset, len)
    }

    pub fn write_slot(&mut self, slot: u8, offset: usize, data: &[u8]) -> Result<()> {
        self.check_slot_span(slot, offset, data.len())?;
        self.write(self.layout.slot_start(slot) + offset, data)
    }

    fn check_slot_span(&self, slot: u8, offset: usize, len: usize) -> Result<()> {
        let config = &self.layout.header.config;
        invariant!(slot < config.num_slots, "slot {slot} does not exist");
        invariant!(
            offset + len <= config.slot_size as usize,
            "access of {len} bytes at {offset} overflows slot {slot}"
        );
        Ok(())
    }

    /// Reads `len` bytes at `offset` within a blob region.
    pub fn read_blob(&self, kind: RegionKind, offset: usize, len: usize) -> Result<Vec<u8>> {
        let region = self.layout.region(kind);
        invariant!(
            offset + len <= region.len,
            "read of {len} bytes at {offset} overflows the {kind} region"
        );
        self.read(region.start + offset, len)
    }

    fn check_write(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let region = self.layout.region_at(offset)?;
        let kind = region.kind;
        invariant!(
            offset + len <= region.end(),
            "write of {len} bytes at {offset} crosses the end of the {kind} region"
        );
        let rel = offset - region.start;
        match region.granule {
            Granule::Bytes => {}
            Granule::Records(record) => invariant!(
                rel % record == 0 && len % record == 0,
                "partial {kind} record write of {len} bytes at {offset}"
            ),
            Granule::TwoCopy(stride) => invariant!(
                (rel % stride == 0 && len == stride) || (len == 1 && rel % stride == stride - 1),
                "partial {kind} copy write of {len} bytes at {offset}"
            ),
            Granule::Slots(size) => invariant!(
                rel / size == (rel + len - 1) / size,
                "write of {len} bytes at {offset} crosses a slot boundary"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::tests::sample_header, nvm::MemNvm};

    fn storage() -> Storage<MemNvm> {
        let layout = NvmLayout::new(sample_header()).unwrap();
        Storage::new(MemNvm::new(layout.total_len()), layout).unwrap()
    }

    #[test]
    fn slot_writes_stay_in_their_slot() {
        let mut storage = storage();
        assert!(storage.write_slot(0, 60, &[1; 4]).is_ok());
        assert!(storage.write_slot(0, 62, &[1; 4]).is_err());
        assert!(storage.write_slot(2, 0, &[1]).is_err());
        let start = storage.layout().slot_start(0);
        assert!(storage.write(start + 60, &[0; 8]).is_err());
    }

    #[test]
    fn metadata_writes_are_whole_records() {
        let mut storage = storage();
        let model = storage.layout().region(RegionKind::Model);
        let Granule::TwoCopy(stride) = model.granule else {
            panic!("model is a two-copy region")
        };
        assert!(storage.write(model.start, &vec![0; stride]).is_ok());
        assert!(storage.write(model.start + stride, &vec![0; stride]).is_ok());
        assert!(storage.write(model.start, &vec![0; stride - 1]).is_err());
        // invalidating a copy touches only its version byte
        assert!(storage.write(model.start + stride - 1, &[0]).is_ok());
        assert!(storage.write(model.start + 1, &[0]).is_err());

        let nodes = storage.layout().region(RegionKind::Nodes);
        assert!(storage.write(nodes.start + 1, &[0; 2]).is_err());
    }

    #[test]
    fn writes_never_cross_regions() {
        let mut storage = storage();
        let labels = storage.layout().region(RegionKind::Labels);
        let samples = storage.layout().region(RegionKind::Samples);
        assert!(storage.write(samples.end() - 1, &[0; 2]).is_err());
        assert!(storage.write(labels.start, &[7, 8]).is_ok());
        assert_eq!(storage.read_blob(RegionKind::Labels, 0, 2).unwrap(), vec![7, 8]);
        assert_eq!(storage.bytes_written(), 2);
    }

    #[test]
    fn header_round_trips_through_the_medium() {
        let mut storage = storage();
        let header = sample_header();
        storage
            .write_record(RegionKind::Header, 0, &header.encode())
            .unwrap();
        let nvm = storage.into_inner();
        assert_eq!(Storage::read_header(&nvm).unwrap(), Some(header));
    }
}
