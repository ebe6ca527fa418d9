//! Job indexing over the tiled storage order of a layer's output.
//!
//! Outputs are stored region-major, then channel-tile-major; inside a tile values are stored in
//! `[row][col][channel]` order. A job is a run of `batch` consecutive stored values, so every job
//! covers a contiguous byte range and jobs complete in storage order.

use std::ops::Range;

use crate::{Result, invariant, tensor::Coords};

/// Mapping between storage offsets and tensor coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileLayout {
    dims: [usize; 4],
    tile_c: usize,
}

impl TileLayout {
    /// `tile_c` of 0 (or at least the channel count) means a single tile.
    pub fn new(dims: [usize; 4], tile_c: usize) -> Result<Self> {
        invariant!(!dims.contains(&0), "degenerate tensor shape {dims:?}");
        let tile_c = if tile_c == 0 { dims[1] } else { tile_c.min(dims[1]) };
        Ok(Self { dims, tile_c })
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn plane(&self) -> usize {
        self.dims[2] * self.dims[3]
    }

    fn region_len(&self) -> usize {
        self.dims[1] * self.plane()
    }

    pub fn offset_to_coords(&self, offset: usize) -> Result<Coords> {
        invariant!(
            offset < self.len(),
            "offset {offset} outside tensor of {} values",
            self.len()
        );
        let [_, channels, _, cols] = self.dims;
        let region = offset / self.region_len();
        let rem = offset % self.region_len();
        let full_tile = self.tile_c * self.plane();
        let tile = rem / full_tile;
        let within = rem % full_tile;
        let tile_width = self.tile_c.min(channels - tile * self.tile_c);
        let position = within / tile_width;
        Ok(Coords {
            region,
            channel: tile * self.tile_c + within % tile_width,
            row: position / cols,
            col: position % cols,
        })
    }

    pub fn coords_to_offset(&self, at: Coords) -> Result<usize> {
        let [regions, channels, rows, cols] = self.dims;
        invariant!(
            at.region < regions && at.channel < channels && at.row < rows && at.col < cols,
            "coordinates {at:?} outside tensor {:?}",
            self.dims
        );
        let tile = at.channel / self.tile_c;
        let tile_width = self.tile_c.min(channels - tile * self.tile_c);
        Ok(at.region * self.region_len()
            + tile * self.tile_c * self.plane()
            + (at.row * cols + at.col) * tile_width
            + at.channel % self.tile_c)
    }
}

/// Splits a layer's output into jobs of `batch` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobGeometry {
    layout: TileLayout,
    batch: usize,
}

impl JobGeometry {
    pub fn new(layout: TileLayout, batch: usize) -> Result<Self> {
        invariant!(batch > 0, "batch size must be positive");
        Ok(Self { layout, batch })
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn n_jobs(&self) -> usize {
        self.layout.len().div_ceil(self.batch)
    }

    /// Storage offsets written by `job`; the last job may be short.
    pub fn job_range(&self, job: usize) -> Result<Range<usize>> {
        invariant!(
            job < self.n_jobs(),
            "job {job} exceeds the {} jobs of the layer",
            self.n_jobs()
        );
        let start = job * self.batch;
        Ok(start..(start + self.batch).min(self.layout.len()))
    }

    /// Representative offset of `job`: the last value it writes. Strictly increasing in `job`.
    pub fn job_index_to_offset(&self, job: usize) -> Result<usize> {
        Ok(self.job_range(job)?.end - 1)
    }

    /// Jobs fully covered by the first `values` stored values.
    pub fn jobs_covering(&self, values: usize) -> usize {
        if values >= self.layout.len() {
            self.n_jobs()
        } else {
            values / self.batch
        }
    }

    /// Where the state bit convention of the output slot toggles once the layer is done: right
    /// after the last value the layer writes.
    pub fn flip_boundary(&self) -> usize {
        self.layout.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([1, 4, 3, 3], 0)]
    #[case([1, 5, 2, 3], 2)]
    #[case([3, 7, 2, 2], 3)]
    #[case([2, 6, 1, 1], 4)]
    fn offsets_and_coords_are_a_bijection(#[case] dims: [usize; 4], #[case] tile_c: usize) {
        let layout = TileLayout::new(dims, tile_c).unwrap();
        let mut seen = std::collections::HashSet::new();
        for offset in 0..layout.len() {
            let at = layout.offset_to_coords(offset).unwrap();
            assert!(seen.insert(at), "{at:?} produced twice");
            assert_eq!(layout.coords_to_offset(at).unwrap(), offset);
        }
        assert!(layout.offset_to_coords(layout.len()).is_err());
    }

    #[test]
    fn tiles_store_channels_innermost() {
        let layout = TileLayout::new([1, 4, 2, 2], 2).unwrap();
        // first tile: channels 0 and 1 interleaved per position
        assert_eq!(layout.offset_to_coords(0).unwrap(), Coords::new(0, 0, 0, 0));
        assert_eq!(layout.offset_to_coords(1).unwrap(), Coords::new(0, 1, 0, 0));
        assert_eq!(layout.offset_to_coords(2).unwrap(), Coords::new(0, 0, 0, 1));
        // second tile starts after the 8 values of the first
        assert_eq!(layout.offset_to_coords(8).unwrap(), Coords::new(0, 2, 0, 0));
    }

    #[test]
    fn short_last_tile() {
        let layout = TileLayout::new([1, 5, 1, 2], 2).unwrap();
        assert_eq!(layout.offset_to_coords(8).unwrap(), Coords::new(0, 4, 0, 0));
        assert_eq!(layout.offset_to_coords(9).unwrap(), Coords::new(0, 4, 0, 1));
    }

    #[rstest]
    fn representative_offsets_increase(#[values(1, 3, 4, 7, 64)] batch: usize) {
        let geometry = JobGeometry::new(TileLayout::new([2, 3, 3, 3], 2).unwrap(), batch).unwrap();
        let len = geometry.layout().len();
        assert_eq!(geometry.n_jobs(), len.div_ceil(batch));
        let offsets = (0..geometry.n_jobs())
            .map(|j| geometry.job_index_to_offset(j).unwrap())
            .collect::<Vec<_>>();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*offsets.last().unwrap(), len - 1);
        assert!(geometry.job_index_to_offset(geometry.n_jobs()).is_err());
    }

    #[test]
    fn completed_values_map_to_jobs() {
        let geometry = JobGeometry::new(TileLayout::new([1, 1, 1, 10], 0).unwrap(), 4).unwrap();
        assert_eq!(geometry.n_jobs(), 3);
        assert_eq!(geometry.job_range(2).unwrap(), 8..10);
        assert_eq!(geometry.jobs_covering(0), 0);
        assert_eq!(geometry.jobs_covering(7), 1);
        assert_eq!(geometry.jobs_covering(8), 2);
        assert_eq!(geometry.jobs_covering(10), 3);
        assert_eq!(geometry.flip_boundary(), 10);
    }
}
