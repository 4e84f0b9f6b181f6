use crate::io::RasterStack;
use crate::types::{BandCube, CalcError, CalcResult};
use ndarray::{s, Array3};

/// Row range of one strip, with the halo rows needed by window operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripBounds {
    pub index: usize,

    // Rows produced by this strip
    pub row_start: usize,
    pub row_end: usize,

    // Rows read from the inputs (row range plus halo, clipped to the raster)
    pub read_start: usize,
    pub read_end: usize,
}

impl StripBounds {
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn read_rows(&self) -> usize {
        self.read_end - self.read_start
    }

    pub fn pad_top(&self) -> usize {
        self.row_start - self.read_start
    }

    pub fn pad_bottom(&self) -> usize {
        self.read_end - self.row_end
    }
}

/// Top-to-bottom partition of a raster into horizontal strips
#[derive(Debug, Clone)]
pub struct StripPlan {
    height: usize,
    block_rows: usize,
    halo: usize,
    pub num_strips: usize,
}

impl StripPlan {
    pub fn new(height: usize, block_rows: usize, halo: usize) -> CalcResult<Self> {
        if block_rows == 0 {
            return Err(CalcError::Configuration(
                "Block height must be at least one row".to_string(),
            ));
        }
        let num_strips = (height + block_rows - 1) / block_rows;

        log::debug!(
            "StripPlan: {} rows, block_rows={}, halo={} -> {} strips",
            height,
            block_rows,
            halo,
            num_strips
        );

        Ok(Self {
            height,
            block_rows,
            halo,
            num_strips,
        })
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn halo(&self) -> usize {
        self.halo
    }

    pub fn strip(&self, index: usize) -> StripBounds {
        let row_start = index * self.block_rows;
        let row_end = ((index + 1) * self.block_rows).min(self.height);
        StripBounds {
            index,
            row_start,
            row_end,
            read_start: row_start.saturating_sub(self.halo),
            read_end: (row_end + self.halo).min(self.height),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = StripBounds> + '_ {
        (0..self.num_strips).map(move |i| self.strip(i))
    }
}

/// Input strip buffer covering every band of a stack.
///
/// Allocated once per run with room for the largest strip and reloaded
/// for each strip; rows beyond the current strip are left untouched.
pub struct Block {
    data: BandCube,
    bounds: Option<StripBounds>,
}

impl Block {
    pub fn new(bands: usize, cols: usize, plan: &StripPlan) -> Self {
        let capacity = plan.block_rows() + 2 * plan.halo();
        Self {
            data: Array3::zeros((bands, capacity, cols)),
            bounds: None,
        }
    }

    /// Read the rows of `bounds` (including halo) from the stack
    pub fn load(&mut self, stack: &mut RasterStack, bounds: StripBounds) -> CalcResult<()> {
        let rows = bounds.read_rows();
        let view = self.data.slice_mut(s![.., 0..rows, ..]);
        stack.read_rows(bounds.read_start, view)?;
        self.bounds = Some(bounds);
        Ok(())
    }

    pub fn bounds(&self) -> Option<StripBounds> {
        self.bounds
    }

    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    /// Value at a raster row that lies within the loaded read range
    #[inline]
    pub fn value(&self, band: usize, row: usize, col: usize) -> f64 {
        let start = self.bounds.map(|b| b.read_start).unwrap_or(0);
        self.data[[band, row - start, col]]
    }

    /// Copy every band value at (row, col) into `out`
    pub fn pixel(&self, row: usize, col: usize, out: &mut [f64]) {
        for (band, slot) in out.iter_mut().enumerate() {
            *slot = self.value(band, row, col);
        }
    }
}

/// Output strip buffer, written back to a sink once per strip
pub struct OutputBlock {
    data: BandCube,
}

impl OutputBlock {
    pub fn new(bands: usize, cols: usize, block_rows: usize) -> Self {
        Self {
            data: Array3::zeros((bands, block_rows, cols)),
        }
    }

    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    /// Store one pixel's output vector at strip-local row `local_row`
    #[inline]
    pub fn set_pixel(&mut self, local_row: usize, col: usize, values: &[f64]) {
        for (band, &v) in values.iter().enumerate() {
            self.data[[band, local_row, col]] = v;
        }
    }

    pub fn fill_pixel(&mut self, local_row: usize, col: usize, value: f64) {
        for band in 0..self.band_count() {
            self.data[[band, local_row, col]] = value;
        }
    }

    pub fn view(&self, rows: usize) -> ndarray::ArrayView3<'_, f64> {
        self.data.slice(s![.., 0..rows, ..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_plan_covers_raster_once() {
        let plan = StripPlan::new(10, 4, 1).unwrap();
        assert_eq!(plan.num_strips, 3);

        let strips: Vec<_> = plan.iter().collect();
        let covered: usize = strips.iter().map(|s| s.rows()).sum();
        assert_eq!(covered, 10);
        assert_eq!(strips[0].row_start, 0);
        assert_eq!(strips[2].row_end, 10);
        for pair in strips.windows(2) {
            assert_eq!(pair[0].row_end, pair[1].row_start);
        }
    }

    #[test]
    fn test_strip_halo_clipped_at_edges() {
        let plan = StripPlan::new(10, 4, 2).unwrap();

        let first = plan.strip(0);
        assert_eq!(first.read_start, 0);
        assert_eq!(first.pad_top(), 0);
        assert_eq!(first.read_end, 6);

        let middle = plan.strip(1);
        assert_eq!(middle.read_start, 2);
        assert_eq!(middle.read_end, 10);
        assert_eq!(middle.pad_top(), 2);
        assert_eq!(middle.pad_bottom(), 2);

        let last = plan.strip(2);
        assert_eq!(last.rows(), 2);
        assert_eq!(last.pad_bottom(), 0);
    }

    #[test]
    fn test_zero_block_rows_rejected() {
        assert!(matches!(
            StripPlan::new(10, 0, 0),
            Err(CalcError::Configuration(_))
        ));
    }
}
