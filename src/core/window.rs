use crate::core::block::Block;
use crate::types::{CalcError, CalcResult};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Odd window edge length (W in a W x W neighbourhood)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize(usize);

impl WindowSize {
    pub fn new(size: usize) -> CalcResult<Self> {
        if size < 1 || size % 2 == 0 {
            return Err(CalcError::Configuration(format!(
                "Window size must be odd and at least 1, got {}",
                size
            )));
        }
        Ok(Self(size))
    }

    pub fn get(&self) -> usize {
        self.0
    }

    /// Cells between the centre and the window edge
    pub fn radius(&self) -> usize {
        self.0 / 2
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self(3)
    }
}

/// What to do with pixels closer than the window radius to the raster edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EdgePolicy {
    /// No calculation; the cell receives the output nodata value
    Skip,
    /// Out-of-raster cells repeat the nearest edge pixel
    Replicate,
    /// Out-of-raster cells take a constant value
    Fill(f64),
}

impl Default for EdgePolicy {
    fn default() -> Self {
        EdgePolicy::Replicate
    }
}

/// Band x W x W neighbourhood around one centre pixel.
///
/// Backed by one contiguous (band, row, col) buffer reused for every
/// pixel of a run.
#[derive(Debug, Clone)]
pub struct PixelWindow {
    bands: usize,
    size: usize,
    data: Array3<f64>,
    row: usize,
    col: usize,
}

impl PixelWindow {
    pub fn new(bands: usize, size: WindowSize) -> Self {
        let w = size.get();
        Self {
            bands,
            size: w,
            data: Array3::zeros((bands, w, w)),
            row: 0,
            col: 0,
        }
    }

    /// Build a window directly from (band, row, col) ordered values
    pub fn from_values(bands: usize, size: WindowSize, values: Vec<f64>) -> CalcResult<Self> {
        let w = size.get();
        let n = values.len();
        let data = Array3::from_shape_vec((bands, w, w), values).map_err(|_| {
            CalcError::Configuration(format!(
                "Expected {} window values for {} bands of {}x{}, got {}",
                bands * w * w,
                bands,
                w,
                w,
                n
            ))
        })?;
        Ok(Self {
            bands,
            size: w,
            data,
            row: 0,
            col: 0,
        })
    }

    pub fn band_count(&self) -> usize {
        self.bands
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Raster position of the centre pixel
    pub fn position(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    #[inline]
    pub fn get(&self, band: usize, row: usize, col: usize) -> f64 {
        self.data[[band, row, col]]
    }

    pub fn centre(&self, band: usize) -> f64 {
        let mid = self.size / 2;
        self.get(band, mid, mid)
    }

    pub fn band(&self, band: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), band)
    }

    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    #[inline]
    fn set(&mut self, band: usize, row: usize, col: usize, value: f64) {
        self.data[[band, row, col]] = value;
    }
}

/// Fills a `PixelWindow` from a loaded block according to an edge policy
#[derive(Debug, Clone)]
pub struct WindowExtractor {
    size: WindowSize,
    edge: EdgePolicy,
    rows: usize,
    cols: usize,
}

impl WindowExtractor {
    pub fn new(size: WindowSize, edge: EdgePolicy, rows: usize, cols: usize) -> Self {
        Self {
            size,
            edge,
            rows,
            cols,
        }
    }

    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// True when the full window around (row, col) lies inside the raster
    pub fn is_interior(&self, row: usize, col: usize) -> bool {
        let r = self.size.radius();
        row >= r && col >= r && row + r < self.rows && col + r < self.cols
    }

    /// Fill `window` for the pixel at raster (row, col).
    ///
    /// Returns false, leaving `window` unchanged, when the edge policy is
    /// `Skip` and the window would cross the raster boundary.
    pub fn extract(&self, block: &Block, row: usize, col: usize, window: &mut PixelWindow) -> bool {
        let interior = self.is_interior(row, col);
        if !interior && self.edge == EdgePolicy::Skip {
            return false;
        }

        let w = self.size.get();
        let r = self.size.radius() as isize;
        window.row = row;
        window.col = col;

        for band in 0..window.bands {
            for wr in 0..w {
                let rr = row as isize + wr as isize - r;
                for wc in 0..w {
                    let cc = col as isize + wc as isize - r;
                    let value = if interior || self.inside(rr, cc) {
                        block.value(band, rr as usize, cc as usize)
                    } else {
                        match self.edge {
                            EdgePolicy::Fill(fill) => fill,
                            _ => {
                                let cr = rr.clamp(0, self.rows as isize - 1) as usize;
                                let ccl = cc.clamp(0, self.cols as isize - 1) as usize;
                                block.value(band, cr, ccl)
                            }
                        }
                    };
                    window.set(band, wr, wc, value);
                }
            }
        }
        true
    }

    fn inside(&self, row: isize, col: isize) -> bool {
        row >= 0 && col >= 0 && (row as usize) < self.rows && (col as usize) < self.cols
    }
}
