//! Calculation unit contracts
//!
//! A calculation unit declares which iteration protocols it supports by
//! returning itself from `as_pixel`, `as_window` or `as_zone`. The engine
//! asks for the capability it needs before reading any data, so using a
//! unit with the wrong protocol fails immediately with
//! `CalcError::NotImplemented` instead of part way through a run.

use crate::core::window::PixelWindow;
use crate::core::zonal::ZoneTable;
use crate::types::{CalcError, CalcResult, Protocol};

/// Shape of the band vector presented to a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandLayout {
    /// Leading bands presented as integers (masks, clump ids)
    pub int_bands: usize,
    /// Total number of bands
    pub total_bands: usize,
}

impl BandLayout {
    pub fn float_bands(&self) -> usize {
        self.total_bands - self.int_bands
    }

    /// Configuration error unless `band` indexes the band vector
    pub fn check_band(&self, band: usize, unit: &str) -> CalcResult<()> {
        if band >= self.total_bands {
            return Err(CalcError::Configuration(format!(
                "{}: band {} is not within the {} input bands",
                unit, band, self.total_bands
            )));
        }
        Ok(())
    }
}

/// One pixel's input as seen by a per-pixel or per-zone unit
#[derive(Debug, Clone, Copy)]
pub struct PixelInput<'a> {
    pub row: usize,
    pub col: usize,
    /// Map coordinates of the pixel centre (pixel coordinates without a geotransform)
    pub x: f64,
    pub y: f64,
    /// Every band as f64, in stack order
    pub values: &'a [f64],
    /// The leading integer bands, truncated to i64
    pub ints: &'a [i64],
    /// The remaining floating point bands
    pub floats: &'a [f64],
}

/// Inclusive region that restricts which pixels a statistic sees
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Envelope {
    /// Row and column bounds, both ends included
    Pixels {
        row_min: usize,
        row_max: usize,
        col_min: usize,
        col_max: usize,
    },
    /// Map bounds tested against the pixel centre
    Map { x_min: f64, x_max: f64, y_min: f64, y_max: f64 },
}

impl Envelope {
    pub fn contains(&self, input: &PixelInput<'_>) -> bool {
        match *self {
            Envelope::Pixels {
                row_min,
                row_max,
                col_min,
                col_max,
            } => (row_min..=row_max).contains(&input.row) && (col_min..=col_max).contains(&input.col),
            Envelope::Map { x_min, x_max, y_min, y_max } => {
                input.x >= x_min && input.x <= x_max && input.y >= y_min && input.y <= y_max
            }
        }
    }
}

/// Per-pixel contract: one input band vector in, one output vector out
pub trait PixelCalc {
    /// Check the unit against the band layout before any pixel is read
    fn validate(&self, _layout: &BandLayout) -> CalcResult<()> {
        Ok(())
    }

    /// Called once the run is accepted, before the first pixel
    fn begin(&mut self, _layout: &BandLayout) -> CalcResult<()> {
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()>;
}

/// Per-window contract: a band x W x W neighbourhood in, one output vector out
pub trait WindowCalc {
    fn validate(&self, _window_size: usize, _bands: usize) -> CalcResult<()> {
        Ok(())
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()>;
}

/// Per-zone contract: pixel values are accumulated by zone id and written
/// to a zone table once the pass is complete
pub trait ZoneCalc {
    fn validate(&self, _layout: &BandLayout) -> CalcResult<()> {
        Ok(())
    }

    /// Attribute columns the unit populates
    fn columns(&self) -> Vec<String>;

    fn calc_zone(&mut self, zone: u64, input: &PixelInput<'_>) -> CalcResult<()>;

    fn finalize(&mut self, table: &mut ZoneTable) -> CalcResult<()>;
}

/// A pluggable calculation, exposing the protocols it implements
pub trait CalcUnit {
    fn name(&self) -> &str;

    /// Number of output bands written per pixel (0 for accumulate-only units)
    fn out_bands(&self) -> usize;

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        None
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        None
    }

    fn as_zone(&mut self) -> Option<&mut dyn ZoneCalc> {
        None
    }

    fn supports(&mut self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::PerPixel => self.as_pixel().is_some(),
            Protocol::PerWindow => self.as_window().is_some(),
            Protocol::PerZone => self.as_zone().is_some(),
        }
    }
}

pub(crate) fn not_implemented(unit: &str, protocol: Protocol) -> CalcError {
    CalcError::NotImplemented {
        unit: unit.to_string(),
        protocol,
    }
}

/// Adapts a closure into a per-pixel unit
pub struct PixelFn<F> {
    name: String,
    out_bands: usize,
    func: F,
}

impl<F> PixelFn<F>
where
    F: FnMut(&PixelInput<'_>, &mut [f64]),
{
    pub fn new(name: &str, out_bands: usize, func: F) -> Self {
        Self {
            name: name.to_string(),
            out_bands,
            func,
        }
    }
}

impl<F> PixelCalc for PixelFn<F>
where
    F: FnMut(&PixelInput<'_>, &mut [f64]),
{
    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        (self.func)(input, output);
        Ok(())
    }
}

impl<F> CalcUnit for PixelFn<F>
where
    F: FnMut(&PixelInput<'_>, &mut [f64]),
{
    fn name(&self) -> &str {
        &self.name
    }

    fn out_bands(&self) -> usize {
        self.out_bands
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Adapts a closure into a per-window unit
pub struct WindowFn<F> {
    name: String,
    out_bands: usize,
    func: F,
}

impl<F> WindowFn<F>
where
    F: FnMut(&PixelWindow, &mut [f64]),
{
    pub fn new(name: &str, out_bands: usize, func: F) -> Self {
        Self {
            name: name.to_string(),
            out_bands,
            func,
        }
    }
}

impl<F> WindowCalc for WindowFn<F>
where
    F: FnMut(&PixelWindow, &mut [f64]),
{
    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        (self.func)(window, output);
        Ok(())
    }
}

impl<F> CalcUnit for WindowFn<F>
where
    F: FnMut(&PixelWindow, &mut [f64]),
{
    fn name(&self) -> &str {
        &self.name
    }

    fn out_bands(&self) -> usize {
        self.out_bands
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}
