//! DEM-derived terrain units
//!
//! Gradients use the weighted (Sobel style) differences of the outer
//! rows and columns of a 3x3 window, scaled by the cell resolution.
//! The shadow mask is per pixel and traces rays over its own copy of
//! the DEM.

use crate::core::calc::{BandLayout, CalcUnit, PixelCalc, PixelInput, WindowCalc};
use crate::core::engine::{CalcEngine, EngineConfig};
use crate::core::window::{EdgePolicy, PixelWindow};
use crate::io::{MemoryRaster, RasterSource, RasterStack};
use crate::types::{BandImage, CalcError, CalcResult, PixelType};
use std::f64::consts::PI;

const DEG_TO_RAD: f64 = PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / PI;

/// Band and cell resolution shared by every terrain unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainParams {
    /// Elevation band within the input stack
    pub band: usize,
    /// East-west cell size
    pub ew_res: f64,
    /// North-south cell size
    pub ns_res: f64,
}

impl TerrainParams {
    pub fn new(band: usize, ew_res: f64, ns_res: f64) -> Self {
        Self { band, ew_res, ns_res }
    }

    fn validate(&self, unit: &str, window_size: usize, bands: usize) -> CalcResult<()> {
        check_window(unit, window_size)?;
        if self.band >= bands {
            return Err(CalcError::Configuration(format!(
                "{}: band {} is not within the {} input bands",
                unit, self.band, bands
            )));
        }
        if self.ew_res == 0.0 || self.ns_res == 0.0 {
            return Err(CalcError::Configuration(format!(
                "{}: cell resolution must be non-zero",
                unit
            )));
        }
        Ok(())
    }
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self::new(0, 1.0, 1.0)
    }
}

fn check_window(unit: &str, window_size: usize) -> CalcResult<()> {
    if window_size != 3 {
        return Err(CalcError::Configuration(format!(
            "{} needs a 3x3 window, got {}x{}",
            unit, window_size, window_size
        )));
    }
    Ok(())
}

/// Weighted column sum (1, 2, 1) of window column `col`
#[inline]
fn col_sum(w: &PixelWindow, band: usize, col: usize) -> f64 {
    w.get(band, 0, col) + 2.0 * w.get(band, 1, col) + w.get(band, 2, col)
}

/// Weighted row sum (1, 2, 1) of window row `row`
#[inline]
fn row_sum(w: &PixelWindow, band: usize, row: usize) -> f64 {
    w.get(band, row, 0) + 2.0 * w.get(band, row, 1) + w.get(band, row, 2)
}

fn slope_radians(w: &PixelWindow, p: &TerrainParams) -> f64 {
    let dx = (col_sum(w, p.band, 0) - col_sum(w, p.band, 2)) / p.ew_res;
    let dy = (row_sum(w, p.band, 2) - row_sum(w, p.band, 0)) / p.ns_res;
    ((dx * dx + dy * dy).sqrt() / 8.0).atan()
}

/// Degrees clockwise from north in [0, 360); NaN for flat cells
fn aspect_degrees(w: &PixelWindow, p: &TerrainParams) -> f64 {
    let dx = (col_sum(w, p.band, 2) - col_sum(w, p.band, 0)) / p.ew_res;
    let dy = (row_sum(w, p.band, 2) - row_sum(w, p.band, 0)) / p.ns_res;
    if dx == 0.0 && dy == 0.0 {
        return f64::NAN;
    }
    let mut aspect = (-dx).atan2(dy) * RAD_TO_DEG;
    if aspect < 0.0 {
        aspect += 360.0;
    }
    if aspect == 360.0 {
        aspect = 0.0;
    }
    aspect
}

/// Angle in degrees between the surface normal and a ray from
/// (zenith, azimuth); NaN when the geometry is degenerate
fn ray_angle(slope_deg: f64, aspect_deg: f64, zenith: f64, azimuth: f64) -> f64 {
    let (s, a) = (slope_deg * DEG_TO_RAD, aspect_deg * DEG_TO_RAD);
    let (z, az) = (zenith * DEG_TO_RAD, azimuth * DEG_TO_RAD);
    let p = [s.sin() * a.cos(), s.sin() * a.sin(), s.cos()];
    let r = [z.sin() * az.cos(), z.sin() * az.sin(), z.cos()];
    (p[0] * r[0] + p[1] * r[1] + p[2] * r[2]).acos() * RAD_TO_DEG
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleUnit {
    Degrees,
    Radians,
}

/// Slope of the elevation surface
pub struct Slope {
    params: TerrainParams,
    unit: AngleUnit,
}

impl Slope {
    pub fn new(params: TerrainParams, unit: AngleUnit) -> Self {
        Self { params, unit }
    }
}

impl WindowCalc for Slope {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("slope", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        let slope = slope_radians(window, &self.params);
        output[0] = match self.unit {
            AngleUnit::Degrees => slope * RAD_TO_DEG,
            AngleUnit::Radians => slope,
        };
        Ok(())
    }
}

impl CalcUnit for Slope {
    fn name(&self) -> &str {
        "slope"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Aspect in degrees clockwise from north; flat cells are NaN
pub struct Aspect {
    params: TerrainParams,
}

impl Aspect {
    pub fn new(params: TerrainParams) -> Self {
        Self { params }
    }
}

impl WindowCalc for Aspect {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("aspect", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        output[0] = aspect_degrees(window, &self.params);
        Ok(())
    }
}

impl CalcUnit for Aspect {
    fn name(&self) -> &str {
        "aspect"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Slope (degrees) and aspect as two output bands
pub struct SlopeAspect {
    params: TerrainParams,
}

impl SlopeAspect {
    pub fn new(params: TerrainParams) -> Self {
        Self { params }
    }
}

impl WindowCalc for SlopeAspect {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("slope/aspect", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        output[0] = slope_radians(window, &self.params) * RAD_TO_DEG;
        output[1] = aspect_degrees(window, &self.params);
        Ok(())
    }
}

impl CalcUnit for SlopeAspect {
    fn name(&self) -> &str {
        "slope/aspect"
    }

    fn out_bands(&self) -> usize {
        2
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Shaded relief in [1, 255].
///
/// By default the azimuth term is `sun_azimuth - 90 * (pi / 180)^2`,
/// mixing degrees with a radian offset; `with_corrected_azimuth` uses
/// `sun_azimuth * pi / 180 - pi / 2` instead. The two give different
/// shading for any non-flat cell.
pub struct HillShade {
    params: TerrainParams,
    sun_zenith: f64,
    sun_azimuth: f64,
    corrected_azimuth: bool,
}

impl HillShade {
    pub fn new(params: TerrainParams, sun_zenith: f64, sun_azimuth: f64) -> Self {
        Self {
            params,
            sun_zenith,
            sun_azimuth,
            corrected_azimuth: false,
        }
    }

    pub fn with_corrected_azimuth(mut self) -> Self {
        self.corrected_azimuth = true;
        self
    }
}

impl WindowCalc for HillShade {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("hillshade", window_size, bands)
    }

    fn calc_window(&mut self, w: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        let p = &self.params;
        let dx = (col_sum(w, p.band, 2) - col_sum(w, p.band, 0)) / (p.ew_res * 8.0);
        let dy = (row_sum(w, p.band, 0) - row_sum(w, p.band, 2)) / (p.ns_res * 8.0);
        let xx_plus_yy = dx * dx + dy * dy;
        let aspect = dy.atan2(dx);

        let azimuth_term = if self.corrected_azimuth {
            self.sun_azimuth * DEG_TO_RAD - PI / 2.0
        } else {
            self.sun_azimuth - PI / 2.0 * DEG_TO_RAD
        };

        let zenith = self.sun_zenith * DEG_TO_RAD;
        let cang = (zenith.sin() - zenith.cos() * xx_plus_yy.sqrt() * (aspect - azimuth_term).sin())
            / (1.0 + xx_plus_yy).sqrt();

        output[0] = if cang <= 0.0 { 1.0 } else { 1.0 + 254.0 * cang };
        Ok(())
    }
}

impl CalcUnit for HillShade {
    fn name(&self) -> &str {
        "hillshade"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Angle between the surface normal and the solar ray (degrees).
/// Degenerate cells take the sun zenith.
pub struct IncidenceAngle {
    params: TerrainParams,
    sun_zenith: f64,
    sun_azimuth: f64,
}

impl IncidenceAngle {
    pub fn new(params: TerrainParams, sun_zenith: f64, sun_azimuth: f64) -> Self {
        Self {
            params,
            sun_zenith,
            sun_azimuth,
        }
    }
}

fn incidence(w: &PixelWindow, p: &TerrainParams, zenith: f64, azimuth: f64) -> f64 {
    let slope = slope_radians(w, p) * RAD_TO_DEG;
    let aspect = aspect_degrees(w, p);
    let angle = ray_angle(slope, aspect, zenith, azimuth);
    if angle.is_nan() {
        zenith
    } else {
        angle
    }
}

fn exitance(w: &PixelWindow, p: &TerrainParams, zenith: f64, azimuth: f64) -> f64 {
    let slope = slope_radians(w, p) * RAD_TO_DEG;
    let aspect = aspect_degrees(w, p);
    let angle = ray_angle(slope, aspect, zenith, azimuth);
    if angle.is_nan() {
        0.0
    } else {
        angle
    }
}

impl WindowCalc for IncidenceAngle {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("incidence angle", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        output[0] = incidence(window, &self.params, self.sun_zenith, self.sun_azimuth);
        Ok(())
    }
}

impl CalcUnit for IncidenceAngle {
    fn name(&self) -> &str {
        "incidence angle"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Angle between the surface normal and the view direction (degrees).
/// Degenerate cells give 0.
pub struct ExitanceAngle {
    params: TerrainParams,
    view_zenith: f64,
    view_azimuth: f64,
}

impl ExitanceAngle {
    pub fn new(params: TerrainParams, view_zenith: f64, view_azimuth: f64) -> Self {
        Self {
            params,
            view_zenith,
            view_azimuth,
        }
    }
}

impl WindowCalc for ExitanceAngle {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("exitance angle", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        output[0] = exitance(window, &self.params, self.view_zenith, self.view_azimuth);
        Ok(())
    }
}

impl CalcUnit for ExitanceAngle {
    fn name(&self) -> &str {
        "exitance angle"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Incidence and exitance angles as two output bands
pub struct IncidenceExitance {
    params: TerrainParams,
    sun_zenith: f64,
    sun_azimuth: f64,
    view_zenith: f64,
    view_azimuth: f64,
}

impl IncidenceExitance {
    pub fn new(params: TerrainParams, sun: (f64, f64), view: (f64, f64)) -> Self {
        Self {
            params,
            sun_zenith: sun.0,
            sun_azimuth: sun.1,
            view_zenith: view.0,
            view_azimuth: view.1,
        }
    }
}

impl WindowCalc for IncidenceExitance {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        self.params.validate("incidence/exitance", window_size, bands)
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        output[0] = incidence(window, &self.params, self.sun_zenith, self.sun_azimuth);
        output[1] = exitance(window, &self.params, self.view_zenith, self.view_azimuth);
        Ok(())
    }
}

impl CalcUnit for IncidenceExitance {
    fn name(&self) -> &str {
        "incidence/exitance"
    }

    fn out_bands(&self) -> usize {
        2
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Binary cast-shadow mask: 1 where the sun is visible from the cell,
/// 0 where the DEM rises above the ray towards the sun.
///
/// Azimuth is clockwise from north and zenith is from vertical, both in
/// degrees. The ray is sampled at steps of the smaller cell size and ends
/// at the image edge or once it is above `max_elevation`, which defaults
/// to the highest DEM value.
pub struct ShadowMask {
    params: TerrainParams,
    dem: BandImage,
    sun_zenith: f64,
    sun_azimuth: f64,
    max_elevation: f64,
}

impl ShadowMask {
    pub fn new(params: TerrainParams, dem: BandImage, sun_zenith: f64, sun_azimuth: f64) -> Self {
        let max_elevation = dem
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        Self {
            params,
            dem,
            sun_zenith,
            sun_azimuth,
            max_elevation,
        }
    }

    pub fn with_max_elevation(mut self, max_elevation: f64) -> Self {
        self.max_elevation = max_elevation;
        self
    }

    fn in_shadow(&self, row: usize, col: usize, z: f64) -> bool {
        let zenith = self.sun_zenith * DEG_TO_RAD;
        if zenith == 0.0 {
            return false;
        }
        let azimuth = self.sun_azimuth * DEG_TO_RAD;
        let rise = 1.0 / zenith.tan();
        let (ew, ns) = (self.params.ew_res.abs(), self.params.ns_res.abs());
        let step = ew.min(ns);
        let (rows, cols) = self.dem.dim();

        let mut i = 1;
        loop {
            let d = step * i as f64;
            let ray = z + d * rise;
            if ray > self.max_elevation {
                return false;
            }
            let r = (row as f64 - d * azimuth.cos() / ns).round();
            let c = (col as f64 + d * azimuth.sin() / ew).round();
            if r < 0.0 || c < 0.0 || r >= rows as f64 || c >= cols as f64 {
                return false;
            }
            let (r, c) = (r as usize, c as usize);
            if (r, c) != (row, col) {
                let ground = self.dem[[r, c]];
                if ground.is_finite() && ground > ray {
                    return true;
                }
            }
            i += 1;
        }
    }
}

impl PixelCalc for ShadowMask {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        layout.check_band(self.params.band, "shadow mask")?;
        if self.params.ew_res == 0.0 || self.params.ns_res == 0.0 {
            return Err(CalcError::Configuration(
                "shadow mask: cell resolution must be non-zero".to_string(),
            ));
        }
        if !(0.0..90.0).contains(&self.sun_zenith) {
            return Err(CalcError::Configuration(format!(
                "shadow mask: sun zenith {} is not within [0, 90)",
                self.sun_zenith
            )));
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let z = *self.dem.get((input.row, input.col)).ok_or_else(|| {
            CalcError::Configuration(format!(
                "shadow mask: pixel ({}, {}) is outside the {}x{} DEM",
                input.row,
                input.col,
                self.dem.nrows(),
                self.dem.ncols()
            ))
        })?;
        output[0] = if !z.is_finite() {
            f64::NAN
        } else if self.in_shadow(input.row, input.col, z) {
            0.0
        } else {
            1.0
        };
        Ok(())
    }
}

impl CalcUnit for ShadowMask {
    fn name(&self) -> &str {
        "shadow mask"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Cast-shadow mask of band `params.band` of `dem`, as a Byte raster
pub fn shadow_mask(
    config: &EngineConfig,
    dem: MemoryRaster,
    params: TerrainParams,
    sun_zenith: f64,
    sun_azimuth: f64,
) -> CalcResult<MemoryRaster> {
    if params.band >= dem.band_count() {
        return Err(CalcError::Configuration(format!(
            "shadow mask: band {} is not within the {} DEM bands",
            params.band,
            dem.band_count()
        )));
    }
    let engine = CalcEngine::new(config.clone())?;
    let (rows, cols) = dem.size();
    let mut unit = ShadowMask::new(params, dem.band(params.band).to_owned(), sun_zenith, sun_azimuth);

    let mut mask = MemoryRaster::new("shadow mask", 1, rows, cols, PixelType::Byte);
    if let Some(gt) = dem.geo_transform() {
        mask = mask.with_geo_transform(gt);
    }
    let mut stack = RasterStack::single(dem)?;
    let summary = engine.run_pixels(&mut stack, &mut unit, Some(&mut mask))?;
    log::info!("Shadow mask computed over {} pixels", summary.pixels_visited);
    Ok(mask)
}

/// One iteration of DEM hole filling.
///
/// A hole cell with at least three valid neighbours takes their mean;
/// other cells pass through unchanged. The three-neighbour mean is this
/// crate's fill policy. Repeat until `change_occurred` is false, see
/// `fill_dem_holes`.
pub struct FillDemHoles {
    band: usize,
    hole_value: f64,
    nodata: f64,
    changed: bool,
    filled: u64,
}

impl FillDemHoles {
    pub const MIN_NEIGHBOURS: usize = 3;

    pub fn new(band: usize, hole_value: f64, nodata: f64) -> Self {
        Self {
            band,
            hole_value,
            nodata,
            changed: false,
            filled: 0,
        }
    }

    pub fn change_occurred(&self) -> bool {
        self.changed
    }

    pub fn reset_change(&mut self) {
        self.changed = false;
    }

    /// Cells filled since construction
    pub fn filled(&self) -> u64 {
        self.filled
    }

    fn is_valid(&self, value: f64) -> bool {
        !value.is_nan() && value != self.hole_value && value != self.nodata
    }
}

impl WindowCalc for FillDemHoles {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        check_window("fill DEM holes", window_size)?;
        if self.band >= bands {
            return Err(CalcError::Configuration(format!(
                "fill DEM holes: band {} is not within the {} input bands",
                self.band, bands
            )));
        }
        Ok(())
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        let centre = window.centre(self.band);
        if centre != self.hole_value {
            output[0] = centre;
            return Ok(());
        }

        let mut sum = 0.0;
        let mut count = 0;
        for r in 0..3 {
            for c in 0..3 {
                if r == 1 && c == 1 {
                    continue;
                }
                let v = window.get(self.band, r, c);
                if self.is_valid(v) {
                    sum += v;
                    count += 1;
                }
            }
        }

        if count >= Self::MIN_NEIGHBOURS {
            output[0] = sum / count as f64;
            self.changed = true;
            self.filled += 1;
        } else {
            output[0] = centre;
        }
        Ok(())
    }
}

impl CalcUnit for FillDemHoles {
    fn name(&self) -> &str {
        "fill DEM holes"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}

/// Run `FillDemHoles` until no hole can be filled or `max_iterations`
/// passes have been made. Returns the filled DEM and the passes used.
pub fn fill_dem_holes(
    config: &EngineConfig,
    dem: MemoryRaster,
    band: usize,
    hole_value: f64,
    nodata: f64,
    max_iterations: usize,
) -> CalcResult<(MemoryRaster, usize)> {
    let engine = CalcEngine::new(EngineConfig {
        window_size: 3,
        edge_policy: EdgePolicy::Fill(hole_value),
        ..config.clone()
    })?;

    let (rows, cols) = dem.size();
    let mut current = dem;
    let mut unit = FillDemHoles::new(band, hole_value, nodata);
    let mut iterations = 0;

    while iterations < max_iterations {
        unit.reset_change();
        let mut filled = MemoryRaster::new("filled DEM", 1, rows, cols, PixelType::Float64);
        if let Some(gt) = current.geo_transform() {
            filled = filled.with_geo_transform(gt);
        }
        let mut stack = RasterStack::single(current)?;
        engine.run_windows(&mut stack, &mut unit, Some(&mut filled))?;
        iterations += 1;
        current = filled;

        log::debug!("Hole filling pass {}: {} cells filled so far", iterations, unit.filled());
        if !unit.change_occurred() {
            break;
        }
    }

    log::info!(
        "DEM hole filling finished after {} passes, {} cells filled",
        iterations,
        unit.filled()
    );
    Ok((current, iterations))
}

/// Takes band 2 where band 0 has a hole anywhere in the 3x3 window,
/// otherwise band 1
pub struct InfillDerivedHoles {
    hole_value: f64,
}

impl InfillDerivedHoles {
    pub fn new(hole_value: f64) -> Self {
        Self { hole_value }
    }
}

impl WindowCalc for InfillDerivedHoles {
    fn validate(&self, window_size: usize, bands: usize) -> CalcResult<()> {
        check_window("infill derived holes", window_size)?;
        if bands < 3 {
            return Err(CalcError::Configuration(format!(
                "infill derived holes needs 3 bands (DEM, derived, fill), got {}",
                bands
            )));
        }
        Ok(())
    }

    fn calc_window(&mut self, window: &PixelWindow, output: &mut [f64]) -> CalcResult<()> {
        let hole_nearby = window.band(0).iter().any(|&v| v == self.hole_value);
        output[0] = if hole_nearby {
            window.centre(2)
        } else {
            window.centre(1)
        };
        Ok(())
    }
}

impl CalcUnit for InfillDerivedHoles {
    fn name(&self) -> &str {
        "infill derived holes"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_window(&mut self) -> Option<&mut dyn WindowCalc> {
        Some(self)
    }
}
