use crate::core::block::{Block, OutputBlock, StripPlan};
use crate::core::calc::{not_implemented, BandLayout, CalcUnit, PixelInput};
use crate::core::window::{EdgePolicy, PixelWindow, WindowExtractor, WindowSize};
use crate::core::zonal::ZoneTable;
use crate::io::{RasterSink, RasterStack};
use crate::types::{CalcError, CalcResult, GeoTransform, NodataConfig, Protocol};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Engine parameters for one calculation run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows per strip
    pub block_rows: usize,
    pub nodata: NodataConfig,
    /// Window edge length for the per-window protocol (odd)
    pub window_size: usize,
    pub edge_policy: EdgePolicy,
    /// Leading stack bands presented to units as integers
    pub int_bands: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_rows: 256,
            nodata: NodataConfig::disabled(),
            window_size: 3,
            edge_policy: EdgePolicy::Replicate,
            int_bands: 0,
        }
    }
}

/// Cooperative cancellation flag, checked once per strip
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a completed run touched
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub protocol: Protocol,
    pub rows: usize,
    pub cols: usize,
    pub blocks: usize,
    /// Pixels handed to the calculation unit
    pub pixels_visited: u64,
    /// Pixels short-circuited as nodata
    pub pixels_nodata: u64,
    /// Pixels skipped by the window edge policy
    pub pixels_edge: u64,
    /// Zone table rows after the run (per-zone protocol only)
    pub zones: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn start(protocol: Protocol, rows: usize, cols: usize) -> Self {
        let now = Utc::now();
        Self {
            protocol,
            rows,
            cols,
            blocks: 0,
            pixels_visited: 0,
            pixels_nodata: 0,
            pixels_edge: 0,
            zones: 0,
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        log::info!(
            "Finished {} run: {} blocks, {} pixels calculated, {} nodata, {} edge ({} ms)",
            self.protocol,
            self.blocks,
            self.pixels_visited,
            self.pixels_nodata,
            self.pixels_edge,
            (self.finished_at - self.started_at).num_milliseconds()
        );
    }

    pub fn total_pixels(&self) -> u64 {
        (self.rows * self.cols) as u64
    }
}

/// Reusable per-pixel input vectors
struct PixelBuffer {
    values: Vec<f64>,
    ints: Vec<i64>,
    int_bands: usize,
}

impl PixelBuffer {
    fn new(layout: &BandLayout) -> Self {
        Self {
            values: vec![0.0; layout.total_bands],
            ints: vec![0; layout.int_bands],
            int_bands: layout.int_bands,
        }
    }

    fn input(&mut self, row: usize, col: usize, transform: Option<&GeoTransform>) -> PixelInput<'_> {
        for (slot, &v) in self.ints.iter_mut().zip(&self.values) {
            *slot = v as i64;
        }
        let (x, y) = match transform {
            Some(gt) => gt.pixel_centre(row, col),
            None => (col as f64 + 0.5, row as f64 + 0.5),
        };
        PixelInput {
            row,
            col,
            x,
            y,
            values: &self.values,
            ints: &self.ints,
            floats: &self.values[self.int_bands..],
        }
    }
}

/// Drives calculation units over a raster stack strip by strip.
///
/// Runs are single threaded and repeatable: running the same unit twice
/// over an unmodified stack visits the same pixels in the same order,
/// which multi-pass statistics rely on.
pub struct CalcEngine {
    config: EngineConfig,
    window: WindowSize,
    cancel: Option<CancelToken>,
}

impl CalcEngine {
    pub fn new(config: EngineConfig) -> CalcResult<Self> {
        let window = WindowSize::new(config.window_size)?;
        if config.block_rows == 0 {
            return Err(CalcError::Configuration(
                "Block height must be at least one row".to_string(),
            ));
        }
        log::debug!("Engine configuration: {:?}", config);
        Ok(Self {
            config,
            window,
            cancel: None,
        })
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Present each pixel's band vector to a per-pixel unit
    pub fn run_pixels(
        &self,
        stack: &mut RasterStack,
        unit: &mut dyn CalcUnit,
        mut sink: Option<&mut dyn RasterSink>,
    ) -> CalcResult<RunSummary> {
        let name = unit.name().to_string();
        let out_bands = unit.out_bands();
        let calc = unit
            .as_pixel()
            .ok_or_else(|| not_implemented(&name, Protocol::PerPixel))?;

        let layout = self.layout(stack)?;
        calc.validate(&layout)?;
        check_sink(stack, out_bands, sink.as_deref())?;
        calc.begin(&layout)?;

        let (rows, cols) = stack.size();
        let plan = StripPlan::new(rows, self.config.block_rows, 0)?;
        let mut block = Block::new(layout.total_bands, cols, &plan);
        let mut out_block = OutputBlock::new(out_bands, cols, plan.block_rows());
        let mut pixel = PixelBuffer::new(&layout);
        let mut output = vec![0.0; out_bands];
        let transform = stack.geo_transform();
        let nodata = self.config.nodata;

        log::info!(
            "Running '{}' per pixel over {}x{} pixels, {} bands in, {} out",
            name,
            rows,
            cols,
            layout.total_bands,
            out_bands
        );

        let mut summary = RunSummary::start(Protocol::PerPixel, rows, cols);
        for bounds in plan.iter() {
            self.check_cancelled()?;
            block.load(stack, bounds)?;

            for row in bounds.row_start..bounds.row_end {
                let local = row - bounds.row_start;
                for col in 0..cols {
                    block.pixel(row, col, &mut pixel.values);
                    if nodata.pixel_is_nodata(&pixel.values) {
                        out_block.fill_pixel(local, col, nodata.value);
                        summary.pixels_nodata += 1;
                        continue;
                    }
                    let input = pixel.input(row, col, transform.as_ref());
                    calc.calc_pixel(&input, &mut output)?;
                    out_block.set_pixel(local, col, &output);
                    summary.pixels_visited += 1;
                }
            }

            if let Some(out) = sink.as_deref_mut() {
                out.write_rows(bounds.row_start, out_block.view(bounds.rows()))?;
            }
            summary.blocks += 1;
            log::debug!("Block {} of {} complete", bounds.index + 1, plan.num_strips);
        }

        if let Some(out) = sink {
            out.flush()?;
        }
        summary.finish();
        Ok(summary)
    }

    /// Present a band x W x W neighbourhood around each pixel to a per-window unit
    pub fn run_windows(
        &self,
        stack: &mut RasterStack,
        unit: &mut dyn CalcUnit,
        mut sink: Option<&mut dyn RasterSink>,
    ) -> CalcResult<RunSummary> {
        let name = unit.name().to_string();
        let out_bands = unit.out_bands();
        let calc = unit
            .as_window()
            .ok_or_else(|| not_implemented(&name, Protocol::PerWindow))?;

        let bands = stack.band_count();
        calc.validate(self.window.get(), bands)?;
        check_sink(stack, out_bands, sink.as_deref())?;

        let (rows, cols) = stack.size();
        let plan = StripPlan::new(rows, self.config.block_rows, self.window.radius())?;
        let extractor = WindowExtractor::new(self.window, self.config.edge_policy, rows, cols);
        let mut block = Block::new(bands, cols, &plan);
        let mut out_block = OutputBlock::new(out_bands, cols, plan.block_rows());
        let mut window = PixelWindow::new(bands, self.window);
        let mut centre = vec![0.0; bands];
        let mut output = vec![0.0; out_bands];
        let nodata = self.config.nodata;

        log::info!(
            "Running '{}' with {}x{} windows ({:?} edges) over {}x{} pixels",
            name,
            self.window.get(),
            self.window.get(),
            self.config.edge_policy,
            rows,
            cols
        );

        let mut summary = RunSummary::start(Protocol::PerWindow, rows, cols);
        for bounds in plan.iter() {
            self.check_cancelled()?;
            block.load(stack, bounds)?;

            for row in bounds.row_start..bounds.row_end {
                let local = row - bounds.row_start;
                for col in 0..cols {
                    block.pixel(row, col, &mut centre);
                    if nodata.pixel_is_nodata(&centre) {
                        out_block.fill_pixel(local, col, nodata.value);
                        summary.pixels_nodata += 1;
                        continue;
                    }
                    if !extractor.extract(&block, row, col, &mut window) {
                        out_block.fill_pixel(local, col, nodata.value);
                        summary.pixels_edge += 1;
                        continue;
                    }
                    calc.calc_window(&window, &mut output)?;
                    out_block.set_pixel(local, col, &output);
                    summary.pixels_visited += 1;
                }
            }

            if let Some(out) = sink.as_deref_mut() {
                out.write_rows(bounds.row_start, out_block.view(bounds.rows()))?;
            }
            summary.blocks += 1;
            log::debug!("Block {} of {} complete", bounds.index + 1, plan.num_strips);
        }

        if let Some(out) = sink {
            out.flush()?;
        }
        summary.finish();
        Ok(summary)
    }

    /// Accumulate pixels by the zone id held in `zone_band` and write the
    /// unit's results into `table`.
    ///
    /// Pixels whose zone value equals the nodata value, is negative, has a
    /// fractional part or is not finite are skipped and counted as nodata.
    /// Table rows are created as zones are met.
    pub fn run_zones(
        &self,
        stack: &mut RasterStack,
        zone_band: usize,
        unit: &mut dyn CalcUnit,
        table: &mut ZoneTable,
    ) -> CalcResult<RunSummary> {
        let name = unit.name().to_string();
        let calc = unit
            .as_zone()
            .ok_or_else(|| not_implemented(&name, Protocol::PerZone))?;

        let layout = self.layout(stack)?;
        layout.check_band(zone_band, &name)?;
        calc.validate(&layout)?;
        for column in calc.columns() {
            table.ensure_column(&column);
        }

        let (rows, cols) = stack.size();
        let plan = StripPlan::new(rows, self.config.block_rows, 0)?;
        let mut block = Block::new(layout.total_bands, cols, &plan);
        let mut pixel = PixelBuffer::new(&layout);
        let transform = stack.geo_transform();
        let nodata = self.config.nodata;

        log::info!(
            "Running '{}' per zone (zone band {}) over {}x{} pixels",
            name,
            zone_band,
            rows,
            cols
        );

        let mut summary = RunSummary::start(Protocol::PerZone, rows, cols);
        for bounds in plan.iter() {
            self.check_cancelled()?;
            block.load(stack, bounds)?;

            for row in bounds.row_start..bounds.row_end {
                for col in 0..cols {
                    block.pixel(row, col, &mut pixel.values);
                    let zone_value = pixel.values[zone_band];
                    if nodata.is_nodata(zone_value)
                        || !zone_value.is_finite()
                        || zone_value < 0.0
                        || zone_value.fract() != 0.0
                    {
                        summary.pixels_nodata += 1;
                        continue;
                    }
                    let zone = zone_value as u64;
                    table.ensure_row(zone);
                    let input = pixel.input(row, col, transform.as_ref());
                    calc.calc_zone(zone, &input)?;
                    summary.pixels_visited += 1;
                }
            }
            summary.blocks += 1;
            log::debug!("Block {} of {} complete", bounds.index + 1, plan.num_strips);
        }

        calc.finalize(table)?;
        summary.zones = table.row_count();
        summary.finish();
        Ok(summary)
    }

    fn layout(&self, stack: &RasterStack) -> CalcResult<BandLayout> {
        let total_bands = stack.band_count();
        if self.config.int_bands > total_bands {
            return Err(CalcError::Configuration(format!(
                "{} integer bands requested but the stack has {} bands",
                self.config.int_bands, total_bands
            )));
        }
        Ok(BandLayout {
            int_bands: self.config.int_bands,
            total_bands,
        })
    }

    fn check_cancelled(&self) -> CalcResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                log::warn!("Calculation cancelled between blocks");
                Err(CalcError::Cancelled)
            }
            _ => Ok(()),
        }
    }
}

fn check_sink(stack: &RasterStack, out_bands: usize, sink: Option<&dyn RasterSink>) -> CalcResult<()> {
    if let Some(out) = sink {
        if out.size() != stack.size() {
            let (r, c) = out.size();
            let (sr, sc) = stack.size();
            return Err(CalcError::Configuration(format!(
                "Output is {}x{} but the input stack is {}x{}",
                r, c, sr, sc
            )));
        }
        if out.band_count() != out_bands {
            return Err(CalcError::Configuration(format!(
                "Output has {} bands but the unit produces {}",
                out.band_count(),
                out_bands
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calc::{PixelFn, WindowFn};
    use crate::io::MemoryRaster;
    use crate::types::PixelType;
    use ndarray::Array2;

    fn ramp(rows: usize, cols: usize) -> MemoryRaster {
        MemoryRaster::from_image("ramp", Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f64))
    }

    #[test]
    fn test_pixel_run_visits_every_pixel_once() {
        let config = EngineConfig {
            block_rows: 3,
            ..Default::default()
        };
        let engine = CalcEngine::new(config).unwrap();
        let mut stack = RasterStack::single(ramp(7, 5)).unwrap();
        let mut visits = Array2::<u32>::zeros((7, 5));
        let mut unit = PixelFn::new("count", 0, |input: &PixelInput<'_>, _out: &mut [f64]| {
            visits[[input.row, input.col]] += 1;
        });

        let summary = engine.run_pixels(&mut stack, &mut unit, None).unwrap();
        drop(unit);

        assert_eq!(summary.pixels_visited, 35);
        assert_eq!(summary.blocks, 3);
        assert!(visits.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_pixel_output_written_per_strip() {
        let engine = CalcEngine::new(EngineConfig {
            block_rows: 2,
            ..Default::default()
        })
        .unwrap();
        let mut stack = RasterStack::single(ramp(5, 3)).unwrap();
        let mut out = MemoryRaster::new("out", 1, 5, 3, PixelType::Float64);
        let mut unit = PixelFn::new("double", 1, |input: &PixelInput<'_>, out: &mut [f64]| {
            out[0] = input.values[0] * 2.0;
        });

        engine.run_pixels(&mut stack, &mut unit, Some(&mut out)).unwrap();
        assert_eq!(out.band(0)[[4, 2]], 28.0);
        assert_eq!(out.band(0)[[0, 0]], 0.0);
    }

    #[test]
    fn test_nodata_pixels_short_circuit() {
        let values = MemoryRaster::from_rows("v", 1, 3, vec![1.0, -9999.0, 3.0]).unwrap();
        let mut stack = RasterStack::single(values).unwrap();
        let engine = CalcEngine::new(EngineConfig {
            nodata: NodataConfig::enabled(-9999.0),
            ..Default::default()
        })
        .unwrap();
        let mut out = MemoryRaster::new("out", 1, 1, 3, PixelType::Float32);
        let mut unit = PixelFn::new("plus one", 1, |input: &PixelInput<'_>, out: &mut [f64]| {
            out[0] = input.values[0] + 1.0;
        });

        let summary = engine.run_pixels(&mut stack, &mut unit, Some(&mut out)).unwrap();
        assert_eq!(summary.pixels_visited, 2);
        assert_eq!(summary.pixels_nodata, 1);
        assert_eq!(out.band(0)[[0, 1]], -9999.0);
        assert_eq!(out.band(0)[[0, 2]], 4.0);
    }

    #[test]
    fn test_wrong_protocol_fails_before_reading() {
        let engine = CalcEngine::new(EngineConfig::default()).unwrap();
        let mut stack = RasterStack::single(ramp(3, 3)).unwrap();
        let mut unit = PixelFn::new("pixel only", 1, |_: &PixelInput<'_>, _: &mut [f64]| {});

        let result = engine.run_windows(&mut stack, &mut unit, None);
        assert!(matches!(
            result,
            Err(CalcError::NotImplemented {
                protocol: Protocol::PerWindow,
                ..
            })
        ));

        let mut table = ZoneTable::new();
        let result = engine.run_zones(&mut stack, 0, &mut unit, &mut table);
        assert!(matches!(result, Err(CalcError::NotImplemented { .. })));
    }

    #[test]
    fn test_window_run_across_strip_boundaries() {
        let engine = CalcEngine::new(EngineConfig {
            block_rows: 2,
            edge_policy: EdgePolicy::Skip,
            ..Default::default()
        })
        .unwrap();
        let mut stack = RasterStack::single(ramp(6, 4)).unwrap();
        let mut out = MemoryRaster::new("out", 1, 6, 4, PixelType::Float64);
        let mut unit = WindowFn::new("window sum", 1, |w: &PixelWindow, out: &mut [f64]| {
            out[0] = w.band(0).sum();
        });

        let summary = engine.run_windows(&mut stack, &mut unit, Some(&mut out)).unwrap();
        assert_eq!(summary.pixels_visited, 8);
        assert_eq!(summary.pixels_edge, 16);
        // Window sum of a linear ramp is nine times the centre value
        assert_eq!(out.band(0)[[2, 1]], 9.0 * 9.0);
        assert_eq!(out.band(0)[[3, 2]], 9.0 * 14.0);
        assert_eq!(out.band(0)[[0, 0]], 0.0);
    }

    #[test]
    fn test_cancelled_run_stops() {
        let token = CancelToken::new();
        let engine = CalcEngine::new(EngineConfig::default())
            .unwrap()
            .with_cancel_token(token.clone());
        token.cancel();

        let mut stack = RasterStack::single(ramp(3, 3)).unwrap();
        let mut unit = PixelFn::new("noop", 0, |_: &PixelInput<'_>, _: &mut [f64]| {});
        let result = engine.run_pixels(&mut stack, &mut unit, None);
        assert!(matches!(result, Err(CalcError::Cancelled)));
    }

    #[test]
    fn test_sink_shape_checked() {
        let engine = CalcEngine::new(EngineConfig::default()).unwrap();
        let mut stack = RasterStack::single(ramp(3, 3)).unwrap();
        let mut out = MemoryRaster::new("out", 2, 3, 3, PixelType::Float64);
        let mut unit = PixelFn::new("one band", 1, |_: &PixelInput<'_>, _: &mut [f64]| {});
        let result = engine.run_pixels(&mut stack, &mut unit, Some(&mut out));
        assert!(matches!(result, Err(CalcError::Configuration(_))));
    }

    #[test]
    fn test_even_window_rejected() {
        let result = CalcEngine::new(EngineConfig {
            window_size: 4,
            ..Default::default()
        });
        assert!(matches!(result, Err(CalcError::Configuration(_))));
    }
}
