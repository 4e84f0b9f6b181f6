//! bandcalc: block-wise raster band calculation
//!
//! Reads co-registered raster bands in row strips and presents each pixel,
//! each neighbourhood window, or each zone of a clump image to a pluggable
//! calculation unit. Statistics, zonal attribute aggregation, terrain
//! derivatives and calibration units are built on the same engine.

pub mod config;
pub mod core;
pub mod io;
pub mod types;
pub mod units;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{BandCube, BandImage, CalcError, CalcResult, GeoTransform, NodataConfig, NodataMatch, PixelType, Protocol};

pub use config::RunConfig;
pub use core::{
    calc_image_statistics, calc_image_statistics_in, CalcEngine, CalcUnit, CancelToken, EdgePolicy, EngineConfig,
    Envelope, PixelCalc, PixelInput, PixelWindow, RunSummary, StatsSelection, StdDevMethod, WindowCalc, ZoneCalc, ZoneTable,
};
pub use io::{MemoryRaster, RasterSink, RasterSource, RasterStack};
