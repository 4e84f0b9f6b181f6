//! Raster calculation engine: strip planning, windows, dispatch,
//! statistics and zonal aggregation

pub mod block;
pub mod calc;
pub mod engine;
pub mod stats;
pub mod window;
pub mod zonal;

// Re-export main types
pub use block::{Block, OutputBlock, StripBounds, StripPlan};
pub use calc::{BandLayout, CalcUnit, Envelope, PixelCalc, PixelFn, PixelInput, WindowCalc, WindowFn, ZoneCalc};
pub use engine::{CalcEngine, CancelToken, EngineConfig, RunSummary};
pub use stats::{
    calc_image_statistics, calc_image_statistics_in, percentile, AllBandsStatistics, BandStatistics, ImageHistogram,
    ImageStatistics, RunningStats, StatsSelection, StdDevMethod,
};
pub use window::{EdgePolicy, PixelWindow, WindowExtractor, WindowSize};
pub use zonal::{BandZoneStats, ZonalStatistics, ZoneColumnExport, ZoneExtent, ZonePercentile, ZoneTable};
