//! Raster dataset access: block-wise reading and writing

pub mod raster;
#[cfg(feature = "gdal")]
pub mod gdal_raster;

pub use raster::{MemoryRaster, RasterSink, RasterSource, RasterStack};
#[cfg(feature = "gdal")]
pub use gdal_raster::{ensure_drivers_registered, GdalRaster, GdalRasterWriter, OutputOptions};
