use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Multi-band raster data (band x row x col)
pub type BandCube = Array3<f64>;

/// Single band raster data (row x col)
pub type BandImage = Array2<f64>;

/// Output pixel storage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl PixelType {
    /// Whether values stored with this type are integers
    pub fn is_integer(&self) -> bool {
        !matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Convert a calculated value to the value this type would store.
    ///
    /// Integer types round to nearest and saturate at the type's range,
    /// which is what a raster driver does when copying f64 words into an
    /// integer band. NaN in an integer band becomes 0.
    pub fn quantize(&self, value: f64) -> f64 {
        match self {
            PixelType::Byte => saturate::<u8>(value),
            PixelType::Int16 => saturate::<i16>(value),
            PixelType::UInt16 => saturate::<u16>(value),
            PixelType::Int32 => saturate::<i32>(value),
            PixelType::UInt32 => saturate::<u32>(value),
            PixelType::Float32 => value as f32 as f64,
            PixelType::Float64 => value,
        }
    }
}

fn saturate<T>(value: f64) -> f64
where
    T: num_traits::Bounded + num_traits::ToPrimitive,
{
    if value.is_nan() {
        return 0.0;
    }
    let lo = T::min_value().to_f64().unwrap_or(f64::MIN);
    let hi = T::max_value().to_f64().unwrap_or(f64::MAX);
    value.round().clamp(lo, hi)
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelType::Byte => write!(f, "Byte"),
            PixelType::Int16 => write!(f, "Int16"),
            PixelType::UInt16 => write!(f, "UInt16"),
            PixelType::Int32 => write!(f, "Int32"),
            PixelType::UInt32 => write!(f, "UInt32"),
            PixelType::Float32 => write!(f, "Float32"),
            PixelType::Float64 => write!(f, "Float64"),
        }
    }
}

impl FromStr for PixelType {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "byte" | "uint8" => Ok(PixelType::Byte),
            "int16" => Ok(PixelType::Int16),
            "uint16" => Ok(PixelType::UInt16),
            "int32" => Ok(PixelType::Int32),
            "uint32" => Ok(PixelType::UInt32),
            "float32" => Ok(PixelType::Float32),
            "float64" => Ok(PixelType::Float64),
            other => Err(CalcError::Configuration(format!(
                "Unknown pixel type: {}",
                other
            ))),
        }
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_centre(&self, row: usize, col: usize) -> (f64, f64) {
        let px = col as f64 + 0.5;
        let py = row as f64 + 0.5;
        let x = self.top_left_x + px * self.pixel_width + py * self.rotation_x;
        let y = self.top_left_y + px * self.rotation_y + py * self.pixel_height;
        (x, y)
    }

    /// Same origin and pixel size, within a small fraction of a pixel
    pub fn aligned_with(&self, other: &GeoTransform) -> bool {
        let scale = self.pixel_width.abs().max(self.pixel_height.abs()).max(1e-9);
        let tolerance = scale * 1e-6;
        (self.top_left_x - other.top_left_x).abs() <= tolerance
            && (self.top_left_y - other.top_left_y).abs() <= tolerance
            && (self.pixel_width - other.pixel_width).abs() <= tolerance
            && (self.pixel_height - other.pixel_height).abs() <= tolerance
    }
}

/// How pixels are compared against the nodata sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodataMatch {
    /// Pixel is nodata only when every input band equals the sentinel
    AllBands,
    /// Pixel is nodata when any input band equals the sentinel
    AnyBand,
}

/// Nodata handling for a calculation run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodataConfig {
    pub enabled: bool,
    pub value: f64,
    pub matching: NodataMatch,
}

impl NodataConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            value: 0.0,
            matching: NodataMatch::AllBands,
        }
    }

    pub fn enabled(value: f64) -> Self {
        Self {
            enabled: true,
            value,
            matching: NodataMatch::AllBands,
        }
    }

    /// Exact equality against the sentinel; always false when disabled
    pub fn is_nodata(&self, value: f64) -> bool {
        self.enabled && value == self.value
    }

    /// Apply the configured matching rule to a set of band values
    pub fn pixel_is_nodata(&self, values: &[f64]) -> bool {
        if !self.enabled || values.is_empty() {
            return false;
        }
        match self.matching {
            NodataMatch::AllBands => values.iter().all(|&v| v == self.value),
            NodataMatch::AnyBand => values.iter().any(|&v| v == self.value),
        }
    }
}

impl Default for NodataConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Iteration protocol a calculation unit can be driven with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    PerPixel,
    PerWindow,
    PerZone,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::PerPixel => write!(f, "per-pixel"),
            Protocol::PerWindow => write!(f, "per-window"),
            Protocol::PerZone => write!(f, "per-zone"),
        }
    }
}

/// Error types for raster calculation
#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Calculation unit '{unit}' does not implement the {protocol} protocol")]
    NotImplemented { unit: String, protocol: Protocol },

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Config parsing error: {0}")]
    Config(String),

    #[error("Calculation cancelled")]
    Cancelled,
}

/// Result type for raster calculation
pub type CalcResult<T> = Result<T, CalcError>;
