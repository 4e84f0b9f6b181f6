//! Per-run configuration, read from an XML command document.
//!
//! ```xml
//! <command>
//!     <outputFormat>GTiff</outputFormat>
//!     <pixelType>Float32</pixelType>
//!     <useNoData>true</useNoData>
//!     <noDataValue>-9999</noDataValue>
//!     <windowSize>3</windowSize>
//!     <edgePolicy>replicate</edgePolicy>
//!     <statistics><stdDev>true</stdDev></statistics>
//!     <percentile>25</percentile>
//!     <percentile>75</percentile>
//! </command>
//! ```
//!
//! Every element is optional; missing elements take their defaults.

use crate::core::engine::EngineConfig;
use crate::core::stats::{StatsSelection, StdDevMethod};
use crate::core::window::{EdgePolicy, WindowSize};
use crate::types::{CalcError, CalcResult, NodataConfig, NodataMatch, PixelType};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Statistics selection flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsFlags {
    pub mean: bool,
    pub min: bool,
    pub max: bool,
    pub sum: bool,
    #[serde(rename = "stdDev")]
    pub std_dev: bool,
}

impl Default for StatisticsFlags {
    fn default() -> Self {
        Self {
            mean: true,
            min: true,
            max: true,
            sum: true,
            std_dev: true,
        }
    }
}

/// Configuration surface of one calculation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Raster driver short name
    #[serde(rename = "outputFormat")]
    pub output_format: String,
    #[serde(rename = "pixelType")]
    pub pixel_type: String,
    #[serde(rename = "useNoData")]
    pub use_nodata: bool,
    #[serde(rename = "noDataValue")]
    pub nodata_value: f64,
    /// "all" or "any"
    #[serde(rename = "noDataMatch")]
    pub nodata_match: String,
    #[serde(rename = "windowSize")]
    pub window_size: usize,
    /// "skip", "replicate" or "fill"
    #[serde(rename = "edgePolicy")]
    pub edge_policy: String,
    #[serde(rename = "edgeFill")]
    pub edge_fill: f64,
    #[serde(rename = "blockRows")]
    pub block_rows: usize,
    /// Leading bands handed to units as integers
    #[serde(rename = "intBands")]
    pub int_bands: usize,
    pub statistics: StatisticsFlags,
    #[serde(rename = "onePass")]
    pub one_pass: bool,
    #[serde(rename = "percentile")]
    pub percentiles: Vec<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_format: "GTiff".to_string(),
            pixel_type: "Float32".to_string(),
            use_nodata: false,
            nodata_value: 0.0,
            nodata_match: "all".to_string(),
            window_size: 3,
            edge_policy: "replicate".to_string(),
            edge_fill: 0.0,
            block_rows: 256,
            int_bands: 0,
            statistics: StatisticsFlags::default(),
            one_pass: true,
            percentiles: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn from_xml_str(xml: &str) -> CalcResult<Self> {
        let config: RunConfig = quick_xml::de::from_str(xml)
            .map_err(|e| CalcError::Config(format!("Failed to parse run configuration: {}", e)))?;
        log::debug!("Parsed run configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> CalcResult<Self> {
        let path = path.as_ref();
        log::info!("Reading run configuration from {}", path.display());
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml_str(&xml)
    }

    pub fn to_xml_string(&self) -> CalcResult<String> {
        quick_xml::se::to_string_with_root("command", self)
            .map_err(|e| CalcError::Config(format!("Failed to write run configuration: {}", e)))
    }

    pub fn output_pixel_type(&self) -> CalcResult<PixelType> {
        self.pixel_type.parse()
    }

    pub fn nodata_config(&self) -> CalcResult<NodataConfig> {
        let matching = match self.nodata_match.trim().to_lowercase().as_str() {
            "all" | "allbands" => NodataMatch::AllBands,
            "any" | "anyband" => NodataMatch::AnyBand,
            other => {
                return Err(CalcError::Configuration(format!(
                    "Unknown nodata match mode: {}",
                    other
                )))
            }
        };
        Ok(NodataConfig {
            enabled: self.use_nodata,
            value: self.nodata_value,
            matching,
        })
    }

    pub fn edge(&self) -> CalcResult<EdgePolicy> {
        match self.edge_policy.trim().to_lowercase().as_str() {
            "skip" => Ok(EdgePolicy::Skip),
            "replicate" => Ok(EdgePolicy::Replicate),
            "fill" => Ok(EdgePolicy::Fill(self.edge_fill)),
            other => Err(CalcError::Configuration(format!(
                "Unknown edge policy: {}",
                other
            ))),
        }
    }

    /// Validated engine parameters
    pub fn engine_config(&self) -> CalcResult<EngineConfig> {
        WindowSize::new(self.window_size)?;
        if self.block_rows == 0 {
            return Err(CalcError::Configuration(
                "Block height must be at least one row".to_string(),
            ));
        }
        Ok(EngineConfig {
            block_rows: self.block_rows,
            nodata: self.nodata_config()?,
            window_size: self.window_size,
            edge_policy: self.edge()?,
            int_bands: self.int_bands,
        })
    }

    /// Validated statistics selection
    pub fn statistics_selection(&self) -> CalcResult<StatsSelection> {
        let selection = StatsSelection {
            mean: self.statistics.mean,
            min: self.statistics.min,
            max: self.statistics.max,
            sum: self.statistics.sum,
            std_dev: self.statistics.std_dev,
            method: if self.one_pass {
                StdDevMethod::OnePass
            } else {
                StdDevMethod::TwoPass
            },
            percentiles: self.percentiles.clone(),
        };
        selection.validate()?;
        Ok(selection)
    }

    #[cfg(feature = "gdal")]
    pub fn output_options(&self) -> CalcResult<crate::io::OutputOptions> {
        Ok(crate::io::OutputOptions {
            format: self.output_format.clone(),
            pixel_type: self.output_pixel_type()?,
            nodata: self.use_nodata.then_some(self.nodata_value),
            ..Default::default()
        })
    }
}
