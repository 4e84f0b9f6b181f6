//! Per-pixel summaries across bands and images

use crate::core::calc::{BandLayout, CalcUnit, PixelCalc, PixelInput};
use crate::core::stats::{percentile, RunningStats};
use crate::types::{CalcError, CalcResult, NodataConfig};
use serde::{Deserialize, Serialize};

/// Statistic computed across a pixel's band values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryStat {
    Min,
    Max,
    Mean,
    Median,
    Sum,
    StdDev,
    Range,
}

/// Summarises each pixel across its bands.
///
/// With `across_images`, the stack is read as `images` blocks of
/// `bands_per_image` bands and band `b` of every image is summarised
/// separately, giving `stats.len() * bands_per_image` outputs ordered by
/// band then statistic. Pixels with no valid value get the nodata value.
pub struct BandSummary {
    stats: Vec<SummaryStat>,
    images: usize,
    bands_per_image: Option<usize>,
    nodata: NodataConfig,
    scratch: Vec<f64>,
}

impl BandSummary {
    /// Summarise all stack bands together
    pub fn new(stats: Vec<SummaryStat>) -> Self {
        Self {
            stats,
            images: 1,
            bands_per_image: None,
            nodata: NodataConfig::disabled(),
            scratch: Vec::new(),
        }
    }

    /// Summarise the same band over `images` images of `bands_per_image` bands
    pub fn across_images(stats: Vec<SummaryStat>, images: usize, bands_per_image: usize) -> Self {
        Self {
            images,
            bands_per_image: Some(bands_per_image),
            ..Self::new(stats)
        }
    }

    pub fn with_nodata(mut self, nodata: NodataConfig) -> Self {
        self.nodata = nodata;
        self
    }

    fn summarise(stats: &[SummaryStat], values: &mut [f64], output: &mut [f64]) -> CalcResult<()> {
        let mut running = RunningStats::new();
        values.iter().for_each(|&v| running.push(v));
        let needs_sort = stats.contains(&SummaryStat::Median);
        if needs_sort {
            values.sort_unstable_by(|a, b| a.total_cmp(b));
        }

        for (out, stat) in output.iter_mut().zip(stats) {
            *out = match stat {
                SummaryStat::Min => running.min(),
                SummaryStat::Max => running.max(),
                SummaryStat::Mean => running.mean(),
                SummaryStat::Median => percentile(values, 50.0)?,
                SummaryStat::Sum => running.sum(),
                SummaryStat::StdDev => running.std_dev(),
                SummaryStat::Range => running.max() - running.min(),
            };
        }
        Ok(())
    }
}

impl PixelCalc for BandSummary {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.stats.is_empty() {
            return Err(CalcError::Configuration(
                "Band summary needs at least one statistic".to_string(),
            ));
        }
        if let Some(per_image) = self.bands_per_image {
            if per_image == 0 || self.images * per_image != layout.total_bands {
                return Err(CalcError::Configuration(format!(
                    "{} images of {} bands do not match the {} input bands",
                    self.images, per_image, layout.total_bands
                )));
            }
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let per_image = self.bands_per_image.unwrap_or(input.values.len());
        let groups = if self.bands_per_image.is_some() { per_image } else { 1 };
        let n_stats = self.stats.len();

        for group in 0..groups {
            self.scratch.clear();
            if self.bands_per_image.is_some() {
                for image in 0..self.images {
                    self.scratch.push(input.values[image * per_image + group]);
                }
            } else {
                self.scratch.extend_from_slice(input.values);
            }
            let nodata = self.nodata;
            self.scratch.retain(|&v| !v.is_nan() && !nodata.is_nodata(v));

            let out = &mut output[group * n_stats..(group + 1) * n_stats];
            if self.scratch.is_empty() {
                out.fill(self.nodata.value);
            } else {
                Self::summarise(&self.stats, &mut self.scratch, out)?;
            }
        }
        Ok(())
    }
}

impl CalcUnit for BandSummary {
    fn name(&self) -> &str {
        "band summary"
    }

    fn out_bands(&self) -> usize {
        self.stats.len() * self.bands_per_image.unwrap_or(1)
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Which extreme `StackIndexOfStat` looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtremeStat {
    Min,
    Max,
}

/// 1-based index of the band holding the pixel's min or max value
/// (first on ties, 0 when no band is valid)
pub struct StackIndexOfStat {
    stat: ExtremeStat,
    nodata: NodataConfig,
}

impl StackIndexOfStat {
    pub fn new(stat: ExtremeStat) -> Self {
        Self {
            stat,
            nodata: NodataConfig::disabled(),
        }
    }

    pub fn with_nodata(mut self, nodata: NodataConfig) -> Self {
        self.nodata = nodata;
        self
    }
}

impl PixelCalc for StackIndexOfStat {
    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, &value) in input.values.iter().enumerate() {
            if value.is_nan() || self.nodata.is_nodata(value) {
                continue;
            }
            let better = match (best, self.stat) {
                (None, _) => true,
                (Some((_, b)), ExtremeStat::Min) => value < b,
                (Some((_, b)), ExtremeStat::Max) => value > b,
            };
            if better {
                best = Some((idx, value));
            }
        }
        output[0] = best.map_or(0.0, |(idx, _)| (idx + 1) as f64);
        Ok(())
    }
}

impl CalcUnit for StackIndexOfStat {
    fn name(&self) -> &str {
        "stack index of statistic"
    }

    fn out_bands(&self) -> usize {
        1
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Subtracts a per-band mean from every band
pub struct Standardise {
    means: Vec<f64>,
}

impl Standardise {
    pub fn new(means: Vec<f64>) -> Self {
        Self { means }
    }
}

impl PixelCalc for Standardise {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.means.len() != layout.total_bands {
            return Err(CalcError::Configuration(format!(
                "{} band means supplied for {} input bands",
                self.means.len(),
                layout.total_bands
            )));
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        for ((out, &value), &mean) in output.iter_mut().zip(input.values).zip(&self.means) {
            *out = value - mean;
        }
        Ok(())
    }
}

impl CalcUnit for Standardise {
    fn name(&self) -> &str {
        "standardise"
    }

    fn out_bands(&self) -> usize {
        self.means.len()
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Band-wise difference of two images stacked one after the other
pub struct ImageDifference {
    bands: usize,
}

impl ImageDifference {
    /// `bands` is the band count of each of the two images
    pub fn new(bands: usize) -> Self {
        Self { bands }
    }
}

impl PixelCalc for ImageDifference {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.bands == 0 || layout.total_bands != self.bands * 2 {
            return Err(CalcError::Configuration(format!(
                "Image difference of {}-band images needs {} input bands, got {}",
                self.bands,
                self.bands * 2,
                layout.total_bands
            )));
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let (first, second) = input.values.split_at(self.bands);
        for ((out, &a), &b) in output.iter_mut().zip(first).zip(second) {
            *out = a - b;
        }
        Ok(())
    }
}

impl CalcUnit for ImageDifference {
    fn name(&self) -> &str {
        "image difference"
    }

    fn out_bands(&self) -> usize {
        self.bands
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}
