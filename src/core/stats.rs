//! Running image statistics
//!
//! Mean, min, max and sum are streamed per band in O(1) memory. Standard
//! deviation is either streamed (Welford) or computed from a second pass
//! over the same pixels once the mean is known. Percentiles buffer every
//! valid value of a band and sort once at the end.

use crate::core::calc::{BandLayout, CalcUnit, Envelope, PixelCalc, PixelInput};
use crate::core::engine::CalcEngine;
use crate::io::RasterStack;
use crate::types::{CalcError, CalcResult, NodataConfig};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Streaming count/mean/variance/min/max/sum accumulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    n: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            n: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation (Welford update)
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combine with an accumulator over a disjoint set of observations
    /// (Chan et al. parallel update). Associative and commutative up to
    /// floating point rounding.
    pub fn merge(&mut self, other: &RunningStats) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = *other;
            return;
        }
        let n = self.n + other.n;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.n as f64 / n as f64;
        self.m2 += other.m2 + delta * delta * (self.n as f64 * other.n as f64) / n as f64;
        self.mean = mean;
        self.n = n;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    /// NaN when no values were added
    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.max
        }
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.m2 / self.n as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// How standard deviation is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdDevMethod {
    /// Streaming Welford update during the only pass
    OnePass,
    /// Mean from a first pass, squared deviations from a second
    TwoPass,
}

impl Default for StdDevMethod {
    fn default() -> Self {
        StdDevMethod::OnePass
    }
}

/// Which statistics to compute for each band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSelection {
    pub mean: bool,
    pub min: bool,
    pub max: bool,
    pub sum: bool,
    pub std_dev: bool,
    pub method: StdDevMethod,
    /// Percentiles in [0, 100]
    pub percentiles: Vec<f64>,
}

impl Default for StatsSelection {
    fn default() -> Self {
        Self {
            mean: true,
            min: true,
            max: true,
            sum: true,
            std_dev: true,
            method: StdDevMethod::OnePass,
            percentiles: Vec::new(),
        }
    }
}

impl StatsSelection {
    pub fn validate(&self) -> CalcResult<()> {
        for &p in &self.percentiles {
            check_percentile(p)?;
        }
        Ok(())
    }

    pub fn needs_second_pass(&self) -> bool {
        self.std_dev && self.method == StdDevMethod::TwoPass
    }

    pub fn needs_values(&self) -> bool {
        !self.percentiles.is_empty()
    }
}

/// Finalised statistics for one band; unselected statistics are `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub band: usize,
    pub count: u64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: Option<f64>,
    pub std_dev: Option<f64>,
    /// (percentile, value) pairs in the order requested
    pub percentiles: Vec<(f64, f64)>,
}

fn check_percentile(p: f64) -> CalcResult<()> {
    if !(0.0..=100.0).contains(&p) {
        return Err(CalcError::Configuration(format!(
            "Percentile {} is outside [0, 100]",
            p
        )));
    }
    Ok(())
}

/// Order statistic of ascending `sorted` values at percentile `p`.
///
/// Interpolates linearly between the two values around rank
/// `p / 100 * (n - 1)`. Returns NaN for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> CalcResult<f64> {
    check_percentile(p)?;
    let n = sorted.len();
    if n == 0 {
        return Ok(f64::NAN);
    }
    let rank = p / 100.0 * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Sort values ascending (NaN-free input)
pub fn sort_values(values: &mut [f64]) {
    #[cfg(feature = "parallel")]
    values.par_sort_unstable_by(|a, b| a.total_cmp(b));

    #[cfg(not(feature = "parallel"))]
    values.sort_unstable_by(|a, b| a.total_cmp(b));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Second,
}

/// Per-band image statistics as a per-pixel unit.
///
/// Statistics are taken over the floating point bands of each pixel.
/// Values equal to the nodata sentinel (when enabled) and NaN are skipped
/// for every statistic on that band, so all statistics share the same count.
pub struct ImageStatistics {
    selection: StatsSelection,
    nodata: NodataConfig,
    mask: Option<i64>,
    envelope: Option<Envelope>,
    pass: Pass,
    accumulators: Vec<RunningStats>,
    sq_deviations: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl ImageStatistics {
    pub fn new(selection: StatsSelection, nodata: NodataConfig) -> CalcResult<Self> {
        selection.validate()?;
        Ok(Self {
            selection,
            nodata,
            mask: None,
            envelope: None,
            pass: Pass::First,
            accumulators: Vec::new(),
            sq_deviations: Vec::new(),
            values: Vec::new(),
        })
    }

    /// Only use pixels whose first integer band equals `mask_value`
    pub fn with_mask(mut self, mask_value: i64) -> Self {
        self.mask = Some(mask_value);
        self
    }

    /// Only use pixels inside `envelope`
    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn selection(&self) -> &StatsSelection {
        &self.selection
    }

    pub fn needs_second_pass(&self) -> bool {
        self.selection.needs_second_pass()
    }

    /// Switch to accumulating squared deviations from the first-pass mean
    pub fn begin_second_pass(&mut self) -> CalcResult<()> {
        if self.pass == Pass::Second {
            return Err(CalcError::Configuration(
                "Second statistics pass already started".to_string(),
            ));
        }
        self.pass = Pass::Second;
        self.sq_deviations = vec![0.0; self.accumulators.len()];
        Ok(())
    }

    /// Finalise the accumulated statistics, one entry per band
    pub fn finish(&mut self) -> CalcResult<Vec<BandStatistics>> {
        if self.needs_second_pass() && self.pass != Pass::Second {
            return Err(CalcError::Configuration(
                "Two-pass standard deviation requested but only one pass was run".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(self.accumulators.len());
        for (band, acc) in self.accumulators.iter().enumerate() {
            let n = acc.count();
            let has_values = n > 0;
            let pick = |selected: bool, value: f64| (selected && has_values).then_some(value);

            let std_dev = match self.selection.method {
                StdDevMethod::TwoPass if self.selection.std_dev => {
                    (self.sq_deviations[band] / n as f64).sqrt()
                }
                _ => acc.std_dev(),
            };

            let mut percentiles = Vec::with_capacity(self.selection.percentiles.len());
            if self.selection.needs_values() {
                let values = &mut self.values[band];
                if values.is_empty() {
                    log::warn!("Band {} has no valid values for percentiles", band + 1);
                }
                sort_values(values);
                for &p in &self.selection.percentiles {
                    percentiles.push((p, percentile(values, p)?));
                }
            }

            results.push(BandStatistics {
                band,
                count: n,
                mean: pick(self.selection.mean, acc.mean()),
                min: pick(self.selection.min, acc.min()),
                max: pick(self.selection.max, acc.max()),
                sum: pick(self.selection.sum, acc.sum()),
                std_dev: pick(self.selection.std_dev, std_dev),
                percentiles,
            });
        }
        Ok(results)
    }

    fn masked_out(&self, input: &PixelInput<'_>) -> bool {
        if self.envelope.map_or(false, |e| !e.contains(input)) {
            return true;
        }
        match self.mask {
            Some(mask) => input.ints.first().map_or(true, |&m| m != mask),
            None => false,
        }
    }
}

impl PixelCalc for ImageStatistics {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if layout.float_bands() == 0 {
            return Err(CalcError::Configuration(
                "Image statistics need at least one floating point band".to_string(),
            ));
        }
        if self.mask.is_some() && layout.int_bands == 0 {
            return Err(CalcError::Configuration(
                "Masked image statistics need the mask as the first integer band".to_string(),
            ));
        }
        if !self.accumulators.is_empty() && self.accumulators.len() != layout.float_bands() {
            return Err(CalcError::Configuration(format!(
                "Statistics were started over {} bands but the stack now has {}",
                self.accumulators.len(),
                layout.float_bands()
            )));
        }
        Ok(())
    }

    fn begin(&mut self, layout: &BandLayout) -> CalcResult<()> {
        if self.accumulators.is_empty() {
            let bands = layout.float_bands();
            self.accumulators = vec![RunningStats::new(); bands];
            if self.selection.needs_values() {
                self.values = vec![Vec::new(); bands];
            }
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, _output: &mut [f64]) -> CalcResult<()> {
        if self.masked_out(input) {
            return Ok(());
        }

        for (band, &value) in input.floats.iter().enumerate() {
            if value.is_nan() || self.nodata.is_nodata(value) {
                continue;
            }
            match self.pass {
                Pass::First => {
                    self.accumulators[band].push(value);
                    if let Some(values) = self.values.get_mut(band) {
                        values.push(value);
                    }
                }
                Pass::Second => {
                    let d = value - self.accumulators[band].mean();
                    if let Some(sq) = self.sq_deviations.get_mut(band) {
                        *sq += d * d;
                    }
                }
            }
        }
        Ok(())
    }
}

impl CalcUnit for ImageStatistics {
    fn name(&self) -> &str {
        "image statistics"
    }

    fn out_bands(&self) -> usize {
        0
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Run one or two passes of `ImageStatistics` over `stack`
pub fn calc_image_statistics(
    engine: &CalcEngine,
    stack: &mut RasterStack,
    selection: StatsSelection,
) -> CalcResult<Vec<BandStatistics>> {
    calc_image_statistics_in(engine, stack, selection, None)
}

/// As `calc_image_statistics`, restricted to pixels inside `envelope`
pub fn calc_image_statistics_in(
    engine: &CalcEngine,
    stack: &mut RasterStack,
    selection: StatsSelection,
    envelope: Option<Envelope>,
) -> CalcResult<Vec<BandStatistics>> {
    let mut unit = ImageStatistics::new(selection, engine.config().nodata)?;
    if let Some(envelope) = envelope {
        unit = unit.with_envelope(envelope);
    }
    engine.run_pixels(stack, &mut unit, None)?;
    if unit.needs_second_pass() {
        log::debug!("Starting second statistics pass");
        unit.begin_second_pass()?;
        engine.run_pixels(stack, &mut unit, None)?;
    }
    unit.finish()
}

/// One running statistic over several bands, or over the bands of every
/// image in a stack
pub struct AllBandsStatistics {
    bands: Option<Vec<usize>>,
    nodata: NodataConfig,
    envelope: Option<Envelope>,
    percentiles: Vec<f64>,
    stats: RunningStats,
    values: Vec<f64>,
}

impl AllBandsStatistics {
    /// `bands` indexes the stack band vector; `None` uses every band
    pub fn new(bands: Option<Vec<usize>>, nodata: NodataConfig) -> Self {
        Self {
            bands,
            nodata,
            envelope: None,
            percentiles: Vec::new(),
            stats: RunningStats::new(),
            values: Vec::new(),
        }
    }

    pub fn with_percentiles(mut self, percentiles: Vec<f64>) -> CalcResult<Self> {
        for &p in &percentiles {
            check_percentile(p)?;
        }
        self.percentiles = percentiles;
        Ok(self)
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn running(&self) -> &RunningStats {
        &self.stats
    }

    pub fn finish(&mut self) -> CalcResult<BandStatistics> {
        let mut percentiles = Vec::with_capacity(self.percentiles.len());
        if !self.percentiles.is_empty() {
            sort_values(&mut self.values);
            for &p in &self.percentiles {
                percentiles.push((p, percentile(&self.values, p)?));
            }
        }
        let has_values = self.stats.count() > 0;
        Ok(BandStatistics {
            band: 0,
            count: self.stats.count(),
            mean: has_values.then(|| self.stats.mean()),
            min: has_values.then(|| self.stats.min()),
            max: has_values.then(|| self.stats.max()),
            sum: has_values.then(|| self.stats.sum()),
            std_dev: has_values.then(|| self.stats.std_dev()),
            percentiles,
        })
    }

    fn add(&mut self, value: f64) {
        if value.is_nan() || self.nodata.is_nodata(value) {
            return;
        }
        self.stats.push(value);
        if !self.percentiles.is_empty() {
            self.values.push(value);
        }
    }
}

impl PixelCalc for AllBandsStatistics {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if let Some(bands) = &self.bands {
            if bands.is_empty() {
                return Err(CalcError::Configuration(
                    "No bands selected for combined statistics".to_string(),
                ));
            }
            for &band in bands {
                layout.check_band(band, "all bands statistics")?;
            }
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, _output: &mut [f64]) -> CalcResult<()> {
        if self.envelope.map_or(false, |e| !e.contains(input)) {
            return Ok(());
        }
        match self.bands.take() {
            Some(bands) => {
                for &band in &bands {
                    self.add(input.values[band]);
                }
                self.bands = Some(bands);
            }
            None => {
                for &value in input.values {
                    self.add(value);
                }
            }
        }
        Ok(())
    }
}

impl CalcUnit for AllBandsStatistics {
    fn name(&self) -> &str {
        "all bands statistics"
    }

    fn out_bands(&self) -> usize {
        0
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Fixed-width histogram of one band.
///
/// Bins are half open `[lower, lower + width)` except the last, which
/// also includes the upper bound. Values outside the range are counted
/// separately.
pub struct ImageHistogram {
    band: usize,
    lower: f64,
    upper: f64,
    bin_width: f64,
    nodata: NodataConfig,
    envelope: Option<Envelope>,
    counts: Vec<u64>,
    out_of_range: u64,
}

impl ImageHistogram {
    pub fn new(band: usize, lower: f64, upper: f64, num_bins: usize, nodata: NodataConfig) -> CalcResult<Self> {
        if num_bins == 0 || !(upper > lower) {
            return Err(CalcError::Configuration(format!(
                "Histogram needs at least one bin over a non-empty range, got {} bins over [{}, {}]",
                num_bins, lower, upper
            )));
        }
        Ok(Self {
            band,
            lower,
            upper,
            bin_width: (upper - lower) / num_bins as f64,
            nodata,
            envelope: None,
            counts: vec![0; num_bins],
            out_of_range: 0,
        })
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn out_of_range(&self) -> u64 {
        self.out_of_range
    }

    /// Lower edge of each bin
    pub fn bin_edges(&self) -> Vec<f64> {
        (0..self.counts.len())
            .map(|i| self.lower + i as f64 * self.bin_width)
            .collect()
    }
}

impl PixelCalc for ImageHistogram {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        layout.check_band(self.band, "image histogram")
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, _output: &mut [f64]) -> CalcResult<()> {
        if self.envelope.map_or(false, |e| !e.contains(input)) {
            return Ok(());
        }
        let value = input.values[self.band];
        if value.is_nan() || self.nodata.is_nodata(value) {
            return Ok(());
        }
        if value < self.lower || value > self.upper {
            self.out_of_range += 1;
            return Ok(());
        }
        let last = self.counts.len() - 1;
        let bin = (((value - self.lower) / self.bin_width) as usize).min(last);
        self.counts[bin] += 1;
        Ok(())
    }
}

impl CalcUnit for ImageHistogram {
    fn name(&self) -> &str {
        "image histogram"
    }

    fn out_bands(&self) -> usize {
        0
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}
