//! Zone (clump) attribute aggregation
//!
//! Pixels are grouped by the integer id held in a zone band. Per-zone
//! units accumulate during the pass and write one row per zone into a
//! `ZoneTable` when the pass finishes.

use crate::core::calc::{BandLayout, CalcUnit, PixelCalc, PixelInput, ZoneCalc};
use crate::core::stats::{percentile, sort_values, RunningStats};
use crate::types::{CalcError, CalcResult, NodataConfig};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Attribute table keyed by zone id, with named numeric columns.
///
/// Rows are created on first use and never removed; cells that were never
/// written read back as `None`.
#[derive(Debug, Clone, Default)]
pub struct ZoneTable {
    columns: Vec<String>,
    rows: BTreeMap<u64, Vec<Option<f64>>>,
}

impl ZoneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-seeded with rows for the given zone ids
    pub fn with_rows<I: IntoIterator<Item = u64>>(zones: I) -> Self {
        let mut table = Self::new();
        for zone in zones {
            table.ensure_row(zone);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of column `name`, adding it to every row if missing
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in self.rows.values_mut() {
            row.push(None);
        }
        self.columns.len() - 1
    }

    pub fn ensure_row(&mut self, zone: u64) {
        let width = self.columns.len();
        self.rows.entry(zone).or_insert_with(|| vec![None; width]);
    }

    pub fn contains(&self, zone: u64) -> bool {
        self.rows.contains_key(&zone)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, zone: u64, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows.get(&zone).and_then(|row| row[idx])
    }

    /// Set one cell, creating the row if needed. The column must exist.
    pub fn set(&mut self, zone: u64, column: &str, value: f64) -> CalcResult<()> {
        let idx = self.column_index(column).ok_or_else(|| {
            CalcError::Configuration(format!("Zone table has no column '{}'", column))
        })?;
        self.ensure_row(zone);
        if let Some(row) = self.rows.get_mut(&zone) {
            row[idx] = Some(value);
        }
        Ok(())
    }

    /// Zone ids in ascending order
    pub fn zones(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.keys().copied()
    }

    /// Rows in ascending zone order
    pub fn rows(&self) -> impl Iterator<Item = (u64, &[Option<f64>])> + '_ {
        self.rows.iter().map(|(&zone, row)| (zone, row.as_slice()))
    }
}

/// Named percentile column
#[derive(Debug, Clone, PartialEq)]
pub struct ZonePercentile {
    pub percentile: f64,
    pub field: String,
}

/// Statistics to compute for one value band
#[derive(Debug, Clone, PartialEq)]
pub struct BandZoneStats {
    /// Stack band index of the values
    pub band: usize,
    /// Column name prefix, `b<band + 1>` by default
    pub prefix: String,
    pub mean: bool,
    pub min: bool,
    pub max: bool,
    pub sum: bool,
    pub std_dev: bool,
    pub count: bool,
    pub percentiles: Vec<ZonePercentile>,
}

impl BandZoneStats {
    /// Nothing selected
    pub fn new(band: usize) -> Self {
        Self {
            band,
            prefix: format!("b{}", band + 1),
            mean: false,
            min: false,
            max: false,
            sum: false,
            std_dev: false,
            count: false,
            percentiles: Vec::new(),
        }
    }

    /// Mean, min, max, sum, standard deviation and count
    pub fn all(band: usize) -> Self {
        Self {
            mean: true,
            min: true,
            max: true,
            sum: true,
            std_dev: true,
            count: true,
            ..Self::new(band)
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_percentile(mut self, percentile: f64, field: &str) -> Self {
        self.percentiles.push(ZonePercentile {
            percentile,
            field: field.to_string(),
        });
        self
    }

    pub fn field(&self, stat: &str) -> String {
        format!("{}{}", self.prefix, stat)
    }

    fn columns(&self) -> Vec<String> {
        let mut cols = Vec::new();
        for (selected, stat) in [
            (self.mean, "Mean"),
            (self.min, "Min"),
            (self.max, "Max"),
            (self.sum, "Sum"),
            (self.std_dev, "StdDev"),
            (self.count, "Count"),
        ] {
            if selected {
                cols.push(self.field(stat));
            }
        }
        cols.extend(self.percentiles.iter().map(|p| p.field.clone()));
        cols
    }
}

#[derive(Debug, Clone, Default)]
struct ZoneAccumulator {
    stats: RunningStats,
    values: Vec<f64>,
}

/// Per-zone statistics of one or more value bands
pub struct ZonalStatistics {
    bands: Vec<BandZoneStats>,
    nodata: NodataConfig,
    zones: BTreeMap<u64, Vec<ZoneAccumulator>>,
}

impl ZonalStatistics {
    pub fn new(bands: Vec<BandZoneStats>, nodata: NodataConfig) -> Self {
        Self {
            bands,
            nodata,
            zones: BTreeMap::new(),
        }
    }
}

impl ZoneCalc for ZonalStatistics {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.bands.is_empty() {
            return Err(CalcError::Configuration(
                "Zonal statistics need at least one value band".to_string(),
            ));
        }
        for band in &self.bands {
            layout.check_band(band.band, "zonal statistics")?;
            for p in &band.percentiles {
                if !(0.0..=100.0).contains(&p.percentile) {
                    return Err(CalcError::Configuration(format!(
                        "Percentile {} for field '{}' is outside [0, 100]",
                        p.percentile, p.field
                    )));
                }
            }
        }
        Ok(())
    }

    fn columns(&self) -> Vec<String> {
        self.bands.iter().flat_map(|b| b.columns()).collect()
    }

    fn calc_zone(&mut self, zone: u64, input: &PixelInput<'_>) -> CalcResult<()> {
        let n_bands = self.bands.len();
        let accs = self
            .zones
            .entry(zone)
            .or_insert_with(|| vec![ZoneAccumulator::default(); n_bands]);

        for (idx, band) in self.bands.iter().enumerate() {
            let value = input.values[band.band];
            if value.is_nan() || self.nodata.is_nodata(value) {
                continue;
            }
            accs[idx].stats.push(value);
            if !band.percentiles.is_empty() {
                accs[idx].values.push(value);
            }
        }
        Ok(())
    }

    fn finalize(&mut self, table: &mut ZoneTable) -> CalcResult<()> {
        let mut entries: Vec<(&u64, &mut Vec<ZoneAccumulator>)> = self.zones.iter_mut().collect();

        #[cfg(feature = "parallel")]
        entries.par_iter_mut().for_each(|(_, accs)| {
            for acc in accs.iter_mut() {
                sort_values(&mut acc.values);
            }
        });

        #[cfg(not(feature = "parallel"))]
        entries.iter_mut().for_each(|(_, accs)| {
            for acc in accs.iter_mut() {
                sort_values(&mut acc.values);
            }
        });

        for (&zone, accs) in entries {
            for (band, acc) in self.bands.iter().zip(accs.iter()) {
                let stats = &acc.stats;
                if band.count {
                    table.set(zone, &band.field("Count"), stats.count() as f64)?;
                }
                if stats.count() == 0 {
                    continue;
                }
                let fields = [
                    (band.mean, "Mean", stats.mean()),
                    (band.min, "Min", stats.min()),
                    (band.max, "Max", stats.max()),
                    (band.sum, "Sum", stats.sum()),
                    (band.std_dev, "StdDev", stats.std_dev()),
                ];
                for (selected, stat, value) in fields {
                    if selected {
                        table.set(zone, &band.field(stat), value)?;
                    }
                }
                for p in &band.percentiles {
                    table.set(zone, &p.field, percentile(&acc.values, p.percentile)?)?;
                }
            }
        }

        log::debug!("Wrote statistics for {} zones", self.zones.len());
        Ok(())
    }
}

impl CalcUnit for ZonalStatistics {
    fn name(&self) -> &str {
        "zonal statistics"
    }

    fn out_bands(&self) -> usize {
        0
    }

    fn as_zone(&mut self) -> Option<&mut dyn ZoneCalc> {
        Some(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtentAccumulator {
    min_row: usize,
    max_row: usize,
    min_col: usize,
    max_col: usize,
    sum_x: f64,
    sum_y: f64,
    n: u64,
}

/// Per-zone pixel extent and mean map location
#[derive(Default)]
pub struct ZoneExtent {
    zones: BTreeMap<u64, ExtentAccumulator>,
}

impl ZoneExtent {
    pub const COLUMNS: [&'static str; 6] = ["MinXPxl", "MaxXPxl", "MinYPxl", "MaxYPxl", "Easting", "Northing"];

    pub fn new() -> Self {
        Self::default()
    }
}

impl ZoneCalc for ZoneExtent {
    fn columns(&self) -> Vec<String> {
        Self::COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    fn calc_zone(&mut self, zone: u64, input: &PixelInput<'_>) -> CalcResult<()> {
        let acc = self.zones.entry(zone).or_insert(ExtentAccumulator {
            min_row: input.row,
            max_row: input.row,
            min_col: input.col,
            max_col: input.col,
            sum_x: 0.0,
            sum_y: 0.0,
            n: 0,
        });
        acc.min_row = acc.min_row.min(input.row);
        acc.max_row = acc.max_row.max(input.row);
        acc.min_col = acc.min_col.min(input.col);
        acc.max_col = acc.max_col.max(input.col);
        acc.sum_x += input.x;
        acc.sum_y += input.y;
        acc.n += 1;
        Ok(())
    }

    fn finalize(&mut self, table: &mut ZoneTable) -> CalcResult<()> {
        for (&zone, acc) in &self.zones {
            let n = acc.n as f64;
            table.set(zone, "MinXPxl", acc.min_col as f64)?;
            table.set(zone, "MaxXPxl", acc.max_col as f64)?;
            table.set(zone, "MinYPxl", acc.min_row as f64)?;
            table.set(zone, "MaxYPxl", acc.max_row as f64)?;
            table.set(zone, "Easting", acc.sum_x / n)?;
            table.set(zone, "Northing", acc.sum_y / n)?;
        }
        Ok(())
    }
}

impl CalcUnit for ZoneExtent {
    fn name(&self) -> &str {
        "zone extent"
    }

    fn out_bands(&self) -> usize {
        0
    }

    fn as_zone(&mut self) -> Option<&mut dyn ZoneCalc> {
        Some(self)
    }
}

/// Writes zone table columns back out as image bands.
///
/// Each pixel takes the values of its zone's row; pixels whose zone is
/// not in the table, or whose cell was never set, get `nodata`.
pub struct ZoneColumnExport {
    zone_band: usize,
    columns: Vec<String>,
    values: BTreeMap<u64, Vec<f64>>,
    nodata: f64,
}

impl ZoneColumnExport {
    pub fn new(table: &ZoneTable, zone_band: usize, columns: &[&str], nodata: f64) -> CalcResult<Self> {
        let mut indices = Vec::with_capacity(columns.len());
        for &column in columns {
            let idx = table.column_index(column).ok_or_else(|| {
                CalcError::Configuration(format!("Zone table has no column '{}'", column))
            })?;
            indices.push(idx);
        }

        let values = table
            .rows()
            .map(|(zone, row)| {
                let picked = indices.iter().map(|&i| row[i].unwrap_or(nodata)).collect();
                (zone, picked)
            })
            .collect();

        Ok(Self {
            zone_band,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values,
            nodata,
        })
    }
}

impl PixelCalc for ZoneColumnExport {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        layout.check_band(self.zone_band, "zone column export")
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let zone_value = input.values[self.zone_band];
        let row = if zone_value.is_finite() && zone_value >= 0.0 {
            self.values.get(&(zone_value as u64))
        } else {
            None
        };
        match row {
            Some(values) => output.copy_from_slice(values),
            None => output.fill(self.nodata),
        }
        Ok(())
    }
}

impl CalcUnit for ZoneColumnExport {
    fn name(&self) -> &str {
        "zone column export"
    }

    fn out_bands(&self) -> usize {
        self.columns.len()
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}
