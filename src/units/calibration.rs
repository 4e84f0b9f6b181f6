//! Calibration units driven by coefficient tables
//!
//! The coefficient formula is supplied by the caller; these units only
//! select coefficients and route band values to it.

use crate::core::calc::{BandLayout, CalcUnit, PixelCalc, PixelInput};
use crate::types::{CalcError, CalcResult, NodataConfig};

/// Coefficient triple for one input band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandCoefficients {
    /// Stack band the coefficients apply to
    pub band: usize,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

/// Coefficients for one aerosol optical thickness
#[derive(Debug, Clone, PartialEq)]
pub struct AotEntry {
    pub aot: f64,
    pub coefficients: Vec<BandCoefficients>,
}

/// All AOT entries for one elevation
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationEntry {
    pub elevation: f64,
    pub aot: Vec<AotEntry>,
}

/// Coefficient table indexed by elevation and AOT, sorted ascending on both
#[derive(Debug, Clone)]
pub struct CalibrationLut {
    entries: Vec<ElevationEntry>,
    band_count: usize,
}

impl CalibrationLut {
    pub fn new(mut entries: Vec<ElevationEntry>) -> CalcResult<Self> {
        if entries.is_empty() {
            return Err(CalcError::Configuration(
                "Calibration LUT has no elevation entries".to_string(),
            ));
        }

        entries.sort_by(|a, b| a.elevation.total_cmp(&b.elevation));
        let mut band_count = None;
        for entry in entries.iter_mut() {
            if entry.aot.is_empty() {
                return Err(CalcError::Configuration(format!(
                    "Calibration LUT elevation {} has no AOT entries",
                    entry.elevation
                )));
            }
            entry.aot.sort_by(|a, b| a.aot.total_cmp(&b.aot));
            for aot in &entry.aot {
                let n = aot.coefficients.len();
                match band_count {
                    None => band_count = Some(n),
                    Some(expected) if expected != n => {
                        return Err(CalcError::Configuration(format!(
                            "Calibration LUT entry (elevation {}, AOT {}) has {} band coefficients, expected {}",
                            entry.elevation, aot.aot, n, expected
                        )));
                    }
                    _ => {}
                }
            }
        }

        let band_count = band_count.unwrap_or(0);
        if band_count == 0 {
            return Err(CalcError::Configuration(
                "Calibration LUT entries have no band coefficients".to_string(),
            ));
        }

        log::debug!(
            "Calibration LUT: {} elevations, {} bands",
            entries.len(),
            band_count
        );
        Ok(Self { entries, band_count })
    }

    /// Coefficients per band in every entry
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn entries(&self) -> &[ElevationEntry] {
        &self.entries
    }

    /// Entry nearest to `elevation`, then nearest to `aot` within it
    /// (the first AOT entry when `aot` is `None`). Ties pick the lower key.
    pub fn lookup(&self, elevation: f64, aot: Option<f64>) -> &AotEntry {
        let elev_idx = nearest_index(&self.entries, elevation, |e| e.elevation);
        let entry = &self.entries[elev_idx];
        let aot_idx = match aot {
            Some(value) => nearest_index(&entry.aot, value, |a| a.aot),
            None => 0,
        };
        &entry.aot[aot_idx]
    }
}

/// Index of the element whose key is nearest to `value` in a non-empty,
/// ascending slice
fn nearest_index<T, F>(items: &[T], value: f64, key: F) -> usize
where
    F: Fn(&T) -> f64,
{
    let upper = items.partition_point(|item| key(item) < value);
    if upper == 0 {
        return 0;
    }
    if upper == items.len() {
        return items.len() - 1;
    }
    let below = value - key(&items[upper - 1]);
    let above = key(&items[upper]) - value;
    if above < below {
        upper
    } else {
        upper - 1
    }
}

/// Per-pixel calibration choosing LUT coefficients by the pixel's
/// elevation (and optionally AOT) band, then applying `formula` to each
/// listed band value.
pub struct LutCalibration<F> {
    lut: CalibrationLut,
    elevation_band: usize,
    aot_band: Option<usize>,
    nodata: NodataConfig,
    formula: F,
}

impl<F> LutCalibration<F>
where
    F: Fn(f64, &BandCoefficients) -> f64,
{
    pub fn new(lut: CalibrationLut, elevation_band: usize, formula: F) -> Self {
        Self {
            lut,
            elevation_band,
            aot_band: None,
            nodata: NodataConfig::disabled(),
            formula,
        }
    }

    pub fn with_aot_band(mut self, band: usize) -> Self {
        self.aot_band = Some(band);
        self
    }

    /// Band values equal to the nodata value pass through unchanged
    pub fn with_nodata(mut self, nodata: NodataConfig) -> Self {
        self.nodata = nodata;
        self
    }
}

impl<F> PixelCalc for LutCalibration<F>
where
    F: Fn(f64, &BandCoefficients) -> f64,
{
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        layout.check_band(self.elevation_band, "LUT calibration")?;
        if let Some(band) = self.aot_band {
            layout.check_band(band, "LUT calibration")?;
        }
        for entry in self.lut.entries() {
            for aot in &entry.aot {
                for coeff in &aot.coefficients {
                    layout.check_band(coeff.band, "LUT calibration")?;
                }
            }
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let elevation = input.values[self.elevation_band];
        let aot = self.aot_band.map(|b| input.values[b]);
        let entry = self.lut.lookup(elevation, aot);
        for (out, coeff) in output.iter_mut().zip(&entry.coefficients) {
            let value = input.values[coeff.band];
            *out = if self.nodata.is_nodata(value) {
                value
            } else {
                (self.formula)(value, coeff)
            };
        }
        Ok(())
    }
}

impl<F> CalcUnit for LutCalibration<F>
where
    F: Fn(f64, &BandCoefficients) -> f64,
{
    fn name(&self) -> &str {
        "LUT calibration"
    }

    fn out_bands(&self) -> usize {
        self.lut.band_count()
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Dark-object style offset subtraction.
///
/// The stack holds the image bands followed by the same number of offset
/// bands. With `non_negative`, results below `floor` are set to `floor`.
pub struct SubtractOffsets {
    bands: usize,
    non_negative: bool,
    floor: f64,
    nodata: NodataConfig,
}

impl SubtractOffsets {
    pub fn new(bands: usize, non_negative: bool, floor: f64) -> Self {
        Self {
            bands,
            non_negative,
            floor,
            nodata: NodataConfig::disabled(),
        }
    }

    /// Image values equal to the nodata value are written unchanged
    pub fn with_nodata(mut self, nodata: NodataConfig) -> Self {
        self.nodata = nodata;
        self
    }
}

impl PixelCalc for SubtractOffsets {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.bands == 0 || layout.total_bands != self.bands * 2 {
            return Err(CalcError::Configuration(format!(
                "Offset subtraction of {} bands needs {} input bands (image then offsets), got {}",
                self.bands,
                self.bands * 2,
                layout.total_bands
            )));
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        let (image, offsets) = input.values.split_at(self.bands);
        for ((out, &value), &offset) in output.iter_mut().zip(image).zip(offsets) {
            *out = subtract_offset(value, offset, self.non_negative, self.floor, &self.nodata);
        }
        Ok(())
    }
}

impl CalcUnit for SubtractOffsets {
    fn name(&self) -> &str {
        "subtract offsets"
    }

    fn out_bands(&self) -> usize {
        self.bands
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

/// Offset subtraction with one fixed offset per image band
pub struct SubtractSingleOffsets {
    offsets: Vec<f64>,
    non_negative: bool,
    floor: f64,
    nodata: NodataConfig,
}

impl SubtractSingleOffsets {
    pub fn new(offsets: Vec<f64>, non_negative: bool, floor: f64) -> Self {
        Self {
            offsets,
            non_negative,
            floor,
            nodata: NodataConfig::disabled(),
        }
    }

    pub fn with_nodata(mut self, nodata: NodataConfig) -> Self {
        self.nodata = nodata;
        self
    }
}

impl PixelCalc for SubtractSingleOffsets {
    fn validate(&self, layout: &BandLayout) -> CalcResult<()> {
        if self.offsets.is_empty() || layout.total_bands != self.offsets.len() {
            return Err(CalcError::Configuration(format!(
                "{} offsets were given for an image of {} bands",
                self.offsets.len(),
                layout.total_bands
            )));
        }
        Ok(())
    }

    fn calc_pixel(&mut self, input: &PixelInput<'_>, output: &mut [f64]) -> CalcResult<()> {
        for ((out, &value), &offset) in output.iter_mut().zip(input.values).zip(&self.offsets) {
            *out = subtract_offset(value, offset, self.non_negative, self.floor, &self.nodata);
        }
        Ok(())
    }
}

impl CalcUnit for SubtractSingleOffsets {
    fn name(&self) -> &str {
        "subtract single offsets"
    }

    fn out_bands(&self) -> usize {
        self.offsets.len()
    }

    fn as_pixel(&mut self) -> Option<&mut dyn PixelCalc> {
        Some(self)
    }
}

fn subtract_offset(value: f64, offset: f64, non_negative: bool, floor: f64, nodata: &NodataConfig) -> f64 {
    if nodata.is_nodata(value) {
        return value;
    }
    let corrected = value - offset;
    if non_negative && corrected < floor {
        floor
    } else {
        corrected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coeffs(scale: f64) -> Vec<BandCoefficients> {
        vec![
            BandCoefficients { band: 1, a: scale, b: 0.0, c: 0.0 },
            BandCoefficients { band: 2, a: scale * 2.0, b: 1.0, c: 0.0 },
        ]
    }

    fn lut() -> CalibrationLut {
        CalibrationLut::new(vec![
            ElevationEntry {
                elevation: 1000.0,
                aot: vec![
                    AotEntry { aot: 0.5, coefficients: coeffs(30.0) },
                    AotEntry { aot: 0.1, coefficients: coeffs(20.0) },
                ],
            },
            ElevationEntry {
                elevation: 0.0,
                aot: vec![AotEntry { aot: 0.1, coefficients: coeffs(10.0) }],
            },
        ])
        .unwrap()
    }

    fn input(values: &[f64]) -> PixelInput<'_> {
        PixelInput {
            row: 0,
            col: 0,
            x: 0.5,
            y: 0.5,
            values,
            ints: &[],
            floats: values,
        }
    }

    #[test]
    fn test_lut_sorted_nearest_lookup() {
        let lut = lut();
        assert_eq!(lut.entries()[0].elevation, 0.0);
        assert_eq!(lut.lookup(-50.0, None).coefficients[0].a, 10.0);
        assert_eq!(lut.lookup(400.0, None).coefficients[0].a, 10.0);
        assert_eq!(lut.lookup(600.0, None).coefficients[0].a, 20.0);
        assert_eq!(lut.lookup(5000.0, Some(0.4)).coefficients[0].a, 30.0);
        assert_eq!(lut.lookup(900.0, Some(0.2)).coefficients[0].a, 20.0);
    }

    #[test]
    fn test_lut_rejects_inconsistent_band_counts() {
        let result = CalibrationLut::new(vec![ElevationEntry {
            elevation: 0.0,
            aot: vec![
                AotEntry { aot: 0.1, coefficients: coeffs(1.0) },
                AotEntry { aot: 0.2, coefficients: vec![] },
            ],
        }]);
        assert!(matches!(result, Err(CalcError::Configuration(_))));
        assert!(CalibrationLut::new(vec![]).is_err());
    }

    #[test]
    fn test_lut_calibration_applies_formula() {
        let mut unit = LutCalibration::new(lut(), 0, |value, c: &BandCoefficients| value * c.a - c.b);
        assert_eq!(unit.out_bands(), 2);
        let layout = BandLayout { int_bands: 0, total_bands: 3 };
        assert!(PixelCalc::validate(&unit, &layout).is_ok());

        let mut out = [0.0; 2];
        unit.calc_pixel(&input(&[950.0, 2.0, 3.0]), &mut out).unwrap();
        assert_eq!(out, [40.0, 119.0]);

        let narrow = BandLayout { int_bands: 0, total_bands: 2 };
        assert!(PixelCalc::validate(&unit, &narrow).is_err());
    }

    #[test]
    fn test_subtract_offsets() {
        let mut unit = SubtractOffsets::new(2, true, 1.0).with_nodata(NodataConfig::enabled(0.0));
        let mut out = [0.0; 2];
        unit.calc_pixel(&input(&[50.0, 10.0, 20.0, 30.0]), &mut out).unwrap();
        assert_eq!(out, [30.0, 1.0]);

        unit.calc_pixel(&input(&[0.0, 40.0, 20.0, 30.0]), &mut out).unwrap();
        assert_eq!(out, [0.0, 10.0]);

        let layout = BandLayout { int_bands: 0, total_bands: 3 };
        assert!(unit.validate(&layout).is_err());
    }
}
