//! Python bindings over numpy arrays

use crate::core::calc::CalcUnit;
use crate::core::engine::{CalcEngine, EngineConfig};
use crate::core::stats::{calc_image_statistics, StatsSelection, StdDevMethod};
use crate::core::zonal::{BandZoneStats, ZonalStatistics, ZoneTable};
use crate::io::{MemoryRaster, RasterStack};
use crate::types::{BandImage, CalcError, NodataConfig, PixelType};
use crate::units::{AngleUnit, Aspect, Slope, TerrainParams};
use ndarray::Axis;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::BTreeMap;

impl From<CalcError> for PyErr {
    fn from(err: CalcError) -> PyErr {
        match err {
            CalcError::Configuration(_) | CalcError::Config(_) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(err.to_string())
            }
            CalcError::NotImplemented { .. } => {
                PyErr::new::<pyo3::exceptions::PyNotImplementedError, _>(err.to_string())
            }
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(err.to_string()),
        }
    }
}

fn run_window_unit(dem: BandImage, unit: &mut dyn CalcUnit) -> Result<BandImage, CalcError> {
    let (rows, cols) = dem.dim();
    let mut stack = RasterStack::single(MemoryRaster::from_image("dem", dem))?;
    let mut out = MemoryRaster::new(unit.name(), 1, rows, cols, PixelType::Float64);
    let engine = CalcEngine::new(EngineConfig::default())?;
    engine.run_windows(&mut stack, unit, Some(&mut out))?;
    Ok(out.into_cube().index_axis_move(Axis(0), 0))
}

/// Statistics of a 2D array as a dict
#[pyfunction]
#[pyo3(signature = (array, nodata=None, one_pass=true, percentiles=Vec::new()))]
fn image_statistics<'py>(
    py: Python<'py>,
    array: PyReadonlyArray2<f64>,
    nodata: Option<f64>,
    one_pass: bool,
    percentiles: Vec<f64>,
) -> PyResult<&'py PyDict> {
    let image = array.as_array().to_owned();
    let config = EngineConfig {
        nodata: nodata.map_or_else(NodataConfig::disabled, NodataConfig::enabled),
        ..Default::default()
    };
    let selection = StatsSelection {
        method: if one_pass {
            StdDevMethod::OnePass
        } else {
            StdDevMethod::TwoPass
        },
        percentiles,
        ..Default::default()
    };

    let engine = CalcEngine::new(config)?;
    let mut stack = RasterStack::single(MemoryRaster::from_image("array", image))?;
    let stats = calc_image_statistics(&engine, &mut stack, selection)?;

    let dict = PyDict::new(py);
    if let Some(band) = stats.first() {
        dict.set_item("count", band.count)?;
        dict.set_item("mean", band.mean)?;
        dict.set_item("min", band.min)?;
        dict.set_item("max", band.max)?;
        dict.set_item("sum", band.sum)?;
        dict.set_item("std_dev", band.std_dev)?;
        dict.set_item("percentiles", band.percentiles.clone())?;
    } else {
        dict.set_item("count", 0)?;
    }
    Ok(dict)
}

/// Slope in degrees of a DEM array
#[pyfunction]
#[pyo3(signature = (dem, ew_res=1.0, ns_res=1.0))]
fn slope<'py>(py: Python<'py>, dem: PyReadonlyArray2<f64>, ew_res: f64, ns_res: f64) -> PyResult<&'py PyArray2<f64>> {
    let mut unit = Slope::new(TerrainParams::new(0, ew_res, ns_res), AngleUnit::Degrees);
    let out = run_window_unit(dem.as_array().to_owned(), &mut unit)?;
    Ok(out.into_pyarray(py))
}

/// Aspect in degrees of a DEM array (NaN on flat cells)
#[pyfunction]
#[pyo3(signature = (dem, ew_res=1.0, ns_res=1.0))]
fn aspect<'py>(py: Python<'py>, dem: PyReadonlyArray2<f64>, ew_res: f64, ns_res: f64) -> PyResult<&'py PyArray2<f64>> {
    let mut unit = Aspect::new(TerrainParams::new(0, ew_res, ns_res));
    let out = run_window_unit(dem.as_array().to_owned(), &mut unit)?;
    Ok(out.into_pyarray(py))
}

/// Mean of `values` per zone id
#[pyfunction]
fn zonal_mean(zones: PyReadonlyArray2<f64>, values: PyReadonlyArray2<f64>) -> PyResult<BTreeMap<u64, f64>> {
    let zone_raster = MemoryRaster::from_image("zones", zones.as_array().to_owned());
    let value_raster = MemoryRaster::from_image("values", values.as_array().to_owned());
    let mut stack = RasterStack::new(vec![Box::new(zone_raster), Box::new(value_raster)])?;

    let mut unit = ZonalStatistics::new(
        vec![BandZoneStats {
            mean: true,
            ..BandZoneStats::new(1)
        }],
        NodataConfig::disabled(),
    );
    let mut table = ZoneTable::new();
    let engine = CalcEngine::new(EngineConfig::default())?;
    engine.run_zones(&mut stack, 0, &mut unit, &mut table)?;

    let field = "b2Mean";
    Ok(table
        .zones()
        .filter_map(|zone| table.get(zone, field).map(|mean| (zone, mean)))
        .collect())
}

/// Python module definition
#[pymodule]
fn _bandcalc(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(image_statistics, m)?)?;
    m.add_function(wrap_pyfunction!(slope, m)?)?;
    m.add_function(wrap_pyfunction!(aspect, m)?)?;
    m.add_function(wrap_pyfunction!(zonal_mean, m)?)?;
    Ok(())
}
