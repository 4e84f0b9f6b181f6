use approx::assert_relative_eq;
use bandcalc::core::{AllBandsStatistics, ImageHistogram, ImageStatistics, RunningStats};
use bandcalc::{
    calc_image_statistics, calc_image_statistics_in, CalcEngine, CalcError, EngineConfig, Envelope, GeoTransform,
    MemoryRaster, NodataConfig, RasterStack, StatsSelection, StdDevMethod,
};
use ndarray::Array3;

fn test_cube() -> Array3<f64> {
    // Large offset relative to the spread stresses the variance calculation
    Array3::from_shape_fn((2, 40, 25), |(b, r, c)| {
        1.0e4 * (b + 1) as f64 + ((r * 25 + c) as f64 * 0.731).sin() * 3.0 + (r as f64) * 0.01
    })
}

fn run(selection: StatsSelection, block_rows: usize) -> Vec<bandcalc::core::BandStatistics> {
    let engine = CalcEngine::new(EngineConfig {
        block_rows,
        ..Default::default()
    })
    .unwrap();
    let mut stack = RasterStack::single(MemoryRaster::from_cube("cube", test_cube())).unwrap();
    calc_image_statistics(&engine, &mut stack, selection).unwrap()
}

#[test]
fn test_one_pass_and_two_pass_std_dev_agree() {
    let one = run(StatsSelection::default(), 7);
    let two = run(
        StatsSelection {
            method: StdDevMethod::TwoPass,
            ..Default::default()
        },
        7,
    );

    assert_eq!(one.len(), 2);
    for (a, b) in one.iter().zip(&two) {
        assert_eq!(a.count, 1000);
        assert_eq!(a.count, b.count);
        assert_relative_eq!(a.mean.unwrap(), b.mean.unwrap(), max_relative = 1e-12);
        assert_relative_eq!(a.std_dev.unwrap(), b.std_dev.unwrap(), max_relative = 1e-6);
    }

    // Reference from the raw values
    let cube = test_cube();
    let band: Vec<f64> = cube.index_axis(ndarray::Axis(0), 1).iter().copied().collect();
    let mean = band.iter().sum::<f64>() / band.len() as f64;
    let sd = (band.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / band.len() as f64).sqrt();
    assert_relative_eq!(two[1].std_dev.unwrap(), sd, max_relative = 1e-9);
}

#[test]
fn test_nodata_excluded_from_mean_and_count() {
    let engine = CalcEngine::new(EngineConfig {
        nodata: NodataConfig::enabled(-9999.0),
        ..Default::default()
    })
    .unwrap();
    let mut stack = RasterStack::single(MemoryRaster::from_rows("v", 1, 3, vec![1.0, -9999.0, 3.0]).unwrap()).unwrap();
    let stats = calc_image_statistics(&engine, &mut stack, StatsSelection::default()).unwrap();

    assert_eq!(stats[0].count, 2);
    assert_eq!(stats[0].mean, Some(2.0));
    assert_eq!(stats[0].sum, Some(4.0));
    assert_eq!(stats[0].std_dev, Some(1.0));
}

#[test]
fn test_percentiles_deterministic_across_runs() {
    let selection = StatsSelection {
        percentiles: vec![17.5, 50.0, 82.5],
        ..Default::default()
    };
    let first = run(selection.clone(), 5);
    let second = run(selection.clone(), 5);
    let other_blocks = run(selection, 40);

    assert_eq!(first, second);
    assert_eq!(first, other_blocks);
    let p = &first[0].percentiles;
    assert_eq!(p.len(), 3);
    assert!(p[0].1 <= p[1].1 && p[1].1 <= p[2].1);
    assert!(first[0].min.unwrap() <= p[0].1 && p[2].1 <= first[0].max.unwrap());
}

#[test]
fn test_unselected_statistics_are_absent() {
    let selection = StatsSelection {
        mean: false,
        sum: false,
        std_dev: false,
        ..Default::default()
    };
    let stats = run(selection, 16);
    assert!(stats[0].mean.is_none());
    assert!(stats[0].sum.is_none());
    assert!(stats[0].std_dev.is_none());
    assert!(stats[0].min.is_some());
    assert!(stats[0].max.is_some());
}

#[test]
fn test_invalid_percentile_rejected_before_run() {
    let selection = StatsSelection {
        percentiles: vec![101.0],
        ..Default::default()
    };
    let unit = ImageStatistics::new(selection, NodataConfig::disabled());
    assert!(unit.is_err());
}

#[test]
fn test_partitioned_accumulators_merge() {
    let cube = test_cube();
    let engine = CalcEngine::new(EngineConfig::default()).unwrap();

    let mut stack = RasterStack::single(MemoryRaster::from_cube("cube", cube.clone())).unwrap();
    let mut whole = AllBandsStatistics::new(None, NodataConfig::disabled());
    engine.run_pixels(&mut stack, &mut whole, None).unwrap();

    let mut merged = RunningStats::new();
    for band in 0..2 {
        let image = cube.index_axis(ndarray::Axis(0), band).to_owned();
        let mut stack = RasterStack::single(MemoryRaster::from_image("band", image)).unwrap();
        let mut part = AllBandsStatistics::new(None, NodataConfig::disabled());
        engine.run_pixels(&mut stack, &mut part, None).unwrap();
        merged.merge(part.running());
    }

    assert_eq!(merged.count(), whole.running().count());
    assert_relative_eq!(merged.mean(), whole.running().mean(), max_relative = 1e-12);
    assert_relative_eq!(merged.std_dev(), whole.running().std_dev(), max_relative = 1e-9);
}

#[test]
fn test_all_nodata_band_still_reported() {
    let engine = CalcEngine::new(EngineConfig {
        nodata: NodataConfig::enabled(-9999.0),
        ..Default::default()
    })
    .unwrap();

    for method in [StdDevMethod::OnePass, StdDevMethod::TwoPass] {
        let mut stack =
            RasterStack::single(MemoryRaster::from_rows("empty", 1, 3, vec![-9999.0; 3]).unwrap()).unwrap();
        let selection = StatsSelection {
            method,
            percentiles: vec![50.0],
            ..Default::default()
        };
        let stats = calc_image_statistics(&engine, &mut stack, selection).unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 0);
        assert_eq!(stats[0].mean, None);
        assert_eq!(stats[0].std_dev, None);
        assert!(stats[0].percentiles[0].1.is_nan());
    }
}

#[test]
fn test_statistics_within_pixel_envelope() {
    let engine = CalcEngine::new(EngineConfig {
        block_rows: 2,
        ..Default::default()
    })
    .unwrap();
    let values: Vec<f64> = (0..16).map(|v| v as f64).collect();
    let mut stack = RasterStack::single(MemoryRaster::from_rows("grid", 4, 4, values).unwrap()).unwrap();

    // Rows 1..=2, cols 1..=2 hold 5, 6, 9, 10
    let envelope = Envelope::Pixels {
        row_min: 1,
        row_max: 2,
        col_min: 1,
        col_max: 2,
    };
    let stats = calc_image_statistics_in(&engine, &mut stack, StatsSelection::default(), Some(envelope)).unwrap();
    assert_eq!(stats[0].count, 4);
    assert_eq!(stats[0].mean, Some(7.5));
    assert_eq!(stats[0].min, Some(5.0));
    assert_eq!(stats[0].max, Some(10.0));

    let mut histogram = ImageHistogram::new(0, 0.0, 16.0, 4, NodataConfig::disabled())
        .unwrap()
        .with_envelope(envelope);
    engine.run_pixels(&mut stack, &mut histogram, None).unwrap();
    assert_eq!(histogram.counts(), &[0, 2, 2, 0]);
}

#[test]
fn test_statistics_within_map_envelope() {
    let engine = CalcEngine::new(EngineConfig::default()).unwrap();
    let gt = GeoTransform::from_gdal([1000.0, 10.0, 0.0, 2000.0, 0.0, -10.0]);
    let grid = MemoryRaster::from_rows("grid", 2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        .unwrap()
        .with_geo_transform(gt);
    let mut stack = RasterStack::single(grid).unwrap();

    // Pixel centres x 1005..1025, y 1995 and 1985; keep the two right columns of the top row
    let envelope = Envelope::Map {
        x_min: 1010.0,
        x_max: 1030.0,
        y_min: 1990.0,
        y_max: 2000.0,
    };
    let mut combined = AllBandsStatistics::new(None, NodataConfig::disabled()).with_envelope(envelope);
    engine.run_pixels(&mut stack, &mut combined, None).unwrap();
    let stats = combined.finish().unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.sum, Some(5.0));
}

#[test]
fn test_all_bands_statistics_over_selected_bands() {
    let cube = Array3::from_shape_fn((3, 2, 2), |(b, r, c)| (b * 100 + r * 2 + c) as f64);
    let engine = CalcEngine::new(EngineConfig::default()).unwrap();
    let mut stack = RasterStack::single(MemoryRaster::from_cube("cube", cube)).unwrap();

    let mut unit = AllBandsStatistics::new(Some(vec![0, 2]), NodataConfig::disabled());
    engine.run_pixels(&mut stack, &mut unit, None).unwrap();
    let stats = unit.finish().unwrap();
    assert_eq!(stats.count, 8);
    assert_eq!(stats.min, Some(0.0));
    assert_eq!(stats.max, Some(203.0));
    assert_eq!(stats.mean, Some(101.5));

    let mut outside = AllBandsStatistics::new(Some(vec![1, 3]), NodataConfig::disabled());
    let result = engine.run_pixels(&mut stack, &mut outside, None);
    assert!(matches!(result, Err(CalcError::Configuration(_))));

    let mut empty = AllBandsStatistics::new(Some(Vec::new()), NodataConfig::disabled());
    assert!(engine.run_pixels(&mut stack, &mut empty, None).is_err());
}
