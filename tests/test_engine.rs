use bandcalc::core::{PixelFn, WindowFn};
use bandcalc::units::{AngleUnit, Slope, TerrainParams};
use bandcalc::{
    CalcEngine, CalcError, EdgePolicy, EngineConfig, GeoTransform, MemoryRaster, NodataConfig, PixelInput,
    PixelType, PixelWindow, Protocol, RasterStack,
};
use ndarray::{Array2, Array3};

fn ramp(rows: usize, cols: usize) -> MemoryRaster {
    MemoryRaster::from_image("ramp", Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f64))
}

#[test]
fn test_every_pixel_visited_once_for_any_block_height() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (rows, cols) = (23, 11);

    for block_rows in [1, 4, 7, 23, 256] {
        let engine = CalcEngine::new(EngineConfig {
            block_rows,
            ..Default::default()
        })
        .unwrap();
        let mut stack = RasterStack::single(ramp(rows, cols)).unwrap();
        let mut visits = Array2::<u32>::zeros((rows, cols));
        let mut order = Vec::new();

        let mut unit = PixelFn::new("visit", 0, |input: &PixelInput<'_>, _out: &mut [f64]| {
            visits[[input.row, input.col]] += 1;
            order.push(input.values[0]);
        });
        let summary = engine.run_pixels(&mut stack, &mut unit, None).unwrap();
        drop(unit);

        assert_eq!(summary.pixels_visited, (rows * cols) as u64);
        assert_eq!(summary.total_pixels(), (rows * cols) as u64);
        assert_eq!(summary.protocol, Protocol::PerPixel);
        assert!(visits.iter().all(|&v| v == 1), "block_rows={}", block_rows);
        // Top-to-bottom, left-to-right
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(summary.finished_at >= summary.started_at);
    }
}

#[test]
fn test_multi_dataset_stack_and_int_bands() {
    let clumps = MemoryRaster::from_rows("clumps", 2, 2, vec![1.0, 2.0, 3.7, 4.0]).unwrap();
    let values = MemoryRaster::from_cube("values", Array3::from_elem((2, 2, 2), 0.5));
    let mut stack = RasterStack::new(vec![Box::new(clumps), Box::new(values)]).unwrap();
    assert_eq!(stack.band_count(), 3);
    assert_eq!(stack.dataset_count(), 2);

    let engine = CalcEngine::new(EngineConfig {
        int_bands: 1,
        ..Default::default()
    })
    .unwrap();
    let mut out = MemoryRaster::new("out", 1, 2, 2, PixelType::Float64);
    let mut unit = PixelFn::new("combine", 1, |input: &PixelInput<'_>, out: &mut [f64]| {
        assert_eq!(input.ints.len(), 1);
        assert_eq!(input.floats.len(), 2);
        out[0] = input.ints[0] as f64 + input.floats.iter().sum::<f64>();
    });
    engine.run_pixels(&mut stack, &mut unit, Some(&mut out)).unwrap();

    // 3.7 is presented to the unit as the integer 3
    assert_eq!(out.band(0)[[1, 0]], 4.0);
    assert_eq!(out.band(0)[[1, 1]], 5.0);
}

#[test]
fn test_too_many_int_bands_rejected() {
    let engine = CalcEngine::new(EngineConfig {
        int_bands: 2,
        ..Default::default()
    })
    .unwrap();
    let mut stack = RasterStack::single(ramp(2, 2)).unwrap();
    let mut unit = PixelFn::new("noop", 0, |_: &PixelInput<'_>, _: &mut [f64]| {});
    let result = engine.run_pixels(&mut stack, &mut unit, None);
    assert!(matches!(result, Err(CalcError::Configuration(_))));
}

#[test]
fn test_stack_rejects_misaligned_geotransforms() {
    let near = GeoTransform::from_gdal([0.0, 10.0, 0.0, 100.0, 0.0, -10.0]);
    let far = GeoTransform::from_gdal([5000.0, 30.0, 0.0, 9000.0, 0.0, -30.0]);

    let result = RasterStack::new(vec![
        Box::new(ramp(2, 2).with_geo_transform(near)),
        Box::new(ramp(2, 2).with_geo_transform(far)),
    ]);
    assert!(matches!(result, Err(CalcError::Dataset(_))));

    // Same size, same pixel, shifted origin
    let shifted = GeoTransform::from_gdal([10.0, 10.0, 0.0, 100.0, 0.0, -10.0]);
    let result = RasterStack::new(vec![
        Box::new(ramp(2, 2).with_geo_transform(near)),
        Box::new(ramp(2, 2).with_geo_transform(shifted)),
    ]);
    assert!(matches!(result, Err(CalcError::Dataset(_))));

    let aligned = RasterStack::new(vec![
        Box::new(ramp(2, 2)),
        Box::new(ramp(2, 2).with_geo_transform(near)),
        Box::new(ramp(2, 2).with_geo_transform(near)),
    ])
    .unwrap();
    assert_eq!(aligned.geo_transform(), Some(near));
}

#[test]
fn test_pixel_centre_coordinates() {
    let gt = GeoTransform::from_gdal([1000.0, 30.0, 0.0, 5000.0, 0.0, -30.0]);
    let mut stack = RasterStack::single(ramp(2, 3).with_geo_transform(gt)).unwrap();
    let engine = CalcEngine::new(EngineConfig::default()).unwrap();
    let mut out = MemoryRaster::new("xy", 2, 2, 3, PixelType::Float64);
    let mut unit = PixelFn::new("xy", 2, |input: &PixelInput<'_>, out: &mut [f64]| {
        out[0] = input.x;
        out[1] = input.y;
    });
    engine.run_pixels(&mut stack, &mut unit, Some(&mut out)).unwrap();

    assert_eq!(out.band(0)[[1, 2]], 1075.0);
    assert_eq!(out.band(1)[[1, 2]], 4955.0);
}

#[test]
fn test_window_output_independent_of_block_height() {
    let dem = Array2::from_shape_fn((17, 9), |(r, c)| ((r * r) as f64 * 0.3 + (c as f64 * 1.7).sin() * 5.0));
    let mut results = Vec::new();

    for block_rows in [1, 3, 17] {
        let engine = CalcEngine::new(EngineConfig {
            block_rows,
            ..Default::default()
        })
        .unwrap();
        let mut stack = RasterStack::single(MemoryRaster::from_image("dem", dem.clone())).unwrap();
        let mut out = MemoryRaster::new("slope", 1, 17, 9, PixelType::Float64);
        let mut unit = Slope::new(TerrainParams::new(0, 10.0, 10.0), AngleUnit::Degrees);
        engine.run_windows(&mut stack, &mut unit, Some(&mut out)).unwrap();
        results.push(out.into_cube());
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}

#[test]
fn test_window_edge_policies_count_and_fill() {
    let size = (5, 5);
    let run = |edge: EdgePolicy, nodata: NodataConfig| {
        let engine = CalcEngine::new(EngineConfig {
            edge_policy: edge,
            nodata,
            block_rows: 2,
            ..Default::default()
        })
        .unwrap();
        let mut stack = RasterStack::single(MemoryRaster::from_image("ones", Array2::from_elem(size, 1.0))).unwrap();
        let mut out = MemoryRaster::new("sum", 1, size.0, size.1, PixelType::Float64);
        let mut unit = WindowFn::new("sum", 1, |w: &PixelWindow, out: &mut [f64]| {
            out[0] = w.band(0).sum();
        });
        let summary = engine.run_windows(&mut stack, &mut unit, Some(&mut out)).unwrap();
        (summary, out)
    };

    let (summary, out) = run(EdgePolicy::Skip, NodataConfig::enabled(-1.0));
    assert_eq!(summary.pixels_visited, 9);
    assert_eq!(summary.pixels_edge, 16);
    assert_eq!(out.band(0)[[0, 0]], -1.0);
    assert_eq!(out.band(0)[[2, 2]], 9.0);

    let (summary, out) = run(EdgePolicy::Replicate, NodataConfig::disabled());
    assert_eq!(summary.pixels_visited, 25);
    assert!(out.band(0).iter().all(|&v| v == 9.0));

    let (_, out) = run(EdgePolicy::Fill(0.0), NodataConfig::disabled());
    assert_eq!(out.band(0)[[0, 0]], 4.0);
    assert_eq!(out.band(0)[[0, 2]], 6.0);
}

#[test]
fn test_float32_output_round_trip() {
    let values: Vec<f64> = vec![0.5, -1.25, 1024.0, 3.0e-3 as f32 as f64, -9999.0, 65536.125];
    let mut stack = RasterStack::single(MemoryRaster::from_rows("in", 2, 3, values.clone()).unwrap()).unwrap();
    let engine = CalcEngine::new(EngineConfig::default()).unwrap();
    let mut out = MemoryRaster::new("out", 1, 2, 3, PixelType::Float32);
    let mut unit = PixelFn::new("copy", 1, |input: &PixelInput<'_>, out: &mut [f64]| {
        out[0] = input.values[0];
    });
    engine.run_pixels(&mut stack, &mut unit, Some(&mut out)).unwrap();

    let read_back: Vec<f64> = out.band(0).iter().copied().collect();
    assert_eq!(read_back, values);
}
