#![cfg(feature = "gdal")]

use bandcalc::core::PixelFn;
use bandcalc::io::{GdalRaster, GdalRasterWriter, OutputOptions};
use bandcalc::{CalcEngine, EngineConfig, GeoTransform, MemoryRaster, PixelInput, PixelType, RasterSource, RasterStack};
use ndarray::Array2;

#[test]
fn test_float32_geotiff_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scaled.tif");
    let gt = GeoTransform::from_gdal([500000.0, 20.0, 0.0, 4100000.0, 0.0, -20.0]);

    let input = Array2::from_shape_fn((37, 19), |(r, c)| r as f64 * 0.25 - c as f64);
    let mut stack = RasterStack::single(MemoryRaster::from_image("input", input.clone()).with_geo_transform(gt)).unwrap();
    let engine = CalcEngine::new(EngineConfig {
        block_rows: 8,
        ..Default::default()
    })
    .unwrap();

    {
        let options = OutputOptions {
            pixel_type: PixelType::Float32,
            nodata: Some(-9999.0),
            geo_transform: Some(gt),
            ..Default::default()
        };
        let mut writer = GdalRasterWriter::create(&path, 1, 37, 19, &options).unwrap();
        let mut unit = PixelFn::new("double", 1, |p: &PixelInput<'_>, out: &mut [f64]| {
            out[0] = p.values[0] * 2.0;
        });
        engine.run_pixels(&mut stack, &mut unit, Some(&mut writer)).unwrap();
    }

    let mut reopened = GdalRaster::open(&path).unwrap();
    assert_eq!(reopened.size(), (37, 19));
    assert_eq!(reopened.band_count(), 1);
    assert_eq!(reopened.nodata(), Some(-9999.0));
    assert_eq!(reopened.geo_transform(), Some(gt));

    let mut data = ndarray::Array3::<f64>::zeros((1, 37, 19));
    reopened.read_rows(0, data.view_mut()).unwrap();
    for ((r, c), &v) in input.indexed_iter() {
        assert_eq!(data[[0, r, c]], v * 2.0);
    }
}
