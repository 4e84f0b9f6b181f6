use approx::assert_relative_eq;
use bandcalc::{calc_image_statistics, CalcEngine, CalcError, MemoryRaster, NodataMatch, RasterStack, RunConfig};
use std::io::Write;

fn two_band_stack() -> RasterStack {
    let band0 = MemoryRaster::from_rows("b0", 2, 3, vec![1.0, 2.0, 3.0, 4.0, -9999.0, 6.0]).unwrap();
    let band1 = MemoryRaster::from_rows("b1", 2, 3, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]).unwrap();
    RasterStack::new(vec![Box::new(band0), Box::new(band1)]).unwrap()
}

fn command(matching: &str) -> String {
    format!(
        r#"<command>
            <useNoData>true</useNoData>
            <noDataValue>-9999</noDataValue>
            <noDataMatch>{}</noDataMatch>
            <blockRows>1</blockRows>
            <onePass>false</onePass>
            <percentile>50</percentile>
        </command>"#,
        matching
    )
}

#[test]
fn test_statistics_run_driven_by_config_file() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(command("all").as_bytes()).unwrap();

    let config = RunConfig::from_xml_file(file.path()).unwrap();
    let engine = CalcEngine::new(config.engine_config().unwrap()).unwrap();
    let mut stack = two_band_stack();
    let stats = calc_image_statistics(&engine, &mut stack, config.statistics_selection().unwrap()).unwrap();

    // Only band 0 holds the sentinel, so the pixel still reaches band 1
    assert_eq!(stats[0].count, 5);
    assert_relative_eq!(stats[0].mean.unwrap(), 3.2, max_relative = 1e-12);
    assert_eq!(stats[0].percentiles, vec![(50.0, 3.0)]);
    assert_eq!(stats[1].count, 6);
    assert_eq!(stats[1].mean, Some(35.0));
    assert_relative_eq!(stats[1].std_dev.unwrap(), (1750.0f64 / 6.0).sqrt(), max_relative = 1e-12);
}

#[test]
fn test_any_band_nodata_match_drops_whole_pixel() {
    let config = RunConfig::from_xml_str(&command("any")).unwrap();
    let engine_config = config.engine_config().unwrap();
    assert_eq!(engine_config.nodata.matching, NodataMatch::AnyBand);

    let engine = CalcEngine::new(engine_config).unwrap();
    let mut stack = two_band_stack();
    let stats = calc_image_statistics(&engine, &mut stack, config.statistics_selection().unwrap()).unwrap();

    assert_eq!(stats[1].count, 5);
    assert_eq!(stats[1].mean, Some(32.0));
}

#[test]
fn test_invalid_run_settings_rejected() {
    let bad_window = RunConfig::from_xml_str("<command><windowSize>4</windowSize></command>").unwrap();
    assert!(matches!(bad_window.engine_config(), Err(CalcError::Configuration(_))));

    let bad_percentile = RunConfig::from_xml_str("<command><percentile>120</percentile></command>").unwrap();
    assert!(bad_percentile.statistics_selection().is_err());

    assert!(matches!(
        RunConfig::from_xml_str("<command><blockRows>many</blockRows></command>"),
        Err(CalcError::Config(_))
    ));
}
