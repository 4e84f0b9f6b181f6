//! Calculation units built on the engine contracts

pub mod calibration;
pub mod summary;
pub mod terrain;

pub use calibration::{
    AotEntry, BandCoefficients, CalibrationLut, ElevationEntry, LutCalibration, SubtractOffsets,
    SubtractSingleOffsets,
};
pub use summary::{BandSummary, ExtremeStat, ImageDifference, StackIndexOfStat, Standardise, SummaryStat};
pub use terrain::{
    fill_dem_holes, shadow_mask, AngleUnit, Aspect, ExitanceAngle, FillDemHoles, HillShade, IncidenceAngle,
    IncidenceExitance, InfillDerivedHoles, ShadowMask, Slope, SlopeAspect, TerrainParams,
};
