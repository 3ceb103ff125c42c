//! Pluggable steps of the measurement procedure: readiness check,
//! calibration passes and per-point capture.

use log::{debug, info};
use std::fmt;

use crate::cancel::CancellationToken;
use crate::error::StationError;
use crate::params::{DeviceParams, ParamSnapshot};
use crate::registry::InstrumentSet;
use crate::result::MeasuredPoint;
use crate::sweep::{CalibrationTable, SweepPoint, SweepSettings};

/// Decides whether the bench is ready to measure a device
pub trait ReadinessCheck: Send {
    fn check(
        &mut self,
        instruments: &mut InstrumentSet,
        token: &CancellationToken,
        device: &DeviceParams,
    ) -> Result<bool, StationError>;
}

/// Resets every instrument and reports ready
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetCheck;

impl ReadinessCheck for ResetCheck {
    fn check(
        &mut self,
        instruments: &mut InstrumentSet,
        _token: &CancellationToken,
        device: &DeviceParams,
    ) -> Result<bool, StationError> {
        debug!("Readiness check for {:?}", device.values);
        instruments.reset_all()?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CalibrationKind {
    /// Local oscillator path
    Lo,
    Rf,
    /// Modulation generator
    Mod,
}

impl CalibrationKind {
    pub const ALL: [CalibrationKind; 3] = [CalibrationKind::Lo, CalibrationKind::Rf, CalibrationKind::Mod];
}

impl fmt::Display for CalibrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationKind::Lo => "LO",
            CalibrationKind::Rf => "RF",
            CalibrationKind::Mod => "Mod",
        };
        write!(f, "{name}")
    }
}

/// One independent calibration pass producing a power table
pub trait CalibrationPass: Send {
    fn kind(&self) -> CalibrationKind;

    fn run(
        &mut self,
        instruments: &mut InstrumentSet,
        token: &CancellationToken,
        params: &ParamSnapshot,
    ) -> Result<CalibrationTable, StationError>;
}

/// Pass that measures nothing and yields an empty table
#[derive(Debug, Clone, Copy)]
pub struct EmptyCalibration(pub CalibrationKind);

impl CalibrationPass for EmptyCalibration {
    fn kind(&self) -> CalibrationKind {
        self.0
    }

    fn run(
        &mut self,
        _instruments: &mut InstrumentSet,
        _token: &CancellationToken,
        params: &ParamSnapshot,
    ) -> Result<CalibrationTable, StationError> {
        info!("Calibrating {} with {} parameters", self.0, params.len());
        Ok(CalibrationTable::new())
    }
}

/// The three default passes, in run order
pub fn default_calibrations() -> Vec<Box<dyn CalibrationPass>> {
    CalibrationKind::ALL
        .iter()
        .map(|kind| Box::new(EmptyCalibration(*kind)) as Box<dyn CalibrationPass>)
        .collect()
}

/// Turns a settled sweep point into a measured record
pub trait PointCapture: Send {
    /// `Ok(None)` means the point yields no record
    fn capture(
        &mut self,
        point: &SweepPoint,
        settings: &SweepSettings,
        instruments: &mut InstrumentSet,
    ) -> Result<Option<MeasuredPoint>, StationError>;
}

/// Records nothing; the sweep only drives the instruments
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl PointCapture for NoCapture {
    fn capture(
        &mut self,
        _point: &SweepPoint,
        _settings: &SweepSettings,
        _instruments: &mut InstrumentSet,
    ) -> Result<Option<MeasuredPoint>, StationError> {
        Ok(None)
    }
}

/// Records the applied settings of every point
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsCapture;

impl PointCapture for SettingsCapture {
    fn capture(
        &mut self,
        point: &SweepPoint,
        settings: &SweepSettings,
        _instruments: &mut InstrumentSet,
    ) -> Result<Option<MeasuredPoint>, StationError> {
        Ok(Some(
            MeasuredPoint::new()
                .with("u_src", settings.supply_voltage_v)
                .with("i_src_max", settings.max_current_a)
                .with("f_rf", point.rf_frequency_hz)
                .with("p_in", point.power_dbm)
                .with("timebase", point.timebase_s),
        ))
    }
}
