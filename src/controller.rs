use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::error::StationError;
use crate::logger::Logger;
use crate::params::{DeviceParams, ParamSnapshot, SecondaryParams};
use crate::procedure::{
    CalibrationKind, CalibrationPass, NoCapture, PointCapture, ReadinessCheck, ResetCheck,
    default_calibrations,
};
use crate::registry::InstrumentRegistry;
use crate::result::{MeasureResult, MeasuredPoint};
use crate::sweep::{CalibrationTable, SweepPlan, SweepSettings, SweepStep, TuneSweep};
use crate::types::{ControllerState, DeviceRole, InstrumentStatus};

/// Sent once per accepted measurement point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointReady;

/// How a measurement run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureOutcome {
    Completed { points: usize },
    Cancelled,
}

/// Journal line for one accepted point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointLogEntry {
    pub timestamp: DateTime<Utc>,
    pub index: usize,
    pub point: MeasuredPoint,
}

/// Builder for [`MeasurementController`]
pub struct ControllerBuilder {
    registry: InstrumentRegistry,
    params: SecondaryParams,
    devices: BTreeMap<String, DeviceParams>,
    plan: SweepPlan,
    result: Option<MeasureResult>,
    clock: Box<dyn Clock>,
    checker: Box<dyn ReadinessCheck>,
    calibrations: Vec<Box<dyn CalibrationPass>>,
    capture: Box<dyn PointCapture>,
    journal: Option<PathBuf>,
}

impl ControllerBuilder {
    pub fn new(registry: InstrumentRegistry) -> Self {
        Self {
            registry,
            params: SecondaryParams::standard(),
            devices: BTreeMap::from([(
                "receiver".to_string(),
                DeviceParams {
                    values: BTreeMap::from([("F".to_string(), 1.0)]),
                    ..Default::default()
                },
            )]),
            plan: SweepPlan::standard(),
            result: None,
            clock: Box::new(SystemClock),
            checker: Box::new(ResetCheck),
            calibrations: default_calibrations(),
            capture: Box::new(NoCapture),
            journal: None,
        }
    }

    pub fn with_params(mut self, params: SecondaryParams) -> Self {
        self.params = params;
        self
    }

    /// Register (or replace) a device under test
    pub fn with_device(mut self, name: &str, params: DeviceParams) -> Self {
        self.devices.insert(name.to_string(), params);
        self
    }

    pub fn with_plan(mut self, plan: SweepPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_result(mut self, result: MeasureResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_check(mut self, checker: Box<dyn ReadinessCheck>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_calibrations(mut self, passes: Vec<Box<dyn CalibrationPass>>) -> Self {
        self.calibrations = passes;
        self
    }

    pub fn with_capture(mut self, capture: Box<dyn PointCapture>) -> Self {
        self.capture = capture;
        self
    }

    /// Append every accepted point to a JSONL journal
    pub fn with_point_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    pub fn build(self) -> MeasurementController {
        MeasurementController {
            registry: self.registry,
            params: self.params,
            devices: self.devices,
            plan: self.plan,
            result: self
                .result
                .unwrap_or_else(|| MeasureResult::new("adjust.json")),
            clock: self.clock,
            checker: self.checker,
            calibrations: self.calibrations,
            capture: self.capture,
            calibrated: BTreeMap::new(),
            subscribers: Vec::new(),
            journal: self.journal.map(|path| Logger::new(path, 16)),
            state: ControllerState::Idle,
            found: false,
            present: false,
            has_result: false,
        }
    }
}

/// Orchestrates connect, check, calibrate and measure on the bench
pub struct MeasurementController {
    registry: InstrumentRegistry,
    params: SecondaryParams,
    devices: BTreeMap<String, DeviceParams>,
    plan: SweepPlan,
    result: MeasureResult,
    clock: Box<dyn Clock>,
    checker: Box<dyn ReadinessCheck>,
    calibrations: Vec<Box<dyn CalibrationPass>>,
    capture: Box<dyn PointCapture>,
    calibrated: BTreeMap<CalibrationKind, CalibrationTable>,
    subscribers: Vec<Sender<PointReady>>,
    journal: Option<Logger<PointLogEntry>>,
    state: ControllerState,
    found: bool,
    present: bool,
    has_result: bool,
}

impl MeasurementController {
    pub fn builder(registry: InstrumentRegistry) -> ControllerBuilder {
        ControllerBuilder::new(registry)
    }

    // ==================== Connection ====================

    /// Apply address overrides and discover all instruments.
    ///
    /// Returns whether every instrument was found; also kept in [`Self::found`].
    pub fn connect(&mut self, overrides: &HashMap<DeviceRole, String>) -> bool {
        self.state = ControllerState::Connecting;
        self.registry.configure(overrides);
        self.found = self.registry.discover_all();
        if self.found {
            info!("All instruments found");
        } else {
            warn!("Instrument discovery incomplete: {:?}", self.registry.status());
        }
        self.state = ControllerState::Idle;
        self.found
    }

    pub fn disconnect(&mut self) {
        self.registry.disconnect();
        self.found = false;
        self.present = false;
        self.state = ControllerState::Idle;
    }

    /// Reset the bench and run the readiness check for `device`
    pub fn check(&mut self, token: &CancellationToken, device: &str) -> bool {
        self.state = ControllerState::Checking;
        let device_params = self.device_params(device);
        self.present = match self
            .checker
            .check(self.registry.instruments_mut(), token, &device_params)
        {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Readiness check for '{device}' failed: {e}");
                false
            }
        };
        info!("Check for '{device}': ready = {}", self.present);
        self.state = ControllerState::Idle;
        self.present
    }

    // ==================== Calibration ====================

    /// Run every calibration pass.
    ///
    /// A failing pass is logged and leaves its previous table in place; the
    /// remaining passes still run. Returns true if all of them succeeded.
    pub fn calibrate(&mut self, token: &CancellationToken) -> bool {
        self.state = ControllerState::Calibrating;
        let snapshot = self.params.current_values();
        let mut all_ok = true;
        for pass in self.calibrations.iter_mut() {
            let kind = pass.kind();
            match pass.run(self.registry.instruments_mut(), token, &snapshot) {
                Ok(table) => {
                    info!("{kind} calibration: {} entries", table.len());
                    self.calibrated.insert(kind, table);
                }
                Err(e) => {
                    warn!("{kind} calibration failed: {e}");
                    all_ok = false;
                }
            }
        }
        self.state = ControllerState::Idle;
        all_ok
    }

    pub fn calibration(&self, kind: CalibrationKind) -> Option<&CalibrationTable> {
        self.calibrated.get(&kind)
    }

    // ==================== Measurement ====================

    /// Run the tuning sweep for `device`.
    ///
    /// Cancellation is not an error: it yields [`MeasureOutcome::Cancelled`]
    /// with no result. Any other fault shuts the bench down, clears the
    /// aggregator and is returned.
    pub fn measure(
        &mut self,
        token: &CancellationToken,
        device: &str,
    ) -> Result<MeasureOutcome, StationError> {
        self.state = ControllerState::Measuring;
        self.has_result = false;

        let snapshot = self.params.current_values();
        self.result.set_secondary_params(snapshot.clone());
        self.result.set_primary_params(self.device_params(device));
        self.result.clear();

        let outcome = self
            .run_tune(token, &snapshot)
            .and_then(|outcome| match outcome {
                MeasureOutcome::Completed { .. } => self.result.process().map(|_| outcome),
                MeasureOutcome::Cancelled => Ok(outcome),
            });

        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.flush() {
                warn!("Point journal flush failed: {e}");
            }
        }

        match &outcome {
            Ok(MeasureOutcome::Completed { points }) => {
                self.has_result = true;
                self.state = ControllerState::Idle;
                info!("Measurement complete: {points} points");
            }
            Ok(MeasureOutcome::Cancelled) => {
                self.result.clear();
                self.state = ControllerState::Cancelled;
                info!("Measurement cancelled, no result");
            }
            Err(e) => {
                self.result.clear();
                self.state = ControllerState::Idle;
                error!("Measurement failed: {e}");
            }
        }
        outcome
    }

    fn run_tune(
        &mut self,
        token: &CancellationToken,
        snapshot: &ParamSnapshot,
    ) -> Result<MeasureOutcome, StationError> {
        let settings = SweepSettings::from_snapshot(snapshot)?;
        let plan = match self.calibrated.get(&CalibrationKind::Rf) {
            Some(table) if !table.is_empty() => self.plan.clone().with_calibration(table),
            _ => self.plan.clone(),
        };

        let mut sweep = TuneSweep::new(&plan, settings);
        if let Err(e) = sweep.start(self.registry.instruments_mut()) {
            self.shutdown_after_fault(&mut sweep);
            return Err(e);
        }

        let mut accepted = 0;
        loop {
            let step = sweep.step(self.registry.instruments_mut(), token, self.clock.as_ref());
            let point = match step {
                Ok(SweepStep::Continue(point)) => point,
                Ok(SweepStep::Cancelled) => return Ok(MeasureOutcome::Cancelled),
                Ok(SweepStep::Finished) => return Ok(MeasureOutcome::Completed { points: accepted }),
                Err(e) => {
                    self.shutdown_after_fault(&mut sweep);
                    return Err(e);
                }
            };

            match self
                .capture
                .capture(&point, &settings, self.registry.instruments_mut())
            {
                Ok(Some(measured)) => {
                    self.accept_point(point.index, measured);
                    accepted += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    self.shutdown_after_fault(&mut sweep);
                    return Err(e);
                }
            }
        }
    }

    fn shutdown_after_fault(&mut self, sweep: &mut TuneSweep<'_>) {
        if let Err(e) = sweep.safe_shutdown(self.registry.instruments_mut(), self.clock.as_ref()) {
            warn!("Safe shutdown incomplete: {e}");
        }
    }

    fn accept_point(&mut self, index: usize, point: MeasuredPoint) {
        info!("Measured point {index}: {:?}", point.values());
        if let Some(journal) = self.journal.as_mut() {
            let entry = PointLogEntry {
                timestamp: Utc::now(),
                index,
                point: point.clone(),
            };
            if let Err(e) = journal.add(entry) {
                warn!("Point journal write failed: {e}");
            }
        }
        self.result.add_point(point);
        self.subscribers.retain(|tx| tx.send(PointReady).is_ok());
    }

    /// Receive one [`PointReady`] per accepted point, in order
    pub fn subscribe(&mut self) -> Receiver<PointReady> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn device_params(&self, device: &str) -> DeviceParams {
        match self.devices.get(device) {
            Some(params) => params.clone(),
            None => {
                warn!("Unknown device '{device}', using empty primary parameters");
                DeviceParams::default()
            }
        }
    }

    // ==================== Parameters ====================

    /// Replace secondary parameter values; applies to the next run
    pub fn on_secondary_changed(&mut self, values: &HashMap<String, f64>) -> Result<(), StationError> {
        self.params.set_params(values)
    }

    pub fn save_configs(&self, path: &Path) -> Result<(), StationError> {
        self.params.save_to_config(path)
    }

    // ==================== Accessors ====================

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn present(&self) -> bool {
        self.present
    }

    pub fn has_result(&self) -> bool {
        self.has_result
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn status(&self) -> Vec<(DeviceRole, InstrumentStatus)> {
        self.registry.status()
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn params(&self) -> &SecondaryParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut SecondaryParams {
        &mut self.params
    }

    pub fn result(&self) -> &MeasureResult {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut MeasureResult {
        &mut self.result
    }
}
