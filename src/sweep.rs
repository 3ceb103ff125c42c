use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::error::StationError;
use crate::params::ParamSnapshot;
use crate::registry::InstrumentSet;
use crate::types::{DeviceRole, MEGA, MICRO, MILLI, NANO};

/// Added to every frequency label before tuning the input generator
pub const RF_OFFSET_MHZ: f64 = 1600.0;

pub const SETTLE_AFTER_TUNE: Duration = Duration::from_millis(100);
pub const SETTLE_AFTER_CAPTURE: Duration = Duration::from_millis(1300);
pub const SETTLE_ON_CANCEL: Duration = Duration::from_millis(200);

const CHANNELS: [u8; 2] = [1, 2];

/// Label -> power table produced by a calibration pass
pub type CalibrationTable = BTreeMap<String, f64>;

/// Fixed description of one tuning sweep: what is visited and in which order
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    frequencies: Vec<String>,
    frequency_mhz: Vec<f64>,
    powers: Vec<String>,
    calibrated_power: BTreeMap<String, f64>,
    timebases: Vec<f64>,
    waveform_dir: String,
}

impl SweepPlan {
    /// Build and validate a plan.
    ///
    /// Frequency labels are MHz values with `_` as decimal separator. Every
    /// power label needs a calibrated dBm entry and the timebase table needs
    /// exactly one entry per iteration.
    pub fn new(
        frequencies: Vec<String>,
        powers: Vec<String>,
        calibrated_power: BTreeMap<String, f64>,
        timebases: Vec<f64>,
    ) -> Result<Self, StationError> {
        if frequencies.is_empty() || powers.is_empty() {
            return Err(StationError::Sweep("empty frequency or power list".to_string()));
        }
        let frequency_mhz = frequencies
            .iter()
            .map(|label| parse_label(label))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(missing) = powers.iter().find(|p| !calibrated_power.contains_key(*p)) {
            return Err(StationError::Sweep(format!(
                "no calibrated power for level '{missing}'"
            )));
        }
        let iterations = frequencies.len() * powers.len();
        if timebases.len() != iterations {
            return Err(StationError::Sweep(format!(
                "timebase table has {} entries, sweep has {} iterations",
                timebases.len(),
                iterations
            )));
        }

        Ok(Self {
            frequencies,
            frequency_mhz,
            powers,
            calibrated_power,
            timebases,
            waveform_dir: String::new(),
        })
    }

    /// The bench's VCO tuning sweep: 7 frequencies x 3 levels
    pub fn standard() -> Self {
        let frequencies = ["0_5", "1", "2", "5", "10", "20", "50"];
        let powers = ["1", "1_25", "1_5"];
        let calibrated = [("1", -104.0), ("1_25", -102.0), ("1_5", -104.0)];
        let per_frequency = [
            2.5 * 2.0 * MICRO,
            2.5 * 2.0 * MICRO,
            1.0 * 2.0 * MICRO,
            500.0 * 2.0 * NANO,
            // 10 MHz switches timebase after its first level
            500.0 * 2.0 * NANO,
            100.0 * 2.0 * NANO,
            50.0 * 2.0 * NANO,
        ];
        let mut timebases: Vec<f64> = per_frequency.iter().flat_map(|t| [*t; 3]).collect();
        timebases[13] = 250.0 * 2.0 * NANO;
        timebases[14] = 250.0 * 2.0 * NANO;

        Self {
            frequency_mhz: frequencies
                .iter()
                .map(|f| f.replace('_', ".").parse().unwrap_or_default())
                .collect(),
            frequencies: frequencies.iter().map(|f| f.to_string()).collect(),
            powers: powers.iter().map(|p| p.to_string()).collect(),
            calibrated_power: calibrated
                .iter()
                .map(|(label, dbm)| (label.to_string(), *dbm))
                .collect(),
            timebases,
            waveform_dir: r"C:\Users\Administrator\Documents\waveforms".to_string(),
        }
    }

    /// Directory (on the scope) holding the reference waveform files
    pub fn with_waveform_dir(mut self, dir: &str) -> Self {
        self.waveform_dir = dir.to_string();
        self
    }

    /// Replace calibrated levels with entries from a calibration table.
    ///
    /// Labels not in the plan are ignored.
    pub fn with_calibration(mut self, table: &CalibrationTable) -> Self {
        for (label, dbm) in table {
            if let Some(entry) = self.calibrated_power.get_mut(label) {
                *entry = *dbm;
            }
        }
        self
    }

    pub fn frequencies(&self) -> &[String] {
        &self.frequencies
    }

    pub fn powers(&self) -> &[String] {
        &self.powers
    }

    pub fn timebases(&self) -> &[f64] {
        &self.timebases
    }

    /// Total iterations (frequencies x powers)
    pub fn len(&self) -> usize {
        self.frequencies.len() * self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point at global `index`, row-major (frequency outer, power inner)
    pub fn point(&self, index: usize) -> Option<SweepPoint> {
        if index >= self.len() {
            return None;
        }
        let frequency = index / self.powers.len();
        let power = index % self.powers.len();
        let power_label = &self.powers[power];
        Some(SweepPoint {
            index,
            frequency_label: self.frequencies[frequency].clone(),
            power_label: power_label.clone(),
            rf_frequency_hz: absolute_rf_hz(self.frequency_mhz[frequency]),
            power_dbm: self.calibrated_power.get(power_label).copied().unwrap_or_default(),
            timebase_s: self.timebases[index],
        })
    }

    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.len()).filter_map(|i| self.point(i))
    }

    fn waveform_path(&self, point: &SweepPoint, channel: u8) -> String {
        let file = format!(
            "{}M{}V{}ch.csv",
            point.frequency_label, point.power_label, channel
        );
        if self.waveform_dir.is_empty() {
            file
        } else {
            format!("{}\\{}", self.waveform_dir.trim_end_matches('\\'), file)
        }
    }
}

fn parse_label(label: &str) -> Result<f64, StationError> {
    label
        .replace('_', ".")
        .parse::<f64>()
        .map_err(|_| StationError::Sweep(format!("frequency label '{label}' is not a number")))
}

fn absolute_rf_hz(frequency_mhz: f64) -> f64 {
    (frequency_mhz + RF_OFFSET_MHZ) * MEGA
}

/// One iteration of the sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    /// Global iteration counter, never reset between frequencies
    pub index: usize,
    pub frequency_label: String,
    pub power_label: String,
    pub rf_frequency_hz: f64,
    /// Level from the calibration table, not the raw label
    pub power_dbm: f64,
    pub timebase_s: f64,
}

/// Reference generator and source settings for one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    pub ref_frequency_hz: f64,
    pub ref_power_dbm: f64,
    pub supply_voltage_v: f64,
    pub max_current_a: f64,
}

impl SweepSettings {
    pub fn from_snapshot(params: &ParamSnapshot) -> Result<Self, StationError> {
        Ok(Self {
            ref_frequency_hz: params.get("ref_f")? * MEGA,
            ref_power_dbm: params.get("ref_p")?,
            supply_voltage_v: params.get("src_u")?,
            max_current_a: params.get("src_i_max")? * MILLI,
        })
    }
}

/// Result of advancing the sweep by one iteration
#[derive(Debug, Clone, PartialEq)]
pub enum SweepStep {
    /// Point configured on the instruments and settled
    Continue(SweepPoint),
    /// Cancellation tripped; instruments are in the safe state
    Cancelled,
    /// All points done and the completion phase ran
    Finished,
}

/// Step-wise tuning sweep over a [`SweepPlan`]
pub struct TuneSweep<'a> {
    plan: &'a SweepPlan,
    settings: SweepSettings,
    next: usize,
    started: bool,
    done: bool,
}

impl<'a> TuneSweep<'a> {
    pub fn new(plan: &'a SweepPlan, settings: SweepSettings) -> Self {
        Self {
            plan,
            settings,
            next: 0,
            started: false,
            done: false,
        }
    }

    /// Index of the next point to be visited
    pub fn position(&self) -> usize {
        self.next
    }

    /// Reset phase: bring every instrument into the sweep's base state
    pub fn start(&mut self, instruments: &mut InstrumentSet) -> Result<(), StationError> {
        let s = self.settings;
        info!(
            "Starting tune sweep: {} points, ref {} Hz @ {} dBm, supply {} V / {} A",
            self.plan.len(),
            s.ref_frequency_hz,
            s.ref_power_dbm,
            s.supply_voltage_v,
            s.max_current_a
        );

        instruments.send(DeviceRole::Oscilloscope, "*RST")?;
        instruments.send(DeviceRole::GeneratorReference, "*RST")?;
        instruments.send(DeviceRole::GeneratorInput, "*RST")?;
        instruments.send(DeviceRole::Source, "*RST")?;

        instruments.send(
            DeviceRole::Source,
            &format!("APPLY P6V,{}V,{}A", s.supply_voltage_v, s.max_current_a),
        )?;

        instruments.send(DeviceRole::GeneratorReference, &format!("SOUR:POW {}dbm", s.ref_power_dbm))?;
        instruments.send(DeviceRole::GeneratorReference, &format!("SOUR:FREQ {}", s.ref_frequency_hz))?;
        instruments.send(DeviceRole::GeneratorReference, "OUTP:STAT ON")?;

        blank_channels(instruments)?;
        instruments.send(DeviceRole::Source, "OUTP ON")?;

        self.started = true;
        Ok(())
    }

    /// Advance by one inner iteration.
    ///
    /// The cancellation flag is checked before anything of the iteration is
    /// applied; a new frequency is tuned before that check, once per outer
    /// iteration.
    pub fn step(
        &mut self,
        instruments: &mut InstrumentSet,
        token: &CancellationToken,
        clock: &dyn Clock,
    ) -> Result<SweepStep, StationError> {
        if self.done {
            return Ok(SweepStep::Finished);
        }
        if !self.started {
            return Err(StationError::Sweep("step() before start()".to_string()));
        }

        let Some(point) = self.plan.point(self.next) else {
            self.finish(instruments)?;
            return Ok(SweepStep::Finished);
        };

        if self.next % self.plan.powers.len() == 0 {
            debug!("Tuning input generator to {} Hz", point.rf_frequency_hz);
            instruments.send(DeviceRole::GeneratorInput, &format!("SOUR:FREQ {}", point.rf_frequency_hz))?;
        }

        if token.is_cancelled() {
            warn!("Measurement cancelled before point {}", point.index);
            self.safe_shutdown(instruments, clock)?;
            self.done = true;
            return Ok(SweepStep::Cancelled);
        }

        instruments.send(DeviceRole::Oscilloscope, &format!(":TIMEBASE:RANGE {}s", point.timebase_s))?;
        self.next += 1;
        for channel in CHANNELS {
            instruments.send(DeviceRole::Oscilloscope, &format!(":CHAN{channel}:SCALE 1V"))?;
        }

        instruments.send(DeviceRole::GeneratorInput, &format!("SOUR:POW {}dbm", point.power_dbm))?;
        instruments.send(DeviceRole::GeneratorReference, "OUTP:STAT ON")?;
        clock.settle(SETTLE_AFTER_TUNE);

        for channel in CHANNELS {
            let path = self.plan.waveform_path(&point, channel);
            instruments.send(DeviceRole::Oscilloscope, &format!(":WMEMory{channel}:LOAD \"{path}\""))?;
            instruments.send(DeviceRole::Oscilloscope, &format!(":WMEMory{channel}:YOFFset 0"))?;
            instruments.send(DeviceRole::Oscilloscope, &format!(":WMEMory{channel}:YRANge 2V"))?;
        }
        clock.settle(SETTLE_AFTER_CAPTURE);

        debug!(
            "Point {}: {} MHz / level {} ({} dBm), timebase {} s",
            point.index, point.frequency_label, point.power_label, point.power_dbm, point.timebase_s
        );
        Ok(SweepStep::Continue(point))
    }

    /// Outputs off, first sweep values restored, scope reset and blanked
    pub fn safe_shutdown(
        &mut self,
        instruments: &mut InstrumentSet,
        clock: &dyn Clock,
    ) -> Result<(), StationError> {
        instruments.send(DeviceRole::Source, "OUTP OFF")?;
        instruments.send(DeviceRole::GeneratorInput, "OUTP:STAT OFF")?;
        clock.settle(SETTLE_ON_CANCEL);

        if let Some(first) = self.plan.point(0) {
            instruments.send(DeviceRole::GeneratorInput, &format!("SOUR:POW {}dbm", first.power_dbm))?;
            instruments.send(DeviceRole::GeneratorInput, &format!("SOUR:FREQ {}", first.rf_frequency_hz))?;
        }

        instruments.send(DeviceRole::Oscilloscope, "*RST")?;
        blank_channels(instruments)
    }

    fn finish(&mut self, instruments: &mut InstrumentSet) -> Result<(), StationError> {
        instruments.send(DeviceRole::Source, "OUTP OFF")?;
        instruments.send(DeviceRole::Oscilloscope, "*RST")?;
        blank_channels(instruments)?;
        self.done = true;
        info!("Tune sweep finished after {} points", self.next);
        Ok(())
    }
}

fn blank_channels(instruments: &mut InstrumentSet) -> Result<(), StationError> {
    for channel in CHANNELS {
        instruments.send(DeviceRole::Oscilloscope, &format!(":CHAN{channel}:DISP OFF"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::instrument::CommandLog;
    use crate::params::SecondaryParams;
    use crate::registry::InstrumentRegistry;

    fn example_plan() -> SweepPlan {
        SweepPlan::new(
            vec!["10".to_string(), "20".to_string()],
            vec!["a".to_string(), "b".to_string()],
            BTreeMap::from([("a".to_string(), -100.0), ("b".to_string(), -90.0)]),
            vec![1e-6, 2e-6, 3e-6, 4e-6],
        )
        .unwrap()
    }

    fn settings() -> SweepSettings {
        SweepSettings::from_snapshot(&SecondaryParams::standard().current_values()).unwrap()
    }

    fn run_to_end(
        plan: &SweepPlan,
        registry: &mut InstrumentRegistry,
        token: &CancellationToken,
        clock: &ManualClock,
    ) -> Vec<SweepStep> {
        let mut sweep = TuneSweep::new(plan, settings());
        sweep.start(registry.instruments_mut()).unwrap();
        let mut steps = Vec::new();
        loop {
            let step = sweep.step(registry.instruments_mut(), token, clock).unwrap();
            let stop = !matches!(step, SweepStep::Continue(_));
            steps.push(step);
            if stop {
                return steps;
            }
        }
    }

    #[test]
    fn test_plan_validation() {
        let tables = BTreeMap::from([("a".to_string(), -100.0)]);
        assert!(SweepPlan::new(vec!["10".into()], vec!["a".into()], tables.clone(), vec![]).is_err());
        assert!(SweepPlan::new(vec!["x".into()], vec!["a".into()], tables.clone(), vec![1.0]).is_err());
        assert!(SweepPlan::new(vec!["10".into()], vec!["b".into()], tables.clone(), vec![1.0]).is_err());
        assert!(SweepPlan::new(vec![], vec!["a".into()], tables.clone(), vec![]).is_err());
        assert!(SweepPlan::new(vec!["0_5".into()], vec!["a".into()], tables, vec![1.0]).is_ok());
    }

    #[test]
    fn test_standard_plan_is_consistent() {
        let plan = SweepPlan::standard();
        assert_eq!(plan.len(), 21);
        assert_eq!(plan.timebases().len(), plan.len());

        let first = plan.point(0).unwrap();
        assert!((first.rf_frequency_hz - 1600.5e6).abs() < 1e-3);
        assert_eq!(first.power_dbm, -104.0);
        assert!((plan.point(13).unwrap().timebase_s - 500e-9).abs() < 1e-15);
        assert!((plan.point(12).unwrap().timebase_s - 1000e-9).abs() < 1e-15);

        let rebuilt = SweepPlan::new(
            plan.frequencies().to_vec(),
            plan.powers().to_vec(),
            plan.calibrated_power.clone(),
            plan.timebases().to_vec(),
        );
        assert!(rebuilt.is_ok());
    }

    #[test]
    fn test_points_are_row_major() {
        let plan = example_plan();
        let order: Vec<(String, String, usize)> = plan
            .points()
            .map(|p| (p.frequency_label, p.power_label, p.index))
            .collect();
        assert_eq!(
            order,
            vec![
                ("10".to_string(), "a".to_string(), 0),
                ("10".to_string(), "b".to_string(), 1),
                ("20".to_string(), "a".to_string(), 2),
                ("20".to_string(), "b".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_example_sweep_commands() {
        let plan = example_plan();
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        let clock = ManualClock::new();

        let steps = run_to_end(&plan, &mut registry, &CancellationToken::new(), &clock);
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[4], SweepStep::Finished);

        let gen_input = log.commands_for(DeviceRole::GeneratorInput);
        let tunes: Vec<&String> = gen_input.iter().filter(|c| c.starts_with("SOUR:FREQ")).collect();
        assert_eq!(tunes, vec!["SOUR:FREQ 1610000000", "SOUR:FREQ 1620000000"]);

        let levels: Vec<&String> = gen_input.iter().filter(|c| c.starts_with("SOUR:POW")).collect();
        assert_eq!(
            levels,
            vec!["SOUR:POW -100dbm", "SOUR:POW -90dbm", "SOUR:POW -100dbm", "SOUR:POW -90dbm"]
        );

        let timebases: Vec<String> = log
            .commands_for(DeviceRole::Oscilloscope)
            .into_iter()
            .filter(|c| c.starts_with(":TIMEBASE:RANGE"))
            .collect();
        let expected: Vec<String> = plan
            .timebases()
            .iter()
            .map(|t| format!(":TIMEBASE:RANGE {t}s"))
            .collect();
        assert_eq!(timebases, expected);

        let ref_tunes = log
            .commands_for(DeviceRole::GeneratorReference)
            .into_iter()
            .filter(|c| c.starts_with("SOUR:FREQ"))
            .count();
        assert_eq!(ref_tunes, 1);

        assert_eq!(clock.requested().len(), 8);
    }

    #[test]
    fn test_reset_phase_order() {
        let plan = example_plan();
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        TuneSweep::new(&plan, settings())
            .start(registry.instruments_mut())
            .unwrap();

        let entries = log.entries();
        let resets: Vec<DeviceRole> = entries.iter().take(4).map(|c| c.role).collect();
        assert_eq!(
            resets,
            vec![
                DeviceRole::Oscilloscope,
                DeviceRole::GeneratorReference,
                DeviceRole::GeneratorInput,
                DeviceRole::Source
            ]
        );
        assert_eq!(entries[4].command, "APPLY P6V,3.3V,0.06A");
        assert_eq!(entries.last().unwrap().command, "OUTP ON");
        assert_eq!(entries.last().unwrap().role, DeviceRole::Source);
    }

    #[test]
    fn test_completion_phase() {
        let plan = example_plan();
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        run_to_end(&plan, &mut registry, &CancellationToken::new(), &ManualClock::new());

        let tail: Vec<(DeviceRole, String)> = log
            .entries()
            .into_iter()
            .rev()
            .take(4)
            .rev()
            .map(|c| (c.role, c.command))
            .collect();
        assert_eq!(
            tail,
            vec![
                (DeviceRole::Source, "OUTP OFF".to_string()),
                (DeviceRole::Oscilloscope, "*RST".to_string()),
                (DeviceRole::Oscilloscope, ":CHAN1:DISP OFF".to_string()),
                (DeviceRole::Oscilloscope, ":CHAN2:DISP OFF".to_string()),
            ]
        );
    }

    #[test]
    fn test_cancel_before_first_point() {
        let plan = example_plan();
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        let token = CancellationToken::new();
        token.cancel();
        let clock = ManualClock::new();

        let steps = run_to_end(&plan, &mut registry, &token, &clock);
        assert_eq!(steps, vec![SweepStep::Cancelled]);

        let tail: Vec<(DeviceRole, String)> = log
            .entries()
            .into_iter()
            .rev()
            .take(7)
            .rev()
            .map(|c| (c.role, c.command))
            .collect();
        assert_eq!(
            tail,
            vec![
                (DeviceRole::Source, "OUTP OFF".to_string()),
                (DeviceRole::GeneratorInput, "OUTP:STAT OFF".to_string()),
                (DeviceRole::GeneratorInput, "SOUR:POW -100dbm".to_string()),
                (DeviceRole::GeneratorInput, "SOUR:FREQ 1610000000".to_string()),
                (DeviceRole::Oscilloscope, "*RST".to_string()),
                (DeviceRole::Oscilloscope, ":CHAN1:DISP OFF".to_string()),
                (DeviceRole::Oscilloscope, ":CHAN2:DISP OFF".to_string()),
            ]
        );
        assert!(
            !log.commands_for(DeviceRole::Oscilloscope)
                .iter()
                .any(|c| c.starts_with(":TIMEBASE"))
        );
        assert_eq!(clock.requested(), vec![SETTLE_ON_CANCEL]);
    }

    #[test]
    fn test_cancel_mid_sweep_stops_at_checkpoint() {
        let plan = example_plan();
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        let token = CancellationToken::new();
        let clock = ManualClock::new();

        let mut sweep = TuneSweep::new(&plan, settings());
        sweep.start(registry.instruments_mut()).unwrap();
        assert!(matches!(
            sweep.step(registry.instruments_mut(), &token, &clock).unwrap(),
            SweepStep::Continue(_)
        ));
        token.cancel();
        assert_eq!(
            sweep.step(registry.instruments_mut(), &token, &clock).unwrap(),
            SweepStep::Cancelled
        );
        assert_eq!(sweep.position(), 1);
        assert_eq!(
            sweep.step(registry.instruments_mut(), &token, &clock).unwrap(),
            SweepStep::Finished
        );

        let timebase_count = log
            .commands_for(DeviceRole::Oscilloscope)
            .iter()
            .filter(|c| c.starts_with(":TIMEBASE"))
            .count();
        assert_eq!(timebase_count, 1);
    }

    #[test]
    fn test_step_before_start_is_error() {
        let plan = example_plan();
        let mut registry = InstrumentRegistry::mock(CommandLog::new());
        let mut sweep = TuneSweep::new(&plan, settings());
        let result = sweep.step(registry.instruments_mut(), &CancellationToken::new(), &ManualClock::new());
        assert!(matches!(result, Err(StationError::Sweep(_))));
    }

    #[test]
    fn test_waveform_names() {
        let plan = example_plan().with_waveform_dir(r"D:\waves\");
        let point = plan.point(3).unwrap();
        assert_eq!(plan.waveform_path(&point, 2), r"D:\waves\20MbV2ch.csv");
        assert_eq!(example_plan().waveform_path(&point, 1), "20MbV1ch.csv");
    }

    #[test]
    fn test_with_calibration_overrides_known_levels() {
        let table = CalibrationTable::from([("a".to_string(), -95.5), ("zz".to_string(), 0.0)]);
        let plan = example_plan().with_calibration(&table);
        assert_eq!(plan.point(0).unwrap().power_dbm, -95.5);
        assert_eq!(plan.point(1).unwrap().power_dbm, -90.0);
        assert_eq!(plan.powers().len(), 2);
    }
}
