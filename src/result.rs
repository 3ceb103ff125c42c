use chrono::Local;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::StationError;
use crate::params::{DeviceParams, ParamSnapshot};
use crate::table::{RowSynthesizer, SpanRowSynthesizer, Table, locate_source, synthesize_table};

/// Raw record captured at one sweep point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPoint(BTreeMap<String, f64>);

impl MeasuredPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

/// Manual correction for one processed point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub u_src: Option<f64>,
    pub f_tune: f64,
    pub p_out: f64,
    pub i_src: f64,
}

/// Fields of a raw point the aggregator recognizes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub u_src: Option<f64>,
}

/// A raw point after projection, with the adjustment entry at its index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedPoint {
    pub u_src: Option<f64>,
    pub adjustment: Option<AdjustmentRecord>,
}

/// Accumulates the points of one measurement run and shapes the export
pub struct MeasureResult {
    device: String,
    measurement: String,
    primary: DeviceParams,
    secondary: ParamSnapshot,
    raw: Vec<MeasuredPoint>,
    report: Report,
    processed: Vec<ProcessedPoint>,
    adjustment: Option<Vec<AdjustmentRecord>>,
    template_path: PathBuf,
    source_dir: PathBuf,
    synthesizer: Box<dyn RowSynthesizer>,
    table: Table,
    ready: bool,
}

impl MeasureResult {
    /// Aggregator for the VCO tune measurement.
    ///
    /// An adjustment table already present at `template_path` is loaded.
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        let template_path = template_path.into();
        let adjustment = load_adjustment(&template_path);
        Self {
            device: "vco".to_string(),
            measurement: "tune".to_string(),
            primary: DeviceParams::default(),
            secondary: ParamSnapshot::default(),
            raw: Vec::new(),
            report: Report::default(),
            processed: Vec::new(),
            adjustment,
            template_path,
            source_dir: PathBuf::from("."),
            synthesizer: Box::new(SpanRowSynthesizer::new()),
            table: Table::default(),
            ready: false,
        }
    }

    /// Directory searched for a result source when none is configured
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Box<dyn RowSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn set_primary_params(&mut self, params: DeviceParams) {
        self.primary = params;
    }

    pub fn set_secondary_params(&mut self, params: ParamSnapshot) {
        self.secondary = params;
    }

    pub fn primary_params(&self) -> &DeviceParams {
        &self.primary
    }

    pub fn secondary_params(&self) -> &ParamSnapshot {
        &self.secondary
    }

    /// Drop all points and reload the adjustment table.
    ///
    /// The device's own table is used when it names one, the template otherwise.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.report = Report::default();
        self.processed.clear();
        self.table = Table::default();
        let source = self.primary.adjustment.as_deref().unwrap_or(self.template_path.as_path());
        self.adjustment = load_adjustment(source);
        self.ready = false;
    }

    pub fn add_point(&mut self, point: MeasuredPoint) {
        self.process_point(&point);
        self.raw.push(point);
    }

    fn process_point(&mut self, point: &MeasuredPoint) {
        let index = self.processed.len();
        let adjustment = self
            .adjustment
            .as_ref()
            .and_then(|table| table.get(index))
            .cloned();
        if adjustment.is_some() {
            debug!("Adjustment available for point {index}");
        }

        let u_src = point.get("u_src");
        if u_src.is_none() {
            debug!("Point {index} has no supply voltage");
        }
        self.report = Report { u_src };
        self.processed.push(ProcessedPoint { u_src, adjustment });
    }

    /// Finalize the run and build the export table
    pub fn process(&mut self) -> Result<(), StationError> {
        self.ready = true;
        let source = locate_source(self.primary.result_source.as_deref(), &self.source_dir);
        self.table = synthesize_table(source.as_deref(), self.synthesizer.as_mut())?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn raw(&self) -> &[MeasuredPoint] {
        &self.raw
    }

    pub fn processed(&self) -> &[ProcessedPoint] {
        &self.processed
    }

    pub fn adjustment(&self) -> Option<&[AdjustmentRecord]> {
        self.adjustment.as_deref()
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    /// Write a zero-valued adjustment table, one record per processed point.
    ///
    /// Does nothing while a non-empty adjustment table is loaded. Returns
    /// whether a file was written.
    pub fn save_adjustment_template(&mut self) -> Result<bool, StationError> {
        if self.adjustment.is_some() {
            debug!("Adjustment table present, template not written");
            return Ok(false);
        }
        let template: Vec<AdjustmentRecord> = self
            .processed
            .iter()
            .map(|p| AdjustmentRecord {
                u_src: p.u_src,
                ..Default::default()
            })
            .collect();
        if let Some(parent) = self.template_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.template_path, serde_json::to_string_pretty(&template)?)?;
        info!(
            "Saved adjustment template with {} records to {}",
            template.len(),
            self.template_path.display()
        );
        self.adjustment = (!template.is_empty()).then_some(template);
        Ok(true)
    }

    /// Text summary of the latest point
    pub fn report(&self) -> String {
        let u_src = self
            .report
            .u_src
            .map(|u| u.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("Supply:\nU, V={u_src}\n")
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Header and rows for a table model
    pub fn table_data(&self) -> (Vec<String>, Vec<Vec<String>>) {
        let rows = self
            .table
            .rows
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect();
        (self.table.header.clone(), rows)
    }

    /// Write the table to `<dir>/<device>_<measurement>_<timestamp>.csv`
    pub fn export(&self, dir: &Path) -> Result<PathBuf, StationError> {
        std::fs::create_dir_all(dir)?;
        let file_name = format!(
            "{}_{}_{}.csv",
            self.device,
            self.measurement,
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );
        let path = dir.join(file_name);
        self.table.write_csv(&path)?;
        info!("Exported {} rows to {}", self.table.rows.len(), path.display());
        Ok(path)
    }
}

/// Read an adjustment table; an absent, empty or unreadable file means none
fn load_adjustment(path: &Path) -> Option<Vec<AdjustmentRecord>> {
    if !path.is_file() {
        return None;
    }
    let loaded = std::fs::read_to_string(path)
        .map_err(StationError::from)
        .and_then(|content| serde_json::from_str::<Vec<AdjustmentRecord>>(&content).map_err(StationError::from));
    match loaded {
        Ok(table) if table.is_empty() => None,
        Ok(table) => Some(table),
        Err(e) => {
            warn!("Ignoring adjustment table {}: {}", path.display(), e);
            None
        }
    }
}
