use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::StationError;

/// One cell of an exported result table
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
    /// Rendered as `-`
    Missing,
}

impl Cell {
    /// Interpret a cell read back from a file
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "-" {
            return Cell::Missing;
        }
        match raw.parse::<f64>() {
            Ok(value) => Cell::Number(value),
            Err(_) => Cell::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Number(v) => write!(f, "{v}"),
            Cell::Text(s) => write!(f, "{s}"),
            Cell::Missing => write!(f, "-"),
        }
    }
}

/// Header plus data rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(header: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { header, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.rows.is_empty()
    }

    /// View for a table model: leading `No` column, rows numbered from 1
    pub fn numbered(&self) -> Table {
        let mut header = Vec::with_capacity(self.header.len() + 1);
        header.push("No".to_string());
        header.extend(self.header.iter().cloned());
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut numbered = vec![Cell::Number((i + 1) as f64)];
                numbered.extend(row.iter().cloned());
                numbered
            })
            .collect();
        Table { header, rows }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), StationError> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path)?;
        // An empty record would be written as `""` and read back as one column
        if !self.header.is_empty() {
            writer.write_record(&self.header)?;
        }
        for row in &self.rows {
            writer.write_record(row.iter().map(|c| c.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Table, StationError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let header = if header.len() == 1 && header[0].is_empty() {
            Vec::new()
        } else {
            header
        };
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(Cell::parse).collect());
        }
        Ok(Table { header, rows })
    }
}

/// Spread statistics of one result column: values lie in `mean ± span` on a
/// `step` grid
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColumnSpec {
    pub span: Option<f64>,
    pub step: Option<f64>,
    pub mean: Option<f64>,
}

/// Column names and spread statistics of a result source table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    pub header: Vec<String>,
    pub columns: Vec<ColumnSpec>,
}

impl SourceTable {
    /// Read a source table.
    ///
    /// The first row names the columns after a leading label column; the
    /// next three rows hold span, step and mean for each column. Empty or
    /// `-` cells and absent rows are treated as missing.
    pub fn read(path: &Path) -> Result<Self, StationError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut records = Vec::new();
        for record in reader.records() {
            records.push(record?);
        }
        let Some(first) = records.first() else {
            return Ok(Self::default());
        };

        let header: Vec<String> = first.iter().skip(1).map(|h| h.trim().to_string()).collect();
        let value = |row: usize, col: usize| -> Option<f64> {
            records
                .get(row)
                .and_then(|r| r.get(col))
                .and_then(|raw| Cell::parse(raw).as_f64())
        };
        let columns = (1..=header.len())
            .map(|col| ColumnSpec {
                span: value(1, col),
                step: value(2, col),
                mean: value(3, col),
            })
            .collect();

        Ok(Self { header, columns })
    }
}

/// Locate the result source: the explicit file if it exists, otherwise the
/// first `.csv` file (by name) in `search_dir`
pub fn locate_source(explicit: Option<&Path>, search_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        debug!("Result source {} does not exist", path.display());
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(search_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Produces the exported row from source column statistics
pub trait RowSynthesizer: Send {
    fn synthesize(&mut self, columns: &[ColumnSpec]) -> Vec<Cell>;
}

/// Draws each cell uniformly from the `step` grid over `mean ± span`,
/// rounded to two decimals.
pub struct SpanRowSynthesizer {
    rng: StdRng,
}

impl SpanRowSynthesizer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible draws
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn cell(&mut self, column: &ColumnSpec) -> Cell {
        let (Some(span), Some(step), Some(mean)) = (column.span, column.step, column.mean) else {
            return Cell::Missing;
        };
        if span == 0.0 || step == 0.0 {
            return Cell::Number(mean);
        }
        let start = mean - span;
        let stop = mean + span;
        let slots = ((stop - start) / step).trunc();
        if slots < 0.0 {
            return Cell::Missing;
        }
        let k = self.rng.gen_range(0..=slots as u64) as f64;
        Cell::Number(round2(k * step + start))
    }
}

impl Default for SpanRowSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RowSynthesizer for SpanRowSynthesizer {
    fn synthesize(&mut self, columns: &[ColumnSpec]) -> Vec<Cell> {
        columns.iter().map(|c| self.cell(c)).collect()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build the export table from a source: its header and one synthesized row.
///
/// No source gives an empty table.
pub fn synthesize_table(
    source: Option<&Path>,
    synthesizer: &mut dyn RowSynthesizer,
) -> Result<Table, StationError> {
    let Some(path) = source else {
        info!("No result source found, export table is empty");
        return Ok(Table::default());
    };
    let source = SourceTable::read(path)?;
    if source.header.is_empty() {
        return Ok(Table::default());
    }
    let row = synthesizer.synthesize(&source.columns);
    Ok(Table::new(source.header, vec![row]))
}
