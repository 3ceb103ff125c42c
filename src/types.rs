use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StationError;

pub const GIGA: f64 = 1_000_000_000.0;
pub const MEGA: f64 = 1_000_000.0;
pub const KILO: f64 = 1_000.0;
pub const MILLI: f64 = 1.0 / 1_000.0;
pub const MICRO: f64 = 1.0 / 1_000_000.0;
pub const NANO: f64 = 1.0 / 1_000_000_000.0;

/// Logical role of an instrument on the bench
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Oscilloscope,
    GeneratorInput,
    GeneratorReference,
    Source,
}

impl DeviceRole {
    /// Registration order; also the order of `status()` and of reset broadcasts
    pub const ALL: [DeviceRole; 4] = [
        DeviceRole::Oscilloscope,
        DeviceRole::GeneratorInput,
        DeviceRole::GeneratorReference,
        DeviceRole::Source,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DeviceRole::Oscilloscope => "oscilloscope",
            DeviceRole::GeneratorInput => "generator_input",
            DeviceRole::GeneratorReference => "generator_reference",
            DeviceRole::Source => "source",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceRole::Oscilloscope => "Oscilloscope",
            DeviceRole::GeneratorInput => "Generator-Input",
            DeviceRole::GeneratorReference => "Generator-Reference",
            DeviceRole::Source => "Source",
        }
    }

    /// Address used when nothing is configured
    pub fn default_address(&self) -> &'static str {
        match self {
            DeviceRole::Oscilloscope => "GPIB1::7::INSTR",
            DeviceRole::GeneratorInput => "GPIB1::19::INSTR",
            DeviceRole::GeneratorReference => "GPIB1::6::INSTR",
            DeviceRole::Source => "GPIB1::3::INSTR",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for DeviceRole {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "oscilloscope" | "scope" | "osc" => Ok(DeviceRole::Oscilloscope),
            "generator_input" | "gen_input" | "gen_rf" => Ok(DeviceRole::GeneratorInput),
            "generator_reference" | "gen_ref" | "generator_ref" => {
                Ok(DeviceRole::GeneratorReference)
            }
            "source" | "src" | "power_source" => Ok(DeviceRole::Source),
            _ => Err(StationError::UnknownDevice(s.to_string())),
        }
    }
}

/// Connectivity state of a single instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstrumentStatus {
    /// Discovery has not been attempted since the last address change
    #[default]
    Unknown,
    Found,
    NotFound,
}

impl InstrumentStatus {
    pub fn is_found(&self) -> bool {
        matches!(self, InstrumentStatus::Found)
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    Checking,
    Calibrating,
    Measuring,
    /// Last measurement was cancelled; left on the next operation
    Cancelled,
}
