pub mod cancel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod instrument;
pub mod logger;
pub mod params;
pub mod procedure;
pub mod registry;
pub mod result;
pub mod sweep;
pub mod table;
pub mod types;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, Backend, CaptureMode, load_config, load_config_or_default};
pub use controller::{ControllerBuilder, MeasureOutcome, MeasurementController, PointLogEntry, PointReady};
pub use error::StationError;
pub use instrument::{
    CommandLog, ConnectionConfig, Instrument, MockInstrument, SentCommand, SocketInstrument,
};
pub use logger::Logger;
pub use params::{DeviceParams, ParamSnapshot, ParamSpec, SecondaryParams};
pub use procedure::{
    CalibrationKind, CalibrationPass, EmptyCalibration, NoCapture, PointCapture, ReadinessCheck,
    ResetCheck, SettingsCapture,
};
pub use registry::{InstrumentRegistry, InstrumentSet, resolve_addresses};
pub use result::{AdjustmentRecord, MeasureResult, MeasuredPoint, ProcessedPoint};
pub use sweep::{CalibrationTable, SweepPlan, SweepPoint, SweepSettings, SweepStep, TuneSweep};
pub use table::{Cell, RowSynthesizer, SpanRowSynthesizer, Table};
pub use types::{ControllerState, DeviceRole, InstrumentStatus};
