use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Missing parameter: {0}")]
    MissingParameter(String),
    #[error("Parameter {key} = {value} outside [{start}, {end}] step {step}")]
    ParameterOutOfRange {
        key: String,
        value: f64,
        start: f64,
        end: f64,
        step: f64,
    },
    #[error("Invalid parameter definition: {0}")]
    InvalidParameter(String),
    #[error("Instrument {role} at {address}: {message}")]
    Instrument {
        role: String,
        address: String,
        message: String,
    },
    #[error("Sweep error: {0}")]
    Sweep(String),
}
