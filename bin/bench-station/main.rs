use chrono::Utc;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use std::{collections::HashMap, fs, path::PathBuf};

use bench_station::{
    AppConfig, Backend, CancellationToken, CaptureMode, CommandLog, InstrumentRegistry,
    MeasureOutcome, MeasureResult, MeasurementController, NoCapture, PointCapture,
    SecondaryParams, SettingsCapture, SweepPlan, load_config_or_default,
};

/// VCO tuning bench station
#[derive(Parser, Debug)]
#[command(name = "bench-station")]
#[command(about = "Sequenced measurements on a VCO tuning bench", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device under test
    #[arg(short, long, default_value = "receiver")]
    device: String,

    /// Secondary parameter override, e.g. `--param src_u=3.1` (persisted)
    #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, f64)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Discover instruments and print their status
    Find,
    /// Reset the bench and check readiness
    Check,
    /// Run every calibration pass
    Calibrate,
    /// Run the tune sweep and export the result table
    Measure,
    /// Run the tune sweep and write the adjustment template only
    Template,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, &args);

    let token = setup_shutdown_handler()?;
    let mut controller = setup_controller(&config)?;

    if !args.params.is_empty() {
        let values: HashMap<String, f64> = args.params.iter().cloned().collect();
        controller.on_secondary_changed(&values)?;
        controller.save_configs(&config.files.params_file)?;
    }

    let found = controller.connect(&config.addresses()?);
    print_status(&controller);
    if args.command == Command::Find {
        return Ok(());
    }
    if !found {
        return Err("not all instruments were found".into());
    }

    match args.command {
        Command::Find => Ok(()),
        Command::Check => {
            if controller.check(&token, &args.device) {
                info!("✓ Bench ready for '{}'", args.device);
                Ok(())
            } else {
                Err(format!("bench not ready for '{}'", args.device).into())
            }
        }
        Command::Calibrate => {
            if controller.calibrate(&token) {
                info!("✓ Calibration complete");
                Ok(())
            } else {
                Err("calibration incomplete".into())
            }
        }
        Command::Measure | Command::Template => {
            if !controller.check(&token, &args.device) {
                return Err(format!("bench not ready for '{}'", args.device).into());
            }
            run_and_report(&mut controller, &token, &config, &args)
        }
    }
}

/// Run the measurement and write its artifacts
fn run_and_report(
    controller: &mut MeasurementController,
    token: &CancellationToken,
    config: &AppConfig,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting measurement of '{}'...", args.device);

    match controller.measure(token, &args.device) {
        Ok(MeasureOutcome::Completed { points }) => {
            info!("✓ Measurement completed: {} points", points);
        }
        Ok(MeasureOutcome::Cancelled) => {
            info!("✓ Measurement stopped by user");
            return Ok(());
        }
        Err(e) => {
            error!("✗ Measurement failed: {}", e);
            return Err(e.into());
        }
    }

    print!("{}", controller.result().report());

    if controller.result_mut().save_adjustment_template()? {
        info!(
            "Adjustment template written to {}",
            controller.result().template_path().display()
        );
    }

    if args.command == Command::Measure {
        let (header, rows) = controller.result().table_data();
        if header.is_empty() {
            warn!("No result source found, exported table is empty");
        } else {
            println!("{}", header.join("\t"));
            for row in rows {
                println!("{}", row.join("\t"));
            }
        }
        let path = controller.result().export(&config.files.export_dir)?;
        info!("Exported result to {}", path.display());
    }

    Ok(())
}

fn setup_controller(
    config: &AppConfig,
) -> Result<MeasurementController, Box<dyn std::error::Error>> {
    let registry = match config.instruments.backend {
        Backend::Mock => InstrumentRegistry::mock(CommandLog::new()),
        Backend::Socket => InstrumentRegistry::socket(&config.addresses()?),
    };

    let mut params = SecondaryParams::standard();
    params.load_from_config(&config.files.params_file)?;
    for key in params.out_of_policy() {
        warn!("Parameter '{}' rejected from {}", key, config.files.params_file.display());
    }

    let mut plan = SweepPlan::standard();
    if let Some(ref dir) = config.sweep.waveform_dir {
        plan = plan.with_waveform_dir(dir);
    }

    let capture: Box<dyn PointCapture> = match config.sweep.capture {
        CaptureMode::None => Box::new(NoCapture),
        CaptureMode::Settings => Box::new(SettingsCapture),
    };

    let result = MeasureResult::new(&config.files.adjustment_template)
        .with_source_dir(&config.files.result_source_dir);

    let mut builder = MeasurementController::builder(registry)
        .with_clock(config.instruments.backend.clock())
        .with_params(params)
        .with_plan(plan)
        .with_result(result)
        .with_capture(capture);
    for (name, device) in &config.devices {
        builder = builder.with_device(name, device.clone());
    }
    if config.journal.enabled {
        builder = builder.with_point_journal(create_journal_path(&config.journal.output_path)?);
    }

    Ok(builder.build())
}

fn print_status(controller: &MeasurementController) {
    for (role, status) in controller.status() {
        println!("{:<20} {:?}", role.display_name(), status);
    }
}

/// Setup Ctrl+C handler; a running sweep stops at its next point
fn setup_shutdown_handler() -> Result<CancellationToken, ctrlc::Error> {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - cancelling measurement...");
        handler_token.cancel();
    })?;

    Ok(token)
}

fn log_startup_info(config: &AppConfig, args: &Args) {
    info!("=== Bench Station ===");
    match args.config {
        Some(ref path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Backend: {:?}", config.instruments.backend);
    info!("Device: {}", args.device);
    info!("Parameters: {}", config.files.params_file.display());
}

fn parse_param(raw: &str) -> Result<(String, f64), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{key}': {e}"))?;
    Ok((key.trim().to_string(), value))
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_journal_path(output_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dir = PathBuf::from(output_path);
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("points_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"))))
}
