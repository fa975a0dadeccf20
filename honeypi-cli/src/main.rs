//! `honeypi` - run HoneyPi weight measurements and maintenance sessions
//!
//! ```text
//! honeypi measure --fields '{"field1": 24.5}' --csv-dir /home/pi/HoneyPi/rpi-scripts
//! honeypi maintenance            # press Enter when the hive is closed again
//! honeypi measure --simulate 250000 --settings ./settings.json --lock /tmp/.isActive
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{info, LevelFilter};

use honeypi_connectors::{publish_all, FieldSink, OfflineCsvSink};
use honeypi_core::settings::DEFAULT_SETTINGS_PATH;
use honeypi_core::{
    CalibrationChange, ChipFactory, CycleContext, ExclusiveAccessGuard, FieldMap, LockConfig, MaintenanceSession,
    NoPriorityChange, PriorityControl, Renice, ScriptedFactory, SettingsStore, WeightStation,
};

/// Folder of the HoneyPi scripts; holds the GPIO lock and offline CSV files
const DEFAULT_SCRIPTS_DIR: &str = "/home/pi/HoneyPi/rpi-scripts";

#[derive(Parser)]
#[command(name = "honeypi", version, about = "HoneyPi load cell measurement")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure every weight sensor once and print the field map as JSON
    Measure(MeasureArgs),
    /// Weigh before and after working on the hive and update offset2
    Maintenance(MaintenanceArgs),
}

#[derive(Args)]
struct StationArgs {
    /// settings.json written by the web interface
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// GPIO lock file shared with the other HoneyPi processes
    #[arg(long)]
    lock: Option<PathBuf>,

    /// Use simulated chips that always read this raw value
    #[arg(long, allow_negative_numbers = true)]
    simulate: Option<i32>,

    /// Do not renice the process while holding the lock
    #[arg(long)]
    no_renice: bool,

    /// Log every raw HX711 sample
    #[arg(long)]
    debug: bool,
}

#[derive(Args)]
struct MeasureArgs {
    #[command(flatten)]
    station: StationArgs,

    /// Fields already measured this cycle, as a JSON object
    #[arg(long)]
    fields: Option<String>,

    /// Append the result to offline-<channel>.csv in this folder
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Channel id for the CSV file name (default: ts_channel_id from settings)
    #[arg(long, requires = "csv_dir")]
    channel: Option<String>,
}

#[derive(Args)]
struct MaintenanceArgs {
    #[command(flatten)]
    station: StationArgs,

    /// End the session automatically after this many seconds
    #[arg(long)]
    max_seconds: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    match cli.command {
        Command::Measure(args) => match args.station.simulate {
            Some(raw) => measure(ScriptedFactory::uniform(raw), &args),
            None => measure(hardware_factory()?, &args),
        },
        Command::Maintenance(args) => match args.station.simulate {
            Some(raw) => maintenance(ScriptedFactory::uniform(raw), &args),
            None => maintenance(hardware_factory()?, &args),
        },
    }
}

#[cfg(feature = "rpi")]
fn hardware_factory() -> Result<honeypi_core::GpioChipFactory> {
    honeypi_core::GpioChipFactory::new().context("GPIO not accessible")
}

#[cfg(not(feature = "rpi"))]
fn hardware_factory() -> Result<ScriptedFactory> {
    bail!("built without the `rpi` feature, only --simulate is available")
}

fn station<F: ChipFactory>(factory: F, args: &StationArgs) -> WeightStation<F> {
    let lock = match &args.lock {
        Some(path) => LockConfig::new(path),
        None => LockConfig::in_dir(DEFAULT_SCRIPTS_DIR),
    };
    let priority: Arc<dyn PriorityControl> = if args.no_renice {
        Arc::new(NoPriorityChange)
    } else {
        Arc::new(Renice::new(true))
    };
    let guard = ExclusiveAccessGuard::new(lock).with_priority(priority);
    WeightStation::new(factory, guard).with_debug(args.debug)
}

fn measure<F: ChipFactory>(factory: F, args: &MeasureArgs) -> Result<()> {
    let store = SettingsStore::new(&args.station.settings);
    let settings = store
        .load()
        .with_context(|| format!("loading {}", store.path().display()))?;

    let known = match &args.fields {
        Some(json) => FieldMap::from_json(json).context("--fields must be a JSON object of numbers and strings")?,
        None => FieldMap::new(),
    };

    let mut station = station(factory, &args.station);
    let mut cycle = CycleContext::new(known);
    station.measure_all(settings.weight_sensors(), &mut cycle);

    let measured = cycle.outcomes.iter().filter(|o| o.is_measured()).count();
    info!("{} of {} weight sensor(s) measured", measured, cycle.outcomes.len());

    if let Some(dir) = &args.csv_dir {
        let Some(channel) = args.channel.clone().or_else(|| settings.channel_id()) else {
            bail!("no --channel given and settings have no ts_channel_id");
        };
        let mut csv = OfflineCsvSink::new(dir, &channel);
        let mut sinks: Vec<&mut dyn FieldSink> = vec![&mut csv];
        publish_all(&mut sinks, &cycle.fields);
    }

    println!("{}", serde_json::to_string_pretty(&cycle.fields)?);
    Ok(())
}

fn maintenance<F: ChipFactory>(factory: F, args: &MaintenanceArgs) -> Result<()> {
    let store = SettingsStore::new(&args.station.settings);
    let mut session = MaintenanceSession::new(store);
    if let Some(seconds) = args.max_seconds {
        session = session.with_max_duration(Duration::from_secs(seconds));
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut line = String::new();
            // EOF or error ends the session as well
            let _ = std::io::stdin().lock().read_line(&mut line);
            stop.store(true, Ordering::SeqCst);
        });
    }
    eprintln!("Maintenance running, press Enter when done.");

    let mut station = station(factory, &args.station);
    let report = session.run(&mut station, &stop).context("maintenance session failed")?;

    for (pins, change) in &report.changes {
        match change {
            CalibrationChange::Updated { previous, offset2 } => {
                println!("{}: offset2 {} -> {}", pins, previous, offset2)
            }
            CalibrationChange::Unchanged => println!("{}: no significant change", pins),
            CalibrationChange::Recalibrated => println!("{}: recalibrated, offset2 kept", pins),
            CalibrationChange::NotMeasured => println!("{}: not measured", pins),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulate_accepts_negative_raw_values() {
        let cli = Cli::try_parse_from(["honeypi", "measure", "--simulate", "-1200", "--lock", "/tmp/.isActive"]).unwrap();
        let Command::Measure(args) = cli.command else {
            panic!("expected measure");
        };
        assert_eq!(args.station.simulate, Some(-1200));
        assert_eq!(args.station.settings, PathBuf::from(DEFAULT_SETTINGS_PATH));
    }

    #[test]
    fn channel_requires_csv_dir() {
        assert!(Cli::try_parse_from(["honeypi", "measure", "--channel", "42"]).is_err());
    }
}
