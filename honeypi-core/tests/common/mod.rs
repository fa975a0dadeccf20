//! Shared fixtures for the weight pipeline integration tests
//!
//! - Scripted chips fed with whole batches
//! - Stations on a temporary lock directory and a manual clock
//! - Settings documents written to temporary files

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use honeypi_core::{
    Channel, ChipPins, EstimatorSettings, ExclusiveAccessGuard, LockConfig, ManualClock, ScriptedChip,
    ScriptedFactory, SettingsStore, StableWeightEstimator, WeightSensorConfig, WeightStation,
};

/// Raw samples per batch in tests; small to keep scripts short
pub const SAMPLES: usize = 3;

pub fn pins(data: u8) -> ChipPins {
    ChipPins::new(data, data + 1, Channel::A)
}

/// Weight channel with reference unit 1, so raw units are grams
pub fn sensor(data: u8, field: &str) -> WeightSensorConfig {
    WeightSensorConfig::new(pins(data), 1.0).with_field(field)
}

pub fn quick_estimator() -> StableWeightEstimator {
    StableWeightEstimator::new(EstimatorSettings::default().with_samples_per_batch(SAMPLES))
}

/// Queue one round of batches, one batch per value
pub fn push_round(chip: &ScriptedChip, batch_values: &[i32]) {
    for value in batch_values {
        chip.push_batch(*value, SAMPLES);
    }
}

pub fn station(factory: ScriptedFactory, lock_dir: &Path) -> WeightStation<ScriptedFactory> {
    station_with_clock(factory, lock_dir, Arc::new(ManualClock::starting_now()))
}

pub fn station_with_clock(
    factory: ScriptedFactory,
    lock_dir: &Path,
    clock: Arc<ManualClock>,
) -> WeightStation<ScriptedFactory> {
    WeightStation::new(factory, ExclusiveAccessGuard::new(LockConfig::in_dir(lock_dir)))
        .with_clock(clock)
        .with_estimator(quick_estimator())
}

/// Write `json` as `settings.json` inside `dir`
pub fn settings_file(dir: &Path, json: &str) -> SettingsStore {
    let path = dir.join("settings.json");
    std::fs::write(&path, json).unwrap();
    SettingsStore::new(path)
}
