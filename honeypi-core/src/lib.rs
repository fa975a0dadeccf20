//! Weight acquisition core for HoneyPi
//!
//! Turns the HX711 load cells under a beehive into stable, calibrated weight
//! fields for the measurement cycle.
//!
//! Key constraints:
//! - Several HX711s share one set of GPIO lines, used by independent
//!   processes; every access is serialised through a lock file
//! - Load cells are noisy (wind, bees, insects on the board); readings are
//!   only accepted when repeated batches agree
//! - One broken sensor must never cost the other fields of a cycle
//!
//! ```no_run
//! use honeypi_core::{
//!     CycleContext, ExclusiveAccessGuard, FieldMap, LockConfig, ScriptedFactory, SettingsStore,
//!     WeightStation,
//! };
//!
//! let settings = SettingsStore::new("/var/www/html/backend/settings.json").load()?;
//! let guard = ExclusiveAccessGuard::new(LockConfig::in_dir("/home/pi/HoneyPi/rpi-scripts"));
//! let mut station = WeightStation::new(ScriptedFactory::uniform(250_000), guard);
//!
//! // Fields of the other sensors, e.g. the hive temperature used for compensation
//! let known: FieldMap = [("field1", 24.5)].into_iter().collect();
//! let mut cycle = CycleContext::new(known);
//! station.measure_all(settings.weight_sensors(), &mut cycle);
//! # Ok::<(), honeypi_core::SettingsError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod calibration;
pub mod clock;
pub mod compensation;
pub mod config;
pub mod constants;
pub mod errors;
pub mod estimator;
pub mod fields;
pub mod hx711;
pub mod lock;
pub mod maintenance;
pub mod settings;
pub mod station;

// Public API
pub use calibration::{CalibrationChange, CalibrationReport, CalibrationSnapshot, CalibrationStateManager};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Channel, ChipBus, ChipPins, WeightSensorConfig};
pub use errors::{ChipError, LockError, SettingsError, WeighError, WeighResult};
pub use estimator::{EstimateSource, EstimatorSettings, StableWeightEstimator, WeightEstimate};
pub use fields::{FieldMap, FieldValue};
pub use hx711::{ChipFactory, ChipHandle, Hx711, ScriptedChip, ScriptedFactory};
pub use lock::{ExclusiveAccessGuard, LockConfig, LockLease, NoPriorityChange, PriorityControl, Renice};
pub use maintenance::MaintenanceSession;
pub use settings::{Settings, SettingsStore};
pub use station::{CycleContext, SensorOutcome, WeightStation};

#[cfg(feature = "rpi")]
pub use hx711::{GpioChipFactory, GpioHx711};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
