//! Error Types for Weight Acquisition Failures
//!
//! ## Design Philosophy
//!
//! A HoneyPi measurement cycle polls many sensors, and one broken load cell
//! must never cost the beekeeper the temperature or humidity readings of the
//! same cycle. Every stage of the weight pipeline therefore returns an explicit
//! error value instead of panicking, and the measurement cycle turns each error
//! into a missing field plus a log line.
//!
//! ## Error Categories
//!
//! ### Transient Hardware Faults
//! - `ChipError::NoData`: the HX711 did not signal "data ready" in time
//! - `WeighError::EmptyBatch`: every sample of a batch failed or was rejected
//!
//! These are retried locally (bounded) and only surface once retries run out.
//!
//! ### Wiring / Configuration Faults
//! - `WeighError::ChipUnavailable`: three initialisation attempts failed
//! - `SettingsError::InvalidSensor`: a weight entry in `settings.json` is unusable
//!
//! ### Resource Contention
//! - `LockError`: the GPIO lock file could not be created, a stale one
//!   could not be removed, or a lease was lost to a takeover
//!
//! ### Instability
//! - `WeighError::NoStableReading`: the estimator and its fallback both failed
//!
//! ## Error Handling Strategy
//!
//! ```rust
//! use honeypi_core::WeighError;
//!
//! fn report(result: Result<f64, WeighError>) -> Option<f64> {
//!     match result {
//!         Ok(grams) => Some(grams),
//!         Err(WeighError::Lock(e)) => {
//!             log::error!("CRITICAL: GPIO lock unusable: {}", e);
//!             None
//!         }
//!         Err(e) => {
//!             log::error!("weight sensor skipped this cycle: {}", e);
//!             None
//!         }
//!     }
//! }
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ChipPins;

/// Result type for weight pipeline operations
pub type WeighResult<T> = Result<T, WeighError>;

/// Faults reported by an HX711 driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChipError {
    /// Chip never pulled DOUT low, or a reset produced no samples
    #[error("no data from HX711 (chip not ready)")]
    NoData,

    /// Pins could not be claimed or the chip answered nonsense
    #[error("wiring or configuration problem: {0}")]
    Wiring(String),

    /// Low level GPIO access failed
    #[error("GPIO error: {0}")]
    Gpio(String),
}

/// Faults of the file based GPIO lock
#[derive(Error, Debug)]
pub enum LockError {
    /// A lock older than the staleness window exists but cannot be deleted
    #[error("stale lock {path} could not be removed: {source}")]
    StaleLockUnremovable {
        /// Lock file location
        path: PathBuf,
        /// Underlying filesystem error
        source: io::Error,
    },

    /// The lock file no longer holds our token; another process took over
    #[error("lock {path} was taken over by another process")]
    Lost {
        /// Lock file location
        path: PathBuf,
    },

    /// Creating or inspecting the lock file failed
    #[error("lock file {path}: {source}")]
    Io {
        /// Lock file location
        path: PathBuf,
        /// Underlying filesystem error
        source: io::Error,
    },
}

/// Faults while loading or persisting `settings.json`
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Reading or writing the document failed
    #[error("settings file {path}: {source}")]
    Io {
        /// Settings file location
        path: PathBuf,
        /// Underlying filesystem error
        source: io::Error,
    },

    /// The document is not valid JSON
    #[error("settings are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A weight sensor entry fails load-time validation
    #[error("weight sensor #{index} rejected: {reason}")]
    InvalidSensor {
        /// Position in the `sensors` array
        index: usize,
        /// Human readable cause
        reason: String,
    },
}

/// Errors of the weight acquisition pipeline
#[derive(Error, Debug)]
pub enum WeighError {
    /// Chip could not be initialised within the attempt bound
    #[error("HX711 on {pins} unavailable after {attempts} initialisation attempts")]
    ChipUnavailable {
        /// Pins of the failing channel
        pins: ChipPins,
        /// Attempts made
        attempts: usize,
    },

    /// Driver fault that was not recovered locally
    #[error("HX711 fault: {0}")]
    Chip(#[from] ChipError),

    /// Batch had no usable samples
    #[error("batch of {requested} samples produced no usable data")]
    EmptyBatch {
        /// Samples requested for the batch
        requested: usize,
    },

    /// Neither the stable estimate nor the fallback produced a value
    #[error("no stable weight after {rounds} rounds and fallback")]
    NoStableReading {
        /// Outer rounds attempted
        rounds: usize,
    },

    /// GPIO lock could not be taken
    #[error("GPIO lock: {0}")]
    Lock(#[from] LockError),

    /// Settings could not be loaded or stored
    #[error("settings: {0}")]
    Settings(#[from] SettingsError),
}

impl WeighError {
    /// True for faults that point at cabling or configuration rather than noise
    pub fn is_wiring_fault(&self) -> bool {
        matches!(
            self,
            Self::ChipUnavailable { .. } | Self::Chip(ChipError::Wiring(_)) | Self::Chip(ChipError::Gpio(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Channel;

    #[test]
    fn wiring_faults_are_classified() {
        let pins = ChipPins::new(5, 6, Channel::A);
        assert!(WeighError::ChipUnavailable { pins, attempts: 3 }.is_wiring_fault());
        assert!(WeighError::Chip(ChipError::Wiring("dt floating".into())).is_wiring_fault());
        assert!(!WeighError::Chip(ChipError::NoData).is_wiring_fault());
        assert!(!WeighError::NoStableReading { rounds: 6 }.is_wiring_fault());
    }

    #[test]
    fn messages_name_the_channel() {
        let pins = ChipPins::new(5, 6, Channel::B);
        let msg = WeighError::ChipUnavailable { pins, attempts: 3 }.to_string();
        assert!(msg.contains("dt=5"));
        assert!(msg.contains("channel B"));
    }
}
