//! Timing Constants
//!
//! Durations for the cross-process GPIO lock, hardware settling and the
//! maintenance watchdog.

use std::time::Duration;

// ===== GPIO LOCK =====

/// Age after which a lock file is considered abandoned.
///
/// A full stabilised measurement of one channel takes well under a minute,
/// so a two minute old lock can only belong to a crashed or killed process.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(120);

/// Interval between checks while another process holds the lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ===== CHIP LIFECYCLE =====

/// Backoff after a reset that produced no data.
pub const INIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Time DOUT may stay high before a read is given up.
///
/// The HX711 delivers 10 samples per second, so 100ms covers one period.
pub const HX711_READY_TIMEOUT: Duration = Duration::from_millis(100);

/// PD_SCK high time that puts the HX711 into power down (datasheet: >60µs).
pub const HX711_POWER_DOWN_HOLD: Duration = Duration::from_micros(100);

/// Settling time after power up before the first conversion is trusted.
pub const HX711_POWER_UP_SETTLE: Duration = Duration::from_millis(400);

// ===== MAINTENANCE =====

/// Maximum maintenance session length before the watchdog ends it.
pub const MAINTENANCE_MAX_DURATION: Duration = Duration::from_secs(4800);

/// Interval at which a maintenance session checks its stop flag.
pub const MAINTENANCE_POLL_INTERVAL: Duration = Duration::from_secs(1);
