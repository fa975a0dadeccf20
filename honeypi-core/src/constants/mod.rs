//! Constants for HoneyPi Core
//!
//! Every numeric knob of the weight pipeline lives here, grouped by domain:
//! - **Weight**: sampling counts, retry bounds and tolerances of the estimator
//! - **Timing**: lock staleness, polling intervals and hardware settling delays
//!
//! Values mirror what the HoneyPi field deployments have run with for years;
//! change them only together with a field test on real hives.

/// Sampling, retry and calibration parameters for HX711 load cells.
pub mod weight;

/// Lock, polling and hardware settling durations.
pub mod timing;

pub use weight::{
    LOOP_TRYS, LOOP_AVG, LOOP_AVG_MAX, SAMPLES_PER_BATCH, FALLBACK_SAMPLES,
    DIVERGENCE_BASE, OUTLIER_WARN_RATIO, INIT_ATTEMPTS,
};

pub use timing::{
    LOCK_STALE_AFTER, LOCK_POLL_INTERVAL, INIT_RETRY_BACKOFF,
    MAINTENANCE_MAX_DURATION, MAINTENANCE_POLL_INTERVAL,
};
