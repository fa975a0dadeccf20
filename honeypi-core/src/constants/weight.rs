//! Weight Pipeline Parameters
//!
//! Sampling counts, retry bounds and statistical thresholds used by the
//! sampler, the stable weight estimator and the calibration manager.

// ===== ESTIMATOR RETRY BOUNDS =====

/// Outer estimator rounds before giving up on a stable result.
///
/// Each round collects `LOOP_AVG` batches and checks their divergence.
/// On the last round a failing check switches to the simplified measurement.
pub const LOOP_TRYS: usize = 6;

/// Batches collected per outer round.
pub const LOOP_AVG: usize = 3;

/// Hard cap on batch attempts per round.
///
/// Every failed batch read extends the inner loop by one attempt until this
/// cap is reached, so a round can never spin on a dead chip.
pub const LOOP_AVG_MAX: usize = 6;

// ===== SAMPLING =====

/// Raw samples averaged into one batch scalar.
///
/// At 10 SPS this is roughly four seconds of data per batch.
pub const SAMPLES_PER_BATCH: usize = 41;

/// Samples used by the simplified single-shot fallback measurement.
pub const FALLBACK_SAMPLES: usize = 5;

/// Fraction of a batch that may be rejected as outliers before warning.
///
/// Above 40% the power supply or the load cell cabling is suspect. The batch
/// is still used.
pub const OUTLIER_WARN_RATIO: f64 = 0.4;

/// Distance-to-median cut-off, in standard deviations of the distances.
pub const OUTLIER_DISTANCE_RATIO: f64 = 2.0;

// ===== TOLERANCES =====

/// Numerator of the divergence tolerance `round(DIVERGENCE_BASE / reference_unit, 1)`.
///
/// Scaling by the reference unit keeps the accepted spread comparable between
/// load cells with very different raw resolutions.
pub const DIVERGENCE_BASE: f64 = 500.0;

/// Decimals kept when rounding the divergence tolerance.
pub const DIVERGENCE_DECIMALS: i32 = 1;

/// Decimals kept when rounding the compensation temperature delta.
pub const COMPENSATION_DELTA_DECIMALS: i32 = 4;

/// Granularity of `offset2` corrections (grams).
///
/// Maintenance deltas are snapped to this step so that noise between the two
/// bracketing measurements does not creep into the stored offset.
pub const OFFSET2_STEP: f64 = 10.0;

// ===== CHIP LIFECYCLE =====

/// Initialisation attempts before a channel is declared unavailable.
pub const INIT_ATTEMPTS: usize = 3;
