//! Stable Weight Estimation
//!
//! ## Overview
//!
//! Load cells on a hive see wind, bees landing on the lid and the odd insect
//! crawling over the board. A single averaged batch is therefore not trusted;
//! instead several batches are compared and the result is only accepted when
//! they agree.
//!
//! ## Algorithm
//!
//! ```text
//! for round in 1..=outer_rounds:
//!     scalars = up to `batches_per_round` batch means
//!               (+1 attempt per failed batch, capped at `max_batch_attempts`)
//!     average, min, max, closest = summarise(scalars)
//!     if |average - closest| <= round(500 / reference_unit, 1):
//!         accept closest                      // stop early
//!     elif last round:
//!         simplified single batch, no check   // fallback
//! negate if the sensor is mounted inverted
//! ```
//!
//! Taking the batch closest to the mean rather than the mean itself suppresses
//! a single spiky batch; the divergence check catches systemic instability
//! (loose cabling, brown-out) and escalates to the fallback instead of
//! silently returning a bad number.
//!
//! ## Heartbeat
//!
//! A worst-case estimate runs for minutes. [`StableWeightEstimator::measure_with`]
//! calls a heartbeat before every round and before the fallback so the caller
//! can keep its GPIO lease fresh, and aborts as soon as the heartbeat fails.

use log::{debug, warn};

use crate::config::WeightSensorConfig;
use crate::constants::weight::{
    DIVERGENCE_BASE, DIVERGENCE_DECIMALS, FALLBACK_SAMPLES, LOOP_AVG, LOOP_AVG_MAX, LOOP_TRYS,
    SAMPLES_PER_BATCH,
};
use crate::errors::{WeighError, WeighResult};
use crate::fields::round_to;
use crate::hx711::{read_batch, ChipHandle, Hx711};

/// Tolerated `|average - closest|` in grams for a given reference unit
///
/// Scaled by the reference unit so that the band stays comparable between
/// load cells of different raw resolution. The sign of the reference unit is
/// ignored; inverted cells get the same band.
pub fn allowed_divergence(reference_unit: f64) -> f64 {
    round_to(DIVERGENCE_BASE / reference_unit.abs(), DIVERGENCE_DECIMALS)
}

/// First element of `values` at minimal distance from `target`
pub fn closest_to(values: &[f64], target: f64) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for &value in values {
        let distance = (value - target).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((value, distance)),
        }
    }
    best.map(|(value, _)| value)
}

/// Reduction of one round of batch scalars
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSummary {
    /// Mean of the batch scalars
    pub average: f64,
    /// Smallest batch scalar
    pub min: f64,
    /// Largest batch scalar
    pub max: f64,
    /// Batch scalar closest to the average
    pub closest: f64,
}

impl BatchSummary {
    /// `None` for an empty round
    pub fn from_scalars(scalars: &[f64]) -> Option<Self> {
        if scalars.is_empty() {
            return None;
        }
        let average = scalars.iter().sum::<f64>() / scalars.len() as f64;
        let min = scalars.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scalars.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let closest = closest_to(scalars, average)?;
        Some(Self {
            average,
            min,
            max,
            closest,
        })
    }

    /// Distance between the average and the chosen scalar
    pub fn divergence(&self) -> f64 {
        (self.average - self.closest).abs()
    }
}

/// Retry bounds and sample counts of the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorSettings {
    /// Outer rounds before falling back
    pub outer_rounds: usize,
    /// Batches compared per round
    pub batches_per_round: usize,
    /// Cap on batch attempts per round, failed batches included
    pub max_batch_attempts: usize,
    /// Raw samples per batch
    pub samples_per_batch: usize,
    /// Raw samples of the simplified fallback measurement
    pub fallback_samples: usize,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            outer_rounds: LOOP_TRYS,
            batches_per_round: LOOP_AVG,
            max_batch_attempts: LOOP_AVG_MAX,
            samples_per_batch: SAMPLES_PER_BATCH,
            fallback_samples: FALLBACK_SAMPLES,
        }
    }
}

impl EstimatorSettings {
    /// Raw samples per batch, at least one
    pub fn with_samples_per_batch(mut self, samples: usize) -> Self {
        self.samples_per_batch = samples.max(1);
        self
    }

    /// Outer rounds before falling back, at least one
    pub fn with_outer_rounds(mut self, rounds: usize) -> Self {
        self.outer_rounds = rounds.max(1);
        self
    }
}

/// How the estimate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    /// Batches agreed within the divergence band
    Stable,
    /// Simplified measurement after the last round failed its check
    Fallback,
}

/// Estimated load in grams
///
/// `rounds` is the number of outer rounds needed, a rough confidence hint:
/// 1 is a calm hive, `outer_rounds` means the scale was restless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightEstimate {
    /// Load in grams, negated for inverted cells
    pub grams: f64,
    /// Outer rounds used
    pub rounds: usize,
    /// Stable or fallback path
    pub source: EstimateSource,
}

/// Multi-batch weight estimator with divergence check and fallback
#[derive(Debug, Clone, Default)]
pub struct StableWeightEstimator {
    settings: EstimatorSettings,
}

impl StableWeightEstimator {
    /// Estimator with the given bounds
    pub fn new(settings: EstimatorSettings) -> Self {
        Self { settings }
    }

    /// Bounds in use
    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Estimate the load on `handle`, inverted if `config` says so
    pub fn measure<C: Hx711>(
        &self,
        config: &WeightSensorConfig,
        handle: &mut ChipHandle<C>,
    ) -> WeighResult<WeightEstimate> {
        self.measure_with(config, handle, |_| Ok(()))
    }

    /// [`measure`](Self::measure) with a heartbeat
    ///
    /// `heartbeat` receives the round about to start, or `outer_rounds + 1`
    /// before the fallback. Its error is returned unchanged.
    pub fn measure_with<C: Hx711>(
        &self,
        config: &WeightSensorConfig,
        handle: &mut ChipHandle<C>,
        mut heartbeat: impl FnMut(usize) -> WeighResult<()>,
    ) -> WeighResult<WeightEstimate> {
        let tolerance = allowed_divergence(config.reference_unit);
        let rounds = self.settings.outer_rounds;

        for round in 1..=rounds {
            heartbeat(round)?;
            let scalars = self.collect_round(handle);

            match BatchSummary::from_scalars(&scalars) {
                Some(summary) if summary.divergence() <= tolerance => {
                    debug!(
                        "HX711 {}: accepted {:.1} g in round {} (avg {:.1}, min {:.1}, max {:.1})",
                        handle.pins(),
                        summary.closest,
                        round,
                        summary.average,
                        summary.min,
                        summary.max
                    );
                    return Ok(finish(config, summary.closest, round, EstimateSource::Stable));
                }
                Some(summary) => warn!(
                    "HX711 {}: batches diverge by {:.1} g (allowed {:.1}) in round {}/{}",
                    handle.pins(),
                    summary.divergence(),
                    tolerance,
                    round,
                    rounds
                ),
                None => warn!(
                    "HX711 {}: no usable batch in round {}/{}",
                    handle.pins(),
                    round,
                    rounds
                ),
            }
        }

        warn!(
            "HX711 {}: no stable weight after {} rounds, using simplified measurement",
            handle.pins(),
            rounds
        );
        heartbeat(rounds + 1)?;
        match read_batch(handle, self.settings.fallback_samples) {
            Ok(reading) => Ok(finish(config, reading.grams, rounds, EstimateSource::Fallback)),
            Err(e) => {
                warn!("HX711 {}: simplified measurement failed: {}", handle.pins(), e);
                Err(WeighError::NoStableReading { rounds })
            }
        }
    }

    fn collect_round<C: Hx711>(&self, handle: &mut ChipHandle<C>) -> Vec<f64> {
        let target = self.settings.batches_per_round;
        let cap = self.settings.max_batch_attempts.max(target);

        let mut scalars = Vec::with_capacity(target);
        let mut limit = target;
        let mut attempt = 0;

        while attempt < limit {
            attempt += 1;
            match read_batch(handle, self.settings.samples_per_batch) {
                Ok(reading) => scalars.push(reading.grams),
                Err(e) => {
                    debug!("HX711 {}: batch {} failed: {}", handle.pins(), attempt, e);
                    limit = (limit + 1).min(cap);
                }
            }
        }
        scalars
    }
}

fn finish(config: &WeightSensorConfig, grams: f64, rounds: usize, source: EstimateSource) -> WeightEstimate {
    WeightEstimate {
        grams: if config.invert { -grams } else { grams },
        rounds,
        source,
    }
}
