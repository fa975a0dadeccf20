//! Secondary zero offset (`offset2`) across maintenance windows
//!
//! ## Overview
//!
//! Opening a hive changes its weight for reasons that have nothing to do with
//! the colony: frames are swapped, a super is added, a feeder is emptied. To
//! keep the weight curve continuous, every channel is weighed when
//! maintenance starts and again when it ends. The difference, snapped to
//! [`OFFSET2_STEP`] grams, is folded into `offset2`, which the measurement
//! cycle subtracts from every estimate.
//!
//! ## Matching
//!
//! Settings may be edited while the hive is open, so snapshots are matched by
//! physical identity ([`ChipPins`]) rather than by position. A channel whose
//! `reference_unit` or `offset` changed in between was recalibrated; its
//! before/after weights are not comparable and its `offset2` is left alone.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::config::{ChipPins, WeightSensorConfig};
use crate::constants::weight::OFFSET2_STEP;
use crate::errors::WeighResult;

/// Source of uncorrected weights (grams, inverted if configured, without
/// `offset2`)
pub trait Weigher {
    /// Weigh the channel of `config`
    fn weigh(&mut self, config: &WeightSensorConfig) -> WeighResult<f64>;
}

impl<F> Weigher for F
where
    F: FnMut(&WeightSensorConfig) -> WeighResult<f64>,
{
    fn weigh(&mut self, config: &WeightSensorConfig) -> WeighResult<f64> {
        self(config)
    }
}

/// New `offset2` for a before/after pair, `None` when the change rounds to zero
pub fn compute_offset2(before: f64, after: f64, offset2_before: f64) -> Option<f64> {
    let delta = ((after - before) / OFFSET2_STEP).round() * OFFSET2_STEP;
    if delta == 0.0 {
        None
    } else {
        Some(offset2_before + delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SnapshotEntry {
    grams: f64,
    reference_unit: f64,
    offset: f64,
    offset2: f64,
}

/// Weights and calibration of every channel at maintenance start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSnapshot {
    entries: HashMap<ChipPins, SnapshotEntry>,
}

impl CalibrationSnapshot {
    /// Channels with a recorded weight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no channel could be weighed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Weight recorded for `pins`
    pub fn weight(&self, pins: &ChipPins) -> Option<f64> {
        self.entries.get(pins).map(|entry| entry.grams)
    }
}

/// Outcome for one channel at maintenance end
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationChange {
    /// `offset2` moved by a non-zero multiple of the step
    Updated {
        /// `offset2` before maintenance
        previous: f64,
        /// New `offset2`
        offset2: f64,
    },
    /// Difference rounded to zero
    Unchanged,
    /// Scale or zero offset changed during maintenance
    Recalibrated,
    /// No before or no after weight
    NotMeasured,
}

/// Result of [`CalibrationStateManager::record_after`]
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    /// Configs as they should be persisted
    pub configs: Vec<WeightSensorConfig>,
    /// One entry per config, same order
    pub changes: Vec<(ChipPins, CalibrationChange)>,
}

impl CalibrationReport {
    /// True if any `offset2` changed and the settings need writing
    pub fn changed(&self) -> bool {
        self.changes
            .iter()
            .any(|(_, change)| matches!(change, CalibrationChange::Updated { .. }))
    }

    /// Outcome recorded for `pins`
    pub fn change_for(&self, pins: &ChipPins) -> Option<CalibrationChange> {
        self.changes
            .iter()
            .find(|(p, _)| p == pins)
            .map(|(_, change)| *change)
    }
}

/// Computes `offset2` corrections from weights bracketing a maintenance window
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationStateManager;

impl CalibrationStateManager {
    /// Stateless manager; the snapshot carries the state
    pub fn new() -> Self {
        Self
    }

    /// Weigh every channel at maintenance start
    ///
    /// Channels that cannot be measured are left out and later reported as
    /// [`CalibrationChange::NotMeasured`].
    pub fn record_before<P: Weigher>(&self, weigher: &mut P, configs: &[WeightSensorConfig]) -> CalibrationSnapshot {
        let mut snapshot = CalibrationSnapshot::default();
        for config in configs {
            match weigher.weigh(config) {
                Ok(grams) => {
                    debug!("HX711 {}: {:.1} g before maintenance", config.pins(), grams);
                    snapshot.entries.insert(
                        config.pins(),
                        SnapshotEntry {
                            grams,
                            reference_unit: config.reference_unit,
                            offset: config.offset,
                            offset2: config.offset2,
                        },
                    );
                }
                Err(e) => warn!(
                    "HX711 {}: no weight before maintenance, offset2 will not be updated: {}",
                    config.pins(),
                    e
                ),
            }
        }
        snapshot
    }

    /// Weigh every channel at maintenance end and derive the new `offset2`s
    pub fn record_after<P: Weigher>(
        &self,
        weigher: &mut P,
        configs: &[WeightSensorConfig],
        snapshot: &CalibrationSnapshot,
    ) -> CalibrationReport {
        let mut report = CalibrationReport {
            configs: Vec::with_capacity(configs.len()),
            changes: Vec::with_capacity(configs.len()),
        };

        for config in configs {
            let pins = config.pins();
            let mut updated = config.clone();
            let change = self.evaluate(weigher, config, snapshot.entries.get(&pins));

            if let CalibrationChange::Updated { offset2, .. } = change {
                updated.offset2 = offset2;
            }
            report.configs.push(updated);
            report.changes.push((pins, change));
        }
        report
    }

    fn evaluate<P: Weigher>(
        &self,
        weigher: &mut P,
        config: &WeightSensorConfig,
        before: Option<&SnapshotEntry>,
    ) -> CalibrationChange {
        let pins = config.pins();
        let Some(before) = before else {
            debug!("HX711 {}: not weighed before maintenance", pins);
            return CalibrationChange::NotMeasured;
        };

        if before.reference_unit != config.reference_unit || before.offset != config.offset {
            warn!(
                "HX711 {}: reference_unit or offset changed during maintenance, offset2 not recalculated",
                pins
            );
            return CalibrationChange::Recalibrated;
        }

        let after = match weigher.weigh(config) {
            Ok(grams) => grams,
            Err(e) => {
                warn!("HX711 {}: no weight after maintenance: {}", pins, e);
                return CalibrationChange::NotMeasured;
            }
        };

        match compute_offset2(before.grams, after, before.offset2) {
            Some(offset2) => {
                info!(
                    "HX711 {}: weight changed from {:.1} g to {:.1} g during maintenance, offset2 {} -> {}",
                    pins, before.grams, after, before.offset2, offset2
                );
                CalibrationChange::Updated {
                    previous: before.offset2,
                    offset2,
                }
            }
            None => {
                info!("HX711 {}: no significant weight change during maintenance", pins);
                CalibrationChange::Unchanged
            }
        }
    }
}
