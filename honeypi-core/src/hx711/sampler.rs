//! Batch sampling with outlier rejection
//!
//! One batch is `count` raw conversions reduced to a single gram value:
//!
//! 1. Read `count` samples; a failed read counts as a discarded sample
//! 2. Drop samples far from the batch median (see [`reject_outliers`])
//! 3. Average the survivors and convert with the handle's calibration
//!
//! A batch that loses more than [`OUTLIER_WARN_RATIO`] of its samples is
//! still returned, with a warning pointing at the power supply or cabling.

use log::{debug, warn};

use crate::constants::weight::{OUTLIER_DISTANCE_RATIO, OUTLIER_WARN_RATIO};
use crate::errors::{WeighError, WeighResult};

use super::{ChipHandle, Hx711};

/// Reduced result of one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchReading {
    /// Calibrated mean of the kept samples
    pub grams: f64,
    /// Samples that entered the average
    pub kept: usize,
    /// Failed reads plus rejected outliers
    pub discarded: usize,
}

impl BatchReading {
    /// Fraction of the requested samples that did not make it into the mean
    pub fn discard_ratio(&self) -> f64 {
        let total = self.kept + self.discarded;
        if total == 0 {
            return 0.0;
        }
        self.discarded as f64 / total as f64
    }
}

/// Read and reduce one batch of `count` samples
pub fn read_batch<C: Hx711>(handle: &mut ChipHandle<C>, count: usize) -> WeighResult<BatchReading> {
    let mut samples = Vec::with_capacity(count);
    let mut failed = 0;

    for _ in 0..count {
        match handle.read_raw() {
            Ok(raw) => samples.push(raw as f64),
            Err(e) => {
                failed += 1;
                if handle.debug() {
                    debug!("HX711 {} read failed: {}", handle.pins(), e);
                }
            }
        }
    }

    if handle.debug() {
        debug!("HX711 {} raw batch: {:?}", handle.pins(), samples);
    }

    let kept = reject_outliers(&samples);
    if kept.is_empty() {
        return Err(WeighError::EmptyBatch { requested: count });
    }

    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    let reading = BatchReading {
        grams: handle.to_grams(mean),
        kept: kept.len(),
        discarded: failed + samples.len() - kept.len(),
    };

    if reading.discard_ratio() > OUTLIER_WARN_RATIO {
        warn!(
            "HX711 {}: {:.0}% of batch discarded ({} of {}), check power supply and wiring",
            handle.pins(),
            reading.discard_ratio() * 100.0,
            reading.discarded,
            count
        );
    }

    Ok(reading)
}

/// Keep samples whose distance to the median stays below
/// [`OUTLIER_DISTANCE_RATIO`] standard deviations of all distances
///
/// Batches of two or fewer samples, and batches without spread, are kept
/// whole.
pub fn reject_outliers(samples: &[f64]) -> Vec<f64> {
    if samples.len() <= 2 {
        return samples.to_vec();
    }

    let median = median(samples);
    let distances: Vec<f64> = samples.iter().map(|s| (s - median).abs()).collect();

    let n = distances.len() as f64;
    let mean = distances.iter().sum::<f64>() / n;
    let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let spread = variance.sqrt();

    if spread == 0.0 || !spread.is_finite() {
        return samples.to_vec();
    }

    samples
        .iter()
        .zip(&distances)
        .filter(|(_, d)| *d / spread < OUTLIER_DISTANCE_RATIO)
        .map(|(s, _)| *s)
        .collect()
}

fn median(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Channel, ChipPins, WeightSensorConfig};
    use crate::errors::ChipError;
    use crate::hx711::ScriptedChip;

    fn handle(chip: ScriptedChip, reference_unit: f64, offset: f64) -> ChipHandle<ScriptedChip> {
        let mut config = WeightSensorConfig::new(ChipPins::new(5, 6, Channel::A), reference_unit);
        config.offset = offset;
        ChipHandle::new(chip, &config, true)
    }

    #[test]
    fn spike_is_rejected() {
        let mut samples = vec![100.0; 40];
        samples.push(100_000.0);
        let kept = reject_outliers(&samples);
        assert_eq!(kept.len(), 40);
        assert!(kept.iter().all(|s| *s == 100.0));
    }

    #[test]
    fn tiny_and_flat_batches_are_kept() {
        assert_eq!(reject_outliers(&[1.0, 1000.0]), vec![1.0, 1000.0]);
        assert_eq!(reject_outliers(&[5.0, 5.0, 5.0]).len(), 3);
        assert!(reject_outliers(&[]).is_empty());
    }

    #[test]
    fn batch_is_calibrated() {
        let chip = ScriptedChip::new();
        chip.push_batch(2200, 41);
        let mut handle = handle(chip, 20.0, 200.0);

        let reading = read_batch(&mut handle, 41).unwrap();
        assert_eq!(reading.grams, 100.0);
        assert_eq!(reading.kept, 41);
        assert_eq!(reading.discard_ratio(), 0.0);
    }

    #[test]
    fn failed_reads_count_as_discarded() {
        let chip = ScriptedChip::new();
        chip.push_batch(1000, 5);
        for _ in 0..5 {
            chip.push_reading(Err(ChipError::NoData));
        }
        let mut handle = handle(chip, 1.0, 0.0);

        // Half the batch lost: warns, still returns the mean
        let reading = read_batch(&mut handle, 10).unwrap();
        assert_eq!(reading.grams, 1000.0);
        assert_eq!(reading.discarded, 5);
        assert_eq!(reading.discard_ratio(), 0.5);
    }

    #[test]
    fn all_reads_failing_is_an_empty_batch() {
        let mut handle = handle(ScriptedChip::new(), 1.0, 0.0);
        let err = read_batch(&mut handle, 41).unwrap_err();
        assert!(matches!(err, WeighError::EmptyBatch { requested: 41 }));
    }
}
