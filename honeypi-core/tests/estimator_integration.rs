//! Stable weight estimation against scripted load cells

mod common;

use common::{push_round, sensor};
use honeypi_core::constants::weight::FALLBACK_SAMPLES;
use honeypi_core::estimator::{allowed_divergence, closest_to, BatchSummary};
use honeypi_core::{ChipHandle, EstimateSource, ScriptedChip, WeighError};
use proptest::prelude::*;

#[test]
fn tolerance_scales_with_reference_unit() {
    assert_eq!(allowed_divergence(25.0), 20.0);
    assert_eq!(allowed_divergence(1.0), 500.0);
    assert_eq!(allowed_divergence(1000.0), 0.5);
}

#[test]
fn closest_to_mean_prefers_earlier_tie() {
    let summary = BatchSummary::from_scalars(&[10.0, 10.5, 9.5]).unwrap();
    assert_eq!(summary.closest, 10.0);

    // 9.0 and 11.0 are both 1.0 away from the mean 10.0
    let summary = BatchSummary::from_scalars(&[9.0, 11.0]).unwrap();
    assert_eq!(summary.closest, 9.0);
    let summary = BatchSummary::from_scalars(&[11.0, 9.0, 10.0, 10.0]).unwrap();
    assert_eq!(summary.closest, 10.0);
}

#[test]
fn persistent_divergence_ends_in_fallback() {
    let config = sensor(5, "field3");
    let chip = ScriptedChip::new();
    for _ in 0..6 {
        push_round(&chip, &[0, 0, 3000]);
    }
    chip.push_batch(1234, FALLBACK_SAMPLES);

    let mut handle = ChipHandle::new(chip.clone(), &config, false);
    let estimate = common::quick_estimator().measure(&config, &mut handle).unwrap();

    assert_eq!(estimate.source, EstimateSource::Fallback);
    assert_eq!(estimate.grams, 1234.0);
    assert_eq!(estimate.rounds, 6);
    assert_eq!(chip.pending(), 0);
}

#[test]
fn recovers_before_last_round() {
    let config = sensor(5, "field3");
    let chip = ScriptedChip::new();
    for _ in 0..5 {
        push_round(&chip, &[0, 0, 3000]);
    }
    push_round(&chip, &[2000, 2100, 2050]);

    let mut handle = ChipHandle::new(chip, &config, false);
    let estimate = common::quick_estimator().measure(&config, &mut handle).unwrap();

    assert_eq!(estimate.source, EstimateSource::Stable);
    assert_eq!(estimate.grams, 2050.0);
    assert_eq!(estimate.rounds, 6);
}

#[test]
fn tolerance_band_uses_reference_unit() {
    // reference unit 100: 500 / 100 = 5 g band
    let mut config = sensor(5, "field3");
    config.reference_unit = 100.0;
    let chip = ScriptedChip::new();
    // 1000 g, 1000 g, 1030 g in raw units
    push_round(&chip, &[100_000, 100_000, 103_000]);
    push_round(&chip, &[100_000, 100_000, 101_000]);

    let mut handle = ChipHandle::new(chip, &config, false);
    let estimate = common::quick_estimator().measure(&config, &mut handle).unwrap();

    // Round 1 diverges by 10 g; round 2 by 3.3 g and is accepted
    assert_eq!(estimate.rounds, 2);
    assert_eq!(estimate.grams, 1000.0);
}

#[test]
fn silent_chip_yields_no_reading() {
    let config = sensor(5, "field3");
    let mut handle = ChipHandle::new(ScriptedChip::new(), &config, false);

    let err = common::quick_estimator().measure(&config, &mut handle).unwrap_err();
    assert!(matches!(err, WeighError::NoStableReading { .. }));
}

#[test]
fn spiky_samples_inside_a_batch_are_filtered() {
    let config = sensor(5, "field3");
    let chip = ScriptedChip::new();
    // Batches of 3 are too small to filter, so use a full-size batch here
    let estimator = honeypi_core::StableWeightEstimator::default();
    for _ in 0..3 {
        chip.push_batch(500, 40);
        chip.push_reading(Ok(90_000));
    }

    let mut handle = ChipHandle::new(chip, &config, false);
    let estimate = estimator.measure(&config, &mut handle).unwrap();
    assert_eq!(estimate.grams, 500.0);
}

proptest! {
    #[test]
    fn closest_is_always_a_member(values in prop::collection::vec(-50_000.0f64..50_000.0, 1..10)) {
        let average = values.iter().sum::<f64>() / values.len() as f64;
        let closest = closest_to(&values, average).unwrap();
        prop_assert!(values.contains(&closest));
        for value in &values {
            prop_assert!((closest - average).abs() <= (value - average).abs());
        }
    }
}
