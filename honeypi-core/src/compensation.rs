//! Linear temperature compensation of load cell weights
//!
//! Strain gauges drift with temperature. A cell calibrated at
//! `compensation_temp` °C drifts by `compensation_value` grams per °C:
//!
//! ```text
//! weight' = weight - compensation_value * round(current - compensation_temp, 4)
//! ```
//!
//! The current temperature comes from a sibling sensor's field in the cycle's
//! field map (`ts_field_temperature`), which is why weight sensors are
//! measured after every other sensor of a cycle. Compensation never fails a
//! measurement: when anything is missing the weight passes through unchanged.

use log::{debug, warn};

use crate::config::WeightSensorConfig;
use crate::constants::weight::COMPENSATION_DELTA_DECIMALS;
use crate::fields::{round_to, FieldMap};

/// Apply temperature compensation to `weight` (grams)
pub fn compensate(config: &WeightSensorConfig, weight: f64, known: &FieldMap) -> f64 {
    if !config.compensation {
        return weight;
    }

    let Some((coefficient, calibration_temp)) = config.compensation_constants() else {
        debug!(
            "HX711 {}: compensation enabled without compensation_value/compensation_temp, skipped",
            config.pins()
        );
        return weight;
    };

    let Some(field) = config.ts_field_temperature.as_deref() else {
        warn!(
            "HX711 {}: compensation enabled but no temperature field configured",
            config.pins()
        );
        return weight;
    };

    match known.number(field) {
        Some(current) => {
            let delta = round_to(current - calibration_temp, COMPENSATION_DELTA_DECIMALS);
            let compensated = weight - coefficient * delta;
            debug!(
                "HX711 {}: {:.1} g compensated to {:.1} g at {:.2} °C",
                config.pins(),
                weight,
                compensated,
                current
            );
            compensated
        }
        None => {
            warn!(
                "HX711 {}: temperature field '{}' missing or not numeric, weight not compensated",
                config.pins(),
                field
            );
            weight
        }
    }
}
