//! Measurement cycle for all weight channels
//!
//! ## Critical Section
//!
//! Every channel is measured under the GPIO lock:
//!
//! ```text
//! acquire lock
//!   └─ initialise chip (first use of the bus or after a failure)
//!        └─ apply current calibration and channel
//!             └─ stable estimate, refreshing the lease every round
//!                  └─ power cycle chip
//! release lock (always, the lease is dropped)
//! ```
//!
//! Compensation and unit conversion happen after the lock is released; they
//! only need the cycle's field map.
//!
//! ## Shared Chips
//!
//! Channels A and B of one HX711 use the same data and clock lines, and a
//! driver owns its pins. Handles are therefore cached per [`ChipBus`] and
//! switched between channels on demand.
//!
//! ## Failure Isolation
//!
//! [`WeightStation::measure_all`] never fails. A channel that cannot be
//! measured contributes no fields and a [`SensorOutcome::Failed`]; the other
//! channels and the fields of non-weight sensors are untouched.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::compensation::compensate;
use crate::config::{ChipBus, ChipPins, WeightSensorConfig};
use crate::errors::{WeighError, WeighResult};
use crate::estimator::{StableWeightEstimator, WeightEstimate};
use crate::fields::{grams_to_kg, FieldMap};
use crate::hx711::{initialize, ChipFactory, ChipHandle};
use crate::lock::ExclusiveAccessGuard;

/// What happened to one channel during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SensorOutcome {
    /// Fields were published; `weight_kg` is the `ts_field` value if configured
    Measured {
        /// Channel measured
        pins: ChipPins,
        /// Published weight in kilograms
        weight_kg: Option<f64>,
    },
    /// Channel skipped this cycle
    Failed {
        /// Channel skipped
        pins: ChipPins,
        /// Display form of the error
        reason: String,
    },
}

impl SensorOutcome {
    /// Channel this outcome belongs to
    pub fn pins(&self) -> ChipPins {
        match self {
            Self::Measured { pins, .. } | Self::Failed { pins, .. } => *pins,
        }
    }

    /// True if the channel published its fields
    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Measured { .. })
    }
}

/// State of one measurement cycle, owned by the caller
///
/// `fields` starts with the readings of all other sensors of the cycle and
/// collects the weight fields as channels are measured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleContext {
    /// Fields collected so far
    pub fields: FieldMap,
    /// One entry per weight channel, in measurement order
    pub outcomes: Vec<SensorOutcome>,
}

impl CycleContext {
    /// Cycle seeded with the fields of the other sensors
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            outcomes: Vec::new(),
        }
    }

    /// Fields to upload
    pub fn into_fields(self) -> FieldMap {
        self.fields
    }
}

/// Owns the chips of one HoneyPi and measures them under the GPIO lock
pub struct WeightStation<F: ChipFactory> {
    factory: F,
    guard: ExclusiveAccessGuard,
    clock: Arc<dyn Clock>,
    estimator: StableWeightEstimator,
    handles: HashMap<ChipBus, ChipHandle<F::Chip>>,
    debug: bool,
}

impl<F: ChipFactory> WeightStation<F> {
    /// Station with the default estimator on the system clock
    pub fn new(factory: F, guard: ExclusiveAccessGuard) -> Self {
        Self {
            factory,
            guard,
            clock: Arc::new(SystemClock),
            estimator: StableWeightEstimator::default(),
            handles: HashMap::new(),
            debug: false,
        }
    }

    /// Clock used for initialisation backoff
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the estimator, e.g. with shorter batches
    pub fn with_estimator(mut self, estimator: StableWeightEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Log raw samples of every batch
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Factory the chips are opened from
    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// True while a live handle for the chip behind `pins` is cached
    pub fn is_initialized(&self, pins: &ChipPins) -> bool {
        self.handles.contains_key(&pins.bus())
    }

    /// Guarded estimate for one channel, inverted if configured, without `offset2`
    pub fn measure_estimate(&mut self, config: &WeightSensorConfig) -> WeighResult<WeightEstimate> {
        let lease = self.guard.acquire()?;
        let pins = config.pins();

        let handle = match self.handles.entry(pins.bus()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(initialize(&mut self.factory, config, &*self.clock, self.debug)?),
        };
        handle.apply_calibration(config);

        let measured = self
            .estimator
            .measure_with(config, handle, |_| lease.touch().map_err(WeighError::from));
        match measured {
            Ok(estimate) => {
                if let Err(e) = handle.power_cycle() {
                    debug!("HX711 {}: power cycle after measurement failed: {}", pins, e);
                }
                lease.release()?;
                Ok(estimate)
            }
            Err(e) => {
                // Re-initialise on the next cycle; dropping the handle frees its pins
                self.handles.remove(&pins.bus());
                Err(e)
            }
        }
    }

    /// Field fragment of one channel
    ///
    /// `known` holds the fields of the other sensors of this cycle and is only
    /// read for temperature compensation.
    pub fn measure_sensor(&mut self, config: &WeightSensorConfig, known: &FieldMap) -> WeighResult<FieldMap> {
        let estimate = self.measure_estimate(config)?;
        let weight = estimate.grams - config.offset2;
        let mut fragment = FieldMap::new();

        if let Some(field) = &config.ts_field_uncompensated {
            fragment.insert(field.as_str(), grams_to_kg(weight));
        }

        let mut published = compensate(config, weight, known);
        if config.filter_negative && published < 0.0 {
            debug!("HX711 {}: negative weight {:.1} g filtered to 0", config.pins(), published);
            published = 0.0;
        }

        match &config.ts_field {
            Some(field) => fragment.insert(field.as_str(), grams_to_kg(published)),
            None => debug!("HX711 {}: no ts_field configured, weight not published", config.pins()),
        }
        if let Some(field) = &config.ts_field_offset2 {
            fragment.insert(field.as_str(), grams_to_kg(config.offset2));
        }

        Ok(fragment)
    }

    /// Measure every channel in order, merging results into `ctx`
    pub fn measure_all(&mut self, configs: &[WeightSensorConfig], ctx: &mut CycleContext) {
        for config in configs {
            let pins = config.pins();
            match self.measure_sensor(config, &ctx.fields) {
                Ok(fragment) => {
                    let weight_kg = config.ts_field.as_deref().and_then(|f| fragment.number(f));
                    ctx.fields.merge(&fragment);
                    ctx.outcomes.push(SensorOutcome::Measured { pins, weight_kg });
                }
                Err(e) => {
                    match &e {
                        WeighError::Lock(_) => error!("CRITICAL: HX711 {} skipped, GPIO lock unusable: {}", pins, e),
                        e if e.is_wiring_fault() => error!("HX711 {} skipped: {}", pins, e),
                        _ => warn!("HX711 {} skipped this cycle: {}", pins, e),
                    }
                    ctx.outcomes.push(SensorOutcome::Failed {
                        pins,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
