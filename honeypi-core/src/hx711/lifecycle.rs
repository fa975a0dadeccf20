//! Chip lifecycle: bounded initialisation and pre-calibrated handles
//!
//! A freshly powered HX711 regularly answers its first reset with no data at
//! all; a miswired one never answers. Both are retried up to
//! [`INIT_ATTEMPTS`] times, the former after a short backoff. After that the
//! channel is reported unavailable for this cycle and the caller moves on.

use log::{debug, error, warn};

use crate::clock::Clock;
use crate::config::{Channel, ChipBus, ChipPins, WeightSensorConfig};
use crate::constants::timing::INIT_RETRY_BACKOFF;
use crate::constants::weight::INIT_ATTEMPTS;
use crate::errors::{ChipError, WeighError, WeighResult};

use super::{ChipFactory, Hx711};

/// Live binding to one physical HX711
///
/// Carries the channel, scale ratio and zero offset of the config it was last
/// pointed at, so every batch read through it is already in grams. Both
/// channels of a chip share one handle; switching channel costs one discarded
/// conversion.
#[derive(Debug)]
pub struct ChipHandle<C> {
    chip: C,
    bus: ChipBus,
    channel: Channel,
    /// Input the chip will convert next, `None` when unknown
    latched: Option<Channel>,
    reference_unit: f64,
    offset: f64,
    debug: bool,
}

impl<C: Hx711> ChipHandle<C> {
    /// Wrap a chip that was reset onto `config`'s channel
    pub fn new(chip: C, config: &WeightSensorConfig, debug: bool) -> Self {
        let pins = config.pins();
        Self {
            chip,
            bus: pins.bus(),
            channel: pins.channel,
            latched: Some(pins.channel),
            reference_unit: config.reference_unit,
            offset: config.offset,
            debug,
        }
    }

    /// Pins of the currently selected channel
    pub fn pins(&self) -> ChipPins {
        ChipPins::new(self.bus.data, self.bus.clock, self.channel)
    }

    /// The physical chip
    pub fn bus(&self) -> ChipBus {
        self.bus
    }

    /// Raw units per gram in use
    pub fn reference_unit(&self) -> f64 {
        self.reference_unit
    }

    /// Raw zero offset in use
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Log every raw sample at debug level
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Point the handle at `config`: channel, scale and offset
    ///
    /// Settings may change between cycles, so this runs before every
    /// measurement.
    pub fn apply_calibration(&mut self, config: &WeightSensorConfig) {
        self.channel = config.channel;
        self.reference_unit = config.reference_unit;
        self.offset = config.offset;
    }

    /// Convert a raw (averaged) reading to grams
    pub fn to_grams(&self, raw: f64) -> f64 {
        (raw - self.offset) / self.reference_unit
    }

    /// One conversion of the selected channel
    ///
    /// A conversion pending for another input, after a channel switch or a
    /// power cycle, is read and discarded first.
    pub fn read_raw(&mut self) -> Result<i32, ChipError> {
        if self.latched != Some(self.channel) {
            let stale = self.chip.read_raw(self.channel)?;
            if self.debug {
                debug!("HX711 {}: discarded {} while switching channel", self.pins(), stale);
            }
            self.latched = Some(self.channel);
        }
        self.chip.read_raw(self.channel)
    }

    /// Power down then up, which clears a chip stuck mid-conversion
    pub fn power_cycle(&mut self) -> Result<(), ChipError> {
        self.latched = None;
        self.chip.power_down()?;
        self.chip.power_up()?;
        self.latched = Some(Channel::A);
        Ok(())
    }

    /// Direct driver access
    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }
}

/// Open and reset the chip of `config`, trying up to [`INIT_ATTEMPTS`] times
///
/// The returned handle owns the chip's pins and serves both of its channels.
pub fn initialize<F: ChipFactory>(
    factory: &mut F,
    config: &WeightSensorConfig,
    clock: &dyn Clock,
    debug: bool,
) -> WeighResult<ChipHandle<F::Chip>> {
    let pins = config.pins();

    for attempt in 1..=INIT_ATTEMPTS {
        let result = factory.open(pins.bus()).and_then(|mut chip| {
            chip.reset(pins.channel)?;
            Ok(chip)
        });

        match result {
            Ok(chip) => {
                debug!("HX711 {} ready after {} attempt(s)", pins, attempt);
                return Ok(ChipHandle::new(chip, config, debug));
            }
            Err(ChipError::NoData) => {
                warn!(
                    "HX711 {} returned no data on reset (attempt {}/{}), retrying",
                    pins, attempt, INIT_ATTEMPTS
                );
                if attempt < INIT_ATTEMPTS {
                    clock.sleep(INIT_RETRY_BACKOFF);
                }
            }
            Err(e) => {
                error!(
                    "HX711 {} failed to initialise (attempt {}/{}): {} - check wiring and pin configuration",
                    pins, attempt, INIT_ATTEMPTS, e
                );
            }
        }
    }

    Err(WeighError::ChipUnavailable {
        pins,
        attempts: INIT_ATTEMPTS,
    })
}
