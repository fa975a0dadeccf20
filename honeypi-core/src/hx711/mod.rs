//! HX711 Load Cell ADC Access
//!
//! ## Overview
//!
//! The HX711 is a 24-bit ADC with a two-wire, bit-banged interface (DOUT and
//! PD_SCK). Several HX711s on a HoneyPi share GPIO lines and every caller
//! (scheduled loop, "measure now" button, maintenance weighings) bit-bangs the same
//! pins, which is why all access goes through the [`crate::lock`] guard.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ StableWeightEstimator        │  retries, divergence check, fallback
//! ├──────────────────────────────┤
//! │ sampler::read_batch          │  N raw samples → outlier filter → grams
//! ├──────────────────────────────┤
//! │ lifecycle::ChipHandle        │  init/reset/power cycle, channel, calibration
//! ├──────────────────────────────┤
//! │ Hx711 trait                  │  GpioHx711 (rppal) or ScriptedChip
//! └──────────────────────────────┘
//! ```
//!
//! The [`Hx711`] and [`ChipFactory`] traits are the seam between the pipeline
//! and the hardware. The pipeline never talks to GPIO directly, so it runs
//! unchanged against [`simulated::ScriptedChip`] in tests and simulations.

pub mod lifecycle;
pub mod sampler;
pub mod simulated;

#[cfg(feature = "rpi")]
pub mod gpio;

pub use lifecycle::{initialize, ChipHandle};
pub use sampler::{read_batch, reject_outliers, BatchReading};
pub use simulated::{ScriptedChip, ScriptedFactory};

#[cfg(feature = "rpi")]
pub use gpio::{GpioChipFactory, GpioHx711};

use crate::config::{Channel, ChipBus};
use crate::errors::ChipError;

/// Minimal HX711 driver operations
///
/// Every conversion also selects the input of the *next* conversion, so reads
/// take the channel to latch. After power up the chip converts channel A.
pub trait Hx711 {
    /// Power cycle the chip and perform one conversion that selects `next`.
    ///
    /// Returns [`ChipError::NoData`] when the chip produces no sample.
    fn reset(&mut self, next: Channel) -> Result<(), ChipError>;

    /// Shift out the pending signed 24-bit conversion and select `next` for
    /// the following one
    fn read_raw(&mut self, next: Channel) -> Result<i32, ChipError>;

    /// Hold PD_SCK high until the chip sleeps
    fn power_down(&mut self) -> Result<(), ChipError>;

    /// Wake the chip; the first conversion afterwards is channel A
    fn power_up(&mut self) -> Result<(), ChipError>;
}

/// Creates drivers for physical chips
pub trait ChipFactory {
    /// Driver type produced by this factory
    type Chip: Hx711;

    /// Claim the pins of `bus` and return an unreset driver
    ///
    /// Pins stay claimed until the driver is dropped; opening a bus whose pins
    /// are in use fails with [`ChipError::Wiring`].
    fn open(&mut self, bus: ChipBus) -> Result<Self::Chip, ChipError>;
}
