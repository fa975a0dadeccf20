//! Raspberry Pi HX711 driver over `rppal` GPIO
//!
//! ## Protocol
//!
//! - DOUT goes low when a conversion is ready
//! - 24 PD_SCK pulses shift the value out, MSB first, two's complement
//! - 1 (channel A, gain 128) or 2 (channel B, gain 32) extra pulses select the
//!   input for the *next* conversion
//! - PD_SCK held high for more than 60µs powers the chip down; the first
//!   conversions after power up are unsettled
//! - after power up channel A with gain 128 is selected
//!
//! One [`GpioHx711`] drives both channels of a chip; the caller passes the
//! channel to latch with every read.
//!
//! PD_SCK must not stay high for more than 50µs mid-read or the chip powers
//! down, so reads run back to back without logging in between.

use std::thread;
use std::time::Instant;

use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::config::{Channel, ChipBus};
use crate::constants::timing::{HX711_POWER_DOWN_HOLD, HX711_POWER_UP_SETTLE, HX711_READY_TIMEOUT};
use crate::errors::ChipError;

use super::{ChipFactory, Hx711};

impl From<rppal::gpio::Error> for ChipError {
    fn from(e: rppal::gpio::Error) -> Self {
        ChipError::Gpio(e.to_string())
    }
}

/// Opens HX711 drivers on the Pi's GPIO header
pub struct GpioChipFactory {
    gpio: Gpio,
}

impl GpioChipFactory {
    /// Access the GPIO peripheral; fails off-Pi or without permissions
    pub fn new() -> Result<Self, ChipError> {
        Ok(Self { gpio: Gpio::new()? })
    }
}

impl ChipFactory for GpioChipFactory {
    type Chip = GpioHx711;

    fn open(&mut self, bus: ChipBus) -> Result<GpioHx711, ChipError> {
        // rppal refuses pins held by a live driver, which is the claim check
        let data = self
            .gpio
            .get(bus.data)
            .map_err(|e| ChipError::Wiring(format!("DOUT pin {}: {}", bus.data, e)))?
            .into_input();
        let clock = self
            .gpio
            .get(bus.clock)
            .map_err(|e| ChipError::Wiring(format!("PD_SCK pin {}: {}", bus.clock, e)))?
            .into_output_low();

        Ok(GpioHx711 { data, clock })
    }
}

/// Bit-banged HX711 on two GPIO lines
pub struct GpioHx711 {
    data: InputPin,
    clock: OutputPin,
}

impl GpioHx711 {
    fn wait_ready(&self) -> Result<(), ChipError> {
        let start = Instant::now();
        while self.data.is_high() {
            if start.elapsed() > HX711_READY_TIMEOUT {
                return Err(ChipError::NoData);
            }
            thread::yield_now();
        }
        Ok(())
    }

    fn pulse(&mut self) -> bool {
        self.clock.set_high();
        self.clock.set_low();
        self.data.is_high()
    }
}

impl Hx711 for GpioHx711 {
    fn reset(&mut self, next: Channel) -> Result<(), ChipError> {
        self.power_down()?;
        self.power_up()?;
        // Latches the channel/gain selection for the following conversions
        self.read_raw(next).map(|_| ())
    }

    fn read_raw(&mut self, next: Channel) -> Result<i32, ChipError> {
        self.wait_ready()?;

        let mut value: u32 = 0;
        for _ in 0..24 {
            value = (value << 1) | u32::from(self.pulse());
        }
        for _ in 0..next.gain_pulses() {
            self.pulse();
        }

        // Sign-extend 24 -> 32 bits
        Ok(((value << 8) as i32) >> 8)
    }

    fn power_down(&mut self) -> Result<(), ChipError> {
        self.clock.set_low();
        self.clock.set_high();
        thread::sleep(HX711_POWER_DOWN_HOLD);
        Ok(())
    }

    fn power_up(&mut self) -> Result<(), ChipError> {
        self.clock.set_low();
        thread::sleep(HX711_POWER_UP_SETTLE);
        Ok(())
    }
}
