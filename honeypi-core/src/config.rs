//! Weight sensor configuration
//!
//! One [`WeightSensorConfig`] describes one HX711 channel as stored in the
//! `sensors` array of `settings.json` (entries with `"type": 2`). The struct is
//! deserialised and validated once at load time; afterwards the pipeline reads
//! plain fields and never checks for optional keys.
//!
//! ```json
//! {
//!   "type": 2,
//!   "pin_dt": 5, "pin_sck": 6, "channel": "A",
//!   "reference_unit": 22.4, "offset": -81234,
//!   "offset2": 40, "invert": false, "filter_negative": true,
//!   "compensation": true, "compensation_value": 2.5, "compensation_temp": 18.0,
//!   "ts_field": "field3", "ts_field_temperature": "field1"
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::SettingsError;

/// HX711 input channel
///
/// Channel A is read with gain 128, channel B with gain 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Channel {
    /// Channel A, gain 128
    #[default]
    #[serde(alias = "a")]
    A,
    /// Channel B, gain 32
    #[serde(alias = "b")]
    B,
}

impl Channel {
    /// Extra PD_SCK pulses after the 24 data bits that select this channel for
    /// the next conversion
    pub fn gain_pulses(self) -> usize {
        match self {
            Self::A => 1,
            Self::B => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Physical identity of one HX711 channel
///
/// Two configs with the same pins describe the same load cell, even if the
/// rest of their settings were edited in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipPins {
    /// BCM number of the DOUT pin
    pub data: u8,
    /// BCM number of the PD_SCK pin
    pub clock: u8,
    /// Selected input channel
    pub channel: Channel,
}

impl ChipPins {
    /// Pin triple of one channel
    pub fn new(data: u8, clock: u8, channel: Channel) -> Self {
        Self { data, clock, channel }
    }

    /// The physical chip behind this channel
    pub fn bus(&self) -> ChipBus {
        ChipBus {
            data: self.data,
            clock: self.clock,
        }
    }
}

/// DOUT/PD_SCK pair of one physical HX711
///
/// Channels A and B of the same chip share it; the pins can only be claimed
/// once, so drivers are opened per bus and the channel is chosen per read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipBus {
    /// BCM number of the DOUT pin
    pub data: u8,
    /// BCM number of the PD_SCK pin
    pub clock: u8,
}

impl From<ChipPins> for ChipBus {
    fn from(pins: ChipPins) -> Self {
        pins.bus()
    }
}

impl fmt::Display for ChipBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dt={} sck={}", self.data, self.clock)
    }
}

impl fmt::Display for ChipPins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dt={} sck={} channel {}", self.data, self.clock, self.channel)
    }
}

/// Configuration of one weight channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSensorConfig {
    /// DOUT pin
    pub pin_dt: u8,
    /// PD_SCK pin
    pub pin_sck: u8,
    /// Input of the HX711, A if missing
    #[serde(default)]
    pub channel: Channel,
    /// Raw units per gram; negative for load cells mounted upside down
    pub reference_unit: f64,
    /// Raw reading of the empty scale
    #[serde(default)]
    pub offset: f64,
    /// Maintenance correction in grams, subtracted from every estimate
    #[serde(default)]
    pub offset2: f64,
    /// Negate the estimate, for cells that read negative under load
    #[serde(default, deserialize_with = "flag")]
    pub invert: bool,
    /// Publish 0 instead of negative weights
    #[serde(default, deserialize_with = "flag")]
    pub filter_negative: bool,
    /// Enable linear temperature compensation
    #[serde(default, deserialize_with = "flag")]
    pub compensation: bool,
    /// Grams per °C
    #[serde(default)]
    pub compensation_value: Option<f64>,
    /// Temperature at which the cell was calibrated (°C)
    #[serde(default)]
    pub compensation_temp: Option<f64>,
    /// Field receiving the published weight in kg
    #[serde(default, deserialize_with = "field_name")]
    pub ts_field: Option<String>,
    /// Field receiving the weight before temperature compensation
    #[serde(default, deserialize_with = "field_name")]
    pub ts_field_uncompensated: Option<String>,
    /// Field receiving `offset2` in kg
    #[serde(default, deserialize_with = "field_name")]
    pub ts_field_offset2: Option<String>,
    /// Field of a sibling sensor holding the temperature used for compensation
    #[serde(default, deserialize_with = "field_name")]
    pub ts_field_temperature: Option<String>,
}

impl WeightSensorConfig {
    /// Minimal config for a channel, everything optional left at its default
    pub fn new(pins: ChipPins, reference_unit: f64) -> Self {
        Self {
            pin_dt: pins.data,
            pin_sck: pins.clock,
            channel: pins.channel,
            reference_unit,
            offset: 0.0,
            offset2: 0.0,
            invert: false,
            filter_negative: false,
            compensation: false,
            compensation_value: None,
            compensation_temp: None,
            ts_field: None,
            ts_field_uncompensated: None,
            ts_field_offset2: None,
            ts_field_temperature: None,
        }
    }

    /// Builder-style output field
    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        self.ts_field = Some(name.into());
        self
    }

    /// Pins and channel identifying this sensor
    pub fn pins(&self) -> ChipPins {
        ChipPins::new(self.pin_dt, self.pin_sck, self.channel)
    }

    /// Load-time validation; `index` is the position in the `sensors` array
    pub fn validate(&self, index: usize) -> Result<(), SettingsError> {
        let reject = |reason: &str| SettingsError::InvalidSensor {
            index,
            reason: reason.to_string(),
        };

        if !self.reference_unit.is_finite() || self.reference_unit == 0.0 {
            return Err(reject("reference_unit must be a non-zero number"));
        }
        if !self.offset.is_finite() || !self.offset2.is_finite() {
            return Err(reject("offset and offset2 must be finite"));
        }
        if self.pin_dt == self.pin_sck {
            return Err(reject("pin_dt and pin_sck must differ"));
        }
        let constants = [self.compensation_value, self.compensation_temp];
        if constants.iter().flatten().any(|v| !v.is_finite()) {
            return Err(reject("compensation constants must be finite"));
        }
        Ok(())
    }

    /// True when compensation is enabled and fully parameterised
    pub fn compensation_constants(&self) -> Option<(f64, f64)> {
        if !self.compensation {
            return None;
        }
        Some((self.compensation_value?, self.compensation_temp?))
    }
}

/// Accept `true`/`false` as well as the `0`/`1` the web interface writes
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(f64),
        Null(()),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Number(n) => n != 0.0,
        Flag::Null(()) => false,
    })
}

/// Empty field names mean "not configured"
fn field_name<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let name = Option::<String>::deserialize(deserializer)?;
    Ok(name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_keys() {
        let config: WeightSensorConfig = serde_json::from_str(
            r#"{"pin_dt": 5, "pin_sck": 6, "reference_unit": 22.5}"#,
        )
        .unwrap();

        assert_eq!(config.channel, Channel::A);
        assert_eq!(config.offset, 0.0);
        assert_eq!(config.offset2, 0.0);
        assert!(!config.invert);
        assert!(config.ts_field.is_none());
        assert!(config.validate(0).is_ok());
    }

    #[test]
    fn numeric_flags_and_empty_fields() {
        let config: WeightSensorConfig = serde_json::from_str(
            r#"{"pin_dt": 5, "pin_sck": 6, "channel": "b", "reference_unit": -30,
                "invert": 1, "filter_negative": 0, "compensation": true,
                "ts_field": "field2", "ts_field_offset2": "  "}"#,
        )
        .unwrap();

        assert_eq!(config.channel, Channel::B);
        assert!(config.invert);
        assert!(!config.filter_negative);
        assert_eq!(config.ts_field.as_deref(), Some("field2"));
        assert!(config.ts_field_offset2.is_none());
        // Enabled but without constants: nothing to apply
        assert!(config.compensation_constants().is_none());
    }

    #[test]
    fn validation_rejects_unusable_entries() {
        let pins = ChipPins::new(5, 6, Channel::A);
        assert!(WeightSensorConfig::new(pins, 0.0).validate(0).is_err());
        assert!(WeightSensorConfig::new(pins, f64::NAN).validate(0).is_err());

        let shorted = ChipPins::new(5, 5, Channel::A);
        let err = WeightSensorConfig::new(shorted, 20.0).validate(3).unwrap_err();
        assert!(err.to_string().contains("#3"));
    }

    #[test]
    fn pins_identify_channel() {
        let config = WeightSensorConfig::new(ChipPins::new(17, 27, Channel::B), 20.0);
        assert_eq!(config.pins(), ChipPins::new(17, 27, Channel::B));
        assert_eq!(config.pins().to_string(), "dt=17 sck=27 channel B");
        assert_eq!(config.pins().bus(), ChipPins::new(17, 27, Channel::A).bus());
        assert_eq!(Channel::B.gain_pulses(), 2);
    }
}
