//! `settings.json` access
//!
//! The settings document belongs to the web interface and carries far more
//! than weight sensors (Wi-Fi, uploads, WittyPi schedules, every other sensor
//! type). This module only interprets HX711 entries of the `sensors` array
//! (`"type": 2`) and keeps the rest of the document verbatim, so writing back
//! a changed `offset2` never loses keys it does not know about.
//!
//! Invalid weight entries are logged and skipped at load time; the remaining
//! sensors still load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, error};
use serde_json::Value;

use crate::config::WeightSensorConfig;
use crate::errors::SettingsError;

/// Where the web interface stores the settings on a HoneyPi
pub const DEFAULT_SETTINGS_PATH: &str = "/var/www/html/backend/settings.json";

/// `type` of HX711 entries in the `sensors` array
pub const WEIGHT_SENSOR_TYPE: u64 = 2;

/// Parsed settings document
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    document: Value,
    weight_sensors: Vec<WeightSensorConfig>,
}

impl Settings {
    /// Parse a document and validate its weight sensors
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let document: Value = serde_json::from_str(json)?;
        let mut weight_sensors = Vec::new();

        let entries = document
            .get("sensors")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (index, entry) in entries.iter().enumerate() {
            if !is_weight_entry(entry) {
                continue;
            }
            let parsed = WeightSensorConfig::deserialize_entry(entry)
                .map_err(|e| SettingsError::InvalidSensor {
                    index,
                    reason: e.to_string(),
                })
                .and_then(|config| config.validate(index).map(|()| config));

            match parsed {
                Ok(config) => weight_sensors.push(config),
                Err(e) => error!("{}; sensor skipped", e),
            }
        }

        debug!("settings list {} weight sensor(s)", weight_sensors.len());
        Ok(Self {
            document,
            weight_sensors,
        })
    }

    /// Valid HX711 channels in document order
    pub fn weight_sensors(&self) -> &[WeightSensorConfig] {
        &self.weight_sensors
    }

    /// Raw document, including everything this crate does not interpret
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// ThingSpeak channel id, used to name the offline CSV file
    pub fn channel_id(&self) -> Option<String> {
        match self.document.get("ts_channel_id")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Copy `offset2` of `configs` into the matching document entries
    ///
    /// Entries are matched by pins and channel. Returns how many entries
    /// changed.
    pub fn apply_offset2(&mut self, configs: &[WeightSensorConfig]) -> usize {
        let Some(entries) = self.document.get_mut("sensors").and_then(Value::as_array_mut) else {
            return 0;
        };

        let mut changed = 0;
        for entry in entries.iter_mut().filter(|e| is_weight_entry(e)) {
            let Ok(current) = WeightSensorConfig::deserialize_entry(entry) else {
                continue;
            };
            let Some(update) = configs.iter().find(|c| c.pins() == current.pins()) else {
                continue;
            };
            if current.offset2 == update.offset2 {
                continue;
            }
            if let Some(object) = entry.as_object_mut() {
                object.insert("offset2".to_string(), Value::from(update.offset2));
                changed += 1;
            }
        }

        for config in &mut self.weight_sensors {
            if let Some(update) = configs.iter().find(|c| c.pins() == config.pins()) {
                config.offset2 = update.offset2;
            }
        }
        changed
    }

    /// Document with all changes applied, keys in their original order
    pub fn to_json_pretty(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(&self.document)?)
    }
}

impl WeightSensorConfig {
    fn deserialize_entry(entry: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(entry.clone())
    }
}

fn is_weight_entry(entry: &Value) -> bool {
    entry.get("type").and_then(Value::as_u64) == Some(WEIGHT_SENSOR_TYPE)
}

/// File backed settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the settings file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the settings file
    pub fn load(&self) -> Result<Settings, SettingsError> {
        let json = fs::read_to_string(&self.path).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        Settings::from_json(&json)
    }

    /// Write the `offset2` of `configs` back to disk
    ///
    /// Re-reads the file first so edits made by the web interface in the
    /// meantime are kept. The document is replaced atomically.
    pub fn persist_offset2(&self, configs: &[WeightSensorConfig]) -> Result<usize, SettingsError> {
        let mut settings = self.load()?;
        let changed = settings.apply_offset2(configs);
        if changed == 0 {
            debug!("offset2 unchanged, {} not rewritten", self.path.display());
            return Ok(0);
        }
        self.write_atomic(&settings.to_json_pretty()?)?;
        debug!("offset2 of {} sensor(s) written to {}", changed, self.path.display());
        Ok(changed)
    }

    fn write_atomic(&self, contents: &str) -> Result<(), SettingsError> {
        let io_error = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(io_error)?;
        file.write_all(contents.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Channel, ChipPins};

    const DOCUMENT: &str = r#"{
        "ts_channel_id": 123456,
        "offline": 1,
        "sensors": [
            {"type": 0, "ts_field_temperature": "field1"},
            {"type": 2, "pin_dt": 5, "pin_sck": 6, "channel": "A", "reference_unit": 22.5, "offset": -8000, "ts_field": "field3"},
            {"type": 2, "pin_dt": 5, "pin_sck": 6, "channel": "B", "reference_unit": 0, "offset": 0},
            {"type": 2, "pin_dt": 17, "pin_sck": 27, "channel": "B", "reference_unit": -30.0, "offset": 120, "offset2": 20}
        ]
    }"#;

    #[test]
    fn only_valid_weight_entries_load() {
        let settings = Settings::from_json(DOCUMENT).unwrap();
        let sensors = settings.weight_sensors();

        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].pins(), ChipPins::new(5, 6, Channel::A));
        assert_eq!(sensors[1].offset2, 20.0);
        assert_eq!(settings.channel_id().as_deref(), Some("123456"));
    }

    #[test]
    fn no_sensors_is_fine() {
        let settings = Settings::from_json(r#"{"button_pin": 17}"#).unwrap();
        assert!(settings.weight_sensors().is_empty());
        assert!(settings.channel_id().is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(Settings::from_json("{"), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn apply_offset2_touches_only_matching_entries() {
        let mut settings = Settings::from_json(DOCUMENT).unwrap();
        let mut update = settings.weight_sensors()[0].clone();
        update.offset2 = 50.0;

        assert_eq!(settings.apply_offset2(&[update]), 1);
        assert_eq!(settings.weight_sensors()[0].offset2, 50.0);

        let sensors = settings.document()["sensors"].as_array().unwrap();
        assert_eq!(sensors[1]["offset2"], 50.0);
        assert!(sensors[2].get("offset2").is_none());
        assert_eq!(sensors[3]["offset2"], 20);
        assert_eq!(settings.document()["offline"], 1);
    }

    #[test]
    fn write_back_changes_only_offset2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let original = r#"{
            "zeta": true,
            "sensors": [
                {"type": 2, "pin_sck": 6, "pin_dt": 5, "offset2": 0, "reference_unit": 1.0, "ts_field": "field3"}
            ],
            "alpha": "last"
        }"#;
        fs::write(&path, original).unwrap();
        let store = SettingsStore::new(&path);

        let mut update = store.load().unwrap().weight_sensors()[0].clone();
        update.offset2 = 40.0;
        assert_eq!(store.persist_offset2(&[update]).unwrap(), 1);

        let written = fs::read_to_string(&path).unwrap();
        let position = |key: &str| written.find(&format!("\"{}\"", key)).unwrap();
        assert!(position("zeta") < position("sensors"));
        assert!(position("sensors") < position("alpha"));
        assert!(position("pin_sck") < position("pin_dt"));
        assert!(position("offset2") < position("reference_unit"));

        let mut expected: Value = serde_json::from_str(original).unwrap();
        expected["sensors"][0]["offset2"] = Value::from(40.0);
        assert_eq!(serde_json::from_str::<Value>(&written).unwrap(), expected);
    }
}
