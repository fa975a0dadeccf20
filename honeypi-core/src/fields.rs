//! Named field map shared by all sensors of a measurement cycle
//!
//! Sensor readers publish their results under the field names configured in
//! `settings.json` (`field1` .. `field8` for ThingSpeak, free names for other
//! sinks). The weight pipeline reads sibling fields (e.g. a hive temperature
//! for compensation) and adds its own.
//!
//! ## Rounding
//!
//! All rounding in the pipeline is half away from zero. Weights are published
//! in kilograms with exactly three decimals, i.e. whole grams:
//!
//! ```rust
//! use honeypi_core::fields::grams_to_kg;
//!
//! assert_eq!(grams_to_kg(1234.5), 1.235);
//! assert_eq!(grams_to_kg(-1234.5), -1.235);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Value stored under a field name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric reading
    Number(f64),
    /// Anything else a reader chose to publish (status text, error marker)
    Text(String),
}

impl FieldValue {
    /// Finite numeric value, if any
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Ordered map of field name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMap {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object of numbers and strings
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Store `value` under `name`, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Raw value stored under `name`
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Finite number stored under `name`; text, NaN and missing all yield `None`
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_number)
    }

    /// True if `name` holds any value
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if no field is set
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy every entry of `other` into this map, overwriting duplicates
    pub fn merge(&mut self, other: &FieldMap) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Entries in field name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Grams to kilograms with exactly three decimals
///
/// Rounds the gram value first so that the decimal boundary is decided on a
/// value that binary floating point represents exactly.
pub fn grams_to_kg(grams: f64) -> f64 {
    grams.round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kilogram_conversion_rounds_half_away() {
        assert_eq!(grams_to_kg(1234.5), 1.235);
        assert_eq!(grams_to_kg(1234.4), 1.234);
        assert_eq!(grams_to_kg(0.4), 0.0);
        assert_eq!(grams_to_kg(-0.5), -0.001);
    }

    #[test]
    fn round_to_decimals() {
        assert_eq!(round_to(20.0, 1), 20.0);
        assert_eq!(round_to(166.666, 1), 166.7);
        assert_eq!(round_to(4.12345678, 4), 4.1235);
        assert_eq!(round_to(-2.25, 1), -2.3);
    }

    #[test]
    fn numbers_only_when_finite() {
        let mut fields = FieldMap::new();
        fields.insert("field1", 21.5);
        fields.insert("field2", "n/a");
        fields.insert("field3", f64::NAN);

        assert_eq!(fields.number("field1"), Some(21.5));
        assert_eq!(fields.number("field2"), None);
        assert_eq!(fields.number("field3"), None);
        assert_eq!(fields.number("field4"), None);
        assert!(fields.contains("field2"));
    }

    #[test]
    fn json_round_trip_keeps_kinds() {
        let fields = FieldMap::from_json(r#"{"field1": 12.25, "status": "ok"}"#).unwrap();
        assert_eq!(fields.number("field1"), Some(12.25));
        assert_eq!(fields.get("status"), Some(&FieldValue::Text("ok".into())));

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"field1":12.25,"status":"ok"}"#);
    }

    #[test]
    fn merge_overwrites() {
        let mut base: FieldMap = [("field1", 1.0), ("field2", 2.0)].into_iter().collect();
        let update: FieldMap = [("field2", 20.0), ("field3", 30.0)].into_iter().collect();
        base.merge(&update);

        assert_eq!(base.len(), 3);
        assert_eq!(base.number("field2"), Some(20.0));
    }

    proptest! {
        #[test]
        fn kilograms_have_at_most_three_decimals(grams in -500_000.0f64..500_000.0) {
            let kg = grams_to_kg(grams);
            prop_assert!((kg * 1000.0 - (kg * 1000.0).round()).abs() < 1e-6);
            prop_assert!((kg * 1000.0 - grams).abs() <= 0.5 + 1e-6);
        }
    }
}
