//! Canonical (time-series) and cross-sectional data models.
//!
//! Both models are built incrementally by the pivot façade, owned by the
//! reconciliation engine while a conversion runs, and never mutated after
//! being handed to an output adapter.
//!
//! Keys are semantic sets: two keys compare equal iff their value maps are
//! equal, regardless of insertion order. The engine's ordered maps use
//! [`KeyTuple`] instead, the positional string tuple a key projects to in
//! DSD-declared component order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Ordered Key Tuples
// =============================================================================

/// A key as the engine compares it: the concatenation, in DSD-declared
/// order, of the constituent component values. Ordering is plain
/// lexicographic string ordering, element by element - stable and
/// reproducible, not "natural" numeric/date ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyTuple(pub Vec<String>);

impl KeyTuple {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

// =============================================================================
// Header
// =============================================================================

/// Message header, passed through unchanged from input to output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default)]
    pub test: bool,
}

// =============================================================================
// Canonical (time-series) model
// =============================================================================

/// A single observation of a series.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Observation {
    /// Time-dimension value.
    pub time: Option<String>,
    /// Observation value; `None` means "no value reported".
    pub value: Option<String>,
    /// Observation-attached attribute values.
    pub attributes: BTreeMap<String, String>,
}

impl Observation {
    pub fn new(time: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            time: Some(time.into()),
            value: Some(value.into()),
            attributes: BTreeMap::new(),
        }
    }

    /// An observation with a time but no reported value.
    pub fn missing(time: impl Into<String>) -> Self {
        Self { time: Some(time.into()), value: None, attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(id.into(), value.into());
        self
    }
}

/// A series: its key, series-attached attributes, and ordered observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesKey {
    pub key_values: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub observations: Vec<Observation>,
}

impl TimeseriesKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, dim: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(dim.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(id.into(), value.into());
        self
    }

    pub fn add_observation(&mut self, obs: Observation) {
        self.observations.push(obs);
    }
}

/// A group key: which declared group it instantiates, the dimension values
/// forming its key, and group-attached attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    /// Id of the declared group this key belongs to.
    pub group_id: String,
    pub key_values: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

impl GroupKey {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            key_values: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, dim: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(dim.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(id.into(), value.into());
        self
    }
}

// =============================================================================
// Cross-sectional model
// =============================================================================

/// One observation element in a section: the measure it instantiates, its
/// value, and any observation-level dimension/attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XsObservation {
    /// Id of the cross measure this observation instantiates (the element
    /// name in cross-sectional output).
    pub measure_id: String,
    /// Observation value; `None` means "no value reported".
    pub value: Option<String>,
    /// Observation-attached dimension values (the time value included).
    pub key_values: BTreeMap<String, String>,
    /// Observation-attached attribute values.
    pub attributes: BTreeMap<String, String>,
}

impl XsObservation {
    pub fn new(measure_id: impl Into<String>, value: Option<String>) -> Self {
        Self {
            measure_id: measure_id.into(),
            value,
            key_values: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, dim: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(dim.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(id.into(), value.into());
        self
    }
}

/// A section: section-attached dimension/attribute values and the
/// observations sharing them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XsSection {
    pub key_values: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub observations: Vec<XsObservation>,
}

impl XsSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observation(&mut self, obs: XsObservation) {
        self.observations.push(obs);
    }
}

/// A cross-sectional group: group-attached dimension/attribute values and
/// the sections nested under them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XsGroup {
    pub key_values: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub sections: Vec<XsSection>,
}

impl XsGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, dim: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(dim.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(id.into(), value.into());
        self
    }

    pub fn add_section(&mut self, section: XsSection) {
        self.sections.push(section);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_ignores_insertion_order() {
        let a = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        let b = TimeseriesKey::new()
            .with_value("REF_AREA", "DE")
            .with_value("FREQ", "M");
        assert_eq!(a.key_values, b.key_values);
    }

    #[test]
    fn test_key_tuple_ordering_is_lexicographic() {
        let a = KeyTuple::new(vec!["A".into(), "10".into()]);
        let b = KeyTuple::new(vec!["A".into(), "9".into()]);
        // "10" < "9" as strings; the engine's ordering is deliberately
        // plain string ordering, not numeric.
        assert!(a < b);
    }

    #[test]
    fn test_key_tuple_dedup_in_map() {
        let mut map = BTreeMap::new();
        map.insert(KeyTuple::new(vec!["M".into(), "DE".into()]), 1);
        map.insert(KeyTuple::new(vec!["M".into(), "DE".into()]), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&KeyTuple::new(vec!["M".into(), "DE".into()])], 2);
    }

    #[test]
    fn test_missing_observation_value() {
        let obs = Observation::missing("2020-01");
        assert_eq!(obs.time.as_deref(), Some("2020-01"));
        assert!(obs.value.is_none());
    }

    #[test]
    fn test_model_serialization() {
        let mut section = XsSection::new();
        section.add_observation(
            XsObservation::new("STOCK", Some("5".into())).with_key("TIME_PERIOD", "2020-01"),
        );
        let json = serde_json::to_string(&section).unwrap();
        assert!(json.contains("STOCK"));
        assert!(json.contains("2020-01"));
    }
}
