//! Multi-Pass Reconciliation Engine.
//!
//! Both conversion directions share one shape: an external-merge-style
//! construction that streams flat records from a buffer, matches them
//! against a bounded in-memory batch of keys, spills whatever does not
//! match to the paired buffer, swaps roles, and repeats until a pass
//! processes fewer distinct keys than the batch limit.
//!
//! - [`cross`] assembles the cross-sectional hierarchy from canonical input
//! - [`series`] assembles canonical groups/series from cross-sectional input
//! - [`batch`] owns the adaptive batch limit and the memory-pressure probe
//!
//! All key matching is positional: a key is the tuple of component value
//! strings in DSD-declared order, compared and sorted lexicographically.

pub mod batch;
pub mod cross;
pub mod series;

use std::collections::{BTreeMap, HashSet};

use crate::model::{
    GroupKey, KeyTuple, Observation, TimeseriesKey, XsGroup, XsObservation, XsSection,
};
use crate::order::{ComponentOrder, SlotId};
use crate::record::{FlatRecord, RecordCodec, NULL_SENTINEL};
use crate::error::{RecordError, RecordResult};
use crate::structure::{AttachmentLevel, DataStructure, XsLevel};

// =============================================================================
// Pass Statistics
// =============================================================================

/// Summary of one assembly run, surfaced in debug logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Outer passes executed across all phases.
    pub passes: u32,
    /// Lines spilled to a later pass.
    pub spilled: u64,
    /// Distinct keys processed.
    pub keys: u64,
}

impl PassStats {
    pub(crate) fn add_pass(&mut self, keys: usize, spilled: u64) {
        self.passes += 1;
        self.keys += keys as u64;
        self.spilled += spilled;
    }
}

// =============================================================================
// Record Projections
// =============================================================================

/// Precomputed slot groupings for one job. The engine projects every key
/// and every model fragment through this, so slot classification happens
/// in exactly one place.
pub(crate) struct Projector {
    /// Cross-sectional group-level components (dims, then attributes).
    group_slots: Vec<SlotId>,
    /// Group-level plus section-level components; the section key.
    section_slots: Vec<SlotId>,
    /// Section-level components only.
    section_own_slots: Vec<SlotId>,
    /// Observation-level dimensions (time included, measure dim excluded).
    obs_dim_slots: Vec<SlotId>,
    /// Observation-level attributes in the cross shape.
    obs_attr_slots: Vec<SlotId>,
    /// Series key: every non-time dimension, declaration order.
    series_dim_slots: Vec<SlotId>,
    /// Attributes attached at series level.
    series_attr_slots: Vec<SlotId>,
    /// Attributes attached at observation level.
    ts_obs_attr_slots: Vec<SlotId>,
    /// Attributes attached at group level.
    group_attr_slots: Vec<SlotId>,
    /// Attributes attached at dataset level.
    dataset_attr_slots: Vec<SlotId>,
    /// Declared groups: id plus the slots of their key dimensions.
    group_defs: Vec<(String, Vec<SlotId>)>,
    /// Concept ids that are dimensions (for key/attribute classification).
    dim_ids: HashSet<String>,
}

impl Projector {
    pub(crate) fn new(dsd: &DataStructure, order: &ComponentOrder) -> Self {
        let slot_of = |id: &str| order.slot(id).expect("resolved concept has a slot");

        let mut group_slots = Vec::new();
        let mut section_own_slots = Vec::new();
        let mut obs_dim_slots = Vec::new();
        let mut series_dim_slots = Vec::new();
        let mut dataset_attr_slots = Vec::new();

        for dim in &dsd.dimensions {
            let slot = slot_of(&dim.id);
            if !dim.is_time {
                series_dim_slots.push(slot);
            }
            if dim.is_measure {
                // Measure identity is carried by the measure slot, not by
                // any cross-sectional key.
                continue;
            }
            match dim.xs_level {
                XsLevel::Group => group_slots.push(slot),
                XsLevel::Section => section_own_slots.push(slot),
                XsLevel::Observation => obs_dim_slots.push(slot),
                // Constant for the whole dataset in the cross shape; the
                // value must still ride along, so it travels with the
                // dataset attributes.
                XsLevel::DataSet => dataset_attr_slots.push(slot),
            }
        }

        let mut obs_attr_slots = Vec::new();
        let mut series_attr_slots = Vec::new();
        let mut ts_obs_attr_slots = Vec::new();
        let mut group_attr_slots = Vec::new();

        for attr in &dsd.attributes {
            let slot = slot_of(&attr.id);
            match attr.xs_level {
                XsLevel::Group => group_slots.push(slot),
                XsLevel::Section => section_own_slots.push(slot),
                XsLevel::Observation => obs_attr_slots.push(slot),
                XsLevel::DataSet => {}
            }
            match attr.attachment {
                AttachmentLevel::Series => series_attr_slots.push(slot),
                AttachmentLevel::Observation => ts_obs_attr_slots.push(slot),
                AttachmentLevel::Group => group_attr_slots.push(slot),
                AttachmentLevel::DataSet => dataset_attr_slots.push(slot),
            }
            // Dataset-level in one shape only: the slot still belongs to
            // the dataset extraction, or its value would vanish.
            if attr.xs_level == XsLevel::DataSet && attr.attachment != AttachmentLevel::DataSet {
                dataset_attr_slots.push(slot);
            }
        }

        let mut section_slots = group_slots.clone();
        section_slots.extend(section_own_slots.iter().copied());

        let group_defs = dsd
            .groups
            .iter()
            .map(|g| (g.id.clone(), g.dimensions.iter().map(|d| slot_of(d)).collect()))
            .collect();

        let dim_ids = dsd.dimensions.iter().map(|d| d.id.clone()).collect();

        Self {
            group_slots,
            section_slots,
            section_own_slots,
            obs_dim_slots,
            obs_attr_slots,
            series_dim_slots,
            series_attr_slots,
            ts_obs_attr_slots,
            group_attr_slots,
            dataset_attr_slots,
            group_defs,
            dim_ids,
        }
    }

    /// The positional key a record projects to over the given slots.
    /// Absent values take the sentinel so tuples stay positionally aligned.
    pub(crate) fn tuple(&self, record: &FlatRecord, slots: &[SlotId]) -> KeyTuple {
        KeyTuple::new(
            slots
                .iter()
                .map(|s| record.get(*s).unwrap_or(NULL_SENTINEL).to_string())
                .collect(),
        )
    }

    pub(crate) fn group_tuple(&self, record: &FlatRecord) -> KeyTuple {
        self.tuple(record, &self.group_slots)
    }

    pub(crate) fn section_tuple(&self, record: &FlatRecord) -> KeyTuple {
        self.tuple(record, &self.section_slots)
    }

    pub(crate) fn series_tuple(&self, record: &FlatRecord) -> KeyTuple {
        self.tuple(record, &self.series_dim_slots)
    }

    /// A full-width record keeping only the given slots; the flat form the
    /// distinct-key files are written in.
    pub(crate) fn project(&self, record: &FlatRecord, slots: &[SlotId], width: usize) -> FlatRecord {
        let mut out = FlatRecord::empty(width);
        for slot in slots {
            let _ = out.set(*slot, record.get(*slot).map(str::to_string));
        }
        out
    }

    pub(crate) fn section_record(&self, record: &FlatRecord, width: usize) -> FlatRecord {
        self.project(record, &self.section_slots, width)
    }

    pub(crate) fn group_record(&self, record: &FlatRecord, width: usize) -> FlatRecord {
        self.project(record, &self.group_slots, width)
    }

    /// Declared groups with their key-dimension slots.
    pub(crate) fn group_defs(&self) -> &[(String, Vec<SlotId>)] {
        &self.group_defs
    }

    /// Attributes attached at group level (the slots fold-in copies).
    pub(crate) fn group_attr_slots(&self) -> &[SlotId] {
        &self.group_attr_slots
    }

    /// Whether every slot of a tuple source holds a value in the record.
    pub(crate) fn complete(&self, record: &FlatRecord, slots: &[SlotId]) -> bool {
        slots.iter().all(|s| record.get(*s).is_some())
    }

    fn split_kv(
        &self,
        record: &FlatRecord,
        slots: &[SlotId],
        order: &ComponentOrder,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut keys = BTreeMap::new();
        let mut attrs = BTreeMap::new();
        for slot in slots {
            if let Some(value) = record.get(*slot) {
                let concept = order.concept(*slot).to_string();
                if self.dim_ids.contains(&concept) {
                    keys.insert(concept, value.to_string());
                } else {
                    attrs.insert(concept, value.to_string());
                }
            }
        }
        (keys, attrs)
    }

    // -- cross-sectional fragments -------------------------------------------

    pub(crate) fn build_xs_group(&self, record: &FlatRecord, order: &ComponentOrder) -> XsGroup {
        let (key_values, attributes) = self.split_kv(record, &self.group_slots, order);
        XsGroup { key_values, attributes, sections: Vec::new() }
    }

    pub(crate) fn build_xs_section(&self, record: &FlatRecord, order: &ComponentOrder) -> XsSection {
        let (key_values, attributes) = self.split_kv(record, &self.section_own_slots, order);
        XsSection { key_values, attributes, observations: Vec::new() }
    }

    pub(crate) fn build_xs_observation(
        &self,
        record: &FlatRecord,
        codec: &RecordCodec<'_>,
        dsd: &DataStructure,
    ) -> RecordResult<XsObservation> {
        let code = codec
            .order()
            .measure_dim_slot()
            .and_then(|s| record.get(s))
            .unwrap_or_default();
        let measure = dsd
            .measure_for_code(code)
            .ok_or_else(|| RecordError::UnknownMeasure(code.to_string()))?;

        let mut obs = XsObservation::new(measure.id, codec.value_of(record));
        let order = codec.order();
        for slot in &self.obs_dim_slots {
            if let Some(value) = record.get(*slot) {
                obs.key_values.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        for slot in &self.obs_attr_slots {
            if let Some(value) = record.get(*slot) {
                obs.attributes.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        Ok(obs)
    }

    // -- canonical fragments -------------------------------------------------

    pub(crate) fn build_series(&self, record: &FlatRecord, order: &ComponentOrder) -> TimeseriesKey {
        let mut series = TimeseriesKey::new();
        for slot in &self.series_dim_slots {
            if let Some(value) = record.get(*slot) {
                series.key_values.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        for slot in &self.series_attr_slots {
            if let Some(value) = record.get(*slot) {
                series.attributes.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        series
    }

    pub(crate) fn build_ts_observation(
        &self,
        record: &FlatRecord,
        codec: &RecordCodec<'_>,
    ) -> Observation {
        let mut obs = Observation {
            time: codec.time_of(record),
            value: codec.value_of(record),
            attributes: BTreeMap::new(),
        };
        let order = codec.order();
        for slot in &self.ts_obs_attr_slots {
            if let Some(value) = record.get(*slot) {
                obs.attributes.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        obs
    }

    pub(crate) fn build_group_key(
        &self,
        record: &FlatRecord,
        group_id: &str,
        dim_slots: &[SlotId],
        order: &ComponentOrder,
    ) -> GroupKey {
        let mut group = GroupKey::new(group_id);
        for slot in dim_slots {
            if let Some(value) = record.get(*slot) {
                group.key_values.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        for slot in &self.group_attr_slots {
            if let Some(value) = record.get(*slot) {
                group.attributes.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        group
    }

    /// Dataset-attached attribute values present in a record.
    pub(crate) fn dataset_attrs(
        &self,
        record: &FlatRecord,
        order: &ComponentOrder,
    ) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        for slot in &self.dataset_attr_slots {
            if let Some(value) = record.get(*slot) {
                attrs.insert(order.concept(*slot).to_string(), value.to_string());
            }
        }
        attrs
    }
}

/// Time value of a cross-sectional observation, for ascending-time output
/// ordering.
pub(crate) fn xs_obs_time<'a>(obs: &'a XsObservation, time_concept: Option<&str>) -> Option<&'a str> {
    time_concept.and_then(|t| obs.key_values.get(t)).map(String::as_str)
}
