//! Component Order Resolver.
//!
//! Derives the stable concept → slot mapping that every flat record of a
//! conversion job follows:
//!
//! ```text
//! slot 0: observation value (primary measure / active cross measure)
//! slot 1: time value                        (only if a time dimension exists)
//! then  : measure dimension                 (only if declared)
//! then  : remaining dimensions              (declaration order)
//! then  : attributes                        (observation, series, group, dataset)
//! ```
//!
//! The mapping is computed once per job and never mutated afterward; this
//! module is the only place that converts a concept id into a [`SlotId`].

use serde::Serialize;
use std::collections::HashMap;

use crate::structure::{AttachmentLevel, DataStructure};

/// Strongly-typed index into a flat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The resolved concept → slot mapping for one conversion job.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentOrder {
    /// slot index → concept id.
    slots: Vec<String>,
    /// concept id → slot index.
    #[serde(skip)]
    by_concept: HashMap<String, SlotId>,
    time_slot: Option<SlotId>,
    measure_dim_slot: Option<SlotId>,
}

impl ComponentOrder {
    /// Resolve the slot assignment for a data structure.
    ///
    /// Deterministic and idempotent: resolving the same DSD twice yields
    /// identical slot assignments.
    pub fn resolve(dsd: &DataStructure) -> Self {
        let mut slots: Vec<String> = Vec::new();

        // Slot 0 is always the observation value.
        slots.push(dsd.primary_measure.clone());

        // Slot 1 is the time value; absence shifts everything up.
        let time_slot = dsd.time_dimension().map(|t| {
            slots.push(t.id.clone());
            SlotId(slots.len() - 1)
        });

        // The measure dimension keeps its own slot so measure identity
        // survives buffering.
        let measure_dim_slot = dsd.measure_dimension().map(|m| {
            slots.push(m.id.clone());
            SlotId(slots.len() - 1)
        });

        for dim in dsd.dimensions.iter().filter(|d| !d.is_time && !d.is_measure) {
            slots.push(dim.id.clone());
        }

        for level in [
            AttachmentLevel::Observation,
            AttachmentLevel::Series,
            AttachmentLevel::Group,
            AttachmentLevel::DataSet,
        ] {
            for attr in dsd.attributes_at(level) {
                slots.push(attr.id.clone());
            }
        }

        let by_concept = slots
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), SlotId(i)))
            .collect();

        Self { slots, by_concept, time_slot, measure_dim_slot }
    }

    /// The observation-value slot (always slot 0).
    pub fn value_slot(&self) -> SlotId {
        SlotId(0)
    }

    /// The time-value slot, when the DSD declares a time dimension.
    pub fn time_slot(&self) -> Option<SlotId> {
        self.time_slot
    }

    /// The measure-dimension slot, when the DSD declares one.
    pub fn measure_dim_slot(&self) -> Option<SlotId> {
        self.measure_dim_slot
    }

    /// Slot for a concept id.
    pub fn slot(&self, concept: &str) -> Option<SlotId> {
        self.by_concept.get(concept).copied()
    }

    /// Concept id occupying a slot.
    pub fn concept(&self, slot: SlotId) -> &str {
        &self.slots[slot.0]
    }

    /// Number of slots; every record of the job has exactly this length.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All concept ids in slot order.
    pub fn concepts(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(String::as_str)
    }

    /// The optional slot → concept header line for a buffer file.
    pub fn header_line(&self, delimiter: char) -> String {
        self.slots.join(&delimiter.to_string())
    }
}
