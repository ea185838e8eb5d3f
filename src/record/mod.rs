//! Flat Record Codec.
//!
//! Encodes canonical-model fragments into fixed-slot delimited records and
//! back, following the job's [`ComponentOrder`]:
//!
//! ```text
//! DataSet attrs ┐
//! GroupKey      ├─ encode ─▶ "5;2020-01;M;DE;null;..." ─▶ buffer
//! SeriesKey     │
//! Observation   ┘
//! ```
//!
//! An absent value is written as the literal sentinel `"null"` - never the
//! empty string, which is reserved for "value present but blank". In the
//! value slot the legacy literal `"-"` also decodes to "no value".
//!
//! The intermediate format does not escape: a value containing the field
//! delimiter is a caller error and is rejected at encode time. Line-break
//! characters are replaced through a precompiled, process-wide sanitation
//! table so a value can never span records.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{RecordError, RecordResult};
use crate::model::{GroupKey, Observation, TimeseriesKey};
use crate::order::{ComponentOrder, SlotId};

/// Literal sentinel for an absent slot value.
pub const NULL_SENTINEL: &str = "null";

/// Legacy "no value" literal accepted in the observation-value slot.
pub const DASH_MISSING: &str = "-";

/// Characters replaced (with a space) before a value is buffered, so a
/// value can never break the line-oriented intermediate format. Built
/// once, immutable afterward.
static SANITIZE: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    for b in [b'\n', b'\r', 0u8] {
        table[b as usize] = true;
    }
    table
});

fn sanitize(value: &str) -> String {
    if value.bytes().any(|b| SANITIZE[b as usize]) {
        value
            .chars()
            .map(|c| if (c as u32) < 256 && SANITIZE[c as usize] { ' ' } else { c })
            .collect()
    } else {
        value.to_string()
    }
}

// =============================================================================
// Flat Record
// =============================================================================

/// A fixed-slot record; one `Option<String>` per component slot.
///
/// `len() == order.len()` for every record produced in a single pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRecord {
    slots: Vec<Option<String>>,
}

impl FlatRecord {
    /// An empty record with every slot absent.
    pub fn empty(len: usize) -> Self {
        Self { slots: vec![None; len] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: SlotId) -> Option<&str> {
        self.slots.get(slot.index()).and_then(|v| v.as_deref())
    }

    pub fn set(&mut self, slot: SlotId, value: Option<String>) -> RecordResult<()> {
        let len = self.len();
        let cell = self
            .slots
            .get_mut(slot.index())
            .ok_or(RecordError::SlotOutOfRange { slot: slot.index(), len })?;
        *cell = value;
        Ok(())
    }

    /// Serialize to one delimited line (without terminator).
    pub fn to_line(&self, delimiter: char) -> String {
        let mut line = String::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                line.push(delimiter);
            }
            line.push_str(slot.as_deref().unwrap_or(NULL_SENTINEL));
        }
        line
    }

    /// Parse one delimited line. The field count must match the component
    /// order exactly; a short or long line aborts the job rather than
    /// silently dropping a field.
    pub fn from_line(line: &str, delimiter: char, expected_len: usize) -> RecordResult<Self> {
        let fields: Vec<&str> = line.split(delimiter).collect();
        if fields.len() != expected_len {
            return Err(RecordError::FieldCount { expected: expected_len, found: fields.len() });
        }
        let slots = fields
            .into_iter()
            .map(|f| if f == NULL_SENTINEL { None } else { Some(f.to_string()) })
            .collect();
        Ok(Self { slots })
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encoder/decoder bound to one job's component order and delimiter.
pub struct RecordCodec<'a> {
    order: &'a ComponentOrder,
    delimiter: char,
}

impl<'a> RecordCodec<'a> {
    pub fn new(order: &'a ComponentOrder, delimiter: char) -> Self {
        Self { order, delimiter }
    }

    pub fn order(&self) -> &ComponentOrder {
        self.order
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Encode one observation with its surrounding context into a record.
    ///
    /// Every slot is filled from whichever source holds the concept, the
    /// most specific source first (observation, series, group, dataset);
    /// slots no source contributes to stay absent.
    pub fn encode(
        &self,
        dataset_attrs: &BTreeMap<String, String>,
        group: Option<&GroupKey>,
        series: Option<&TimeseriesKey>,
        observation: Option<&Observation>,
    ) -> RecordResult<FlatRecord> {
        let mut record = FlatRecord::empty(self.order.len());

        if let Some(obs) = observation {
            self.put(&mut record, self.order.value_slot(), obs.value.as_deref())?;
            if let Some(time_slot) = self.order.time_slot() {
                self.put(&mut record, time_slot, obs.time.as_deref())?;
            }
        }

        for slot_idx in 0..self.order.len() {
            let slot = SlotId(slot_idx);
            if record.get(slot).is_some() {
                continue;
            }
            let concept = self.order.concept(slot);
            let value = observation
                .and_then(|o| o.attributes.get(concept))
                .or_else(|| series.and_then(|s| s.key_values.get(concept)))
                .or_else(|| series.and_then(|s| s.attributes.get(concept)))
                .or_else(|| group.and_then(|g| g.key_values.get(concept)))
                .or_else(|| group.and_then(|g| g.attributes.get(concept)))
                .or_else(|| dataset_attrs.get(concept));
            if let Some(value) = value {
                self.put(&mut record, slot, Some(value))?;
            }
        }

        Ok(record)
    }

    fn put(&self, record: &mut FlatRecord, slot: SlotId, value: Option<&str>) -> RecordResult<()> {
        match value {
            None => record.set(slot, None),
            Some(v) => {
                if v.contains(self.delimiter) {
                    return Err(RecordError::DelimiterInValue {
                        concept: self.order.concept(slot).to_string(),
                        delimiter: self.delimiter,
                    });
                }
                record.set(slot, Some(sanitize(v)))
            }
        }
    }

    /// Encode one cross-sectional observation with its surrounding group
    /// and section into a record - group/section data replicated inline,
    /// one record per observation.
    pub fn encode_xs(
        &self,
        dataset_attrs: &BTreeMap<String, String>,
        group: &crate::model::XsGroup,
        section: &crate::model::XsSection,
        observation: &crate::model::XsObservation,
        measure_code: Option<&str>,
    ) -> RecordResult<FlatRecord> {
        let mut record = FlatRecord::empty(self.order.len());

        self.put(&mut record, self.order.value_slot(), observation.value.as_deref())?;
        if let Some(slot) = self.order.measure_dim_slot() {
            self.put(&mut record, slot, measure_code)?;
        }

        for slot_idx in 0..self.order.len() {
            let slot = SlotId(slot_idx);
            if record.get(slot).is_some()
                || slot == self.order.value_slot()
                || Some(slot) == self.order.measure_dim_slot()
            {
                continue;
            }
            let concept = self.order.concept(slot);
            let value = observation
                .key_values
                .get(concept)
                .or_else(|| observation.attributes.get(concept))
                .or_else(|| section.key_values.get(concept))
                .or_else(|| section.attributes.get(concept))
                .or_else(|| group.key_values.get(concept))
                .or_else(|| group.attributes.get(concept))
                .or_else(|| dataset_attrs.get(concept));
            if let Some(value) = value {
                self.put(&mut record, slot, Some(value))?;
            }
        }

        Ok(record)
    }

    /// Serialize a record to a line with this codec's delimiter.
    pub fn to_line(&self, record: &FlatRecord) -> String {
        record.to_line(self.delimiter)
    }

    /// Parse a line against this codec's component order.
    pub fn from_line(&self, line: &str) -> RecordResult<FlatRecord> {
        FlatRecord::from_line(line, self.delimiter, self.order.len())
    }

    /// The observation value of a record. `"-"` is the legacy numeric
    /// "missing" literal and decodes to no value, like the sentinel.
    pub fn value_of(&self, record: &FlatRecord) -> Option<String> {
        record
            .get(self.order.value_slot())
            .filter(|v| *v != DASH_MISSING)
            .map(str::to_string)
    }

    /// The time value of a record, when the order has a time slot.
    pub fn time_of(&self, record: &FlatRecord) -> Option<String> {
        self.order
            .time_slot()
            .and_then(|slot| record.get(slot))
            .map(str::to_string)
    }

    /// The slot → concept header line, written as the first line of a
    /// buffer when explicitly requested.
    pub fn header_line(&self) -> String {
        self.order.header_line(self.delimiter)
    }
}
