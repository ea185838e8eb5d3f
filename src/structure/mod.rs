//! Structural Metadata View - read-only facade over a Data Structure
//! Definition (DSD).
//!
//! A [`DataStructure`] declares everything the pivot engine needs to know
//! about a dataset: its ordered dimensions, its primary measure, its
//! attributes with their attachment levels, its declared groups, and (for
//! cross-sectional DSDs) its cross-sectional measures.
//!
//! Invariants are checked once, at construction; after that the structure
//! is immutable for the lifetime of a conversion job.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{StructResult, StructuralError};

// =============================================================================
// Attachment Levels
// =============================================================================

/// Level at which an attribute's value is constant in the time-series shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentLevel {
    /// Constant for the whole dataset.
    DataSet,
    /// Constant per declared group key.
    Group,
    /// Constant per series key (dimension group).
    Series,
    /// Varies per observation.
    Observation,
}

/// Level at which a component attaches in the cross-sectional shape.
///
/// Per convention, a component is stored only at the coarsest level at
/// which it is used; finer-level duplicates are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XsLevel {
    DataSet,
    Group,
    Section,
    Observation,
}

// =============================================================================
// Components
// =============================================================================

/// A dimension declared by the DSD, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    /// Concept id (e.g. `FREQ`).
    pub id: String,
    /// Whether this is the (single) time dimension.
    pub is_time: bool,
    /// Whether this is the frequency dimension.
    pub is_frequency: bool,
    /// Whether this is the (single) measure dimension.
    pub is_measure: bool,
    /// Cross-sectional attachment level.
    pub xs_level: XsLevel,
}

impl Dimension {
    /// A plain dimension, attached at section level in the cross shape.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_time: false,
            is_frequency: false,
            is_measure: false,
            xs_level: XsLevel::Section,
        }
    }

    /// The time dimension. Always attaches at observation level.
    pub fn time(id: impl Into<String>) -> Self {
        Self {
            is_time: true,
            xs_level: XsLevel::Observation,
            ..Self::new(id)
        }
    }

    /// The frequency dimension.
    pub fn frequency(id: impl Into<String>) -> Self {
        Self {
            is_frequency: true,
            xs_level: XsLevel::Group,
            ..Self::new(id)
        }
    }

    /// The measure dimension. Its code values select cross measures.
    pub fn measure(id: impl Into<String>) -> Self {
        Self {
            is_measure: true,
            xs_level: XsLevel::Observation,
            ..Self::new(id)
        }
    }

    /// Override the cross-sectional attachment level.
    pub fn at(mut self, level: XsLevel) -> Self {
        self.xs_level = level;
        self
    }
}

/// An attribute declared by the DSD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    /// Concept id (e.g. `OBS_STATUS`).
    pub id: String,
    /// Attachment level in the time-series shape.
    pub attachment: AttachmentLevel,
    /// Attachment level in the cross-sectional shape.
    pub xs_level: XsLevel,
}

impl Attribute {
    pub fn new(id: impl Into<String>, attachment: AttachmentLevel) -> Self {
        // Default cross attachment mirrors the series attachment.
        let xs_level = match attachment {
            AttachmentLevel::DataSet => XsLevel::DataSet,
            AttachmentLevel::Group => XsLevel::Group,
            AttachmentLevel::Series => XsLevel::Section,
            AttachmentLevel::Observation => XsLevel::Observation,
        };
        Self { id: id.into(), attachment, xs_level }
    }

    /// Override the cross-sectional attachment level.
    pub fn at(mut self, level: XsLevel) -> Self {
        self.xs_level = level;
        self
    }
}

/// A group declared by the DSD: an id plus the dimensions forming its key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDef {
    pub id: String,
    pub dimensions: Vec<String>,
}

impl GroupDef {
    pub fn new(id: impl Into<String>, dimensions: Vec<String>) -> Self {
        Self { id: id.into(), dimensions }
    }
}

/// A cross-sectional measure: the element id it is rendered as, and the
/// measure-dimension code value that selects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossMeasure {
    /// Element id in the cross-sectional output (e.g. `STOCK`).
    pub id: String,
    /// Measure-dimension code value, or the primary-measure concept when
    /// the DSD declares no measure dimension.
    pub code: String,
}

impl CrossMeasure {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self { id: id.into(), code: code.into() }
    }
}

// =============================================================================
// Data Structure Definition
// =============================================================================

/// Immutable structural metadata for one conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStructure {
    pub id: String,
    pub dimensions: Vec<Dimension>,
    pub primary_measure: String,
    pub attributes: Vec<Attribute>,
    pub groups: Vec<GroupDef>,
    pub cross_measures: Vec<CrossMeasure>,
}

impl DataStructure {
    /// Build a data structure, enforcing the DSD invariants:
    /// at most one time dimension, at most one measure dimension, unique
    /// component ids, group references resolve, and measure identity is
    /// unambiguous.
    pub fn new(
        id: impl Into<String>,
        dimensions: Vec<Dimension>,
        primary_measure: impl Into<String>,
        attributes: Vec<Attribute>,
        groups: Vec<GroupDef>,
        cross_measures: Vec<CrossMeasure>,
    ) -> StructResult<Self> {
        let dsd = Self {
            id: id.into(),
            dimensions,
            primary_measure: primary_measure.into(),
            attributes,
            groups,
            cross_measures,
        };
        dsd.check()?;
        Ok(dsd)
    }

    fn check(&self) -> StructResult<()> {
        if self.dimensions.iter().filter(|d| d.is_time).count() > 1 {
            return Err(StructuralError::DuplicateTimeDimension(self.id.clone()));
        }
        if self.dimensions.iter().filter(|d| d.is_measure).count() > 1 {
            return Err(StructuralError::DuplicateMeasureDimension(self.id.clone()));
        }

        let mut seen = HashSet::new();
        for cid in self
            .dimensions
            .iter()
            .map(|d| d.id.as_str())
            .chain(self.attributes.iter().map(|a| a.id.as_str()))
            .chain(std::iter::once(self.primary_measure.as_str()))
        {
            if !seen.insert(cid) {
                return Err(StructuralError::DuplicateComponent(cid.to_string()));
            }
        }

        for group in &self.groups {
            for dim in &group.dimensions {
                if !self.dimensions.iter().any(|d| &d.id == dim) {
                    return Err(StructuralError::UnknownGroupDimension {
                        group: group.id.clone(),
                        dimension: dim.clone(),
                    });
                }
            }
        }

        // With several cross measures the measure dimension is what tells
        // one observation from another.
        if self.cross_measures.len() > 1 && self.measure_dimension().is_none() {
            return Err(StructuralError::AmbiguousMeasures(
                self.id.clone(),
                self.cross_measures.len(),
            ));
        }

        Ok(())
    }

    /// The time dimension, if declared.
    pub fn time_dimension(&self) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.is_time)
    }

    /// The measure dimension, if declared.
    pub fn measure_dimension(&self) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.is_measure)
    }

    /// Dimensions forming a series key: everything except time, in
    /// declaration order (the measure dimension included).
    pub fn series_dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().filter(|d| !d.is_time)
    }

    /// Fail fast when the target shape requires a time dimension.
    pub fn require_time_dimension(&self) -> StructResult<&Dimension> {
        self.time_dimension()
            .ok_or_else(|| StructuralError::MissingTimeDimension(self.id.clone()))
    }

    /// The declared cross measures, or the primary measure standing in as
    /// the sole measure when none are declared.
    pub fn effective_measures(&self) -> Vec<CrossMeasure> {
        if self.cross_measures.is_empty() {
            vec![CrossMeasure::new(&self.primary_measure, &self.primary_measure)]
        } else {
            self.cross_measures.clone()
        }
    }

    /// Resolve a measure-dimension code value to a cross measure. When a
    /// single measure exists it matches any code (there is nothing to
    /// disambiguate).
    pub fn measure_for_code(&self, code: &str) -> Option<CrossMeasure> {
        let measures = self.effective_measures();
        if measures.len() == 1 {
            return Some(measures[0].clone());
        }
        measures.into_iter().find(|m| m.code == code)
    }

    /// Attributes at a given time-series attachment level, declaration order.
    pub fn attributes_at(&self, level: AttachmentLevel) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attachment == level)
    }
}
