//! # sdmx-pivot - SDMX time-series ⇄ cross-sectional conversion
//!
//! sdmx-pivot re-pivots statistical datasets between the two SDMX data
//! shapes: the canonical time-series model (groups → series → dated
//! observations) and the cross-sectional model (groups → sections →
//! one observation per measure).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Series/XS   │────▶│ Flat record │────▶│ Multi-pass  │────▶│ XS/Series   │
//! │ calls (DSD) │     │ buffering   │     │ assembly    │     │ output      │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Input calls are flattened into fixed-slot delimited records and
//! buffered (on disk by default). On `close` the engine reconciles them
//! into the target hierarchy in as many passes as the memory budget
//! allows, shrinking its batch size adaptively under pressure.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sdmx_pivot::{CollectedCrossSection, CrossSectionalWriter, PivotOptions};
//!
//! let mut writer = CrossSectionalWriter::new(
//!     dsd,
//!     PivotOptions::default(),
//!     CollectedCrossSection::default(),
//! )?;
//! writer.write_header(&header)?;
//! writer.write_empty_dataset(&dataset_attrs)?;
//! for series in dataset {
//!     writer.write_series_key(&series)?;
//! }
//! writer.close()?;
//! let cross_sectional = writer.into_output();
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`structure`] - Data structure definitions (dimensions, attributes, groups, measures)
//! - [`order`] - Component order: the concept → slot mapping
//! - [`record`] - Flat-record codec
//! - [`buffer`] - Pluggable intermediate storage
//! - [`model`] - Data models of both shapes
//! - [`engine`] - Multi-pass reconciliation engine
//! - [`pivot`] - Conversion façade (writers, options, output traits)

// Core modules
pub mod error;
pub mod structure;

// Intermediate representation
pub mod order;
pub mod record;
pub mod buffer;

// Data models
pub mod model;

// Conversion
pub mod engine;
pub mod pivot;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    BufferError,
    BufferResult,
    PivotError,
    PivotResult,
    RecordError,
    RecordResult,
    StructResult,
    StructuralError,
};

// =============================================================================
// Re-exports - Structure
// =============================================================================

pub use structure::{
    AttachmentLevel,
    Attribute,
    CrossMeasure,
    DataStructure,
    Dimension,
    GroupDef,
    XsLevel,
};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use model::{
    GroupKey,
    Header,
    KeyTuple,
    Observation,
    TimeseriesKey,
    XsGroup,
    XsObservation,
    XsSection,
};

// =============================================================================
// Re-exports - Buffering
// =============================================================================

pub use buffer::BufferMode;

// =============================================================================
// Re-exports - Engine
// =============================================================================

pub use engine::batch::{KeyBudget, MemoryProbe, NoPressure};
pub use engine::PassStats;

// =============================================================================
// Re-exports - Pivot façade
// =============================================================================

pub use pivot::{
    CollectedCrossSection,
    CollectedTimeSeries,
    CrossSectionalOutput,
    CrossSectionalWriter,
    PivotOptions,
    TimeSeriesOutput,
    TimeSeriesWriter,
};
