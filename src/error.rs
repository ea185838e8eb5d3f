//! Error types for the pivot engine.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`StructuralError`] - the DSD lacks something the target shape needs
//! - [`RecordError`] - flat-record encode/decode failures
//! - [`BufferError`] - intermediate-storage failures
//! - [`PivotError`] - top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

// =============================================================================
// Structural Errors
// =============================================================================

/// Errors raised when a data structure definition cannot support the
/// requested conversion. All of these fail fast, before any record is
/// buffered or processed.
#[derive(Debug, Error)]
pub enum StructuralError {
    /// The target shape requires a time dimension the DSD does not declare.
    #[error("Data structure '{0}' declares no time dimension, required by the target format")]
    MissingTimeDimension(String),

    /// More than one time dimension declared.
    #[error("Data structure '{0}' declares more than one time dimension")]
    DuplicateTimeDimension(String),

    /// More than one measure dimension declared.
    #[error("Data structure '{0}' declares more than one measure dimension")]
    DuplicateMeasureDimension(String),

    /// Several cross-sectional measures but no measure dimension to tell
    /// observations apart.
    #[error("Data structure '{0}' declares {1} cross-sectional measures but no measure dimension")]
    AmbiguousMeasures(String, usize),

    /// A component id appears twice in the DSD.
    #[error("Duplicate component id '{0}' in data structure")]
    DuplicateComponent(String),

    /// A group key names a group the DSD does not declare.
    #[error("Data structure declares no group '{0}'")]
    UnknownGroup(String),

    /// A declared group references a dimension the DSD does not declare.
    #[error("Group '{group}' references unknown dimension '{dimension}'")]
    UnknownGroupDimension { group: String, dimension: String },

    /// A series key is missing mandatory dimension values. Lists every
    /// missing dimension, not just the first one.
    #[error("Series key is missing dimension(s): {}", .0.join(", "))]
    MissingDimensions(Vec<String>),
}

// =============================================================================
// Record Errors
// =============================================================================

/// Errors during flat-record encoding or decoding.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A record line did not split into the expected number of slots.
    #[error("Record has {found} field(s), expected {expected}")]
    FieldCount { expected: usize, found: usize },

    /// A value contains the field delimiter. The intermediate format does
    /// not escape, so such values must be rejected before buffering.
    #[error("Value for '{concept}' contains the field delimiter '{delimiter}'")]
    DelimiterInValue { concept: String, delimiter: char },

    /// A concept id has no slot in the component order.
    #[error("Concept '{0}' has no slot in the component order")]
    UnknownConcept(String),

    /// A slot index is out of range for the record.
    #[error("Slot {slot} out of range (record has {len} slots)")]
    SlotOutOfRange { slot: usize, len: usize },

    /// No declared cross measure matches an observation's measure id or
    /// measure-dimension code value.
    #[error("No cross-sectional measure matches '{0}'")]
    UnknownMeasure(String),
}

// =============================================================================
// Buffer Errors
// =============================================================================

/// Errors from the intermediate record buffers. I/O failures carry the
/// name of the engine phase that was running when they happened.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Failed to create, read, or write a temp buffer.
    #[error("Buffer I/O failure during '{phase}': {source}")]
    Io {
        phase: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The buffer was used after `dispose()`.
    #[error("Buffer used after dispose during '{0}'")]
    Disposed(&'static str),
}

impl BufferError {
    pub fn io(phase: &'static str, source: std::io::Error) -> Self {
        Self::Io { phase, source }
    }
}

// =============================================================================
// Pivot Errors (top-level)
// =============================================================================

/// Top-level errors returned by the pivot façade and the reconciliation
/// engine. Wraps all lower-level errors and adds engine-specific variants.
///
/// Only [`PivotError::MemoryPressure`] is ever recovered from (by halving
/// the batch limit and restarting the phase); everything else surfaces to
/// the caller.
#[derive(Debug, Error)]
pub enum PivotError {
    /// Structural error.
    #[error("Structural error: {0}")]
    Structure(#[from] StructuralError),

    /// Record codec error.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Buffer error.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The memory probe reported pressure mid-phase. Internal signal,
    /// consumed by the batch-shrink retry loop.
    #[error("Memory pressure reported during '{0}'")]
    MemoryPressure(&'static str),

    /// The batch limit cannot shrink any further.
    #[error("Cannot reduce batch size below 1 during '{0}'; increase available memory")]
    ResourceExhaustion(&'static str),

    /// A façade call arrived out of order.
    #[error("Call '{call}' not allowed in state '{state}'")]
    CallOrder { call: &'static str, state: &'static str },

    /// The writer was used after `close()`.
    #[error("Writer already closed")]
    Closed,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for structural checks.
pub type StructResult<T> = Result<T, StructuralError>;

/// Result type for record codec operations.
pub type RecordResult<T> = Result<T, RecordError>;

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Result type for pivot operations.
pub type PivotResult<T> = Result<T, PivotError>;
