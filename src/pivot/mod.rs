//! Pivot Façade - the boundary format adapters talk to.
//!
//! A Reader/Writer pair mirrors the construction order of the two models:
//!
//! ```text
//! canonical calls                         cross-sectional calls
//! ───────────────                         ─────────────────────
//! write_header                            write_header
//! write_empty_dataset                     write_empty_dataset
//! write_group_key*                        write_xs_group*
//! write_series_key* (obs bundled)         close
//! close
//!       │                                       │
//!       ▼                                       ▼
//! CrossSectionalWriter ──▶ XsGroup…       TimeSeriesWriter ──▶ GroupKey/TimeseriesKey…
//! ```
//!
//! Calls must arrive in this order per dataset; observations are only ever
//! supplied bundled inside a series-key call. Earlier calls merely
//! accumulate flat records into the buffering backend - `close` is the
//! only point at which the multi-pass reconciliation runs. There is no
//! mid-pass cancellation; a running conversion stops only by failing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use log::info;

use crate::buffer::{BufferMode, DoubleBuffer};
use crate::engine::batch::{BatchController, MemoryProbe, NoPressure};
use crate::engine::{cross, series, PassStats};
use crate::error::{PivotError, PivotResult, RecordError, StructuralError};
use crate::model::{GroupKey, Header, TimeseriesKey, XsGroup};
use crate::order::ComponentOrder;
use crate::record::RecordCodec;
use crate::structure::DataStructure;

// =============================================================================
// Options
// =============================================================================

/// Configuration for one conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotOptions {
    /// Intermediate storage backing. Changes resource footprint only,
    /// never observable output.
    pub buffer_mode: BufferMode,

    /// Field delimiter of the intermediate flat-record format.
    pub delimiter: char,

    /// Initial batch limit; `None` starts unbounded and lets the memory
    /// probe shrink it.
    pub batch_limit: Option<usize>,

    /// Write a slot → concept header line as the first record line.
    pub write_slot_header: bool,
}

impl Default for PivotOptions {
    fn default() -> Self {
        Self {
            buffer_mode: BufferMode::File,
            delimiter: ';',
            batch_limit: None,
            write_slot_header: false,
        }
    }
}

// =============================================================================
// Output capability traits
// =============================================================================

/// An adapter able to receive cross-sectional output. Implemented by the
/// format writer chosen at composition time.
pub trait CrossSectionalOutput {
    fn write_header(&mut self, header: &Header) -> PivotResult<()>;
    fn write_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()>;
    fn write_group(&mut self, group: &XsGroup) -> PivotResult<()>;
    fn close(&mut self) -> PivotResult<()>;
}

/// An adapter able to receive canonical time-series output.
pub trait TimeSeriesOutput {
    fn write_header(&mut self, header: &Header) -> PivotResult<()>;
    fn write_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()>;
    fn write_group(&mut self, group: &GroupKey) -> PivotResult<()>;
    fn write_series(&mut self, series: &TimeseriesKey) -> PivotResult<()>;
    fn close(&mut self) -> PivotResult<()>;
}

/// Collects cross-sectional output in memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectedCrossSection {
    pub header: Option<Header>,
    pub dataset_attributes: BTreeMap<String, String>,
    pub groups: Vec<XsGroup>,
    pub closed: bool,
}

impl CrossSectionalOutput for CollectedCrossSection {
    fn write_header(&mut self, header: &Header) -> PivotResult<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn write_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()> {
        self.dataset_attributes = attributes.clone();
        Ok(())
    }

    fn write_group(&mut self, group: &XsGroup) -> PivotResult<()> {
        self.groups.push(group.clone());
        Ok(())
    }

    fn close(&mut self) -> PivotResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Collects canonical output in memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectedTimeSeries {
    pub header: Option<Header>,
    pub dataset_attributes: BTreeMap<String, String>,
    pub groups: Vec<GroupKey>,
    pub series: Vec<TimeseriesKey>,
    pub closed: bool,
}

impl TimeSeriesOutput for CollectedTimeSeries {
    fn write_header(&mut self, header: &Header) -> PivotResult<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn write_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()> {
        self.dataset_attributes = attributes.clone();
        Ok(())
    }

    fn write_group(&mut self, group: &GroupKey) -> PivotResult<()> {
        self.groups.push(group.clone());
        Ok(())
    }

    fn write_series(&mut self, series: &TimeseriesKey) -> PivotResult<()> {
        self.series.push(series.clone());
        Ok(())
    }

    fn close(&mut self) -> PivotResult<()> {
        self.closed = true;
        Ok(())
    }
}

// =============================================================================
// Call-order state machine
// =============================================================================

/// Explicit writer state; transitions are checked in one place instead of
/// scattered boolean flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Initial,
    HeaderWritten,
    DataSetOpen { seen_series: bool },
    Closed,
}

impl WriterState {
    fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::HeaderWritten => "header written",
            Self::DataSetOpen { .. } => "dataset open",
            Self::Closed => "closed",
        }
    }

    fn require(self, call: &'static str, allowed: bool) -> PivotResult<()> {
        if allowed {
            Ok(())
        } else if self == Self::Closed {
            Err(PivotError::Closed)
        } else {
            Err(PivotError::CallOrder { call, state: self.name() })
        }
    }
}

// =============================================================================
// Canonical → cross-sectional
// =============================================================================

/// Accepts canonical time-series calls and emits the cross-sectional
/// hierarchy on `close`.
pub struct CrossSectionalWriter<O: CrossSectionalOutput> {
    dsd: DataStructure,
    order: ComponentOrder,
    options: PivotOptions,
    output: O,
    state: WriterState,
    dataset_attrs: BTreeMap<String, String>,
    records: DoubleBuffer,
    group_records: DoubleBuffer,
    controller: BatchController,
}

impl<O: CrossSectionalOutput> CrossSectionalWriter<O> {
    /// Build a writer for one conversion job. Fails fast, before any
    /// record is processed, when the DSD declares no time dimension.
    pub fn new(dsd: DataStructure, options: PivotOptions, output: O) -> PivotResult<Self> {
        dsd.require_time_dimension()?;
        let order = ComponentOrder::resolve(&dsd);

        let mut records = DoubleBuffer::create(options.buffer_mode, "record intake")?;
        if options.write_slot_header {
            let header = order.header_line(options.delimiter);
            records.current().write_line(&header, "record intake")?;
        }
        let group_records = DoubleBuffer::create(options.buffer_mode, "record intake")?;
        let controller = BatchController::new(options.batch_limit, Box::new(NoPressure));

        Ok(Self {
            dsd,
            order,
            options,
            output,
            state: WriterState::Initial,
            dataset_attrs: BTreeMap::new(),
            records,
            group_records,
            controller,
        })
    }

    /// Replace the memory probe (tests inject deterministic pressure).
    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.controller = BatchController::new(self.options.batch_limit, probe);
        self
    }

    pub fn write_header(&mut self, header: &Header) -> PivotResult<()> {
        self.state.require("write_header", self.state == WriterState::Initial)?;
        self.output.write_header(header)?;
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    /// Open the dataset with its dataset-level attributes only.
    pub fn write_empty_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()> {
        self.state
            .require("write_empty_dataset", self.state == WriterState::HeaderWritten)?;
        self.dataset_attrs = attributes.clone();
        self.state = WriterState::DataSetOpen { seen_series: false };
        Ok(())
    }

    /// Buffer one group key with its attributes. Group keys must precede
    /// series keys.
    pub fn write_group_key(&mut self, group: &GroupKey) -> PivotResult<()> {
        self.state.require(
            "write_group_key",
            self.state == WriterState::DataSetOpen { seen_series: false },
        )?;

        let def = self
            .dsd
            .groups
            .iter()
            .find(|g| g.id == group.group_id)
            .ok_or_else(|| StructuralError::UnknownGroup(group.group_id.clone()))?;
        let missing: Vec<String> = def
            .dimensions
            .iter()
            .filter(|d| !group.key_values.contains_key(*d))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StructuralError::MissingDimensions(missing).into());
        }
        if group.group_id.contains(self.options.delimiter) {
            return Err(RecordError::DelimiterInValue {
                concept: group.group_id.clone(),
                delimiter: self.options.delimiter,
            }
            .into());
        }

        // The group id travels as a leading field; key dimensions alone
        // cannot identify the declared group (one group's key can be a
        // subset of another's).
        let codec = RecordCodec::new(&self.order, self.options.delimiter);
        let record = codec.encode(&BTreeMap::new(), Some(group), None, None)?;
        let line = format!(
            "{}{}{}",
            group.group_id,
            self.options.delimiter,
            codec.to_line(&record)
        );
        self.group_records.current().write_line(&line, "record intake")?;
        Ok(())
    }

    /// Buffer one series with its bundled observations, one flat record
    /// per observation.
    pub fn write_series_key(&mut self, series: &TimeseriesKey) -> PivotResult<()> {
        self.state.require(
            "write_series_key",
            matches!(self.state, WriterState::DataSetOpen { .. }),
        )?;

        let missing: Vec<String> = self
            .dsd
            .series_dimensions()
            .filter(|d| !series.key_values.contains_key(&d.id))
            .map(|d| d.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(StructuralError::MissingDimensions(missing).into());
        }

        let codec = RecordCodec::new(&self.order, self.options.delimiter);
        for obs in &series.observations {
            let record = codec.encode(&self.dataset_attrs, None, Some(series), Some(obs))?;
            self.records
                .current()
                .write_line(&codec.to_line(&record), "record intake")?;
        }
        self.state = WriterState::DataSetOpen { seen_series: true };
        Ok(())
    }

    /// Run the multi-pass assembly and flush the output adapter. Buffers
    /// are released on every path, success or failure.
    pub fn close(&mut self) -> PivotResult<PassStats> {
        self.state
            .require("close", matches!(self.state, WriterState::DataSetOpen { .. }))?;
        self.state = WriterState::Closed;

        info!(
            "assembling cross-sectional dataset: {} record(s), {} group record(s)",
            self.records.current().line_count(),
            self.group_records.current().line_count()
        );

        let result = cross::assemble(
            &self.dsd,
            &self.order,
            self.options.delimiter,
            self.options.buffer_mode,
            &mut self.records,
            &mut self.group_records,
            &self.dataset_attrs,
            self.options.write_slot_header,
            &mut self.controller,
            &mut self.output,
        );
        self.records.dispose();
        self.group_records.dispose();

        let stats = result?;
        self.output.close()?;
        Ok(stats)
    }

    /// Hand back the output adapter once the conversion is over.
    pub fn into_output(self) -> O {
        self.output
    }
}

// =============================================================================
// Cross-sectional → canonical
// =============================================================================

/// Accepts cross-sectional calls and emits canonical groups and series on
/// `close`.
pub struct TimeSeriesWriter<O: TimeSeriesOutput> {
    dsd: DataStructure,
    order: ComponentOrder,
    options: PivotOptions,
    output: O,
    state: WriterState,
    dataset_attrs: BTreeMap<String, String>,
    records: DoubleBuffer,
    controller: BatchController,
}

impl<O: TimeSeriesOutput> TimeSeriesWriter<O> {
    /// Build a writer for one conversion job. The canonical shape needs a
    /// time dimension, so its absence fails here, fast.
    pub fn new(dsd: DataStructure, options: PivotOptions, output: O) -> PivotResult<Self> {
        dsd.require_time_dimension()?;
        let order = ComponentOrder::resolve(&dsd);

        let mut records = DoubleBuffer::create(options.buffer_mode, "record intake")?;
        if options.write_slot_header {
            let header = order.header_line(options.delimiter);
            records.current().write_line(&header, "record intake")?;
        }
        let controller = BatchController::new(options.batch_limit, Box::new(NoPressure));

        Ok(Self {
            dsd,
            order,
            options,
            output,
            state: WriterState::Initial,
            dataset_attrs: BTreeMap::new(),
            records,
            controller,
        })
    }

    /// Replace the memory probe (tests inject deterministic pressure).
    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.controller = BatchController::new(self.options.batch_limit, probe);
        self
    }

    pub fn write_header(&mut self, header: &Header) -> PivotResult<()> {
        self.state.require("write_header", self.state == WriterState::Initial)?;
        self.output.write_header(header)?;
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    pub fn write_empty_dataset(&mut self, attributes: &BTreeMap<String, String>) -> PivotResult<()> {
        self.state
            .require("write_empty_dataset", self.state == WriterState::HeaderWritten)?;
        self.dataset_attrs = attributes.clone();
        self.state = WriterState::DataSetOpen { seen_series: false };
        Ok(())
    }

    /// Buffer one cross-sectional group with its nested sections and
    /// observations: one flat record per observation, group and section
    /// data replicated inline.
    pub fn write_xs_group(&mut self, group: &XsGroup) -> PivotResult<()> {
        self.state.require(
            "write_xs_group",
            matches!(self.state, WriterState::DataSetOpen { .. }),
        )?;

        let codec = RecordCodec::new(&self.order, self.options.delimiter);
        let measures = self.dsd.effective_measures();
        for section in &group.sections {
            for obs in &section.observations {
                let measure = measures
                    .iter()
                    .find(|m| m.id == obs.measure_id)
                    .ok_or_else(|| RecordError::UnknownMeasure(obs.measure_id.clone()))?;
                let record = codec.encode_xs(
                    &self.dataset_attrs,
                    group,
                    section,
                    obs,
                    Some(measure.code.as_str()),
                )?;
                self.records
                    .current()
                    .write_line(&codec.to_line(&record), "record intake")?;
            }
        }
        self.state = WriterState::DataSetOpen { seen_series: true };
        Ok(())
    }

    /// Run the multi-pass assembly and flush the output adapter.
    pub fn close(&mut self) -> PivotResult<PassStats> {
        self.state
            .require("close", matches!(self.state, WriterState::DataSetOpen { .. }))?;
        self.state = WriterState::Closed;

        info!(
            "assembling time-series dataset: {} record(s)",
            self.records.current().line_count()
        );

        let result = series::assemble(
            &self.dsd,
            &self.order,
            self.options.delimiter,
            &mut self.records,
            &self.dataset_attrs,
            self.options.write_slot_header,
            &mut self.controller,
            &mut self.output,
        );
        self.records.dispose();

        let stats = result?;
        self.output.close()?;
        Ok(stats)
    }

    pub fn into_output(self) -> O {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::batch::KeyBudget;
    use crate::error::StructuralError;
    use crate::model::Observation;
    use crate::structure::{
        Attribute, AttachmentLevel, CrossMeasure, DataStructure, Dimension, GroupDef, XsLevel,
    };

    fn flat_dsd() -> DataStructure {
        // Every dimension at observation level: one group, one section.
        DataStructure::new(
            "DSD_FLAT",
            vec![
                Dimension::new("FREQ").at(XsLevel::Observation),
                Dimension::new("REF_AREA").at(XsLevel::Observation),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![],
            vec![],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap()
    }

    fn layered_dsd() -> DataStructure {
        DataStructure::new(
            "DSD_LAYERED",
            vec![
                Dimension::frequency("FREQ"),
                Dimension::new("REF_AREA"),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![
                Attribute::new("UNIT", AttachmentLevel::Series),
                Attribute::new("OBS_STATUS", AttachmentLevel::Observation),
            ],
            vec![],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap()
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pivot_to_xs(
        dsd: DataStructure,
        options: PivotOptions,
        groups: &[GroupKey],
        series: &[TimeseriesKey],
    ) -> CollectedCrossSection {
        init_logs();
        let mut writer =
            CrossSectionalWriter::new(dsd, options, CollectedCrossSection::default()).unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        for group in groups {
            writer.write_group_key(group).unwrap();
        }
        for s in series {
            writer.write_series_key(s).unwrap();
        }
        writer.close().unwrap();
        writer.into_output()
    }

    fn pivot_to_ts(
        dsd: DataStructure,
        options: PivotOptions,
        groups: &[XsGroup],
    ) -> CollectedTimeSeries {
        init_logs();
        let mut writer =
            TimeSeriesWriter::new(dsd, options, CollectedTimeSeries::default()).unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        for group in groups {
            writer.write_xs_group(group).unwrap();
        }
        writer.close().unwrap();
        writer.into_output()
    }

    #[test]
    fn test_single_series_becomes_one_group_one_section() {
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        // Out of order on purpose; output must come back ascending.
        series.add_observation(Observation::new("2020-02", "6"));
        series.add_observation(Observation::new("2020-01", "5"));

        let out = pivot_to_xs(flat_dsd(), PivotOptions::default(), &[], &[series]);

        assert!(out.closed);
        assert_eq!(out.groups.len(), 1);
        let group = &out.groups[0];
        assert!(group.key_values.is_empty());
        assert_eq!(group.sections.len(), 1);

        let obs = &group.sections[0].observations;
        assert_eq!(obs.len(), 2);
        for o in obs {
            assert_eq!(o.measure_id, "STOCK");
        }
        assert_eq!(obs[0].key_values.get("TIME_PERIOD").map(String::as_str), Some("2020-01"));
        assert_eq!(obs[0].value.as_deref(), Some("5"));
        assert_eq!(obs[1].key_values.get("TIME_PERIOD").map(String::as_str), Some("2020-02"));
        assert_eq!(obs[1].value.as_deref(), Some("6"));
        assert_eq!(obs[0].key_values.get("FREQ").map(String::as_str), Some("M"));
    }

    #[test]
    fn test_layered_dsd_places_components_by_level() {
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE")
            .with_attribute("UNIT", "EUR");
        series.add_observation(Observation::new("2020-01", "5").with_attribute("OBS_STATUS", "A"));

        let out = pivot_to_xs(layered_dsd(), PivotOptions::default(), &[], &[series]);

        let group = &out.groups[0];
        assert_eq!(group.key_values.get("FREQ").map(String::as_str), Some("M"));
        let section = &group.sections[0];
        assert_eq!(section.key_values.get("REF_AREA").map(String::as_str), Some("DE"));
        assert_eq!(section.attributes.get("UNIT").map(String::as_str), Some("EUR"));
        let obs = &section.observations[0];
        assert_eq!(obs.attributes.get("OBS_STATUS").map(String::as_str), Some("A"));
    }

    #[test]
    fn test_round_trip_preserves_series_and_observations() {
        let make_series = |area: &str, v1: &str, v2: &str| {
            let mut s = TimeseriesKey::new()
                .with_value("FREQ", "M")
                .with_value("REF_AREA", area)
                .with_attribute("UNIT", "EUR");
            s.add_observation(Observation::new("2020-01", v1));
            s.add_observation(Observation::new("2020-02", v2));
            s
        };
        let input = vec![make_series("DE", "1", "2"), make_series("FR", "3", "4")];

        let xs = pivot_to_xs(layered_dsd(), PivotOptions::default(), &[], &input);
        let ts = pivot_to_ts(layered_dsd(), PivotOptions::default(), &xs.groups);

        assert_eq!(ts.series.len(), 2);
        let mut recovered = ts.series.clone();
        recovered.sort_by(|a, b| a.key_values.cmp(&b.key_values));
        for (original, round_tripped) in input.iter().zip(&recovered) {
            assert_eq!(original.key_values, round_tripped.key_values);
            assert_eq!(original.attributes, round_tripped.attributes);
            assert_eq!(original.observations, round_tripped.observations);
        }
    }

    #[test]
    fn test_missing_time_dimension_fails_at_construction() {
        let dsd = DataStructure::new(
            "NO_TIME",
            vec![Dimension::new("FREQ")],
            "OBS_VALUE",
            vec![],
            vec![],
            vec![],
        )
        .unwrap();

        let result = CrossSectionalWriter::new(
            dsd.clone(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        );
        assert!(matches!(
            result,
            Err(PivotError::Structure(StructuralError::MissingTimeDimension(_)))
        ));

        let result =
            TimeSeriesWriter::new(dsd, PivotOptions::default(), CollectedTimeSeries::default());
        assert!(matches!(
            result,
            Err(PivotError::Structure(StructuralError::MissingTimeDimension(_)))
        ));
    }

    #[test]
    fn test_incomplete_series_key_lists_every_missing_dimension() {
        let mut writer = CrossSectionalWriter::new(
            layered_dsd(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();

        let mut series = TimeseriesKey::new();
        series.add_observation(Observation::new("2020-01", "5"));
        let err = writer.write_series_key(&series).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("FREQ"));
        assert!(msg.contains("REF_AREA"));
    }

    #[test]
    fn test_group_key_must_name_declared_group() {
        let dsd = DataStructure::new(
            "DSD_GROUPED",
            vec![
                Dimension::frequency("FREQ"),
                Dimension::new("REF_AREA"),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![Attribute::new("TITLE", AttachmentLevel::Group)],
            vec![GroupDef::new("SIBLING", vec!["REF_AREA".into()])],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap();

        let mut writer = CrossSectionalWriter::new(
            dsd,
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();

        let unknown = GroupKey::new("NOSUCH").with_value("REF_AREA", "DE");
        assert!(matches!(
            writer.write_group_key(&unknown),
            Err(PivotError::Structure(StructuralError::UnknownGroup(_)))
        ));

        let incomplete = GroupKey::new("SIBLING");
        assert!(matches!(
            writer.write_group_key(&incomplete),
            Err(PivotError::Structure(StructuralError::MissingDimensions(_)))
        ));
    }

    #[test]
    fn test_group_attributes_fold_into_output() {
        let dsd = DataStructure::new(
            "DSD_GROUPED",
            vec![
                Dimension::frequency("FREQ"),
                Dimension::new("REF_AREA").at(XsLevel::Group),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![Attribute::new("TITLE", AttachmentLevel::Group)],
            vec![GroupDef::new("SIBLING", vec!["REF_AREA".into()])],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap();

        let group = GroupKey::new("SIBLING")
            .with_value("REF_AREA", "DE")
            .with_attribute("TITLE", "Germany");
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        series.add_observation(Observation::new("2020-01", "5"));

        let out = pivot_to_xs(dsd, PivotOptions::default(), &[group], &[series]);

        assert_eq!(out.groups.len(), 1);
        assert_eq!(
            out.groups[0].attributes.get("TITLE").map(String::as_str),
            Some("Germany")
        );
    }

    #[test]
    fn test_call_order_is_enforced() {
        let mut writer = CrossSectionalWriter::new(
            flat_dsd(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap();

        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        series.add_observation(Observation::new("2020-01", "5"));
        assert!(matches!(
            writer.write_series_key(&series),
            Err(PivotError::CallOrder { call: "write_series_key", .. })
        ));

        writer.write_header(&Header::default()).unwrap();
        assert!(matches!(
            writer.write_header(&Header::default()),
            Err(PivotError::CallOrder { call: "write_header", .. })
        ));

        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        writer.write_series_key(&series).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(PivotError::Closed)));
    }

    #[test]
    fn test_constrained_batches_reach_the_same_output() {
        let mut input = Vec::new();
        for freq in ["A", "M", "Q"] {
            for area in ["DE", "FR"] {
                let mut s = TimeseriesKey::new()
                    .with_value("FREQ", freq)
                    .with_value("REF_AREA", area);
                s.add_observation(Observation::new("2020-01", "1"));
                input.push(s);
            }
        }

        let unconstrained = pivot_to_xs(layered_dsd(), PivotOptions::default(), &[], &input);
        let constrained = pivot_to_xs(
            layered_dsd(),
            PivotOptions { batch_limit: Some(1), ..PivotOptions::default() },
            &[],
            &input,
        );

        assert_eq!(unconstrained.groups.len(), 3);
        assert_eq!(
            serde_json::to_string(&unconstrained.groups).unwrap(),
            serde_json::to_string(&constrained.groups).unwrap()
        );
    }

    #[test]
    fn test_pressure_probe_shrinks_until_it_fits() {
        let mut input = Vec::new();
        for freq in ["A", "M"] {
            for area in ["DE", "FR"] {
                let mut s = TimeseriesKey::new()
                    .with_value("FREQ", freq)
                    .with_value("REF_AREA", area);
                s.add_observation(Observation::new("2020-01", "1"));
                input.push(s);
            }
        }

        let mut writer = CrossSectionalWriter::new(
            layered_dsd(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap()
        .with_probe(Box::new(KeyBudget(5)));
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        for s in &input {
            writer.write_series_key(s).unwrap();
        }
        let stats = writer.close().unwrap();
        assert!(stats.passes > 1);

        let out = writer.into_output();
        let sections: usize = out.groups.iter().map(|g| g.sections.len()).sum();
        assert_eq!(sections, 4);
    }

    #[test]
    fn test_exhaustion_when_even_one_key_is_too_many() {
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        series.add_observation(Observation::new("2020-01", "5"));

        let mut writer = CrossSectionalWriter::new(
            layered_dsd(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap()
        .with_probe(Box::new(KeyBudget(0)));
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        writer.write_series_key(&series).unwrap();

        assert!(matches!(
            writer.close(),
            Err(PivotError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_buffer_mode_never_changes_output() {
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE")
            .with_attribute("UNIT", "EUR");
        series.add_observation(Observation::new("2020-01", "5"));
        series.add_observation(Observation::new("2020-02", "6"));

        let on_disk = pivot_to_xs(
            layered_dsd(),
            PivotOptions { buffer_mode: BufferMode::File, ..PivotOptions::default() },
            &[],
            std::slice::from_ref(&series),
        );
        let in_memory = pivot_to_xs(
            layered_dsd(),
            PivotOptions { buffer_mode: BufferMode::Memory, ..PivotOptions::default() },
            &[],
            std::slice::from_ref(&series),
        );

        assert_eq!(
            serde_json::to_string(&on_disk).unwrap(),
            serde_json::to_string(&in_memory).unwrap()
        );
    }

    #[test]
    fn test_slot_header_is_transparent_to_output() {
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        series.add_observation(Observation::new("2020-01", "5"));

        let plain = pivot_to_xs(
            flat_dsd(),
            PivotOptions::default(),
            &[],
            std::slice::from_ref(&series),
        );
        let with_header = pivot_to_xs(
            flat_dsd(),
            PivotOptions { write_slot_header: true, ..PivotOptions::default() },
            &[],
            std::slice::from_ref(&series),
        );

        assert_eq!(
            serde_json::to_string(&plain.groups).unwrap(),
            serde_json::to_string(&with_header.groups).unwrap()
        );
    }

    #[test]
    fn test_unknown_measure_id_is_rejected() {
        let group = {
            let mut section = crate::model::XsSection::new();
            section.add_observation(crate::model::XsObservation::new("NOSUCH", Some("5".into())));
            let mut g = XsGroup::new();
            g.add_section(section);
            g
        };

        let mut writer = TimeSeriesWriter::new(
            flat_dsd(),
            PivotOptions::default(),
            CollectedTimeSeries::default(),
        )
        .unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        assert!(matches!(
            writer.write_xs_group(&group),
            Err(PivotError::Record(RecordError::UnknownMeasure(_)))
        ));
    }

    #[test]
    fn test_fold_in_keeps_nested_group_identity() {
        // One group's key dimensions are a subset of the other's; the
        // narrower group must not swallow the wider group's record.
        let dsd = DataStructure::new(
            "DSD_NESTED",
            vec![
                Dimension::frequency("FREQ"),
                Dimension::new("REF_AREA"),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![Attribute::new("TITLE", AttachmentLevel::Group)],
            vec![
                GroupDef::new("WHOLE", vec!["FREQ".into()]),
                GroupDef::new("PAIR", vec!["FREQ".into(), "REF_AREA".into()]),
            ],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap();

        let whole = GroupKey::new("WHOLE")
            .with_value("FREQ", "M")
            .with_attribute("TITLE", "X");
        let pair = GroupKey::new("PAIR")
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE")
            .with_attribute("TITLE", "Y");
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        series.add_observation(Observation::new("2020-01", "5"));

        let out = pivot_to_xs(dsd, PivotOptions::default(), &[whole, pair], &[series]);

        // The record matches both groups; PAIR is the more specific and
        // later declaration, so its attribute value lands.
        assert_eq!(out.groups.len(), 1);
        assert_eq!(
            out.groups[0].attributes.get("TITLE").map(String::as_str),
            Some("Y")
        );
    }

    #[test]
    fn test_xs_dataset_level_attribute_survives() {
        // Series-attached in the canonical shape, dataset-attached in the
        // cross shape: the value must move to the dataset element and
        // come back onto the series on the return trip.
        let dsd = DataStructure::new(
            "DSD_XS_DS",
            vec![
                Dimension::frequency("FREQ"),
                Dimension::new("REF_AREA"),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![Attribute::new("UNIT", AttachmentLevel::Series).at(XsLevel::DataSet)],
            vec![],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap();

        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE")
            .with_attribute("UNIT", "EUR");
        series.add_observation(Observation::new("2020-01", "5"));

        let xs = pivot_to_xs(dsd.clone(), PivotOptions::default(), &[], &[series]);
        assert_eq!(
            xs.dataset_attributes.get("UNIT").map(String::as_str),
            Some("EUR")
        );
        let section = &xs.groups[0].sections[0];
        assert!(!section.attributes.contains_key("UNIT"));

        let mut writer = TimeSeriesWriter::new(
            dsd,
            PivotOptions::default(),
            CollectedTimeSeries::default(),
        )
        .unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&xs.dataset_attributes).unwrap();
        for group in &xs.groups {
            writer.write_xs_group(group).unwrap();
        }
        writer.close().unwrap();

        let ts = writer.into_output();
        assert_eq!(
            ts.series[0].attributes.get("UNIT").map(String::as_str),
            Some("EUR")
        );
    }

    #[test]
    fn test_observation_volume_triggers_pressure() {
        // A single section fat with observations must be visible to the
        // probe, not just the key count.
        let mut series = TimeseriesKey::new()
            .with_value("FREQ", "M")
            .with_value("REF_AREA", "DE");
        for month in 1..=6 {
            series.add_observation(Observation::new(format!("2020-{month:02}"), "1"));
        }

        let mut writer = CrossSectionalWriter::new(
            flat_dsd(),
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap()
        .with_probe(Box::new(KeyBudget(3)));
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        writer.write_series_key(&series).unwrap();

        assert!(matches!(
            writer.close(),
            Err(PivotError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_appended_observations_trigger_pressure_in_series_rebuild() {
        let mut section = crate::model::XsSection::new();
        for month in 1..=4 {
            section.add_observation(
                crate::model::XsObservation::new("STOCK", Some("1".into()))
                    .with_key("FREQ", "M")
                    .with_key("REF_AREA", "DE")
                    .with_key("TIME_PERIOD", format!("2020-{month:02}")),
            );
        }
        let mut group = XsGroup::new();
        group.add_section(section);

        let mut writer = TimeSeriesWriter::new(
            flat_dsd(),
            PivotOptions::default(),
            CollectedTimeSeries::default(),
        )
        .unwrap()
        .with_probe(Box::new(KeyBudget(2)));
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&BTreeMap::new()).unwrap();
        writer.write_xs_group(&group).unwrap();

        assert!(matches!(
            writer.close(),
            Err(PivotError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_explicit_dataset_attributes_win_over_record_slots() {
        let dsd = DataStructure::new(
            "DSD_DS",
            vec![
                Dimension::new("FREQ").at(XsLevel::Observation),
                Dimension::time("TIME_PERIOD"),
            ],
            "OBS_VALUE",
            vec![Attribute::new("SOURCE", AttachmentLevel::DataSet)],
            vec![],
            vec![CrossMeasure::new("STOCK", "OBS_VALUE")],
        )
        .unwrap();

        let mut series = TimeseriesKey::new().with_value("FREQ", "M");
        series.add_observation(Observation::new("2020-01", "5"));

        let mut attrs = BTreeMap::new();
        attrs.insert("SOURCE".to_string(), "ECB".to_string());
        let mut writer = CrossSectionalWriter::new(
            dsd,
            PivotOptions::default(),
            CollectedCrossSection::default(),
        )
        .unwrap();
        writer.write_header(&Header::default()).unwrap();
        writer.write_empty_dataset(&attrs).unwrap();
        writer.write_series_key(&series).unwrap();
        writer.close().unwrap();

        let out = writer.into_output();
        assert_eq!(
            out.dataset_attributes.get("SOURCE").map(String::as_str),
            Some("ECB")
        );
    }
}
