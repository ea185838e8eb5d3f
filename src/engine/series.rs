//! Time-series assembly: cross-sectional input back to canonical
//! groups and series.
//!
//! Mirrors the cross-sectional build: each pass collects up to the batch
//! limit of distinct series keys into an ordered map, records observations
//! against the matching series, derives group keys from the same records,
//! spills everything else to the paired buffer, emits matched groups then
//! series in ascending key order, and swaps - until a pass spills nothing.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::buffer::DoubleBuffer;
use crate::error::{PivotError, PivotResult};
use crate::model::{GroupKey, KeyTuple, TimeseriesKey};
use crate::order::ComponentOrder;
use crate::record::RecordCodec;
use crate::structure::DataStructure;
use crate::pivot::TimeSeriesOutput;

use super::batch::BatchController;
use super::{PassStats, Projector};

const PHASE_DATASET: &str = "dataset-attribute extraction";
const PHASE_SERIES: &str = "series assembly";

/// Run the full cross-sectional → canonical assembly against the records
/// accumulated by the façade.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble<O: TimeSeriesOutput>(
    dsd: &DataStructure,
    order: &ComponentOrder,
    delimiter: char,
    records: &mut DoubleBuffer,
    dataset_attrs: &BTreeMap<String, String>,
    skip_slot_header: bool,
    ctrl: &mut BatchController,
    output: &mut O,
) -> PivotResult<PassStats> {
    let codec = RecordCodec::new(order, delimiter);
    let proj = Projector::new(dsd, order);
    let mut stats = PassStats::default();

    if skip_slot_header {
        strip_header(records)?;
    }

    extract_dataset(&proj, &codec, records, dataset_attrs, output)?;

    // Group keys already emitted in an earlier pass; a group shared by
    // series keys from different batches must still leave only once.
    let mut emitted_groups: BTreeSet<(String, KeyTuple)> = BTreeSet::new();

    loop {
        let (matched, spilled, groups, series) = loop {
            match series_pass(&proj, &codec, records, ctrl) {
                Err(PivotError::MemoryPressure(_)) => {
                    ctrl.shrink(PHASE_SERIES)?;
                    records.reset_next(PHASE_SERIES)?;
                }
                other => break other?,
            }
        };

        for ((group_id, key), group) in &groups {
            if emitted_groups.insert((group_id.clone(), key.clone())) {
                output.write_group(group)?;
            }
        }
        for series in series.values() {
            output.write_series(series)?;
        }

        records.swap(PHASE_SERIES)?;
        stats.add_pass(matched, spilled);
        if spilled == 0 {
            break;
        }
    }

    debug!(
        "time-series assembly done: {} passes, {} keys, {} spilled lines",
        stats.passes, stats.keys, stats.spilled
    );
    Ok(stats)
}

fn strip_header(records: &mut DoubleBuffer) -> PivotResult<()> {
    {
        let (current, next) = records.split();
        let mut reader = current.open_reader(PHASE_SERIES)?;
        let _ = reader.next();
        for line in reader {
            next.write_line(&line?, PHASE_SERIES)?;
        }
    }
    records.swap(PHASE_SERIES)?;
    Ok(())
}

fn extract_dataset<O: TimeSeriesOutput>(
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    explicit: &BTreeMap<String, String>,
    output: &mut O,
) -> PivotResult<()> {
    let mut attrs = {
        let mut reader = records.current().open_reader(PHASE_DATASET)?;
        match reader.next() {
            None => BTreeMap::new(),
            Some(line) => {
                let record = codec.from_line(&line?)?;
                proj.dataset_attrs(&record, codec.order())
            }
        }
    };
    for (concept, value) in explicit {
        attrs.insert(concept.clone(), value.clone());
    }
    output.write_dataset(&attrs)
}

type PassOutcome = (
    usize,
    u64,
    BTreeMap<(String, KeyTuple), GroupKey>,
    BTreeMap<KeyTuple, TimeseriesKey>,
);

fn series_pass(
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    ctrl: &BatchController,
) -> PivotResult<PassOutcome> {
    let limit = ctrl.limit();
    let mut series: BTreeMap<KeyTuple, TimeseriesKey> = BTreeMap::new();
    let mut groups: BTreeMap<(String, KeyTuple), GroupKey> = BTreeMap::new();
    let mut spilled: u64 = 0;
    // Observations held in memory this pass; appended ones cost memory
    // just like new keys, so the probe sees them too.
    let mut attached: usize = 0;

    {
        let (current, next) = records.split();
        for line in current.open_reader(PHASE_SERIES)? {
            let line = line?;
            let record = codec.from_line(&line)?;
            let key = proj.series_tuple(&record);

            if let Some(matched) = series.get_mut(&key) {
                matched.add_observation(proj.build_ts_observation(&record, codec));
                attached += 1;
                ctrl.poll(series.len() + groups.len() + attached, PHASE_SERIES)?;
                continue;
            }
            if series.len() >= limit {
                next.write_line(&line, PHASE_SERIES)?;
                spilled += 1;
                continue;
            }

            let mut new_series = proj.build_series(&record, codec.order());
            new_series.add_observation(proj.build_ts_observation(&record, codec));
            series.insert(key, new_series);
            attached += 1;

            // Group keys ride along on every record; derive them from the
            // records that opened a series in this batch.
            for (group_id, dim_slots) in proj.group_defs() {
                if proj.complete(&record, dim_slots) {
                    let group_key = (group_id.clone(), proj.tuple(&record, dim_slots));
                    groups.entry(group_key).or_insert_with(|| {
                        proj.build_group_key(&record, group_id, dim_slots, codec.order())
                    });
                }
            }

            ctrl.poll(series.len() + groups.len() + attached, PHASE_SERIES)?;
        }
    }

    // Ascending time order per series; stable for equal times.
    for s in series.values_mut() {
        s.observations.sort_by(|a, b| a.time.cmp(&b.time));
    }

    Ok((series.len(), spilled, groups, series))
}
