//! Cross-sectional assembly: canonical (time-series) input to the
//! group → section → observation hierarchy.
//!
//! Ordered phases, each feeding the next through the buffering backend:
//!
//! 1. *Group attribute fold-in* - group-level attribute values are copied
//!    into every series record matching the group key.
//! 2. *Dataset-attribute extraction* - dataset-level attributes are read
//!    from the first enriched record and the dataset element is emitted.
//! 3. *Distinct key derivation* - one scan produces the sorted,
//!    deduplicated section-key and group-key files.
//! 4. *Hierarchical build* - batches of group keys are materialized in
//!    memory, sections and observations are attached by sorted-key
//!    matching, unmatched lines spill to the next pass.
//!
//! Every phase polls the memory probe and restarts from the top of the
//! current pass with a halved batch limit on pressure.

use std::collections::BTreeMap;

use log::debug;

use crate::buffer::{BufferMode, DoubleBuffer};
use crate::error::{PivotError, PivotResult};
use crate::model::{KeyTuple, XsGroup};
use crate::order::ComponentOrder;
use crate::record::{FlatRecord, RecordCodec};
use crate::structure::DataStructure;
use crate::pivot::CrossSectionalOutput;

use super::batch::BatchController;
use super::{xs_obs_time, PassStats, Projector};

const PHASE_FOLD: &str = "group attribute fold-in";
const PHASE_DATASET: &str = "dataset-attribute extraction";
const PHASE_KEYS: &str = "distinct key derivation";
const PHASE_BUILD: &str = "hierarchical build";

/// Run the full canonical → cross-sectional assembly against the records
/// accumulated by the façade.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble<O: CrossSectionalOutput>(
    dsd: &DataStructure,
    order: &ComponentOrder,
    delimiter: char,
    mode: BufferMode,
    records: &mut DoubleBuffer,
    group_records: &mut DoubleBuffer,
    dataset_attrs: &BTreeMap<String, String>,
    skip_slot_header: bool,
    ctrl: &mut BatchController,
    output: &mut O,
) -> PivotResult<PassStats> {
    let codec = RecordCodec::new(order, delimiter);
    let proj = Projector::new(dsd, order);
    let mut stats = PassStats::default();

    if skip_slot_header {
        strip_header(&mut stats, records)?;
    }

    fold_in(&proj, &codec, records, group_records, ctrl, &mut stats)?;
    extract_dataset(&proj, &codec, records, dataset_attrs, output)?;

    let (mut group_keys, mut section_keys) =
        derive_keys(&proj, &codec, records, mode, ctrl, &mut stats)?;
    let built = build_hierarchy(
        dsd,
        &proj,
        &codec,
        records,
        &mut group_keys,
        &mut section_keys,
        ctrl,
        output,
        &mut stats,
    );
    group_keys.dispose();
    section_keys.dispose();
    built?;

    debug!(
        "cross-sectional assembly done: {} passes, {} keys, {} spilled lines",
        stats.passes, stats.keys, stats.spilled
    );
    Ok(stats)
}

/// Drop the slot → concept header line the façade wrote on request.
fn strip_header(stats: &mut PassStats, records: &mut DoubleBuffer) -> PivotResult<()> {
    {
        let (current, next) = records.split();
        let mut reader = current.open_reader(PHASE_FOLD)?;
        let _ = reader.next();
        for line in reader {
            next.write_line(&line?, PHASE_FOLD)?;
        }
    }
    records.swap(PHASE_FOLD)?;
    stats.add_pass(0, 0);
    Ok(())
}

// =============================================================================
// Phase 1: group attribute fold-in
// =============================================================================

fn fold_in(
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    group_records: &mut DoubleBuffer,
    ctrl: &mut BatchController,
    stats: &mut PassStats,
) -> PivotResult<()> {
    if proj.group_defs().is_empty() || group_records.current().line_count() == 0 {
        return Ok(());
    }

    loop {
        let (loaded, spilled) = loop {
            match fold_pass(proj, codec, records, group_records, ctrl) {
                Err(PivotError::MemoryPressure(_)) => {
                    ctrl.shrink(PHASE_FOLD)?;
                    records.reset_next(PHASE_FOLD)?;
                    group_records.reset_next(PHASE_FOLD)?;
                }
                other => break other?,
            }
        };
        records.swap(PHASE_FOLD)?;
        group_records.swap(PHASE_FOLD)?;
        stats.add_pass(loaded, spilled);
        if loaded < ctrl.limit() {
            return Ok(());
        }
    }
}

fn fold_pass(
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    group_records: &mut DoubleBuffer,
    ctrl: &BatchController,
) -> PivotResult<(usize, u64)> {
    let limit = ctrl.limit();
    let mut batch: BTreeMap<(String, KeyTuple), FlatRecord> = BTreeMap::new();
    let mut spilled: u64 = 0;

    {
        let (current, next) = group_records.split();
        for line in current.open_reader(PHASE_FOLD)? {
            let line = line?;
            // Group-record lines carry the declared group's id as a
            // leading field, ahead of the flat record.
            let Some((group_id, rest)) = line.split_once(codec.delimiter()) else {
                debug!("group record carries no group id, dropped");
                continue;
            };
            let Some((_, dim_slots)) = proj.group_defs().iter().find(|(id, _)| id == group_id)
            else {
                debug!("group record names undeclared group '{group_id}', dropped");
                continue;
            };
            let record = codec.from_line(rest)?;
            let key = (group_id.to_string(), proj.tuple(&record, dim_slots));
            if batch.contains_key(&key) {
                continue;
            }
            if batch.len() >= limit {
                next.write_line(&line, PHASE_FOLD)?;
                spilled += 1;
                continue;
            }
            batch.insert(key, record);
            ctrl.poll(batch.len(), PHASE_FOLD)?;
        }
    }

    // Stream the series records, copying matched group attribute slots.
    {
        let (current, next) = records.split();
        for line in current.open_reader(PHASE_FOLD)? {
            let mut record = codec.from_line(&line?)?;
            for (group_id, dim_slots) in proj.group_defs() {
                let key = (group_id.clone(), proj.tuple(&record, dim_slots));
                if let Some(group_record) = batch.get(&key) {
                    for slot in proj.group_attr_slots() {
                        if let Some(value) = group_record.get(*slot) {
                            record.set(*slot, Some(value.to_string()))?;
                        }
                    }
                }
            }
            next.write_line(&codec.to_line(&record), PHASE_FOLD)?;
        }
    }

    Ok((batch.len(), spilled))
}

// =============================================================================
// Phase 2: dataset-attribute extraction
// =============================================================================

fn extract_dataset<O: CrossSectionalOutput>(
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
    // Attributes supplied explicitly at the façade win over record slots.
    for (concept, value) in explicit {
        attrs.insert(concept.clone(), value.clone());
    }
    output.write_dataset(&attrs)
}

// =============================================================================
// Phase 3: distinct key derivation
// =============================================================================

fn derive_keys(
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    mode: BufferMode,
    ctrl: &mut BatchController,
    stats: &mut PassStats,
) -> PivotResult<(DoubleBuffer, DoubleBuffer)> {
    let mut group_keys = DoubleBuffer::create(mode, PHASE_KEYS)?;
    derive_set(
        codec,
        records,
        &mut group_keys,
        ctrl,
        stats,
        |r| proj.group_tuple(r),
        |r, w| proj.group_record(r, w),
    )?;

    let mut section_keys = DoubleBuffer::create(mode, PHASE_KEYS)?;
    derive_set(
        codec,
        records,
        &mut section_keys,
        ctrl,
        stats,
        |r| proj.section_tuple(r),
        |r, w| proj.section_record(r, w),
    )?;

    Ok((group_keys, section_keys))
}

/// Emit every distinct key of one projection, ascending, into `keys_out`.
///
/// Each round rescans the records and keeps the `limit` smallest keys
/// above the previous round's watermark, so memory stays bounded without
/// consuming the records buffer (phase 4 still needs it).
fn derive_set<K, P>(
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    keys_out: &mut DoubleBuffer,
    ctrl: &mut BatchController,
    stats: &mut PassStats,
    key_of: K,
    project: P,
) -> PivotResult<()>
where
    K: Fn(&FlatRecord) -> KeyTuple,
    P: Fn(&FlatRecord, usize) -> FlatRecord,
{
    let mut watermark: Option<KeyTuple> = None;

    loop {
        let (batch, overflowed) = loop {
            match derive_round(codec, records, ctrl, watermark.as_ref(), &key_of, &project) {
                Err(PivotError::MemoryPressure(_)) => {
                    ctrl.shrink(PHASE_KEYS)?;
                }
                other => break other?,
            }
        };

        for record in batch.values() {
            keys_out.current().write_line(&codec.to_line(record), PHASE_KEYS)?;
        }
        stats.add_pass(batch.len(), 0);
        if !overflowed {
            return Ok(());
        }
        watermark = batch.keys().next_back().cloned().or(watermark);
    }
}

#[allow(clippy::type_complexity)]
fn derive_round<K, P>(
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    ctrl: &BatchController,
    watermark: Option<&KeyTuple>,
    key_of: &K,
    project: &P,
) -> PivotResult<(BTreeMap<KeyTuple, FlatRecord>, bool)>
where
    K: Fn(&FlatRecord) -> KeyTuple,
    P: Fn(&FlatRecord, usize) -> FlatRecord,
{
    let limit = ctrl.limit();
    let width = codec.order().len();
    let mut batch: BTreeMap<KeyTuple, FlatRecord> = BTreeMap::new();
    let mut overflowed = false;

    for line in records.current().open_reader(PHASE_KEYS)? {
        let record = codec.from_line(&line?)?;
        let key = key_of(&record);
        if watermark.is_some_and(|w| key <= *w) || batch.contains_key(&key) {
            continue;
        }
        if batch.len() >= limit {
            overflowed = true;
            // Keep only the `limit` smallest keys of this round; larger
            // ones come back in a later round.
            let beyond_batch = batch.keys().next_back().is_some_and(|last| key > *last);
            if !beyond_batch {
                batch.pop_last();
                batch.insert(key, project(&record, width));
            }
            continue;
        }
        batch.insert(key, project(&record, width));
        ctrl.poll(batch.len(), PHASE_KEYS)?;
    }

    Ok((batch, overflowed))
}

// =============================================================================
// Phase 4: hierarchical build
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn build_hierarchy<O: CrossSectionalOutput>(
    dsd: &DataStructure,
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    group_keys: &mut DoubleBuffer,
    section_keys: &mut DoubleBuffer,
    ctrl: &mut BatchController,
    output: &mut O,
    stats: &mut PassStats,
) -> PivotResult<()> {
    let time_concept = dsd.time_dimension().map(|d| d.id.clone());

    loop {
        let (batch_count, spilled, groups) = loop {
            match build_pass(dsd, proj, codec, records, group_keys, section_keys, ctrl, time_concept.as_deref()) {
                Err(PivotError::MemoryPressure(_)) => {
                    ctrl.shrink(PHASE_BUILD)?;
                    records.reset_next(PHASE_BUILD)?;
                    group_keys.reset_next(PHASE_BUILD)?;
                    section_keys.reset_next(PHASE_BUILD)?;
                }
                other => break other?,
            }
        };

        // Ordered map: groups leave in ascending key order.
        for group in groups.values() {
            output.write_group(group)?;
        }

        records.swap(PHASE_BUILD)?;
        group_keys.swap(PHASE_BUILD)?;
        section_keys.swap(PHASE_BUILD)?;
        stats.add_pass(batch_count, spilled);

        if batch_count < ctrl.limit() {
            return Ok(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_pass(
    dsd: &DataStructure,
    proj: &Projector,
    codec: &RecordCodec<'_>,
    records: &mut DoubleBuffer,
    group_keys: &mut DoubleBuffer,
    section_keys: &mut DoubleBuffer,
    ctrl: &BatchController,
    time_concept: Option<&str>,
) -> PivotResult<(usize, u64, BTreeMap<KeyTuple, XsGroup>)> {
    let limit = ctrl.limit();
    let mut groups: BTreeMap<KeyTuple, XsGroup> = BTreeMap::new();
    let mut spilled: u64 = 0;

    // Batch of distinct group keys.
    {
        let (current, next) = group_keys.split();
        for line in current.open_reader(PHASE_BUILD)? {
            let line = line?;
            let record = codec.from_line(&line)?;
            let key = proj.group_tuple(&record);
            if groups.contains_key(&key) {
                continue;
            }
            if groups.len() >= limit {
                next.write_line(&line, PHASE_BUILD)?;
                spilled += 1;
                continue;
            }
            groups.insert(key, proj.build_xs_group(&record, codec.order()));
            ctrl.poll(groups.len(), PHASE_BUILD)?;
        }
    }

    // Attach sections belonging to batched groups; spill the rest.
    let mut sections: BTreeMap<KeyTuple, (KeyTuple, usize)> = BTreeMap::new();
    {
        let (current, next) = section_keys.split();
        for line in current.open_reader(PHASE_BUILD)? {
            let line = line?;
            let record = codec.from_line(&line)?;
            let group_key = proj.group_tuple(&record);
            match groups.get_mut(&group_key) {
                Some(group) => {
                    let section_key = proj.section_tuple(&record);
                    if sections.contains_key(&section_key) {
                        continue;
                    }
                    group.add_section(proj.build_xs_section(&record, codec.order()));
                    sections.insert(section_key, (group_key, group.sections.len() - 1));
                    ctrl.poll(groups.len() + sections.len(), PHASE_BUILD)?;
                }
                None => {
                    next.write_line(&line, PHASE_BUILD)?;
                    spilled += 1;
                }
            }
        }
    }

    // Attach observations to batched sections; spill the rest. Attached
    // observations count toward the probe poll: a section fat with
    // observations costs memory just like extra keys do.
    {
        let mut attached: usize = 0;
        let (current, next) = records.split();
        for line in current.open_reader(PHASE_BUILD)? {
            let line = line?;
            let record = codec.from_line(&line)?;
            match sections.get(&proj.section_tuple(&record)) {
                Some((group_key, index)) => {
                    let obs = proj.build_xs_observation(&record, codec, dsd)?;
                    if let Some(group) = groups.get_mut(group_key) {
                        group.sections[*index].add_observation(obs);
                    }
                    attached += 1;
                    ctrl.poll(groups.len() + sections.len() + attached, PHASE_BUILD)?;
                }
                None => {
                    next.write_line(&line, PHASE_BUILD)?;
                    spilled += 1;
                }
            }
        }
    }

    // Ascending time order inside every section; stable for equal times.
    for group in groups.values_mut() {
        for section in &mut group.sections {
            section
                .observations
                .sort_by(|a, b| xs_obs_time(a, time_concept).cmp(&xs_obs_time(b, time_concept)));
        }
    }

    Ok((groups.len(), spilled, groups))
}
