//! Two-stage join of the three sources.
//!
//! Stage 1 joins consumption rows to geocoded addresses and stages the result;
//! stage 2 reads it back and attaches it to the energy-performance rows. The
//! staged artifact is what a resumed run starts from.

use crate::client::ADEME_BAN_FIELD;
use crate::error::{PipelineError, Result};
use crate::frame;
use crate::services::consumption::FULL_ADDRESS_COLUMN;
use crate::services::enrichment::ADEME_SUFFIX;
use crate::storage::BlobStore;
use log::info;
use polars::prelude::*;
use std::collections::HashSet;

pub const ENEDIS_SUFFIX: &str = "_enedis";
pub const BAN_SUFFIX: &str = "_ban";
/// Canonical address-identifier column of the stage-1 output.
pub const ID_BAN_COLUMN: &str = "id_BAN";

fn upper_key(df: &mut DataFrame, name: &str, dataset: &str) -> Result<()> {
    let upper: Vec<Option<String>> = frame::text_values(df, name, dataset)?
        .into_iter()
        .map(|v| v.map(|k| k.to_uppercase()))
        .collect();
    df.with_column(Series::new(name.into(), upper))?;
    Ok(())
}

/// Inner join on the full address, stage the result under `(dir, name)` and
/// return the distinct address identifiers. Both inputs are consumed.
pub fn stage_one(
    consumption: DataFrame,
    geocoded: DataFrame,
    store: &dyn BlobStore,
    dir: &str,
    name: &str,
) -> Result<Vec<String>> {
    let mut consumption = frame::with_suffix(&consumption, ENEDIS_SUFFIX)?;
    let mut geocoded = frame::with_suffix(&geocoded, BAN_SUFFIX)?;
    let left_on = format!("{FULL_ADDRESS_COLUMN}{ENEDIS_SUFFIX}");
    let right_on = format!("{FULL_ADDRESS_COLUMN}{BAN_SUFFIX}");
    upper_key(&mut consumption, &left_on, "consumption records")?;
    upper_key(&mut geocoded, &right_on, "geocoded addresses")?;

    let mut joined = frame::inner_join(consumption, geocoded, &left_on, &right_on)?;
    let id_column = format!("id{BAN_SUFFIX}");
    if !frame::rename(&mut joined, &id_column, ID_BAN_COLUMN)? {
        return Err(PipelineError::drift(id_column, "geocoded addresses"));
    }
    if joined.height() == 0 {
        return Err(PipelineError::EmptyResult { stage: "address join" });
    }
    info!(
        "Reconcile: stage 1 joined {} row(s) x {} column(s)",
        joined.height(),
        joined.width()
    );

    store.save(dir, name, &joined)?;
    let ids = staged_ids(&joined)?;
    drop(joined);
    Ok(ids)
}

/// Distinct non-null identifiers of a stage-1 table, first-seen order.
pub fn staged_ids(staged: &DataFrame) -> Result<Vec<String>> {
    let values = frame::text_values(staged, ID_BAN_COLUMN, "staged address join")?;
    let mut seen = HashSet::new();
    Ok(values
        .into_iter()
        .flatten()
        .filter(|id| seen.insert(id.clone()))
        .collect())
}

/// Left join energy-performance rows to the staged stage-1 table, then
/// deduplicate and normalise the header. The unified table is saved under
/// `(silver_dir, silver_name)`.
pub fn stage_two(
    enrichment: &DataFrame,
    store: &dyn BlobStore,
    bronze_dir: &str,
    staged_name: &str,
    silver_dir: &str,
    silver_name: &str,
) -> Result<DataFrame> {
    let staged = store.load(bronze_dir, staged_name)?;
    let left_on = format!("{ADEME_BAN_FIELD}{ADEME_SUFFIX}");
    if !frame::has_column(enrichment, &left_on) {
        return Err(PipelineError::drift(left_on, "energy-performance records"));
    }
    if !frame::has_column(&staged, ID_BAN_COLUMN) {
        return Err(PipelineError::drift(ID_BAN_COLUMN, "staged address join"));
    }

    let joined = frame::left_join(enrichment.clone(), staged, &left_on, ID_BAN_COLUMN)?;
    let unified = frame::normalize_column_names(&frame::dedup(&joined, None)?)?;
    drop(joined);
    info!(
        "Reconcile: stage 2 produced {} row(s) x {} column(s)",
        unified.height(),
        unified.width()
    );
    store.save(silver_dir, silver_name, &unified)?;
    Ok(unified)
}
