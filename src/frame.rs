//! Polars helpers shared by the pipeline stages.
//!
//! The three upstream datasets carry dozens of loosely typed columns whose set
//! changes between releases, so every stage works on a `DataFrame` and these
//! helpers cover the record conversion, renaming and joining they share.

use crate::error::{PipelineError, Result};
use crate::utils::normalize_name;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Storage type of a column. Serialised names follow the dtype names found in
/// previously saved type-schema files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int64", alias = "Int64")]
    Int,
    #[serde(rename = "float64")]
    Float,
    #[serde(rename = "datetime64[ns]")]
    DateTime,
    #[serde(rename = "string", alias = "object")]
    Text,
}

impl ColumnType {
    pub fn of(dtype: &DataType) -> ColumnType {
        match dtype {
            DataType::Boolean => ColumnType::Bool,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnType::Int,
            DataType::Float32 | DataType::Float64 => ColumnType::Float,
            DataType::Datetime(_, _) | DataType::Date => ColumnType::DateTime,
            _ => ColumnType::Text,
        }
    }

    pub fn dtype(self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::DateTime => DataType::Datetime(TimeUnit::Microseconds, None),
            ColumnType::Text => DataType::String,
        }
    }
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

/// The column `name`, or a schema-drift error naming `dataset`.
pub fn require<'a>(df: &'a DataFrame, name: &str, dataset: &str) -> Result<&'a Series> {
    match df.get_column_index(name) {
        Some(_) => Ok(df.column(name)?.as_materialized_series()),
        None => Err(PipelineError::drift(name, dataset)),
    }
}

/// Values of `name` in their string form; ids may arrive as numbers on one
/// side and strings on the other.
pub fn text_values(df: &DataFrame, name: &str, dataset: &str) -> Result<Vec<Option<String>>> {
    let s = require(df, name, dataset)?.cast(&DataType::String)?;
    Ok(s.str()?.into_iter().map(|v| v.map(str::to_string)).collect())
}

fn json_column(name: &str, values: &[&JsonValue]) -> Series {
    let name = PlSmallStr::from_str(name);
    let present = || values.iter().filter(|v| !v.is_null());
    if present().next().is_none() {
        return Series::full_null(name, values.len(), &DataType::String);
    }
    if present().all(|v| v.is_boolean()) {
        return Series::new(name, values.iter().map(|v| v.as_bool()).collect::<Vec<_>>());
    }
    if present().all(|v| v.is_i64()) {
        return Series::new(name, values.iter().map(|v| v.as_i64()).collect::<Vec<_>>());
    }
    if present().all(|v| v.is_number()) {
        return Series::new(name, values.iter().map(|v| v.as_f64()).collect::<Vec<_>>());
    }
    let text: Vec<Option<String>> = values
        .iter()
        .map(|v| match v {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect();
    Series::new(name, text)
}

/// Build a frame from JSON objects. The header is the union of keys in
/// first-seen order; absent keys become nulls and mixed columns become text.
pub fn from_records(records: &[Map<String, JsonValue>]) -> Result<DataFrame> {
    let mut names: Vec<&String> = Vec::new();
    let mut index: HashMap<&String, usize> = HashMap::new();
    for rec in records {
        for key in rec.keys() {
            if !index.contains_key(key) {
                index.insert(key, names.len());
                names.push(key);
            }
        }
    }
    let columns = names
        .iter()
        .map(|name| {
            let values: Vec<&JsonValue> = records
                .iter()
                .map(|rec| rec.get(name.as_str()).unwrap_or(&JsonValue::Null))
                .collect();
            json_column(name, &values).into()
        })
        .collect::<Vec<Column>>();
    Ok(DataFrame::new(columns)?)
}

/// One JSON object per row, nulls kept.
pub fn to_records(df: &DataFrame) -> Result<Vec<Map<String, JsonValue>>> {
    let mut buf = Vec::new();
    JsonWriter::new(&mut buf)
        .with_json_format(JsonFormat::JsonLines)
        .finish(&mut df.clone())?;
    let body = String::from_utf8_lossy(&buf);
    let records = body
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str::<Map<String, JsonValue>>)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// A constant column of `height` rows holding `value`.
pub fn constant(name: &str, value: &JsonValue, height: usize) -> Series {
    let values = vec![value; height];
    json_column(name, &values)
}

fn renamed<F>(df: &DataFrame, rename: F) -> Result<DataFrame>
where
    F: Fn(&str) -> String,
{
    let columns = df
        .get_columns()
        .iter()
        .map(|c| {
            let name = rename(c.name().as_str());
            c.as_materialized_series().clone().with_name(name.into()).into()
        })
        .collect::<Vec<Column>>();
    Ok(DataFrame::new(columns)?)
}

pub fn with_suffix(df: &DataFrame, suffix: &str) -> Result<DataFrame> {
    renamed(df, |c| format!("{c}{suffix}"))
}

/// Rename `from` to `to`; `false` when `from` is absent.
pub fn rename(df: &mut DataFrame, from: &str, to: &str) -> Result<bool> {
    if !has_column(df, from) {
        return Ok(false);
    }
    df.rename(from, to.into())?;
    Ok(true)
}

/// Drop duplicate rows, on `subset` or on the full row, keeping the first.
pub fn dedup(df: &DataFrame, subset: Option<&[String]>) -> Result<DataFrame> {
    Ok(df.unique_stable(subset, UniqueKeepStrategy::First, None)?)
}

fn join(left: DataFrame, right: DataFrame, left_on: &str, right_on: &str, how: JoinType) -> Result<DataFrame> {
    if !has_column(&left, left_on) {
        return Err(PipelineError::drift(left_on, "left side of join"));
    }
    if !has_column(&right, right_on) {
        return Err(PipelineError::drift(right_on, "right side of join"));
    }
    let args = JoinArgs::new(how).with_coalesce(JoinCoalesce::KeepColumns);
    let joined = left
        .lazy()
        .with_column(col(left_on).cast(DataType::String))
        .join(
            right.lazy().with_column(col(right_on).cast(DataType::String)),
            [col(left_on)],
            [col(right_on)],
            args,
        )
        .collect()?;
    Ok(joined)
}

/// Rows of `left` matched by `right`; both key columns are kept.
pub fn inner_join(left: DataFrame, right: DataFrame, left_on: &str, right_on: &str) -> Result<DataFrame> {
    join(left, right, left_on, right_on, JoinType::Inner)
}

/// Every row of `left`, with `right` attached where the keys match.
pub fn left_join(left: DataFrame, right: DataFrame, left_on: &str, right_on: &str) -> Result<DataFrame> {
    join(left, right, left_on, right_on, JoinType::Left)
}

/// Normalise every column name, then sort the header. Columns whose names
/// collide after normalisation are merged, earlier columns winning.
pub fn normalize_column_names(df: &DataFrame) -> Result<DataFrame> {
    let mut merged: Vec<(String, Series)> = Vec::new();
    for c in df.get_columns() {
        let name = normalize_name(c.name().as_str());
        let series = c.as_materialized_series();
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some((_, kept)) => {
                let other = series.cast(kept.dtype())?;
                *kept = kept.zip_with(&kept.is_not_null(), &other)?;
            }
            None => merged.push((name, series.clone())),
        }
    }
    merged.sort_by(|a, b| a.0.cmp(&b.0));
    let columns = merged
        .into_iter()
        .map(|(name, s)| s.with_name(name.into()).into())
        .collect::<Vec<Column>>();
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn text_at(df: &DataFrame, name: &str, row: usize) -> Option<String> {
        text_values(df, name, "test frame").unwrap().get(row).cloned().flatten()
    }

    pub(crate) fn float_at(df: &DataFrame, name: &str, row: usize) -> Option<f64> {
        let s = df.column(name).unwrap().as_materialized_series().cast(&DataType::Float64).unwrap();
        s.f64().unwrap().get(row)
    }

    fn record(v: JsonValue) -> Map<String, JsonValue> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn builds_from_heterogeneous_records() {
        let df = from_records(&[
            record(json!({"a": 1, "b": "x", "n": 2})),
            record(json!({"b": "y", "c": 2.5, "n": "deux"})),
        ])
        .unwrap();
        assert_eq!(column_names(&df), ["a", "b", "n", "c"]);
        assert_eq!(df.column("a").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("c").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("n").unwrap().dtype(), &DataType::String);
        assert_eq!(text_at(&df, "a", 1), None);
        assert_eq!(float_at(&df, "c", 1), Some(2.5));
        assert_eq!(to_records(&df).unwrap()[0]["b"], json!("x"));
    }

    #[test]
    fn inner_join_drops_unmatched_and_fans_out() {
        let left = df!("k" => [Some("a"), Some("b"), None], "l" => [1i64, 2, 3]).unwrap();
        let right = df!("key" => ["a", "a"], "r" => ["r1", "r2"]).unwrap();
        let joined = inner_join(left, right, "k", "key").unwrap();
        assert_eq!(joined.height(), 2);
        assert_eq!(column_names(&joined), ["k", "l", "key", "r"]);
    }

    #[test]
    fn left_join_keeps_unmatched_rows() {
        let left = df!("k" => ["a", "z"]).unwrap();
        let right = df!("id" => ["a"], "v" => [1i64]).unwrap();
        let joined = left_join(left, right, "k", "id").unwrap();
        assert_eq!(joined.height(), 2);
        assert_eq!(joined.column("v").unwrap().null_count(), 1);
    }

    #[test]
    fn join_keys_compare_as_strings() {
        let left = df!("k" => [42i64]).unwrap();
        let right = df!("id" => ["42"]).unwrap();
        assert_eq!(inner_join(left, right, "k", "id").unwrap().height(), 1);
    }

    #[test]
    fn join_on_missing_column_is_schema_drift() {
        let left = df!("k" => ["a"]).unwrap();
        let right = df!("id" => ["a"]).unwrap();
        let err = inner_join(left, right, "nope", "id").unwrap_err();
        assert!(matches!(err, PipelineError::SchemaDrift { .. }));
    }

    #[test]
    fn dedup_on_full_row_and_on_keys() {
        let df = df!(
            "id" => ["a", "a", "a", "b"],
            "v" => [Some(1i64), Some(1), Some(2), None]
        )
        .unwrap();
        assert_eq!(dedup(&df, None).unwrap().height(), 3);
        let by_id = dedup(&df, Some(["id".to_string()].as_slice())).unwrap();
        assert_eq!(by_id.height(), 2);
        assert_eq!(float_at(&by_id, "v", 0), Some(1.0));
    }

    #[test]
    fn normalizes_merges_and_sorts_header() {
        let df = df!(
            "Nom Commune_enedis" => ["PARIS"],
            "Adresse_enedis" => [None::<&str>],
            "adresse_enedis" => ["1 RUE A"]
        )
        .unwrap();
        let out = normalize_column_names(&df).unwrap();
        assert_eq!(column_names(&out), ["adresse_enedis", "nom_commune_enedis"]);
        assert_eq!(text_at(&out, "adresse_enedis", 0).as_deref(), Some("1 RUE A"));
    }

    #[test]
    fn suffixes_and_renames() {
        let df = df!("id" => ["x"], "label" => ["y"]).unwrap();
        let mut df = with_suffix(&df, "_ban").unwrap();
        assert_eq!(column_names(&df), ["id_ban", "label_ban"]);
        assert!(rename(&mut df, "id_ban", "id_BAN").unwrap());
        assert!(!rename(&mut df, "absent", "x").unwrap());
        assert!(has_column(&df, "id_BAN"));
    }

    #[test]
    fn constants_follow_the_json_type() {
        assert_eq!(constant("a", &json!("N/A"), 2).dtype(), &DataType::String);
        assert_eq!(constant("b", &json!(0), 2).dtype(), &DataType::Int64);
        assert_eq!(constant("c", &JsonValue::Null, 2).null_count(), 2);
    }

    #[test]
    fn maps_polars_dtypes() {
        assert_eq!(ColumnType::of(&DataType::Int32), ColumnType::Int);
        assert_eq!(ColumnType::of(&ColumnType::DateTime.dtype()), ColumnType::DateTime);
        assert_eq!(ColumnType::of(&DataType::String), ColumnType::Text);
    }
}
