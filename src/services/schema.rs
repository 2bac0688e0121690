//! Column typing, numeric imputation and the split into entity tables.

use crate::error::{PipelineError, Result};
use crate::frame::{self, ColumnType};
use crate::utils::extract_digits;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use polars::prelude::*;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Column name -> storage type, as persisted next to the silver data.
pub type TypeSchema = BTreeMap<String, ColumnType>;

pub const TARGET_MWH_COLUMN: &str = "consommation_annuelle_moyenne_par_logement_de_l_adresse_mwh_enedis";
pub const TARGET_KWH_COLUMN: &str = "consommation_annuelle_moyenne_par_logement_de_l_adresse_kwh_enedis";
pub const DISTRICT_COLUMN: &str = "district_ban";
pub const ARRONDISSEMENT_COLUMN: &str = "arrondissement";
pub const ADRESSES_SECTION: &str = "schema-adresses";
pub const LOGEMENTS_SECTION: &str = "schema-logements";
const UNSET_DEFAULT: &str = "N/C";
const BUNDLED_GOLDEN_CONFIG: &str = include_str!("../../resources/schemas/schema_golden_data.json");

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Cells as trimmed text; blank cells are null.
fn trimmed_text(s: &Series) -> Result<Vec<Option<String>>> {
    let text = s.cast(&DataType::String)?;
    Ok(text
        .str()?
        .into_iter()
        .map(|v| v.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string))
        .collect())
}

/// Text cells with the decimal comma of the batch files swapped for a point.
fn decimal_text(s: &Series) -> Result<Series> {
    let values: Vec<Option<String>> = trimmed_text(s)?
        .into_iter()
        .map(|v| v.map(|t| t.replace(',', ".")))
        .collect();
    Ok(Series::new(s.name().clone(), values))
}

type ColumnParser = fn(&Series) -> Option<ColumnType>;

/// Tried in order on text columns; the first that accepts every value wins,
/// text otherwise.
const CASCADE: [(&str, ColumnParser); 2] = [("numeric", numeric_column), ("datetime", datetime_column)];

/// Integers stay integers only when the column has no gaps.
fn numeric_column(s: &Series) -> Option<ColumnType> {
    let text = decimal_text(s).ok()?;
    if text.null_count() == 0 && text.strict_cast(&DataType::Int64).is_ok() {
        return Some(ColumnType::Int);
    }
    let floats = text.strict_cast(&DataType::Float64).ok()?;
    let finite = floats.f64().ok()?.into_iter().flatten().all(f64::is_finite);
    finite.then_some(ColumnType::Float)
}

fn datetime_column(s: &Series) -> Option<ColumnType> {
    let text = trimmed_text(s).ok()?;
    let mut present = text.iter().flatten().peekable();
    present.peek()?;
    present
        .all(|v| parse_datetime(v).is_some())
        .then_some(ColumnType::DateTime)
}

/// Per-column types: text columns go through the cast cascade, typed
/// columns keep their type (integers with gaps become floats).
pub fn infer_schema(table: &DataFrame) -> TypeSchema {
    let mut schema = TypeSchema::new();
    for c in table.get_columns() {
        let s = c.as_materialized_series();
        let ty = match ColumnType::of(s.dtype()) {
            ColumnType::Text => CASCADE
                .iter()
                .find_map(|(label, parse)| {
                    let ty = parse(s)?;
                    debug!("Schema: `{}` cast as {}", s.name(), label);
                    Some(ty)
                })
                .unwrap_or(ColumnType::Text),
            ColumnType::Int if s.null_count() > 0 => ColumnType::Float,
            other => other,
        };
        schema.insert(s.name().to_string(), ty);
    }
    schema
}

fn as_floats(s: &Series) -> Result<Vec<Option<f64>>> {
    let floats = if s.dtype() == &DataType::String {
        decimal_text(s)?.cast(&DataType::Float64)?
    } else {
        s.cast(&DataType::Float64)?
    };
    Ok(floats.f64()?.into_iter().collect())
}

/// Convert `s` to `ty`; cells that do not convert become null.
pub fn coerce(s: &Series, ty: ColumnType) -> Result<Series> {
    let name = s.name().clone();
    let out = match ty {
        ColumnType::Text => s.cast(&DataType::String)?,
        ColumnType::Float => Series::new(name, as_floats(s)?),
        ColumnType::Int => {
            let ints: Vec<Option<i64>> = as_floats(s)?
                .into_iter()
                .map(|v| v.filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64))
                .collect();
            Series::new(name, ints)
        }
        ColumnType::DateTime => match s.dtype() {
            DataType::Datetime(_, _) | DataType::Date => s.cast(&ty.dtype())?,
            _ => {
                let micros: Vec<Option<i64>> = trimmed_text(s)?
                    .into_iter()
                    .map(|v| v.and_then(|t| parse_datetime(&t)).map(|dt| dt.and_utc().timestamp_micros()))
                    .collect();
                Series::new(name, micros).cast(&ty.dtype())?
            }
        },
        ColumnType::Bool => match s.dtype() {
            DataType::Boolean => s.clone(),
            _ => {
                let flags: Vec<Option<bool>> = trimmed_text(s)?
                    .into_iter()
                    .map(|v| match v.map(|t| t.to_ascii_lowercase()).as_deref() {
                        Some("true" | "1") => Some(true),
                        Some("false" | "0") => Some(false),
                        _ => None,
                    })
                    .collect();
                Series::new(name, flags)
            }
        },
    };
    Ok(out)
}

/// Coerce every column named in `schema`; other columns are left alone.
pub fn apply_schema(table: &mut DataFrame, schema: &TypeSchema) -> Result<()> {
    for (name, ty) in schema {
        if !frame::has_column(table, name) {
            continue;
        }
        let typed = coerce(table.column(name)?.as_materialized_series(), *ty)?;
        table.with_column(typed)?;
    }
    Ok(())
}

pub fn save_type_schema(path: &Path, schema: &TypeSchema) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(schema)?)?;
    info!("Schema: saved {} column type(s) to {}", schema.len(), path.display());
    Ok(())
}

pub fn load_type_schema(path: &Path) -> Result<TypeSchema> {
    let raw = fs::read_to_string(path).map_err(|e| PipelineError::storage(path.display().to_string(), e))?;
    let de = &mut serde_json::Deserializer::from_str(&raw);
    serde_path_to_error::deserialize(de).map_err(|e| {
        PipelineError::Configuration(format!(
            "type schema {} invalid at `{}`: {}",
            path.display(),
            e.path(),
            e.inner()
        ))
    })
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImputationReport {
    pub mean: Vec<String>,
    pub median: Vec<String>,
}

/// Value used to fill the gaps of a float column: the median when any
/// observation falls outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`, the mean otherwise.
pub fn imputation_value(values: &[f64]) -> Result<Option<(f64, bool)>> {
    let ca = Float64Chunked::from_vec("values".into(), values.to_vec());
    let q1 = ca.quantile(0.25, QuantileMethod::Linear)?;
    let q3 = ca.quantile(0.75, QuantileMethod::Linear)?;
    let (Some(q1), Some(q3)) = (q1, q3) else {
        return Ok(None);
    };
    let iqr = q3 - q1;
    let (low, high) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
    if values.iter().any(|v| *v < low || *v > high) {
        Ok(ca.median().map(|m| (m, true)))
    } else {
        Ok(ca.mean().map(|m| (m, false)))
    }
}

/// Fill the gaps (nulls and NaN) of every float column.
pub fn fill_missing_floats(table: &mut DataFrame) -> Result<ImputationReport> {
    let mut report = ImputationReport::default();
    let float_columns: Vec<String> = table
        .get_columns()
        .iter()
        .filter(|c| ColumnType::of(c.dtype()) == ColumnType::Float)
        .map(|c| c.name().to_string())
        .collect();
    for name in float_columns {
        let series = table.column(&name)?.as_materialized_series().cast(&DataType::Float64)?;
        let values: Vec<Option<f64>> = series.f64()?.into_iter().map(|v| v.filter(|f| !f.is_nan())).collect();
        if values.iter().all(Option::is_some) {
            continue;
        }
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        let Some((fill, by_median)) = imputation_value(&present)? else {
            continue;
        };
        let filled: Vec<f64> = values.into_iter().map(|v| v.unwrap_or(fill)).collect();
        table.with_column(Series::new(name.as_str().into(), filled))?;
        if by_median {
            report.median.push(name);
        } else {
            report.mean.push(name);
        }
    }
    Ok(report)
}

/// Annual consumption per dwelling in kWh; the MWh column is dropped. A
/// missing source column yields zeros.
pub fn compute_target(table: &mut DataFrame) -> Result<()> {
    if !frame::has_column(table, TARGET_MWH_COLUMN) {
        warn!("Schema: `{}` absent, target defaults to 0", TARGET_MWH_COLUMN);
        let zeros = frame::constant(TARGET_MWH_COLUMN, &JsonValue::from(0), table.height());
        table.with_column(zeros)?;
    }
    let mwh = table.column(TARGET_MWH_COLUMN)?.as_materialized_series().cast(&DataType::Float64)?;
    let kwh: Vec<Option<f64>> = mwh.f64()?.into_iter().map(|v| v.map(|m| m * 1000.0)).collect();
    table.with_column(Series::new(TARGET_KWH_COLUMN.into(), kwh))?;
    table.drop_in_place(TARGET_MWH_COLUMN)?;
    Ok(())
}

/// Digits of the district name (`"Paris 15e Arrondissement"` -> `"15"`), `"N/A"`
/// when the geocoder gave no district column.
pub fn compute_arrondissement(table: &mut DataFrame) -> Result<()> {
    let values: Vec<String> = if frame::has_column(table, DISTRICT_COLUMN) {
        let district = frame::text_values(table, DISTRICT_COLUMN, "unified dataset")?;
        table.drop_in_place(DISTRICT_COLUMN)?;
        district
            .into_iter()
            .map(|v| v.map(|d| extract_digits(&d)).unwrap_or_default())
            .collect()
    } else {
        vec!["N/A".to_string(); table.height()]
    };
    table.with_column(Series::new(ARRONDISSEMENT_COLUMN.into(), values))?;
    Ok(())
}

fn unset_default() -> JsonValue {
    JsonValue::String(UNSET_DEFAULT.to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    #[serde(default = "unset_default")]
    pub default: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub cols: BTreeMap<String, ColumnSpec>,
}

/// Entity-table column configuration: section name -> columns and defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct GoldenConfig {
    sections: HashMap<String, EntitySchema>,
}

impl GoldenConfig {
    pub fn from_json(raw: &str, origin: &str) -> Result<Self> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        serde_path_to_error::deserialize(de).map_err(|e| {
            PipelineError::Configuration(format!("column config {} invalid at `{}`: {}", origin, e.path(), e.inner()))
        })
    }

    /// Read `path`, falling back to the configuration bundled in the binary.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw, &path.display().to_string()),
            Err(e) => {
                info!(
                    "Schema: {} unreadable ({}), using the bundled column config",
                    path.display(),
                    e
                );
                Self::bundled()
            }
        }
    }

    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_GOLDEN_CONFIG, "<bundled>")
    }

    fn section(&self, key: &str) -> Result<&EntitySchema> {
        self.sections
            .get(key)
            .ok_or_else(|| PipelineError::drift(key, "column configuration"))
    }

    pub fn columns(&self, key: &str, only_required: bool) -> Result<Vec<String>> {
        let section = self.section(key)?;
        let mut cols: Vec<String> = if only_required {
            section.required.clone()
        } else {
            section.cols.keys().cloned().collect()
        };
        let mut seen = HashSet::new();
        cols.retain(|c| seen.insert(c.clone()));
        Ok(cols)
    }

    pub fn default_for(&self, key: &str, column: &str) -> Result<JsonValue> {
        let section = self.section(key)?;
        Ok(section
            .cols
            .get(column)
            .map(|spec| spec.default.clone())
            .unwrap_or_else(unset_default))
    }
}

#[derive(Debug, Clone)]
pub struct EntityTables {
    pub adresses: DataFrame,
    pub logements: DataFrame,
}

/// Back-fill configured columns the table lacks, then project and
/// deduplicate each entity table.
pub fn select_and_split(table: &mut DataFrame, golden: &GoldenConfig, only_required: bool) -> Result<EntityTables> {
    let cols_adresses = golden.columns(ADRESSES_SECTION, only_required)?;
    let cols_logements = golden.columns(LOGEMENTS_SECTION, only_required)?;
    let shared: Vec<&String> = cols_adresses.iter().filter(|c| cols_logements.contains(c)).collect();
    if !shared.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "columns {:?} are configured for both entity tables",
            shared
        )));
    }

    for (section, cols) in [(ADRESSES_SECTION, &cols_adresses), (LOGEMENTS_SECTION, &cols_logements)] {
        for c in cols {
            if !frame::has_column(table, c) {
                let default = golden.default_for(section, c)?;
                debug!("Schema: back-filling `{}` with {}", c, default);
                table.with_column(frame::constant(c, &default, table.height()))?;
            }
        }
    }

    let adresses = frame::dedup(&table.select(cols_adresses)?, None)?;
    let logements = frame::dedup(&table.select(cols_logements)?, None)?;
    info!(
        "Schema: split into adresses ({} row(s)) and logements ({} row(s))",
        adresses.height(),
        logements.height()
    );
    Ok(EntityTables { adresses, logements })
}

pub enum Typing {
    Infer,
    Apply(TypeSchema),
}

pub struct Reconciled {
    pub tables: EntityTables,
    pub types: TypeSchema,
    pub imputation: ImputationReport,
}

/// Typing, imputation, derived columns and split, in that order.
pub fn reconcile(mut table: DataFrame, typing: Typing, golden: &GoldenConfig, only_required: bool) -> Result<Reconciled> {
    let types = match typing {
        Typing::Infer => infer_schema(&table),
        Typing::Apply(saved) => saved,
    };
    apply_schema(&mut table, &types)?;

    let imputation = fill_missing_floats(&mut table)?;
    if !imputation.mean.is_empty() {
        info!("Schema: gaps filled with the mean in {:?}", imputation.mean);
    }
    if !imputation.median.is_empty() {
        info!("Schema: gaps filled with the median in {:?}", imputation.median);
    }

    compute_target(&mut table)?;
    compute_arrondissement(&mut table)?;
    let tables = select_and_split(&mut table, golden, only_required)?;
    Ok(Reconciled {
        tables,
        types,
        imputation,
    })
}
