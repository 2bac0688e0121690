use crate::error::{PipelineError, Result};
use crate::frame;
use crate::utils::quote_ident;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Jsonb, Text};
use log::{debug, info, warn};
use polars::prelude::{BooleanChunked, DataFrame};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

const INSERT_CHUNK_ROWS: usize = 1000;

/// Destination of the entity tables.
pub trait EntitySink {
    /// Primary-key tuples already stored in `table`, in their string form.
    fn existing_keys(&mut self, table: &str, primary_key: &[String]) -> Result<HashSet<Vec<String>>>;
    /// Insert every row; returns the number of rows written.
    fn append(&mut self, table: &str, rows: &DataFrame) -> Result<usize>;
    /// Tables `table` references through foreign keys.
    fn foreign_key_parents(&mut self, table: &str) -> Result<Vec<String>>;
}

/// Primary-key tuple of every row in string form; `None` when a part is null.
fn row_keys(data: &DataFrame, primary_key: &[String], name: &str) -> Result<Vec<Option<Vec<String>>>> {
    let parts = primary_key
        .iter()
        .map(|c| frame::text_values(data, c, name))
        .collect::<Result<Vec<_>>>()?;
    Ok((0..data.height())
        .map(|row| parts.iter().map(|p| p[row].clone()).collect())
        .collect())
}

fn json_key(v: &JsonValue) -> String {
    match v {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Append-only, primary-key-deduplicated writes of entity tables.
#[derive(Debug, Clone)]
pub struct Loader {
    primary_keys: HashMap<String, Vec<String>>,
}

impl Default for Loader {
    fn default() -> Self {
        Loader::new(HashMap::from([
            ("adresses".to_string(), vec!["id_ban".to_string()]),
            ("logements".to_string(), vec!["_id_ademe".to_string()]),
        ]))
    }
}

impl Loader {
    pub fn new(primary_keys: HashMap<String, Vec<String>>) -> Self {
        Loader { primary_keys }
    }

    /// Insert the rows of `data` whose primary key `name` does not hold yet.
    /// Returns the number of rows written; zero is a logged no-op.
    pub fn load_table(&self, sink: &mut dyn EntitySink, data: &DataFrame, name: &str) -> Result<usize> {
        if name.trim().is_empty() {
            return Err(PipelineError::Configuration("destination table name is empty".into()));
        }
        if data.height() == 0 {
            return Err(PipelineError::EmptyResult { stage: "load" });
        }
        let primary_key = self
            .primary_keys
            .get(name)
            .filter(|pk| !pk.is_empty())
            .ok_or_else(|| PipelineError::Configuration(format!("no primary key configured for table `{}`", name)))?;

        let keyed: BooleanChunked = row_keys(data, primary_key, name)?.iter().map(Option::is_some).collect();
        let mut candidates = data.filter(&keyed)?;
        if candidates.height() < data.height() {
            warn!(
                "Load: {} row(s) of `{}` without a primary key dropped",
                data.height() - candidates.height(),
                name
            );
        }
        candidates = frame::dedup(&candidates, Some(primary_key.as_slice()))?;

        let existing = match sink.existing_keys(name, primary_key) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Load: could not read `{}` ({}), treating it as empty", name, e);
                HashSet::new()
            }
        };
        let fresh: BooleanChunked = row_keys(&candidates, primary_key, name)?
            .into_iter()
            .map(|k| k.is_some_and(|k| !existing.contains(&k)))
            .collect();
        candidates = candidates.filter(&fresh)?;

        if candidates.height() == 0 {
            info!("Load: nothing new for `{}` ({} key(s) already present)", name, existing.len());
            return Ok(0);
        }
        let written = sink.append(name, &candidates)?;
        info!("Load: {} new row(s) appended to `{}`", written, name);
        Ok(written)
    }

    /// Order `names` so that every table comes after the tables it references.
    pub fn load_order(&self, sink: &mut dyn EntitySink, names: &[&str]) -> Vec<String> {
        let mut parents: HashMap<&str, Vec<String>> = HashMap::new();
        for &name in names {
            match sink.foreign_key_parents(name) {
                Ok(p) => {
                    parents.insert(name, p);
                }
                Err(e) => warn!("Load: foreign keys of `{}` unknown ({}), keeping given order", name, e),
            }
        }

        let mut ordered: Vec<String> = Vec::with_capacity(names.len());
        let mut pending: Vec<&str> = names.to_vec();
        while !pending.is_empty() {
            let ready = pending.iter().position(|n| {
                parents.get(n).map_or(true, |ps| {
                    ps.iter()
                        .all(|p| p == n || !pending.contains(&p.as_str()) || ordered.contains(p))
                })
            });
            // a reference cycle falls back to the given order
            let next = pending.remove(ready.unwrap_or(0));
            ordered.push(next.to_string());
        }
        debug!("Load: order {:?}", ordered);
        ordered
    }

    /// Load every table, parents first.
    pub fn load_all(&self, sink: &mut dyn EntitySink, tables: &[(&str, &DataFrame)]) -> Result<Vec<(String, usize)>> {
        let names: Vec<&str> = tables.iter().map(|(n, _)| *n).collect();
        let mut written = Vec::with_capacity(tables.len());
        for name in self.load_order(sink, &names) {
            let Some((_, data)) = tables.iter().find(|(n, _)| *n == name) else {
                continue;
            };
            let count = self.load_table(sink, data, &name)?;
            written.push((name, count));
        }
        Ok(written)
    }
}

#[derive(QueryableByName)]
struct KeyRow {
    #[diesel(sql_type = Text)]
    key: String,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Postgres destination. Rows go through `jsonb_populate_recordset`, so the
/// destination column types drive the casts.
pub struct PgSink<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgSink<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        PgSink { conn }
    }

    fn destination_columns(&mut self, table: &str) -> Result<HashSet<String>> {
        let rows: Vec<NameRow> = diesel::sql_query(
            "SELECT column_name::text AS name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind::<Text, _>(table)
        .load(self.conn)
        .map_err(|e| PipelineError::Database(format!("reading columns of {} failed: {}", table, e)))?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }
}

impl EntitySink for PgSink<'_> {
    fn existing_keys(&mut self, table: &str, primary_key: &[String]) -> Result<HashSet<Vec<String>>> {
        let cols = primary_key.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let query = format!(
            "SELECT DISTINCT jsonb_build_array({})::text AS key FROM {}",
            cols,
            quote_ident(table)
        );
        let rows: Vec<KeyRow> = diesel::sql_query(query)
            .load(self.conn)
            .map_err(|e| PipelineError::Database(format!("reading keys of {} failed: {}", table, e)))?;
        rows.into_iter()
            .map(|r| -> Result<Vec<String>> {
                let parts: Vec<JsonValue> = serde_json::from_str(&r.key)?;
                Ok(parts.iter().map(json_key).collect())
            })
            .collect()
    }

    fn append(&mut self, table: &str, rows: &DataFrame) -> Result<usize> {
        let destination = self.destination_columns(table)?;
        let (columns, skipped): (Vec<String>, Vec<String>) = frame::column_names(rows)
            .into_iter()
            .partition(|c| destination.contains(c));
        if !skipped.is_empty() {
            warn!("Load: `{}` has no column(s) {:?}, values skipped", table, skipped);
        }
        let projected = rows.select(columns.iter().map(String::as_str))?;
        let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let statement = format!(
            "INSERT INTO {t} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{t}, $1)",
            t = quote_ident(table),
            cols = column_list
        );

        let records = frame::to_records(&projected)?;
        self.conn
            .transaction::<usize, diesel::result::Error, _>(|conn| {
                let mut written = 0;
                for chunk in records.chunks(INSERT_CHUNK_ROWS) {
                    let payload = JsonValue::Array(chunk.iter().cloned().map(JsonValue::Object).collect());
                    written += diesel::sql_query(&statement).bind::<Jsonb, _>(payload).execute(conn)?;
                }
                Ok(written)
            })
            .map_err(|e| PipelineError::Database(format!("insert into {} failed: {}", table, e)))
    }

    fn foreign_key_parents(&mut self, table: &str) -> Result<Vec<String>> {
        let rows: Vec<NameRow> = diesel::sql_query(
            "SELECT DISTINCT ccu.table_name::text AS name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.constraint_column_usage ccu \
               ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema() \
               AND tc.table_name = $1",
        )
        .bind::<Text, _>(table)
        .load(self.conn)
        .map_err(|e| PipelineError::Database(format!("reading foreign keys of {} failed: {}", table, e)))?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }
}
