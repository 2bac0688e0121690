use crate::client::{ApiError, OpenDataClient};
use crate::error::{PipelineError, Result};
use crate::storage::BlobStore;
use crate::frame;
use log::{debug, info, warn};
use polars::prelude::DataFrame;
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const ADEME_SUFFIX: &str = "_ademe";

/// Energy-performance registry, queried by BAN identifier.
pub trait EnrichmentSource: Send + Sync {
    fn dpe_lines(&self, id_ban: &str) -> std::result::Result<Vec<Map<String, Value>>, ApiError>;
}

impl EnrichmentSource for OpenDataClient {
    fn dpe_lines(&self, id_ban: &str) -> std::result::Result<Vec<Map<String, Value>>, ApiError> {
        self.get_dpe_lines(id_ban)
    }
}

/// One query per distinct identifier; identifiers that fail or match nothing
/// are skipped. The combined rows get the `_ademe` suffix and are staged
/// under `(dir, name)` before being returned.
pub fn fetch(
    source: &dyn EnrichmentSource,
    ids: &[String],
    store: &dyn BlobStore,
    dir: &str,
    name: &str,
) -> Result<DataFrame> {
    let mut seen = HashSet::new();
    let ids: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
    info!("Enrichment: querying {} identifier(s)", ids.len());

    let mut records = Vec::new();
    let (mut failed, mut empty) = (0usize, 0usize);
    for id in ids {
        match source.dpe_lines(id) {
            Ok(lines) if lines.is_empty() => {
                debug!("Enrichment: no rows for {}", id);
                empty += 1;
            }
            Ok(lines) => records.extend(lines),
            Err(e) => {
                warn!("Enrichment: query for {} failed: {}", id, e);
                failed += 1;
            }
        }
    }
    if records.is_empty() {
        return Err(PipelineError::EmptyResult { stage: "enrichment" });
    }

    let table = frame::with_suffix(&frame::from_records(&records)?, ADEME_SUFFIX)?;
    info!(
        "Enrichment: {} row(s) retrieved ({} identifier(s) without rows, {} failed)",
        table.height(),
        empty,
        failed
    );
    store.save(dir, name, &table)?;
    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::ADEME_BAN_FIELD;
    use crate::storage::LocalStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves `tests/data/ademe-lines.json`-shaped pages from memory.
    pub(crate) struct FakeRegistry {
        pub pages: HashMap<String, Vec<Map<String, Value>>>,
        pub queried: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        pub(crate) fn from_lines(lines: Vec<Map<String, Value>>) -> Self {
            let mut pages: HashMap<String, Vec<Map<String, Value>>> = HashMap::new();
            for line in lines {
                let id = line.get(ADEME_BAN_FIELD).and_then(Value::as_str).unwrap_or_default().to_string();
                pages.entry(id).or_default().push(line);
            }
            FakeRegistry {
                pages,
                queried: Mutex::new(Vec::new()),
            }
        }
    }

    impl EnrichmentSource for FakeRegistry {
        fn dpe_lines(&self, id_ban: &str) -> std::result::Result<Vec<Map<String, Value>>, ApiError> {
            self.queried.lock().unwrap().push(id_ban.to_string());
            if id_ban == "BROKEN" {
                return Err(ApiError::Transport("connection reset".into()));
            }
            Ok(self.pages.get(id_ban).cloned().unwrap_or_default())
        }
    }

    pub(crate) fn fixture_lines() -> Vec<Map<String, Value>> {
        let raw = std::fs::read_to_string("tests/data/ademe-lines.json").unwrap();
        let page: crate::models::opendata::RecordsPage = serde_json::from_str(&raw).unwrap();
        page.results.unwrap()
    }

    #[test]
    fn fans_out_and_stages_rows() {
        let registry = FakeRegistry::from_lines(fixture_lines());
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap();
        let ids = vec!["BAN1".to_string(), "BAN2".to_string(), "BAN1".to_string(), "BROKEN".to_string()];

        let t = fetch(&registry, &ids, &LocalStore, dir, "ademe_data_tmp_2024_01_01").unwrap();
        assert_eq!(t.height(), 2);
        assert!(frame::has_column(&t, "Identifiant__BAN_ademe"));
        assert_eq!(registry.queried.lock().unwrap().len(), 3);
        assert!(LocalStore.exists(dir, "ademe_data_tmp_2024_01_01").unwrap());
    }

    #[test]
    fn nothing_found_is_an_empty_result() {
        let registry = FakeRegistry::from_lines(vec![]);
        let dir = tempfile::tempdir().unwrap();
        let err = fetch(
            &registry,
            &["BAN2".to_string()],
            &LocalStore,
            dir.path().to_str().unwrap(),
            "x",
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { stage: "enrichment" }));
    }
}
