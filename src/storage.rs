//! Staging storage for intermediate and final tables.
//!
//! Artifacts are addressed by `(directory, name)`; the backend picks the file
//! format. Locally tables are written as parquet, on the object store as
//! line-delimited JSON.

use crate::config::{Config, StorageBackend};
use crate::error::{PipelineError, Result};
use log::{debug, info};
use polars::prelude::*;
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub trait BlobStore: Send + Sync {
    fn save(&self, dir: &str, name: &str, table: &DataFrame) -> Result<()>;
    fn load(&self, dir: &str, name: &str) -> Result<DataFrame>;
    fn exists(&self, dir: &str, name: &str) -> Result<bool>;
}

pub fn open_store(cfg: &Config) -> Box<dyn BlobStore> {
    match &cfg.storage {
        StorageBackend::Local => Box::new(LocalStore),
        StorageBackend::Object { base_url } => Box::new(ObjectStore::new(base_url, cfg.http_timeout)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStore;

impl LocalStore {
    fn path(dir: &str, name: &str) -> PathBuf {
        Path::new(dir).join(format!("{name}.parquet"))
    }
}

impl BlobStore for LocalStore {
    fn save(&self, dir: &str, name: &str, table: &DataFrame) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::path(dir, name);
        write_parquet(&path, table)?;
        info!(
            "Saved {} ({} rows, {} columns)",
            path.display(),
            table.height(),
            table.width()
        );
        Ok(())
    }

    fn load(&self, dir: &str, name: &str) -> Result<DataFrame> {
        let path = Self::path(dir, name);
        let table = read_parquet(&path)?;
        debug!("Loaded {} ({} rows)", path.display(), table.height());
        Ok(table)
    }

    fn exists(&self, dir: &str, name: &str) -> Result<bool> {
        Ok(Self::path(dir, name).is_file())
    }
}

fn write_parquet(path: &Path, table: &DataFrame) -> Result<()> {
    if table.width() == 0 {
        return Err(PipelineError::storage(path.display().to_string(), "cannot persist a table without columns"));
    }
    let file = File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Gzip(None))
        .finish(&mut table.clone())?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).map_err(|e| PipelineError::storage(path.display().to_string(), e))?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Line-delimited JSON objects under `base_url`, addressed as `{base_url}/{dir}{name}.json`.
pub struct ObjectStore {
    agent: ureq::Agent,
    base_url: String,
}

impl ObjectStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        ObjectStore {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, dir: &str, name: &str) -> String {
        format!("{}/{}{}.json", self.base_url, dir.trim_start_matches('/'), name)
    }
}

pub fn to_json_lines(table: &DataFrame) -> Result<String> {
    let mut buf = Vec::new();
    JsonWriter::new(&mut buf)
        .with_json_format(JsonFormat::JsonLines)
        .finish(&mut table.clone())?;
    String::from_utf8(buf).map_err(|e| PipelineError::storage("<json lines>", e))
}

pub fn from_json_lines(body: &str) -> Result<DataFrame> {
    if body.trim().is_empty() {
        return Ok(DataFrame::empty());
    }
    let reader = Cursor::new(body.as_bytes().to_vec());
    Ok(JsonLineReader::new(reader).finish()?)
}

impl BlobStore for ObjectStore {
    fn save(&self, dir: &str, name: &str, table: &DataFrame) -> Result<()> {
        let url = self.url(dir, name);
        let body = to_json_lines(table)?;
        let res = self
            .agent
            .put(&url)
            .header("Content-Type", "application/x-ndjson")
            .send(body)
            .map_err(|e| PipelineError::storage(&url, e))?;
        if !res.status().is_success() {
            return Err(PipelineError::storage(&url, format!("http {}", res.status().as_u16())));
        }
        info!("Uploaded {} ({} rows)", url, table.height());
        Ok(())
    }

    fn load(&self, dir: &str, name: &str) -> Result<DataFrame> {
        let url = self.url(dir, name);
        let mut res = self.agent.get(&url).call().map_err(|e| PipelineError::storage(&url, e))?;
        if !res.status().is_success() {
            return Err(PipelineError::storage(&url, format!("http {}", res.status().as_u16())));
        }
        let body = res
            .body_mut()
            .with_config()
            .limit(u64::MAX)
            .read_to_string()
            .map_err(|e| PipelineError::storage(&url, e))?;
        from_json_lines(&body)
    }

    fn exists(&self, dir: &str, name: &str) -> Result<bool> {
        let url = self.url(dir, name);
        let res = self.agent.head(&url).call().map_err(|e| PipelineError::storage(&url, e))?;
        Ok(res.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::{float_at, text_at};
    use crate::frame::{ColumnType, column_names};

    fn mixed_table() -> DataFrame {
        let at = Series::new("at".into(), [Some(1_684_312_200_000_000i64), None])
            .cast(&ColumnType::DateTime.dtype())
            .unwrap();
        let mut df = df!(
            "id" => [Some("BAN1"), None],
            "n" => [Some(3i64), None],
            "x" => [Some(1.5f64), None],
            "ok" => [Some(true), None]
        )
        .unwrap();
        df.with_column(at).unwrap();
        df
    }

    #[test]
    fn local_store_round_trips_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().join("bronze");
        let dir = dir.to_str().unwrap();
        let store = LocalStore;
        let table = mixed_table();

        assert!(!store.exists(dir, "t_2024_01_01").unwrap());
        store.save(dir, "t_2024_01_01", &table).unwrap();
        assert!(store.exists(dir, "t_2024_01_01").unwrap());
        let back = store.load(dir, "t_2024_01_01").unwrap();
        assert!(back.equals_missing(&table));
        assert_eq!(back.column("at").unwrap().dtype(), &ColumnType::DateTime.dtype());
    }

    #[test]
    fn empty_table_keeps_its_header() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap();
        let table = df!("a" => Vec::<String>::new(), "b" => Vec::<i64>::new()).unwrap();
        LocalStore.save(dir, "empty", &table).unwrap();
        let back = LocalStore.load(dir, "empty").unwrap();
        assert_eq!(column_names(&back), ["a", "b"]);
        assert_eq!(back.height(), 0);
    }

    #[test]
    fn table_without_columns_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalStore.save(dir.path().to_str().unwrap(), "void", &DataFrame::empty()).unwrap_err();
        assert!(matches!(err, PipelineError::Storage { .. }));
    }

    #[test]
    fn missing_artifact_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalStore.load(dir.path().to_str().unwrap(), "nope").unwrap_err();
        assert!(matches!(err, PipelineError::Storage { .. }));
    }

    #[test]
    fn json_lines_round_trip() {
        let table = df!("a" => ["x", "y"], "b" => [Some(1i64), None], "c" => [0.5f64, 2.0]).unwrap();
        let body = to_json_lines(&table).unwrap();
        assert_eq!(body.lines().count(), 2);
        let back = from_json_lines(&body).unwrap();
        assert_eq!(back.height(), 2);
        assert_eq!(text_at(&back, "a", 1).as_deref(), Some("y"));
        assert_eq!(back.column("b").unwrap().null_count(), 1);
        assert_eq!(float_at(&back, "c", 0), Some(0.5));
    }

    #[test]
    fn blank_json_body_is_an_empty_table() {
        assert_eq!(from_json_lines("\n").unwrap().height(), 0);
    }

    #[test]
    fn object_store_urls_use_json_extension() {
        let store = ObjectStore::new("http://minio:9000/bucket/", Duration::from_secs(1));
        assert_eq!(
            store.url("etl/data/1_bronze/", "ademe_data_tmp_2024_01_01"),
            "http://minio:9000/bucket/etl/data/1_bronze/ademe_data_tmp_2024_01_01.json"
        );
    }
}
