//! Error taxonomy of the pipeline.
//!
//! Per-item soft failures never reach this type: they are absorbed where they
//! happen (an address that does not geocode, an identifier without enrichment
//! rows). Everything here is fatal for the run.

use crate::client::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A whole stage produced zero rows.
    #[error("{stage}: no rows produced")]
    EmptyResult { stage: &'static str },

    /// An expected join or configuration key is missing at a reconciliation boundary.
    #[error("schema drift: column `{column}` not found in {dataset}; check the source schema or the extraction step")]
    SchemaDrift { column: String, dataset: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("storage error on {path}: {message}")]
    Storage { path: String, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dataframe error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl PipelineError {
    pub fn storage(path: impl Into<String>, message: impl ToString) -> Self {
        PipelineError::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn drift(column: impl Into<String>, dataset: impl Into<String>) -> Self {
        PipelineError::SchemaDrift {
            column: column.into(),
            dataset: dataset.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
