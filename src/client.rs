//! Blocking HTTP client for the three open-data APIs the pipeline reads.
//!
//! - Blocking client using `ureq` (no async); one agent shared by all worker threads.
//! - Every call carries an explicit global timeout so a hung endpoint cannot
//!   block a worker forever.
//! - Unauthenticated: all three datasets are public.

use crate::models::opendata::{GeocodeResponse, RecordsPage};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_ENEDIS_API_URL: &str =
    "https://data.enedis.fr/api/explore/v2.1/catalog/datasets/consommation-annuelle-residentielle-par-adresse/records";
pub const DEFAULT_BAN_API_URL: &str = "https://api-adresse.data.gouv.fr/search/";
pub const DEFAULT_ADEME_API_URL: &str = "https://data.ademe.fr/data-fair/api/v1/datasets/dpe-v2-logements-existants/lines";

/// Field of the ADEME dataset holding the BAN identifier.
pub const ADEME_BAN_FIELD: &str = "Identifiant__BAN";

#[derive(Debug)]
pub enum ApiError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ApiError::Transport(s) => write!(f, "transport error: {}", s),
            ApiError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ApiError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub enedis: String,
    pub ban: String,
    pub ademe: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            enedis: DEFAULT_ENEDIS_API_URL.to_string(),
            ban: DEFAULT_BAN_API_URL.to_string(),
            ademe: DEFAULT_ADEME_API_URL.to_string(),
        }
    }
}

/// Catalog query for one year, capped at `rows`, optionally restricted to a department.
///
/// The catalog caps a single page; callers needing more rows must chunk.
pub fn consumption_url(base: &str, annee: i32, rows: usize, code_departement: Option<u32>) -> String {
    let mut url = format!("{base}?where=annee%20%3D%20date'{annee}'&limit={rows}");
    if let Some(dep) = code_departement {
        url.push_str(&format!("&where=code_departement%20%3D%20{dep}"));
    }
    url
}

pub struct OpenDataClient {
    agent: ureq::Agent,
    endpoints: Endpoints,
    ademe_page_size: usize,
}

impl OpenDataClient {
    pub fn new(endpoints: Endpoints, timeout: Duration, ademe_page_size: usize) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        OpenDataClient {
            agent: ureq::Agent::new_with_config(config),
            endpoints,
            ademe_page_size,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, ApiError> {
        let mut req = self.agent.get(url).header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, v);
        }
        let res = req.call().map_err(|e| ApiError::Transport(e.to_string()))?;
        read_json(res)
    }

    /// Consumption-by-address rows for `annee`.
    pub fn get_consumption_records(
        &self,
        annee: i32,
        code_departement: Option<u32>,
        rows: usize,
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let url = consumption_url(&self.endpoints.enedis, annee, rows, code_departement);
        log::info!("Fetching consumption records from: {}", url);
        let page: RecordsPage = self.get_json(&url, &[])?;
        Ok(page.results.unwrap_or_default())
    }

    /// Free-text address search, best candidate only.
    pub fn search_address(&self, address: &str) -> Result<GeocodeResponse, ApiError> {
        self.get_json(
            &self.endpoints.ban,
            &[("q", address.to_string()), ("limit", "1".to_string())],
        )
    }

    /// Raw body of a remotely hosted file (batch input published over HTTP).
    pub fn fetch_text(&self, url: &str) -> Result<String, ApiError> {
        let mut res = self
            .agent
            .get(url)
            .call()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ApiError::Http {
                status: res.status().as_u16(),
                message: format!("GET {}", url),
            });
        }
        res.body_mut()
            .with_config()
            .limit(u64::MAX)
            .read_to_string()
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    /// Every energy-performance line attached to one BAN identifier.
    pub fn get_dpe_lines(&self, id_ban: &str) -> Result<Vec<Map<String, Value>>, ApiError> {
        let page: RecordsPage = self.get_json(
            &self.endpoints.ademe,
            &[
                ("size", self.ademe_page_size.to_string()),
                ("format", "json".to_string()),
                ("qs", format!("{}:{}", ADEME_BAN_FIELD, id_ban)),
            ],
        )?;
        Ok(page.results.unwrap_or_default())
    }
}

fn read_json<T: DeserializeOwned>(mut res: http::Response<ureq::Body>) -> Result<T, ApiError> {
    let status = res.status();
    if !status.is_success() {
        let body = res
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: body,
        });
    }
    res.body_mut()
        .read_json::<T>()
        .map_err(|e| ApiError::Json(e.to_string()))
}
