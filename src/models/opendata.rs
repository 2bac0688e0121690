//! Wire models of the three open-data APIs, and the geocoded address record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `/records` (Enedis catalog) and `/lines` (ADEME data-fair) share a `results` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsPage {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub results: Option<Vec<Map<String, Value>>>,
}

/// GeoJSON feature collection returned by the address search endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeocodeResponse {
    #[serde(default)]
    pub features: Vec<GeocodeFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeFeature {
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    /// `[lon, lat]`
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

/// One address the geocoder resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedAddress {
    /// BAN identifier (`properties.id`).
    pub id_ban: String,
    /// Upper-cased `properties.label`.
    pub label: String,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    /// The exact string that was sent to the geocoder.
    pub full_address: String,
    /// Every other attribute of the feature, as returned.
    pub properties: Map<String, Value>,
}

impl GeocodedAddress {
    /// Keep the service-ranked first candidate; `None` when there is none or it
    /// carries no identifier.
    pub fn from_response(query: &str, response: GeocodeResponse) -> Option<Self> {
        let first = response.features.into_iter().next()?;
        let mut properties = first.properties;
        let id_ban = match properties.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        let label = properties
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_uppercase();
        properties.insert("label".into(), Value::String(label.clone()));
        let coords = first.geometry.map(|g| g.coordinates).unwrap_or_default();
        Some(GeocodedAddress {
            id_ban,
            label,
            lon: coords.first().copied(),
            lat: coords.get(1).copied(),
            full_address: query.to_string(),
            properties,
        })
    }

    /// Flatten into a record: feature properties plus `lon`, `lat` and `full_adress`.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut rec = self.properties.clone();
        rec.insert("lon".into(), self.lon.map(Value::from).unwrap_or(Value::Null));
        rec.insert("lat".into(), self.lat.map(Value::from).unwrap_or(Value::Null));
        rec.insert("full_adress".into(), Value::String(self.full_address.clone()));
        rec
    }
}
