use crate::client::{ApiError, OpenDataClient};
use crate::error::{PipelineError, Result};
use crate::models::opendata::GeocodedAddress;
use crate::frame;
use crossbeam_channel::{bounded, unbounded};
use log::{debug, info, warn};
use lru::LruCache;
use polars::prelude::DataFrame;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::thread;

/// Resolves one free-text address to its best candidate. `Ok(None)` means the
/// service answered but had nothing to offer.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, address: &str) -> std::result::Result<Option<GeocodedAddress>, ApiError>;
}

impl Geocoder for OpenDataClient {
    fn geocode(&self, address: &str) -> std::result::Result<Option<GeocodedAddress>, ApiError> {
        let response = self.search_address(address)?;
        Ok(GeocodedAddress::from_response(address, response))
    }
}

/// Bounded LRU memo of geocoding answers keyed by the exact address string.
/// Misses are cached too; transport errors are not.
pub struct GeoCache {
    inner: Mutex<LruCache<String, Option<GeocodedAddress>>>,
}

impl GeoCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        GeoCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, address: &str) -> Option<Option<GeocodedAddress>> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(address).cloned()
    }

    pub fn put(&self, address: &str, result: Option<GeocodedAddress>) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(address.to_string(), result);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct GeocodeResolver<'a, G: Geocoder + ?Sized> {
    geocoder: &'a G,
    cache: GeoCache,
}

impl<'a, G: Geocoder + ?Sized> GeocodeResolver<'a, G> {
    pub fn new(geocoder: &'a G, cache_capacity: NonZeroUsize) -> Self {
        GeocodeResolver {
            geocoder,
            cache: GeoCache::new(cache_capacity),
        }
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    fn lookup(&self, address: &str) -> Option<GeocodedAddress> {
        if let Some(hit) = self.cache.get(address) {
            return hit;
        }
        match self.geocoder.geocode(address) {
            Ok(found) => {
                if found.is_none() {
                    debug!("Geocode: no candidate for `{}`", address);
                }
                self.cache.put(address, found.clone());
                found
            }
            Err(e) => {
                debug!("Geocode: lookup failed for `{}`: {}", address, e);
                None
            }
        }
    }

    /// Geocode `addresses` on `workers` threads. Unresolved addresses are
    /// dropped; output order is unspecified.
    pub fn resolve(&self, addresses: &[String], workers: NonZeroUsize) -> Result<Vec<GeocodedAddress>> {
        let n = workers.get().min(addresses.len().max(1));
        info!("Geocode: resolving {} address(es) on {} worker(s)", addresses.len(), n);

        let resolved = thread::scope(|s| -> Result<Vec<GeocodedAddress>> {
            let (job_tx, job_rx) = bounded::<&str>(n * 2);
            let (res_tx, res_rx) = unbounded::<Option<GeocodedAddress>>();

            for i in 0..n {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                thread::Builder::new()
                    .name(format!("geocode-{}", i))
                    .spawn_scoped(s, move || {
                        for address in job_rx.iter() {
                            if res_tx.send(self.lookup(address)).is_err() {
                                break;
                            }
                        }
                    })?;
            }
            drop(job_rx);
            drop(res_tx);

            for address in addresses {
                if address.trim().is_empty() {
                    warn!("Geocode: skipping empty address");
                    continue;
                }
                if job_tx.send(address.as_str()).is_err() {
                    break;
                }
            }
            drop(job_tx);

            Ok(res_rx.iter().flatten().collect())
        })?;

        if resolved.is_empty() {
            return Err(PipelineError::EmptyResult { stage: "geocoding" });
        }
        info!(
            "Geocode: {} of {} address(es) resolved ({} cached)",
            resolved.len(),
            addresses.len(),
            self.cache.len()
        );
        Ok(resolved)
    }
}

/// Flatten resolved addresses into a table (feature properties, `lon`, `lat`,
/// `full_adress`). Repeated addresses resolve to identical rows and are kept once.
pub fn to_table(resolved: &[GeocodedAddress]) -> Result<DataFrame> {
    let records: Vec<_> = resolved.iter().map(GeocodedAddress::to_record).collect();
    frame::dedup(&frame::from_records(&records)?, None)
}
