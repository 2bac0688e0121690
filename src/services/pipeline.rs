use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::services::consumption::{self, ConsumptionSource};
use crate::services::enrichment::{self, EnrichmentSource};
use crate::services::geocode::{self, GeocodeResolver, Geocoder};
use crate::services::load::{EntitySink, Loader};
use crate::services::reconcile;
use crate::services::schema::{self, EntityTables, GoldenConfig, Typing};
use crate::storage::BlobStore;
use log::{info, warn};
use polars::prelude::DataFrame;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Transform,
    Load,
    All,
}

impl Stage {
    pub fn needs_database(self) -> bool {
        matches!(self, Stage::Load | Stage::All)
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "extract" => Ok(Stage::Extract),
            "transform" => Ok(Stage::Transform),
            "load" => Ok(Stage::Load),
            "all" => Ok(Stage::All),
            other => Err(format!("unknown stage `{}` (expected extract, transform, load or all)", other)),
        }
    }
}

/// Remote collaborators of the extract phase.
#[derive(Clone, Copy)]
pub struct Sources<'a> {
    pub consumption: &'a dyn ConsumptionSource,
    pub geocoder: &'a dyn Geocoder,
    pub enrichment: &'a dyn EnrichmentSource,
}

/// Artifact names of one run, all carrying the run date.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub staged_join: String,
    pub enrichment: String,
    pub unified: String,
    pub adresses: String,
    pub logements: String,
}

impl Artifacts {
    pub fn for_run(tag: &str) -> Self {
        Artifacts {
            staged_join: format!("enedis_with_ban_data_tmp_{tag}"),
            enrichment: format!("ademe_data_tmp_{tag}"),
            unified: format!("extract_output_data_{tag}"),
            adresses: format!("adresses_{tag}"),
            logements: format!("logements_{tag}"),
        }
    }
}

pub struct Pipeline<'a> {
    cfg: &'a Config,
    store: &'a dyn BlobStore,
    sources: Sources<'a>,
    golden: GoldenConfig,
    artifacts: Artifacts,
    loader: Loader,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a Config, store: &'a dyn BlobStore, sources: Sources<'a>, golden: GoldenConfig, run_tag: &str) -> Self {
        Pipeline {
            cfg,
            store,
            sources,
            golden,
            artifacts: Artifacts::for_run(run_tag),
            loader: Loader::default(),
        }
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    fn fetch_consumption(&self) -> Result<DataFrame> {
        let cfg = self.cfg;
        if cfg.from_input {
            let path = cfg
                .input_csv_path
                .as_deref()
                .ok_or_else(|| PipelineError::Configuration("PATH_FILE_INPUT_ENEDIS_CSV is not set".into()))?;
            consumption::fetch_from_batch(self.sources.consumption, path, cfg.code_departement)
        } else {
            consumption::fetch_from_api(self.sources.consumption, cfg.annee, cfg.code_departement, cfg.rows)
        }
    }

    /// Consumption -> geocoding -> stage 1 -> enrichment -> stage 2. Resumes
    /// from the staged stage-1 join of the same run date when allowed.
    pub fn extract(&self) -> Result<DataFrame> {
        let start = Instant::now();
        let cfg = self.cfg;
        let bronze = cfg.path_data_bronze.as_str();
        let staged = self.artifacts.staged_join.as_str();

        let ids = if cfg.resume && self.store.exists(bronze, staged)? {
            info!("Extract: resuming from staged join {}{}", bronze, staged);
            reconcile::staged_ids(&self.store.load(bronze, staged)?)?
        } else {
            let records = self.fetch_consumption()?;
            let addresses = consumption::addresses(&records)?;
            let resolver = GeocodeResolver::new(self.sources.geocoder, cfg.geocode_cache_capacity);
            let resolved = resolver.resolve(&addresses, cfg.geocode_workers)?;
            let geocoded = geocode::to_table(&resolved)?;
            drop(resolved);
            reconcile::stage_one(records, geocoded, self.store, bronze, staged)?
        };
        info!("Extract: {} address identifier(s) to enrich", ids.len());

        let performance = enrichment::fetch(
            self.sources.enrichment,
            &ids,
            self.store,
            bronze,
            &self.artifacts.enrichment,
        )?;
        let unified = reconcile::stage_two(
            &performance,
            self.store,
            bronze,
            staged,
            &cfg.path_data_silver,
            &self.artifacts.unified,
        )?;

        if cfg.save_schema && !cfg.schema_silver_path.exists() {
            schema::save_type_schema(&cfg.schema_silver_path, &schema::infer_schema(&unified))?;
        }
        info!(
            "Extract: {} unified row(s) in {:.1?}",
            unified.height(),
            start.elapsed()
        );
        Ok(unified)
    }

    /// Typing, imputation and split of the unified table (read from the silver
    /// zone when not given); the entity tables are saved to the gold zone.
    pub fn transform(&self, unified: Option<DataFrame>) -> Result<EntityTables> {
        let start = Instant::now();
        let cfg = self.cfg;
        let unified = match unified {
            Some(t) => t,
            None => self.store.load(&cfg.path_data_silver, &self.artifacts.unified)?,
        };
        if unified.height() == 0 {
            return Err(PipelineError::EmptyResult { stage: "transform" });
        }

        let typing = if cfg.apply_saved_schema {
            info!("Transform: applying saved types from {}", cfg.schema_silver_path.display());
            Typing::Apply(schema::load_type_schema(&cfg.schema_silver_path)?)
        } else {
            Typing::Infer
        };
        let inferred = matches!(typing, Typing::Infer);
        let reconciled = schema::reconcile(unified, typing, &self.golden, cfg.keep_only_required)?;
        if inferred && cfg.save_schema {
            schema::save_type_schema(&cfg.schema_silver_path, &reconciled.types)?;
        }

        let tables = reconciled.tables;
        self.store.save(&cfg.path_data_gold, &self.artifacts.adresses, &tables.adresses)?;
        self.store.save(&cfg.path_data_gold, &self.artifacts.logements, &tables.logements)?;
        info!("Transform: done in {:.1?}", start.elapsed());
        Ok(tables)
    }

    /// Load both entity tables (read from the gold zone when not given).
    /// Database failures are retried with a fixed delay; any other error
    /// stops at once.
    pub fn load(&self, sink: &mut dyn EntitySink, tables: Option<EntityTables>) -> Result<()> {
        let start = Instant::now();
        let cfg = self.cfg;
        let tables = match tables {
            Some(t) => t,
            None => EntityTables {
                adresses: self.store.load(&cfg.path_data_gold, &self.artifacts.adresses)?,
                logements: self.store.load(&cfg.path_data_gold, &self.artifacts.logements)?,
            },
        };
        let batch = [("adresses", &tables.adresses), ("logements", &tables.logements)];

        let max_attempts = cfg.load_max_attempts.get();
        let mut attempt = 1;
        loop {
            match self.loader.load_all(sink, &batch) {
                Ok(written) => {
                    for (name, count) in written {
                        info!("Load: {} -> {} new row(s)", name, count);
                    }
                    break;
                }
                Err(e @ PipelineError::Database(_)) if attempt < max_attempts => {
                    warn!(
                        "Load: attempt {}/{} failed: {}; retrying in {}s",
                        attempt,
                        max_attempts,
                        e,
                        cfg.load_retry_delay.as_secs()
                    );
                    thread::sleep(cfg.load_retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!("Load: done in {:.1?}", start.elapsed());
        Ok(())
    }

    pub fn run(&self, stage: Stage, sink: Option<&mut dyn EntitySink>) -> Result<()> {
        let sink_required = || PipelineError::Configuration("loading requires a database connection".into());
        match stage {
            Stage::Extract => self.extract().map(|_| ()),
            Stage::Transform => self.transform(None).map(|_| ()),
            Stage::Load => self.load(sink.ok_or_else(sink_required)?, None),
            Stage::All => {
                let sink = sink.ok_or_else(sink_required)?;
                let unified = self.extract()?;
                let tables = self.transform(Some(unified))?;
                self.load(sink, Some(tables))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Endpoints;
    use crate::config::StorageBackend;
    use crate::services::consumption::tests::FakeCatalog;
    use crate::services::enrichment::tests::{FakeRegistry, fixture_lines};
    use crate::services::geocode::tests::FakeGeocoder;
    use crate::frame::tests::{float_at, text_at};
    use crate::services::load::tests::MemorySink;
    use crate::storage::LocalStore;
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::path::Path;
    use std::time::Duration;

    fn test_config(root: &Path) -> Config {
        let dir = |name: &str| format!("{}/{}/", root.display(), name);
        Config {
            database_url: String::new(),
            storage: StorageBackend::Local,
            path_data_bronze: dir("1_bronze"),
            path_data_silver: dir("2_silver"),
            path_data_gold: dir("3_gold"),
            input_csv_path: None,
            schema_silver_path: root.join("schemas/schema_silver_data.json"),
            schema_golden_path: root.join("schemas/absent.json"),
            endpoints: Endpoints::default(),
            annee: 2022,
            code_departement: None,
            rows: 10,
            from_input: false,
            save_schema: true,
            apply_saved_schema: false,
            keep_only_required: false,
            geocode_workers: NonZeroUsize::new(2).unwrap(),
            geocode_cache_capacity: NonZeroUsize::new(8).unwrap(),
            ademe_page_size: 1000,
            http_timeout: Duration::from_secs(1),
            load_max_attempts: NonZeroUsize::new(3).unwrap(),
            load_retry_delay: Duration::ZERO,
            resume: true,
        }
    }

    fn catalog() -> FakeCatalog {
        let row = |adresse: &str, code: &str, nom: &str| {
            json!({
                "annee": "2022",
                "adresse": adresse,
                "code_commune": code,
                "nom_commune": nom,
                "consommation_annuelle_moyenne_par_logement_de_l_adresse_mwh": 2.5
            })
        };
        FakeCatalog(vec![
            row("1 RUE A", "75001", "PARIS"),
            row("2 RUE B", "75001", "PARIS"),
            row("3 RUE C", "99999", "NOWHERE"),
        ])
    }

    fn geocoder() -> FakeGeocoder {
        FakeGeocoder::new(&[("1 RUE A 75001 PARIS", Some("BAN1")), ("2 RUE B 75001 PARIS", Some("BAN2"))])
    }

    #[test]
    fn end_to_end_scenario() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, geocoder, registry) = (catalog(), geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");

        let unified = pipeline.extract().unwrap();
        assert_eq!(unified.height(), 2);
        assert!(
            crate::frame::text_values(&unified, "id_ban", "unified")
                .unwrap()
                .iter()
                .all(|v| v.as_deref() == Some("BAN1"))
        );
        assert!(cfg.schema_silver_path.exists());

        let tables = pipeline.transform(Some(unified)).unwrap();
        assert_eq!(tables.adresses.height(), 1);
        assert_eq!(text_at(&tables.adresses, "id_ban", 0).as_deref(), Some("BAN1"));
        assert_eq!(text_at(&tables.adresses, "arrondissement", 0).as_deref(), Some("N/A"));
        assert_eq!(
            float_at(
                &tables.adresses,
                "consommation_annuelle_moyenne_par_logement_de_l_adresse_kwh_enedis",
                0
            ),
            Some(2500.0)
        );
        assert_eq!(tables.logements.height(), 2);
        let numbers = crate::frame::text_values(&tables.logements, "ndegdpe_ademe", "logements").unwrap();
        assert!(numbers.contains(&Some("2275E0000001A".to_string())));

        let mut sink = MemorySink::with_schema();
        pipeline.run(Stage::Load, Some(&mut sink)).unwrap();
        assert_eq!(sink.writes, vec!["adresses", "logements"]);
        assert_eq!(sink.tables["adresses"].height(), 1);
        assert_eq!(sink.tables["logements"].height(), 2);

        pipeline.run(Stage::Load, Some(&mut sink)).unwrap();
        assert_eq!(sink.tables["logements"].height(), 2);
    }

    #[test]
    fn repeated_addresses_reach_the_geocode_cache() {
        let root = tempfile::tempdir().unwrap();
        let cfg = Config {
            geocode_workers: NonZeroUsize::new(1).unwrap(),
            ..test_config(root.path())
        };
        let mut rows = catalog().0;
        rows.push(rows[0].clone());
        rows.push(rows[2].clone());
        let catalog = FakeCatalog(rows);
        let (geocoder, registry) = (geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");

        let unified = pipeline.extract().unwrap();
        assert_eq!(unified.height(), 2);
        assert_eq!(geocoder.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn extract_resumes_from_staged_join() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, geocoder, registry) = (catalog(), geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01")
            .extract()
            .unwrap();

        let no_geocoder = FakeGeocoder::new(&[]);
        let resumed = Sources {
            geocoder: &no_geocoder,
            ..sources
        };
        let unified = Pipeline::new(&cfg, &LocalStore, resumed, GoldenConfig::bundled().unwrap(), "2024_03_01")
            .extract()
            .unwrap();
        assert_eq!(unified.height(), 2);
        assert_eq!(no_geocoder.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn transient_load_failures_are_retried() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, geocoder, registry) = (catalog(), geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");
        let mut sink = MemorySink {
            failing_appends: 2,
            ..MemorySink::with_schema()
        };
        pipeline.run(Stage::All, Some(&mut sink)).unwrap();
        assert_eq!(sink.tables["adresses"].height(), 1);
        assert_eq!(sink.tables["logements"].height(), 2);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, geocoder, registry) = (catalog(), geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");
        let tables = pipeline.transform(Some(pipeline.extract().unwrap())).unwrap();
        let mut sink = MemorySink {
            failing_appends: 3,
            ..MemorySink::with_schema()
        };
        let err = pipeline.load(&mut sink, Some(tables)).unwrap_err();
        assert!(matches!(err, PipelineError::Database(_)));
    }

    #[test]
    fn nothing_geocoded_stops_the_run() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, registry) = (catalog(), FakeRegistry::from_lines(fixture_lines()));
        let geocoder = FakeGeocoder::new(&[]);
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");
        let err = pipeline.run(Stage::Extract, None).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { stage: "geocoding" }));
        assert!(!LocalStore.exists(&cfg.path_data_bronze, &pipeline.artifacts().staged_join).unwrap());
    }

    #[test]
    fn load_without_database_is_a_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let cfg = test_config(root.path());
        let (catalog, geocoder, registry) = (catalog(), geocoder(), FakeRegistry::from_lines(fixture_lines()));
        let sources = Sources {
            consumption: &catalog,
            geocoder: &geocoder,
            enrichment: &registry,
        };
        let pipeline = Pipeline::new(&cfg, &LocalStore, sources, GoldenConfig::bundled().unwrap(), "2024_03_01");
        assert!(matches!(pipeline.run(Stage::All, None), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("Extract".parse::<Stage>(), Ok(Stage::Extract));
        assert_eq!("all".parse::<Stage>(), Ok(Stage::All));
        assert!("publish".parse::<Stage>().is_err());
        assert!(Stage::Load.needs_database());
        assert!(!Stage::Transform.needs_database());
    }
}
