pub mod models {
    pub mod opendata;
}

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod storage;
pub mod utils;
pub mod services {
    pub mod consumption;
    pub mod enrichment;
    pub mod geocode;
    pub mod load;
    pub mod pipeline;
    pub mod reconcile;
    pub mod schema;
}

use crate::client::OpenDataClient;
use crate::config::Config;
use crate::services::load::PgSink;
use crate::services::pipeline::{Pipeline, Sources, Stage};
use crate::services::schema::GoldenConfig;
use crate::storage::open_store;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use std::path::{Path, PathBuf};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug)]
struct Cli {
    env_file: Option<PathBuf>,
    stage: Stage,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("Applying database migrations failed: {}", e))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}

pub fn run(stage: Stage) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (stage={:?}, storage={:?}, annee={}, code_departement={}, rows={}, from_input={}, geocode_workers={}, resume={})",
        stage,
        cfg.storage,
        cfg.annee,
        cfg.code_departement
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.rows,
        cfg.from_input,
        cfg.geocode_workers.get(),
        cfg.resume
    );
    let golden = GoldenConfig::load(&cfg.schema_golden_path).map_err(|e| e.to_string())?;

    // 2) Collaborators
    let store = open_store(&cfg);
    let client = OpenDataClient::new(cfg.endpoints.clone(), cfg.http_timeout, cfg.ademe_page_size);
    let sources = Sources {
        consumption: &client,
        geocoder: &client,
        enrichment: &client,
    };
    let pipeline = Pipeline::new(&cfg, store.as_ref(), sources, golden, &utils::today_tag());

    // 3) Database, only when loading
    if !stage.needs_database() {
        return pipeline.run(stage, None).map_err(|e| e.to_string());
    }
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;
    let mut sink = PgSink::new(&mut conn);

    // 4) Run
    pipeline.run(stage, Some(&mut sink)).map_err(|e| e.to_string())
}

fn parse_cli<I: Iterator<Item = std::ffi::OsString>>(mut args: I) -> Result<Cli, String> {
    let mut env_file: Option<PathBuf> = None;
    let mut stage: Option<Stage> = None;

    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            let v = match inline.clone() {
                Some(v) => v,
                None => args
                    .next()
                    .and_then(|v| v.into_string().ok())
                    .ok_or_else(|| format!("`{}` requires a value", name))?,
            };
            if v.is_empty() {
                return Err(format!("`{}` requires a value", name));
            }
            Ok(v)
        };
        match flag.as_str() {
            "--env-file" => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                env_file = Some(PathBuf::from(value("--env-file")?));
            }
            "--stage" => {
                if stage.is_some() {
                    return Err("`--stage` provided more than once".to_string());
                }
                stage = Some(value("--stage")?.parse()?);
            }
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }

    Ok(Cli {
        env_file,
        stage: stage.unwrap_or(Stage::All),
    })
}

/// Load the explicit env file, or `./.env` when present. Returns the file used.
fn load_env(explicit: Option<&Path>) -> Result<Option<(PathBuf, bool)>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(path)?;
        return Ok(Some((path.to_path_buf(), true)));
    }
    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        load_env_file(&default_path)?;
        Ok(Some((default_path, false)))
    } else {
        Ok(None)
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in content.lines().enumerate() {
        let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // values already in the process environment win
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `KEY=value`, `export KEY=value`, quoted values and trailing comments.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), unquote(raw.trim())?)))
}

fn unquote(raw: &str) -> Result<String, String> {
    let quote = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string()),
    };
    let mut out = String::new();
    let mut chars = raw[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => return Err("unterminated escape sequence in double-quoted value".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(out)
                } else {
                    Err("unexpected characters after closing quote".to_string())
                };
            }
            c => out.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

fn main() {
    let cli = match parse_cli(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match load_env(cli.env_file.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, explicit)) = loaded_env.as_ref() {
        let origin = if *explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, path.display());
    }

    info!(
        "dpe-enedis-ademe-etl {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.stage) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
