use crate::client::{ApiError, OpenDataClient};
use crate::error::{PipelineError, Result};
use crate::frame;
use log::{debug, info, warn};
use polars::prelude::*;
use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::io::Cursor;

/// Batch-file headers and their canonical names.
const BATCH_RENAMES: [(&str, &str); 3] = [
    ("Adresse", "adresse"),
    ("Nom Commune", "nom_commune"),
    ("Code Commune", "code_commune"),
];
pub const REQUIRED_COLUMNS: [&str; 3] = ["adresse", "nom_commune", "code_commune"];
pub const BATCH_DEPARTMENT_COLUMN: &str = "Code Département";
pub const FULL_ADDRESS_COLUMN: &str = "full_adress";

/// Remote catalog of annual consumption by address.
pub trait ConsumptionSource: Send + Sync {
    fn consumption_records(
        &self,
        annee: i32,
        code_departement: Option<u32>,
        rows: usize,
    ) -> std::result::Result<Vec<Map<String, JsonValue>>, ApiError>;

    /// Body of a batch file published over HTTP.
    fn fetch_text(&self, url: &str) -> std::result::Result<String, ApiError>;
}

impl ConsumptionSource for OpenDataClient {
    fn consumption_records(
        &self,
        annee: i32,
        code_departement: Option<u32>,
        rows: usize,
    ) -> std::result::Result<Vec<Map<String, JsonValue>>, ApiError> {
        self.get_consumption_records(annee, code_departement, rows)
    }

    fn fetch_text(&self, url: &str) -> std::result::Result<String, ApiError> {
        OpenDataClient::fetch_text(self, url)
    }
}

/// Catalog mode: one query filtered on year, row cap and optional department.
pub fn fetch_from_api(
    source: &dyn ConsumptionSource,
    annee: i32,
    code_departement: Option<u32>,
    rows: usize,
) -> Result<DataFrame> {
    let records = source.consumption_records(annee, code_departement, rows)?;
    let mut table = frame::from_records(&records)?;
    if table.height() == 0 {
        return Err(PipelineError::EmptyResult { stage: "consumption" });
    }
    add_full_address(&mut table)?;
    info!("Consumption: {} row(s) fetched for {}", table.height(), annee);
    Ok(table)
}

/// Batch mode: `;`-separated file from a local path, or from an `http(s)://` URL.
pub fn fetch_from_batch(
    source: &dyn ConsumptionSource,
    location: &str,
    code_departement: Option<u32>,
) -> Result<DataFrame> {
    info!("Consumption: loading batch input {}", location);
    let bytes = if location.starts_with("http://") || location.starts_with("https://") {
        source.fetch_text(location)?.into_bytes()
    } else {
        fs::read(location).map_err(|e| PipelineError::storage(location, e))?
    };
    let table = read_batch(bytes, code_departement)?;
    info!("Consumption: {} row(s) loaded from batch input", table.height());
    Ok(table)
}

/// Every column is read as text; typing happens once the datasets are reconciled.
pub fn read_batch(bytes: Vec<u8>, code_departement: Option<u32>) -> Result<DataFrame> {
    let mut table = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_parse_options(CsvParseOptions::default().with_separator(b';'))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;
    for name in frame::column_names(&table) {
        if name.trim() != name {
            frame::rename(&mut table, &name, name.trim())?;
        }
    }
    if table.height() == 0 {
        return Err(PipelineError::EmptyResult { stage: "consumption" });
    }

    for (from, to) in BATCH_RENAMES {
        frame::rename(&mut table, from, to)?;
    }
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !frame::has_column(&table, c))
        .collect();
    if !missing.is_empty() {
        warn!("Consumption: batch input lacks column(s) {:?}", missing);
    }

    if let Some(dep) = code_departement {
        if frame::has_column(&table, BATCH_DEPARTMENT_COLUMN) {
            let before = table.height();
            let mask: BooleanChunked = frame::text_values(&table, BATCH_DEPARTMENT_COLUMN, "batch input")?
                .into_iter()
                .map(|v| v.and_then(|k| k.trim().parse::<u32>().ok()) == Some(dep))
                .collect();
            table = table.filter(&mask)?;
            info!("Consumption: department {} keeps {} of {} row(s)", dep, table.height(), before);
        } else {
            debug!("Consumption: no `{}` column, department filter skipped", BATCH_DEPARTMENT_COLUMN);
        }
    }
    if table.height() == 0 {
        return Err(PipelineError::EmptyResult { stage: "consumption" });
    }
    add_full_address(&mut table)?;
    Ok(table)
}

/// `full_adress = adresse + ' ' + code_commune + ' ' + nom_commune`, the geocoding join key.
pub fn add_full_address(table: &mut DataFrame) -> Result<()> {
    let text = |name: &str| frame::text_values(table, name, "consumption records");
    let (adresse, code, nom) = (text("adresse")?, text("code_commune")?, text("nom_commune")?);
    let full: Vec<String> = adresse
        .into_iter()
        .zip(code)
        .zip(nom)
        .map(|((a, c), n)| {
            format!(
                "{} {} {}",
                a.unwrap_or_default(),
                c.unwrap_or_default(),
                n.unwrap_or_default()
            )
        })
        .collect();
    table.with_column(Series::new(FULL_ADDRESS_COLUMN.into(), full))?;
    Ok(())
}

/// Join keys in row order, repeats included; the geocode cache absorbs them.
pub fn addresses(table: &DataFrame) -> Result<Vec<String>> {
    Ok(frame::text_values(table, FULL_ADDRESS_COLUMN, "consumption records")?
        .into_iter()
        .flatten()
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::tests::text_at;
    use serde_json::json;

    pub(crate) struct FakeCatalog(pub Vec<JsonValue>);

    impl ConsumptionSource for FakeCatalog {
        fn consumption_records(
            &self,
            _annee: i32,
            _code_departement: Option<u32>,
            rows: usize,
        ) -> std::result::Result<Vec<Map<String, JsonValue>>, ApiError> {
            Ok(self
                .0
                .iter()
                .take(rows)
                .filter_map(|v| v.as_object().cloned())
                .collect())
        }

        fn fetch_text(&self, url: &str) -> std::result::Result<String, ApiError> {
            Err(ApiError::Http {
                status: 404,
                message: url.to_string(),
            })
        }
    }

    fn batch_fixture() -> Vec<u8> {
        fs::read("tests/data/enedis-batch.csv").unwrap()
    }

    #[test]
    fn batch_file_is_renamed_filtered_and_keyed() {
        let t = read_batch(batch_fixture(), Some(75)).unwrap();
        assert_eq!(t.height(), 2);
        assert!(frame::has_column(&t, "adresse"));
        assert_eq!(
            text_at(&t, FULL_ADDRESS_COLUMN, 0).as_deref(),
            Some("1 RUE A 75101 PARIS 1ER ARRONDISSEMENT")
        );
    }

    #[test]
    fn batch_cells_stay_text_and_blanks_are_null() {
        let t = read_batch(batch_fixture(), None).unwrap();
        let mwh = "Consommation annuelle moyenne par logement de l'adresse (MWh)";
        assert_eq!(t.column(mwh).unwrap().dtype(), &DataType::String);
        assert_eq!(text_at(&t, mwh, 0).as_deref(), Some("3,2"));
        assert_eq!(text_at(&t, mwh, 1), None);
    }

    #[test]
    fn batch_without_department_filter_keeps_everything() {
        assert_eq!(read_batch(batch_fixture(), None).unwrap().height(), 3);
    }

    #[test]
    fn filtered_out_batch_is_empty() {
        let err = read_batch(batch_fixture(), Some(13)).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { stage: "consumption" }));
    }

    #[test]
    fn local_batch_path_is_read_from_disk() {
        let t = fetch_from_batch(&FakeCatalog(vec![]), "tests/data/enedis-batch.csv", None).unwrap();
        assert_eq!(t.height(), 3);
        let err = fetch_from_batch(&FakeCatalog(vec![]), "https://example.org/missing.csv", None).unwrap_err();
        assert!(matches!(err, PipelineError::Api(ApiError::Http { status: 404, .. })));
    }

    #[test]
    fn header_only_batch_is_empty() {
        let err = read_batch(b"Adresse;Nom Commune;Code Commune\n".to_vec(), None).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { .. }));
    }

    #[test]
    fn full_address_is_street_then_code_then_town() {
        let mut t = df!(
            "adresse" => ["1 RUE A"],
            "nom_commune" => ["PARIS"],
            "code_commune" => ["75001"]
        )
        .unwrap();
        add_full_address(&mut t).unwrap();
        assert_eq!(text_at(&t, FULL_ADDRESS_COLUMN, 0).as_deref(), Some("1 RUE A 75001 PARIS"));
    }

    #[test]
    fn full_address_needs_every_part() {
        let mut t = df!("adresse" => ["1 RUE A"], "nom_commune" => ["PARIS"]).unwrap();
        let err = add_full_address(&mut t).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaDrift { column, .. } if column == "code_commune"));
    }

    #[test]
    fn api_rows_get_a_join_key() {
        let catalog = FakeCatalog(vec![
            json!({"adresse": "1 RUE A", "code_commune": "75101", "nom_commune": "PARIS", "annee": "2022"}),
            json!({"adresse": "1 RUE A", "code_commune": "75101", "nom_commune": "PARIS", "annee": "2022"}),
        ]);
        let t = fetch_from_api(&catalog, 2022, Some(75), 10).unwrap();
        assert_eq!(text_at(&t, FULL_ADDRESS_COLUMN, 0).as_deref(), Some("1 RUE A 75101 PARIS"));
        assert_eq!(
            addresses(&t).unwrap(),
            vec!["1 RUE A 75101 PARIS".to_string(), "1 RUE A 75101 PARIS".to_string()]
        );
    }

    #[test]
    fn api_without_rows_is_empty() {
        let err = fetch_from_api(&FakeCatalog(vec![]), 2022, None, 10).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { stage: "consumption" }));
    }
}
