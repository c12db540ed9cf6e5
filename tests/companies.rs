use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::Value;
use zip::write::SimpleFileOptions;

use ibge_importer::app::{App, CancelToken, ProgressEvent, ProgressSink};
use ibge_importer::companies::{CompanyImporter, CompanyReport, LedgerPhase};
use ibge_importer::config::{Config, ConfigLoader};
use ibge_importer::domain::{CompanyRecord, Table};
use ibge_importer::error::ImportError;
use ibge_importer::fetch::HttpDownloader;
use ibge_importer::ibge::GeographyApi;
use ibge_importer::store::Database;
use ibge_importer::writer::RecordStore;

struct NoApi;

impl GeographyApi for NoApi {
    fn municipios(&self) -> Result<Vec<Value>, ImportError> {
        Ok(Vec::new())
    }

    fn distritos(&self) -> Result<Vec<Value>, ImportError> {
        Ok(Vec::new())
    }

    fn estados(&self) -> Result<Vec<Value>, ImportError> {
        Ok(Vec::new())
    }
}

struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Accepts rows row by row only, and never the poisoned id.
#[derive(Default)]
struct PickyStore {
    stored: HashSet<i64>,
    poisoned: i64,
    bulk_attempts: usize,
}

impl RecordStore<CompanyRecord> for PickyStore {
    fn existing_among(&self, ids: &[i64]) -> Result<HashSet<i64>, ImportError> {
        Ok(ids
            .iter()
            .copied()
            .filter(|id| self.stored.contains(id))
            .collect())
    }

    fn insert_batch(&mut self, _rows: &[CompanyRecord]) -> Result<usize, ImportError> {
        self.bulk_attempts += 1;
        Err(ImportError::BulkWrite {
            table: "companies",
            message: "constraint failed".to_string(),
        })
    }

    fn insert_row(&mut self, row: &CompanyRecord) -> Result<(), ImportError> {
        if i64::from(row.base_cnpj) == self.poisoned {
            return Err(ImportError::Validation("poisoned row".to_string()));
        }
        self.stored.insert(i64::from(row.base_cnpj));
        Ok(())
    }
}

const LEDGER: &[u8] = b"\"41273599\";\"PADARIA S\xc3O JOS\xc9 LTDA\";\"2062\";\"49\";\"10000,00\";\"01\";\"\"\n\
\"41273600\";\"CONSTRU\xc7\xc3O NORTE ME\";\"2135\";\"50\";\"99999999999,00\";\"05\";\"\"\n\
\"00000000\";\"SEM CNPJ\";\"2062\";\"49\";\"0,00\";\"01\";\"\"\n\
\"41273601\";\"CURTA\"\n\
\"41273602\";\"PREFEITURA\";\"1244\";\"05\";\"0,00\";\"05\";\"SAO PAULO\"\n";

fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap();
}

fn app_for(archive: &Path) -> App<NoApi, HttpDownloader> {
    let config = ConfigLoader::resolve_config(Config {
        cache_dir: Some("unused-cache".to_string()),
        archive_url: Some("http://127.0.0.1:9/Empresas0.zip".to_string()),
        archive_path: Some(archive.to_str().unwrap().to_string()),
        company_batch_size: Some(2),
        ..Config::default()
    })
    .unwrap();
    let downloader = HttpDownloader::new(Duration::from_secs(1), 1024).unwrap();
    App::new(Database::open_in_memory().unwrap(), NoApi, downloader, config)
}

fn generated_rows(count: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for n in 1..=count {
        body.extend_from_slice(
            format!("\"{n:08}\";\"EMPRESA {n}\";\"2062\";\"49\";\"1000,00\";\"01\";\"\"\n").as_bytes(),
        );
    }
    body
}

#[test]
fn imports_archive_already_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("empresas_data.zip");
    write_archive(
        &archive,
        &[
            ("K3241.K03200Y0.D40511.EMPRECSV", LEDGER),
            ("LEIAME.txt", b"nothing to see"),
        ],
    );

    let mut app = app_for(&archive);
    let report = app.import_companies(&NoopSink).unwrap();

    assert!(report.archive.as_ref().unwrap().reused);
    assert_eq!(report.entries, vec!["K3241.K03200Y0.D40511.EMPRECSV".to_string()]);
    assert_eq!(report.rows_read, 5);
    assert_eq!(report.created, 3);
    assert_eq!(report.short_rows, 1);
    assert_eq!(report.rows_without_id, 1);
    assert_eq!(report.discarded(), 2);
    assert_eq!(report.phase, LedgerPhase::Done);
    assert_eq!(report.batches, 2);
    assert_eq!(app.database().count(Table::Companies).unwrap(), 3);

    let (name, capital): (String, i64) = app
        .database()
        .connection()
        .query_row(
            "SELECT legal_name, capital FROM companies WHERE base_cnpj = ?1",
            [41273600i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(name, "CONSTRUÇÃO NORTE ME");
    assert_eq!(capital, i64::from(i32::MAX));

    let entity: Option<String> = app
        .database()
        .connection()
        .query_row(
            "SELECT federative_entity FROM companies WHERE base_cnpj = ?1",
            [41273602i64],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(entity.as_deref(), Some("SAO PAULO"));
}

#[test]
fn second_import_only_skips() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("empresas_data.zip");
    write_archive(&archive, &[("empresas.csv", LEDGER)]);

    let mut app = app_for(&archive);
    app.import_companies(&NoopSink).unwrap();
    let second = app.import_companies(&NoopSink).unwrap();

    assert_eq!(second.created, 0);
    assert_eq!(second.skipped_existing, 3);
    assert_eq!(app.database().count(Table::Companies).unwrap(), 3);
}

#[test]
fn garbage_archive_is_corrupt() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("empresas_data.zip");
    fs::write(&archive, b"<html>maintenance</html>").unwrap();

    let mut app = app_for(&archive);
    assert_matches!(
        app.import_companies(&NoopSink),
        Err(ImportError::CorruptArchive { .. })
    );
    assert_eq!(app.database().count(Table::Companies).unwrap(), 0);
}

#[test]
fn failing_bulk_insert_falls_back_to_single_rows() {
    let importer = CompanyImporter::new("http://unused", &PathBuf::from("unused.zip"), 1000).unwrap();
    let mut store = PickyStore {
        poisoned: 500,
        ..PickyStore::default()
    };
    let mut report = CompanyReport::default();

    importer
        .import_rows(
            Cursor::new(generated_rows(1000)),
            &mut store,
            &CancelToken::new(),
            &NoopSink,
            &mut report,
        )
        .unwrap();

    assert_eq!(store.bulk_attempts, 1);
    assert_eq!(report.created, 999);
    assert_eq!(report.failed, 1);
    assert!(!store.stored.contains(&500));
}

#[test]
fn rows_are_flushed_per_batch() {
    let importer = CompanyImporter::new("http://unused", &PathBuf::from("unused.zip"), 1000).unwrap();
    let mut db = Database::open_in_memory().unwrap();
    let mut report = CompanyReport::default();

    importer
        .import_rows(
            Cursor::new(generated_rows(2500)),
            &mut db,
            &CancelToken::new(),
            &NoopSink,
            &mut report,
        )
        .unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.created, 2500);
    assert_eq!(db.count(Table::Companies).unwrap(), 2500);
}

#[test]
fn cancellation_drops_the_pending_batch() {
    let importer = CompanyImporter::new("http://unused", &PathBuf::from("unused.zip"), 1000).unwrap();
    let mut db = Database::open_in_memory().unwrap();
    let mut report = CompanyReport::default();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = importer.import_rows(
        Cursor::new(generated_rows(10)),
        &mut db,
        &cancel,
        &NoopSink,
        &mut report,
    );

    assert_matches!(result, Err(ImportError::Cancelled));
    assert_eq!(report.rows_read, 0);
    assert_eq!(db.count(Table::Companies).unwrap(), 0);
}
