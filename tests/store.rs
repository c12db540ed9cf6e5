use camino::Utf8PathBuf;
use serde_json::json;

use ibge_importer::domain::{Municipality, Region, State, Table};
use ibge_importer::hierarchy::{HierarchyBatch, extract_hierarchy, validate_record};
use ibge_importer::store::Database;
use ibge_importer::writer::write_hierarchy;

fn seed(db: &mut Database) {
    let raw = json!({
        "id": 3550308,
        "nome": "São Paulo",
        "microrregiao": {
            "id": 35061,
            "nome": "São Paulo",
            "mesorregiao": {
                "id": 3515,
                "nome": "Metropolitana de São Paulo",
                "UF": {
                    "id": 35,
                    "sigla": "SP",
                    "nome": "São Paulo",
                    "regiao": {"id": 3, "sigla": "SE", "nome": "Sudeste"}
                }
            }
        },
        "regiao-imediata": {
            "id": 350001,
            "nome": "São Paulo",
            "regiao-intermediaria": {"id": 3501, "nome": "São Paulo"}
        }
    });
    let record = validate_record(&raw, "municipio").unwrap();
    let fragment = extract_hierarchy(&raw);
    let batch = HierarchyBatch::from_fragments([&fragment]);
    let municipalities: Vec<Municipality> = vec![fragment.municipality(&record)];
    write_hierarchy(db, &batch, &municipalities, 100).unwrap();
}

#[test]
fn reopening_a_file_database_keeps_rows() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("data").join("ibge.sqlite3")).unwrap();

    {
        let mut db = Database::open(&path).unwrap();
        seed(&mut db);
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.count(Table::Municipalities).unwrap(), 1);
    assert_eq!(db.count(Table::ImmediateRegions).unwrap(), 1);
    assert_eq!(db.foreign_key_violations().unwrap(), 0);
}

#[test]
fn ancestry_joins_both_chains() {
    let mut db = Database::open_in_memory().unwrap();
    seed(&mut db);

    let ancestry = db.load_municipality_ancestry().unwrap();
    let sao_paulo = &ancestry[&3550308];
    let micro = sao_paulo.microregion.unwrap();
    assert_eq!(
        (micro.microregion_id, micro.mesoregion_id, micro.state_id, micro.region_id),
        (35061, 3515, 35, 3)
    );
    let immediate = sao_paulo.immediate_region.unwrap();
    assert_eq!(
        (immediate.immediate_region_id, immediate.intermediate_region_id),
        (350001, 3501)
    );
}

#[test]
fn deleting_a_state_cascades_down_both_branches() {
    let mut db = Database::open_in_memory().unwrap();
    seed(&mut db);

    let outcome = db.delete_all(Table::States).unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(!outcome.details.contains_key(&Table::Regions));
    for table in [
        Table::States,
        Table::IntermediateRegions,
        Table::ImmediateRegions,
        Table::Mesoregions,
        Table::Microregions,
        Table::Municipalities,
    ] {
        assert_eq!(outcome.details.get(&table), Some(&1), "{table}");
    }
    assert_eq!(db.count(Table::Regions).unwrap(), 1);
}

#[test]
fn failed_hierarchy_write_rolls_back_every_level() {
    let mut db = Database::open_in_memory().unwrap();
    let mut batch = HierarchyBatch::new();
    batch.regions.insert(
        1,
        Region {
            id: 1,
            short_code: "N".to_string(),
            name: "Norte".to_string(),
        },
    );
    batch.states.insert(
        11,
        State {
            id: 11,
            short_code: "RO".to_string(),
            name: "Rondônia".to_string(),
            region_id: 1,
        },
    );
    let dangling = Municipality {
        id: 1100015,
        name: "Alta Floresta D'Oeste".to_string(),
        microregion_id: Some(777),
        immediate_region_id: None,
    };

    assert!(write_hierarchy(&mut db, &batch, &[dangling], 100).is_err());
    assert_eq!(db.count(Table::Regions).unwrap(), 0);
    assert_eq!(db.count(Table::States).unwrap(), 0);
    assert_eq!(db.count(Table::Municipalities).unwrap(), 0);
}
