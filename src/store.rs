use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use camino::Utf8Path;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;

use crate::domain::{
    CompanyRecord, District, ImmediateRegion, IntermediateRegion, Mesoregion, Microregion,
    Municipality, Region, State, Table,
};
use crate::error::ImportError;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on ids bound into a single `IN (...)` lookup.
const LOOKUP_CHUNK: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS regions (
    id INTEGER PRIMARY KEY,
    short_code TEXT NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS states (
    id INTEGER PRIMARY KEY,
    short_code TEXT NOT NULL,
    name TEXT NOT NULL,
    region_id INTEGER NOT NULL REFERENCES regions(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS intermediate_regions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    state_id INTEGER NOT NULL REFERENCES states(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS immediate_regions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    intermediate_region_id INTEGER NOT NULL REFERENCES intermediate_regions(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS mesoregions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    state_id INTEGER NOT NULL REFERENCES states(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS microregions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    mesoregion_id INTEGER NOT NULL REFERENCES mesoregions(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS municipalities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    microregion_id INTEGER REFERENCES microregions(id) ON DELETE CASCADE,
    immediate_region_id INTEGER REFERENCES immediate_regions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS municipalities_name_idx ON municipalities(name);
CREATE INDEX IF NOT EXISTS municipalities_microregion_idx ON municipalities(microregion_id);
CREATE INDEX IF NOT EXISTS municipalities_immediate_region_idx ON municipalities(immediate_region_id);
CREATE TABLE IF NOT EXISTS districts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    municipality_id INTEGER NOT NULL REFERENCES municipalities(id) ON DELETE CASCADE,
    microregion_id INTEGER NOT NULL REFERENCES microregions(id) ON DELETE CASCADE,
    mesoregion_id INTEGER NOT NULL REFERENCES mesoregions(id) ON DELETE CASCADE,
    state_id INTEGER NOT NULL REFERENCES states(id) ON DELETE CASCADE,
    region_id INTEGER NOT NULL REFERENCES regions(id) ON DELETE CASCADE,
    immediate_region_id INTEGER NOT NULL REFERENCES immediate_regions(id) ON DELETE CASCADE,
    intermediate_region_id INTEGER NOT NULL REFERENCES intermediate_regions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS districts_municipality_idx ON districts(municipality_id);
CREATE TABLE IF NOT EXISTS companies (
    base_cnpj INTEGER PRIMARY KEY,
    legal_name TEXT NOT NULL,
    legal_nature INTEGER NOT NULL,
    responsible_qualification INTEGER NOT NULL,
    capital INTEGER NOT NULL,
    size_class INTEGER NOT NULL,
    federative_entity TEXT
);
CREATE INDEX IF NOT EXISTS companies_legal_name_idx ON companies(legal_name);
";

/// A row type that maps onto one table.
pub trait Insertable {
    const TABLE: Table;
    const KEY: &'static str;
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> i64;
    fn values(&self) -> Vec<Value>;
}

/// Ancestry of one municipality, as joined from the hierarchy tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MunicipalityAncestry {
    pub municipality_id: i64,
    pub microregion: Option<MicroregionChain>,
    pub immediate_region: Option<ImmediateRegionChain>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroregionChain {
    pub microregion_id: i64,
    pub mesoregion_id: i64,
    pub state_id: i64,
    pub region_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateRegionChain {
    pub immediate_region_id: i64,
    pub intermediate_region_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub table: Table,
    pub deleted: usize,
    /// Rows removed per table, including cascaded dependents.
    pub details: BTreeMap<Table, usize>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Utf8Path) -> Result<Self, ImportError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| ImportError::Filesystem(err.to_string()))?;
            }
        }
        let conn = Connection::open(path.as_std_path())
            .map_err(|err| ImportError::Database(format!("open {path}: {err}")))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ImportError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ImportError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<(), ImportError> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(ImportError::Database(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        let tx = self.conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        tx.commit()?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn count(&self, table: Table) -> Result<usize, ImportError> {
        count_rows(&self.conn, table)
    }

    pub fn counts(&self) -> Result<BTreeMap<Table, usize>, ImportError> {
        Table::ALL
            .iter()
            .map(|table| Ok((*table, count_rows(&self.conn, *table)?)))
            .collect()
    }

    /// Number of rows violating a foreign key; zero on a consistent store.
    pub fn foreign_key_violations(&self) -> Result<usize, ImportError> {
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut violations = 0;
        while rows.next()?.is_some() {
            violations += 1;
        }
        Ok(violations)
    }

    /// Removes every row of `table`; dependents go with it through `ON DELETE CASCADE`.
    pub fn delete_all(&mut self, table: Table) -> Result<DeleteOutcome, ImportError> {
        let before = self.counts()?;
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        tx.commit()?;
        let after = self.counts()?;

        let details = before
            .into_iter()
            .filter_map(|(table, count)| {
                let removed = count.saturating_sub(after.get(&table).copied().unwrap_or(0));
                (removed > 0).then_some((table, removed))
            })
            .collect();

        Ok(DeleteOutcome {
            table,
            deleted,
            details,
        })
    }

    /// Loads every municipality with both ancestry chains in a single joined query.
    pub fn load_municipality_ancestry(
        &self,
    ) -> Result<HashMap<i64, MunicipalityAncestry>, ImportError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.microregion_id, mi.mesoregion_id, me.state_id, s.region_id,
                    m.immediate_region_id, im.intermediate_region_id
             FROM municipalities m
             LEFT JOIN microregions mi ON mi.id = m.microregion_id
             LEFT JOIN mesoregions me ON me.id = mi.mesoregion_id
             LEFT JOIN states s ON s.id = me.state_id
             LEFT JOIN immediate_regions im ON im.id = m.immediate_region_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let municipality_id: i64 = row.get(0)?;
            let micro: (Option<i64>, Option<i64>, Option<i64>, Option<i64>) =
                (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?);
            let immediate: (Option<i64>, Option<i64>) = (row.get(5)?, row.get(6)?);

            let microregion = match micro {
                (Some(microregion_id), Some(mesoregion_id), Some(state_id), Some(region_id)) => {
                    Some(MicroregionChain {
                        microregion_id,
                        mesoregion_id,
                        state_id,
                        region_id,
                    })
                }
                _ => None,
            };
            let immediate_region = match immediate {
                (Some(immediate_region_id), Some(intermediate_region_id)) => {
                    Some(ImmediateRegionChain {
                        immediate_region_id,
                        intermediate_region_id,
                    })
                }
                _ => None,
            };

            Ok(MunicipalityAncestry {
                municipality_id,
                microregion,
                immediate_region,
            })
        })?;

        let mut map = HashMap::new();
        for ancestry in rows {
            let ancestry = ancestry?;
            map.insert(ancestry.municipality_id, ancestry);
        }
        Ok(map)
    }
}

pub fn count_rows(conn: &Connection, table: Table) -> Result<usize, ImportError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

/// Every primary key currently stored for `T`.
pub fn existing_ids<T: Insertable>(conn: &Connection) -> Result<HashSet<i64>, ImportError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM {}", T::KEY, T::TABLE.name()))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// The subset of `ids` already stored for `T`.
pub fn existing_among<T: Insertable>(
    conn: &Connection,
    ids: &[i64],
) -> Result<HashSet<i64>, ImportError> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {key} FROM {table} WHERE {key} IN ({placeholders})",
            key = T::KEY,
            table = T::TABLE.name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?;
        for id in rows {
            found.insert(id?);
        }
    }
    Ok(found)
}

/// Multi-row `INSERT OR IGNORE`; returns the number of rows actually written.
pub fn insert_ignoring_conflicts<T: Insertable>(
    conn: &Connection,
    rows: &[T],
) -> Result<usize, rusqlite::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let row_placeholders = format!("({})", vec!["?"; T::COLUMNS.len()].join(", "));
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES {}",
        T::TABLE.name(),
        T::COLUMNS.join(", "),
        vec![row_placeholders.as_str(); rows.len()].join(", ")
    );
    let values = rows.iter().flat_map(|row| row.values());
    conn.execute(&sql, params_from_iter(values))
}

/// Plain `INSERT` of one row; conflicts surface as errors.
pub fn insert_one<T: Insertable>(conn: &Connection, row: &T) -> Result<(), rusqlite::Error> {
    let placeholders = vec!["?"; T::COLUMNS.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        T::TABLE.name(),
        T::COLUMNS.join(", ")
    );
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(row.values()))?;
    Ok(())
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn optional_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

impl Insertable for Region {
    const TABLE: Table = Table::Regions;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "short_code", "name"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), text(&self.short_code), text(&self.name)]
    }
}

impl Insertable for State {
    const TABLE: Table = Table::States;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "short_code", "name", "region_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.short_code),
            text(&self.name),
            Value::Integer(self.region_id),
        ]
    }
}

impl Insertable for IntermediateRegion {
    const TABLE: Table = Table::IntermediateRegions;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name", "state_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), text(&self.name), Value::Integer(self.state_id)]
    }
}

impl Insertable for ImmediateRegion {
    const TABLE: Table = Table::ImmediateRegions;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name", "intermediate_region_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.name),
            Value::Integer(self.intermediate_region_id),
        ]
    }
}

impl Insertable for Mesoregion {
    const TABLE: Table = Table::Mesoregions;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name", "state_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), text(&self.name), Value::Integer(self.state_id)]
    }
}

impl Insertable for Microregion {
    const TABLE: Table = Table::Microregions;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["id", "name", "mesoregion_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.name),
            Value::Integer(self.mesoregion_id),
        ]
    }
}

impl Insertable for Municipality {
    const TABLE: Table = Table::Municipalities;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "microregion_id", "immediate_region_id"];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.name),
            optional_int(self.microregion_id),
            optional_int(self.immediate_region_id),
        ]
    }
}

impl Insertable for District {
    const TABLE: Table = Table::Districts;
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "municipality_id",
        "microregion_id",
        "mesoregion_id",
        "state_id",
        "region_id",
        "immediate_region_id",
        "intermediate_region_id",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.name),
            Value::Integer(self.municipality_id),
            Value::Integer(self.microregion_id),
            Value::Integer(self.mesoregion_id),
            Value::Integer(self.state_id),
            Value::Integer(self.region_id),
            Value::Integer(self.immediate_region_id),
            Value::Integer(self.intermediate_region_id),
        ]
    }
}

impl Insertable for CompanyRecord {
    const TABLE: Table = Table::Companies;
    const KEY: &'static str = "base_cnpj";
    const COLUMNS: &'static [&'static str] = &[
        "base_cnpj",
        "legal_name",
        "legal_nature",
        "responsible_qualification",
        "capital",
        "size_class",
        "federative_entity",
    ];

    fn id(&self) -> i64 {
        i64::from(self.base_cnpj)
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(i64::from(self.base_cnpj)),
            text(&self.legal_name),
            Value::Integer(i64::from(self.legal_nature)),
            Value::Integer(i64::from(self.responsible_qualification)),
            Value::Integer(i64::from(self.capital)),
            Value::Integer(i64::from(self.size_class)),
            self.federative_entity
                .as_deref()
                .map(text)
                .unwrap_or(Value::Null),
        ]
    }
}
