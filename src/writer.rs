//! Dependency-ordered persistence on top of [`crate::store`].
//!
//! Geography levels are written parents first inside one transaction.
//! Leaf tables (districts, companies) go through [`flush_with_fallback`],
//! which degrades a failed bulk insert into row-by-row inserts.

use std::collections::{BTreeMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Municipality, Table};
use crate::error::ImportError;
use crate::hierarchy::HierarchyBatch;
use crate::store::{self, Database, Insertable};

/// Rows bound into one multi-row insert statement.
const MAX_ROWS_PER_STATEMENT: usize = 500;

/// Inserts the candidates whose id is not stored yet, `batch_size` rows per
/// statement. Returns the number of rows created.
pub fn create_missing<T: Insertable + Clone>(
    conn: &Connection,
    candidates: &[T],
    batch_size: usize,
) -> Result<usize, ImportError> {
    let existing = store::existing_ids::<T>(conn)?;
    let missing: Vec<&T> = candidates
        .iter()
        .filter(|row| !existing.contains(&row.id()))
        .collect();
    if missing.is_empty() {
        debug!(table = %T::TABLE, "nothing to create");
        return Ok(0);
    }

    let mut created = 0;
    for chunk in missing.chunks(batch_size.max(1)) {
        let rows: Vec<T> = chunk.iter().map(|row| (*row).clone()).collect();
        created += store::insert_ignoring_conflicts(conn, &rows).map_err(|err| {
            ImportError::BulkWrite {
                table: T::TABLE.name(),
                message: err.to_string(),
            }
        })?;
    }
    info!(table = %T::TABLE, created, "created missing rows");
    Ok(created)
}

/// Writes the six hierarchy levels and then the municipalities, all or nothing.
pub fn write_hierarchy(
    db: &mut Database,
    batch: &HierarchyBatch,
    municipalities: &[Municipality],
    batch_size: usize,
) -> Result<BTreeMap<Table, usize>, ImportError> {
    let tx = db.connection_mut().transaction()?;
    let mut counts = BTreeMap::new();

    let regions: Vec<_> = batch.regions.values().cloned().collect();
    counts.insert(Table::Regions, create_missing(&tx, &regions, batch_size)?);
    let states: Vec<_> = batch.states.values().cloned().collect();
    counts.insert(Table::States, create_missing(&tx, &states, batch_size)?);
    let intermediate: Vec<_> = batch.intermediate_regions.values().cloned().collect();
    counts.insert(
        Table::IntermediateRegions,
        create_missing(&tx, &intermediate, batch_size)?,
    );
    let immediate: Vec<_> = batch.immediate_regions.values().cloned().collect();
    counts.insert(
        Table::ImmediateRegions,
        create_missing(&tx, &immediate, batch_size)?,
    );
    let mesoregions: Vec<_> = batch.mesoregions.values().cloned().collect();
    counts.insert(Table::Mesoregions, create_missing(&tx, &mesoregions, batch_size)?);
    let microregions: Vec<_> = batch.microregions.values().cloned().collect();
    counts.insert(Table::Microregions, create_missing(&tx, &microregions, batch_size)?);
    counts.insert(
        Table::Municipalities,
        create_missing(&tx, municipalities, batch_size)?,
    );

    tx.commit()?;
    Ok(counts)
}

/// Storage seen by [`flush_with_fallback`].
pub trait RecordStore<T: Insertable> {
    /// The subset of `ids` already stored.
    fn existing_among(&self, ids: &[i64]) -> Result<HashSet<i64>, ImportError>;
    /// Inserts every row in one transaction; any failure rolls the batch back
    /// and is reported as [`ImportError::BulkWrite`].
    fn insert_batch(&mut self, rows: &[T]) -> Result<usize, ImportError>;
    /// Inserts a single row in its own transaction.
    fn insert_row(&mut self, row: &T) -> Result<(), ImportError>;
}

impl<T: Insertable> RecordStore<T> for Database {
    fn existing_among(&self, ids: &[i64]) -> Result<HashSet<i64>, ImportError> {
        store::existing_among::<T>(self.connection(), ids)
    }

    fn insert_batch(&mut self, rows: &[T]) -> Result<usize, ImportError> {
        let bulk_error = |err: rusqlite::Error| ImportError::BulkWrite {
            table: T::TABLE.name(),
            message: err.to_string(),
        };
        let tx = self.connection_mut().transaction().map_err(bulk_error)?;
        let mut written = 0;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            written += store::insert_ignoring_conflicts(&tx, chunk).map_err(bulk_error)?;
        }
        tx.commit().map_err(bulk_error)?;
        Ok(written)
    }

    fn insert_row(&mut self, row: &T) -> Result<(), ImportError> {
        let tx = self.connection_mut().transaction()?;
        store::insert_one(&tx, row)?;
        tx.commit()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushOutcome {
    pub created: usize,
    pub skipped_existing: usize,
    pub failed: usize,
}

impl FlushOutcome {
    pub fn merge(&mut self, other: FlushOutcome) {
        self.created += other.created;
        self.skipped_existing += other.skipped_existing;
        self.failed += other.failed;
    }
}

/// Writes one batch: ids already stored (or repeated within the batch) are
/// skipped, the rest go in as one bulk insert. When the bulk insert fails,
/// each row is retried alone and successes and failures are counted apart.
pub fn flush_with_fallback<T, S>(store: &mut S, batch: Vec<T>) -> Result<FlushOutcome, ImportError>
where
    T: Insertable,
    S: RecordStore<T> + ?Sized,
{
    let mut outcome = FlushOutcome::default();
    if batch.is_empty() {
        return Ok(outcome);
    }

    let ids: Vec<i64> = batch.iter().map(Insertable::id).collect();
    let existing = store.existing_among(&ids)?;
    let mut seen = HashSet::with_capacity(batch.len());
    let fresh: Vec<T> = batch
        .into_iter()
        .filter(|row| !existing.contains(&row.id()) && seen.insert(row.id()))
        .collect();
    outcome.skipped_existing = ids.len() - fresh.len();
    if fresh.is_empty() {
        return Ok(outcome);
    }

    match store.insert_batch(&fresh) {
        Ok(written) => {
            outcome.created = written;
            outcome.skipped_existing += fresh.len().saturating_sub(written);
        }
        Err(ImportError::BulkWrite { table, message }) => {
            warn!(%table, error = %message, rows = fresh.len(), "bulk insert failed, retrying row by row");
            for row in &fresh {
                match store.insert_row(row) {
                    Ok(()) => outcome.created += 1,
                    Err(err) => {
                        warn!(%table, id = row.id(), error = %err, "row insert failed");
                        outcome.failed += 1;
                    }
                }
            }
        }
        Err(err) => return Err(err),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::domain::{CompanyRecord, Region, State};

    fn company(base_cnpj: i32) -> CompanyRecord {
        CompanyRecord {
            base_cnpj,
            legal_name: format!("EMPRESA {base_cnpj}"),
            legal_nature: 2062,
            responsible_qualification: 49,
            capital: 1000,
            size_class: 1,
            federative_entity: None,
        }
    }

    /// Bulk inserts always fail; single-row inserts fail for `poisoned` ids.
    #[derive(Default)]
    struct FlakyStore {
        stored: BTreeSet<i64>,
        poisoned: HashSet<i64>,
    }

    impl RecordStore<CompanyRecord> for FlakyStore {
        fn existing_among(&self, ids: &[i64]) -> Result<HashSet<i64>, ImportError> {
            Ok(ids.iter().copied().filter(|id| self.stored.contains(id)).collect())
        }

        fn insert_batch(&mut self, _rows: &[CompanyRecord]) -> Result<usize, ImportError> {
            Err(ImportError::BulkWrite {
                table: "companies",
                message: "simulated".to_string(),
            })
        }

        fn insert_row(&mut self, row: &CompanyRecord) -> Result<(), ImportError> {
            if self.poisoned.contains(&row.id()) {
                return Err(ImportError::Database("simulated".to_string()));
            }
            self.stored.insert(row.id());
            Ok(())
        }
    }

    #[test]
    fn fallback_isolates_the_failing_row() {
        let mut store = FlakyStore {
            poisoned: HashSet::from([500]),
            ..FlakyStore::default()
        };
        let batch: Vec<_> = (1..=1000).map(company).collect();
        let outcome = flush_with_fallback(&mut store, batch).unwrap();
        assert_eq!(outcome.created, 999);
        assert_eq!(outcome.failed, 1);
        assert_eq!(store.stored.len(), 999);
        assert!(!store.stored.contains(&500));
    }

    #[test]
    fn flush_skips_existing_and_repeated_ids() {
        let mut db = Database::open_in_memory().unwrap();
        let first = flush_with_fallback(&mut db, vec![company(1), company(2), company(2)]).unwrap();
        assert_eq!(
            first,
            FlushOutcome {
                created: 2,
                skipped_existing: 1,
                failed: 0
            }
        );
        let second = flush_with_fallback(&mut db, vec![company(2), company(3)]).unwrap();
        assert_eq!(second.created, 1);
        assert_eq!(second.skipped_existing, 1);
        assert_eq!(db.count(Table::Companies).unwrap(), 3);
    }

    #[test]
    fn bulk_failure_on_real_store_falls_back() {
        let mut db = Database::open_in_memory().unwrap();
        let region = Region {
            id: 1,
            short_code: "N".to_string(),
            name: "Norte".to_string(),
        };
        store::insert_one(db.connection(), &region).unwrap();
        let good = State {
            id: 11,
            short_code: "RO".to_string(),
            name: "Rondônia".to_string(),
            region_id: 1,
        };
        let orphan = State {
            id: 99,
            short_code: "XX".to_string(),
            name: "Nowhere".to_string(),
            region_id: 42,
        };
        let outcome = flush_with_fallback(&mut db, vec![good, orphan]).unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(db.count(Table::States).unwrap(), 1);
        assert_eq!(db.foreign_key_violations().unwrap(), 0);
    }

    #[test]
    fn create_missing_only_writes_new_ids() {
        let db = Database::open_in_memory().unwrap();
        let regions: Vec<Region> = (1..=5)
            .map(|id| Region {
                id,
                short_code: format!("R{id}"),
                name: format!("Region {id}"),
            })
            .collect();
        assert_eq!(create_missing(db.connection(), &regions[..3], 2).unwrap(), 3);
        assert_eq!(create_missing(db.connection(), &regions, 2).unwrap(), 2);
        assert_eq!(create_missing(db.connection(), &regions, 2).unwrap(), 0);
    }
}
