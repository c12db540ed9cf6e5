use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::app::{CancelToken, ProgressEvent, ProgressSink};
use crate::domain::District;
use crate::error::ImportError;
use crate::hierarchy::{ValidRecord, json_id, validate_record};
use crate::store::{self, Database, MunicipalityAncestry};
use crate::writer::{FlushOutcome, flush_with_fallback};

/// Why a district could not be attached to the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    MissingMunicipality,
    MissingMicroregion,
    MissingImmediateRegion,
}

impl GapReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GapReason::MissingMunicipality => "missing_municipality",
            GapReason::MissingMicroregion => "missing_microregion",
            GapReason::MissingImmediateRegion => "missing_immediate_region",
        }
    }
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DistrictReport {
    pub processed: usize,
    pub invalid: usize,
    pub existing: usize,
    pub gaps: BTreeMap<GapReason, usize>,
    pub created: usize,
    pub failed: usize,
    pub batches: usize,
}

impl DistrictReport {
    pub fn gap_total(&self) -> usize {
        self.gaps.values().sum()
    }
}

/// Copies the ancestry of the owning municipality onto the district.
pub fn materialize(
    record: ValidRecord,
    municipality_id: Option<i64>,
    ancestry: &HashMap<i64, MunicipalityAncestry>,
) -> Result<District, GapReason> {
    let owner = municipality_id
        .and_then(|id| ancestry.get(&id))
        .ok_or(GapReason::MissingMunicipality)?;
    let micro = owner.microregion.ok_or(GapReason::MissingMicroregion)?;
    let immediate = owner
        .immediate_region
        .ok_or(GapReason::MissingImmediateRegion)?;
    Ok(District {
        id: record.id,
        name: record.name,
        municipality_id: owner.municipality_id,
        microregion_id: micro.microregion_id,
        mesoregion_id: micro.mesoregion_id,
        state_id: micro.state_id,
        region_id: micro.region_id,
        immediate_region_id: immediate.immediate_region_id,
        intermediate_region_id: immediate.intermediate_region_id,
    })
}

/// Attaches raw `distritos` records to the stored municipalities and writes
/// them `batch_size` at a time, each batch in its own transaction.
pub fn resolve_districts(
    db: &mut Database,
    raw_districts: &[Value],
    batch_size: usize,
    cancel: &CancelToken,
    sink: &dyn ProgressSink,
) -> Result<DistrictReport, ImportError> {
    let ancestry = db.load_municipality_ancestry()?;
    let mut existing = store::existing_ids::<District>(db.connection())?;
    info!(
        municipalities = ancestry.len(),
        existing = existing.len(),
        "resolving districts"
    );

    let mut report = DistrictReport::default();
    let mut pending = Vec::new();
    for raw in raw_districts {
        report.processed += 1;
        let record = match validate_record(raw, "distrito") {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping invalid district");
                report.invalid += 1;
                continue;
            }
        };
        if existing.contains(&record.id) {
            report.existing += 1;
            continue;
        }

        let municipality_id = raw
            .get("municipio")
            .and_then(|municipio| municipio.get("id"))
            .and_then(json_id);
        let district_id = record.id;
        match materialize(record, municipality_id, &ancestry) {
            Ok(district) => {
                existing.insert(district.id);
                pending.push(district);
            }
            Err(reason) => {
                let gap = ImportError::IntegrityGap {
                    entity: "distrito",
                    id: district_id,
                    reason: reason.as_str(),
                };
                warn!(municipality = ?municipality_id, "{gap}");
                *report.gaps.entry(reason).or_default() += 1;
            }
        }
    }

    let total_batches = pending.len().div_ceil(batch_size.max(1));
    let mut written = FlushOutcome::default();
    let mut rows = pending.into_iter().peekable();
    while rows.peek().is_some() {
        if cancel.is_cancelled() {
            info!(batches = report.batches, "district import cancelled");
            return Err(ImportError::Cancelled);
        }
        let batch: Vec<District> = rows.by_ref().take(batch_size.max(1)).collect();
        written.merge(flush_with_fallback(db, batch)?);
        report.batches += 1;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Write; distritos batch {}/{total_batches}, {} created",
                report.batches, written.created
            ),
            elapsed: None,
        });
    }

    report.created = written.created;
    report.failed = written.failed;
    report.existing += written.skipped_existing;
    info!(
        processed = report.processed,
        created = report.created,
        gaps = report.gap_total(),
        invalid = report.invalid,
        "districts resolved"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{ImmediateRegionChain, MicroregionChain};

    struct NoopSink;

    impl ProgressSink for NoopSink {
        fn event(&self, _event: ProgressEvent) {}
    }

    fn record(id: i64) -> ValidRecord {
        ValidRecord {
            id,
            name: format!("Distrito {id}"),
        }
    }

    fn ancestry(with_micro: bool, with_immediate: bool) -> HashMap<i64, MunicipalityAncestry> {
        HashMap::from([(
            1100015,
            MunicipalityAncestry {
                municipality_id: 1100015,
                microregion: with_micro.then_some(MicroregionChain {
                    microregion_id: 11006,
                    mesoregion_id: 1102,
                    state_id: 11,
                    region_id: 1,
                }),
                immediate_region: with_immediate.then_some(ImmediateRegionChain {
                    immediate_region_id: 110005,
                    intermediate_region_id: 1102,
                }),
            },
        )])
    }

    #[test]
    fn copies_every_ancestor_key() {
        let district = materialize(record(110001505), Some(1100015), &ancestry(true, true)).unwrap();
        assert_eq!(district.municipality_id, 1100015);
        assert_eq!(district.microregion_id, 11006);
        assert_eq!(district.region_id, 1);
        assert_eq!(district.intermediate_region_id, 1102);
    }

    #[test]
    fn gap_reasons() {
        assert_eq!(
            materialize(record(1), Some(42), &ancestry(true, true)),
            Err(GapReason::MissingMunicipality)
        );
        assert_eq!(
            materialize(record(1), None, &ancestry(true, true)),
            Err(GapReason::MissingMunicipality)
        );
        assert_eq!(
            materialize(record(1), Some(1100015), &ancestry(false, true)),
            Err(GapReason::MissingMicroregion)
        );
        assert_eq!(
            materialize(record(1), Some(1100015), &ancestry(true, false)),
            Err(GapReason::MissingImmediateRegion)
        );
    }

    #[test]
    fn repeated_gap_district_is_not_counted_as_existing() {
        let mut db = Database::open_in_memory().unwrap();
        let orphan = json!({"id": 10, "nome": "Distrito 10", "municipio": {"id": 999}});
        let report = resolve_districts(
            &mut db,
            &[orphan.clone(), orphan],
            500,
            &CancelToken::new(),
            &NoopSink,
        )
        .unwrap();
        assert_eq!(report.existing, 0);
        assert_eq!(report.gaps.get(&GapReason::MissingMunicipality), Some(&2));
        assert_eq!(report.created, 0);
    }
}
