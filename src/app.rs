use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::companies::{CompanyImporter, CompanyReport};
use crate::config::ResolvedConfig;
use crate::districts::{DistrictReport, resolve_districts};
use crate::domain::{ImportTarget, Table, TableGroup};
use crate::error::ImportError;
use crate::fetch::Downloader;
use crate::hierarchy::{
    HierarchyBatch, HierarchyFragment, extract_hierarchy, extract_state, validate_record,
};
use crate::ibge::GeographyApi;
use crate::store::Database;
use crate::writer::write_hierarchy;

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Geography,
    Companies,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Shared flag a long-running import polls between batches and chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ImportError> {
        if self.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatesReport {
    pub processed: usize,
    pub invalid: usize,
    pub regions_created: usize,
    pub states_created: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MunicipalitiesReport {
    pub processed: usize,
    pub invalid: usize,
    pub duplicates: usize,
    /// Rows created per table, hierarchy levels included.
    pub created: BTreeMap<Table, usize>,
}

impl MunicipalitiesReport {
    pub fn municipalities_created(&self) -> usize {
        self.created.get(&Table::Municipalities).copied().unwrap_or(0)
    }
}

/// Aggregate counts across every part of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeographyReport {
    pub target: ImportTarget,
    pub started_at: String,
    pub elapsed_ms: u128,
    pub totals: Totals,
    pub states: Option<StatesReport>,
    pub municipalities: Option<MunicipalitiesReport>,
    pub districts: Option<DistrictReport>,
}

impl GeographyReport {
    fn compute_totals(&self) -> Totals {
        let mut totals = Totals::default();
        if let Some(states) = &self.states {
            let valid = states.processed - states.invalid;
            totals.processed += states.processed;
            totals.created += states.states_created;
            totals.skipped += valid.saturating_sub(states.states_created);
            totals.errored += states.invalid;
        }
        if let Some(municipalities) = &self.municipalities {
            let valid = municipalities.processed - municipalities.invalid;
            let created = municipalities.municipalities_created();
            totals.processed += municipalities.processed;
            totals.created += created;
            totals.skipped += valid.saturating_sub(created);
            totals.errored += municipalities.invalid;
        }
        if let Some(districts) = &self.districts {
            totals.processed += districts.processed;
            totals.created += districts.created;
            totals.skipped += districts.existing + districts.gap_total();
            totals.errored += districts.invalid + districts.failed;
        }
        totals
    }
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub model: String,
    pub app: TableGroup,
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub app: TableGroup,
    pub model: String,
    pub table: Table,
    pub deleted: usize,
    /// Rows removed per table, cascaded dependents included.
    pub details: BTreeMap<Table, usize>,
    pub elapsed_ms: u128,
}

pub struct App<G: GeographyApi, D: Downloader> {
    db: Database,
    api: G,
    downloader: D,
    config: ResolvedConfig,
    cancel: CancelToken,
}

impl<G: GeographyApi, D: Downloader> App<G, D> {
    pub fn new(db: Database, api: G, downloader: D, config: ResolvedConfig) -> Self {
        Self {
            db,
            api,
            downloader,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn import_geography(
        &mut self,
        target: ImportTarget,
        sink: &dyn ProgressSink,
    ) -> Result<GeographyReport, ImportError> {
        let started_at = chrono::Local::now().to_rfc3339();
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; importing {target}"),
            elapsed: None,
        });

        let mut report = GeographyReport {
            target,
            started_at,
            elapsed_ms: 0,
            totals: Totals::default(),
            states: None,
            municipalities: None,
            districts: None,
        };
        if target.includes_states() {
            report.states = Some(self.import_states(sink)?);
        }
        if target.includes_municipalities() {
            self.cancel.check()?;
            report.municipalities = Some(self.import_municipalities(sink)?);
        }
        if target.includes_districts() {
            self.cancel.check()?;
            report.districts = Some(self.import_districts(sink)?);
        }

        report.totals = report.compute_totals();
        report.elapsed_ms = start.elapsed().as_millis();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} created, {} skipped, {} errored",
                report.totals.created, report.totals.skipped, report.totals.errored
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    pub fn import_states(&mut self, sink: &dyn ProgressSink) -> Result<StatesReport, ImportError> {
        sink.event(ProgressEvent {
            message: "phase=Fetch; estados".to_string(),
            elapsed: None,
        });
        let records = self.api.estados()?;
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {} estados", records.len()),
            elapsed: None,
        });

        let mut report = StatesReport {
            processed: records.len(),
            ..StatesReport::default()
        };
        let mut batch = HierarchyBatch::new();
        for raw in &records {
            match extract_state(raw) {
                Ok((region, state)) => batch.absorb(&HierarchyFragment {
                    region: Some(region),
                    state: Some(state),
                    ..HierarchyFragment::default()
                }),
                Err(err) => {
                    warn!(error = %err, "skipping invalid state");
                    report.invalid += 1;
                }
            }
        }

        self.cancel.check()?;
        sink.event(ProgressEvent {
            message: format!("phase=Write; {} estados", batch.states.len()),
            elapsed: None,
        });
        let counts = write_hierarchy(&mut self.db, &batch, &[], self.config.geography_batch_size)?;
        report.regions_created = counts.get(&Table::Regions).copied().unwrap_or(0);
        report.states_created = counts.get(&Table::States).copied().unwrap_or(0);
        info!(
            processed = report.processed,
            created = report.states_created,
            "states imported"
        );
        Ok(report)
    }

    pub fn import_municipalities(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<MunicipalitiesReport, ImportError> {
        sink.event(ProgressEvent {
            message: "phase=Fetch; municipios".to_string(),
            elapsed: None,
        });
        let records = self.api.municipios()?;
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {} municipios", records.len()),
            elapsed: None,
        });

        let mut report = MunicipalitiesReport {
            processed: records.len(),
            ..MunicipalitiesReport::default()
        };
        let mut batch = HierarchyBatch::new();
        let mut seen = HashSet::new();
        let mut municipalities = Vec::with_capacity(records.len());
        for raw in &records {
            let record = match validate_record(raw, "municipio") {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping invalid municipality");
                    report.invalid += 1;
                    continue;
                }
            };
            if !seen.insert(record.id) {
                report.duplicates += 1;
                continue;
            }
            let fragment = extract_hierarchy(raw);
            batch.absorb(&fragment);
            municipalities.push(fragment.municipality(&record));
        }

        self.cancel.check()?;
        sink.event(ProgressEvent {
            message: format!("phase=Write; {} municipios", municipalities.len()),
            elapsed: None,
        });
        report.created = write_hierarchy(
            &mut self.db,
            &batch,
            &municipalities,
            self.config.geography_batch_size,
        )?;
        info!(
            processed = report.processed,
            created = report.municipalities_created(),
            invalid = report.invalid,
            "municipalities imported"
        );
        Ok(report)
    }

    pub fn import_districts(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<DistrictReport, ImportError> {
        sink.event(ProgressEvent {
            message: "phase=Fetch; distritos".to_string(),
            elapsed: None,
        });
        let records = self.api.distritos()?;
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {} distritos", records.len()),
            elapsed: None,
        });
        resolve_districts(
            &mut self.db,
            &records,
            self.config.geography_batch_size,
            &self.cancel,
            sink,
        )
    }

    pub fn import_companies(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<CompanyReport, ImportError> {
        let importer = CompanyImporter::new(
            &self.config.archive_url,
            self.config.archive_path.as_std_path(),
            self.config.company_batch_size,
        )?;
        let start = Instant::now();
        let mut report = importer.run(&self.downloader, &mut self.db, &self.cancel, sink)?;
        report.elapsed_ms = start.elapsed().as_millis();
        Ok(report)
    }

    pub fn delete_table(
        &mut self,
        request: &DeleteRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DeleteReport, ImportError> {
        let start = Instant::now();
        let table = Table::resolve(request.app, &request.model)?;
        if !request.confirm {
            return Err(ImportError::ConfirmationRequired(table.name().to_string()));
        }

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} -> {table}", request.model),
            elapsed: None,
        });
        let present = self.db.count(table)?;
        let (deleted, details) = if present == 0 {
            info!(%table, "table already empty");
            (0, BTreeMap::new())
        } else {
            sink.event(ProgressEvent {
                message: format!("phase=Write; deleting {present} rows from {table}"),
                elapsed: None,
            });
            let outcome = self.db.delete_all(table)?;
            info!(%table, deleted = outcome.deleted, "table cleared");
            (outcome.deleted, outcome.details)
        };

        sink.event(ProgressEvent {
            message: format!("phase=Done; {deleted} rows deleted"),
            elapsed: Some(start.elapsed()),
        });
        Ok(DeleteReport {
            app: request.app,
            model: request.model.clone(),
            table,
            deleted,
            details,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }
}
