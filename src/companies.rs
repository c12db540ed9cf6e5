//! Import of the Receita Federal "Empresas" ledger.
//!
//! The archive is a zip of `;`-separated, ISO-8859-1 encoded files without a
//! header row. Each row maps onto one [`CompanyRecord`]; rows that cannot be
//! keyed are skipped and counted, never fatal.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app::{CancelToken, ProgressEvent, ProgressSink};
use crate::domain::CompanyRecord;
use crate::error::ImportError;
use crate::fetch::{Downloader, FetchedArchive};
use crate::fs_util;
use crate::writer::{FlushOutcome, RecordStore, flush_with_fallback};

/// Archive entries that carry company rows.
pub const ENTRY_PATTERN: &str = r"(?i)(\.csv|EMPRECSV)$";
const MIN_FIELDS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has {found} fields, expected at least 7")]
    ShortRecord { found: usize },
    #[error("row has no usable base CNPJ")]
    MissingId,
}

/// Keeps the digits of `raw` and parses them, saturating at `i32::MAX`.
/// Anything without digits reads as 0.
pub fn parse_int_field(raw: &str) -> i32 {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return 0;
    }
    // More than ten significant digits cannot fit; skip the parse.
    if significant.len() > 10 {
        return i32::MAX;
    }
    significant
        .parse::<i64>()
        .map(|value| value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
        .unwrap_or(i32::MAX)
}

/// ISO-8859-1 maps every byte onto the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

pub fn parse_company_row(record: &ByteRecord) -> Result<CompanyRecord, RowError> {
    if record.len() < MIN_FIELDS {
        return Err(RowError::ShortRecord {
            found: record.len(),
        });
    }
    let field = |index: usize| decode_latin1(record.get(index).unwrap_or_default());

    let base_cnpj = parse_int_field(&field(0));
    if base_cnpj == 0 {
        return Err(RowError::MissingId);
    }
    let federative_entity = field(6).trim().to_string();
    Ok(CompanyRecord {
        base_cnpj,
        legal_name: field(1).trim().to_string(),
        legal_nature: parse_int_field(&field(2)),
        responsible_qualification: parse_int_field(&field(3)),
        capital: parse_int_field(&field(4)),
        size_class: parse_int_field(&field(5)),
        federative_entity: (!federative_entity.is_empty()).then_some(federative_entity),
    })
}

/// Where a ledger import currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LedgerPhase {
    NotDownloaded,
    Downloading,
    Downloaded,
    Extracting,
    StreamingRows,
    BatchFull,
    Flushing,
    Done,
}

impl LedgerPhase {
    fn progress_phase(self) -> &'static str {
        match self {
            LedgerPhase::NotDownloaded | LedgerPhase::Downloading => "Fetch",
            LedgerPhase::Downloaded | LedgerPhase::Extracting => "Extract",
            LedgerPhase::StreamingRows | LedgerPhase::BatchFull | LedgerPhase::Flushing => "Write",
            LedgerPhase::Done => "Done",
        }
    }
}

impl fmt::Display for LedgerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LedgerPhase::NotDownloaded => "not downloaded",
            LedgerPhase::Downloading => "downloading",
            LedgerPhase::Downloaded => "downloaded",
            LedgerPhase::Extracting => "extracting",
            LedgerPhase::StreamingRows => "streaming rows",
            LedgerPhase::BatchFull => "batch full",
            LedgerPhase::Flushing => "flushing",
            LedgerPhase::Done => "done",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyReport {
    pub archive: Option<FetchedArchive>,
    pub entries: Vec<String>,
    pub rows_read: usize,
    pub short_rows: usize,
    pub rows_without_id: usize,
    pub created: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    pub batches: usize,
    pub phase: LedgerPhase,
    pub elapsed_ms: u128,
}

impl Default for CompanyReport {
    fn default() -> Self {
        Self {
            archive: None,
            entries: Vec::new(),
            rows_read: 0,
            short_rows: 0,
            rows_without_id: 0,
            created: 0,
            skipped_existing: 0,
            failed: 0,
            batches: 0,
            phase: LedgerPhase::NotDownloaded,
            elapsed_ms: 0,
        }
    }
}

impl CompanyReport {
    pub fn discarded(&self) -> usize {
        self.short_rows + self.rows_without_id
    }

    fn absorb(&mut self, outcome: FlushOutcome) {
        self.created += outcome.created;
        self.skipped_existing += outcome.skipped_existing;
        self.failed += outcome.failed;
        self.batches += 1;
    }
}

pub struct CompanyImporter {
    archive_url: String,
    archive_path: PathBuf,
    batch_size: usize,
    entry_pattern: Regex,
}

impl CompanyImporter {
    pub fn new(
        archive_url: &str,
        archive_path: &Path,
        batch_size: usize,
    ) -> Result<Self, ImportError> {
        let entry_pattern =
            Regex::new(ENTRY_PATTERN).map_err(|err| ImportError::Config(err.to_string()))?;
        Ok(Self {
            archive_url: archive_url.to_string(),
            archive_path: archive_path.to_path_buf(),
            batch_size: batch_size.max(1),
            entry_pattern,
        })
    }

    /// Downloads the archive unless it is already on disk, then streams every
    /// matching entry into `store`.
    pub fn run<D, S>(
        &self,
        downloader: &D,
        store: &mut S,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<CompanyReport, ImportError>
    where
        D: Downloader + ?Sized,
        S: RecordStore<CompanyRecord> + ?Sized,
    {
        let mut report = CompanyReport::default();
        self.enter(&mut report, LedgerPhase::Downloading, &self.archive_url, sink);
        let archive =
            downloader.fetch(&self.archive_url, &self.archive_path, cancel, sink)?;
        let path = archive.path.clone();
        report.archive = Some(archive);
        self.enter(
            &mut report,
            LedgerPhase::Downloaded,
            &path.display().to_string(),
            sink,
        );

        self.import_archive(&path, store, cancel, sink, &mut report)?;
        self.enter(&mut report, LedgerPhase::Done, "", sink);
        info!(
            created = report.created,
            skipped = report.skipped_existing,
            failed = report.failed,
            discarded = report.discarded(),
            "company ledger imported"
        );
        Ok(report)
    }

    pub fn import_archive<S>(
        &self,
        path: &Path,
        store: &mut S,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        report: &mut CompanyReport,
    ) -> Result<(), ImportError>
    where
        S: RecordStore<CompanyRecord> + ?Sized,
    {
        self.enter(report, LedgerPhase::Extracting, &path.display().to_string(), sink);
        let mut archive = fs_util::open_archive(path)?;
        let entries = fs_util::matching_entries(&archive, &self.entry_pattern);
        if entries.is_empty() {
            warn!(path = %path.display(), "archive has no company entries");
        }

        for name in entries {
            let entry = archive
                .by_name(&name)
                .map_err(|err| ImportError::CorruptArchive {
                    path: path.to_path_buf(),
                    message: format!("{name}: {err}"),
                })?;
            info!(entry = %name, "streaming company rows");
            report.entries.push(name.clone());
            self.import_rows(entry, store, cancel, sink, report)
                .map_err(|err| match err {
                    ImportError::CorruptArchive { message, .. } => ImportError::CorruptArchive {
                        path: path.to_path_buf(),
                        message: format!("{name}: {message}"),
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Streams rows from one decoded entry. A failing row only costs that row;
    /// unreadable input is fatal.
    pub fn import_rows<R, S>(
        &self,
        reader: R,
        store: &mut S,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        report: &mut CompanyReport,
    ) -> Result<(), ImportError>
    where
        R: Read,
        S: RecordStore<CompanyRecord> + ?Sized,
    {
        self.enter(report, LedgerPhase::StreamingRows, "", sink);
        let mut rows = ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b';')
            .quote(b'"')
            .flexible(true)
            .from_reader(reader);

        let mut record = ByteRecord::new();
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            if cancel.is_cancelled() {
                info!(pending = batch.len(), "company import cancelled, dropping in-flight batch");
                return Err(ImportError::Cancelled);
            }
            let more = rows
                .read_byte_record(&mut record)
                .map_err(|err| ImportError::CorruptArchive {
                    path: PathBuf::new(),
                    message: err.to_string(),
                })?;
            if !more {
                break;
            }
            report.rows_read += 1;
            match parse_company_row(&record) {
                Ok(company) => batch.push(company),
                Err(err) => {
                    debug!(row = report.rows_read, error = %err, "discarding company row");
                    match err {
                        RowError::ShortRecord { .. } => report.short_rows += 1,
                        RowError::MissingId => report.rows_without_id += 1,
                    }
                }
            }
            if batch.len() >= self.batch_size {
                self.enter(report, LedgerPhase::BatchFull, "", sink);
                self.flush(std::mem::take(&mut batch), store, sink, report)?;
                self.enter(report, LedgerPhase::StreamingRows, "", sink);
            }
        }
        if !batch.is_empty() {
            self.flush(batch, store, sink, report)?;
        }
        Ok(())
    }

    fn flush<S>(
        &self,
        batch: Vec<CompanyRecord>,
        store: &mut S,
        sink: &dyn ProgressSink,
        report: &mut CompanyReport,
    ) -> Result<(), ImportError>
    where
        S: RecordStore<CompanyRecord> + ?Sized,
    {
        report.phase = LedgerPhase::Flushing;
        let rows = batch.len();
        let outcome = flush_with_fallback(store, batch)?;
        report.absorb(outcome);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Write; empresas batch {} ({rows} rows), {} created, {} failed",
                report.batches, report.created, report.failed
            ),
            elapsed: None,
        });
        Ok(())
    }

    fn enter(
        &self,
        report: &mut CompanyReport,
        phase: LedgerPhase,
        detail: &str,
        sink: &dyn ProgressSink,
    ) {
        if report.phase == phase {
            return;
        }
        debug!(from = %report.phase, to = %phase, "ledger phase");
        report.phase = phase;
        if matches!(phase, LedgerPhase::BatchFull | LedgerPhase::StreamingRows) {
            return;
        }
        let message = if detail.is_empty() {
            format!("phase={}; {phase}", phase.progress_phase())
        } else {
            format!("phase={}; {phase} {detail}", phase.progress_phase())
        };
        sink.event(ProgressEvent {
            message,
            elapsed: None,
        });
    }
}
