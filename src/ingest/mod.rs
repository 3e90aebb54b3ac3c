//! Raw report ingestion stage.
//!
//! Walks the report archive, parses each vendor CSV into staging rows and
//! records one ingestion batch per file. Re-running is idempotent: a batch
//! is keyed by its source filename and rows upsert on
//! (batch, artist, track). Unparseable rows are counted and skipped; only
//! storage failures abort the run.

pub mod report_file;

use crate::anchor::{notify_fire_and_forget, AnchorNotifier};
use crate::ranking::score::composite_score;
use crate::registry_store::{IngestionBatch, RegistryStore, StagedRow};
use anyhow::{Context, Result};
use report_file::{open_report, ReportFilename, ReportRow};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Options shared by the stage CLI.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Re-ingest files whose batch already exists.
    pub force: bool,
    /// Skip the first N archive files.
    pub offset: usize,
    /// Process at most N archive files.
    pub limit: Option<usize>,
}

/// End-of-stage summary counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub rows_staged: u64,
    pub rows_skipped: u64,
}

/// Batch ingestor over a report archive directory.
pub struct ReportIngestor<'a> {
    registry: &'a dyn RegistryStore,
    anchor: &'a dyn AnchorNotifier,
}

impl<'a> ReportIngestor<'a> {
    pub fn new(registry: &'a dyn RegistryStore, anchor: &'a dyn AnchorNotifier) -> Self {
        Self { registry, anchor }
    }

    /// Ingest every report file under `archive_dir`, in deterministic
    /// (lexicographic) order.
    pub fn run(&self, archive_dir: &Path, options: &IngestOptions) -> Result<IngestReport> {
        let files = scan_archive(archive_dir)?;
        let selected: Vec<_> = files
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        let mut report = IngestReport::default();
        for (path, meta) in &selected {
            match self.ingest_file(path, meta, options.force)? {
                Some((staged, skipped)) => {
                    report.files_ingested += 1;
                    report.rows_staged += staged;
                    report.rows_skipped += skipped;
                }
                None => report.files_skipped += 1,
            }
        }

        info!(
            "Ingestion done: {} files ingested, {} skipped, {} rows staged, {} rows skipped",
            report.files_ingested, report.files_skipped, report.rows_staged, report.rows_skipped
        );
        Ok(report)
    }

    /// Ingest a single report file. Returns None when the file was skipped
    /// (already ingested and not forced, or unusable), Some((rows staged,
    /// rows skipped)) otherwise.
    fn ingest_file(
        &self,
        path: &Path,
        meta: &ReportFilename,
        force: bool,
    ) -> Result<Option<(u64, u64)>> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("report path has no filename")?;

        let existing = self.registry.get_batch_by_filename(filename)?;
        if existing.is_some() && !force {
            info!("Skipping {} (already ingested)", filename);
            return Ok(None);
        }

        let batch = match existing {
            Some(batch) => batch,
            None => {
                let batch = IngestionBatch {
                    id: Uuid::new_v4().to_string(),
                    source_filename: filename.to_string(),
                    report_week: meta.week,
                    report_year: meta.year,
                    row_count: 0,
                    skipped_count: 0,
                    ingested_at: chrono::Utc::now().timestamp(),
                };
                self.registry.create_batch(&batch)?;
                batch
            }
        };

        // A file whose header cannot be mapped is skipped whole; nothing in
        // it could ever parse, and a bad export must not kill the run.
        let (mut reader, columns) = match open_report(path) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Skipping {}: {:#}", filename, e);
                return Ok(None);
            }
        };

        let mut staged = 0u64;
        let mut skipped = 0u64;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("{}: unreadable row: {}", filename, e);
                    skipped += 1;
                    continue;
                }
            };
            let row = match ReportRow::parse(&columns, &record) {
                Ok(row) => row,
                Err(e) => {
                    warn!("{}: skipping row: {}", filename, e);
                    skipped += 1;
                    continue;
                }
            };

            self.registry.upsert_row(&StagedRow {
                batch_id: batch.id.clone(),
                weekly_score: composite_score(row.spins, row.reach),
                raw_artist: row.artist,
                raw_track: row.track,
                raw_label: row.label,
                spins: row.spins,
                prior_spins: row.prior_spins,
                reach: row.reach,
                rank_position: row.rank_position,
                report_week: meta.week,
                report_year: meta.year,
                source_filename: filename.to_string(),
            })?;
            staged += 1;
        }

        let row_count = self.registry.count_rows_for_batch(&batch.id)?;
        self.registry
            .finish_batch(&batch.id, row_count, skipped as i64)?;

        info!(
            "Ingested {} (week {}-{}): {} rows staged, {} skipped",
            filename, meta.week, meta.year, staged, skipped
        );

        // Fire-and-forget: the batch is committed regardless of whether the
        // anchoring service hears about it.
        notify_fire_and_forget(self.anchor, &batch.id, filename);

        Ok(Some((staged, skipped)))
    }
}

/// Collect report files under the archive directory, sorted by filename.
/// Non-report files are skipped with a warning.
fn scan_archive(archive_dir: &Path) -> Result<Vec<(PathBuf, ReportFilename)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(archive_dir).min_depth(1) {
        let entry = entry.with_context(|| format!("failed to scan archive {:?}", archive_dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match ReportFilename::parse_path(&path) {
            Some(meta) => files.push((path, meta)),
            None => {
                if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv")) {
                    warn!("Ignoring {:?}: filename does not encode week/year", path);
                }
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
