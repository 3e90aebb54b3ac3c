//! SQLite store for the canonical entity registry.
//!
//! System-of-record side of the pipeline: ingestion batches, staged report
//! rows, and canonical artists/labels. The derived ranking data lives in
//! the chart store and is kept consistent by the synchronizer, never by
//! cross-database transactions.

use super::models::{
    CanonicalArtist, CanonicalLabel, EntityStatus, IngestionBatch, RawReportRow, ResolutionStatus,
    StagedRow,
};
use super::schema::REGISTRY_SCHEMA_SQL;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Trait for registry storage operations.
pub trait RegistryStore: Send + Sync {
    // ==================== Ingestion Batches ====================

    /// Look up a batch by its source filename.
    fn get_batch_by_filename(&self, filename: &str) -> Result<Option<IngestionBatch>>;

    /// Create a new ingestion batch.
    fn create_batch(&self, batch: &IngestionBatch) -> Result<()>;

    /// Record final row/skip counts for a batch.
    fn finish_batch(&self, id: &str, row_count: i64, skipped_count: i64) -> Result<()>;

    /// Distinct (year, week) pairs with at least one ingested batch,
    /// ascending.
    fn report_weeks(&self) -> Result<Vec<(i32, u32)>>;

    /// Ids of batches reporting the given week, ascending.
    fn batch_ids_for_week(&self, year: i32, week: u32) -> Result<Vec<String>>;

    // ==================== Staged Rows ====================

    /// Insert or update a staged row, keyed by (batch, artist, track).
    /// Re-ingestion refreshes the counts but keeps any resolution link.
    fn upsert_row(&self, row: &StagedRow) -> Result<()>;

    /// Number of staged rows in a batch.
    fn count_rows_for_batch(&self, batch_id: &str) -> Result<i64>;

    /// All rows still awaiting identity resolution.
    fn pending_rows(&self) -> Result<Vec<RawReportRow>>;

    /// Attach a canonical artist to a staged row.
    fn link_row_to_artist(&self, row_id: i64, artist_id: &str) -> Result<()>;

    /// Resolved rows for one report week.
    fn resolved_rows_for_week(&self, year: i32, week: u32) -> Result<Vec<RawReportRow>>;

    /// Most recent non-empty raw label string across an artist's history.
    fn latest_raw_label_for_artist(&self, artist_id: &str) -> Result<Option<String>>;

    // ==================== Artists ====================

    /// Exact lookup by creation-time normalized name.
    fn find_artist_by_normalized(&self, normalized: &str) -> Result<Option<CanonicalArtist>>;

    /// True when an artist id is already taken.
    fn artist_id_exists(&self, id: &str) -> Result<bool>;

    /// Insert unless the normalized name (or id) is already present.
    /// Returns whether a row was actually inserted.
    fn insert_artist(&self, artist: &CanonicalArtist) -> Result<bool>;

    fn get_artist(&self, id: &str) -> Result<Option<CanonicalArtist>>;

    fn all_artists(&self) -> Result<Vec<CanonicalArtist>>;

    /// Artists with no label affiliation, for the backfill pass.
    fn artists_without_label(&self) -> Result<Vec<CanonicalArtist>>;

    fn set_artist_label(&self, artist_id: &str, label_id: &str) -> Result<()>;

    /// Repoint every registry reference from the duplicates onto the
    /// primary and delete the duplicates, as one transaction.
    fn merge_artists(&self, primary_id: &str, duplicate_ids: &[String]) -> Result<()>;

    /// Re-key an artist's normalized name after a maintenance pass.
    /// A no-op when another row already holds the key; the next dedup
    /// pass picks that collision up.
    fn repair_artist_normalized(&self, id: &str, normalized: &str) -> Result<()>;

    // ==================== Labels ====================

    fn find_label_by_normalized(&self, normalized: &str) -> Result<Option<CanonicalLabel>>;

    fn label_id_exists(&self, id: &str) -> Result<bool>;

    fn insert_label(&self, label: &CanonicalLabel) -> Result<bool>;

    fn get_label(&self, id: &str) -> Result<Option<CanonicalLabel>>;

    fn all_labels(&self) -> Result<Vec<CanonicalLabel>>;

    /// Artists currently affiliated with a label.
    fn artists_for_label(&self, label_id: &str) -> Result<Vec<CanonicalArtist>>;

    /// Update a label's display name, matching key, and status. A no-op
    /// when another label already holds the target key; callers merge in
    /// that case instead.
    fn rename_label(
        &self,
        id: &str,
        name: &str,
        normalized_name: &str,
        status: EntityStatus,
    ) -> Result<()>;

    /// Repoint artist affiliations from the duplicates onto the primary
    /// and delete the duplicates, as one transaction.
    fn merge_labels(&self, primary_id: &str, duplicate_ids: &[String]) -> Result<()>;
}

/// SQLite implementation of RegistryStore.
pub struct SqliteRegistryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistryStore {
    /// Open or create the registry database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open registry database: {:?}", path))?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(REGISTRY_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<IngestionBatch> {
        Ok(IngestionBatch {
            id: row.get("id")?,
            source_filename: row.get("source_filename")?,
            report_week: row.get::<_, i64>("report_week")? as u32,
            report_year: row.get::<_, i64>("report_year")? as i32,
            row_count: row.get("row_count")?,
            skipped_count: row.get("skipped_count")?,
            ingested_at: row.get("ingested_at")?,
        })
    }

    fn row_to_raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawReportRow> {
        Ok(RawReportRow {
            id: row.get("id")?,
            batch_id: row.get("batch_id")?,
            raw_artist: row.get("raw_artist")?,
            raw_track: row.get("raw_track")?,
            raw_label: row.get("raw_label")?,
            spins: row.get("spins")?,
            prior_spins: row.get("prior_spins")?,
            reach: row.get("reach")?,
            rank_position: row.get("rank_position")?,
            weekly_score: row.get("weekly_score")?,
            report_week: row.get::<_, i64>("report_week")? as u32,
            report_year: row.get::<_, i64>("report_year")? as i32,
            source_filename: row.get("source_filename")?,
            artist_id: row.get("artist_id")?,
            resolution_status: ResolutionStatus::parse(
                &row.get::<_, String>("resolution_status")?,
            )
            .unwrap_or(ResolutionStatus::PendingMapping),
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_artist(row: &rusqlite::Row) -> rusqlite::Result<CanonicalArtist> {
        Ok(CanonicalArtist {
            id: row.get("id")?,
            name: row.get("name")?,
            normalized_name: row.get("normalized_name")?,
            status: EntityStatus::parse(&row.get::<_, String>("status")?)
                .unwrap_or(EntityStatus::Ghost),
            label_id: row.get("label_id")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_label(row: &rusqlite::Row) -> rusqlite::Result<CanonicalLabel> {
        Ok(CanonicalLabel {
            id: row.get("id")?,
            name: row.get("name")?,
            normalized_name: row.get("normalized_name")?,
            status: EntityStatus::parse(&row.get::<_, String>("status")?)
                .unwrap_or(EntityStatus::Ghost),
            created_at: row.get("created_at")?,
        })
    }
}

impl RegistryStore for SqliteRegistryStore {
    // ==================== Ingestion Batches ====================

    fn get_batch_by_filename(&self, filename: &str) -> Result<Option<IngestionBatch>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM ingestion_batches WHERE source_filename = ?1",
            params![filename],
            Self::row_to_batch,
        )
        .optional()
        .context("failed to query batch by filename")
    }

    fn create_batch(&self, batch: &IngestionBatch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ingestion_batches
                (id, source_filename, report_week, report_year, row_count, skipped_count, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                batch.id,
                batch.source_filename,
                batch.report_week,
                batch.report_year,
                batch.row_count,
                batch.skipped_count,
                batch.ingested_at,
            ],
        )
        .context("failed to insert ingestion batch")?;
        Ok(())
    }

    fn finish_batch(&self, id: &str, row_count: i64, skipped_count: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE ingestion_batches SET row_count = ?2, skipped_count = ?3 WHERE id = ?1",
            params![id, row_count, skipped_count],
        )?;
        Ok(())
    }

    fn report_weeks(&self) -> Result<Vec<(i32, u32)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT report_year, report_week FROM ingestion_batches
             ORDER BY report_year ASC, report_week ASC",
        )?;
        let weeks = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as i32, row.get::<_, i64>(1)? as u32))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(weeks)
    }

    fn batch_ids_for_week(&self, year: i32, week: u32) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM ingestion_batches
             WHERE report_year = ?1 AND report_week = ?2 ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map(params![year, week], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ==================== Staged Rows ====================

    fn upsert_row(&self, row: &StagedRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO raw_report_rows
                (batch_id, raw_artist, raw_track, raw_label, spins, prior_spins, reach,
                 rank_position, weekly_score, report_week, report_year, source_filename, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(batch_id, raw_artist, raw_track) DO UPDATE SET
                raw_label = excluded.raw_label,
                spins = excluded.spins,
                prior_spins = excluded.prior_spins,
                reach = excluded.reach,
                rank_position = excluded.rank_position,
                weekly_score = excluded.weekly_score",
            params![
                row.batch_id,
                row.raw_artist,
                row.raw_track,
                row.raw_label,
                row.spins,
                row.prior_spins,
                row.reach,
                row.rank_position,
                row.weekly_score,
                row.report_week,
                row.report_year,
                row.source_filename,
                chrono::Utc::now().timestamp(),
            ],
        )
        .context("failed to upsert staged row")?;
        Ok(())
    }

    fn count_rows_for_batch(&self, batch_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM raw_report_rows WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn pending_rows(&self) -> Result<Vec<RawReportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM raw_report_rows
             WHERE resolution_status = 'pending_mapping' ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn link_row_to_artist(&self, row_id: i64, artist_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE raw_report_rows
             SET artist_id = ?2, resolution_status = 'resolved' WHERE id = ?1",
            params![row_id, artist_id],
        )?;
        Ok(())
    }

    fn resolved_rows_for_week(&self, year: i32, week: u32) -> Result<Vec<RawReportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM raw_report_rows
             WHERE report_year = ?1 AND report_week = ?2 AND resolution_status = 'resolved'
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![year, week], Self::row_to_raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_raw_label_for_artist(&self, artist_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT raw_label FROM raw_report_rows
             WHERE artist_id = ?1 AND raw_label IS NOT NULL AND raw_label != ''
             ORDER BY report_year DESC, report_week DESC, id DESC LIMIT 1",
            params![artist_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query latest raw label")
    }

    // ==================== Artists ====================

    fn find_artist_by_normalized(&self, normalized: &str) -> Result<Option<CanonicalArtist>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM artists WHERE normalized_name = ?1",
            params![normalized],
            Self::row_to_artist,
        )
        .optional()
        .context("failed to query artist by normalized name")
    }

    fn artist_id_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row("SELECT 1 FROM artists WHERE id = ?1", params![id], |_| {
                Ok(true)
            })
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    fn insert_artist(&self, artist: &CanonicalArtist) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO artists (id, name, normalized_name, status, label_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artist.id,
                artist.name,
                artist.normalized_name,
                artist.status.as_str(),
                artist.label_id,
                artist.created_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn get_artist(&self, id: &str) -> Result<Option<CanonicalArtist>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM artists WHERE id = ?1",
            params![id],
            Self::row_to_artist,
        )
        .optional()
        .context("failed to query artist")
    }

    fn all_artists(&self) -> Result<Vec<CanonicalArtist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM artists ORDER BY id ASC")?;
        let artists = stmt
            .query_map([], Self::row_to_artist)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artists)
    }

    fn artists_without_label(&self) -> Result<Vec<CanonicalArtist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM artists WHERE label_id IS NULL ORDER BY id ASC")?;
        let artists = stmt
            .query_map([], Self::row_to_artist)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artists)
    }

    fn set_artist_label(&self, artist_id: &str, label_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE artists SET label_id = ?2 WHERE id = ?1",
            params![artist_id, label_id],
        )?;
        Ok(())
    }

    fn merge_artists(&self, primary_id: &str, duplicate_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for dup in duplicate_ids {
            tx.execute(
                "UPDATE raw_report_rows SET artist_id = ?1 WHERE artist_id = ?2",
                params![primary_id, dup],
            )?;
            tx.execute("DELETE FROM artists WHERE id = ?1", params![dup])?;
        }
        tx.commit().context("failed to commit artist merge group")?;
        Ok(())
    }

    fn repair_artist_normalized(&self, id: &str, normalized: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE OR IGNORE artists SET normalized_name = ?2 WHERE id = ?1",
            params![id, normalized],
        )?;
        Ok(())
    }

    // ==================== Labels ====================

    fn find_label_by_normalized(&self, normalized: &str) -> Result<Option<CanonicalLabel>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM labels WHERE normalized_name = ?1",
            params![normalized],
            Self::row_to_label,
        )
        .optional()
        .context("failed to query label by normalized name")
    }

    fn label_id_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row("SELECT 1 FROM labels WHERE id = ?1", params![id], |_| {
                Ok(true)
            })
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    fn insert_label(&self, label: &CanonicalLabel) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO labels (id, name, normalized_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                label.id,
                label.name,
                label.normalized_name,
                label.status.as_str(),
                label.created_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn get_label(&self, id: &str) -> Result<Option<CanonicalLabel>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM labels WHERE id = ?1",
            params![id],
            Self::row_to_label,
        )
        .optional()
        .context("failed to query label")
    }

    fn all_labels(&self) -> Result<Vec<CanonicalLabel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM labels ORDER BY id ASC")?;
        let labels = stmt
            .query_map([], Self::row_to_label)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn artists_for_label(&self, label_id: &str) -> Result<Vec<CanonicalArtist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM artists WHERE label_id = ?1 ORDER BY id ASC")?;
        let artists = stmt
            .query_map(params![label_id], Self::row_to_artist)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artists)
    }

    fn rename_label(
        &self,
        id: &str,
        name: &str,
        normalized_name: &str,
        status: EntityStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE OR IGNORE labels SET name = ?2, normalized_name = ?3, status = ?4 WHERE id = ?1",
            params![id, name, normalized_name, status.as_str()],
        )
        .context("failed to rename label")?;
        Ok(())
    }

    fn merge_labels(&self, primary_id: &str, duplicate_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for dup in duplicate_ids {
            tx.execute(
                "UPDATE artists SET label_id = ?1 WHERE label_id = ?2",
                params![primary_id, dup],
            )?;
            tx.execute("DELETE FROM labels WHERE id = ?1", params![dup])?;
        }
        tx.commit().context("failed to commit label merge group")?;
        Ok(())
    }
}
