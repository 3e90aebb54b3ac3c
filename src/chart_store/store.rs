//! SQLite store for the derived ranking data.
//!
//! Window writes are bracketed in one transaction (delete + reinsert), so
//! readers never observe a partially populated window. The mirror replace
//! is likewise a single transaction.

use super::models::{
    EntityType, FairnessReceipt, MirrorArtist, MirrorLabel, NewFairnessReceipt, NewRankingItem,
    RankingItem, RankingWindow, WindowState,
};
use super::schema::CHART_SCHEMA_SQL;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// In-memory previous-rank state threaded through window aggregation.
pub type RankMap = HashMap<(EntityType, String), i64>;

/// Trait for chart storage operations.
pub trait ChartStore: Send + Sync {
    // ==================== Windows ====================

    fn get_window(&self, interval: &str, window_start: &str) -> Result<Option<RankingWindow>>;

    /// Fetch the window for the bucket, creating it empty when absent.
    fn get_or_create_window(
        &self,
        interval: &str,
        window_start: &str,
        window_end: &str,
    ) -> Result<RankingWindow>;

    /// All windows for an interval, ascending by window start.
    fn windows(&self, interval: &str) -> Result<Vec<RankingWindow>>;

    /// Most recent populated/finalized window strictly before the given
    /// start date. Seeds the rank accumulator on resumed runs.
    fn latest_window_with_data_before(
        &self,
        interval: &str,
        window_start: &str,
    ) -> Result<Option<RankingWindow>>;

    /// Most recent populated/finalized window overall.
    fn latest_window_with_data(&self, interval: &str) -> Result<Option<RankingWindow>>;

    // ==================== Ranking Items & Receipts ====================

    /// Atomically replace a window's items and receipts and advance its
    /// state. The whole window write is one transaction.
    fn replace_window_items(
        &self,
        window_id: i64,
        items: &[NewRankingItem],
        receipts: &[NewFairnessReceipt],
        finalize: bool,
    ) -> Result<()>;

    /// Entity → rank for a stored window, both entity types.
    fn rank_map_for_window(&self, window_id: i64) -> Result<RankMap>;

    /// Items of one entity type, ascending by rank.
    fn items_for_window(&self, window_id: i64, entity_type: EntityType)
        -> Result<Vec<RankingItem>>;

    fn receipts_for_window(&self, window_id: i64) -> Result<Vec<FairnessReceipt>>;

    /// Repoint ranking references from merged-away entities onto the
    /// surviving one. Colliding items are dropped; the affected windows
    /// are derived data and regenerate on the next forced aggregation.
    fn repoint_entity(
        &self,
        entity_type: EntityType,
        from_ids: &[String],
        to_id: &str,
    ) -> Result<()>;

    // ==================== Mirror ====================

    /// Replace both mirror tables in one transaction.
    fn replace_mirror(&self, artists: &[MirrorArtist], labels: &[MirrorLabel]) -> Result<()>;

    fn get_mirror_artist(&self, id: &str) -> Result<Option<MirrorArtist>>;

    fn get_mirror_label(&self, id: &str) -> Result<Option<MirrorLabel>>;

    /// Ranking-item references that no mirror row satisfies.
    fn missing_mirror_references(&self) -> Result<Vec<(EntityType, String)>>;

    // ==================== Meta ====================

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;
}

/// SQLite implementation of ChartStore.
pub struct SqliteChartStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChartStore {
    /// Open or create the chart database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open chart database: {:?}", path))?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(CHART_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_window(row: &rusqlite::Row) -> rusqlite::Result<RankingWindow> {
        Ok(RankingWindow {
            id: row.get("id")?,
            interval: row.get("interval")?,
            window_start: row.get("window_start")?,
            window_end: row.get("window_end")?,
            state: WindowState::parse(&row.get::<_, String>("state")?)
                .unwrap_or(WindowState::Empty),
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<RankingItem> {
        Ok(RankingItem {
            id: row.get("id")?,
            window_id: row.get("window_id")?,
            entity_type: EntityType::parse(&row.get::<_, String>("entity_type")?)
                .unwrap_or(EntityType::Artist),
            entity_id: row.get("entity_id")?,
            rank: row.get("rank")?,
            prev_rank: row.get("prev_rank")?,
            score: row.get("score")?,
            spins: row.get("spins")?,
            reach: row.get("reach")?,
        })
    }

    fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<FairnessReceipt> {
        let source_batches: Vec<String> = row
            .get::<_, String>("source_batches")
            .map(|s| serde_json::from_str(&s).unwrap_or_default())?;
        Ok(FairnessReceipt {
            id: row.get("id")?,
            window_id: row.get("window_id")?,
            artist_id: row.get("artist_id")?,
            spins: row.get("spins")?,
            reach: row.get("reach")?,
            score: row.get("score")?,
            row_count: row.get("row_count")?,
            source_batches,
            created_at: row.get("created_at")?,
        })
    }
}

impl ChartStore for SqliteChartStore {
    // ==================== Windows ====================

    fn get_window(&self, interval: &str, window_start: &str) -> Result<Option<RankingWindow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM ranking_windows WHERE interval = ?1 AND window_start = ?2",
            params![interval, window_start],
            Self::row_to_window,
        )
        .optional()
        .context("failed to query ranking window")
    }

    fn get_or_create_window(
        &self,
        interval: &str,
        window_start: &str,
        window_end: &str,
    ) -> Result<RankingWindow> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO ranking_windows
                    (interval, window_start, window_end, state, created_at)
                 VALUES (?1, ?2, ?3, 'empty', ?4)",
                params![interval, window_start, window_end, chrono::Utc::now().timestamp()],
            )?;
        }
        self.get_window(interval, window_start)?
            .context("window missing right after creation")
    }

    fn windows(&self, interval: &str) -> Result<Vec<RankingWindow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM ranking_windows WHERE interval = ?1 ORDER BY window_start ASC",
        )?;
        let windows = stmt
            .query_map(params![interval], Self::row_to_window)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(windows)
    }

    fn latest_window_with_data_before(
        &self,
        interval: &str,
        window_start: &str,
    ) -> Result<Option<RankingWindow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM ranking_windows
             WHERE interval = ?1 AND window_start < ?2 AND state IN ('populated', 'finalized')
             ORDER BY window_start DESC LIMIT 1",
            params![interval, window_start],
            Self::row_to_window,
        )
        .optional()
        .context("failed to query latest populated window")
    }

    fn latest_window_with_data(&self, interval: &str) -> Result<Option<RankingWindow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM ranking_windows
             WHERE interval = ?1 AND state IN ('populated', 'finalized')
             ORDER BY window_start DESC LIMIT 1",
            params![interval],
            Self::row_to_window,
        )
        .optional()
        .context("failed to query latest populated window")
    }

    // ==================== Ranking Items & Receipts ====================

    fn replace_window_items(
        &self,
        window_id: i64,
        items: &[NewRankingItem],
        receipts: &[NewFairnessReceipt],
        finalize: bool,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();

        tx.execute(
            "DELETE FROM ranking_items WHERE window_id = ?1",
            params![window_id],
        )?;
        tx.execute(
            "DELETE FROM fairness_receipts WHERE window_id = ?1",
            params![window_id],
        )?;

        {
            let mut insert_item = tx.prepare(
                "INSERT INTO ranking_items
                    (window_id, entity_type, entity_id, rank, prev_rank, score, spins, reach)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for item in items {
                insert_item.execute(params![
                    window_id,
                    item.entity_type.as_str(),
                    item.entity_id,
                    item.rank,
                    item.prev_rank,
                    item.score,
                    item.spins,
                    item.reach,
                ])?;
            }

            let mut insert_receipt = tx.prepare(
                "INSERT INTO fairness_receipts
                    (window_id, artist_id, spins, reach, score, row_count, source_batches, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for receipt in receipts {
                insert_receipt.execute(params![
                    window_id,
                    receipt.artist_id,
                    receipt.spins,
                    receipt.reach,
                    receipt.score,
                    receipt.row_count,
                    serde_json::to_string(&receipt.source_batches)?,
                    now,
                ])?;
            }
        }

        let state = if finalize {
            WindowState::Finalized
        } else {
            WindowState::Populated
        };
        tx.execute(
            "UPDATE ranking_windows SET state = ?2 WHERE id = ?1",
            params![window_id, state.as_str()],
        )?;

        tx.commit().context("failed to commit window write")?;
        Ok(())
    }

    fn rank_map_for_window(&self, window_id: i64) -> Result<RankMap> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id, rank FROM ranking_items WHERE window_id = ?1",
        )?;
        let mut map = RankMap::new();
        let rows = stmt.query_map(params![window_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (entity_type, entity_id, rank) = row?;
            if let Some(entity_type) = EntityType::parse(&entity_type) {
                map.insert((entity_type, entity_id), rank);
            }
        }
        Ok(map)
    }

    fn items_for_window(
        &self,
        window_id: i64,
        entity_type: EntityType,
    ) -> Result<Vec<RankingItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM ranking_items
             WHERE window_id = ?1 AND entity_type = ?2 ORDER BY rank ASC",
        )?;
        let items = stmt
            .query_map(params![window_id, entity_type.as_str()], Self::row_to_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn receipts_for_window(&self, window_id: i64) -> Result<Vec<FairnessReceipt>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM fairness_receipts WHERE window_id = ?1 ORDER BY artist_id ASC",
        )?;
        let receipts = stmt
            .query_map(params![window_id], Self::row_to_receipt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(receipts)
    }

    fn repoint_entity(
        &self,
        entity_type: EntityType,
        from_ids: &[String],
        to_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for from in from_ids {
            // OR REPLACE: when the survivor already charted in a window the
            // duplicate's colliding item is dropped rather than violating
            // the per-window uniqueness.
            tx.execute(
                "UPDATE OR REPLACE ranking_items SET entity_id = ?1
                 WHERE entity_type = ?2 AND entity_id = ?3",
                params![to_id, entity_type.as_str(), from],
            )?;
            if entity_type == EntityType::Artist {
                tx.execute(
                    "UPDATE fairness_receipts SET artist_id = ?1 WHERE artist_id = ?2",
                    params![to_id, from],
                )?;
            }
        }
        tx.commit().context("failed to commit reference repoint")?;
        Ok(())
    }

    // ==================== Mirror ====================

    fn replace_mirror(&self, artists: &[MirrorArtist], labels: &[MirrorLabel]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM chart_artists", [])?;
        tx.execute("DELETE FROM chart_labels", [])?;

        {
            let mut insert_artist = tx.prepare(
                "INSERT INTO chart_artists (id, name, label_id, status) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for artist in artists {
                insert_artist.execute(params![
                    artist.id,
                    artist.name,
                    artist.label_id,
                    artist.status
                ])?;
            }

            let mut insert_label =
                tx.prepare("INSERT INTO chart_labels (id, name, status) VALUES (?1, ?2, ?3)")?;
            for label in labels {
                insert_label.execute(params![label.id, label.name, label.status])?;
            }
        }

        tx.commit().context("failed to commit mirror replace")?;
        Ok(())
    }

    fn get_mirror_artist(&self, id: &str) -> Result<Option<MirrorArtist>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, label_id, status FROM chart_artists WHERE id = ?1",
            params![id],
            |row| {
                Ok(MirrorArtist {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    label_id: row.get(2)?,
                    status: row.get(3)?,
                })
            },
        )
        .optional()
        .context("failed to query mirror artist")
    }

    fn get_mirror_label(&self, id: &str) -> Result<Option<MirrorLabel>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, status FROM chart_labels WHERE id = ?1",
            params![id],
            |row| {
                Ok(MirrorLabel {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                })
            },
        )
        .optional()
        .context("failed to query mirror label")
    }

    fn missing_mirror_references(&self) -> Result<Vec<(EntityType, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity_type, entity_id FROM ranking_items i
             WHERE (i.entity_type = 'artist'
                    AND NOT EXISTS (SELECT 1 FROM chart_artists a WHERE a.id = i.entity_id))
                OR (i.entity_type = 'label'
                    AND NOT EXISTS (SELECT 1 FROM chart_labels l WHERE l.id = i.entity_id))
             ORDER BY entity_type, entity_id",
        )?;
        let missing = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(t, id)| EntityType::parse(&t).map(|t| (t, id)))
            .collect();
        Ok(missing)
    }

    // ==================== Meta ====================

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chart_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM chart_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query chart meta")
    }
}
