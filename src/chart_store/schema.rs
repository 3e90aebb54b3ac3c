//! Database schema for the derived ranking store.
//!
//! - ranking_windows / ranking_items: periodic charts, fully derived
//! - fairness_receipts: per-artist scoring audit trail
//! - chart_artists / chart_labels: lightweight mirror of the registry so
//!   ranking-item joins never dangle
//! - chart_meta: sync bookkeeping (mirror checksum)

/// SQL schema for the chart database.
pub const CHART_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ranking_windows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    interval TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'empty',
    created_at INTEGER NOT NULL,
    UNIQUE (interval, window_start)
);

-- Unique per (window, entity type, entity) per the dense-rank invariant
CREATE TABLE IF NOT EXISTS ranking_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    window_id INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    rank INTEGER NOT NULL,
    prev_rank INTEGER,
    score REAL NOT NULL,
    spins INTEGER NOT NULL,
    reach INTEGER NOT NULL,
    FOREIGN KEY (window_id) REFERENCES ranking_windows(id) ON DELETE CASCADE,
    UNIQUE (window_id, entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS fairness_receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    window_id INTEGER NOT NULL,
    artist_id TEXT NOT NULL,
    spins INTEGER NOT NULL,
    reach INTEGER NOT NULL,
    score REAL NOT NULL,
    row_count INTEGER NOT NULL,
    source_batches TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (window_id) REFERENCES ranking_windows(id) ON DELETE CASCADE
);

-- Registry mirror, replaced wholesale by the synchronizer
CREATE TABLE IF NOT EXISTS chart_artists (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    label_id TEXT,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chart_labels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chart_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_ranking_items_window ON ranking_items(window_id);
CREATE INDEX IF NOT EXISTS idx_ranking_items_entity ON ranking_items(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_receipts_window ON fairness_receipts(window_id);
CREATE INDEX IF NOT EXISTS idx_receipts_artist ON fairness_receipts(artist_id);
"#;

/// Current schema version.
pub const CHART_SCHEMA_VERSION: i32 = 1;
