//! Database schema for the canonical entity registry.
//!
//! Four tables:
//! - ingestion_batches: one record per ingested vendor export
//! - raw_report_rows: append-only staging rows with provenance
//! - artists / labels: canonical entities, unique by normalized name

/// SQL schema for the registry database.
pub const REGISTRY_SCHEMA_SQL: &str = r#"
-- One record per ingested vendor export file
CREATE TABLE IF NOT EXISTS ingestion_batches (
    id TEXT PRIMARY KEY,
    source_filename TEXT NOT NULL UNIQUE,
    report_week INTEGER NOT NULL,
    report_year INTEGER NOT NULL,
    row_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    ingested_at INTEGER NOT NULL
);

-- Staging rows, unique per (batch, artist, track) so re-ingestion updates
-- in place instead of duplicating
CREATE TABLE IF NOT EXISTS raw_report_rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    raw_artist TEXT NOT NULL,
    raw_track TEXT NOT NULL,
    raw_label TEXT,
    spins INTEGER NOT NULL,
    prior_spins INTEGER,
    reach INTEGER NOT NULL,
    rank_position INTEGER,
    weekly_score REAL NOT NULL,
    report_week INTEGER NOT NULL,
    report_year INTEGER NOT NULL,
    source_filename TEXT NOT NULL,

    -- Resolution link, NULL until the resolver runs
    artist_id TEXT,
    resolution_status TEXT NOT NULL DEFAULT 'pending_mapping',

    created_at INTEGER NOT NULL,

    FOREIGN KEY (batch_id) REFERENCES ingestion_batches(id) ON DELETE CASCADE,
    UNIQUE (batch_id, raw_artist, raw_track)
);

CREATE TABLE IF NOT EXISTS labels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Canonical artists; normalized_name uniqueness keeps resolve-or-create
-- race-free
CREATE TABLE IF NOT EXISTS artists (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    label_id TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (label_id) REFERENCES labels(id) ON DELETE SET NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_raw_rows_batch ON raw_report_rows(batch_id);
CREATE INDEX IF NOT EXISTS idx_raw_rows_status ON raw_report_rows(resolution_status);
CREATE INDEX IF NOT EXISTS idx_raw_rows_artist ON raw_report_rows(artist_id);
CREATE INDEX IF NOT EXISTS idx_raw_rows_week ON raw_report_rows(report_year, report_week);
CREATE INDEX IF NOT EXISTS idx_artists_label ON artists(label_id);
"#;

/// Current schema version.
pub const REGISTRY_SCHEMA_VERSION: i32 = 1;
