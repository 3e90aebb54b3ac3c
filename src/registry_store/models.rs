//! Data models for the canonical entity registry.
//!
//! Canonical artists/labels are the de-duplicated records every ranking
//! and display surface references. Raw report rows are append-only staging
//! data carrying full provenance back to the vendor export.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a canonical entity.
///
/// Ghosts are placeholders auto-created when a report string matched
/// nothing; they persist until merged into a confirmed entity or enriched
/// with a confirmed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Ghost,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Ghost => "ghost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EntityStatus::Active),
            "ghost" => Some(EntityStatus::Ghost),
            _ => None,
        }
    }
}

/// Resolution state of a staged report row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    PendingMapping,
    Resolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::PendingMapping => "pending_mapping",
            ResolutionStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_mapping" => Some(ResolutionStatus::PendingMapping),
            "resolved" => Some(ResolutionStatus::Resolved),
            _ => None,
        }
    }
}

/// A de-duplicated canonical artist.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalArtist {
    pub id: String,
    pub name: String,
    /// Matching key at creation time; UNIQUE in storage.
    pub normalized_name: String,
    pub status: EntityStatus,
    pub label_id: Option<String>,
    pub created_at: i64,
}

/// A de-duplicated canonical label.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalLabel {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub status: EntityStatus,
    pub created_at: i64,
}

/// One ingested vendor export file.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionBatch {
    pub id: String,
    pub source_filename: String,
    pub report_week: u32,
    pub report_year: i32,
    pub row_count: i64,
    pub skipped_count: i64,
    pub ingested_at: i64,
}

/// A staged report row. Immutable provenance plus a mutable resolution link.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReportRow {
    pub id: i64,
    pub batch_id: String,
    pub raw_artist: String,
    pub raw_track: String,
    pub raw_label: Option<String>,
    pub spins: i64,
    pub prior_spins: Option<i64>,
    pub reach: i64,
    pub rank_position: Option<i64>,
    pub weekly_score: f64,
    pub report_week: u32,
    pub report_year: i32,
    pub source_filename: String,
    pub artist_id: Option<String>,
    pub resolution_status: ResolutionStatus,
    pub created_at: i64,
}

/// Insert shape for a staged row; ids and resolution state are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct StagedRow {
    pub batch_id: String,
    pub raw_artist: String,
    pub raw_track: String,
    pub raw_label: Option<String>,
    pub spins: i64,
    pub prior_spins: Option<i64>,
    pub reach: i64,
    pub rank_position: Option<i64>,
    pub weekly_score: f64,
    pub report_week: u32,
    pub report_year: i32,
    pub source_filename: String,
}
