//! Data models for the derived ranking store.
//!
//! Everything here is regenerated from the registry; windows and items are
//! deleted and rebuilt by the aggregator, mirrors are replaced wholesale by
//! the synchronizer. Nothing is hand-edited.

use serde::{Deserialize, Serialize};

/// Kind of entity a ranking item scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Artist,
    Label,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Artist => "artist",
            EntityType::Label => "label",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artist" => Some(EntityType::Artist),
            "label" => Some(EntityType::Label),
            _ => None,
        }
    }
}

/// Aggregation lifecycle of a ranking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Empty,
    Populated,
    Finalized,
}

impl WindowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowState::Empty => "empty",
            WindowState::Populated => "populated",
            WindowState::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(WindowState::Empty),
            "populated" => Some(WindowState::Populated),
            "finalized" => Some(WindowState::Finalized),
            _ => None,
        }
    }

    /// True once the window holds ranking data.
    pub fn has_data(&self) -> bool {
        matches!(self, WindowState::Populated | WindowState::Finalized)
    }
}

/// One reporting period bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingWindow {
    pub id: i64,
    pub interval: String,
    /// ISO date, Monday of the report week. The window key.
    pub window_start: String,
    pub window_end: String,
    pub state: WindowState,
    pub created_at: i64,
}

/// One ranked entity within a window.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingItem {
    pub id: i64,
    pub window_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub rank: i64,
    /// Rank in the previous window; None when newly charted.
    pub prev_rank: Option<i64>,
    pub score: f64,
    // Factor breakdown behind the score.
    pub spins: i64,
    pub reach: i64,
}

impl RankingItem {
    /// `prev_rank - rank`; positive means the entity climbed.
    pub fn delta(&self) -> Option<i64> {
        self.prev_rank.map(|prev| prev - self.rank)
    }
}

/// Insert shape for ranking items; ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRankingItem {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub rank: i64,
    pub prev_rank: Option<i64>,
    pub score: f64,
    pub spins: i64,
    pub reach: i64,
}

/// Audit record of the inputs behind one artist's score in one window.
#[derive(Debug, Clone, PartialEq)]
pub struct FairnessReceipt {
    pub id: i64,
    pub window_id: i64,
    pub artist_id: String,
    pub spins: i64,
    pub reach: i64,
    pub score: f64,
    pub row_count: i64,
    /// Ids of the ingestion batches that contributed rows.
    pub source_batches: Vec<String>,
    pub created_at: i64,
}

/// Insert shape for fairness receipts.
#[derive(Debug, Clone)]
pub struct NewFairnessReceipt {
    pub artist_id: String,
    pub spins: i64,
    pub reach: i64,
    pub score: f64,
    pub row_count: i64,
    pub source_batches: Vec<String>,
}

/// Mirrored canonical artist, the ranking store's join target.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorArtist {
    pub id: String,
    pub name: String,
    pub label_id: Option<String>,
    pub status: String,
}

/// Mirrored canonical label.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorLabel {
    pub id: String,
    pub name: String,
    pub status: String,
}
