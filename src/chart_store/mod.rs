//! Derived ranking store: windows, items, receipts, and the registry mirror.

pub mod models;
pub mod schema;
pub mod store;

pub use models::{
    EntityType, FairnessReceipt, MirrorArtist, MirrorLabel, NewFairnessReceipt, NewRankingItem,
    RankingItem, RankingWindow, WindowState,
};
pub use store::{ChartStore, RankMap, SqliteChartStore};
