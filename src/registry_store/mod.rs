//! System-of-record store: canonical artists/labels and staged report rows.

pub mod models;
pub mod schema;
pub mod store;

pub use models::{
    CanonicalArtist, CanonicalLabel, EntityStatus, IngestionBatch, RawReportRow, ResolutionStatus,
    StagedRow,
};
pub use store::{RegistryStore, SqliteRegistryStore};
