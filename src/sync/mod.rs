//! Store synchronization stage.
//!
//! Replaces the chart store's registry mirror with the current canonical
//! set, as one transaction, so ranking-item joins never reference a
//! missing id. Runs after any resolution/merge pass and before any
//! aggregation whose output will be displayed; fully idempotent.
//!
//! Ghost entities are mirrored too. Ranking items legitimately reference
//! them, and the mirror exists for exactly those joins.

use crate::chart_store::{ChartStore, MirrorArtist, MirrorLabel};
use crate::registry_store::RegistryStore;
use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::info;

/// Meta key the mirror checksum is stored under.
pub const MIRROR_CHECKSUM_KEY: &str = "mirror_checksum";

/// End-of-stage summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub artists_mirrored: usize,
    pub labels_mirrored: usize,
    pub checksum: String,
}

/// Mirrors canonical identities into the chart store.
pub struct StoreSynchronizer<'a> {
    registry: &'a dyn RegistryStore,
    charts: &'a dyn ChartStore,
}

impl<'a> StoreSynchronizer<'a> {
    pub fn new(registry: &'a dyn RegistryStore, charts: &'a dyn ChartStore) -> Self {
        Self { registry, charts }
    }

    pub fn run(&self) -> Result<SyncReport> {
        let artists: Vec<MirrorArtist> = self
            .registry
            .all_artists()?
            .into_iter()
            .map(|a| MirrorArtist {
                id: a.id,
                name: a.name,
                label_id: a.label_id,
                status: a.status.as_str().to_string(),
            })
            .collect();
        let labels: Vec<MirrorLabel> = self
            .registry
            .all_labels()?
            .into_iter()
            .map(|l| MirrorLabel {
                id: l.id,
                name: l.name,
                status: l.status.as_str().to_string(),
            })
            .collect();

        self.charts.replace_mirror(&artists, &labels)?;

        #[cfg(not(feature = "no_checks"))]
        self.verify_references()?;

        let checksum = mirror_checksum(&artists, &labels);
        self.charts.set_meta(MIRROR_CHECKSUM_KEY, &checksum)?;

        info!(
            "Mirror refreshed: {} artists, {} labels ({})",
            artists.len(),
            labels.len(),
            checksum
        );
        Ok(SyncReport {
            artists_mirrored: artists.len(),
            labels_mirrored: labels.len(),
            checksum,
        })
    }

    /// Every ranking item must join onto a mirror row. A dangling
    /// reference means an entity was deleted outside a merge; fail loudly
    /// instead of letting display joins silently drop rows.
    #[cfg(not(feature = "no_checks"))]
    fn verify_references(&self) -> Result<()> {
        let missing = self.charts.missing_mirror_references()?;
        if !missing.is_empty() {
            let sample: Vec<String> = missing
                .iter()
                .take(5)
                .map(|(entity_type, id)| format!("{} '{}'", entity_type.as_str(), id))
                .collect();
            anyhow::bail!(
                "referential integrity violated: {} ranking reference(s) missing from the mirror ({})",
                missing.len(),
                sample.join(", ")
            );
        }
        Ok(())
    }
}

/// SHA256 over the sorted mirrored ids, for cheap drift detection between
/// runs.
fn mirror_checksum(artists: &[MirrorArtist], labels: &[MirrorLabel]) -> String {
    let mut artist_ids: Vec<&str> = artists.iter().map(|a| a.id.as_str()).collect();
    let mut label_ids: Vec<&str> = labels.iter().map(|l| l.id.as_str()).collect();
    artist_ids.sort_unstable();
    label_ids.sort_unstable();

    let mut hasher = Sha256::new();
    for id in artist_ids.iter().chain(label_ids.iter()) {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart_store::{EntityType, NewRankingItem, SqliteChartStore};
    use crate::registry_store::{CanonicalArtist, CanonicalLabel, EntityStatus, SqliteRegistryStore};

    fn seed_registry(registry: &SqliteRegistryStore) {
        registry
            .insert_label(&CanonicalLabel {
                id: "indie-co".to_string(),
                name: "Indie Co".to_string(),
                normalized_name: "indieco".to_string(),
                status: EntityStatus::Active,
                created_at: 0,
            })
            .unwrap();
        registry
            .insert_artist(&CanonicalArtist {
                id: "test-band".to_string(),
                name: "Test Band".to_string(),
                normalized_name: "testband".to_string(),
                status: EntityStatus::Ghost,
                label_id: Some("indie-co".to_string()),
                created_at: 0,
            })
            .unwrap();
    }

    #[test]
    fn test_sync_mirrors_all_entities_including_ghosts() {
        let registry = SqliteRegistryStore::in_memory().unwrap();
        let charts = SqliteChartStore::in_memory().unwrap();
        seed_registry(&registry);

        let report = StoreSynchronizer::new(&registry, &charts).run().unwrap();
        assert_eq!(report.artists_mirrored, 1);
        assert_eq!(report.labels_mirrored, 1);

        let mirrored = charts.get_mirror_artist("test-band").unwrap().unwrap();
        assert_eq!(mirrored.status, "ghost");
        assert_eq!(mirrored.label_id.as_deref(), Some("indie-co"));
        assert_eq!(
            charts.get_meta(MIRROR_CHECKSUM_KEY).unwrap(),
            Some(report.checksum.clone())
        );
    }

    #[test]
    fn test_sync_is_idempotent() {
        let registry = SqliteRegistryStore::in_memory().unwrap();
        let charts = SqliteChartStore::in_memory().unwrap();
        seed_registry(&registry);

        let first = StoreSynchronizer::new(&registry, &charts).run().unwrap();
        let second = StoreSynchronizer::new(&registry, &charts).run().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_checksum_tracks_the_id_set() {
        let a = |id: &str| MirrorArtist {
            id: id.to_string(),
            name: id.to_string(),
            label_id: None,
            status: "active".to_string(),
        };
        let one = mirror_checksum(&[a("x")], &[]);
        let same = mirror_checksum(&[a("x")], &[]);
        let other = mirror_checksum(&[a("x"), a("y")], &[]);
        assert!(one.starts_with("sha256:"));
        assert_eq!(one, same);
        assert_ne!(one, other);
    }

    #[cfg(not(feature = "no_checks"))]
    #[test]
    fn test_dangling_ranking_reference_is_an_error() {
        let registry = SqliteRegistryStore::in_memory().unwrap();
        let charts = SqliteChartStore::in_memory().unwrap();
        let window = charts
            .get_or_create_window("weekly", "2023-04-03", "2023-04-09")
            .unwrap();
        // A ranking item referencing an artist the registry no longer has.
        charts
            .replace_window_items(
                window.id,
                &[NewRankingItem {
                    entity_type: EntityType::Artist,
                    entity_id: "deleted-artist".to_string(),
                    rank: 1,
                    prev_rank: None,
                    score: 10.0,
                    spins: 10,
                    reach: 0,
                }],
                &[],
                true,
            )
            .unwrap();

        let err = StoreSynchronizer::new(&registry, &charts)
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("referential integrity"));
        assert!(err.to_string().contains("deleted-artist"));
    }
}
