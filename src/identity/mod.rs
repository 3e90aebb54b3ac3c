//! Identity resolution stage.
//!
//! Turns raw report strings into canonical artist/label links:
//! - two-phase row resolution: direct match on the normalized name, ghost
//!   creation on miss, so aggregation never waits on manual curation
//! - a dedup pass that merges canonical entities sharing a normalized name
//! - label backfill from each artist's most recent raw label string
//! - reconciliation that enriches placeholder-named ghost labels
//!
//! The maintenance passes run on every invocation; they absorb what used
//! to be one-off repair scripts. A single bad row is logged and skipped;
//! only storage failures abort the run.

pub mod normalize;

use crate::chart_store::{ChartStore, EntityType};
use crate::registry_store::{
    CanonicalArtist, CanonicalLabel, EntityStatus, RegistryStore,
};
use anyhow::Result;
use normalize::{normalize_name, slug_from_name};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// End-of-stage summary counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    /// Rows linked to an existing canonical artist.
    pub matched: u64,
    /// Rows that required a new ghost artist.
    pub ghosted: u64,
    /// Rows whose artist name had no usable characters.
    pub rows_skipped: u64,
    /// Duplicate artists merged away.
    pub artists_merged: u64,
    /// Duplicate labels merged away.
    pub labels_merged: u64,
    /// Artists that gained a label affiliation.
    pub labels_backfilled: u64,
    /// Ghost labels renamed or merged by reconciliation.
    pub ghosts_reconciled: u64,
}

/// Batch identity resolver over the staged rows.
pub struct IdentityResolver<'a> {
    registry: &'a dyn RegistryStore,
    charts: &'a dyn ChartStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(registry: &'a dyn RegistryStore, charts: &'a dyn ChartStore) -> Self {
        Self { registry, charts }
    }

    /// Run row resolution followed by the maintenance passes.
    pub fn run(&self) -> Result<ResolveReport> {
        let mut report = ResolveReport::default();

        self.resolve_pending_rows(&mut report)?;
        self.dedup_artists(&mut report)?;
        self.dedup_labels(&mut report)?;
        self.backfill_labels(&mut report)?;
        self.reconcile_ghost_labels(&mut report)?;

        info!(
            "Resolution done: {} matched, {} ghosted, {} skipped, {} artists merged, \
             {} labels merged, {} labels backfilled, {} ghosts reconciled",
            report.matched,
            report.ghosted,
            report.rows_skipped,
            report.artists_merged,
            report.labels_merged,
            report.labels_backfilled,
            report.ghosts_reconciled
        );
        Ok(report)
    }

    // ==================== Row Resolution ====================

    fn resolve_pending_rows(&self, report: &mut ResolveReport) -> Result<()> {
        for row in self.registry.pending_rows()? {
            let normalized = normalize_name(&row.raw_artist);
            if normalized.is_empty() {
                warn!(
                    "Row {} has no resolvable artist name ('{}'), leaving pending",
                    row.id, row.raw_artist
                );
                report.rows_skipped += 1;
                continue;
            }

            let (artist, created) = self.resolve_or_create_artist(&row.raw_artist, &normalized)?;
            self.registry.link_row_to_artist(row.id, &artist.id)?;
            if created {
                debug!("Created ghost artist '{}' for '{}'", artist.id, row.raw_artist);
                report.ghosted += 1;
            } else {
                report.matched += 1;
            }
        }
        Ok(())
    }

    /// Phase (a): direct match on the normalized key. Phase (b): create a
    /// ghost with a slug id. The UNIQUE key on normalized_name makes the
    /// insert race-free: on conflict the concurrent winner is re-read.
    fn resolve_or_create_artist(
        &self,
        raw_name: &str,
        normalized: &str,
    ) -> Result<(CanonicalArtist, bool)> {
        if let Some(existing) = self.registry.find_artist_by_normalized(normalized)? {
            return Ok((existing, false));
        }

        let ghost = CanonicalArtist {
            id: self.free_artist_slug(raw_name)?,
            name: raw_name.trim().to_string(),
            normalized_name: normalized.to_string(),
            status: EntityStatus::Ghost,
            label_id: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        if self.registry.insert_artist(&ghost)? {
            return Ok((ghost, true));
        }
        // Lost the insert; somebody else claimed the key.
        let existing = self
            .registry
            .find_artist_by_normalized(normalized)?
            .ok_or_else(|| anyhow::anyhow!("artist vanished during resolve-or-create"))?;
        Ok((existing, false))
    }

    fn free_artist_slug(&self, raw_name: &str) -> Result<String> {
        let base = slug_from_name(raw_name);
        if !self.registry.artist_id_exists(&base)? {
            return Ok(base);
        }
        let mut n = 2usize;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !self.registry.artist_id_exists(&candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn resolve_or_create_label(
        &self,
        raw_name: &str,
        normalized: &str,
    ) -> Result<(CanonicalLabel, bool)> {
        if let Some(existing) = self.registry.find_label_by_normalized(normalized)? {
            return Ok((existing, false));
        }

        let base = slug_from_name(raw_name);
        let mut id = base.clone();
        let mut n = 2usize;
        while self.registry.label_id_exists(&id)? {
            id = format!("{}-{}", base, n);
            n += 1;
        }

        let ghost = CanonicalLabel {
            id,
            name: raw_name.trim().to_string(),
            normalized_name: normalized.to_string(),
            status: EntityStatus::Ghost,
            created_at: chrono::Utc::now().timestamp(),
        };
        if self.registry.insert_label(&ghost)? {
            return Ok((ghost, true));
        }
        let existing = self
            .registry
            .find_label_by_normalized(normalized)?
            .ok_or_else(|| anyhow::anyhow!("label vanished during resolve-or-create"))?;
        Ok((existing, false))
    }

    // ==================== Deduplication ====================

    /// Merge canonical artists whose current names normalize onto the same
    /// key. The earliest-created entity survives; every reference is
    /// repointed before the duplicates are deleted, one transaction per
    /// store per group.
    fn dedup_artists(&self, report: &mut ResolveReport) -> Result<()> {
        let groups = duplicate_groups(
            self.registry
                .all_artists()?
                .into_iter()
                .map(|a| (a.id.clone(), a.name.clone(), a.created_at, a)),
        );

        for (key, group) in groups {
            let (primary, duplicates) = split_primary(group);
            let duplicate_ids: Vec<String> = duplicates.iter().map(|d| d.id.clone()).collect();
            info!(
                "Merging {} duplicate artist(s) into '{}' (key '{}')",
                duplicate_ids.len(),
                primary.id,
                key
            );

            // Chart references first: if the registry merge fails midway the
            // chart rows point at the surviving id, which still exists.
            self.charts
                .repoint_entity(EntityType::Artist, &duplicate_ids, &primary.id)?;
            self.registry.merge_artists(&primary.id, &duplicate_ids)?;

            // Inherit a label from a duplicate when the survivor has none.
            if primary.label_id.is_none() {
                if let Some(label_id) = duplicates.iter().find_map(|d| d.label_id.clone()) {
                    self.registry.set_artist_label(&primary.id, &label_id)?;
                }
            }
            self.registry.repair_artist_normalized(&primary.id, &key)?;
            report.artists_merged += duplicate_ids.len() as u64;
        }
        Ok(())
    }

    fn dedup_labels(&self, report: &mut ResolveReport) -> Result<()> {
        let groups = duplicate_groups(
            self.registry
                .all_labels()?
                .into_iter()
                .map(|l| (l.id.clone(), l.name.clone(), l.created_at, l)),
        );

        for (key, group) in groups {
            let (primary, duplicates) = split_primary(group);
            let duplicate_ids: Vec<String> = duplicates.iter().map(|d| d.id.clone()).collect();
            info!(
                "Merging {} duplicate label(s) into '{}' (key '{}')",
                duplicate_ids.len(),
                primary.id,
                key
            );

            self.charts
                .repoint_entity(EntityType::Label, &duplicate_ids, &primary.id)?;
            self.registry.merge_labels(&primary.id, &duplicate_ids)?;
            self.registry
                .rename_label(&primary.id, &primary.name, &key, primary.status)?;
            report.labels_merged += duplicate_ids.len() as u64;
        }
        Ok(())
    }

    // ==================== Label Backfill ====================

    /// Attach labels to unaffiliated artists from their most recent
    /// non-empty raw label string.
    fn backfill_labels(&self, report: &mut ResolveReport) -> Result<()> {
        for artist in self.registry.artists_without_label()? {
            let Some(raw_label) = self.registry.latest_raw_label_for_artist(&artist.id)? else {
                continue;
            };
            let normalized = normalize_name(&raw_label);
            if normalized.is_empty() {
                continue;
            }
            let (label, created) = self.resolve_or_create_label(&raw_label, &normalized)?;
            self.registry.set_artist_label(&artist.id, &label.id)?;
            debug!(
                "Backfilled label '{}' for artist '{}' ({})",
                label.id,
                artist.id,
                if created { "created" } else { "matched" }
            );
            report.labels_backfilled += 1;
        }
        Ok(())
    }

    // ==================== Ghost Reconciliation ====================

    /// Enrich ghost labels still carrying a placeholder display name with a
    /// confirmed name recovered from a linked artist's report history.
    /// A recovered name that normalizes onto another label merges the ghost
    /// into it; otherwise the rename promotes the ghost to active.
    fn reconcile_ghost_labels(&self, report: &mut ResolveReport) -> Result<()> {
        for label in self.registry.all_labels()? {
            if label.status != EntityStatus::Ghost || !has_placeholder_name(&label) {
                continue;
            }

            let Some(recovered) = self.recover_label_name(&label)? else {
                continue;
            };
            let normalized = normalize_name(&recovered);

            match self.registry.find_label_by_normalized(&normalized)? {
                Some(existing) if existing.id != label.id => {
                    info!(
                        "Merging ghost label '{}' into '{}' via recovered name '{}'",
                        label.id, existing.id, recovered
                    );
                    self.charts.repoint_entity(
                        EntityType::Label,
                        &[label.id.clone()],
                        &existing.id,
                    )?;
                    self.registry
                        .merge_labels(&existing.id, &[label.id.clone()])?;
                }
                _ => {
                    info!(
                        "Renaming ghost label '{}' to confirmed name '{}'",
                        label.id, recovered
                    );
                    self.registry.rename_label(
                        &label.id,
                        recovered.trim(),
                        &normalized,
                        EntityStatus::Active,
                    )?;
                }
            }
            report.ghosts_reconciled += 1;
        }
        Ok(())
    }

    /// Most recent non-placeholder raw label name among the ghost's linked
    /// artists.
    fn recover_label_name(&self, label: &CanonicalLabel) -> Result<Option<String>> {
        for artist in self.registry.artists_for_label(&label.id)? {
            if let Some(raw) = self.registry.latest_raw_label_for_artist(&artist.id)? {
                let trimmed = raw.trim();
                // A raw string identical to its own slug is just another
                // placeholder; keep looking.
                if !trimmed.is_empty() && slug_from_name(trimmed) != trimmed {
                    return Ok(Some(trimmed.to_string()));
                }
            }
        }
        Ok(None)
    }
}

/// True when a label's display name is just its own slug/key, i.e. nothing
/// confirmed was ever attached.
fn has_placeholder_name(label: &CanonicalLabel) -> bool {
    label.name == label.id || label.name == label.normalized_name || label.name.trim().is_empty()
}

/// Group entities by normalization of their current display name and keep
/// only groups with duplicates. BTreeMap keeps merge order deterministic.
fn duplicate_groups<T>(
    entities: impl Iterator<Item = (String, String, i64, T)>,
) -> BTreeMap<String, Vec<(String, i64, T)>> {
    let mut groups: BTreeMap<String, Vec<(String, i64, T)>> = BTreeMap::new();
    for (id, name, created_at, entity) in entities {
        let key = normalize_name(&name);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push((id, created_at, entity));
    }
    groups.retain(|_, group| group.len() > 1);
    groups
}

/// Earliest-created wins; ascending id breaks creation-time ties.
fn split_primary<T>(mut group: Vec<(String, i64, T)>) -> (T, Vec<T>) {
    group.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let mut iter = group.into_iter().map(|(_, _, entity)| entity);
    let primary = iter.next().expect("duplicate group cannot be empty");
    (primary, iter.collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart_store::SqliteChartStore;
    use crate::registry_store::{IngestionBatch, SqliteRegistryStore, StagedRow};

    fn stores() -> (SqliteRegistryStore, SqliteChartStore) {
        (
            SqliteRegistryStore::in_memory().unwrap(),
            SqliteChartStore::in_memory().unwrap(),
        )
    }

    fn stage_row(registry: &SqliteRegistryStore, artist: &str, track: &str, label: Option<&str>) {
        let batch_id = "batch-1";
        if registry.get_batch_by_filename("f.csv").unwrap().is_none() {
            registry
                .create_batch(&IngestionBatch {
                    id: batch_id.to_string(),
                    source_filename: "f.csv".to_string(),
                    report_week: 14,
                    report_year: 2023,
                    row_count: 0,
                    skipped_count: 0,
                    ingested_at: 0,
                })
                .unwrap();
        }
        registry
            .upsert_row(&StagedRow {
                batch_id: batch_id.to_string(),
                raw_artist: artist.to_string(),
                raw_track: track.to_string(),
                raw_label: label.map(str::to_string),
                spins: 10,
                prior_spins: None,
                reach: 1,
                rank_position: None,
                weekly_score: 12.5,
                report_week: 14,
                report_year: 2023,
                source_filename: "f.csv".to_string(),
            })
            .unwrap();
    }

    #[test]
    fn test_resolves_by_creating_ghost_then_matching() {
        let (registry, charts) = stores();
        stage_row(&registry, "Test Band", "Song One", None);
        stage_row(&registry, "TEST BAND!", "Song Two", None);

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();

        // First row creates the ghost, the second direct-matches it.
        assert_eq!(report.ghosted, 1);
        assert_eq!(report.matched, 1);

        let artist = registry.find_artist_by_normalized("testband").unwrap().unwrap();
        assert_eq!(artist.id, "test-band");
        assert_eq!(artist.status, EntityStatus::Ghost);

        let rows = registry.resolved_rows_for_week(2023, 14).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.artist_id.as_deref() == Some("test-band")));
    }

    #[test]
    fn test_unresolvable_row_stays_pending() {
        let (registry, charts) = stores();
        stage_row(&registry, "???", "Song", None);

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(registry.pending_rows().unwrap().len(), 1);
        assert!(registry.resolved_rows_for_week(2023, 14).unwrap().is_empty());
    }

    #[test]
    fn test_ghost_slug_disambiguation() {
        let (registry, charts) = stores();
        // An unrelated entity already owns the base slug.
        registry
            .insert_artist(&CanonicalArtist {
                id: "test-band".to_string(),
                name: "Renamed Elsewhere".to_string(),
                normalized_name: "renamedelsewhere".to_string(),
                status: EntityStatus::Active,
                label_id: None,
                created_at: 0,
            })
            .unwrap();
        stage_row(&registry, "Test Band", "Song", None);

        IdentityResolver::new(&registry, &charts).run().unwrap();

        let ghost = registry.find_artist_by_normalized("testband").unwrap().unwrap();
        assert_eq!(ghost.id, "test-band-2");
    }

    #[test]
    fn test_dedup_merges_earliest_created_as_primary() {
        let (registry, charts) = stores();
        // Two artists whose names normalize identically; stored keys differ
        // (legacy drift), which is exactly what the pass exists to catch.
        registry
            .insert_artist(&CanonicalArtist {
                id: "band".to_string(),
                name: "Band".to_string(),
                normalized_name: "band".to_string(),
                status: EntityStatus::Active,
                label_id: None,
                created_at: 100,
            })
            .unwrap();
        registry
            .insert_artist(&CanonicalArtist {
                id: "band-dup".to_string(),
                name: "BAND!".to_string(),
                normalized_name: "band-legacy".to_string(),
                status: EntityStatus::Ghost,
                label_id: None,
                created_at: 200,
            })
            .unwrap();
        stage_row(&registry, "BAND!", "Song", None);
        let row_id = registry.pending_rows().unwrap()[0].id;
        registry.link_row_to_artist(row_id, "band-dup").unwrap();

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();
        assert_eq!(report.artists_merged, 1);

        assert!(registry.get_artist("band-dup").unwrap().is_none());
        let rows = registry.resolved_rows_for_week(2023, 14).unwrap();
        assert_eq!(rows[0].artist_id.as_deref(), Some("band"));

        // Exactly one artist holds the normalized key afterwards.
        let survivor = registry.find_artist_by_normalized("band").unwrap().unwrap();
        assert_eq!(survivor.id, "band");
    }

    #[test]
    fn test_dedup_repoints_chart_references() {
        let (registry, charts) = stores();
        for (id, created) in [("band", 100), ("band-dup", 200)] {
            registry
                .insert_artist(&CanonicalArtist {
                    id: id.to_string(),
                    name: "Band".to_string(),
                    normalized_name: id.to_string(),
                    status: EntityStatus::Ghost,
                    label_id: None,
                    created_at: created,
                })
                .unwrap();
        }
        let window = charts
            .get_or_create_window("weekly", "2023-04-03", "2023-04-09")
            .unwrap();
        charts
            .replace_window_items(
                window.id,
                &[crate::chart_store::NewRankingItem {
                    entity_type: EntityType::Artist,
                    entity_id: "band-dup".to_string(),
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

        IdentityResolver::new(&registry, &charts).run().unwrap();

        let items = charts.items_for_window(window.id, EntityType::Artist).unwrap();
        assert_eq!(items[0].entity_id, "band");
    }

    #[test]
    fn test_label_backfill_uses_latest_raw_label() {
        let (registry, charts) = stores();
        stage_row(&registry, "Test Band", "Song", Some("Indie Co"));

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();
        assert_eq!(report.labels_backfilled, 1);

        let artist = registry.find_artist_by_normalized("testband").unwrap().unwrap();
        let label_id = artist.label_id.unwrap();
        let label = registry.get_label(&label_id).unwrap().unwrap();
        assert_eq!(label.name, "Indie Co");
        assert_eq!(label.status, EntityStatus::Ghost);
    }

    #[test]
    fn test_backfill_leaves_artists_with_no_label_history() {
        let (registry, charts) = stores();
        stage_row(&registry, "Test Band", "Song", None);

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();
        assert_eq!(report.labels_backfilled, 0);

        let artist = registry.find_artist_by_normalized("testband").unwrap().unwrap();
        assert!(artist.label_id.is_none());
    }

    #[test]
    fn test_ghost_label_reconciliation_renames_and_promotes() {
        let (registry, charts) = stores();
        // Placeholder ghost label (name == id), linked to an artist whose
        // history carries the confirmed spelling.
        registry
            .insert_label(&CanonicalLabel {
                id: "indie-co".to_string(),
                name: "indie-co".to_string(),
                normalized_name: "indieco".to_string(),
                status: EntityStatus::Ghost,
                created_at: 0,
            })
            .unwrap();
        stage_row(&registry, "Test Band", "Song", Some("Indie Co."));

        IdentityResolver::new(&registry, &charts).run().unwrap();
        // Backfill matched the existing ghost by normalized name, then
        // reconciliation recovered the confirmed display name.
        let label = registry.get_label("indie-co").unwrap().unwrap();
        assert_eq!(label.name, "Indie Co.");
        assert_eq!(label.status, EntityStatus::Active);
    }

    #[test]
    fn test_idempotent_rerun_changes_nothing() {
        let (registry, charts) = stores();
        stage_row(&registry, "Test Band", "Song", Some("Indie Co"));

        IdentityResolver::new(&registry, &charts).run().unwrap();
        let artists_before = registry.all_artists().unwrap();
        let labels_before = registry.all_labels().unwrap();

        let report = IdentityResolver::new(&registry, &charts).run().unwrap();
        assert_eq!(report.matched, 0);
        assert_eq!(report.ghosted, 0);
        assert_eq!(report.artists_merged, 0);
        assert_eq!(registry.all_artists().unwrap(), artists_before);
        assert_eq!(registry.all_labels().unwrap(), labels_before);
    }
}
