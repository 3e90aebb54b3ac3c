//! Ranking aggregation stage.
//!
//! Replays the resolved staging rows into weekly ranking windows. Every
//! window write is one transaction (delete + reinsert), scores are
//! recomputed from aggregated spins/reach at aggregation time, and the
//! previous-rank state is an explicit accumulator seeded from storage, so
//! interrupted backfills resume with correct deltas.

pub mod score;

use crate::chart_store::{
    ChartStore, EntityType, NewFairnessReceipt, NewRankingItem, RankMap,
};
use crate::registry_store::{RawReportRow, RegistryStore};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use score::{composite_score, WeekWindow};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

/// Interval key for the weekly chart.
pub const WEEKLY_INTERVAL: &str = "weekly";

/// Options shared by the stage CLI.
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Delete and repopulate windows that already hold data.
    pub force: bool,
    /// Continue from the latest stored window instead of the beginning.
    pub resume: bool,
    /// Skip the first N windows.
    pub offset: usize,
    /// Process at most N windows.
    pub limit: Option<usize>,
}

/// End-of-stage summary counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    pub windows_aggregated: usize,
    pub windows_skipped: usize,
    pub artists_ranked: u64,
    pub labels_ranked: u64,
}

/// Batch aggregator over the ingested report weeks.
pub struct RankingAggregator<'a> {
    registry: &'a dyn RegistryStore,
    charts: &'a dyn ChartStore,
}

impl<'a> RankingAggregator<'a> {
    pub fn new(registry: &'a dyn RegistryStore, charts: &'a dyn ChartStore) -> Self {
        Self { registry, charts }
    }

    /// Aggregate every selected report week, oldest first.
    pub fn run(&self, options: &AggregateOptions) -> Result<AggregateReport> {
        let mut weeks = self.registry.report_weeks()?;

        if options.resume {
            if let Some(latest) = self.charts.latest_window_with_data(WEEKLY_INTERVAL)? {
                let resume_from = WeekWindow::from_start(
                    latest
                        .window_start
                        .parse()
                        .context("stored window_start is not a date")?,
                );
                weeks.retain(|&(year, week)| {
                    (year, week) >= (resume_from.year, resume_from.week)
                });
                info!(
                    "Resuming from window {} ({} week(s) remain)",
                    latest.window_start,
                    weeks.len()
                );
            }
        }

        let selected: Vec<_> = weeks
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        // Current label affiliations, used for the rollup of every window.
        let artist_labels: HashMap<String, Option<String>> = self
            .registry
            .all_artists()?
            .into_iter()
            .map(|a| (a.id, a.label_id))
            .collect();

        let mut report = AggregateReport::default();
        let mut prev_ranks = self.seed_rank_map(&selected)?;

        let bar = ProgressBar::new(selected.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
                .expect("invalid progress template"),
        );

        for &(year, week) in &selected {
            let key = WeekWindow { year, week };
            bar.set_message(format!("week {}-{}", week, year));

            let (Some(start), Some(end)) = (key.start(), key.end()) else {
                warn!("Week {}-{} does not exist in the ISO calendar, skipping", week, year);
                bar.inc(1);
                continue;
            };
            let window = self.charts.get_or_create_window(
                WEEKLY_INTERVAL,
                &start.to_string(),
                &end.to_string(),
            )?;

            if window.state.has_data() && !options.force {
                // No writes, but the stored ranks must still feed the next
                // window's deltas.
                prev_ranks = self.charts.rank_map_for_window(window.id)?;
                report.windows_skipped += 1;
                info!("Window {} already populated, skipping", window.window_start);
                bar.inc(1);
                continue;
            }

            let rows = self.registry.resolved_rows_for_week(year, week)?;
            let outcome = aggregate_window(&rows, &artist_labels, &prev_ranks);

            self.charts
                .replace_window_items(window.id, &outcome.items, &outcome.receipts, true)?;

            info!(
                "Aggregated window {}: {} artists, {} labels",
                window.window_start, outcome.artist_count, outcome.label_count
            );
            report.windows_aggregated += 1;
            report.artists_ranked += outcome.artist_count as u64;
            report.labels_ranked += outcome.label_count as u64;

            // Carry forward for the next window's deltas.
            prev_ranks = outcome.rank_map;
            bar.inc(1);
        }
        bar.finish_and_clear();

        info!(
            "Aggregation done: {} windows aggregated, {} skipped, {} artist rankings, {} label rankings",
            report.windows_aggregated,
            report.windows_skipped,
            report.artists_ranked,
            report.labels_ranked
        );
        Ok(report)
    }

    /// Seed the accumulator from the last stored window before the first
    /// selected one. A fresh full run finds nothing and starts empty; a
    /// partial run (offset, resume, parallel worker) gets correct deltas.
    fn seed_rank_map(&self, selected: &[(i32, u32)]) -> Result<RankMap> {
        let Some(&(year, week)) = selected.first() else {
            return Ok(RankMap::new());
        };
        let Some(start) = (WeekWindow { year, week }).start() else {
            return Ok(RankMap::new());
        };
        match self
            .charts
            .latest_window_with_data_before(WEEKLY_INTERVAL, &start.to_string())?
        {
            Some(window) => self.charts.rank_map_for_window(window.id),
            None => Ok(RankMap::new()),
        }
    }
}

/// Everything one window's aggregation produced.
struct WindowOutcome {
    items: Vec<NewRankingItem>,
    receipts: Vec<NewFairnessReceipt>,
    rank_map: RankMap,
    artist_count: usize,
    label_count: usize,
}

#[derive(Default)]
struct ArtistAccumulator {
    spins: i64,
    reach: i64,
    row_count: i64,
    batches: BTreeSet<String>,
}

/// Pure per-window aggregation: resolved rows in, ranked items and the
/// next accumulator out. No storage access, so it replays and parallelizes
/// cleanly.
fn aggregate_window(
    rows: &[RawReportRow],
    artist_labels: &HashMap<String, Option<String>>,
    prev_ranks: &RankMap,
) -> WindowOutcome {
    // Sum spins and take max reach per artist; the composite score is
    // recomputed from the aggregates so formula changes replay.
    let mut artists: BTreeMap<String, ArtistAccumulator> = BTreeMap::new();
    for row in rows {
        let Some(artist_id) = &row.artist_id else {
            continue;
        };
        let acc = artists.entry(artist_id.clone()).or_default();
        acc.spins += row.spins;
        acc.reach = acc.reach.max(row.reach);
        acc.row_count += 1;
        acc.batches.insert(row.batch_id.clone());
    }

    let mut receipts = Vec::with_capacity(artists.len());
    let mut artist_scores: Vec<(String, f64, i64, i64)> = Vec::with_capacity(artists.len());
    for (artist_id, acc) in &artists {
        let score = composite_score(acc.spins, acc.reach);
        artist_scores.push((artist_id.clone(), score, acc.spins, acc.reach));
        receipts.push(NewFairnessReceipt {
            artist_id: artist_id.clone(),
            spins: acc.spins,
            reach: acc.reach,
            score,
            row_count: acc.row_count,
            source_batches: acc.batches.iter().cloned().collect(),
        });
    }

    // Label scores roll up from current affiliations.
    let mut labels: BTreeMap<String, (f64, i64, i64)> = BTreeMap::new();
    for (artist_id, score, spins, reach) in &artist_scores {
        if let Some(Some(label_id)) = artist_labels.get(artist_id) {
            let entry = labels.entry(label_id.clone()).or_insert((0.0, 0, 0));
            entry.0 += score;
            entry.1 += spins;
            entry.2 = entry.2.max(*reach);
        }
    }
    let label_scores: Vec<(String, f64, i64, i64)> = labels
        .into_iter()
        .map(|(id, (score, spins, reach))| (id, score, spins, reach))
        .collect();

    let mut rank_map = RankMap::new();
    let mut items = Vec::with_capacity(artist_scores.len() + label_scores.len());
    let artist_count = artist_scores.len();
    let label_count = label_scores.len();
    for (entity_type, scores) in [
        (EntityType::Artist, artist_scores),
        (EntityType::Label, label_scores),
    ] {
        for item in rank_entities(entity_type, scores, prev_ranks) {
            rank_map.insert((entity_type, item.entity_id.clone()), item.rank);
            items.push(item);
        }
    }

    WindowOutcome {
        items,
        receipts,
        rank_map,
        artist_count,
        label_count,
    }
}

/// Sort descending by score (ascending id breaks exact ties) and assign a
/// dense 1..N rank. Delta source is the previous window's rank map.
fn rank_entities(
    entity_type: EntityType,
    mut scores: Vec<(String, f64, i64, i64)>,
    prev_ranks: &RankMap,
) -> Vec<NewRankingItem> {
    scores.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scores
        .into_iter()
        .enumerate()
        .map(|(index, (entity_id, score, spins, reach))| {
            let rank = index as i64 + 1;
            let prev_rank = prev_ranks.get(&(entity_type, entity_id.clone())).copied();
            NewRankingItem {
                entity_type,
                entity_id,
                rank,
                prev_rank,
                score,
                spins,
                reach,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_store::ResolutionStatus;

    fn resolved_row(artist_id: &str, spins: i64, reach: i64, batch: &str) -> RawReportRow {
        RawReportRow {
            id: 0,
            batch_id: batch.to_string(),
            raw_artist: artist_id.to_string(),
            raw_track: "song".to_string(),
            raw_label: None,
            spins,
            prior_spins: None,
            reach,
            rank_position: None,
            weekly_score: 0.0,
            report_week: 14,
            report_year: 2023,
            source_filename: "f.csv".to_string(),
            artist_id: Some(artist_id.to_string()),
            resolution_status: ResolutionStatus::Resolved,
            created_at: 0,
        }
    }

    fn no_labels() -> HashMap<String, Option<String>> {
        HashMap::new()
    }

    #[test]
    fn test_single_row_scenario() {
        // One artist, 50 spins, reach 4: score 100, rank 1, never charted.
        let rows = vec![resolved_row("test-band", 50, 4, "b1")];
        let outcome = aggregate_window(&rows, &no_labels(), &RankMap::new());

        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!(item.entity_type, EntityType::Artist);
        assert_eq!(item.entity_id, "test-band");
        assert_eq!(item.rank, 1);
        assert_eq!(item.score, 100.0);
        assert_eq!(item.prev_rank, None);

        assert_eq!(outcome.receipts.len(), 1);
        let receipt = &outcome.receipts[0];
        assert_eq!(receipt.row_count, 1);
        assert_eq!(receipt.source_batches, vec!["b1"]);
    }

    #[test]
    fn test_artist_aggregation_sums_spins_max_reach() {
        let rows = vec![
            resolved_row("band", 30, 4, "b1"),
            resolved_row("band", 20, 2, "b2"),
        ];
        let outcome = aggregate_window(&rows, &no_labels(), &RankMap::new());

        let item = &outcome.items[0];
        assert_eq!(item.spins, 50);
        assert_eq!(item.reach, 4);
        // Recomputed from aggregates: 50 x (1 + 4x0.25).
        assert_eq!(item.score, 100.0);

        let receipt = &outcome.receipts[0];
        assert_eq!(receipt.row_count, 2);
        assert_eq!(receipt.source_batches, vec!["b1", "b2"]);
    }

    #[test]
    fn test_dense_ranks_with_tie_break_by_id() {
        let rows = vec![
            resolved_row("zeta", 10, 0, "b1"),
            resolved_row("alpha", 10, 0, "b1"),
            resolved_row("mid", 50, 0, "b1"),
        ];
        let outcome = aggregate_window(&rows, &no_labels(), &RankMap::new());

        let ranked: Vec<(&str, i64)> = outcome
            .items
            .iter()
            .filter(|i| i.entity_type == EntityType::Artist)
            .map(|i| (i.entity_id.as_str(), i.rank))
            .collect();
        // Equal scores order by ascending id; ranks stay dense 1..N.
        assert_eq!(ranked, vec![("mid", 1), ("alpha", 2), ("zeta", 3)]);
    }

    #[test]
    fn test_delta_against_previous_window() {
        let mut prev = RankMap::new();
        prev.insert((EntityType::Artist, "climber".to_string()), 3);
        prev.insert((EntityType::Artist, "faller".to_string()), 1);

        let rows = vec![
            resolved_row("climber", 100, 0, "b1"),
            resolved_row("faller", 10, 0, "b1"),
            resolved_row("debut", 50, 0, "b1"),
        ];
        let outcome = aggregate_window(&rows, &no_labels(), &prev);

        let by_id: HashMap<&str, &NewRankingItem> = outcome
            .items
            .iter()
            .filter(|i| i.entity_type == EntityType::Artist)
            .map(|i| (i.entity_id.as_str(), i))
            .collect();

        assert_eq!(by_id["climber"].rank, 1);
        assert_eq!(by_id["climber"].prev_rank, Some(3));
        assert_eq!(by_id["faller"].rank, 3);
        assert_eq!(by_id["faller"].prev_rank, Some(1));
        assert_eq!(by_id["debut"].prev_rank, None);
    }

    #[test]
    fn test_label_rollup_sums_member_scores() {
        let mut artist_labels = HashMap::new();
        artist_labels.insert("a1".to_string(), Some("indie-co".to_string()));
        artist_labels.insert("a2".to_string(), Some("indie-co".to_string()));
        artist_labels.insert("a3".to_string(), None);

        let rows = vec![
            resolved_row("a1", 50, 4, "b1"), // score 100
            resolved_row("a2", 40, 0, "b1"), // score 40
            resolved_row("a3", 10, 0, "b1"),
        ];
        let outcome = aggregate_window(&rows, &artist_labels, &RankMap::new());

        let labels: Vec<&NewRankingItem> = outcome
            .items
            .iter()
            .filter(|i| i.entity_type == EntityType::Label)
            .collect();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].entity_id, "indie-co");
        assert_eq!(labels[0].score, 140.0);
        assert_eq!(labels[0].rank, 1);
        assert_eq!(outcome.label_count, 1);
    }

    #[test]
    fn test_unresolved_rows_are_excluded() {
        let mut pending = resolved_row("ignored", 500, 10, "b1");
        pending.artist_id = None;
        pending.resolution_status = ResolutionStatus::PendingMapping;

        let outcome = aggregate_window(&[pending], &no_labels(), &RankMap::new());
        assert!(outcome.items.is_empty());
        assert!(outcome.receipts.is_empty());
    }

    #[test]
    fn test_rank_map_covers_both_entity_types() {
        let mut artist_labels = HashMap::new();
        artist_labels.insert("a1".to_string(), Some("l1".to_string()));
        let rows = vec![resolved_row("a1", 10, 0, "b1")];

        let outcome = aggregate_window(&rows, &artist_labels, &RankMap::new());
        assert_eq!(
            outcome.rank_map.get(&(EntityType::Artist, "a1".to_string())),
            Some(&1)
        );
        assert_eq!(
            outcome.rank_map.get(&(EntityType::Label, "l1".to_string())),
            Some(&1)
        );
    }
}
