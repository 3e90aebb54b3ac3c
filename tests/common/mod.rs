//! Common test infrastructure
//!
//! Spins up a complete on-disk pipeline environment: a temp database
//! directory, a temp report archive, and opened stores. Tests drive the
//! real stage types against it.

use airchart::anchor::NoOpAnchorNotifier;
use airchart::chart_store::{RankingWindow, SqliteChartStore};
use airchart::identity::{IdentityResolver, ResolveReport};
use airchart::ingest::{IngestOptions, IngestReport, ReportIngestor};
use airchart::ranking::{AggregateOptions, AggregateReport, RankingAggregator, WEEKLY_INTERVAL};
use airchart::registry_store::SqliteRegistryStore;
use airchart::sync::{StoreSynchronizer, SyncReport};
use airchart::ChartStore;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

/// A pipeline wired to temp directories, with both databases on disk so
/// state survives across stage invocations the way production runs do.
pub struct TestPipeline {
    _db_dir: TempDir,
    pub archive_dir: TempDir,
    pub registry: SqliteRegistryStore,
    pub charts: SqliteChartStore,
}

impl TestPipeline {
    pub fn new() -> Self {
        let db_dir = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let registry = SqliteRegistryStore::open(&db_dir.path().join("registry.db")).unwrap();
        let charts = SqliteChartStore::open(&db_dir.path().join("charts.db")).unwrap();
        Self {
            _db_dir: db_dir,
            archive_dir,
            registry,
            charts,
        }
    }

    /// Drop a report CSV into the archive.
    pub fn write_report(&self, filename: &str, content: &str) {
        fs::write(self.archive_dir.path().join(filename), content).unwrap();
    }

    pub fn ingest(&self) -> Result<IngestReport> {
        self.ingest_with(&IngestOptions::default())
    }

    pub fn ingest_with(&self, options: &IngestOptions) -> Result<IngestReport> {
        ReportIngestor::new(&self.registry, &NoOpAnchorNotifier)
            .run(self.archive_dir.path(), options)
    }

    pub fn resolve(&self) -> Result<ResolveReport> {
        IdentityResolver::new(&self.registry, &self.charts).run()
    }

    pub fn sync(&self) -> Result<SyncReport> {
        StoreSynchronizer::new(&self.registry, &self.charts).run()
    }

    pub fn aggregate(&self) -> Result<AggregateReport> {
        self.aggregate_with(&AggregateOptions::default())
    }

    pub fn aggregate_with(&self, options: &AggregateOptions) -> Result<AggregateReport> {
        RankingAggregator::new(&self.registry, &self.charts).run(options)
    }

    /// Ingest → resolve → sync → aggregate, the normal stage order.
    pub fn run_all(&self) -> Result<()> {
        self.ingest()?;
        self.resolve()?;
        self.sync()?;
        self.aggregate()?;
        Ok(())
    }

    /// Stored weekly windows, ascending.
    pub fn weekly_windows(&self) -> Vec<RankingWindow> {
        self.charts.windows(WEEKLY_INTERVAL).unwrap()
    }
}

/// Week 14-2023 report: Test Band tops the chart, two labels in play.
pub const WEEK_14_CSV: &str = "\
Rank,Artist,Track,Spins,Prior Spins,Reach,Label
1,Test Band,Big Song,50,40,4,Indie Co
2,Second Act,Other Song,40,41,2,Indie Co
3,Solo Star,Lone Song,30,28,1,Major Corp
";

/// Week 15-2023 report: Solo Star overtakes everyone.
pub const WEEK_15_CSV: &str = "\
Rank,Artist,Track,Spins,Prior Spins,Reach,Label
1,Solo Star,Lone Song,90,30,3,Major Corp
2,Test Band,Big Song,45,50,4,Indie Co
3,Second Act,Other Song,20,40,1,Indie Co
";

pub const WEEK_14_FILENAME: &str = "SMR - 14-2023 Top 200.csv";
pub const WEEK_15_FILENAME: &str = "SMR - 15-2023 Top 200.csv";
