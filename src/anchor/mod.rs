//! Boundary to the external anchoring/notification service.
//!
//! Stages notify the service after ingesting a report so downstream
//! consumers can anchor the batch. The call is strictly fire-and-forget:
//! failures are logged locally and never roll back or fail the ingestion
//! that triggered them.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::warn;

/// Notification sink for freshly ingested batches.
pub trait AnchorNotifier: Send + Sync {
    /// Announce one ingested batch. Implementations report transport
    /// failures through the Result; callers only log them.
    fn notify_batch(&self, batch_id: &str, source_filename: &str) -> Result<()>;
}

/// Send a notification, logging instead of propagating any failure.
pub fn notify_fire_and_forget(
    notifier: &dyn AnchorNotifier,
    batch_id: &str,
    source_filename: &str,
) {
    if let Err(e) = notifier.notify_batch(batch_id, source_filename) {
        warn!("Anchor notification for batch {} failed: {:#}", batch_id, e);
    }
}

/// HTTP client for the anchoring service.
pub struct HttpAnchorNotifier {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpAnchorNotifier {
    /// Create a new anchor client.
    ///
    /// The timeout is deliberately short; a slow anchoring service must
    /// not stall a batch run.
    pub fn new(base_url: String, timeout_sec: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .context("failed to create anchor HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl AnchorNotifier for HttpAnchorNotifier {
    fn notify_batch(&self, batch_id: &str, source_filename: &str) -> Result<()> {
        let url = format!("{}/anchor/batch", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "batch_id": batch_id,
                "source_filename": source_filename,
            }))
            .send()
            .context("failed to reach anchoring service")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "anchoring service rejected batch {}: status {}",
                batch_id,
                response.status()
            );
        }
        Ok(())
    }
}

/// No-op notifier used when no anchor URL is configured.
pub struct NoOpAnchorNotifier;

impl AnchorNotifier for NoOpAnchorNotifier {
    fn notify_batch(&self, _batch_id: &str, _source_filename: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    impl AnchorNotifier for FailingNotifier {
        fn notify_batch(&self, _batch_id: &str, _source_filename: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("service down")
        }
    }

    #[test]
    fn test_noop_notifier_succeeds() {
        assert!(NoOpAnchorNotifier.notify_batch("b1", "f.csv").is_ok());
    }

    #[test]
    fn test_fire_and_forget_swallows_errors() {
        let notifier = FailingNotifier {
            calls: AtomicUsize::new(0),
        };
        // Must not panic or propagate.
        notify_fire_and_forget(&notifier, "b1", "f.csv");
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }
}
