//! Draining the APEL queue into the accounting collector
//!
//! Each batch of queue entries goes through three phases:
//!
//! 1. **Claim and convert**: claim each entry, read it, convert individual
//!    job records, release the claim. Entries claimed elsewhere are skipped.
//! 2. **Forward**: one forwarder session for the whole batch.
//! 3. **Remove**: once forwarding succeeded, every entry claimed in phase 1
//!    is claimed again and deleted, including entries that were not job
//!    records.
//!
//! Any error aborts the run before phase 3, so a batch is either fully
//! removed or left in the queue for the next run. Records sent before a
//! failure may be sent again (at-least-once delivery).

use gratia_common::vo::VoResolver;
use gratia_common::{Forwarder, Result, UsageRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::apel::ApelRecord;
use crate::config::{MeterConfig, DEFAULT_BATCH_SIZE};
use crate::dirq::{DirQueue, DEFAULT_MAX_TEMP_AGE};

/// Knobs for a [`Meter`] run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterOptions {
    pub batch_size: usize,
    /// Break claims older than this before draining; `None` never does
    pub lease_timeout: Option<Duration>,
    pub resolve_reportable_vo: bool,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            lease_timeout: None,
            resolve_reportable_vo: false,
        }
    }
}

impl From<&MeterConfig> for MeterOptions {
    fn from(config: &MeterConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            lease_timeout: config.lease_timeout(),
            resolve_reportable_vo: config.resolve_reportable_vo,
        }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    /// Entries claimed in the convert phase
    pub claimed: usize,
    /// Entries skipped because another consumer held them
    pub skipped: usize,
    pub forwarded: usize,
    pub removed: usize,
}

/// Split queue entry names into batches of `size`
///
/// The final batch holds the remainder and is present even when empty.
pub fn batch_names(names: Vec<String>, size: usize) -> Vec<Vec<String>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(names.len() / size + 1);
    let mut current = Vec::with_capacity(size);

    for name in names {
        current.push(name);
        if current.len() >= size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    batches.push(current);

    batches
}

/// Queue consumer feeding a [`Forwarder`]
pub struct Meter<F: Forwarder> {
    queue: DirQueue,
    forwarder: F,
    resolver: Arc<VoResolver>,
    options: MeterOptions,
}

impl<F: Forwarder> Meter<F> {
    pub fn new(queue: DirQueue, forwarder: F, resolver: Arc<VoResolver>, options: MeterOptions) -> Self {
        Self {
            queue,
            forwarder,
            resolver,
            options,
        }
    }

    pub fn queue(&self) -> &DirQueue {
        &self.queue
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    pub fn into_forwarder(self) -> F {
        self.forwarder
    }

    /// Drain the queue once
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        if let Some(max_lock_age) = self.options.lease_timeout {
            let report = self.queue.purge(DEFAULT_MAX_TEMP_AGE, Some(max_lock_age))?;
            if report.stale_locks > 0 {
                warn!(stale_locks = report.stale_locks, "Broke abandoned queue claims");
            }
        }

        let names = self.queue.names()?;
        info!(queue = %self.queue.path().display(), entries = names.len(), "Draining queue");

        for (index, batch) in batch_names(names, self.options.batch_size).into_iter().enumerate() {
            summary.batches += 1;
            self.process_batch(&batch, &mut summary)
                .instrument(info_span!("batch", index, size = batch.len()))
                .await?;
        }

        info!(
            batches = summary.batches,
            claimed = summary.claimed,
            skipped = summary.skipped,
            forwarded = summary.forwarded,
            removed = summary.removed,
            "Queue drained"
        );
        Ok(summary)
    }

    async fn process_batch(&mut self, batch: &[String], summary: &mut RunSummary) -> Result<()> {
        let mut claimed = Vec::with_capacity(batch.len());
        let mut records = Vec::new();

        for name in batch {
            let lease = match self.queue.try_acquire(name) {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(element = %name, "Entry claimed elsewhere; skipping");
                    summary.skipped += 1;
                    continue;
                },
                Err(e) => {
                    warn!(element = %name, error = %e, "Cannot claim entry; skipping");
                    summary.skipped += 1;
                    continue;
                },
            };
            claimed.push(name.clone());

            let payload = lease.read()?;
            if ApelRecord::is_individual_record(&payload) {
                let record = self.convert(&ApelRecord::parse(&payload)).inspect_err(|e| {
                    if e.is_record_error() {
                        error!(element = %lease.name(), error = %e, "Malformed job record; leaving it queued");
                    }
                })?;
                records.push(record);
            } else {
                debug!(element = %lease.name(), "Not an individual job record; dropping");
            }
            lease.release()?;
        }
        summary.claimed += claimed.len();

        if !records.is_empty() {
            info!(records = records.len(), claimed = claimed.len(), "Forwarding batch");
            self.forward(&records).await?;
            summary.forwarded += records.len();
        }

        for name in &claimed {
            match self.queue.try_acquire(name) {
                Ok(Some(lease)) => {
                    lease.remove()?;
                    summary.removed += 1;
                },
                Ok(None) => debug!(element = %name, "Entry claimed elsewhere before removal; leaving it"),
                Err(e) => warn!(element = %name, error = %e, "Cannot claim entry for removal; leaving it"),
            }
        }

        Ok(())
    }

    fn convert(&self, apel: &ApelRecord) -> Result<UsageRecord> {
        let resolver = self.options.resolve_reportable_vo.then_some(&*self.resolver);
        apel.to_usage_record(resolver)
    }

    /// One forwarder session; all records are reported under the first record's site
    async fn forward(&mut self, records: &[UsageRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let site = first.site_name.clone().unwrap_or_default();
        let probe = first.probe_name.clone();

        self.forwarder.configure(&site, &probe);
        self.forwarder.handshake().await?;

        if let Err(e) = self.forwarder.search_outstanding().await {
            error!(error = %e, "Failed to search outstanding records");
            return Err(e);
        }
        self.forwarder.reprocess_outstanding().await?;

        for record in records {
            let response = self.forwarder.send(record).await?;
            debug!(
                job = record.local_job_id.as_deref().unwrap_or("-"),
                response = %response,
                "Sent record"
            );
        }

        self.forwarder.flush_bundle().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{:08x}/{:014x}", 0, i)).collect()
    }

    #[test]
    fn test_batch_names_remainder() {
        let batches = batch_names(names(5), 2);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_batch_names_trailing_empty_batch() {
        let sizes: Vec<usize> = batch_names(names(4), 2).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 0]);

        let sizes: Vec<usize> = batch_names(Vec::new(), 100).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![0]);
    }

    #[test]
    fn test_batch_names_keeps_order() {
        let batches = batch_names(names(3), 100);
        assert_eq!(batches, vec![names(3)]);
    }

    #[test]
    fn test_options_from_config() {
        let config = MeterConfig::from_vars(|key| match key {
            "GRATIA_QUEUE_DIR" => Some("/q".to_string()),
            "GRATIA_COLLECTOR_URL" => Some("http://localhost/rmi".to_string()),
            "GRATIA_BATCH_SIZE" => Some("7".to_string()),
            "GRATIA_LEASE_TIMEOUT_SECS" => Some("60".to_string()),
            _ => None,
        })
        .unwrap();

        let options = MeterOptions::from(&config);
        assert_eq!(options.batch_size, 7);
        assert_eq!(options.lease_timeout, Some(Duration::from_secs(60)));
        assert!(!options.resolve_reportable_vo);
    }
}
