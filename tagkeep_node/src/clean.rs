//! The scheduled clean cycle: LRU tag eviction interleaved with registry
//! garbage collection until disk usage drops to the configured target.

use std::sync::Arc;

use anyhow::Context;
use tagkeep_core::TagEntry;
use tagkeep_index::UsageIndex;
use tagkeep_registry::{GcRunner, Reference, RegistryError, TagRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CleanSettings;
use crate::disk::DiskProbe;
use crate::gate::MaintenanceGate;

pub struct Cleaner {
    pub index: UsageIndex,
    pub registry: Arc<dyn TagRegistry>,
    pub gc: Arc<dyn GcRunner>,
    pub disk: Arc<dyn DiskProbe>,
    pub gate: MaintenanceGate,
    /// Host prefix for canonical tag references.
    pub registry_host: String,
    pub settings: CleanSettings,
}

impl Cleaner {
    /// One full clean cycle. Runs GC, then alternates LRU deletion batches
    /// with GC until the disk target is met or the candidate list is
    /// exhausted. Each maintenance op takes the gate separately so write
    /// traffic drains through between batches.
    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.collect_garbage(cancel).await?;

        let (mut over_budget, mut used) = self.should_evict().await;
        let mut iteration: usize = 0;
        while over_budget {
            anyhow::ensure!(!cancel.is_cancelled(), "clean cycle cancelled");

            let lru = self.index.lru_list().await?;
            let share = (lru.len() as f64 * self.settings.clean_tags_percentage).floor() as usize;
            // From iteration 1 on, evict at least one tag per pass so small
            // LRU lists cannot stall the loop on a share that rounds to
            // zero.
            let n = share.max(iteration.min(1));
            let batch = n.min(lru.len());
            info!(
                total = lru.len(),
                removing = batch,
                used,
                target = self.settings.target_usage_bytes,
                "evicting least recently used tags"
            );

            let removed = self.delete_batch(&lru[..batch]).await?;
            self.collect_garbage(cancel).await?;

            (over_budget, used) = self.should_evict().await;
            if over_budget && batch > 0 && removed == 0 {
                warn!(
                    used,
                    "eviction made no progress, leaving remaining tags for the next cycle"
                );
                break;
            }
            if over_budget && lru.len().saturating_sub(n) == 0 {
                warn!(
                    used,
                    target = self.settings.target_usage_bytes,
                    "unable to reach target disk usage, no eviction candidates left"
                );
                break;
            }
            iteration += 1;
        }

        info!(used, "clean cycle finished");
        Ok(())
    }

    /// `(used > target, used)`. A probe failure is logged and reported as
    /// under budget: nothing gets deleted based on a usage number we could
    /// not measure.
    async fn should_evict(&self) -> (bool, u64) {
        match self.disk.used_bytes().await {
            Ok(used) => (used > self.settings.target_usage_bytes, used),
            Err(err) => {
                warn!(%err, "disk probe failed, treating usage as zero");
                (false, 0)
            }
        }
    }

    async fn collect_garbage(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let _gate = self
            .gate
            .maintenance()
            .await
            .context("maintenance gate closed")?;
        if let Err(err) = self.gc.collect(cancel).await {
            // A failed GC run costs reclaimed space, not correctness; the
            // cycle carries on unless it was shut down.
            warn!(%err, "registry garbage collection failed");
        }
        anyhow::ensure!(!cancel.is_cancelled(), "clean cycle cancelled");
        Ok(())
    }

    /// Deletes a batch of tags, oldest first, returning how many index
    /// entries were retired. Tolerates tags that are already gone
    /// upstream; an unexplained failure leaves the entry in the index for
    /// the next iteration unless a manifest probe confirms the tag is
    /// gone.
    async fn delete_batch(&self, batch: &[TagEntry]) -> anyhow::Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let _gate = self
            .gate
            .maintenance()
            .await
            .context("maintenance gate closed")?;

        let mut removed = 0;
        for entry in batch {
            let canonical = entry.canonical_name(&self.registry_host);
            let reference = match Reference::parse(&canonical) {
                Ok(r) => r,
                Err(err) => {
                    warn!(%canonical, %err, "skipping unparseable reference");
                    continue;
                }
            };

            info!("removing {canonical}");
            match self.registry.tag_delete(&reference).await {
                Ok(()) => {
                    self.index.remove(entry).await?;
                    removed += 1;
                }
                Err(RegistryError::NotFound) => {
                    debug!(%canonical, "tag already gone upstream");
                    self.index.remove(entry).await?;
                    removed += 1;
                }
                Err(err) => {
                    warn!(%canonical, %err, "tag delete failed");
                    match self.registry.manifest_exists(&reference).await {
                        Ok(false) => {
                            self.index.remove(entry).await?;
                            removed += 1;
                        }
                        Ok(true) => {} // still present, retry next iteration
                        Err(probe_err) => {
                            warn!(%canonical, %probe_err, "manifest probe failed")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}
