//! Admission gate between registry writes and maintenance.
//!
//! A weighted semaphore: write-like requests take one permit each and are
//! turned away (`503`) when none are available; maintenance ops take the
//! whole capacity, which both waits out in-flight writes and keeps new
//! ones from starting. Read-like traffic never touches the gate, so pulls
//! are never blocked by cleanup.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Far above any realistic write concurrency; the gate is an exclusion
/// mechanism, not a rate limit.
pub const GATE_CAPACITY: u32 = 10_000;

#[derive(Clone)]
pub struct MaintenanceGate {
    permits: Arc<Semaphore>,
}

impl MaintenanceGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(GATE_CAPACITY as usize)),
        }
    }

    /// Non-blocking admission for a write-like request. `None` while a
    /// maintenance op holds the gate (or after shutdown); the caller
    /// responds `503`. The permit is released on drop, which the proxy
    /// ties to response completion.
    pub fn try_write(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Exclusive admission for a maintenance op. Waits for all write
    /// permits to return; errors once the gate has been closed so a
    /// shutdown never leaves maintenance blocked forever.
    pub async fn maintenance(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.permits.clone().acquire_many_owned(GATE_CAPACITY).await
    }

    /// Fails all pending and future acquisitions. Called on shutdown.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl Default for MaintenanceGate {
    fn default() -> Self {
        Self::new()
    }
}
