//! Single-flight guard
//!
//! A one-permit semaphore shared by every timer and admin entry point. Runs
//! try to enter without waiting and report busy when another run holds it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide run lock, cloned into every caller that must be exclusive
#[derive(Debug, Clone)]
pub struct SingleFlight {
    semaphore: Arc<Semaphore>,
}

/// Proof of exclusive access; released on drop, including on early return or panic
#[derive(Debug)]
pub struct RunPermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Enter if free; `None` when another holder is active
    pub fn try_enter(&self) -> Option<RunPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| RunPermit { _permit: permit })
    }

    /// Wait for the guard; used by short admin critical sections
    pub async fn enter(&self) -> Result<RunPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Run guard closed")?;
        Ok(RunPermit { _permit: permit })
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
