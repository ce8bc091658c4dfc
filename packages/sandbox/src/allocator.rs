// ABOUTME: Unit allocator acquiring execution units from a provider and tracking live resources
// ABOUTME: Supports single acquisition and best-effort batch acquisition for degraded pools

use crate::providers::{Provider, UnitConfig};
use crate::unit::{ExecutionUnit, Result, UnitError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a batch acquisition
///
/// `units` may hold fewer entries than requested; `shortfall_error` carries
/// the provider failure that stopped acquisition early.
#[derive(Debug)]
pub struct BatchAcquisition {
    pub units: Vec<ExecutionUnit>,
    pub requested: usize,
    pub shortfall_error: Option<UnitError>,
}

impl BatchAcquisition {
    pub fn is_complete(&self) -> bool {
        self.units.len() == self.requested
    }
}

/// Acquires units from one provider with one config
#[derive(Clone)]
pub struct UnitAllocator {
    provider: Arc<dyn Provider>,
    config: UnitConfig,
    live_units: Arc<AtomicUsize>,
    acquired_total: Arc<AtomicUsize>,
}

impl UnitAllocator {
    pub fn new(provider: Arc<dyn Provider>, config: UnitConfig) -> Self {
        Self {
            provider,
            config,
            live_units: Arc::new(AtomicUsize::new(0)),
            acquired_total: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// Units acquired and not yet released
    pub fn live_units(&self) -> usize {
        self.live_units.load(Ordering::SeqCst)
    }

    /// Units acquired over the allocator's lifetime
    pub fn acquired_total(&self) -> usize {
        self.acquired_total.load(Ordering::SeqCst)
    }

    /// Allocate one unit; the caller must eventually release it
    pub async fn acquire(&self) -> Result<ExecutionUnit> {
        let handle = self
            .provider
            .create(&self.config)
            .await
            .map_err(UnitError::Provision)?;

        self.live_units.fetch_add(1, Ordering::SeqCst);
        self.acquired_total.fetch_add(1, Ordering::SeqCst);

        let unit = ExecutionUnit::new(handle, self.provider.clone(), self.live_units.clone());
        info!(unit_id = %unit.id(), handle = %unit.handle(), "Acquired execution unit");
        Ok(unit)
    }

    /// Acquire up to `count` units, stopping at the first provider failure
    pub async fn acquire_up_to(&self, count: usize) -> BatchAcquisition {
        let mut units = Vec::with_capacity(count);
        let mut shortfall_error = None;

        for _ in 0..count {
            match self.acquire().await {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    warn!(
                        "Acquired {} of {} requested units before failure: {}",
                        units.len(),
                        count,
                        e
                    );
                    shortfall_error = Some(e);
                    break;
                }
            }
        }

        BatchAcquisition {
            units,
            requested: count,
            shortfall_error,
        }
    }
}
