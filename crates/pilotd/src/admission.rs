//! Concurrent-run admission.
//!
//! Tracks active `(tenant, run-id)` slots in a global set and per-tenant
//! sub-sets. Acquisition checks the global cap, then the tenant cap, and
//! takes both slots in one critical section, both or neither. A periodic
//! sweep evicts slots whose run never released (crashed workers).

use pilot_core::{Config, Id};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often stale slots are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Age after which an unreleased slot is considered leaked.
const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Typed admission rejections; callers distinguish the tiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("global concurrent-run cap reached: {active}/{cap}")]
    GlobalCapExceeded { active: usize, cap: usize },
    #[error("tenant {tenant} concurrent-run cap reached: {active}/{cap}")]
    UserCapExceeded {
        tenant: String,
        active: usize,
        cap: usize,
    },
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

#[derive(Debug)]
struct Slots {
    /// All active slots, keyed by run id.
    global: HashMap<Id, (String, Instant)>,
    /// Per-tenant view of the same slots.
    per_tenant: HashMap<String, HashSet<Id>>,
}

/// Process-wide concurrent test limit.
#[derive(Debug)]
pub struct ConcurrentTestLimit {
    slots: Arc<Mutex<Slots>>,
    max_global: usize,
    max_per_user: usize,
    sweeper: Option<JoinHandle<()>>,
}

impl ConcurrentTestLimit {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                global: HashMap::new(),
                per_tenant: HashMap::new(),
            })),
            max_global: config.concurrent_limit_max_global,
            max_per_user: config.concurrent_limit_max_per_user,
            sweeper: None,
        }
    }

    /// Take a slot for `(tenant, run_id)`. Atomic across both sets.
    pub fn acquire(&self, tenant: &str, run_id: &Id) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        if slots.global.len() >= self.max_global {
            return Err(AdmissionError::GlobalCapExceeded {
                active: slots.global.len(),
                cap: self.max_global,
            });
        }

        let tenant_active = slots
            .per_tenant
            .get(tenant)
            .map(HashSet::len)
            .unwrap_or(0);
        if tenant_active >= self.max_per_user {
            return Err(AdmissionError::UserCapExceeded {
                tenant: tenant.to_string(),
                active: tenant_active,
                cap: self.max_per_user,
            });
        }

        slots
            .global
            .insert(run_id.clone(), (tenant.to_string(), Instant::now()));
        slots
            .per_tenant
            .entry(tenant.to_string())
            .or_default()
            .insert(run_id.clone());
        Ok(())
    }

    /// Release a slot. Removes from both sets; unknown ids are a no-op.
    pub fn release(&self, tenant: &str, run_id: &Id) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.global.remove(run_id);
        if let Some(tenant_slots) = slots.per_tenant.get_mut(tenant) {
            tenant_slots.remove(run_id);
            if tenant_slots.is_empty() {
                slots.per_tenant.remove(tenant);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .global
            .len()
    }

    pub fn active_for_tenant(&self, tenant: &str) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .per_tenant
            .get(tenant)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Start the background stale-slot sweep. Idempotent.
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        let slots = Arc::clone(&self.slots);
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
                let stale: Vec<(Id, String)> = slots
                    .global
                    .iter()
                    .filter(|(_, (_, started))| now.duration_since(*started) >= STALE_AFTER)
                    .map(|(id, (tenant, _))| (id.clone(), tenant.clone()))
                    .collect();
                for (run_id, tenant) in stale {
                    warn!(%run_id, %tenant, "sweeping stale concurrent-run slot");
                    slots.global.remove(&run_id);
                    if let Some(tenant_slots) = slots.per_tenant.get_mut(&tenant) {
                        tenant_slots.remove(&run_id);
                        if tenant_slots.is_empty() {
                            slots.per_tenant.remove(&tenant);
                        }
                    }
                }
                debug!(active = slots.global.len(), "concurrent-run sweep complete");
            }
        }));
    }

    /// Stop the background sweep.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

impl Drop for ConcurrentTestLimit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
