//! Shared state for one shaper invocation.
//!
//! All locks live here instead of in module-level statics: a process-wide
//! mutex serializing class/filter mutations, and one mutex per interface
//! guarding qdisc lifecycle decisions.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::rate::{self, SystemCapabilities};
use crate::strategy::Scheduler;
use crate::tc::TcRunner;

pub struct ShaperContext {
    pub tc: TcRunner,
    pub scheduler: Scheduler,
    pub supports_64bit: bool,
    scheduler_lock: Mutex<()>,
    iface_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ShaperContext {
    /// Checks for the tc binary and probes kernel capabilities.
    pub async fn new(scheduler: Scheduler) -> Result<Self> {
        let tc = TcRunner::new();
        tc.ensure_available().await?;

        let supports_64bit = rate::detect_64bit_support(&tc).await;

        let ctx = Self {
            tc,
            scheduler,
            supports_64bit,
            scheduler_lock: Mutex::new(()),
            iface_locks: std::sync::Mutex::new(HashMap::new()),
        };

        let caps = ctx.capabilities();
        info!(
            "system capabilities: 64-bit rates: {}, max rate: {} Kbps, scheduler: {}",
            caps.supports_64bit_rates, caps.maximum_rate_kbps, caps.scheduler_type
        );

        Ok(ctx)
    }

    pub fn capabilities(&self) -> SystemCapabilities {
        SystemCapabilities {
            supports_64bit_rates: self.supports_64bit,
            maximum_rate_kbps: rate::max_rate(self.supports_64bit),
            scheduler_type: self.scheduler.as_str().to_string(),
        }
    }

    /// Serializes every class/filter mutation in this process.
    pub async fn lock_scheduler(&self) -> MutexGuard<'_, ()> {
        self.scheduler_lock.lock().await
    }

    /// Returns the lifecycle lock for one interface, creating it on demand.
    pub fn iface_lock(&self, dev: &str) -> Arc<Mutex<()>> {
        let mut locks = self.iface_locks.lock().expect("interface lock table poisoned");
        Arc::clone(
            locks
                .entry(dev.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_context() -> ShaperContext {
        ShaperContext {
            tc: TcRunner::new(),
            scheduler: Scheduler::Htb,
            supports_64bit: false,
            scheduler_lock: Mutex::new(()),
            iface_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_iface_locks_are_per_interface() {
        let ctx = bare_context();
        let a1 = ctx.iface_lock("eth0");
        let a2 = ctx.iface_lock("eth0");
        let b = ctx.iface_lock("wg0");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn test_capabilities_reflect_context() {
        let ctx = bare_context();
        let caps = ctx.capabilities();
        assert!(!caps.supports_64bit_rates);
        assert_eq!(caps.maximum_rate_kbps, crate::rate::MAX_RATE_32);
        assert_eq!(caps.scheduler_type, "htb");
    }
}
