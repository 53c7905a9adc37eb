use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use std::sync::Arc;

use crate::limits::*;
use crate::model::TenantId;
use crate::store::{SharedTenantState, StoreError, TenantState};

/// Lazily populated map of tenant shards. The first touch of a tenant runs
/// `open` exactly once, even under concurrent callers.
pub struct TenantRegistry {
    shards: DashMap<TenantId, SharedTenantState>,
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }

    pub fn get(&self, tenant: &TenantId) -> Option<SharedTenantState> {
        self.shards.get(tenant).map(|e| e.value().clone())
    }

    /// Get or create the tenant's shard. `open` receives an empty state to fill
    /// (e.g. from a WAL replay) and runs under the map's shard lock. The flag is
    /// true only for the one caller whose `open` created the shard.
    pub fn get_or_open(
        &self,
        tenant: &TenantId,
        open: impl FnOnce(&mut TenantState) -> Result<(), StoreError>,
    ) -> Result<(SharedTenantState, bool), StoreError> {
        if let Some(shard) = self.get(tenant) {
            return Ok((shard, false));
        }
        if self.shards.len() >= MAX_TENANTS {
            return Err(StoreError::LimitExceeded("too many tenants"));
        }
        let shard = match self.shards.entry(tenant.clone()) {
            Entry::Occupied(e) => return Ok((e.get().clone(), false)),
            Entry::Vacant(e) => {
                let mut state = TenantState::new(tenant.clone());
                open(&mut state)?;
                e.insert(Arc::new(RwLock::new(state))).clone()
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.shards.len() as f64);
        Ok((shard, true))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingConfig, Event};

    fn t(name: &str) -> TenantId {
        TenantId::parse(name).unwrap()
    }

    #[test]
    fn same_shard_returned() {
        let reg = TenantRegistry::new();
        let (a, created) = reg.get_or_open(&t("foo"), |_| Ok(())).unwrap();
        assert!(created);
        let (b, created) = reg.get_or_open(&t("foo"), |_| panic!("opened twice")).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn concurrent_first_touch_creates_once() {
        let reg = Arc::new(TenantRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.get_or_open(&t("racy"), |_| Ok(())).unwrap().1)
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn lazy_creation() {
        let reg = TenantRegistry::new();
        assert!(reg.get(&t("lazy")).is_none());
        assert!(reg.is_empty());
        reg.get_or_open(&t("lazy"), |_| Ok(())).unwrap();
        assert!(reg.get(&t("lazy")).is_some());
        assert_eq!(reg.tenants(), vec![t("lazy")]);
    }

    #[test]
    fn open_failure_leaves_no_shard() {
        let reg = TenantRegistry::new();
        let err = reg
            .get_or_open(&t("broken"), |_| Err(StoreError::Wal("disk on fire".into())))
            .unwrap_err();
        assert_eq!(err, StoreError::Wal("disk on fire".into()));
        assert!(reg.get(&t("broken")).is_none());
    }

    #[tokio::test]
    async fn open_fills_state() {
        let reg = TenantRegistry::new();
        let config = BookingConfig {
            slot_granularity_minutes: 15,
            ..Default::default()
        };
        let (shard, _) = reg
            .get_or_open(&t("filled"), |state| {
                state.apply(&Event::ConfigSet { config });
                Ok(())
            })
            .unwrap();
        assert_eq!(shard.read().await.config(), config);
    }

    #[test]
    fn tenant_count_limit() {
        let reg = TenantRegistry::new();
        for i in 0..MAX_TENANTS {
            reg.get_or_open(&t(&format!("t{i}")), |_| Ok(())).unwrap();
        }
        let err = reg.get_or_open(&t("one_more"), |_| Ok(())).unwrap_err();
        assert_eq!(err, StoreError::LimitExceeded("too many tenants"));
        // Existing tenants stay reachable at the limit.
        assert!(reg.get_or_open(&t("t0"), |_| Ok(())).is_ok());
    }
}
