//! Store registry: the set of known storage backends, in registration order.
//!
//! Registration is append-only at runtime. Decommissioning only flips the
//! store's status; its ledger account is left alone until the store is
//! explicitly purged.

use crate::store::{Store, StoreDescriptor, StoreStatus};
use crate::{LibrarianError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub store: Arc<Store>,
    pub status: StoreStatus,
}

impl StoreEntry {
    pub fn name(&self) -> &str {
        &self.store.name
    }

    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }
}

/// Point-in-time view of the registry. `iter()` may be called repeatedly and
/// always yields stores in registration order.
#[derive(Debug, Clone, Default)]
pub struct StoreListing {
    entries: Vec<StoreEntry>,
}

impl StoreListing {
    pub fn iter(&self) -> impl Iterator<Item = &StoreEntry> + '_ {
        self.entries.iter()
    }

    pub fn available(&self) -> impl Iterator<Item = &StoreEntry> + '_ {
        self.entries.iter().filter(|entry| entry.is_available())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a StoreListing {
    type Item = &'a StoreEntry;
    type IntoIter = std::slice::Iter<'a, StoreEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, StoreEntry>,
}

#[derive(Default)]
pub struct StoreRegistry {
    inner: RwLock<RegistryInner>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, descriptor: &StoreDescriptor) -> Result<Arc<Store>> {
        let name = descriptor.name.trim();
        if name.is_empty() {
            return Err(LibrarianError::InvalidRequest(
                "store name cannot be empty".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(name) {
            return Err(LibrarianError::DuplicateStore(name.to_string()));
        }

        let mut store = descriptor.store();
        store.name = name.to_string();
        let store = Arc::new(store);

        inner.order.push(store.name.clone());
        inner.entries.insert(
            store.name.clone(),
            StoreEntry {
                store: Arc::clone(&store),
                status: StoreStatus::from_available(descriptor.available),
            },
        );

        Ok(store)
    }

    pub async fn lookup(&self, name: &str) -> Result<StoreEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| LibrarianError::StoreNotFound(name.to_string()))
    }

    pub async fn is_available(&self, name: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(name)
            .is_some_and(|entry| entry.is_available())
    }

    pub async fn list(&self) -> StoreListing {
        let inner = self.inner.read().await;
        let entries = inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name).cloned())
            .collect();

        StoreListing { entries }
    }

    /// Marks a store unavailable for new placements. Returns `false` if it
    /// was already decommissioned.
    pub async fn decommission(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| LibrarianError::StoreNotFound(name.to_string()))?;

        if entry.status == StoreStatus::Decommissioned {
            return Ok(false);
        }

        entry.status = StoreStatus::Decommissioned;
        Ok(true)
    }

    /// Drops a decommissioned store from the registry.
    pub async fn remove(&self, name: &str) -> Result<Arc<Store>> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get(name)
            .ok_or_else(|| LibrarianError::StoreNotFound(name.to_string()))?;

        if entry.is_available() {
            return Err(LibrarianError::InvalidRequest(format!(
                "store {} must be decommissioned before it is purged",
                name
            )));
        }

        let store = Arc::clone(&entry.store);
        inner.entries.remove(name);
        inner.order.retain(|existing| existing != name);
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_rejects_duplicate_names() {
        let registry = StoreRegistry::new();
        registry
            .register(&StoreDescriptor::new("Store 0", 100))
            .await
            .unwrap();

        let err = registry
            .register(&StoreDescriptor::new("Store 0", 200))
            .await
            .unwrap_err();
        assert!(matches!(err, LibrarianError::DuplicateStore(name) if name == "Store 0"));

        let entry = registry.lookup("Store 0").await.unwrap();
        assert_eq!(entry.store.capacity, 100);
    }

    #[tokio::test]
    async fn lookup_unknown_store_fails() {
        let registry = StoreRegistry::new();
        let err = registry.lookup("missing").await.unwrap_err();
        assert!(matches!(err, LibrarianError::StoreNotFound(_)));
    }

    #[tokio::test]
    async fn listing_preserves_registration_order_and_restarts() {
        let registry = StoreRegistry::new();
        for name in ["pot", "Store 1", "Store 0"] {
            registry
                .register(&StoreDescriptor::new(name, 10))
                .await
                .unwrap();
        }

        let listing = registry.list().await;
        let first: Vec<&str> = listing.iter().map(StoreEntry::name).collect();
        let second: Vec<&str> = listing.iter().map(StoreEntry::name).collect();
        assert_eq!(first, vec!["pot", "Store 1", "Store 0"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn decommissioned_store_stays_listed_until_removed() {
        let registry = StoreRegistry::new();
        registry
            .register(&StoreDescriptor::new("a", 10))
            .await
            .unwrap();
        registry
            .register(&StoreDescriptor::new("b", 10))
            .await
            .unwrap();

        assert!(registry.remove("a").await.is_err());

        assert!(registry.decommission("a").await.unwrap());
        assert!(!registry.decommission("a").await.unwrap());
        assert!(!registry.is_available("a").await);

        let listing = registry.list().await;
        assert_eq!(listing.len(), 2);
        let available: Vec<&str> = listing.available().map(StoreEntry::name).collect();
        assert_eq!(available, vec!["b"]);

        registry.remove("a").await.unwrap();
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.lookup("a").await.is_err());
    }
}
