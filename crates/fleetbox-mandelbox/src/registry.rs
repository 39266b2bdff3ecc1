//! The process-wide mandelbox registry.
//!
//! Owns every live [`Mandelbox`] strongly and indexes it by mandelbox id
//! and by container runtime id. Mandelboxes hold no back-pointer to the
//! registry; removal happens from the teardown paths in the event loop.

use std::collections::HashMap;
use std::sync::Arc;

use fleetbox_db::MandelboxId;
use parking_lot::RwLock;

use crate::mandelbox::Mandelbox;

#[derive(Default)]
struct Inner {
    by_id: HashMap<MandelboxId, Arc<Mandelbox>>,
    by_runtime_id: HashMap<String, MandelboxId>,
}

/// Registry of live mandelboxes. Writes happen only on create and close.
#[derive(Default)]
pub struct MandelboxRegistry {
    inner: RwLock<Inner>,
}

impl MandelboxRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly created mandelbox.
    pub fn register(&self, mandelbox: Arc<Mandelbox>) {
        self.inner.write().by_id.insert(mandelbox.id(), mandelbox);
    }

    /// Indexes a mandelbox by its container runtime id once the container
    /// is created.
    pub fn register_runtime_id(&self, runtime_id: impl Into<String>, id: MandelboxId) {
        self.inner.write().by_runtime_id.insert(runtime_id.into(), id);
    }

    /// Looks up a mandelbox by id.
    #[must_use]
    pub fn lookup(&self, id: MandelboxId) -> Option<Arc<Mandelbox>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Looks up a mandelbox by container runtime id.
    #[must_use]
    pub fn lookup_by_runtime_id(&self, runtime_id: &str) -> Option<Arc<Mandelbox>> {
        let inner = self.inner.read();
        let id = inner.by_runtime_id.get(runtime_id)?;
        inner.by_id.get(id).cloned()
    }

    /// Removes a mandelbox and its runtime-id index entry. Returns the
    /// removed object so the caller can close it.
    pub fn remove(&self, id: MandelboxId) -> Option<Arc<Mandelbox>> {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(&id);
        inner.by_runtime_id.retain(|_, mapped| *mapped != id);
        removed
    }

    /// Number of live mandelboxes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Snapshot of every live mandelbox.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Mandelbox>> {
        self.inner.read().by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ResourceBroker;
    use fleetbox_core::Dirs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn make_mandelbox(tmp: &TempDir) -> Arc<Mandelbox> {
        let dirs = Dirs::new(tmp.path().join("fleet"), tmp.path().join("temp"));
        let (death_tx, _death_rx) = mpsc::channel(1);
        Mandelbox::new(
            MandelboxId::new(),
            "browsers/chromium",
            Arc::new(ResourceBroker::with_seed(1, 3)),
            dirs,
            death_tx,
        )
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let tmp = TempDir::new().unwrap();
        let registry = MandelboxRegistry::new();
        let mandelbox = make_mandelbox(&tmp);
        let id = mandelbox.id();

        registry.register(Arc::clone(&mandelbox));
        registry.register_runtime_id("runtime-1", id);

        assert_eq!(registry.count(), 1);
        assert!(registry.lookup(id).is_some());
        assert!(registry.lookup_by_runtime_id("runtime-1").is_some());
        assert!(registry.lookup_by_runtime_id("runtime-2").is_none());

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id(), id);
        assert_eq!(registry.count(), 0);
        assert!(registry.lookup_by_runtime_id("runtime-1").is_none());
    }
}
