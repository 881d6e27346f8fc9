//! ContextRegistry: shared serving contexts with ref-counting.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use portico_protocol::{ContextKey, DispatchResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::serving::{ContextState, ServingContext};

/// Internal entry in the registry: tracks refcount.
struct ContextEntry {
    context: Arc<ServingContext>,
    refcount: AtomicUsize,
}

/// Admin description of one registered context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub key: String,
    pub refcount: usize,
    pub state: ContextState,
    pub sessions: Option<usize>,
}

type SharedEntry = Arc<ContextEntry>;

/// Manages serving contexts with ref-counting.
///
/// Many requests (and the host's own deployment) share a context. It is
/// constructed on first acquire and torn down when the last reference is
/// released.
///
/// Lookups of existing keys only take the read side of the lock. The write
/// side is held for map mutation (and the construction it guards) but never
/// across teardown.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: RwLock<HashMap<ContextKey, SharedEntry>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the context for `key`, constructing it with `factory` if absent,
    /// and take a reference on it. At most one construction happens per key;
    /// a factory error leaves nothing registered.
    pub fn acquire<F>(&self, key: &ContextKey, factory: F) -> DispatchResult<Arc<ServingContext>>
    where
        F: FnOnce(&ContextKey) -> DispatchResult<ServingContext>,
    {
        self.acquire_entry(key, factory).map(|entry| entry.context.clone())
    }

    fn acquire_entry<F>(&self, key: &ContextKey, factory: F) -> DispatchResult<SharedEntry>
    where
        F: FnOnce(&ContextKey) -> DispatchResult<ServingContext>,
    {
        {
            let contexts = self.contexts.read();
            if let Some(entry) = contexts.get(key) {
                let refs = entry.refcount.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("Serving context reused: {key} (refcount: {refs})");
                return Ok(entry.clone());
            }
        }

        let mut contexts = self.contexts.write();
        // Somebody may have created it between the two locks
        if let Some(entry) = contexts.get(key) {
            let refs = entry.refcount.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("Serving context reused: {key} (refcount: {refs})");
            return Ok(entry.clone());
        }

        let entry = Arc::new(ContextEntry {
            context: Arc::new(factory(key)?),
            refcount: AtomicUsize::new(1),
        });
        contexts.insert(key.clone(), entry.clone());
        info!("Serving context created: {key}");
        Ok(entry)
    }

    /// Like [`acquire`](Self::acquire), released automatically when the lease drops.
    pub fn lease<F>(&self, key: &ContextKey, factory: F) -> DispatchResult<ContextLease<'_>>
    where
        F: FnOnce(&ContextKey) -> DispatchResult<ServingContext>,
    {
        let entry = self.acquire_entry(key, factory)?;
        Ok(ContextLease {
            registry: self,
            key: key.clone(),
            entry,
        })
    }

    /// Drop one reference on the context currently registered for `key`.
    /// When the count reaches zero the entry is removed and the context torn
    /// down outside the lock.
    ///
    /// Returns the remaining count, or `None` if the key is not registered.
    pub fn release(&self, key: &ContextKey) -> Option<usize> {
        let Some(entry) = self.contexts.read().get(key).cloned() else {
            warn!("Release of unregistered serving context: {key}");
            return None;
        };
        Some(self.release_entry(key, &entry))
    }

    fn release_entry(&self, key: &ContextKey, entry: &SharedEntry) -> usize {
        let remaining = entry
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0);

        if remaining > 0 {
            debug!("Serving context refcount decremented: {key} (refcount: {remaining})");
            return remaining;
        }

        let teardown = {
            let mut contexts = self.contexts.write();
            match contexts.get(key) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    // An acquire may have revived the entry before we got here
                    let unreferenced = entry.refcount.load(Ordering::Acquire) == 0;
                    if unreferenced {
                        contexts.remove(key);
                    }
                    unreferenced
                }
                // Retired: no acquire can reach it any more
                _ => true,
            }
        };

        if teardown {
            info!("Serving context released: {key}");
            entry.context.destroy();
            0
        } else {
            let refs = entry.refcount.load(Ordering::Acquire);
            debug!("Serving context {key} revived before removal (refcount: {refs})");
            refs
        }
    }

    /// Unregister the context for `key` and drop one reference on it, so the
    /// next acquire constructs a fresh one. Outstanding leases keep the
    /// retired context alive and the last of them tears it down.
    ///
    /// Returns the references still held on the retired context, or `None`
    /// if the key is not registered.
    pub fn retire(&self, key: &ContextKey) -> Option<usize> {
        let entry = self.contexts.write().remove(key)?;
        let remaining = self.release_entry(key, &entry);
        if remaining > 0 {
            info!("Serving context retired: {key} ({remaining} in flight)");
        }
        Some(remaining)
    }

    /// Get the context for a key without taking a reference.
    pub fn get(&self, key: &ContextKey) -> Option<Arc<ServingContext>> {
        self.contexts.read().get(key).map(|e| e.context.clone())
    }

    pub fn ref_count(&self, key: &ContextKey) -> Option<usize> {
        self.contexts
            .read()
            .get(key)
            .map(|e| e.refcount.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    pub fn describe(&self) -> Vec<ContextInfo> {
        let mut infos: Vec<ContextInfo> = self
            .contexts
            .read()
            .values()
            .map(|e| ContextInfo {
                key: e.context.key().to_string(),
                refcount: e.refcount.load(Ordering::Acquire),
                state: e.context.state(),
                sessions: e.context.sessions().map(|s| s.active_sessions()),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Tear down every context regardless of refcount (server shutdown).
    pub fn shutdown_all(&self) {
        // Drain all entries while holding the lock briefly
        let entries: Vec<_> = {
            let mut contexts = self.contexts.write();
            contexts.drain().collect()
        };

        // Teardown outside the lock
        for (key, entry) in entries {
            info!("Shutting down serving context: {key}");
            entry.context.destroy();
        }
    }
}

/// A counted reference to a serving context, released on drop.
///
/// The lease pins the exact context it was granted, even if the key is
/// retired and redeployed meanwhile. Dropping the last reference runs the
/// context's stop hooks on the dropping thread, so those hooks must not block.
pub struct ContextLease<'a> {
    registry: &'a ContextRegistry,
    key: ContextKey,
    entry: SharedEntry,
}

impl ContextLease<'_> {
    pub fn context(&self) -> &Arc<ServingContext> {
        &self.entry.context
    }
}

impl Deref for ContextLease<'_> {
    type Target = ServingContext;

    fn deref(&self) -> &ServingContext {
        &self.entry.context
    }
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        self.registry.release_entry(&self.key, &self.entry);
    }
}
