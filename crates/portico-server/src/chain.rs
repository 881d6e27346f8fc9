//! HandlerRegistry: maintains the live, ordered interceptor chain.
//!
//! The chain is rebuilt from two sources: interceptors supplied by the host
//! (availability notifications) and interceptors named in the `load` rule,
//! instantiated through an [`InterceptorCatalog`]. Every rebuild publishes a
//! fresh immutable [`InterceptorSnapshot`]; requests that already captured the
//! previous snapshot keep traversing it undisturbed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use portico_protocol::{DispatchError, DispatchResult, HandlerRules};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::interceptor::SharedInterceptor;

/// Factory used to instantiate an interceptor by name.
pub type InterceptorFactory = Arc<dyn Fn() -> DispatchResult<SharedInterceptor> + Send + Sync>;

/// Explicit name → factory registry, populated at startup.
#[derive(Clone, Default)]
pub struct InterceptorCatalog {
    factories: BTreeMap<String, InterceptorFactory>,
}

impl InterceptorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> DispatchResult<SharedInterceptor> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> DispatchResult<SharedInterceptor> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Create a fresh instance of the named interceptor.
    pub fn instantiate(&self, name: &str) -> DispatchResult<SharedInterceptor> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DispatchError::UnknownInterceptor(name.to_string()))?;
        factory()
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Handle of an interceptor supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceId(u64);

/// Where a snapshot entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Origin {
    Service { id: ServiceId },
    Loaded { name: String },
}

/// Immutable, ordered view of the chain valid for one request's traversal.
pub struct InterceptorSnapshot {
    entries: Vec<SnapshotEntry>,
    generation: u64,
}

struct SnapshotEntry {
    interceptor: SharedInterceptor,
    origin: Origin,
}

/// Admin description of one chain entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorInfo {
    pub index: usize,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub origin: Origin,
}

impl InterceptorSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild counter this snapshot was published by.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, index: usize) -> Option<&SharedInterceptor> {
        self.entries.get(index).map(|e| &e.interceptor)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SharedInterceptor> {
        self.entries.iter().map(|e| &e.interceptor)
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|i| i.name_dyn()).collect()
    }

    pub fn describe(&self) -> Vec<InterceptorInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| InterceptorInfo {
                index,
                name: e.interceptor.name_dyn().to_string(),
                priority: e.interceptor.priority_dyn(),
                enabled: e.interceptor.is_enabled_dyn(),
                origin: e.origin.clone(),
            })
            .collect()
    }
}

/// Maintains the live, ordered, enabled set of request interceptors.
pub struct HandlerRegistry {
    /// Host-supplied interceptors in availability order.
    services: Mutex<Vec<(ServiceId, SharedInterceptor)>>,
    next_service_id: AtomicU64,
    catalog: InterceptorCatalog,
    /// Last applied rules, reused by rebuilds that bring none.
    rules: RwLock<Option<Arc<HandlerRules>>>,
    current: ArcSwapOption<InterceptorSnapshot>,
    /// Serializes rebuilds; readers never take it.
    rebuild_lock: Mutex<()>,
    generation: AtomicU64,
}

impl HandlerRegistry {
    pub fn new(catalog: InterceptorCatalog) -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            next_service_id: AtomicU64::new(1),
            catalog,
            rules: RwLock::new(None),
            current: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &InterceptorCatalog {
        &self.catalog
    }

    /// Latest published snapshot, built lazily on first use.
    pub fn current_snapshot(&self) -> Arc<InterceptorSnapshot> {
        if let Some(snapshot) = self.current.load_full() {
            return snapshot;
        }
        self.rebuild(None)
    }

    /// Re-derive and publish the chain. `Some(rules)` replaces the stored rules
    /// wholesale; `None` reuses the last applied ones.
    pub fn rebuild(&self, rules: Option<HandlerRules>) -> Arc<InterceptorSnapshot> {
        let _rebuilding = self.rebuild_lock.lock();

        let rules = match rules {
            Some(rules) => {
                let rules = Arc::new(rules);
                *self.rules.write() = Some(rules.clone());
                Some(rules)
            }
            None => self.rules.read().clone(),
        };

        let mut entries: Vec<SnapshotEntry> = self
            .services
            .lock()
            .iter()
            .map(|(id, interceptor)| SnapshotEntry {
                interceptor: interceptor.clone(),
                origin: Origin::Service { id: *id },
            })
            .collect();

        if let Some(rules) = &rules {
            for name in rules.load() {
                match self.catalog.instantiate(&name) {
                    Ok(interceptor) => entries.push(SnapshotEntry {
                        interceptor,
                        origin: Origin::Loaded { name },
                    }),
                    Err(e) => warn!("Skipping interceptor {name}: {e}"),
                }
            }

            for entry in &entries {
                if let Some(configurable) = entry.interceptor.configurable_dyn() {
                    configurable.configure(rules);
                }
            }
        }

        // Stable: equal priorities keep registration order
        entries.sort_by_key(|e| e.interceptor.priority_dyn());

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(InterceptorSnapshot { entries, generation });
        self.current.store(Some(snapshot.clone()));

        info!(
            "Interceptor chain rebuilt (generation {generation}): [{}]",
            snapshot.names().join(", ")
        );
        snapshot
    }

    /// Replace the rules and rebuild.
    pub fn update_rules(&self, rules: HandlerRules) -> Arc<InterceptorSnapshot> {
        self.rebuild(Some(rules))
    }

    /// A host-supplied interceptor became available.
    pub fn on_available(&self, interceptor: SharedInterceptor) -> ServiceId {
        let id = ServiceId(self.next_service_id.fetch_add(1, Ordering::Relaxed));
        debug!("Interceptor available: {} ({id:?})", interceptor.name_dyn());
        self.services.lock().push((id, interceptor));
        self.rebuild(None);
        id
    }

    /// A host-supplied interceptor changed its properties (priority, state).
    pub fn on_changed(&self, id: ServiceId) {
        debug!("Interceptor changed: {id:?}");
        self.rebuild(None);
    }

    /// A host-supplied interceptor went away. Returns whether it was known.
    pub fn on_unavailable(&self, id: ServiceId) -> bool {
        let removed = {
            let mut services = self.services.lock();
            let before = services.len();
            services.retain(|(sid, _)| *sid != id);
            services.len() != before
        };
        if removed {
            debug!("Interceptor unavailable: {id:?}");
            self.rebuild(None);
        } else {
            warn!("Unavailable notification for unknown interceptor {id:?}");
        }
        removed
    }

    /// Copy of the last applied rules.
    pub fn rules(&self) -> Option<HandlerRules> {
        self.rules.read().as_deref().cloned()
    }

    pub fn describe(&self) -> Vec<InterceptorInfo> {
        self.current_snapshot().describe()
    }
}
