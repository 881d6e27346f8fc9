//! Mount table: routes a request's host and path to a hosting key.

use std::sync::Arc;

use parking_lot::RwLock;
use portico_protocol::{ContextKey, DispatchResult};
use tracing::info;

use crate::serving::ServingContext;

/// Builds the serving context for a hosting key. Supplied by the host per mount.
pub trait ContextFactory: Send + Sync {
    fn create(&self, key: &ContextKey) -> DispatchResult<ServingContext>;
}

impl<F> ContextFactory for F
where
    F: Fn(&ContextKey) -> DispatchResult<ServingContext> + Send + Sync,
{
    fn create(&self, key: &ContextKey) -> DispatchResult<ServingContext> {
        self(key)
    }
}

struct Mount {
    key: ContextKey,
    factory: Arc<dyn ContextFactory>,
}

/// Resolved route for one request.
#[derive(Clone)]
pub struct Route {
    pub key: ContextKey,
    pub factory: Arc<dyn ContextFactory>,
}

#[derive(Default)]
pub struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a factory under `key`, replacing an existing mount with the same key.
    pub fn mount(&self, key: ContextKey, factory: Arc<dyn ContextFactory>) {
        let mut mounts = self.mounts.write();
        mounts.retain(|m| m.key != key);
        info!("Mounted {key}");
        mounts.push(Mount { key, factory });
    }

    pub fn unmount(&self, key: &ContextKey) -> bool {
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|m| &m.key != key);
        mounts.len() != before
    }

    /// Longest context path containing `path` wins; at equal length a mount
    /// bound to the request's host beats a wildcard one.
    pub fn resolve(&self, host: Option<&str>, path: &str) -> Option<Route> {
        let mounts = self.mounts.read();
        mounts
            .iter()
            .filter(|m| match (&m.key.host, host) {
                (None, _) => true,
                (Some(bound), Some(host)) => bound.eq_ignore_ascii_case(host),
                (Some(_), None) => false,
            })
            .filter(|m| m.key.contains_path(path))
            .max_by_key(|m| {
                let depth = if m.key.context_path == "/" { 0 } else { m.key.context_path.len() };
                (depth, m.key.host.is_some())
            })
            .map(|m| Route {
                key: m.key.clone(),
                factory: m.factory.clone(),
            })
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        self.mounts.read().iter().map(|m| m.key.clone()).collect()
    }
}
