//! Rules file watcher: reloads handler rules when the JSON file changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use portico_protocol::{DispatchError, DispatchResult, HandlerRules};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::HandlerRegistry;

/// Read a flat JSON rules object from disk.
pub fn load_rules_file(path: &Path) -> DispatchResult<HandlerRules> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| DispatchError::InvalidRules(format!("{}: {e}", path.display())))?;
    HandlerRules::from_json(&value)
}

/// Keeps the handler registry in sync with a rules file.
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by renaming a temp file over the original are picked up too.
/// A file that fails to parse is logged and the previous rules stay live.
pub struct RulesWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl RulesWatcher {
    /// Apply the file once, then follow it. Must be called inside a Tokio runtime.
    pub fn start(path: impl Into<PathBuf>, handlers: Arc<HandlerRegistry>) -> DispatchResult<Self> {
        let path: PathBuf = path.into();
        handlers.update_rules(load_rules_file(&path)?);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => warn!("Rules watcher error: {e}"),
            }
        })
        .map_err(std::io::Error::other)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(std::io::Error::other)?;

        let file_name = path.file_name().map(ToOwned::to_owned);
        let watched = path.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                let touches_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                if !touches_file {
                    continue;
                }

                match load_rules_file(&watched) {
                    Ok(rules) if handlers.rules().as_ref() == Some(&rules) => {
                        debug!("Rules file {} touched without changes", watched.display());
                    }
                    Ok(rules) => {
                        info!("Rules file {} changed, rebuilding chain", watched.display());
                        handlers.update_rules(rules);
                    }
                    Err(e) => warn!("Keeping previous rules, {} is invalid: {e}", watched.display()),
                }
            }
        });

        info!("Watching rules file {}", path.display());
        Ok(Self {
            path,
            _watcher: watcher,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(self) {
        self.task.abort();
        info!("Stopped watching rules file {}", self.path.display());
    }
}

impl Drop for RulesWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
