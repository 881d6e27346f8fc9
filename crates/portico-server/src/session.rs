//! Per-context HTTP sessions keyed by a cookie.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use portico_protocol::http::header;
use portico_protocol::{ContextKey, DispatchRequest, DispatchResponse};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default session cookie name.
pub const DEFAULT_COOKIE: &str = "PORTICOSESSION";

/// Longest gap between idle sweeps while new sessions are being issued.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Session settings. Unset fields fall back to server-wide defaults via
/// [`SessionConfig::merged_over`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Idle timeout in minutes.
    pub timeout_minutes: Option<u64>,
    /// Cookie name; `"none"` disables cookie tracking.
    pub cookie: Option<String>,
    pub domain: Option<String>,
    /// Cookie path; defaults to the context path.
    pub path: Option<String>,
    pub http_only: Option<bool>,
    /// Suffix appended to session ids to help load-balancer affinity.
    pub worker_name: Option<String>,
}

impl SessionConfig {
    /// Field-wise: own value if set, else the default's.
    pub fn merged_over(&self, defaults: &SessionConfig) -> SessionConfig {
        SessionConfig {
            timeout_minutes: self.timeout_minutes.or(defaults.timeout_minutes),
            cookie: self.cookie.clone().or_else(|| defaults.cookie.clone()),
            domain: self.domain.clone().or_else(|| defaults.domain.clone()),
            path: self.path.clone().or_else(|| defaults.path.clone()),
            http_only: self.http_only.or(defaults.http_only),
            worker_name: self.worker_name.clone().or_else(|| defaults.worker_name.clone()),
        }
    }

    fn cookie_name(&self) -> Option<&str> {
        match self.cookie.as_deref() {
            Some("none") => None,
            Some(name) if !name.is_empty() => Some(name),
            _ => Some(DEFAULT_COOKIE),
        }
    }
}

struct Session {
    last_access: Instant,
}

/// Tracks sessions for one serving context.
pub struct SessionHandler {
    config: SessionConfig,
    cookie_path: String,
    sessions: DashMap<String, Session>,
    last_sweep: Mutex<Instant>,
}

impl SessionHandler {
    pub fn new(key: &ContextKey, config: SessionConfig) -> Self {
        let cookie_path = config.path.clone().unwrap_or_else(|| key.context_path.clone());
        Self {
            config,
            cookie_path,
            sessions: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn timeout(&self) -> Option<Duration> {
        self.config
            .timeout_minutes
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Resume the request's session or start a new one, setting the cookie on
    /// the response when a new id is issued. Returns the session id, or `None`
    /// when cookie tracking is disabled.
    pub fn attach(&self, request: &DispatchRequest, response: &mut DispatchResponse) -> Option<String> {
        let cookie_name = self.config.cookie_name()?;
        let now = Instant::now();

        if let Some(id) = find_cookie(request, cookie_name) {
            if let Some(mut session) = self.sessions.get_mut(id) {
                let expired = self
                    .timeout()
                    .is_some_and(|t| now.duration_since(session.last_access) > t);
                if !expired {
                    session.last_access = now;
                    return Some(id.to_string());
                }
            }
            if self.sessions.remove(id).is_some() {
                debug!("Session expired: {id}");
            }
        }

        self.sweep_if_due(now);
        let id = self.new_session_id();
        self.sessions.insert(id.clone(), Session { last_access: now });
        response.append_header(header::SET_COOKIE, &self.set_cookie_value(cookie_name, &id));
        Some(id)
    }

    /// Drop sessions idle for longer than the timeout.
    pub fn expire_idle(&self) -> usize {
        let Some(timeout) = self.timeout() else {
            return 0;
        };
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.duration_since(s.last_access) <= timeout);
        before - self.sessions.len()
    }

    /// Runs [`expire_idle`](Self::expire_idle) at most once per sweep
    /// interval. Concurrent callers skip rather than wait.
    fn sweep_if_due(&self, now: Instant) {
        let Some(timeout) = self.timeout() else {
            return;
        };
        let Some(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last_sweep) < timeout.min(MAX_SWEEP_INTERVAL) {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);
        let expired = self.expire_idle();
        if expired > 0 {
            debug!("Expired {expired} idle sessions");
        }
    }

    /// Invalidate every session.
    pub fn stop(&self) {
        self.sessions.clear();
    }

    fn new_session_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        match &self.config.worker_name {
            Some(worker) => format!("{id}.{worker}"),
            None => id,
        }
    }

    fn set_cookie_value(&self, name: &str, id: &str) -> String {
        let mut value = format!("{name}={id}; Path={}", self.cookie_path);
        if let Some(domain) = &self.config.domain {
            value.push_str("; Domain=");
            value.push_str(domain);
        }
        if self.config.http_only.unwrap_or(true) {
            value.push_str("; HttpOnly");
        }
        value
    }
}

fn find_cookie<'a>(request: &'a DispatchRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}
