//! Call context: per-request state threaded through the interceptor chain.
//!
//! A [`CallContext`] is created by the pipeline for every inbound request and
//! consumed once the after-phase has finished. It records how far the
//! before-phase got ([`ChainPosition`]) so the after-phase can unwind exactly
//! the interceptors that were reached.

use std::fmt;

use http::Extensions;
use serde::{Deserialize, Serialize};

use crate::message::{DispatchRequest, DispatchResponse};

/// Identity of one hosted application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    /// Virtual host; `None` matches any host.
    pub host: Option<String>,
    /// Context path, normalized to start with `/` and carry no trailing `/`
    /// (the root context is `/`).
    pub context_path: String,
    /// Owner of the application (the deploying component).
    pub owner: String,
}

impl ContextKey {
    pub fn new(host: Option<&str>, context_path: &str, owner: &str) -> Self {
        Self {
            host: host.map(|h| h.to_ascii_lowercase()),
            context_path: normalize_context_path(context_path),
            owner: owner.to_string(),
        }
    }

    /// Whether `path` lies inside this context's path.
    pub fn contains_path(&self, path: &str) -> bool {
        if self.context_path == "/" {
            return true;
        }
        match path.strip_prefix(self.context_path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.as_deref().unwrap_or("*");
        if self.context_path == "/" {
            write!(f, "{}@{}/", self.owner, host)
        } else {
            write!(f, "{}@{}{}", self.owner, host, self.context_path)
        }
    }
}

fn normalize_context_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// How far the before-phase got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainPosition {
    /// No interceptor has been reached yet.
    #[default]
    NotStarted,
    /// The interceptor at this snapshot index was the last one reached.
    StoppedAt(usize),
    /// The chain was exhausted and the request was dispatched.
    Completed,
}

impl ChainPosition {
    /// First index the after-phase visits for a snapshot of `len` entries.
    pub fn unwind_start(self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self {
            Self::NotStarted => None,
            Self::StoppedAt(i) => Some(i.min(len - 1)),
            Self::Completed => Some(len - 1),
        }
    }
}

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    BeforePhase,
    Dispatching,
    AfterPhase,
    Done,
}

/// Per-request mutable record. Never shared across requests.
#[derive(Debug)]
pub struct CallContext {
    target: String,
    request: DispatchRequest,
    response: DispatchResponse,
    position: ChainPosition,
    phase: Phase,
    context_key: Option<ContextKey>,
    extensions: Extensions,
}

impl CallContext {
    pub fn new(request: DispatchRequest) -> Self {
        Self {
            target: request.path().to_string(),
            request,
            response: DispatchResponse::new(),
            position: ChainPosition::NotStarted,
            phase: Phase::BeforePhase,
            context_key: None,
            extensions: Extensions::new(),
        }
    }

    /// Target path of the request.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn request(&self) -> &DispatchRequest {
        &self.request
    }

    pub fn response(&self) -> &DispatchResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut DispatchResponse {
        &mut self.response
    }

    /// Borrow the request and the response at the same time.
    pub fn exchange_mut(&mut self) -> (&DispatchRequest, &mut DispatchResponse) {
        (&self.request, &mut self.response)
    }

    pub fn position(&self) -> ChainPosition {
        self.position
    }

    pub fn set_position(&mut self, position: ChainPosition) {
        self.position = position;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Serving context the request was routed to, once dispatching started.
    pub fn context_key(&self) -> Option<&ContextKey> {
        self.context_key.as_ref()
    }

    pub fn set_context_key(&mut self, key: ContextKey) {
        self.context_key = Some(key);
    }

    /// Typed per-request storage for interceptors.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Finish the request. Consuming the context forbids further mutation.
    pub fn into_response(mut self) -> DispatchResponse {
        self.phase = Phase::Done;
        self.response
    }
}
