//! ServingContext: the shared resources of one hosted application.
//!
//! A serving context owns the listener (the underlying request dispatcher),
//! an optional security handler, an optional session handler and an error
//! handler. It is shared by every request routed to its [`ContextKey`] and
//! is torn down exactly once, when the registry drops its last reference.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use portico_protocol::http::StatusCode;
use portico_protocol::{
    ContextKey, DispatchError, DispatchRequest, DispatchResponse, DispatchResult,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::session::{SessionConfig, SessionHandler};

/// The underlying request dispatcher a serving context forwards to.
pub trait RequestDispatcher: Send + Sync {
    /// Produce the response for a request nobody claimed.
    fn dispatch(
        &self,
        request: &DispatchRequest,
        response: &mut DispatchResponse,
    ) -> impl Future<Output = DispatchResult> + Send;

    /// Release listener resources (called once at teardown).
    ///
    /// Teardown can run on an async worker when the last request lease
    /// drops, so this must not block. Hand slow cleanup to
    /// `tokio::task::spawn_blocking` or a background task.
    fn stop(&self) -> DispatchResult {
        Ok(())
    }
}

/// Object-safe wrapper for the RequestDispatcher trait.
pub trait DispatcherDyn: Send + Sync {
    fn dispatch_dyn<'a>(
        &'a self,
        request: &'a DispatchRequest,
        response: &'a mut DispatchResponse,
    ) -> Pin<Box<dyn Future<Output = DispatchResult> + Send + 'a>>;
    fn stop_dyn(&self) -> DispatchResult;
}

impl<T: RequestDispatcher> DispatcherDyn for T {
    fn dispatch_dyn<'a>(
        &'a self,
        request: &'a DispatchRequest,
        response: &'a mut DispatchResponse,
    ) -> Pin<Box<dyn Future<Output = DispatchResult> + Send + 'a>> {
        Box::pin(self.dispatch(request, response))
    }

    fn stop_dyn(&self) -> DispatchResult {
        self.stop()
    }
}

/// Security gate in front of the listener.
pub trait SecurityHandler: Send + Sync {
    /// Returns `false` to deny. A denying handler may set a status and
    /// headers; if it leaves the response uncommitted the context sends the
    /// error page itself (401 when no status was set).
    fn handle_security(&self, request: &DispatchRequest, response: &mut DispatchResponse) -> bool;

    fn stop(&self) -> DispatchResult {
        Ok(())
    }
}

/// Renders error pages for a serving context.
pub trait ErrorHandler: Send + Sync {
    fn render(&self, status: StatusCode, message: &str, response: &mut DispatchResponse);

    fn stop(&self) -> DispatchResult {
        Ok(())
    }
}

/// Plain-text error pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainErrorHandler;

impl ErrorHandler for PlainErrorHandler {
    fn render(&self, status: StatusCode, message: &str, response: &mut DispatchResponse) {
        response.send_error(status, message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextState {
    Active,
    Destroying,
    Destroyed,
}

/// One hosted application.
pub struct ServingContext {
    key: ContextKey,
    listener: Arc<dyn DispatcherDyn>,
    security: Option<Arc<dyn SecurityHandler>>,
    sessions: Option<SessionHandler>,
    errors: Arc<dyn ErrorHandler>,
    attributes: HashMap<String, Value>,
    state: Mutex<ContextState>,
}

impl ServingContext {
    pub fn builder<D: RequestDispatcher + 'static>(key: ContextKey, listener: D) -> ServingContextBuilder {
        ServingContextBuilder {
            key,
            listener: Arc::new(listener),
            security: None,
            sessions: None,
            errors: Arc::new(PlainErrorHandler),
            attributes: HashMap::new(),
        }
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn sessions(&self) -> Option<&SessionHandler> {
        self.sessions.as_ref()
    }

    /// Serve a request routed to this context.
    pub async fn serve(
        &self,
        request: &DispatchRequest,
        response: &mut DispatchResponse,
    ) -> DispatchResult {
        if !self.is_active() {
            return Err(DispatchError::ContextDestroyed(self.key.to_string()));
        }

        if let Some(sessions) = &self.sessions {
            sessions.attach(request, response);
        }

        let allowed = self
            .security
            .as_ref()
            .is_none_or(|security| security.handle_security(request, response));

        if !allowed {
            // A denied request never falls through with a 200
            if !response.is_committed() {
                let status = if response.is_status_set() {
                    response.status()
                } else {
                    StatusCode::UNAUTHORIZED
                };
                self.errors.render(status, "", response);
            }
            debug!("Request denied by security handler of {}", self.key);
            return Ok(());
        }

        if let Err(e) = self.listener.dispatch_dyn(request, response).await {
            if response.is_committed() {
                warn!("Listener of {} failed after committing the response: {e}", self.key);
            } else {
                self.errors.render(e.status_code(), &e.to_string(), response);
            }
        }
        Ok(())
    }

    /// Tear down sub-resources. Runs at most once; failures are logged.
    /// Runs synchronously on the caller's thread.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state != ContextState::Active {
                return;
            }
            *state = ContextState::Destroying;
        }

        info!("Destroying serving context {}", self.key);

        if let Err(e) = self.listener.stop_dyn() {
            warn!("Listener of {} failed to stop: {e}", self.key);
        }
        if let Some(security) = &self.security {
            if let Err(e) = security.stop() {
                warn!("Security handler of {} failed to stop: {e}", self.key);
            }
        }
        if let Some(sessions) = &self.sessions {
            sessions.stop();
        }
        if let Err(e) = self.errors.stop() {
            warn!("Error handler of {} failed to stop: {e}", self.key);
        }

        *self.state.lock() = ContextState::Destroyed;
    }
}

pub struct ServingContextBuilder {
    key: ContextKey,
    listener: Arc<dyn DispatcherDyn>,
    security: Option<Arc<dyn SecurityHandler>>,
    sessions: Option<SessionConfig>,
    errors: Arc<dyn ErrorHandler>,
    attributes: HashMap<String, Value>,
}

impl ServingContextBuilder {
    pub fn security<S: SecurityHandler + 'static>(mut self, security: S) -> Self {
        self.security = Some(Arc::new(security));
        self
    }

    pub fn sessions(mut self, config: SessionConfig) -> Self {
        self.sessions = Some(config);
        self
    }

    pub fn error_handler<E: ErrorHandler + 'static>(mut self, errors: E) -> Self {
        self.errors = Arc::new(errors);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn build(self) -> ServingContext {
        let sessions = self.sessions.map(|config| SessionHandler::new(&self.key, config));
        ServingContext {
            key: self.key,
            listener: self.listener,
            security: self.security,
            sessions,
            errors: self.errors,
            attributes: self.attributes,
            state: Mutex::new(ContextState::Active),
        }
    }
}
