//! Dispatch pipeline: runs every request through the interceptor chain.
//!
//! Per request: the before-phase walks the captured snapshot in ascending
//! order until an interceptor claims the request; unclaimed requests are
//! routed to their serving context; the after-phase then walks back down from
//! the last index reached. Interceptor faults (errors or panics) are isolated
//! and logged; they never abort the request.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use portico_protocol::http::Method;
use portico_protocol::{
    CallContext, ChainPosition, ContextKey, DispatchError, DispatchRequest, DispatchResponse,
    DispatchResult, HandlerRules, Phase,
};
use portico_transport::RequestHandler;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::chain::{HandlerRegistry, InterceptorSnapshot};
use crate::interceptor::InterceptFuture;
use crate::mount::{ContextFactory, MountTable};
use crate::registry::ContextRegistry;
use crate::serving::ServingContext;

/// The central request-dispatch pipeline.
pub struct DispatchPipeline {
    handlers: Arc<HandlerRegistry>,
    contexts: Arc<ContextRegistry>,
    mounts: MountTable,
}

impl DispatchPipeline {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            contexts: Arc::new(ContextRegistry::new()),
            mounts: MountTable::new(),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Mount a hosted application and hold a reference on its serving
    /// context for as long as it stays deployed. Redeploying a key replaces
    /// the previous deployment: requests in flight finish on the old context
    /// and new ones are served by the new factory's.
    pub fn deploy(
        &self,
        key: ContextKey,
        factory: Arc<dyn ContextFactory>,
    ) -> DispatchResult<Arc<ServingContext>> {
        if self.mounts.unmount(&key) {
            self.contexts.retire(&key);
        }
        self.mounts.mount(key.clone(), factory.clone());
        match self.contexts.acquire(&key, |k| factory.create(k)) {
            Ok(context) => {
                info!("Deployed {key}");
                Ok(context)
            }
            Err(e) => {
                self.mounts.unmount(&key);
                Err(e)
            }
        }
    }

    /// Unmount a hosted application and drop the deployment's reference.
    /// In-flight requests keep the context alive until they finish.
    pub fn undeploy(&self, key: &ContextKey) -> bool {
        if !self.mounts.unmount(key) {
            return false;
        }
        self.contexts.release(key);
        info!("Undeployed {key}");
        true
    }

    /// Run one request through before-phase, dispatch and after-phase.
    pub async fn handle(&self, request: DispatchRequest) -> DispatchResult<DispatchResponse> {
        let snapshot = self.handlers.current_snapshot();
        let mut ctx = CallContext::new(request);

        let claimed = run_before(&snapshot, &mut ctx).await;

        let outcome = if claimed {
            Ok(())
        } else {
            ctx.set_position(ChainPosition::Completed);
            self.dispatch(&mut ctx).await
        };

        ctx.set_phase(Phase::AfterPhase);
        run_after(&snapshot, &mut ctx).await;

        outcome.map(|()| ctx.into_response())
    }

    /// Tear down every serving context.
    pub fn shutdown(&self) {
        for key in self.mounts.keys() {
            self.mounts.unmount(&key);
        }
        self.contexts.shutdown_all();
    }

    async fn dispatch(&self, ctx: &mut CallContext) -> DispatchResult {
        ctx.set_phase(Phase::Dispatching);

        if ctx.request().method == Method::TRACE {
            return Err(DispatchError::TraceDisabled);
        }

        let host = ctx.request().host();
        let route = self.mounts.resolve(host, ctx.target()).ok_or_else(|| {
            DispatchError::NoContext(format!("{}{}", host.unwrap_or("*"), ctx.target()))
        })?;

        let lease = self.contexts.lease(&route.key, |key| route.factory.create(key))?;
        ctx.set_context_key(route.key);

        let (request, response) = ctx.exchange_mut();
        lease.serve(request, response).await
    }
}

async fn run_before(snapshot: &InterceptorSnapshot, ctx: &mut CallContext) -> bool {
    ctx.set_phase(Phase::BeforePhase);

    for (index, interceptor) in snapshot.iter().enumerate() {
        // Recorded first so a failing call is still unwound
        ctx.set_position(ChainPosition::StoppedAt(index));
        if !interceptor.is_enabled_dyn() {
            continue;
        }

        match isolate(interceptor.before_dyn(ctx)).await {
            Ok(true) => {
                debug!("{} claimed by {}", ctx.target(), interceptor.name_dyn());
                return true;
            }
            Ok(false) => {}
            Err(reason) => {
                let fault = DispatchError::interceptor(interceptor.name_dyn(), reason);
                warn!("Before-phase of {}: {fault}", ctx.target());
            }
        }
    }
    false
}

async fn run_after(snapshot: &InterceptorSnapshot, ctx: &mut CallContext) {
    let Some(start) = ctx.position().unwind_start(snapshot.len()) else {
        return;
    };

    for index in (0..=start).rev() {
        let Some(interceptor) = snapshot.get(index) else {
            continue;
        };
        if !interceptor.is_enabled_dyn() {
            continue;
        }

        if let Err(reason) = isolate(interceptor.after_dyn(ctx)).await {
            let fault = DispatchError::interceptor(interceptor.name_dyn(), reason);
            warn!("After-phase of {}: {fault}", ctx.target());
        }
    }
}

/// Await an interceptor call, turning errors and panics into a reason string.
async fn isolate<T>(call: InterceptFuture<'_, T>) -> Result<T, String> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl RequestHandler for DispatchPipeline {
    async fn handle_request(&self, request: DispatchRequest) -> DispatchResult<DispatchResponse> {
        self.handle(request).await
    }

    fn interceptors(&self) -> Value {
        let snapshot = self.handlers.current_snapshot();
        json!({
            "generation": snapshot.generation(),
            "chain": snapshot.describe(),
            "catalog": self.handlers.catalog().names(),
        })
    }

    fn contexts(&self) -> Value {
        let mounts: Vec<String> = self.mounts.keys().iter().map(ToString::to_string).collect();
        json!({
            "mounts": mounts,
            "contexts": self.contexts.describe(),
        })
    }

    fn rules(&self) -> Option<HandlerRules> {
        self.handlers.rules()
    }

    fn replace_rules(&self, rules: HandlerRules) -> DispatchResult<Value> {
        self.handlers.update_rules(rules);
        Ok(self.interceptors())
    }
}
