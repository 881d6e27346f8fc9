//! Access log interceptor: one line per request, emitted on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use portico_protocol::{CallContext, HandlerRules};
use portico_server::{Configurable, InterceptResult, Interceptor};
use tracing::info;

use crate::request_id::RequestIdValue;

pub const NAME: &str = "access-log";
const ENABLED_KEY: &str = "access-log.enabled";

#[derive(Clone, Copy)]
struct RequestStart(Instant);

pub struct AccessLogInterceptor {
    enabled: AtomicBool,
}

impl AccessLogInterceptor {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl Default for AccessLogInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for AccessLogInterceptor {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        -100
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn before(&self, ctx: &mut CallContext) -> InterceptResult<bool> {
        ctx.extensions_mut().insert(RequestStart(Instant::now()));
        Ok(false)
    }

    async fn after(&self, ctx: &mut CallContext) -> InterceptResult<()> {
        let elapsed_ms = ctx
            .extensions()
            .get::<RequestStart>()
            .map(|start| start.0.elapsed().as_millis())
            .unwrap_or_default();
        let request_id = ctx
            .extensions()
            .get::<RequestIdValue>()
            .map(|id| id.0.as_str())
            .unwrap_or("-");
        let context = ctx
            .context_key()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());

        info!(
            target: "portico::access",
            "{} {} {} {}ms context={} id={}",
            ctx.request().method,
            ctx.request().uri,
            ctx.response().status().as_u16(),
            elapsed_ms,
            context,
            request_id,
        );
        Ok(())
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for AccessLogInterceptor {
    fn configure(&self, rules: &HandlerRules) {
        let enabled = rules.get_bool(ENABLED_KEY).unwrap_or(true);
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}
