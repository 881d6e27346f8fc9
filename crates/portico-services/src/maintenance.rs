//! Maintenance mode: answers every request with 503 while switched on.

use parking_lot::RwLock;
use portico_protocol::http::{StatusCode, header};
use portico_protocol::{CallContext, HandlerRules};
use portico_server::{Configurable, InterceptResult, Interceptor};

pub const NAME: &str = "maintenance";
const ENABLED_KEY: &str = "maintenance.enabled";
const MESSAGE_KEY: &str = "maintenance.message";
const RETRY_AFTER_KEY: &str = "maintenance.retry-after";
const DEFAULT_MESSAGE: &str = "down for maintenance";

#[derive(Debug, Clone, Default)]
struct MaintenanceSettings {
    enabled: bool,
    message: Option<String>,
    retry_after_secs: Option<u64>,
}

#[derive(Default)]
pub struct MaintenanceInterceptor {
    settings: RwLock<MaintenanceSettings>,
}

impl MaintenanceInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor for MaintenanceInterceptor {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        -50
    }

    fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    async fn before(&self, ctx: &mut CallContext) -> InterceptResult<bool> {
        let settings = self.settings.read().clone();
        let response = ctx.response_mut();
        if let Some(secs) = settings.retry_after_secs {
            response.insert_header(header::RETRY_AFTER, &secs.to_string());
        }
        response.send_error(
            StatusCode::SERVICE_UNAVAILABLE,
            settings.message.as_deref().unwrap_or(DEFAULT_MESSAGE),
        );
        Ok(true)
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for MaintenanceInterceptor {
    fn configure(&self, rules: &HandlerRules) {
        *self.settings.write() = MaintenanceSettings {
            enabled: rules.get_bool(ENABLED_KEY).unwrap_or(false),
            message: rules.get(MESSAGE_KEY).map(str::to_string),
            retry_after_secs: rules.get_u64(RETRY_AFTER_KEY),
        };
    }
}
