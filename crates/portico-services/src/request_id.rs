//! Request id interceptor: propagates or mints a correlation id.

use parking_lot::RwLock;
use portico_protocol::http::HeaderName;
use portico_protocol::{CallContext, HandlerRules};
use portico_server::{Configurable, InterceptResult, Interceptor};

pub const NAME: &str = "request-id";
const HEADER_KEY: &str = "request-id.header";
const DEFAULT_HEADER: &str = "x-request-id";

/// The id assigned to the current request, readable by later interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdValue(pub String);

pub struct RequestIdInterceptor {
    header: RwLock<HeaderName>,
}

impl RequestIdInterceptor {
    pub fn new() -> Self {
        Self {
            header: RwLock::new(HeaderName::from_static(DEFAULT_HEADER)),
        }
    }
}

impl Default for RequestIdInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for RequestIdInterceptor {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        -200
    }

    async fn before(&self, ctx: &mut CallContext) -> InterceptResult<bool> {
        let header = self.header.read().clone();
        let id = ctx
            .request()
            .header(&header)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        ctx.response_mut().insert_header(header, &id);
        ctx.extensions_mut().insert(RequestIdValue(id));
        Ok(false)
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for RequestIdInterceptor {
    fn configure(&self, rules: &HandlerRules) {
        let name = rules.get_or(HEADER_KEY, DEFAULT_HEADER);
        let header = HeaderName::try_from(name.to_ascii_lowercase()).unwrap_or_else(|e| {
            tracing::warn!("Invalid {HEADER_KEY} {name:?}: {e}, using {DEFAULT_HEADER}");
            HeaderName::from_static(DEFAULT_HEADER)
        });
        *self.header.write() = header;
    }
}
