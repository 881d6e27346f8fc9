//! Bearer token gate in front of every hosted context.
//!
//! Active only while `token-auth.token` is set. Requests without the token
//! are claimed and answered with 401, so neither later interceptors nor the
//! serving context see them. Paths under a `token-auth.exempt` prefix pass.

use parking_lot::RwLock;
use portico_protocol::http::{StatusCode, header};
use portico_protocol::{CallContext, HandlerRules};
use portico_server::{Configurable, InterceptResult, Interceptor};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::debug;

pub const NAME: &str = "token-auth";
const TOKEN_KEY: &str = "token-auth.token";
const EXEMPT_KEY: &str = "token-auth.exempt";

#[derive(Default)]
struct TokenSettings {
    token: Option<SecretString>,
    exempt: Vec<String>,
}

#[derive(Default)]
pub struct TokenAuthInterceptor {
    preset: Option<SecretString>,
    settings: RwLock<TokenSettings>,
}

impl TokenAuthInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a fixed token, before any rules are applied.
    pub fn with_token(token: impl Into<String>) -> Self {
        let token: String = token.into();
        Self {
            preset: Some(SecretString::from(token.clone())),
            settings: RwLock::new(TokenSettings {
                token: Some(SecretString::from(token)),
                exempt: Vec::new(),
            }),
        }
    }

    fn check(&self, ctx: &CallContext) -> bool {
        let settings = self.settings.read();
        let Some(token) = &settings.token else {
            return true;
        };
        let path = ctx.target();
        if settings.exempt.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return true;
        }
        ctx.request()
            .header(header::AUTHORIZATION)
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| constant_time_eq(presented.trim(), token.expose_secret()))
    }
}

impl Interceptor for TokenAuthInterceptor {
    fn name(&self) -> &str {
        NAME
    }

    fn is_enabled(&self) -> bool {
        self.settings.read().token.is_some()
    }

    async fn before(&self, ctx: &mut CallContext) -> InterceptResult<bool> {
        if self.check(ctx) {
            return Ok(false);
        }
        debug!("Rejected unauthenticated request for {}", ctx.target());
        let response = ctx.response_mut();
        response.insert_header(header::WWW_AUTHENTICATE, "Bearer realm=\"portico\"");
        response.send_error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
        Ok(true)
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for TokenAuthInterceptor {
    fn configure(&self, rules: &HandlerRules) {
        let token = rules
            .get(TOKEN_KEY)
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.to_string()));
        let mut settings = self.settings.write();
        // A rules token wins; without one only the preset survives
        settings.token = token.or_else(|| {
            self.preset
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string()))
        });
        settings.exempt = rules.get_list(EXEMPT_KEY);
    }
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
