//! Security handlers for hosted contexts.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use portico_protocol::http::{StatusCode, header};
use portico_protocol::{DispatchRequest, DispatchResponse};
use portico_server::SecurityHandler;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::token_auth::constant_time_eq;

/// HTTP Basic authentication against a fixed user table.
pub struct BasicAuth {
    realm: String,
    users: HashMap<String, SecretString>,
}

impl BasicAuth {
    pub fn new<I>(realm: impl Into<String>, users: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            realm: realm.into(),
            users: users
                .into_iter()
                .map(|(user, password)| (user, SecretString::from(password)))
                .collect(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn authenticate(&self, request: &DispatchRequest) -> Option<String> {
        let encoded = request.header(header::AUTHORIZATION)?.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (user, password) = credentials.split_once(':')?;
        let expected = self.users.get(user)?;
        constant_time_eq(expected.expose_secret(), password).then(|| user.to_string())
    }
}

impl SecurityHandler for BasicAuth {
    fn handle_security(&self, request: &DispatchRequest, response: &mut DispatchResponse) -> bool {
        if let Some(user) = self.authenticate(request) {
            debug!("Authenticated {user} for realm {}", self.realm);
            return true;
        }
        response.insert_header(
            header::WWW_AUTHENTICATE,
            &format!("Basic realm=\"{}\"", self.realm),
        );
        response.set_status(StatusCode::UNAUTHORIZED);
        false
    }
}

/// Authenticator for a configured auth method. Only `BASIC` is built in;
/// anything else is logged and the context runs without one.
pub fn authenticator_for(
    method: &str,
    realm: &str,
    users: HashMap<String, String>,
) -> Option<BasicAuth> {
    if method.eq_ignore_ascii_case("BASIC") {
        Some(BasicAuth::new(realm, users))
    } else {
        warn!("Unknown auth method {method:?}, context runs without an authenticator");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_protocol::http::{Method, Uri};

    fn auth() -> BasicAuth {
        BasicAuth::new("docs", [("alice".to_string(), "s3cret".to_string())])
    }

    fn request_with(credentials: &str) -> DispatchRequest {
        let value = format!("Basic {}", STANDARD.encode(credentials));
        DispatchRequest::new(Method::GET, Uri::from_static("/"))
            .with_header(header::AUTHORIZATION, &value)
    }

    #[test]
    fn accepts_known_user() {
        let mut response = DispatchResponse::new();
        assert!(auth().handle_security(&request_with("alice:s3cret"), &mut response));
        assert!(!response.is_status_set());
    }

    #[test]
    fn rejects_wrong_password_with_challenge() {
        let mut response = DispatchResponse::new();
        assert!(!auth().handle_security(&request_with("alice:nope"), &mut response));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"docs\""
        );
        assert!(!response.is_committed());
    }

    #[test]
    fn rejects_missing_header() {
        let mut response = DispatchResponse::new();
        let request = DispatchRequest::new(Method::GET, Uri::from_static("/"));
        assert!(!auth().handle_security(&request, &mut response));
    }

    #[test]
    fn rejects_password_prefix() {
        let mut response = DispatchResponse::new();
        assert!(!auth().handle_security(&request_with("alice:s3cr"), &mut response));
        assert!(!auth().handle_security(&request_with("alice:s3cret!"), &mut response));
    }

    #[test]
    fn only_basic_is_known() {
        assert!(authenticator_for("basic", "r", HashMap::new()).is_some());
        assert!(authenticator_for("DIGEST", "r", HashMap::new()).is_none());
    }
}
