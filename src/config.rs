//! JSON configuration file: mounted contexts, session defaults and initial rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use portico_protocol::{ContextKey, DispatchError, HandlerRules};
use portico_server::{ContextFactory, ServingContext, SessionConfig};
use portico_services::{StaticFiles, authenticator_for};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PorticoConfig {
    /// Server-wide session defaults, overridden per mount.
    pub sessions: SessionConfig,
    /// Initial handler rules (flat JSON object).
    pub rules: Option<Value>,
    pub mounts: Vec<MountConfig>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    /// Virtual host; omitted for any host.
    pub host: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Directory served by the static file listener.
    pub root: PathBuf,
    /// Enables sessions for this mount when present.
    pub sessions: Option<SessionConfig>,
    pub auth: Option<AuthConfig>,
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub method: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default)]
    pub users: HashMap<String, String>,
}

fn default_path() -> String {
    "/".into()
}

fn default_owner() -> String {
    "portico".into()
}

fn default_realm() -> String {
    "portico".into()
}

impl PorticoConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn initial_rules(&self) -> anyhow::Result<Option<HandlerRules>> {
        Ok(self.rules.as_ref().map(HandlerRules::from_json).transpose()?)
    }
}

impl MountConfig {
    pub fn key(&self) -> ContextKey {
        ContextKey::new(self.host.as_deref(), &self.path, &self.owner)
    }

    /// Factory assembling this mount's serving context on demand.
    pub fn factory(&self, session_defaults: &SessionConfig) -> Arc<dyn ContextFactory> {
        let mount = self.clone();
        let sessions = self.sessions.as_ref().map(|s| s.merged_over(session_defaults));

        Arc::new(move |key: &ContextKey| {
            if !mount.root.is_dir() {
                return Err(DispatchError::construction(
                    key,
                    format!("{} is not a directory", mount.root.display()),
                ));
            }

            let listener = StaticFiles::new(mount.root.clone(), &key.context_path);
            let mut builder = ServingContext::builder(key.clone(), listener)
                .attribute("root", json!(mount.root.display().to_string()));

            if let Some(sessions) = &sessions {
                builder = builder.sessions(sessions.clone());
            }
            if let Some(auth) = &mount.auth {
                if let Some(security) = authenticator_for(&auth.method, &auth.realm, auth.users.clone()) {
                    builder = builder.security(security);
                }
            }
            Ok(builder.build())
        })
    }
}
