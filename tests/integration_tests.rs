//! End-to-end tests: a real server on an OS-assigned port, driven over HTTP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use portico_protocol::{ContextKey, HandlerRules};
use portico_server::{DispatchPipeline, HandlerRegistry, RulesWatcher, ServingContext};
use portico_services::{StaticFiles, builtin_catalog};
use portico_transport::{TransportConfig, TransportServer};
use serde_json::{Value, json};
use tempfile::TempDir;

struct TestServer {
    base: String,
    pipeline: Arc<DispatchPipeline>,
    transport: TransportServer,
    _site: TempDir,
}

impl TestServer {
    async fn start(rules: HandlerRules) -> Self {
        let site = TempDir::new().unwrap();
        std::fs::write(site.path().join("hello.txt"), "hello over http").unwrap();

        let handlers = Arc::new(HandlerRegistry::new(builtin_catalog()));
        handlers.update_rules(rules);
        let pipeline = Arc::new(DispatchPipeline::new(handlers));

        let root = site.path().to_path_buf();
        pipeline
            .deploy(
                ContextKey::new(None, "/site", "it"),
                Arc::new(move |key: &ContextKey| {
                    let files = StaticFiles::new(root.clone(), &key.context_path);
                    Ok(ServingContext::builder(key.clone(), files).build())
                }),
            )
            .unwrap();

        let config = TransportConfig {
            port: 0,
            enable_admin: true,
            ..TransportConfig::default()
        };
        let transport = TransportServer::start(config, pipeline.clone()).await.unwrap();
        let base = format!("http://127.0.0.1:{}", transport.port());

        Self {
            base,
            pipeline,
            transport,
            _site: site,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn stop(mut self) {
        self.transport.stop().await;
        self.pipeline.shutdown();
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch over HTTP
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn serves_mounted_file_through_chain() {
    let server = TestServer::start(HandlerRules::new().with("load", "request-id,access-log")).await;

    let response = client().get(server.url("/site/hello.txt")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "hello over http");

    server.stop().await;
}

#[tokio::test]
async fn unmounted_path_is_json_404() {
    let server = TestServer::start(HandlerRules::new()).await;

    let response = client().get(server.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("no serving context"));

    server.stop().await;
}

#[tokio::test]
async fn trace_is_405() {
    let server = TestServer::start(HandlerRules::new()).await;

    let response = client()
        .request(reqwest::Method::TRACE, server.url("/site/hello.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    server.stop().await;
}

#[tokio::test]
async fn token_auth_guards_contexts_but_not_health() {
    let rules = HandlerRules::new()
        .with("load", "token-auth")
        .with("token-auth.token", "it-token");
    let server = TestServer::start(rules).await;
    let client = client();

    let denied = client.get(server.url("/site/hello.txt")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .get(server.url("/site/hello.txt"))
        .bearer_auth("it-token")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let health = client.get(server.url("/_portico/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    server.stop().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_rules_swap_changes_behavior() {
    let server = TestServer::start(HandlerRules::new()).await;
    let client = client();

    let chain: Value = client
        .put(server.url("/_portico/rules"))
        .json(&json!({ "load": ["maintenance"], "maintenance.enabled": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chain["chain"][0]["name"], "maintenance");

    let response = client.get(server.url("/site/hello.txt")).send().await.unwrap();
    assert_eq!(response.status(), 503);

    let rules: Value = client
        .get(server.url("/_portico/rules"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rules["maintenance.enabled"], "true");

    let rejected = client
        .put(server.url("/_portico/rules"))
        .json(&json!({ "nested": { "no": 1 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn admin_contexts_lists_mounts() {
    let server = TestServer::start(HandlerRules::new()).await;

    let contexts: Value = client()
        .get(server.url("/_portico/contexts"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(contexts["mounts"][0], "it@*/site");
    assert_eq!(contexts["contexts"][0]["state"], "active");

    server.stop().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules file
// ─────────────────────────────────────────────────────────────────────────────

fn write_rules(path: &Path, rules: Value) {
    std::fs::write(path, serde_json::to_vec(&rules).unwrap()).unwrap();
}

#[tokio::test]
async fn rules_file_changes_rebuild_chain() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rules.json");
    write_rules(&path, json!({ "load": "request-id" }));

    let handlers = Arc::new(HandlerRegistry::new(builtin_catalog()));
    let watcher = RulesWatcher::start(&path, handlers.clone()).unwrap();
    assert_eq!(handlers.current_snapshot().names(), ["request-id"]);

    write_rules(&path, json!({ "load": "request-id,maintenance" }));

    let mut reloaded = false;
    for _ in 0..100 {
        if handlers.current_snapshot().len() == 2 {
            reloaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reloaded, "rules file change was not picked up");

    // An invalid edit keeps the previous rules
    std::fs::write(&path, "{ not json").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handlers.current_snapshot().len(), 2);

    watcher.stop();
}
