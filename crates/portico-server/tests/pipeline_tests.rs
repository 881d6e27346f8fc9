//! Dispatch pipeline: before/after traversal, fault isolation and routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use portico_protocol::http::{Method, StatusCode, Uri, header};
use portico_protocol::{
    CallContext, ContextKey, DispatchError, DispatchRequest, DispatchResponse, DispatchResult,
};
use portico_server::{
    DispatchPipeline, HandlerRegistry, InterceptResult, Interceptor, InterceptorCatalog,
    RequestDispatcher, ServingContext, SessionConfig, shared,
};
use portico_transport::RequestHandler;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Copy)]
enum Mode {
    Pass,
    Claim,
    Fail,
    Panic,
    /// Claims with 401 unless an Authorization header is present.
    AuthGate,
}

struct Stage {
    name: &'static str,
    priority: i32,
    mode: Mode,
    enabled: bool,
    fail_after: bool,
    log: Log,
}

impl Stage {
    fn new(log: &Log, name: &'static str, priority: i32, mode: Mode) -> Self {
        Self {
            name,
            priority,
            mode,
            enabled: true,
            fail_after: false,
            log: log.clone(),
        }
    }
}

impl Interceptor for Stage {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn before(&self, ctx: &mut CallContext) -> InterceptResult<bool> {
        self.log.lock().push(format!("{}:before", self.name));
        match self.mode {
            Mode::Pass => Ok(false),
            Mode::Claim => {
                ctx.response_mut().send(StatusCode::OK, "text/plain", self.name);
                Ok(true)
            }
            Mode::Fail => Err("boom".into()),
            Mode::Panic => panic!("stage {} exploded", self.name),
            Mode::AuthGate => {
                if ctx.request().header(header::AUTHORIZATION).is_some() {
                    Ok(false)
                } else {
                    ctx.response_mut().send_error(StatusCode::UNAUTHORIZED, "");
                    Ok(true)
                }
            }
        }
    }

    async fn after(&self, _ctx: &mut CallContext) -> InterceptResult<()> {
        self.log.lock().push(format!("{}:after", self.name));
        if self.fail_after {
            return Err("after boom".into());
        }
        Ok(())
    }
}

struct Listener {
    tag: &'static str,
    log: Log,
}

impl RequestDispatcher for Listener {
    async fn dispatch(&self, _request: &DispatchRequest, response: &mut DispatchResponse) -> DispatchResult {
        self.log.lock().push("dispatch".to_string());
        response.send(StatusCode::OK, "text/plain", self.tag);
        Ok(())
    }
}

struct Teapot;

impl RequestDispatcher for Teapot {
    async fn dispatch(&self, _request: &DispatchRequest, _response: &mut DispatchResponse) -> DispatchResult {
        Err(DispatchError::status(StatusCode::IM_A_TEAPOT, "short and stout"))
    }
}

fn root_key() -> ContextKey {
    ContextKey::new(None, "/", "test")
}

fn deploy_listener(pipeline: &DispatchPipeline, key: ContextKey, tag: &'static str, log: &Log) {
    let log = log.clone();
    pipeline
        .deploy(
            key,
            Arc::new(move |key: &ContextKey| {
                Ok(ServingContext::builder(key.clone(), Listener { tag, log: log.clone() }).build())
            }),
        )
        .unwrap();
}

fn pipeline_with(log: &Log, stages: Vec<Stage>) -> DispatchPipeline {
    let handlers = Arc::new(HandlerRegistry::new(InterceptorCatalog::new()));
    for stage in stages {
        handlers.on_available(shared(stage));
    }
    let pipeline = DispatchPipeline::new(handlers);
    deploy_listener(&pipeline, root_key(), "dispatched", log);
    pipeline
}

fn get() -> DispatchRequest {
    DispatchRequest::new(Method::GET, Uri::from_static("/index"))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

// ─────────────────────────────────────────────────────────────────────────────
// Traversal
// ─────────────────────────────────────────────────────────────────────────────

mod traversal {
    use super::*;

    #[tokio::test]
    async fn auth_claims_unauthenticated_request() {
        let log = Log::default();
        let p = pipeline_with(
            &log,
            vec![
                Stage::new(&log, "logging", 2, Mode::Pass),
                Stage::new(&log, "auth", 1, Mode::AuthGate),
            ],
        );

        let response = p.handle(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(entries(&log), ["auth:before", "auth:after"]);
    }

    #[tokio::test]
    async fn authenticated_request_runs_full_chain() {
        let log = Log::default();
        let p = pipeline_with(
            &log,
            vec![
                Stage::new(&log, "auth", 1, Mode::AuthGate),
                Stage::new(&log, "logging", 2, Mode::Pass),
            ],
        );

        let request = get().with_header(header::AUTHORIZATION, "Basic Zm9vOmJhcg==");
        let response = p.handle(request).await.unwrap();
        assert_eq!(&response.body()[..], b"dispatched");
        assert_eq!(
            entries(&log),
            ["auth:before", "logging:before", "dispatch", "logging:after", "auth:after"]
        );
    }

    #[tokio::test]
    async fn claim_skips_later_interceptors_and_dispatcher() {
        let log = Log::default();
        let p = pipeline_with(
            &log,
            vec![
                Stage::new(&log, "a", 0, Mode::Pass),
                Stage::new(&log, "b", 1, Mode::Claim),
                Stage::new(&log, "c", 2, Mode::Pass),
            ],
        );

        let response = p.handle(get()).await.unwrap();
        assert_eq!(&response.body()[..], b"b");
        assert_eq!(entries(&log), ["a:before", "b:before", "b:after", "a:after"]);
    }

    #[tokio::test]
    async fn after_phase_runs_in_strictly_descending_order() {
        const NAMES: [&str; 5] = ["p0", "p1", "p2", "p3", "p4"];
        let log = Log::default();
        let stages = NAMES
            .iter()
            .enumerate()
            .rev()
            .map(|(i, name)| Stage::new(&log, *name, i as i32, Mode::Pass))
            .collect();
        let p = pipeline_with(&log, stages);

        p.handle(get()).await.unwrap();
        let afters: Vec<String> = entries(&log)
            .into_iter()
            .filter_map(|e| e.strip_suffix(":after").map(str::to_string))
            .collect();
        assert_eq!(afters, ["p4", "p3", "p2", "p1", "p0"]);
    }

    #[tokio::test]
    async fn disabled_interceptor_is_skipped_both_ways() {
        let log = Log::default();
        let mut off = Stage::new(&log, "off", 0, Mode::Claim);
        off.enabled = false;
        let p = pipeline_with(&log, vec![off, Stage::new(&log, "on", 1, Mode::Pass)]);

        p.handle(get()).await.unwrap();
        assert_eq!(entries(&log), ["on:before", "dispatch", "on:after"]);
    }

    #[tokio::test]
    async fn rebuild_mid_request_keeps_captured_chain() {
        struct Rebuilder {
            handlers: Arc<HandlerRegistry>,
            log: Log,
            done: AtomicBool,
        }

        impl Interceptor for Rebuilder {
            fn name(&self) -> &str {
                "rebuilder"
            }

            async fn before(&self, _ctx: &mut CallContext) -> InterceptResult<bool> {
                if !self.done.swap(true, Ordering::SeqCst) {
                    self.handlers
                        .on_available(shared(Stage::new(&self.log, "late", 10, Mode::Pass)));
                }
                Ok(false)
            }
        }

        let log = Log::default();
        let handlers = Arc::new(HandlerRegistry::new(InterceptorCatalog::new()));
        handlers.on_available(shared(Rebuilder {
            handlers: handlers.clone(),
            log: log.clone(),
            done: AtomicBool::new(false),
        }));
        let p = DispatchPipeline::new(handlers);
        deploy_listener(&p, root_key(), "dispatched", &log);

        p.handle(get()).await.unwrap();
        assert_eq!(entries(&log), ["dispatch"]);

        log.lock().clear();
        p.handle(get()).await.unwrap();
        assert_eq!(entries(&log), ["late:before", "dispatch", "late:after"]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fault isolation
// ─────────────────────────────────────────────────────────────────────────────

mod faults {
    use super::*;

    #[tokio::test]
    async fn failing_before_is_skipped() {
        let log = Log::default();
        let p = pipeline_with(
            &log,
            vec![
                Stage::new(&log, "bad", 0, Mode::Fail),
                Stage::new(&log, "good", 1, Mode::Pass),
            ],
        );

        let response = p.handle(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            entries(&log),
            ["bad:before", "good:before", "dispatch", "good:after", "bad:after"]
        );
    }

    #[tokio::test]
    async fn panicking_before_is_isolated() {
        let log = Log::default();
        let p = pipeline_with(
            &log,
            vec![
                Stage::new(&log, "wild", 0, Mode::Panic),
                Stage::new(&log, "good", 1, Mode::Pass),
            ],
        );

        let response = p.handle(get()).await.unwrap();
        assert_eq!(&response.body()[..], b"dispatched");
        assert!(entries(&log).contains(&"good:before".to_string()));
    }

    #[tokio::test]
    async fn failing_after_does_not_stop_unwind() {
        let log = Log::default();
        let mut flaky = Stage::new(&log, "flaky", 1, Mode::Pass);
        flaky.fail_after = true;
        let p = pipeline_with(&log, vec![Stage::new(&log, "outer", 0, Mode::Pass), flaky]);

        p.handle(get()).await.unwrap();
        assert_eq!(
            entries(&log),
            ["outer:before", "flaky:before", "dispatch", "flaky:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn listener_error_rendered_by_context() {
        let p = DispatchPipeline::new(Arc::new(HandlerRegistry::new(InterceptorCatalog::new())));
        p.deploy(
            root_key(),
            Arc::new(|key: &ContextKey| Ok(ServingContext::builder(key.clone(), Teapot).build())),
        )
        .unwrap();

        let response = p.handle(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(&response.body()[..], b"418 I'm a teapot: short and stout\n");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch errors
// ─────────────────────────────────────────────────────────────────────────────

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn trace_is_rejected_but_chain_unwinds() {
        let log = Log::default();
        let p = pipeline_with(&log, vec![Stage::new(&log, "a", 0, Mode::Pass)]);

        let request = DispatchRequest::new(Method::TRACE, Uri::from_static("/index"));
        let err = p.handle(request).await.unwrap_err();
        assert!(matches!(err, DispatchError::TraceDisabled));
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(entries(&log), ["a:before", "a:after"]);
    }

    #[tokio::test]
    async fn unmounted_path_has_no_context() {
        let log = Log::default();
        let handlers = Arc::new(HandlerRegistry::new(InterceptorCatalog::new()));
        handlers.on_available(shared(Stage::new(&log, "a", 0, Mode::Pass)));
        let p = DispatchPipeline::new(handlers);
        deploy_listener(&p, ContextKey::new(None, "/app", "test"), "app", &log);

        let err = p.handle(get()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoContext(_)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(entries(&log), ["a:before", "a:after"]);
    }

    #[tokio::test]
    async fn host_bound_mount_beats_wildcard() {
        let log = Log::default();
        let p = DispatchPipeline::new(Arc::new(HandlerRegistry::new(InterceptorCatalog::new())));
        deploy_listener(&p, root_key(), "any", &log);
        deploy_listener(&p, ContextKey::new(Some("hostA"), "/", "test"), "a", &log);

        let to_a = get().with_header(header::HOST, "HostA:8080");
        assert_eq!(&p.handle(to_a).await.unwrap().body()[..], b"a");

        let elsewhere = get().with_header(header::HOST, "hostB");
        assert_eq!(&p.handle(elsewhere).await.unwrap().body()[..], b"any");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context lifecycle through the pipeline
// ─────────────────────────────────────────────────────────────────────────────

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn request_lease_is_released() {
        let log = Log::default();
        let p = pipeline_with(&log, Vec::new());

        p.handle(get()).await.unwrap();
        assert_eq!(p.contexts().ref_count(&root_key()), Some(1));
    }

    #[tokio::test]
    async fn undeploy_tears_down_and_unroutes() {
        let log = Log::default();
        let p = pipeline_with(&log, Vec::new());
        let context = p.contexts().get(&root_key()).unwrap();

        assert!(p.undeploy(&root_key()));
        assert!(!context.is_active());
        assert!(p.contexts().is_empty());
        assert!(matches!(p.handle(get()).await, Err(DispatchError::NoContext(_))));
        assert!(!p.undeploy(&root_key()));
    }

    #[tokio::test]
    async fn redeploy_serves_new_context_while_old_drains() {
        let log = Log::default();
        let p = pipeline_with(&log, Vec::new());
        let in_flight = p
            .contexts()
            .lease(&root_key(), |key| Err(DispatchError::construction(key, "already deployed")))
            .unwrap();
        let old = in_flight.context().clone();

        deploy_listener(&p, root_key(), "redeployed", &log);
        let response = p.handle(get()).await.unwrap();
        assert_eq!(&response.body()[..], b"redeployed");
        assert!(old.is_active());

        drop(in_flight);
        assert!(!old.is_active());
        let current = p.contexts().get(&root_key()).unwrap();
        assert!(current.is_active());
        assert!(!Arc::ptr_eq(&current, &old));
        assert_eq!(p.contexts().ref_count(&root_key()), Some(1));
    }

    #[tokio::test]
    async fn failed_deploy_leaves_nothing_mounted() {
        let p = DispatchPipeline::new(Arc::new(HandlerRegistry::new(InterceptorCatalog::new())));
        let result = p.deploy(
            root_key(),
            Arc::new(|key: &ContextKey| Err(DispatchError::construction(key, "no docroot"))),
        );
        assert!(result.is_err());
        assert!(p.mounts().keys().is_empty());
        assert!(p.contexts().is_empty());
    }

    #[tokio::test]
    async fn session_cookie_issued_once() {
        let p = DispatchPipeline::new(Arc::new(HandlerRegistry::new(InterceptorCatalog::new())));
        let log = Log::default();
        let listener_log = log.clone();
        p.deploy(
            ContextKey::new(None, "/shop", "test"),
            Arc::new(move |key: &ContextKey| {
                let listener = Listener { tag: "shop", log: listener_log.clone() };
                Ok(ServingContext::builder(key.clone(), listener)
                    .sessions(SessionConfig::default())
                    .build())
            }),
        )
        .unwrap();

        let first = p
            .handle(DispatchRequest::new(Method::GET, Uri::from_static("/shop/cart")))
            .await
            .unwrap();
        let cookie = first
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("PORTICOSESSION="));
        assert!(cookie.contains("Path=/shop"));
        assert!(cookie.ends_with("HttpOnly"));

        let pair = cookie.split(';').next().unwrap();
        let again = DispatchRequest::new(Method::GET, Uri::from_static("/shop/cart"))
            .with_header(header::COOKIE, pair);
        let second = p.handle(again).await.unwrap();
        assert!(second.headers().get(header::SET_COOKIE).is_none());

        let key = ContextKey::new(None, "/shop", "test");
        let sessions = p.contexts().get(&key).unwrap().sessions().unwrap().active_sessions();
        assert_eq!(sessions, 1);
    }

    #[tokio::test]
    async fn admin_views_describe_state() {
        let log = Log::default();
        let p = pipeline_with(&log, vec![Stage::new(&log, "a", 0, Mode::Pass)]);

        let chain = RequestHandler::interceptors(&p);
        assert_eq!(chain["chain"][0]["name"], "a");

        let contexts = RequestHandler::contexts(&p);
        assert_eq!(contexts["mounts"][0], "test@*/");
        assert_eq!(contexts["contexts"][0]["refcount"], 1);
    }
}
