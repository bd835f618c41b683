pub mod api;
pub mod config;
pub mod error;
pub mod security;
pub mod state;
pub mod validation;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let presentations = Router::new()
        .route(
            "/presentations",
            post(api::create_presentation).get(api::list_presentations),
        )
        .route(
            "/presentations/:id",
            get(api::get_presentation).delete(api::delete_presentation),
        )
        .route("/presentations/:id/extend", post(api::extend_presentation))
        .route("/presentations/:id/logs", get(api::presentation_logs))
        .route("/stats", get(api::stats))
        .route("/cleanup", post(api::cleanup))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::rate_limit,
        ));

    Router::new()
        .route("/health", get(api::health))
        .merge(presentations)
        .layer(DefaultBodyLimit::max(state.api.body_limit_bytes))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use slidehost_agent::{
        Registry, Settings,
        port_alloc::PortRange,
        readiness::ReadinessProbe,
        scaffold::DependencyMode,
        supervisor::{RendererConfig, SupervisorConfig},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::config::ApiConfig;

    fn temp_root(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "slidehost-control-{test_name}-{}-{n}",
            std::process::id()
        ))
    }

    fn app_state(test_name: &str, ports: (u16, u16), api: ApiConfig) -> AppState {
        let mut s = Settings::with_root(temp_root(test_name));
        s.scaffold.dependencies = DependencyMode::None;
        s.port_range = PortRange {
            start: ports.0,
            end: ports.1,
        };
        s.probe_ports = false;
        s.supervisor = SupervisorConfig {
            renderer: RendererConfig {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "echo \"ready on $PORT\"; sleep 30".to_string(),
                ],
                bind: "127.0.0.1".to_string(),
                env: Vec::new(),
            },
            readiness: ReadinessProbe::OutputPattern {
                patterns: vec!["ready on {port}".to_string()],
            },
            startup_timeout: Duration::from_secs(5),
            termination_grace: Duration::from_millis(500),
            ..SupervisorConfig::default()
        };
        let registry = Registry::new(&s);
        AppState::new(registry, s, api)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn delete_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn short_content_is_rejected_without_allocating() {
        let state = app_state("short", (42000, 42001), ApiConfig::default());
        let app = router(state.clone());

        let (status, body) =
            send(&app, post_json("/presentations", json!({ "content": "hello" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "content_too_short");
        assert!(body["fieldErrors"]["content"].is_string());
        assert!(body["requestId"].is_string());

        assert_eq!(state.registry.ports().stats().allocated, 0);
        assert!(state.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let app = router(app_state("badjson", (42010, 42011), ApiConfig::default()));
        let req = Request::builder()
            .method("POST")
            .uri("/presentations")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_json");
    }

    #[tokio::test]
    async fn unknown_presentation_is_not_found_with_request_id() {
        let app = router(app_state("notfound", (42020, 42021), ApiConfig::default()));
        let req = Request::builder()
            .uri("/presentations/does-not-exist")
            .header("x-request-id", "trace-42")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["x-request-id"], "trace-42");

        let (status, body) = send(&app, delete_req("/presentations/does-not-exist")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn presentation_lifecycle_over_http() {
        let state = app_state("lifecycle", (42030, 42039), ApiConfig::default());
        let app = router(state.clone());

        let (status, created) = send(
            &app,
            post_json(
                "/presentations",
                json!({
                    "content": "# Hello\n\n---\n\n# World",
                    "title": "Demo",
                    "customCSS": "h1 { color: red; }",
                    "ttl": 120000
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "ready");
        assert_eq!(created["url"], "http://localhost:42030");
        assert_eq!(created["urls"]["print"], "http://localhost:42030/print");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, list) = send(&app, get_req("/presentations")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        assert_eq!(list["active"], 1);
        assert_eq!(list["presentations"][0]["title"], "Demo");

        let (status, detail) = send(&app, get_req(&format!("/presentations/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["port"], 42030);
        assert_eq!(detail["healthy"], true);

        let (status, extended) = send(
            &app,
            post_json(
                &format!("/presentations/{id}/extend"),
                json!({ "ttl": 3_600_000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(extended["expiresAt"], created["expiresAt"]);

        let (status, bad) = send(
            &app,
            post_json(&format!("/presentations/{id}/extend"), json!({ "ttl": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(bad["code"], "invalid_ttl");

        let (status, logs) = send(&app, get_req(&format!("/presentations/{id}/logs?limit=50"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            logs["lines"]
                .as_array()
                .unwrap()
                .iter()
                .any(|l| l.as_str().unwrap().contains("ready on 42030"))
        );

        let (status, stats) = send(&app, get_req("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["ready"], 1);
        assert_eq!(stats["ports"]["allocated"], 1);

        let (status, _) = send(&app, delete_req(&format!("/presentations/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, get_req(&format!("/presentations/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.registry.ports().stats().allocated, 0);

        let _ = std::fs::remove_dir_all(&state.settings.temp_root);
    }

    #[tokio::test]
    async fn cleanup_and_health_report() {
        let state = app_state("health", (42040, 42041), ApiConfig::default());
        let app = router(state.clone());

        let (status, body) = send(&app, post_json("/cleanup", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleaned"], 0);

        let (status, health) = send(&app, get_req("/health")).await;
        assert!(status == StatusCode::OK || status == StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health["activePresentations"], 0);
        assert_eq!(health["availablePorts"], 2);
        assert!(health["memoryUsage"].is_object());
        assert!(health["diskUsage"].is_object());
    }

    #[tokio::test]
    async fn rate_limit_applies_to_presentation_routes_only() {
        let api = ApiConfig {
            rate_limit_max_hits: 2,
            ..ApiConfig::default()
        };
        let app = router(app_state("ratelimit", (42050, 42051), api));

        assert_eq!(send(&app, get_req("/presentations")).await.0, StatusCode::OK);
        assert_eq!(send(&app, get_req("/presentations")).await.0, StatusCode::OK);
        let (status, body) = send(&app, get_req("/presentations")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "rate_limited");

        let (status, _) = send(&app, get_req("/health")).await;
        assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
    }
}
