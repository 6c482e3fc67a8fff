//! Shared helpers for API integration tests.
//!
//! The app is built through the production router builder over the
//! in-memory status store, a static script and an in-process provider, so
//! the tests need no database or provider gateway.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use vidgen_api::config::ServerConfig;
use vidgen_api::router::build_app_router;
use vidgen_api::state::AppState;
use vidgen_core::failure::ProviderError;
use vidgen_db::models::script::{ScriptOutline, ScriptScene};
use vidgen_events::EventBus;
use vidgen_pipeline::{
    MemoryStatusStore, PipelineConfig, PipelineCoordinator, ProviderInvoker, ProviderSelector,
    StaticScriptSource, StatusGateway,
};

/// Script and chapter the static script source knows about.
pub const SCRIPT_ID: i64 = 1;
pub const CHAPTER_ID: i64 = 1;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
    }
}

/// Provider that answers instantly, or never while `hang` is set.
#[derive(Default)]
pub struct InstantProvider {
    pub hang: AtomicBool,
}

#[async_trait]
impl ProviderInvoker for InstantProvider {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(format!("{provider_id}://{}", payload["unit"].as_str().unwrap_or("?")))
    }
}

fn outline() -> ScriptOutline {
    ScriptOutline {
        script_id: SCRIPT_ID,
        chapter_id: CHAPTER_ID,
        scenes: (0..2)
            .map(|i| ScriptScene {
                id: i + 1,
                script_id: SCRIPT_ID,
                chapter_id: CHAPTER_ID,
                position: i as i32,
                visual_description: format!("Scene {i}"),
                narration: format!("Narration {i}"),
                dialogue: None,
                speaker_position: None,
                duration_secs: None,
            })
            .collect(),
        characters: Vec::new(),
    }
}

/// Build the full application router with all middleware layers.
pub fn build_test_app() -> Router {
    build_test_app_with(Arc::new(InstantProvider::default()))
}

pub fn build_test_app_with(provider: Arc<InstantProvider>) -> Router {
    let config = test_config();
    let store = Arc::new(MemoryStatusStore::new());
    let event_bus = Arc::new(EventBus::default());
    let coordinator = PipelineCoordinator::new(
        store.clone(),
        Arc::new(StaticScriptSource::new().with_outline(outline())),
        provider,
        ProviderSelector::new(),
        Arc::clone(&event_bus),
        PipelineConfig::default(),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        coordinator,
        gateway: StatusGateway::new(store.clone()),
        store,
        event_bus,
    };
    build_app_router(state, &config)
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Start a run for the known script and return its id.
pub async fn start_run(app: &Router) -> i64 {
    let response = post_json(
        app.clone(),
        "/api/v1/start-generation",
        serde_json::json!({ "script_id": SCRIPT_ID, "chapter_id": CHAPTER_ID }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"]["generation_id"]
        .as_i64()
        .unwrap()
}

/// Poll the status endpoint until the run is terminal.
pub async fn wait_terminal(app: &Router, id: i64) -> serde_json::Value {
    let uri = format!("/api/v1/generation-status/{id}");
    for _ in 0..500 {
        let json = body_json(get(app.clone(), &uri).await).await;
        let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return json["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {id} did not reach a terminal status");
}
