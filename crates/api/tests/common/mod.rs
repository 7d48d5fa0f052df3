#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use conveyor_core::job::Job;
use conveyor_db::{Broker, JobStore, MemoryBroker};
use conveyor_events::EventBus;
use conveyor_worker::{tasks, TaskConfig, WorkerConfig, WorkerPool};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use conveyor_api::config::ServerConfig;
use conveyor_api::router::build_app_router;
use conveyor_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default),
/// a 30-second request timeout and a fast status poll.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        status_poll: Duration::from_millis(50),
    }
}

/// Sleep ticks of 20 ms so `{"duration": 5}` runs for a tenth of a second.
pub fn test_task_config() -> TaskConfig {
    TaskConfig {
        max_timeout_ticks: 180,
        tick: Duration::from_millis(20),
    }
}

/// An application over in-memory backends.
///
/// Embedded workers (if any) stop when the value is dropped.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<JobStore>,
    pub broker: Arc<MemoryBroker>,
    shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub struct TestOptions {
    pub workers: usize,
    pub retention: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            retention: Duration::from_secs(3600),
        }
    }
}

/// Build the full application router with no workers: submitted jobs stay
/// `PENDING`.
pub fn build_test_app() -> TestApp {
    build_test_app_with(TestOptions::default())
}

/// Build the full application router with two embedded workers.
pub fn build_test_app_with_workers() -> TestApp {
    build_test_app_with(TestOptions {
        workers: 2,
        ..TestOptions::default()
    })
}

/// Build the full application router through the same
/// [`build_app_router`] the binary uses.
pub fn build_test_app_with(options: TestOptions) -> TestApp {
    let config = test_config();
    let task_config = test_task_config();
    let shutdown = CancellationToken::new();

    let store = Arc::new(JobStore::in_memory(
        Arc::new(EventBus::default()),
        options.retention,
    ));
    let broker = Arc::new(MemoryBroker::new());
    let registry = Arc::new(tasks::builtin_registry(&task_config).unwrap());

    if options.workers > 0 {
        let worker_config = WorkerConfig {
            name: "test-worker".to_string(),
            concurrency: options.workers,
            cancel_poll: Duration::from_millis(20),
            dequeue_wait: Duration::from_millis(50),
            tasks: task_config,
        };
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&registry),
            worker_config,
        ));
        tokio::spawn(pool.run(shutdown.clone()));
    }

    let state = AppState::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&broker) as Arc<dyn Broker>,
        registry,
    );

    TestApp {
        router: build_app_router(state, &config),
        store,
        broker,
        shutdown,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::POST, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Submit a job and return the created record.
pub async fn submit(app: &TestApp, type_name: &str, input: serde_json::Value) -> Job {
    let response = post_json(
        app.router.clone(),
        "/api/v1/jobs",
        serde_json::json!({"type": type_name, "input": input}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    serde_json::from_value(body_json(response).await["data"].clone()).unwrap()
}

/// Poll `GET /api/v1/jobs/{id}` until the record is in `state`.
pub async fn wait_for_state(app: &TestApp, id: uuid::Uuid, state: &str) -> serde_json::Value {
    wait_for_any_state(app, id, &[state]).await
}

/// Poll `GET /api/v1/jobs/{id}` until the record is in one of `states`.
pub async fn wait_for_any_state(
    app: &TestApp,
    id: uuid::Uuid,
    states: &[&str],
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = get(app.router.clone(), &format!("/api/v1/jobs/{id}")).await;
        if response.status() == StatusCode::OK {
            let json = body_json(response).await;
            if states.iter().any(|s| json["data"]["state"] == *s) {
                return json["data"].clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} never reached any of {states:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
