use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use intent::{
    BehaviorOutcome, DefaultSpecRunner, Problem, ProblemKind, RunConfig, Spec, SpecResult,
    SpecRunner, StructuralError,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
struct AppState {
    hits: Arc<AtomicUsize>,
    users: Arc<Mutex<Vec<Value>>>,
}

async fn create_user(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut users = state.users.lock().unwrap();
    let id = format!("00000000-0000-4000-8000-{:012}", users.len() + 1);
    let user = json!({
        "id": id,
        "name": body["name"],
        "email": body["email"],
        "created_at": "2024-05-01T12:00:00Z",
    });
    users.push(user.clone());
    (
        StatusCode::CREATED,
        [(header::LOCATION, format!("/users/{id}"))],
        Json(user),
    )
}

async fn list_users(State(state): State<AppState>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let users = state.users.lock().unwrap();
    Json(json!({ "users": users.clone(), "total": users.len() }))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let users = state.users.lock().unwrap();
    match users.iter().find(|u| u["id"] == id.as_str()) {
        Some(user) => (StatusCode::OK, Json(user.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ([("X-Service", "users-api")], Json(json!({ "status": "ok" })))
}

async fn broken(State(state): State<AppState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "boom" })),
    )
}

async fn slow(State(state): State<AppState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "status": "late" }))
}

async fn malformed(State(state): State<AppState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "application/json")], "{bad")
}

async fn moved(State(state): State<AppState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FOUND, [(header::LOCATION, "/health")])
}

struct TestServer {
    base_url: String,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let state = AppState::default();
        let app = Router::new()
            .route("/users", get(list_users).post(create_user))
            .route("/users/:id", get(get_user))
            .route("/health", get(health))
            .route("/broken", get(broken))
            .route("/slow", get(slow))
            .route("/malformed", get(malformed))
            .route("/moved", get(moved))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn load_spec(path: &str, base_url: &str) -> Spec {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let spec_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&spec_path)
        .unwrap_or_else(|e| panic!("failed to read {spec_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    Spec::from_yaml(&content).unwrap_or_else(|e| panic!("failed to parse spec yaml: {e}"))
}

fn runner() -> DefaultSpecRunner {
    DefaultSpecRunner::new().expect("failed to build HTTP client")
}

fn local() -> RunConfig {
    RunConfig {
        allow_local_targets: true,
        ..RunConfig::default()
    }
}

fn outcomes(result: &SpecResult) -> Vec<(String, &'static str)> {
    result
        .behaviors
        .iter()
        .map(|b| (b.name.clone(), b.outcome.label()))
        .collect()
}

#[tokio::test]
async fn user_flow_passes_and_threads_captures() {
    let server = TestServer::spawn().await;
    let spec = load_spec("users_flow.yaml", &server.base_url);

    let result = runner()
        .run(&spec, &local())
        .await
        .expect("runner returned structural error");

    assert!(result.pass, "spec should pass: {:#?}", result.failures);
    assert_eq!((result.passed, result.total), (4, 4));
    assert_eq!(result.exit_code(), 0);

    let get_user = result
        .behaviors
        .iter()
        .find(|b| b.name == "get-user")
        .unwrap();
    assert_eq!(get_user.status, Some(200));
    assert!(get_user
        .url
        .as_deref()
        .unwrap()
        .ends_with("/users/00000000-0000-4000-8000-000000000001"));

    let list = result
        .behaviors
        .iter()
        .find(|b| b.name == "list-users")
        .unwrap();
    assert!(list.url.as_deref().unwrap().ends_with("/users?limit=10"));

    server.shutdown().await;
}

#[tokio::test]
async fn failed_dependency_blocks_dependents_without_requests() {
    let server = TestServer::spawn().await;
    let spec = load_spec("blocked_chain.yaml", &server.base_url);

    let result = runner().run(&spec, &local()).await.unwrap();

    assert_eq!(
        outcomes(&result),
        vec![
            ("broken".to_string(), "failed"),
            ("uses-token".to_string(), "blocked"),
            ("uses-token-again".to_string(), "blocked"),
            ("independent".to_string(), "passed"),
        ]
    );
    // Only "broken" and "independent" reached the server.
    assert_eq!(server.hits(), 2);

    match result.outcome_of("broken") {
        Some(BehaviorOutcome::Failed { problems }) => {
            assert_eq!(problems[0].kind, ProblemKind::Status);
            assert_eq!(problems[0].expected.as_deref(), Some("200"));
            assert_eq!(problems[0].actual.as_deref(), Some("500"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        result.outcome_of("uses-token-again"),
        Some(&BehaviorOutcome::Blocked {
            dependency: "uses-token".into()
        })
    );
    assert_eq!(result.exit_code(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn cycle_aborts_before_any_request() {
    let server = TestServer::spawn().await;
    let spec = load_spec("cycle.yaml", &server.base_url);

    let err = runner()
        .run(&spec, &local())
        .await
        .unwrap_err();

    match err {
        StructuralError::Cycle { path } => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"first".to_string()));
            assert!(path.contains(&"second".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(server.hits(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn capture_failure_fails_behavior_and_blocks_dependents() {
    let server = TestServer::spawn().await;
    let spec = load_spec("capture_failure.yaml", &server.base_url);

    let result = runner().run(&spec, &local()).await.unwrap();

    match result.outcome_of("create-user") {
        Some(BehaviorOutcome::Failed { problems }) => {
            assert_eq!(problems.len(), 1);
            assert_eq!(problems[0].kind, ProblemKind::Capture);
            assert_eq!(problems[0].field.as_deref(), Some("session.token"));
        }
        other => panic!("expected capture failure, got {other:?}"),
    }
    assert_eq!(
        result.outcome_of("get-user"),
        Some(&BehaviorOutcome::Blocked {
            dependency: "create-user".into()
        })
    );
    assert_eq!(server.hits(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn local_targets_are_blocked_by_default() {
    let server = TestServer::spawn().await;
    let spec = load_spec("users_flow.yaml", &server.base_url);

    let result = runner()
        .run(&spec, &RunConfig::default())
        .await
        .unwrap();

    assert_eq!(server.hits(), 0);
    assert_eq!((result.failed, result.blocked), (2, 2));
    match result.outcome_of("create-user") {
        Some(BehaviorOutcome::Failed { problems }) => {
            assert_eq!(problems[0].kind, ProblemKind::Transport);
            assert_eq!(problems[0].rule.as_deref(), Some("ssrf_blocked"));
        }
        other => panic!("expected ssrf block, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn repeated_runs_give_identical_outcomes() {
    let mut previous: Option<Vec<(String, &'static str)>> = None;
    for _ in 0..2 {
        let server = TestServer::spawn().await;
        let spec = load_spec("blocked_chain.yaml", &server.base_url);
        let result = runner().run(&spec, &local()).await.unwrap();
        let current = outcomes(&result);
        if let Some(previous) = &previous {
            assert_eq!(previous, &current);
        }
        previous = Some(current);
        server.shutdown().await;
    }
}

#[tokio::test]
async fn parallel_mode_matches_sequential_mode() {
    let mut by_mode = HashMap::new();
    for parallel in [false, true] {
        let server = TestServer::spawn().await;
        let spec = load_spec("users_flow.yaml", &server.base_url);
        let config = RunConfig {
            parallel,
            ..local()
        };
        let result = runner().run(&spec, &config).await.unwrap();
        assert!(result.pass, "parallel={parallel}: {:#?}", result.failures);
        let mut names: Vec<_> = outcomes(&result);
        names.sort();
        by_mode.insert(parallel, names);
        server.shutdown().await;
    }
    assert_eq!(by_mode[&false], by_mode[&true]);
}

#[tokio::test]
async fn tag_selection_pulls_in_dependencies() {
    let server = TestServer::spawn().await;
    let spec = load_spec("users_flow.yaml", &server.base_url);
    let config = RunConfig {
        tags: vec!["users".to_string()],
        ..local()
    };

    let result = runner().run(&spec, &config).await.unwrap();

    let names: Vec<_> = result.behaviors.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["create-user", "get-user"]);
    assert!(result.pass);

    server.shutdown().await;
}

fn first_problem<'a>(result: &'a SpecResult, name: &str) -> &'a Problem {
    match result.outcome_of(name) {
        Some(BehaviorOutcome::Failed { problems }) => &problems[0],
        other => panic!("expected {name} to fail, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_target_fails_as_transport_and_blocks_dependents() {
    // Bind then drop, so nothing listens on the port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let spec = load_spec("transport_failure.yaml", &format!("http://{addr}"));
    let result = runner().run(&spec, &local()).await.unwrap();

    let problem = first_problem(&result, "fetch-status");
    assert_eq!(problem.kind, ProblemKind::Transport);
    assert_eq!(problem.rule.as_deref(), Some("http_request"));
    assert_eq!(
        result.outcome_of("report-status"),
        Some(&BehaviorOutcome::Blocked {
            dependency: "fetch-status".into()
        })
    );
    assert_eq!((result.failed, result.blocked), (1, 1));
    assert_eq!(result.exit_code(), 1);
}

#[tokio::test]
async fn slow_response_times_out_and_malformed_json_keeps_raw_body() {
    let server = TestServer::spawn().await;
    let spec = load_spec("bad_responses.yaml", &server.base_url);

    let result = runner().run(&spec, &local()).await.unwrap();

    let slow = first_problem(&result, "slow");
    assert_eq!(slow.kind, ProblemKind::Transport);
    assert_eq!(slow.rule.as_deref(), Some("http_request"));
    assert!(
        slow.explanation.contains("timed out"),
        "unexpected explanation: {}",
        slow.explanation
    );

    let malformed = first_problem(&result, "malformed");
    assert_eq!(malformed.kind, ProblemKind::Transport);
    assert_eq!(malformed.rule.as_deref(), Some("response_parse"));
    assert_eq!(malformed.actual.as_deref(), Some("{bad"));

    assert_eq!(result.failed, 2);
    drop(server);
}

#[tokio::test]
async fn redirects_are_reported_without_following() {
    let server = TestServer::spawn().await;
    let spec = load_spec("redirect.yaml", &server.base_url);

    let result = runner().run(&spec, &local()).await.unwrap();

    assert!(result.pass, "redirect should pass: {:#?}", result.failures);
    let moved = &result.behaviors[0];
    assert_eq!(moved.status, Some(302));
    // Only /moved was requested; /health was never fetched.
    assert_eq!(server.hits(), 1);

    server.shutdown().await;
}
