//! Public (control-plane-facing) HTTP surface
//!
//! | Route                              | Operation          |
//! |------------------------------------|--------------------|
//! | `POST /api/v1/runs`                | create run         |
//! | `GET  /api/v1/runs?threadId=`      | list runs (thread) |
//! | `GET  /api/v1/runs/:id`            | get run            |
//! | `POST /api/v1/runs/:id/cancel`     | cancel run         |
//! | `GET  /api/v1/agents`              | enabled agents     |
//! | `GET  /api/v1/agents/:agent/models`| model discovery    |
//! | `GET  /api/v1/agents/:agent/commands` | command discovery |
//! | `GET  /api/v1/events`              | SSE event stream   |
//! | `GET  /.well-known/agent-worker.json` | reflection      |
//! | `GET  /health`                     | liveness           |
//!
//! Every route sits behind the public bearer middleware.

use super::auth::require_bearer;
use super::descriptor::build_descriptor;
use super::error::{route_not_found, ApiResult};
use crate::error::Error;
use crate::manager::RunManager;
use crate::run::{AgentKind, AgentRun, Command, ModelInventory, RunSpec};
use crate::secret::PublicSecret;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared state of the public router
#[derive(Clone)]
pub struct PublicState {
    pub manager: RunManager,
    pub worker_id: String,
    pub tls: bool,
    /// Ends open event streams so graceful shutdown can finish
    pub closing: CancellationToken,
}

/// Build the public router guarded by `secret`
pub fn public_router(state: PublicState, secret: Arc<PublicSecret>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/agent-worker.json", get(reflection))
        .route("/api/v1/runs", post(create_run).get(list_runs))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/cancel", post(cancel_run))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/:agent/models", get(discover_models))
        .route("/api/v1/agents/:agent/commands", get(discover_commands))
        .route("/api/v1/events", get(event_stream))
        .fallback(route_not_found)
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            secret,
            require_bearer::<PublicSecret>,
        ))
        .layer(TraceLayer::new_for_http())
}

// =============================================================================
// Probes
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    worker_id: String,
    live_sessions: usize,
}

async fn health(State(state): State<PublicState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.worker_id.clone(),
        live_sessions: state.manager.live_count().await,
    })
}

async fn reflection(State(state): State<PublicState>) -> impl IntoResponse {
    Json(build_descriptor(
        &state.worker_id,
        state.manager.agents(),
        state.tls,
    ))
}

// =============================================================================
// Runs
// =============================================================================

async fn create_run(
    State(state): State<PublicState>,
    body: Result<Json<RunSpec>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AgentRun>)> {
    let Json(spec) = body?;
    let run = state.manager.create_run(spec).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    thread_id: Option<String>,
}

#[derive(Serialize)]
struct RunList {
    runs: Vec<AgentRun>,
}

async fn list_runs(
    State(state): State<PublicState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<RunList>> {
    let thread_id = query
        .thread_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::BadRequest("threadId query parameter is required".to_string()))?;
    let runs = state.manager.list_runs_by_thread(&thread_id).await?;
    Ok(Json(RunList { runs }))
}

async fn get_run(
    State(state): State<PublicState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentRun>> {
    Ok(Json(state.manager.get_run(&id).await?))
}

async fn cancel_run(
    State(state): State<PublicState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentRun>> {
    Ok(Json(state.manager.cancel_run(&id).await?))
}

// =============================================================================
// Discovery
// =============================================================================

#[derive(Serialize)]
struct AgentList {
    agents: Vec<AgentKind>,
}

async fn list_agents(State(state): State<PublicState>) -> Json<AgentList> {
    Json(AgentList {
        agents: state.manager.agents(),
    })
}

#[derive(Deserialize)]
struct ModelsQuery {
    workdir: Option<String>,
}

async fn discover_models(
    State(state): State<PublicState>,
    Path(agent): Path<String>,
    Query(query): Query<ModelsQuery>,
) -> ApiResult<Json<ModelInventory>> {
    let workdir = query
        .workdir
        .filter(|w| !w.is_empty())
        .map(std::path::PathBuf::from);
    let inventory = state
        .manager
        .discover_models(&agent, workdir.as_deref())
        .await?;
    Ok(Json(inventory))
}

#[derive(Serialize)]
struct CommandList {
    commands: Vec<Command>,
}

async fn discover_commands(
    State(state): State<PublicState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<CommandList>> {
    let commands = state.manager.discover_commands(&agent).await?;
    Ok(Json(CommandList { commands }))
}

// =============================================================================
// Event stream
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    run_id: Option<String>,
}

async fn event_stream(
    State(state): State<PublicState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.manager.subscribe();
    let run_filter = query.run_id.filter(|r| !r.is_empty());

    let closing = state.closing.clone();

    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                _ = closing.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    if run_filter.as_deref().is_some_and(|id| id != event.run_id) {
                        continue;
                    }
                    if let Ok(sse) = Event::default().event(event.label()).json_data(&event) {
                        yield Ok(sse);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SessionExit;
    use crate::run::{RunStatus, RunStore};
    use crate::testing::{test_manager, FakeDriver};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "control-plane-secret";

    fn make_app(drivers: Vec<FakeDriver>) -> (Router, RunManager, crate::run::MemoryRunStore) {
        let (manager, store) = test_manager(drivers);
        let state = PublicState {
            manager: manager.clone(),
            worker_id: "test-worker".to_string(),
            tls: false,
            closing: CancellationToken::new(),
        };
        let secret = Arc::new(PublicSecret::new(SECRET).unwrap());
        (public_router(state, secret), manager, store)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", SECRET));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(agent: &str) -> serde_json::Value {
        serde_json::json!({
            "threadId": "thread-9",
            "prompt": "refactor the parser",
            "agent": agent,
            "workdir": std::env::temp_dir().to_string_lossy(),
        })
    }

    #[tokio::test]
    async fn test_unknown_route_needs_token() {
        let (app, _, _) = make_app(vec![FakeDriver::new(AgentKind::Claude)]);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/secret-admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("GET", "/api/v1/secret-admin", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_bad_token_rejected_before_backend() {
        let driver = FakeDriver::new(AgentKind::Claude);
        let (app, _, store) = make_app(vec![driver.clone()]);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("authorization", "Bearer wrong")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body("claude").to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "UNAUTHENTICATED");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/agents/claude/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert!(store.list_agent_runs_by_thread("thread-9").await.unwrap().is_empty());
        assert_eq!(driver.discover_count(), 0);
        assert_eq!(driver.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_health_and_reflection_require_auth() {
        let (app, _, _) = make_app(vec![FakeDriver::new(AgentKind::Claude)]);
        for uri in ["/health", "/.well-known/agent-worker.json"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            let resp = app.clone().oneshot(request("GET", uri, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_claude_create_running_completed() {
        let driver = FakeDriver::new(AgentKind::Claude);
        let (app, manager, _) = make_app(vec![driver.clone()]);

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/v1/runs", Some(create_body("claude"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(created["agent"], "claude");
        let id = created["id"].as_str().unwrap().to_string();

        manager.reconcile_once().await.unwrap();
        let session = driver.session(0).await;

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/api/v1/runs/{}", id), None))
            .await
            .unwrap();
        let running = body_json(resp).await;
        assert_eq!(running["status"], "running");
        assert_eq!(running["sessionId"], session.id.as_str());

        session.finish(SessionExit::Completed).await;
        let mut status = String::new();
        for _ in 0..200 {
            status = manager.get_run(&id).await.unwrap().status.to_string();
            if status == RunStatus::Completed.as_str() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");

        let resp = app
            .oneshot(request("GET", "/api/v1/runs?threadId=thread-9", None))
            .await
            .unwrap();
        let list = body_json(resp).await;
        assert_eq!(list["runs"].as_array().unwrap().len(), 1);
        assert_eq!(list["runs"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_unknown_agent_is_bad_request() {
        let (app, _, store) = make_app(vec![FakeDriver::new(AgentKind::Claude)]);
        let resp = app
            .oneshot(request("POST", "/api/v1/runs", Some(create_body("cursor"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "UNKNOWN_AGENT");
        assert!(store.list_agent_runs_by_thread("thread-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _, _) = make_app(vec![FakeDriver::new(AgentKind::Claude)]);
        let resp = app
            .oneshot(request(
                "POST",
                "/api/v1/runs",
                Some(serde_json::json!({"threadId": "t"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_cancel_pending_and_terminal() {
        let driver = FakeDriver::new(AgentKind::Claude);
        let (app, _, _) = make_app(vec![driver.clone()]);
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/v1/runs", Some(create_body("claude"))))
            .await
            .unwrap();
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(request("POST", &format!("/api/v1/runs/{}/cancel", id), None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["status"], "cancelled");
        }
        assert_eq!(driver.launch_count(), 0);

        let resp = app
            .oneshot(request("POST", "/api/v1/runs/missing/cancel", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_runs_requires_thread() {
        let (app, _, _) = make_app(vec![FakeDriver::new(AgentKind::Claude)]);
        let resp = app.oneshot(request("GET", "/api/v1/runs", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_codex_discovery_pass_through() {
        let driver = FakeDriver::new(AgentKind::Codex);
        let (app, _, _) = make_app(vec![driver.clone()]);
        let uri = format!(
            "/api/v1/agents/codex/models?workdir={}",
            std::env::temp_dir().to_string_lossy()
        );
        let resp = app.clone().oneshot(request("GET", &uri, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::to_value(driver.inventory()).unwrap());
        assert_eq!(json["defaultModel"], "codex-large");

        let resp = app
            .clone()
            .oneshot(request("GET", "/api/v1/agents/codex/commands", None))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["commands"][0]["name"], "review");

        let resp = app
            .oneshot(request("GET", "/api/v1/agents/gemini/models", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_discovery_timeout_is_bad_gateway() {
        let driver = FakeDriver::new(AgentKind::Codex);
        driver.hang_discovery();
        let (app, _, _) = make_app(vec![driver]);
        let resp = app
            .oneshot(request("GET", "/api/v1/agents/codex/models", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"]["code"], "DISCOVERY_FAILED");
    }

    #[tokio::test]
    async fn test_list_agents() {
        let (app, _, _) = make_app(vec![
            FakeDriver::new(AgentKind::Gemini),
            FakeDriver::new(AgentKind::Claude),
        ]);
        let resp = app.oneshot(request("GET", "/api/v1/agents", None)).await.unwrap();
        assert_eq!(
            body_json(resp).await["agents"],
            serde_json::json!(["claude", "gemini"])
        );
    }
}
