//! Private CTL surface
//!
//! Loopback-only callbacks from helpers running inside agent sessions.
//! Authenticated with the per-process [`CtlSecret`]; the public secret is
//! never accepted here.

use super::auth::require_bearer;
use super::error::{route_not_found, ApiResult};
use crate::error::Error;
use crate::manager::{HookReport, PlanSubmission, RunManager};
use crate::run::AgentKind;
use crate::secret::CtlSecret;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const HOOKS_PATH: &str = "/ctl/v1/hooks";
pub const PLANS_PATH: &str = "/ctl/v1/plans";

/// Body of `POST /ctl/v1/hooks`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub session_id: String,
    pub agent: String,
    pub hook_name: String,
    /// Base64 (standard alphabet) of the raw hook payload
    #[serde(default)]
    pub payload: String,
}

/// Body of `POST /ctl/v1/plans`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub session_id: String,
    pub plan: String,
}

pub fn ctl_router(manager: RunManager, secret: Arc<CtlSecret>) -> Router {
    Router::new()
        .route(HOOKS_PATH, post(report_hook))
        .route(PLANS_PATH, post(submit_plan))
        .fallback(route_not_found)
        .with_state(manager)
        .layer(middleware::from_fn_with_state(
            secret,
            require_bearer::<CtlSecret>,
        ))
        .layer(TraceLayer::new_for_http())
}

async fn report_hook(
    State(manager): State<RunManager>,
    body: Result<Json<HookRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = body?;
    let agent: AgentKind = req.agent.parse()?;
    let payload = STANDARD
        .decode(req.payload.as_bytes())
        .map_err(|e| Error::BadRequest(format!("payload is not base64: {}", e)))?;

    tracing::debug!(
        session_id = %req.session_id,
        agent = %agent,
        hook = %req.hook_name,
        bytes = payload.len(),
        "Hook report"
    );
    manager
        .handle_hook_report(HookReport {
            session_id: req.session_id,
            agent,
            hook_name: req.hook_name,
            payload,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn submit_plan(
    State(manager): State<RunManager>,
    body: Result<Json<PlanRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = body?;
    tracing::debug!(session_id = %req.session_id, "Plan submission");
    manager
        .handle_plan_submission(PlanSubmission {
            session_id: req.session_id,
            plan: req.plan,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::EventKind;
    use crate::run::{RunSpec, RunStatus};
    use crate::secret::PublicSecret;
    use crate::testing::{test_manager, FakeDriver};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn post_json(path: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("authorization", format!("Bearer {}", token))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn running_session(manager: &RunManager) -> (String, String) {
        let run = manager
            .create_run(RunSpec {
                thread_id: "t".to_string(),
                prompt: "go".to_string(),
                agent: "claude".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.reconcile_once().await.unwrap();
        for _ in 0..200 {
            let current = manager.get_run(&run.id).await.unwrap();
            if current.status == RunStatus::Running {
                return (current.id, current.session_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never started");
    }

    #[tokio::test]
    async fn test_hook_accepted_and_relayed() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let secret = Arc::new(CtlSecret::generate());
        let app = ctl_router(manager.clone(), secret.clone());
        let (run_id, session_id) = running_session(&manager).await;
        let mut events = manager.subscribe();

        let resp = app
            .oneshot(post_json(
                HOOKS_PATH,
                secret.as_str(),
                serde_json::json!({
                    "sessionId": session_id,
                    "agent": "claude",
                    "hookName": "PostToolUse",
                    "payload": STANDARD.encode(b"{\"tool\":\"Bash\"}"),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.run_id, run_id);
        assert_eq!(
            event.kind,
            EventKind::Hook {
                name: "PostToolUse".to_string(),
                payload: b"{\"tool\":\"Bash\"}".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_plan_accepted() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let secret = Arc::new(CtlSecret::generate());
        let app = ctl_router(manager.clone(), secret.clone());
        let (_, session_id) = running_session(&manager).await;

        let resp = app
            .oneshot(post_json(
                PLANS_PATH,
                secret.as_str(),
                serde_json::json!({"sessionId": session_id, "plan": "1. do it"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_public_secret_rejected_on_ctl() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let public = PublicSecret::new("public-secret").unwrap();
        let app = ctl_router(manager.clone(), Arc::new(CtlSecret::generate()));
        let (_, session_id) = running_session(&manager).await;
        let mut events = manager.subscribe();

        let resp = app
            .oneshot(post_json(
                PLANS_PATH,
                std::str::from_utf8(crate::secret::BearerSecret::expose(&public)).unwrap(),
                serde_json::json!({"sessionId": session_id, "plan": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let secret = Arc::new(CtlSecret::generate());
        let app = ctl_router(manager, secret.clone());
        let resp = app
            .oneshot(post_json(
                HOOKS_PATH,
                secret.as_str(),
                serde_json::json!({
                    "sessionId": "nope",
                    "agent": "claude",
                    "hookName": "Stop",
                    "payload": "",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_payload_is_bad_request() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let secret = Arc::new(CtlSecret::generate());
        let app = ctl_router(manager.clone(), secret.clone());
        let (_, session_id) = running_session(&manager).await;
        let resp = app
            .oneshot(post_json(
                HOOKS_PATH,
                secret.as_str(),
                serde_json::json!({
                    "sessionId": session_id,
                    "agent": "claude",
                    "hookName": "Stop",
                    "payload": "***not base64***",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
