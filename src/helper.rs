//! Session-scoped helper (`agent-worker hook` / `agent-worker plan`)
//!
//! Agents run the helper as their hook or plan command. It reads whatever the
//! agent wrote to stdin, finds the owning worker through the environment the
//! driver injected, and forwards the call to the CTL listener. Any missing
//! variable or failed call is an error so the binary exits non-zero.

use crate::driver::env;
use crate::error::{Error, Result};
use crate::rpc::{HookRequest, PlanRequest, HOOKS_PATH, PLANS_PATH};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default deadline for one CTL call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback coordinates injected into the agent's environment
pub struct HelperEnv {
    pub ctl_url: String,
    pub token: Zeroizing<String>,
    pub run_id: String,
    pub session_id: String,
    pub agent: String,
}

impl HelperEnv {
    /// Reads only the five contract variables; unrelated non-UTF-8 entries are ignored
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| -> Result<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{} is not set", name)))
        };
        Ok(Self {
            ctl_url: get(env::CTL_URL)?,
            token: Zeroizing::new(get(env::CTL_TOKEN)?),
            run_id: get(env::RUN_ID)?,
            session_id: get(env::SESSION_ID)?,
            agent: get(env::AGENT)?,
        })
    }
}

impl std::fmt::Debug for HelperEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperEnv")
            .field("ctl_url", &self.ctl_url)
            .field("run_id", &self.run_id)
            .field("session_id", &self.session_id)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

/// HTTP client for the CTL listener
pub struct CtlClient {
    http: reqwest::Client,
    env: HelperEnv,
}

impl CtlClient {
    pub fn new(env: HelperEnv, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, env })
    }

    pub async fn report_hook(&self, hook_name: &str, payload: &[u8]) -> Result<()> {
        let body = HookRequest {
            session_id: self.env.session_id.clone(),
            agent: self.env.agent.clone(),
            hook_name: hook_name.to_string(),
            payload: STANDARD.encode(payload),
        };
        self.post(HOOKS_PATH, &body).await
    }

    pub async fn submit_plan(&self, plan: &str) -> Result<()> {
        let body = PlanRequest {
            session_id: self.env.session_id.clone(),
            plan: plan.to_string(),
        };
        self.post(PLANS_PATH, &body).await
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.env.ctl_url.trim_end_matches('/'), path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.env.token.as_str())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        Err(match status.as_u16() {
            401 => Error::Authentication,
            404 => Error::NotFound(detail),
            503 => Error::Busy(detail),
            _ => Error::Internal(format!("CTL call {} failed: {}", path, detail)),
        })
    }
}

/// Plan text from an `ExitPlanMode` hook payload, else the input itself
pub fn extract_plan(input: &str) -> String {
    serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| {
            v.pointer("/tool_input/plan")
                .or_else(|| v.get("plan"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| input.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::RunManager;
    use crate::rpc::ctl_router;
    use crate::run::{AgentKind, RunSpec, RunStatus};
    use crate::secret::CtlSecret;
    use crate::testing::{test_manager, FakeDriver};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_env(url: &str, token: &str, session: &str) -> HashMap<String, String> {
        vars(&[
            (env::CTL_URL, url),
            (env::CTL_TOKEN, token),
            (env::RUN_ID, "run-1"),
            (env::SESSION_ID, session),
            (env::AGENT, "claude"),
        ])
    }

    #[test]
    fn test_missing_variable_is_error() {
        let mut map = full_env("http://127.0.0.1:1", "t", "s");
        map.remove(env::CTL_TOKEN);
        let err = HelperEnv::from_map(&map).unwrap_err();
        assert!(err.to_string().contains(env::CTL_TOKEN));

        let mut map = full_env("http://127.0.0.1:1", "t", "s");
        map.insert(env::SESSION_ID.to_string(), "  ".to_string());
        assert!(HelperEnv::from_map(&map).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_from_env_ignores_non_utf8_neighbours() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var(
            "AGENT_WORKER_TEST_BINARY",
            OsStr::from_bytes(&[0x66, 0x6f, 0x80, 0xff]),
        );
        let err = HelperEnv::from_env().unwrap_err();
        std::env::remove_var("AGENT_WORKER_TEST_BINARY");
        assert!(matches!(err, Error::Config(msg) if msg.contains(env::CTL_URL)));
    }

    #[test]
    fn test_debug_hides_token() {
        let env = HelperEnv::from_map(&full_env("http://x", "very-secret", "s")).unwrap();
        assert!(!format!("{:?}", env).contains("very-secret"));
    }

    #[test]
    fn test_extract_plan() {
        let hook = r##"{"tool_name":"ExitPlanMode","tool_input":{"plan":"# Plan\n1. a"}}"##;
        assert_eq!(extract_plan(hook), "# Plan\n1. a");
        assert_eq!(extract_plan("{\"plan\":\"p\"}"), "p");
        assert_eq!(extract_plan("  just text\n"), "just text");
    }

    async fn serve_ctl(manager: RunManager, secret: Arc<CtlSecret>) -> (String, CancellationToken) {
        let listener = crate::listener::BoundListener::ctl().await.unwrap();
        let url = listener.base_url();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.serve(ctl_router(manager, secret), shutdown.clone()));
        (url, shutdown)
    }

    #[tokio::test]
    async fn test_round_trip_through_ctl_listener() {
        let (manager, _) = test_manager(vec![FakeDriver::new(AgentKind::Claude)]);
        let secret = Arc::new(CtlSecret::generate());
        let (url, shutdown) = serve_ctl(manager.clone(), secret.clone()).await;

        let run = manager
            .create_run(RunSpec {
                thread_id: "t".to_string(),
                prompt: "p".to_string(),
                agent: "claude".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.reconcile_once().await.unwrap();
        let mut session_id = String::new();
        for _ in 0..200 {
            let current = manager.get_run(&run.id).await.unwrap();
            if current.status == RunStatus::Running {
                session_id = current.session_id;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session_id.is_empty());

        let mut events = manager.subscribe();
        let env = HelperEnv::from_map(&full_env(&url, secret.as_str(), &session_id)).unwrap();
        let client = CtlClient::new(env, DEFAULT_TIMEOUT).unwrap();
        client.report_hook("Stop", b"{}").await.unwrap();
        client.submit_plan("1. ship").await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.label(), "hook");
        let second = events.recv().await.unwrap();
        assert_eq!(second.label(), "plan");

        let bad = HelperEnv::from_map(&full_env(&url, "wrong-token", &session_id)).unwrap();
        let err = CtlClient::new(bad, DEFAULT_TIMEOUT)
            .unwrap()
            .report_hook("Stop", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication));

        let stale = HelperEnv::from_map(&full_env(&url, secret.as_str(), "gone")).unwrap();
        let err = CtlClient::new(stale, DEFAULT_TIMEOUT)
            .unwrap()
            .submit_plan("x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_listener_is_error() {
        let env = HelperEnv::from_map(&full_env("http://127.0.0.1:1", "t", "s")).unwrap();
        let client = CtlClient::new(env, Duration::from_secs(2)).unwrap();
        assert!(client.report_hook("Stop", b"").await.is_err());
    }
}
