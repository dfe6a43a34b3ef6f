//! Run events and the relay that fans them out
//!
//! Hook reports and plan submissions arrive through a bounded queue so the
//! CTL handler returns as soon as validation passes. A dispatcher task moves
//! queued events onto a broadcast channel that any number of subscribers
//! (the public event stream, tests) can read.

use crate::driver::AgentEvent;
use crate::error::{Error, Result};
use crate::run::{AgentKind, RunStatus};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc};

/// Broadcast backlog per subscriber before it starts lagging
const BROADCAST_CAPACITY: usize = 1024;

/// A hook fired inside an agent session
#[derive(Debug, Clone)]
pub struct HookReport {
    pub session_id: String,
    pub agent: AgentKind,
    pub hook_name: String,
    /// Opaque hook payload as the agent produced it
    pub payload: Vec<u8>,
}

/// A plan handed off by an agent
#[derive(Debug, Clone)]
pub struct PlanSubmission {
    pub session_id: String,
    pub plan: String,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Hook {
        name: String,
        #[serde(serialize_with = "as_base64")]
        payload: Vec<u8>,
    },
    Plan {
        text: String,
    },
    Output {
        event: AgentEvent,
    },
    Exited {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Relayed envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub session_id: String,
    pub agent: AgentKind,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(run_id: &str, session_id: &str, agent: AgentKind, kind: EventKind) -> Self {
        Self {
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
            agent,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Short label for logs and SSE event names
    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::Hook { .. } => "hook",
            EventKind::Plan { .. } => "plan",
            EventKind::Output { .. } => "output",
            EventKind::Exited { .. } => "exited",
        }
    }
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Bounded ingestion queue in front of a broadcast channel
pub struct EventRelay {
    queue: mpsc::Sender<RunEvent>,
    broadcast: broadcast::Sender<RunEvent>,
}

impl EventRelay {
    /// Must be called inside a Tokio runtime; spawns the dispatcher
    pub fn new(capacity: usize) -> Self {
        let (queue, mut rx) = mpsc::channel::<RunEvent>(capacity.max(1));
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        let fanout = broadcast.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(
                    run_id = %event.run_id,
                    session_id = %event.session_id,
                    kind = event.label(),
                    "Relaying event"
                );
                // No subscribers is not an error
                let _ = fanout.send(event);
            }
        });

        Self { queue, broadcast }
    }

    /// Enqueue without waiting; a full queue is reported as busy
    pub fn submit(&self, event: RunEvent) -> Result<()> {
        self.queue.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Busy("event relay queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::Internal("event relay is closed".to_string())
            }
        })
    }

    /// Publish directly to subscribers, bypassing the queue
    pub fn publish(&self, event: RunEvent) {
        let _ = self.broadcast.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.broadcast.subscribe()
    }
}
