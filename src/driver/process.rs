//! Child process plumbing shared by every driver
//!
//! [`spawn`] starts an agent CLI with the callback environment injected and
//! the public secret scrubbed. [`supervise`] turns the running child into a
//! [`Session`]: it feeds stdout frames through a [`StreamDecoder`], keeps a
//! stderr tail for fault reports, and owns the kill path.

use super::{env, AgentEvent, Session, SessionControl, SessionExit};
use crate::error::{Error, Result};
use crate::run::AgentKind;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Lines of stderr kept for fault messages
const STDERR_TAIL_LINES: usize = 50;

/// Buffered agent events per session
const EVENT_BUFFER: usize = 256;

/// Upper bound on reading the rest of stderr after exit
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// A process to start
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Pipe stdin (protocol agents) instead of `/dev/null`
    pub piped_stdin: bool,
}

/// Handles of a freshly spawned child
pub struct Spawned {
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: tokio::process::ChildStdout,
    pub stderr: tokio::process::ChildStderr,
}

/// Start an agent process
pub fn spawn(spec: &ProcessSpec, run_id: &str, agent: AgentKind) -> Result<Spawned> {
    if !spec.workdir.is_dir() {
        return Err(Error::launch(
            run_id,
            agent,
            format!("working directory {} does not exist", spec.workdir.display()),
        ));
    }

    tracing::info!(
        run_id = run_id,
        agent = %agent,
        program = %spec.program,
        cwd = %spec.workdir.display(),
        "Spawning agent CLI"
    );

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.workdir)
        .env_remove(env::PUBLIC_SECRET)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.piped_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::launch(run_id, agent, format!("failed to spawn {}: {}", spec.program, e)))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::launch(run_id, agent, "stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::launch(run_id, agent, "stderr not captured"))?;

    Ok(Spawned {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Forward every line of `reader` into a channel until EOF
pub fn read_lines<R>(reader: R) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Write queued lines to stdin; stdin closes once every sender is dropped
pub fn stdin_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!("Agent stdin closed: {}", e);
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

// =============================================================================
// Decoding
// =============================================================================

/// Terminal verdict carried by the event stream itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    Success,
    Failure(String),
}

/// Result of decoding one stdout frame
#[derive(Debug, Default)]
pub struct Decoded {
    pub events: Vec<AgentEvent>,
    /// Frames to write back on stdin
    pub replies: Vec<String>,
    pub finish: Option<Finish>,
}

impl Decoded {
    pub fn event(event: AgentEvent) -> Self {
        Self {
            events: vec![event],
            ..Default::default()
        }
    }
}

/// Agent-specific interpretation of stdout frames
pub trait StreamDecoder: Send + 'static {
    fn decode(&mut self, line: &str) -> Decoded;

    /// Drop stdin once a finish record is seen, so the agent exits
    fn close_stdin_on_finish(&self) -> bool {
        false
    }
}

// =============================================================================
// Supervision
// =============================================================================

/// Inputs of [`supervise`]
pub struct Supervised {
    pub run_id: String,
    pub session_id: String,
    pub agent: AgentKind,
    pub child: Child,
    pub frames: mpsc::Receiver<String>,
    pub stderr: tokio::process::ChildStderr,
    pub input: Option<mpsc::UnboundedSender<String>>,
    pub decoder: Box<dyn StreamDecoder>,
    pub terminate_grace: Duration,
}

struct ProcessControl {
    cancel: CancellationToken,
    stopped: watch::Receiver<bool>,
}

#[async_trait]
impl SessionControl for ProcessControl {
    async fn terminate(&self) {
        self.cancel.cancel();
        let mut stopped = self.stopped.clone();
        // Sender dropped means the supervisor already finished
        let _ = stopped.wait_for(|s| *s).await;
    }
}

/// Run the child under a supervisor task and hand back its session
pub fn supervise(sup: Supervised) -> Session {
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (stopped_tx, stopped_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let control = Arc::new(ProcessControl {
        cancel: cancel.clone(),
        stopped: stopped_rx,
    });
    let session_id = sup.session_id.clone();

    tokio::spawn(async move {
        let outcome = run_supervisor(sup, event_tx, cancel).await;
        let _ = outcome_tx.send(outcome);
        let _ = stopped_tx.send(true);
    });

    Session {
        id: session_id,
        events: event_rx,
        outcome: outcome_rx,
        control,
    }
}

async fn run_supervisor(
    sup: Supervised,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> SessionExit {
    let Supervised {
        run_id,
        session_id,
        agent,
        mut child,
        mut frames,
        stderr,
        mut input,
        mut decoder,
        terminate_grace,
    } = sup;

    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_task = tokio::spawn(collect_stderr_tail(stderr, tail.clone()));
    let mut finish: Option<Finish> = None;
    let mut terminated = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminated = true;
                break;
            }
            frame = frames.recv() => {
                let Some(line) = frame else { break };
                let decoded = decoder.decode(&line);
                for reply in decoded.replies {
                    if let Some(tx) = &input {
                        let _ = tx.send(reply);
                    }
                }
                for event in decoded.events {
                    let _ = event_tx.send(event).await;
                }
                if let Some(f) = decoded.finish {
                    if finish.is_none() {
                        finish = Some(f);
                    }
                    if decoder.close_stdin_on_finish() {
                        input = None;
                    }
                }
            }
        }
    }
    drop(input);

    let status = if terminated {
        stop_with_grace(&mut child, terminate_grace, &run_id).await;
        None
    } else {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => {
                terminated = true;
                stop_with_grace(&mut child, terminate_grace, &run_id).await;
                None
            }
        }
    };

    // Grandchildren may hold stderr open past the child's exit
    let stderr_abort = stderr_task.abort_handle();
    if tokio::time::timeout(STDERR_DRAIN, stderr_task).await.is_err() {
        stderr_abort.abort();
    }
    drop(event_tx);

    let outcome = if terminated {
        SessionExit::Terminated
    } else {
        match status {
            Some(Ok(status)) if status.success() => match finish {
                Some(Finish::Failure(msg)) => SessionExit::Failed(msg),
                _ => SessionExit::Completed,
            },
            Some(Ok(status)) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                SessionExit::Failed(fault_message(&code, &tail))
            }
            Some(Err(e)) => SessionExit::Failed(format!("failed to wait for agent: {}", e)),
            None => SessionExit::Terminated,
        }
    };

    tracing::info!(
        run_id = %run_id,
        session_id = %session_id,
        agent = %agent,
        outcome = ?outcome,
        "Agent session ended"
    );
    outcome
}

/// SIGTERM first so the agent can flush its session, SIGKILL after the grace period
async fn stop_with_grace(child: &mut Child, grace: Duration, run_id: &str) {
    tracing::info!(run_id = run_id, "Terminating agent process");
    if !send_terminate(child) {
        let _ = child.start_kill();
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(run_id = run_id, "Force killing agent process");
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we have not reaped yet
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    false
}

async fn collect_stderr_tail(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "agent_worker::agent_stderr", "{}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

fn fault_message(code: &str, tail: &Mutex<VecDeque<String>>) -> String {
    let stderr = tail
        .lock()
        .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();
    if stderr.trim().is_empty() {
        format!("agent exited with code {}", code)
    } else {
        format!("agent exited with code {}: {}", code, stderr.trim())
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Run a short-lived discovery command under a hard deadline, returning stdout
pub async fn probe(
    agent: AgentKind,
    program: &str,
    args: &[String],
    workdir: Option<&Path>,
    timeout: Duration,
) -> Result<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .env_remove(env::PUBLIC_SECRET)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(Error::discovery(agent, format!("failed to run {}: {}", program, e)));
        }
        Err(_) => {
            return Err(Error::discovery(
                agent,
                format!("{} timed out after {:?}", program, timeout),
            ));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::discovery(
            agent,
            format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
