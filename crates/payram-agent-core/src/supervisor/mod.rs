//! Process supervisor for the chat and MCP children.
//!
//! Each child runs under its own independent restart loop on a tokio
//! task. The loop launches the configured binary with injected
//! environment, pipes stdout and stderr line-by-line into a bounded ring
//! buffer, and waits for one of three events: process exit, a forced
//! restart, or parent cancellation.
//!
//! Crash restarts use exponential backoff starting at `initial_backoff`,
//! doubling per rapid exit and capping at `max_backoff`; a run that
//! outlives `max_backoff` resets the backoff, as does a forced restart.
//! Termination is always SIGTERM, a bounded wait, then SIGKILL.

mod ring_buffer;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use ring_buffer::RingBuffer;

use crate::config::AgentConfig;
use crate::layout::AgentPaths;
use crate::secrets::{SecretStore, OPENAI_KEY_ENV};

/// Name of the chat child.
pub const CHAT_COMPONENT: &str = "chat";

/// Name of the MCP child.
pub const MCP_COMPONENT: &str = "mcp";

const DEFAULT_BUFFER_LINES: usize = 200;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from supervisor construction and startup.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A child binary was not found at its default location.
    #[error("{component} binary not found at {}", path.display())]
    MissingBinary {
        /// Which child the binary belongs to.
        component: &'static str,
        /// The path that was probed.
        path: PathBuf,
    },

    /// `start` was called more than once on the same supervisor.
    #[error("supervisor already started")]
    AlreadyStarted,
}

/// The narrow capability the update controller consumes.
///
/// The supervisor owns its tasks exclusively; callers can only enqueue
/// restarts, never manage the child lifecycle directly.
pub trait RestartChildren: Send + Sync {
    /// Enqueues one forced restart per child, non-blocking; overlapping
    /// requests coalesce.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the restart cannot be
    /// enqueued.
    fn restart_all(&self) -> Result<(), String>;
}

/// Configuration for both child run loops.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the chat binary.
    pub chat_path: PathBuf,
    /// Arguments for the chat binary.
    pub chat_args: Vec<String>,
    /// Path to the MCP binary.
    pub mcp_path: PathBuf,
    /// Arguments for the MCP binary.
    pub mcp_args: Vec<String>,
    /// Log lines retained per child; zero selects the default of 200.
    pub buffer_lines: usize,
    /// First delay after a crash.
    pub initial_backoff: Duration,
    /// Backoff cap; also the healthy-runtime threshold that resets it.
    pub max_backoff: Duration,
    /// Wait after SIGTERM before SIGKILL.
    pub terminate_timeout: Duration,
    /// Port injected for the chat child when unset in the parent env.
    pub chat_port: u16,
    /// Port injected for the MCP child when unset in the parent env.
    pub mcp_port: u16,
    /// Home root for the secret-store key fallback.
    pub home: PathBuf,
}

impl SupervisorConfig {
    /// Resolves the configuration from the agent config and layout.
    ///
    /// Binary overrides are taken as-is; the default in-release paths are
    /// probed so a missing release surfaces at startup rather than as an
    /// endless crash loop.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::MissingBinary`] when a default binary
    /// path does not exist.
    pub fn resolve(config: &AgentConfig, paths: &AgentPaths) -> Result<Self, SupervisorError> {
        let chat_path = match &config.chat_bin {
            Some(path) => path.clone(),
            None => {
                let path = paths.default_chat_bin();
                if !path.exists() {
                    return Err(SupervisorError::MissingBinary {
                        component: CHAT_COMPONENT,
                        path,
                    });
                }
                path
            }
        };
        let mcp_path = match &config.mcp_bin {
            Some(path) => path.clone(),
            None => {
                let path = paths.default_mcp_bin();
                if !path.exists() {
                    return Err(SupervisorError::MissingBinary {
                        component: MCP_COMPONENT,
                        path,
                    });
                }
                path
            }
        };

        Ok(Self {
            chat_path,
            chat_args: Vec::new(),
            mcp_path,
            mcp_args: Vec::new(),
            buffer_lines: DEFAULT_BUFFER_LINES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            chat_port: config.chat_port,
            mcp_port: config.mcp_port,
            home: paths.home().to_path_buf(),
        })
    }

    fn normalized(mut self) -> Self {
        if self.initial_backoff.is_zero() {
            self.initial_backoff = DEFAULT_INITIAL_BACKOFF;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.terminate_timeout.is_zero() {
            self.terminate_timeout = DEFAULT_TERMINATE_TIMEOUT;
        }
        self
    }
}

/// The last exit of a child process.
#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    /// When the exit was recorded.
    pub time: DateTime<Utc>,

    /// Numeric exit code, when the wait status carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Textual reason for abnormal termination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExitInfo {
    fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) => {
                let exit_code = status.code();
                let error = if exit_code.is_none() {
                    use std::os::unix::process::ExitStatusExt;
                    status
                        .signal()
                        .map(|sig| format!("terminated by signal {sig}"))
                } else {
                    None
                };
                Self {
                    time: Utc::now(),
                    exit_code,
                    error,
                }
            }
            Err(err) => Self::from_error(&err),
        }
    }

    fn from_error(err: &dyn std::fmt::Display) -> Self {
        Self {
            time: Utc::now(),
            exit_code: None,
            error: Some(err.to_string()),
        }
    }

    fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match self.exit_code {
            Some(0) | None => "ok".to_string(),
            Some(code) => format!("code={code}"),
        }
    }
}

/// Snapshot of one child.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    /// Child name, `chat` or `mcp`.
    pub name: String,

    /// OS process id, zero when not running.
    pub pid: u32,

    /// When the current process started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// How many times the child has been restarted.
    pub restarts: u32,

    /// The most recent exit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitInfo>,
}

/// Snapshot of both children.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Per-child status, chat first.
    pub components: Vec<ComponentStatus>,
}

#[derive(Debug, Default)]
struct ChildRuntime {
    pid: u32,
    restarts: u32,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
}

struct ChildShared {
    name: &'static str,
    path: PathBuf,
    args: Vec<String>,
    port_var: &'static str,
    default_port: u16,
    secret_store: SecretStore,
    log_buf: RingBuffer,
    runtime: Mutex<ChildRuntime>,
    restart_tx: mpsc::Sender<()>,
    initial_backoff: Duration,
    max_backoff: Duration,
    terminate_timeout: Duration,
}

impl ChildShared {
    fn trigger_restart(&self) {
        // Single-slot channel: a second enqueue while one is pending is
        // dropped so overlapping requests coalesce into one restart.
        let _ = self.restart_tx.try_send(());
    }

    fn record_start(&self, pid: u32) {
        {
            let mut runtime = self.runtime.lock().expect("child runtime lock poisoned");
            runtime.pid = pid;
            runtime.started_at = Some(Utc::now());
        }
        self.log_buf
            .append(format!("[{}] started pid={pid}", self.name));
        debug!(component = self.name, pid, "child started");
    }

    fn record_exit(&self, info: ExitInfo, count_restart: bool) {
        let summary = info.summary();
        {
            let mut runtime = self.runtime.lock().expect("child runtime lock poisoned");
            runtime.pid = 0;
            runtime.last_exit = Some(info);
            if count_restart {
                runtime.restarts += 1;
            }
        }
        self.log_buf
            .append(format!("[{}] exited: {summary}", self.name));
        debug!(component = self.name, %summary, "child exited");
    }

    fn status(&self) -> ComponentStatus {
        let runtime = self.runtime.lock().expect("child runtime lock poisoned");
        ComponentStatus {
            name: self.name.to_string(),
            pid: runtime.pid,
            start_time: runtime.started_at,
            restarts: runtime.restarts,
            last_exit: runtime.last_exit.clone(),
        }
    }

    /// Computes the variables injected on top of the inherited parent
    /// environment: the child port default and the stored API key, each
    /// only when the parent environment does not already provide it.
    fn extra_env(&self, parent: &dyn Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        let mut extra = Vec::new();

        if parent(self.port_var).filter(|v| !v.is_empty()).is_none() {
            extra.push((self.port_var.to_string(), self.default_port.to_string()));
        }

        if parent(OPENAI_KEY_ENV).filter(|v| !v.is_empty()).is_none() {
            if let Ok(Some(key)) = self.secret_store.load_from_state() {
                extra.push((OPENAI_KEY_ENV.to_string(), key));
            }
        }

        extra
    }
}

/// Supervisor for the two child processes.
pub struct Supervisor {
    chat: Arc<ChildShared>,
    mcp: Arc<ChildShared>,
    receivers: Mutex<Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Builds a supervisor from its configuration.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let config = config.normalized();
        let secret_store = SecretStore::new(&AgentPaths::new(&config.home));

        let (chat, chat_rx) = new_child(
            CHAT_COMPONENT,
            config.chat_path.clone(),
            config.chat_args.clone(),
            "PAYRAM_CHAT_PORT",
            config.chat_port,
            secret_store.clone(),
            &config,
        );
        let (mcp, mcp_rx) = new_child(
            MCP_COMPONENT,
            config.mcp_path.clone(),
            config.mcp_args.clone(),
            "PAYRAM_MCP_PORT",
            config.mcp_port,
            secret_store,
            &config,
        );

        Self {
            chat,
            mcp,
            receivers: Mutex::new(Some((chat_rx, mcp_rx))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts both child run loops under `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyStarted`] on a second call.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let (chat_rx, mcp_rx) = self
            .receivers
            .lock()
            .expect("supervisor receivers lock poisoned")
            .take()
            .ok_or(SupervisorError::AlreadyStarted)?;

        let mut tasks = self.tasks.lock().expect("supervisor tasks lock poisoned");
        tasks.push(tokio::spawn(run_child(
            Arc::clone(&self.chat),
            chat_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_child(
            Arc::clone(&self.mcp),
            mcp_rx,
            cancel,
        )));

        Ok(())
    }

    /// Snapshot of both children, chat first.
    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            components: vec![self.chat.status(), self.mcp.status()],
        }
    }

    /// Returns the last `tail` lines for a child, or `None` for an
    /// unknown component name.
    #[must_use]
    pub fn logs(&self, component: &str, tail: usize) -> Option<Vec<String>> {
        match component {
            CHAT_COMPONENT => Some(self.chat.log_buf.tail(tail)),
            MCP_COMPONENT => Some(self.mcp.log_buf.tail(tail)),
            _ => None,
        }
    }

    /// Blocks until both child loops have exited.
    pub async fn wait(&self) {
        let tasks = {
            let mut guard = self.tasks.lock().expect("supervisor tasks lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "child supervision task panicked");
            }
        }
    }
}

impl RestartChildren for Supervisor {
    fn restart_all(&self) -> Result<(), String> {
        self.chat.trigger_restart();
        self.mcp.trigger_restart();
        Ok(())
    }
}

fn new_child(
    name: &'static str,
    path: PathBuf,
    args: Vec<String>,
    port_var: &'static str,
    default_port: u16,
    secret_store: SecretStore,
    config: &SupervisorConfig,
) -> (Arc<ChildShared>, mpsc::Receiver<()>) {
    let (restart_tx, restart_rx) = mpsc::channel(1);
    let child = Arc::new(ChildShared {
        name,
        path,
        args,
        port_var,
        default_port,
        secret_store,
        log_buf: RingBuffer::new(config.buffer_lines),
        runtime: Mutex::new(ChildRuntime::default()),
        restart_tx,
        initial_backoff: config.initial_backoff,
        max_backoff: config.max_backoff,
        terminate_timeout: config.terminate_timeout,
    });
    (child, restart_rx)
}

enum RunEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    ForceRestart,
    Cancelled,
}

async fn run_child(
    child: Arc<ChildShared>,
    mut restart_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut backoff = child.initial_backoff;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        // A restart requested while nothing was running is satisfied by
        // the launch below.
        while restart_rx.try_recv().is_ok() {}

        let mut cmd = Command::new(&child.path);
        cmd.args(&child.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in child.extra_env(&|key| std::env::var(key).ok()) {
            cmd.env(key, value);
        }

        let mut proc = match cmd.spawn() {
            Ok(proc) => proc,
            Err(err) => {
                child.record_exit(ExitInfo::from_error(&err), false);
                if !sleep_or_cancel(backoff, &cancel).await {
                    return;
                }
                backoff = next_backoff(backoff, child.max_backoff);
                continue;
            }
        };

        let pid = proc.id().unwrap_or_default();
        let started = Instant::now();
        child.record_start(pid);

        if let Some(stdout) = proc.stdout.take() {
            tokio::spawn(pipe_output(Arc::clone(&child), stdout, "stdout"));
        }
        if let Some(stderr) = proc.stderr.take() {
            tokio::spawn(pipe_output(Arc::clone(&child), stderr, "stderr"));
        }

        let event = tokio::select! {
            status = proc.wait() => RunEvent::Exited(status),
            _ = restart_rx.recv() => RunEvent::ForceRestart,
            () = cancel.cancelled() => RunEvent::Cancelled,
        };

        match event {
            RunEvent::Exited(status) => {
                child.record_exit(ExitInfo::from_wait(status), true);
                if started.elapsed() > child.max_backoff {
                    backoff = child.initial_backoff;
                }
                if !sleep_or_cancel(backoff, &cancel).await {
                    return;
                }
                backoff = next_backoff(backoff, child.max_backoff);
            }
            RunEvent::ForceRestart => {
                let info = terminate(&child, &mut proc).await;
                child.record_exit(info, true);
                backoff = child.initial_backoff;
            }
            RunEvent::Cancelled => {
                let info = terminate(&child, &mut proc).await;
                child.record_exit(info, false);
                return;
            }
        }
    }
}

/// SIGTERM, bounded wait, then SIGKILL and reap.
async fn terminate(child: &ChildShared, proc: &mut tokio::process::Child) -> ExitInfo {
    if let Some(pid) = proc.id() {
        #[allow(clippy::cast_possible_wrap)]
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match tokio::time::timeout(child.terminate_timeout, proc.wait()).await {
        Ok(status) => ExitInfo::from_wait(status),
        Err(_) => {
            let _ = proc.start_kill();
            ExitInfo::from_wait(proc.wait().await)
        }
    }
}

async fn pipe_output(
    child: Arc<ChildShared>,
    stream: impl tokio::io::AsyncRead + Unpin,
    tag: &'static str,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        child.log_buf.append(format!("[{}][{tag}] {line}", child.name));
    }
}

/// Sleeps for `duration` unless cancelled first; returns false on cancel.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(home: &std::path::Path) -> SupervisorConfig {
        SupervisorConfig {
            chat_path: PathBuf::from("/bin/sh"),
            chat_args: vec!["-c".to_string(), "exit 1".to_string()],
            mcp_path: PathBuf::from("/bin/sh"),
            mcp_args: vec!["-c".to_string(), "exit 1".to_string()],
            buffer_lines: 20,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            terminate_timeout: Duration::from_millis(200),
            chat_port: 2358,
            mcp_port: 3333,
            home: home.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn crashing_children_restart_with_bounded_backoff() {
        let home = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(home.path()));

        let cancel = CancellationToken::new();
        sup.start(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(180)).await;
        cancel.cancel();
        sup.wait().await;

        let status = sup.status();
        assert_eq!(status.components.len(), 2);
        for component in &status.components {
            assert!(
                (1..=5).contains(&component.restarts),
                "{} restarts out of range: {}",
                component.name,
                component.restarts
            );
            let last_exit = component.last_exit.as_ref().expect("exit recorded");
            // The final exit may be the SIGTERM from cancellation if it
            // races a fresh launch; otherwise it is the crash itself.
            assert!(last_exit.exit_code == Some(1) || last_exit.error.is_some());
        }
    }

    #[tokio::test]
    async fn start_is_single_shot() {
        let home = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(home.path()));

        let cancel = CancellationToken::new();
        sup.start(cancel.clone()).unwrap();
        assert!(matches!(
            sup.start(cancel.clone()),
            Err(SupervisorError::AlreadyStarted)
        ));

        cancel.cancel();
        sup.wait().await;
    }

    #[tokio::test]
    async fn forced_restart_replaces_a_running_child() {
        let home = tempfile::tempdir().unwrap();
        let mut config = test_config(home.path());
        config.chat_args = vec!["-c".to_string(), "sleep 30".to_string()];
        config.mcp_args = vec!["-c".to_string(), "sleep 30".to_string()];
        let sup = Supervisor::new(config);

        let cancel = CancellationToken::new();
        sup.start(cancel.clone()).unwrap();

        // Let both children come up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = sup.status();
        let old_pid = before.components[0].pid;
        assert!(old_pid > 0);

        sup.restart_all().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let after = sup.status();
        assert!(after.components[0].restarts >= 1);
        assert!(after.components[0].pid > 0);
        assert_ne!(after.components[0].pid, old_pid);

        cancel.cancel();
        sup.wait().await;
    }

    #[tokio::test]
    async fn stdout_and_stderr_lines_reach_the_ring_buffer() {
        let home = tempfile::tempdir().unwrap();
        let mut config = test_config(home.path());
        config.chat_args = vec![
            "-c".to_string(),
            "echo out-line; echo err-line 1>&2; sleep 30".to_string(),
        ];
        config.mcp_args = vec!["-c".to_string(), "sleep 30".to_string()];
        let sup = Supervisor::new(config);

        let cancel = CancellationToken::new();
        sup.start(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let lines = sup.logs(CHAT_COMPONENT, 20).unwrap();
        assert!(lines.iter().any(|l| l == "[chat][stdout] out-line"), "{lines:?}");
        assert!(lines.iter().any(|l| l == "[chat][stderr] err-line"), "{lines:?}");
        assert!(lines.iter().any(|l| l.starts_with("[chat] started pid=")));

        cancel.cancel();
        sup.wait().await;
    }

    #[tokio::test]
    async fn unknown_component_logs_are_none() {
        let home = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(home.path()));
        assert!(sup.logs("nope", 10).is_none());
        assert_eq!(sup.logs(CHAT_COMPONENT, 10), Some(Vec::new()));
    }

    #[test]
    fn extra_env_injects_port_only_when_absent() {
        let home = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(home.path()));

        let extra = sup.chat.extra_env(&|_| None);
        assert!(extra.contains(&("PAYRAM_CHAT_PORT".to_string(), "2358".to_string())));

        let extra = sup.chat.extra_env(&|key| {
            (key == "PAYRAM_CHAT_PORT").then(|| "9000".to_string())
        });
        assert!(extra.iter().all(|(k, _)| k != "PAYRAM_CHAT_PORT"));
    }

    #[test]
    fn extra_env_prefers_parent_openai_key_over_store() {
        let home = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(home.path()));

        let store = SecretStore::new(&AgentPaths::new(home.path()));
        store.put_openai_key("sk-stored").unwrap();

        // Parent env has the key: nothing is injected.
        let extra = sup
            .chat
            .extra_env(&|key| (key == OPENAI_KEY_ENV).then(|| "sk-parent".to_string()));
        assert!(extra.iter().all(|(k, _)| k != OPENAI_KEY_ENV));

        // Parent env lacks the key: the stored key is the fallback.
        let extra = sup.chat.extra_env(&|_| None);
        assert!(extra.contains(&(OPENAI_KEY_ENV.to_string(), "sk-stored".to_string())));
    }

    #[test]
    fn exit_summary_formats() {
        let ok = ExitInfo {
            time: Utc::now(),
            exit_code: Some(0),
            error: None,
        };
        assert_eq!(ok.summary(), "ok");

        let code = ExitInfo {
            time: Utc::now(),
            exit_code: Some(3),
            error: None,
        };
        assert_eq!(code.summary(), "code=3");

        let err = ExitInfo {
            time: Utc::now(),
            exit_code: None,
            error: Some("terminated by signal 9".to_string()),
        };
        assert_eq!(err.summary(), "terminated by signal 9");
    }
}
