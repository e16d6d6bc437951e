//! Container executor
//!
//! Runs one stage per freshly created, auto-removed container:
//! - Probing the container runtime, with an explicit simulation fallback
//! - Streaming stdout/stderr incrementally to subscribers
//! - Enforcing the stage timeout with a forced kill
//! - Removing the container on every exit path
//! - Sweeping orphaned containers left behind by crashes

mod output;
mod runtime;

pub use output::{LogChunk, OutputStream};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, RuntimeMode};
use crate::error::ExecutorError;
use output::OutputBuffer;

/// Exit code reported for a stage killed by its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for a stage killed through [`ContainerExecutor::kill`]
pub const KILLED_EXIT_CODE: i32 = 137;

/// What to run for one stage
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub image: String,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// `None` waits for the process indefinitely
    pub timeout: Option<Duration>,
}

/// Outcome of one stage invocation
///
/// Infrastructure problems (spawn failure, timeout, kill) are reported here
/// as failures, never as errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub container_id: String,
    pub error: Option<String>,
    /// Set when no container was started because the runtime is unavailable
    pub simulated: bool,
}

impl ExecutionResult {
    fn failed(container_id: String, exit_code: i32, error: String, duration: Duration) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            container_id,
            error: Some(error),
            simulated: false,
        }
    }

    /// Stdout, stderr and error text as stored in a stage run's logs
    pub fn combined_logs(&self) -> String {
        let mut logs = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str("[stderr]\n");
            logs.push_str(&self.stderr);
        }
        if let Some(error) = &self.error {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str("[error] ");
            logs.push_str(error);
        }
        logs
    }
}

/// Runs a stage's commands in isolation
///
/// The seam between the orchestrator and the container runtime.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run_in_container(&self, stage_name: &str, options: ExecutionOptions)
    -> ExecutionResult;
}

/// Live container tracked for out-of-band kill and the orphan sweep
struct ContainerHandle {
    stage: String,
    started_at: Instant,
    kill: CancellationToken,
}

/// Removes a container from the handle map however the run ends
struct HandleGuard<'a> {
    handles: &'a Mutex<HashMap<String, ContainerHandle>>,
    name: String,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

enum Exit {
    Completed(std::io::Result<std::process::ExitStatus>),
    TimedOut(Duration),
    Killed,
}

/// Container executor backed by a podman/docker compatible CLI
pub struct ContainerExecutor {
    config: ExecutorConfig,
    handles: Mutex<HashMap<String, ContainerHandle>>,
    runtime_available: OnceCell<bool>,
    simulation_announced: AtomicBool,
    logs: broadcast::Sender<LogChunk>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let (logs, _) = broadcast::channel(1024);

        Self {
            config,
            handles: Mutex::new(HashMap::new()),
            runtime_available: OnceCell::new(),
            simulation_announced: AtomicBool::new(false),
            logs,
            sweep_task: Mutex::new(None),
        }
    }

    /// Whether stages run in real containers
    ///
    /// In auto mode the runtime is probed once and the answer cached.
    pub async fn runtime_available(&self) -> bool {
        match self.config.mode {
            RuntimeMode::Container => true,
            RuntimeMode::Simulated => false,
            RuntimeMode::Auto => *self
                .runtime_available
                .get_or_init(|| runtime::probe(&self.config.runtime_binary))
                .await,
        }
    }

    /// Subscribes to live output of every stage container
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogChunk> {
        self.logs.subscribe()
    }

    /// Names of the containers currently running
    pub fn tracked_containers(&self) -> Vec<String> {
        self.lock_handles().keys().cloned().collect()
    }

    /// Forces a running container down through the timeout path
    ///
    /// Returns false when no container with that name is tracked.
    pub fn kill(&self, name: &str) -> bool {
        match self.lock_handles().get(name) {
            Some(handle) => {
                info!(
                    "Killing container {} (stage '{}', running for {:?})",
                    name,
                    handle.stage,
                    handle.started_at.elapsed()
                );
                handle.kill.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes containers carrying this executor's prefix that are not tracked
    ///
    /// Returns the number of containers removed.
    pub async fn sweep_orphans(&self) -> Result<usize, ExecutorError> {
        if !self.runtime_available().await {
            return Ok(0);
        }

        let names =
            runtime::list_managed(&self.config.runtime_binary, &self.config.name_prefix).await?;

        // Snapshot after listing: every container listed was tracked before it existed
        let tracked: HashSet<String> = self.lock_handles().keys().cloned().collect();

        let mut removed = 0;
        for name in names.into_iter().filter(|name| !tracked.contains(name)) {
            info!("Removing orphaned container {}", name);
            match runtime::force_remove(&self.config.runtime_binary, &name).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", name, e),
            }
        }

        Ok(removed)
    }

    /// Starts the periodic orphan sweep
    pub fn start_orphan_sweep(self: &Arc<Self>) {
        let executor = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(executor) = executor.upgrade() else {
                    break;
                };

                match executor.sweep_orphans().await {
                    Ok(0) => debug!("Orphan sweep found nothing to remove"),
                    Ok(removed) => info!("Orphan sweep removed {} container(s)", removed),
                    Err(e) => warn!("Orphan sweep failed: {}", e),
                }
            }
        });

        let previous = self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the sweep and force-kills every tracked container
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let tracked: Vec<(String, CancellationToken)> = self
            .lock_handles()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.kill.clone()))
            .collect();

        for (name, kill) in &tracked {
            kill.cancel();
            runtime::kill(&self.config.runtime_binary, name).await;
            if let Err(e) = runtime::force_remove(&self.config.runtime_binary, name).await {
                warn!("Failed to remove container {} during shutdown: {}", name, e);
            }
        }

        info!(
            "Container executor shut down ({} container(s) killed)",
            tracked.len()
        );
    }

    async fn run_with_runtime(
        &self,
        stage_name: &str,
        name: String,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let binary = &self.config.runtime_binary;
        let started = Instant::now();

        info!(
            stage = stage_name,
            container = %name,
            image = %options.image,
            timeout_secs = ?options.timeout.map(|t| t.as_secs()),
            "Starting stage container"
        );

        // Tracked before it exists so the orphan sweep never sees it untracked
        let kill = CancellationToken::new();
        let guard = self.track(&name, stage_name, kill.clone());

        let spawned = Command::new(binary)
            .args(runtime::run_args(&name, &options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start container {} for stage '{}': {}", name, stage_name, e);
                return ExecutionResult::failed(
                    name,
                    -1,
                    format!("Failed to start container: {}", e),
                    started.elapsed(),
                );
            }
        };

        let (tx, mut rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            output::spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output::spawn_reader(stderr, OutputStream::Stderr, tx.clone());
        }
        drop(tx);

        let mut stdout = OutputBuffer::default();
        let mut stderr = OutputBuffer::default();

        let timeout = options.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let exit = loop {
            tokio::select! {
                Some((stream, data)) = rx.recv() => {
                    self.collect(&name, stage_name, stream, data, &mut stdout, &mut stderr);
                }
                status = child.wait() => break Exit::Completed(status),
                limit = &mut deadline => break Exit::TimedOut(limit),
                _ = kill.cancelled() => break Exit::Killed,
            }
        };
        let duration = started.elapsed();

        if matches!(exit, Exit::TimedOut(_) | Exit::Killed) {
            warn!("Force-killing container {} (stage '{}')", name, stage_name);
            if let Err(e) = child.start_kill() {
                debug!("Runtime process for {} already gone: {}", name, e);
            }
            runtime::kill(binary, &name).await;
        }

        // Whatever the readers still hold; a killed process may keep pipes open
        let drain_deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some((stream, data))) => {
                    self.collect(&name, stage_name, stream, data, &mut stdout, &mut stderr);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("Stopped draining output of {} after {:?}", name, self.config.drain_timeout);
                    break;
                }
            }
        }

        // --rm already covers a clean exit; removal errors never skip the result
        if let Err(e) = runtime::force_remove(binary, &name).await {
            warn!("Failed to remove container {}: {}", name, e);
        }
        drop(guard);

        let (success, exit_code, error) = match exit {
            Exit::Completed(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                let error =
                    (!status.success()).then(|| format!("Container exited with code {}", code));
                (status.success(), code, error)
            }
            Exit::Completed(Err(e)) => (false, -1, Some(format!("Failed to wait for container: {}", e))),
            Exit::TimedOut(limit) => (
                false,
                TIMEOUT_EXIT_CODE,
                Some(format!("Stage timed out after {}s", limit.as_secs())),
            ),
            Exit::Killed => (false, KILLED_EXIT_CODE, Some("Container was killed".to_string())),
        };

        info!(
            stage = stage_name,
            container = %name,
            exit_code,
            success,
            duration_ms = duration.as_millis() as u64,
            "Stage container finished"
        );

        ExecutionResult {
            success,
            exit_code,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            duration,
            container_id: name,
            error,
            simulated: false,
        }
    }

    fn simulate(&self, stage_name: &str, name: String, options: &ExecutionOptions) -> ExecutionResult {
        if !self.simulation_announced.swap(true, Ordering::Relaxed) {
            warn!(
                "Container runtime `{}` is not available, stages run in SIMULATED mode",
                self.config.runtime_binary
            );
        }
        info!(stage = stage_name, container = %name, "[SIMULATED] Executing stage");

        let mut stdout = String::from("[SIMULATED] Container runtime not available, no container was started\n");
        stdout.push_str(&format!("[SIMULATED] Image: {}\n", options.image));
        for command in &options.commands {
            stdout.push_str(&format!("[SIMULATED] $ {}\n", command));
        }
        stdout.push_str(&format!("[SIMULATED] Stage '{}' completed successfully\n", stage_name));

        self.emit(&name, stage_name, OutputStream::Stdout, stdout.clone());

        ExecutionResult {
            success: true,
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration: Duration::ZERO,
            container_id: name,
            error: None,
            simulated: true,
        }
    }

    fn collect(
        &self,
        name: &str,
        stage: &str,
        stream: OutputStream,
        data: String,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) {
        match stream {
            OutputStream::Stdout => stdout.push(&data),
            OutputStream::Stderr => stderr.push(&data),
        }
        self.emit(name, stage, stream, data);
    }

    fn emit(&self, name: &str, stage: &str, stream: OutputStream, data: String) {
        // No subscribers is fine
        let _ = self.logs.send(LogChunk {
            container: name.to_string(),
            stage: stage.to_string(),
            stream,
            data,
        });
    }

    fn track(&self, name: &str, stage: &str, kill: CancellationToken) -> HandleGuard<'_> {
        self.lock_handles().insert(
            name.to_string(),
            ContainerHandle {
                stage: stage.to_string(),
                started_at: Instant::now(),
                kill,
            },
        );

        HandleGuard {
            handles: &self.handles,
            name: name.to_string(),
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, ContainerHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `<prefix>-<stage slug>-<random>`
    fn container_name(&self, stage_name: &str) -> String {
        let slug: String = stage_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .take(32)
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "stage" } else { slug };

        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.config.name_prefix, slug, &suffix[..12])
    }
}

#[async_trait]
impl StageExecutor for ContainerExecutor {
    async fn run_in_container(
        &self,
        stage_name: &str,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let name = self.container_name(stage_name);

        if !self.runtime_available().await {
            return self.simulate(stage_name, name, &options);
        }

        self.run_with_runtime(stage_name, name, options).await
    }
}

impl Drop for ContainerExecutor {
    fn drop(&mut self) {
        if let Some(task) = self
            .sweep_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(commands: &[&str], timeout: Option<Duration>) -> ExecutionOptions {
        ExecutionOptions {
            image: "alpine:latest".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_simulated_mode_is_labeled() {
        let executor = ContainerExecutor::new(ExecutorConfig {
            mode: RuntimeMode::Simulated,
            ..ExecutorConfig::default()
        });

        let result = executor
            .run_in_container("build", options(&["make"], None))
            .await;

        assert!(result.success);
        assert!(result.simulated);
        assert!(result.stdout.contains("[SIMULATED] $ make"));
        assert!(result.container_id.starts_with("comet-build-"));
        assert!(executor.tracked_containers().is_empty());
    }

    #[tokio::test]
    async fn test_auto_mode_falls_back_when_runtime_missing() {
        let executor = ContainerExecutor::new(ExecutorConfig {
            runtime_binary: "/nonexistent/comet-runtime".to_string(),
            mode: RuntimeMode::Auto,
            ..ExecutorConfig::default()
        });

        assert!(!executor.runtime_available().await);
        let result = executor.run_in_container("test", options(&["true"], None)).await;
        assert!(result.success);
        assert!(result.simulated);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_failed_result() {
        let executor = ContainerExecutor::new(ExecutorConfig {
            runtime_binary: "/nonexistent/comet-runtime".to_string(),
            mode: RuntimeMode::Container,
            ..ExecutorConfig::default()
        });

        let result = executor.run_in_container("build", options(&["make"], None)).await;

        assert!(!result.success);
        assert!(!result.simulated);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("Failed to start container"));
        assert!(executor.tracked_containers().is_empty());
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let executor = ContainerExecutor::new(ExecutorConfig::default());
        let name = executor.container_name("Unit Tests (fast)");

        assert!(name.starts_with("comet-unit-tests--fast-"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        );
        assert_ne!(name, executor.container_name("Unit Tests (fast)"));
    }

    #[test]
    fn test_combined_logs() {
        let result = ExecutionResult {
            success: false,
            exit_code: 2,
            stdout: "building".to_string(),
            stderr: "boom\n".to_string(),
            duration: Duration::ZERO,
            container_id: "c".to_string(),
            error: Some("Container exited with code 2".to_string()),
            simulated: false,
        };

        assert_eq!(
            result.combined_logs(),
            "building\n[stderr]\nboom\n[error] Container exited with code 2"
        );
    }

    #[cfg(unix)]
    mod fake_runtime {
        use super::*;
        use std::path::{Path, PathBuf};
        use std::sync::OnceLock;

        /// Shell script standing in for podman: `run` executes the script
        /// argument locally, `ps` prints `ps.out`, every call is appended to
        /// `calls.log`.
        const SCRIPT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
echo "$*" >> "$dir/calls.log"
case "$1" in
  info) exit 0 ;;
  run) eval "script=\${$#}"; exec /bin/sh -c "$script" ;;
  ps) cat "$dir/ps.out" 2>/dev/null; exit 0 ;;
  *) exit 0 ;;
esac
"#;

        fn runtime_dir() -> &'static Path {
            static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
            DIR.get_or_init(|| {
                use std::os::unix::fs::PermissionsExt;

                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("fake-runtime");
                std::fs::write(&path, SCRIPT).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                dir
            })
            .path()
        }

        fn runtime_path() -> PathBuf {
            runtime_dir().join("fake-runtime")
        }

        fn calls() -> String {
            std::fs::read_to_string(runtime_dir().join("calls.log")).unwrap_or_default()
        }

        fn executor(prefix: &str) -> Arc<ContainerExecutor> {
            Arc::new(ContainerExecutor::new(ExecutorConfig {
                runtime_binary: runtime_path().to_string_lossy().into_owned(),
                mode: RuntimeMode::Container,
                name_prefix: prefix.to_string(),
                sweep_interval: Duration::from_secs(60),
                drain_timeout: Duration::from_millis(200),
            }))
        }

        #[tokio::test]
        async fn test_successful_stage_is_removed() {
            let executor = executor("ok");
            let mut logs = executor.subscribe_logs();

            let result = executor
                .run_in_container("build", options(&["echo hello", "echo world >&2"], None))
                .await;

            assert!(result.success, "{:?}", result);
            assert_eq!(result.exit_code, 0);
            assert!(result.stdout.contains("hello"));
            assert!(result.stderr.contains("world"));
            assert!(executor.tracked_containers().is_empty());
            assert!(calls().contains(&format!("rm -f {}", result.container_id)));

            let mut forwarded = String::new();
            while let Ok(chunk) = logs.try_recv() {
                assert_eq!(chunk.container, result.container_id);
                forwarded.push_str(&chunk.data);
            }
            assert!(forwarded.contains("hello"));
        }

        #[tokio::test]
        async fn test_non_zero_exit_is_reported() {
            let executor = executor("fail");

            let result = executor
                .run_in_container("test", options(&["echo partial", "exit 3"], None))
                .await;

            assert!(!result.success);
            assert_eq!(result.exit_code, 3);
            assert!(result.stdout.contains("partial"));
            assert!(result.error.unwrap().contains("code 3"));
            assert!(executor.tracked_containers().is_empty());
        }

        #[tokio::test]
        async fn test_timeout_kills_and_removes_container() {
            let executor = executor("slow");
            let started = Instant::now();

            let result = executor
                .run_in_container("deploy", options(&["sleep 10"], Some(Duration::from_secs(1))))
                .await;

            assert!(!result.success);
            assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
            assert!(result.error.unwrap().contains("timed out"));
            assert!(result.duration >= Duration::from_secs(1));
            assert!(result.duration < Duration::from_secs(5));
            assert!(started.elapsed() < Duration::from_secs(6));
            assert!(executor.tracked_containers().is_empty());

            let calls = calls();
            assert!(calls.contains(&format!("kill {}", result.container_id)));
            assert!(calls.contains(&format!("rm -f {}", result.container_id)));
        }

        #[tokio::test]
        async fn test_explicit_kill() {
            let executor = executor("kill");
            let runner = Arc::clone(&executor);
            let task = tokio::spawn(async move {
                runner
                    .run_in_container("approval", options(&["sleep 10"], None))
                    .await
            });

            let mut name = None;
            for _ in 0..250 {
                if let Some(tracked) = executor.tracked_containers().pop() {
                    name = Some(tracked);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let name = name.expect("container never started");

            assert!(executor.kill(&name));
            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();

            assert!(!result.success);
            assert_eq!(result.exit_code, KILLED_EXIT_CODE);
            assert!(executor.tracked_containers().is_empty());
            assert!(!executor.kill(&name));
        }

        #[tokio::test]
        async fn test_sweep_removes_untracked_containers() {
            std::fs::write(
                runtime_dir().join("ps.out"),
                "sweep-orphan-1\nunrelated-container\nsweeper-other\n",
            )
            .unwrap();
            let executor = executor("sweep");

            let removed = executor.sweep_orphans().await.unwrap();

            assert_eq!(removed, 1);
            let calls = calls();
            assert!(calls.contains("rm -f sweep-orphan-1"));
            assert!(!calls.contains("rm -f unrelated-container"));
            assert!(!calls.contains("rm -f sweeper-other"));
        }
    }
}
