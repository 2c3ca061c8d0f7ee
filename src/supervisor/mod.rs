//! Run supervision: one isolated worker process per run.
//!
//! The supervisor spawns workers (this binary's hidden `worker`
//! subcommand) in their own process group, drains their stdout with a
//! short poll tick, enforces a workload-derived deadline, and handles
//! cancellation with SIGTERM -> SIGKILL escalation. A run is only marked
//! `canceled` once the OS confirms the process dead. On startup, runs
//! persisted as active whose worker is gone are reclassified.
//!
//! Two invariants drive the locking scheme: process handles and the
//! cancellation-requested set live in separate locks, and neither lock is
//! ever held across process I/O.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{FetchConfig, PipelineConfig, StorageConfig, SupervisorConfig};
use crate::database::Database;
use crate::errors::{AppError, SupervisorError};
use crate::models::{Run, RunRequest, RunResult, RunStatus, Target, WorkerEvent};
use crate::progress::ProgressTracker;

/// Worker exit code signalling cooperative cancellation.
pub const EXIT_CODE_CANCELED: i32 = 3;

/// Seam for the scheduler loop: anything that can take a queued run and
/// get its worker going without blocking the caller.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Hand off a queued run; the worker is started asynchronously.
    async fn launch(&self, run: Run);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Stop,
    Timeout,
}

struct WorkerHandle {
    pid: u32,
}

#[derive(Clone)]
pub struct RunSupervisor {
    database: Database,
    progress: ProgressTracker,
    config: SupervisorConfig,
    storage: StorageConfig,
    fetch_config: FetchConfig,
    pipeline_config: PipelineConfig,
    processes: Arc<RwLock<HashMap<Uuid, WorkerHandle>>>,
    cancellations: Arc<RwLock<HashMap<Uuid, CancelReason>>>,
    logs: Arc<RwLock<HashMap<Uuid, VecDeque<String>>>>,
}

impl RunSupervisor {
    pub fn new(
        database: Database,
        progress: ProgressTracker,
        config: SupervisorConfig,
        storage: StorageConfig,
        fetch_config: FetchConfig,
        pipeline_config: PipelineConfig,
    ) -> Self {
        Self {
            database,
            progress,
            config,
            storage,
            fetch_config,
            pipeline_config,
            processes: Arc::new(RwLock::new(HashMap::new())),
            cancellations: Arc::new(RwLock::new(HashMap::new())),
            logs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Validate targets and create a queued run, then start its worker in
    /// the background.
    pub async fn trigger_run(
        &self,
        job_id: Option<Uuid>,
        targets: Vec<Target>,
    ) -> Result<Run, AppError> {
        if targets.is_empty() {
            return Err(AppError::validation("a run needs at least one target"));
        }
        for target in &targets {
            target
                .recipe
                .validate()
                .map_err(AppError::validation)?;
        }

        let run = self.database.create_run(job_id, &targets).await?;
        self.spawn_detached(run.clone());
        Ok(run)
    }

    /// Start a new run from a finished run's immutable request snapshot.
    /// The checkpoint files make it continue where the old one stopped.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<Run, AppError> {
        let run = self
            .database
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::not_found("run", run_id.to_string()))?;

        if !run.status.is_terminal() {
            return Err(SupervisorError::invalid_state(
                run_id.to_string(),
                run.status.to_string(),
                "resume",
            )
            .into());
        }

        let resumed = self.database.create_run(run.job_id, &run.request).await?;
        self.spawn_detached(resumed.clone());
        Ok(resumed)
    }

    pub async fn delete_run(&self, run_id: Uuid) -> Result<bool, AppError> {
        let run = self
            .database
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::not_found("run", run_id.to_string()))?;

        if run.status.is_active() {
            return Err(SupervisorError::invalid_state(
                run_id.to_string(),
                run.status.to_string(),
                "delete",
            )
            .into());
        }

        self.logs.write().await.remove(&run_id);
        Ok(self.database.delete_run(run_id).await?)
    }

    /// Start the run's worker in a background task; a failed spawn
    /// finalizes the run as failed rather than leaving it queued forever.
    fn spawn_detached(&self, run: Run) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let run_id = run.id;
            if let Err(e) = supervisor.start_run(run).await {
                error!("Failed to start run {}: {}", run_id, e);
                if let Err(db_err) = supervisor
                    .database
                    .finalize_run(run_id, RunStatus::Failed, None, Some(&e.to_string()))
                    .await
                {
                    error!("Failed to record spawn failure for {}: {}", run_id, db_err);
                }
            }
        });
    }

    /// Spawn the worker process for a queued run and begin monitoring it.
    pub async fn start_run(&self, run: Run) -> Result<(), AppError> {
        let run_id = run.id;
        let run_dir = self.storage.run_dir(run_id);
        let checkpoint_dir = self.storage.checkpoint_dir();
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| AppError::internal(format!("run dir creation failed: {e}")))?;
        tokio::fs::create_dir_all(&checkpoint_dir)
            .await
            .map_err(|e| AppError::internal(format!("checkpoint dir creation failed: {e}")))?;

        let result_path = run_dir.join("result.json");
        let request = RunRequest {
            run_id,
            targets: run.request.clone(),
            checkpoint_dir,
            result_path: result_path.clone(),
            fetch: self.fetch_config.clone(),
            pipeline: self.pipeline_config.clone(),
        };
        let request_path = run_dir.join("request.json");
        let request_json = serde_json::to_vec_pretty(&request)
            .map_err(|e| AppError::internal(format!("request serialization failed: {e}")))?;
        tokio::fs::write(&request_path, request_json)
            .await
            .map_err(|e| AppError::internal(format!("request write failed: {e}")))?;

        let exe = std::env::current_exe().map_err(|e| {
            SupervisorError::spawn_failed(run_id.to_string(), format!("no executable path: {e}"))
        })?;

        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--request")
            .arg(&request_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        // The worker gets its own process group so the stop signal reaches
        // everything it spawned.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::spawn_failed(run_id.to_string(), e.to_string()))?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::spawn_failed(run_id.to_string(), "worker exited before registration")
        })?;

        self.database.mark_run_running(run_id, pid as i64).await?;
        self.progress.begin_run(run_id).await;
        {
            self.processes
                .write()
                .await
                .insert(run_id, WorkerHandle { pid });
        }
        {
            self.logs.write().await.insert(run_id, VecDeque::new());
        }

        let deadline = workload_deadline(&run.request, &self.config);
        info!(
            "Run {} started: pid {}, {} target(s), deadline {}s",
            run_id,
            pid,
            run.request.len(),
            deadline.as_secs()
        );

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .monitor_worker(run_id, pid, child, result_path, deadline)
                .await;
        });
        Ok(())
    }

    /// Drain worker stdout and wait for exit, interleaving deadline checks
    /// on a short poll tick so stop requests and timeouts are honored
    /// promptly.
    async fn monitor_worker(
        &self,
        run_id: Uuid,
        pid: u32,
        mut child: Child,
        result_path: PathBuf,
        deadline: Duration,
    ) {
        let started = tokio::time::Instant::now();

        if let Some(stderr) = child.stderr.take() {
            let logs = self.logs.clone();
            let cap = self.config.log_buffer_lines;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_log(&logs, run_id, cap, format!("[stderr] {line}")).await;
                }
            });
        }

        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stdout_open = stdout_lines.is_some();
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut timed_out = false;

        let exit_status = loop {
            tokio::select! {
                line = async {
                    match stdout_lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                }, if stdout_open => {
                    match line {
                        Ok(Some(line)) => self.handle_worker_line(run_id, line).await,
                        Ok(None) | Err(_) => stdout_open = false,
                    }
                }
                _ = poll.tick() => {
                    match child.try_wait() {
                        Ok(Some(status)) => break Some(status),
                        Ok(None) => {
                            if !timed_out && started.elapsed() >= deadline {
                                timed_out = true;
                                warn!(
                                    "Run {} exceeded its {}s deadline; terminating worker",
                                    run_id,
                                    deadline.as_secs()
                                );
                                self.cancellations
                                    .write()
                                    .await
                                    .insert(run_id, CancelReason::Timeout);
                                let supervisor = self.clone();
                                tokio::spawn(async move {
                                    supervisor.escalate(pid).await;
                                });
                            }
                        }
                        Err(e) => {
                            error!("Run {} wait failed: {}", run_id, e);
                            break None;
                        }
                    }
                }
            }
        };

        // Drain whatever the worker left buffered in the pipe before it
        // exited.
        if let Some(lines) = stdout_lines.as_mut() {
            while let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await
            {
                self.handle_worker_line(run_id, line).await;
            }
        }

        {
            self.processes.write().await.remove(&run_id);
        }
        let cancel = self.cancellations.write().await.remove(&run_id);

        let result = load_result(&result_path);
        let code = exit_status.and_then(|status| status.code());
        let (status, error) = classify_exit(code, cancel, &result);

        if let Err(e) = self
            .database
            .finalize_run(run_id, status, result.as_ref(), error.as_deref())
            .await
        {
            error!("Failed to finalize run {}: {}", run_id, e);
        }
        self.progress
            .apply(
                [
                    ("phase".to_string(), json!(status.as_str())),
                    ("finished_at".to_string(), json!(Utc::now().to_rfc3339())),
                ]
                .into_iter()
                .collect(),
            )
            .await;

        match &error {
            Some(error) => info!("Run {} finished: {} ({})", run_id, status, error),
            None => info!("Run {} finished: {}", run_id, status),
        }
    }

    /// One stdout line: retained verbatim in the log ring buffer, and
    /// decoded as a typed event for best-effort progress forwarding.
    async fn handle_worker_line(&self, run_id: Uuid, line: String) {
        push_log(&self.logs, run_id, self.config.log_buffer_lines, line.clone()).await;

        match serde_json::from_str::<WorkerEvent>(&line) {
            Ok(WorkerEvent::Progress { patch }) => self.progress.apply(patch).await,
            Ok(WorkerEvent::Log { .. }) => {}
            Err(_) => debug!("Run {} emitted non-event output", run_id),
        }
    }

    /// Accept a stop request. Idempotent: repeat stops on the same run are
    /// no-ops, as is stopping an already-terminal run.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<(), AppError> {
        let run = self
            .database
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::not_found("run", run_id.to_string()))?;

        match run.status {
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled => return Ok(()),
            RunStatus::Canceling => return Ok(()),
            RunStatus::Queued => {
                // No worker yet; cancel directly.
                self.database
                    .finalize_run(run_id, RunStatus::Canceled, None, None)
                    .await?;
                return Ok(());
            }
            RunStatus::Running => {}
        }

        {
            let mut cancellations = self.cancellations.write().await;
            if cancellations.contains_key(&run_id) {
                return Ok(());
            }
            cancellations.insert(run_id, CancelReason::Stop);
        }
        self.database.mark_run_canceling(run_id).await?;
        info!("Run {} stop accepted", run_id);

        // Resolve the pid without holding the handle lock across the
        // signalling below. A persisted pid substitutes for a handle lost
        // to a restart.
        let registered = { self.processes.read().await.get(&run_id).map(|h| h.pid) };
        let pid = match registered.or(run.worker_pid.map(|p| p as u32)) {
            Some(pid) => pid,
            None => {
                warn!("Run {} has no process handle or persisted pid", run_id);
                self.database
                    .finalize_run(
                        run_id,
                        RunStatus::Canceled,
                        None,
                        Some("worker process unknown"),
                    )
                    .await?;
                return Ok(());
            }
        };

        if self.escalate(pid).await {
            // Confirmed dead. The monitor task finalizes our own
            // children; a pid-only run (post-restart) is finalized here.
            if !self.processes.read().await.contains_key(&run_id) {
                self.finalize_confirmed_dead(run_id).await;
            }
        } else {
            warn!(
                "Run {} worker (pid {}) still alive after SIGKILL; finalizing in background",
                run_id, pid
            );
            let supervisor = self.clone();
            tokio::spawn(async move {
                supervisor.poll_until_dead(run_id, pid).await;
            });
        }
        Ok(())
    }

    /// Graceful terminate, bounded grace wait, forceful kill, bounded
    /// wait. Returns whether the process is confirmed dead.
    async fn escalate(&self, pid: u32) -> bool {
        if !process_alive(pid) {
            return true;
        }

        terminate_group(pid);
        if self
            .wait_for_death(pid, Duration::from_secs(self.config.grace_seconds))
            .await
        {
            return true;
        }

        warn!("Worker pid {} survived SIGTERM; sending SIGKILL", pid);
        kill_group(pid);
        self.wait_for_death(pid, Duration::from_secs(self.config.kill_wait_seconds))
            .await
    }

    async fn wait_for_death(&self, pid: u32, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if !process_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return !process_alive(pid);
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// Background finalization: keep polling until the OS confirms the
    /// process dead. A run is never marked canceled while its process is
    /// still reported alive.
    async fn poll_until_dead(&self, run_id: Uuid, pid: u32) {
        loop {
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms * 5)).await;
            if !process_alive(pid) {
                break;
            }
        }
        if !self.processes.read().await.contains_key(&run_id) {
            self.finalize_confirmed_dead(run_id).await;
        }
        // Otherwise the monitor task observes the exit and finalizes.
    }

    /// Finalize a canceling run whose process death was confirmed outside
    /// the monitor task (lost handle / post-restart).
    async fn finalize_confirmed_dead(&self, run_id: Uuid) {
        self.cancellations.write().await.remove(&run_id);
        match self.database.get_run(run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Canceling => {
                if let Err(e) = self
                    .database
                    .finalize_run(run_id, RunStatus::Canceled, None, None)
                    .await
                {
                    error!("Failed to finalize canceled run {}: {}", run_id, e);
                } else {
                    info!("Run {} canceled (process death confirmed)", run_id);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to load run {} for finalization: {}", run_id, e),
        }
    }

    /// Startup reconciliation: a run persisted as active whose worker
    /// process is not alive is reclassified, never silently resumed or
    /// left running forever.
    pub async fn reconcile_orphans(&self) -> Result<usize, AppError> {
        let mut reclassified = 0;

        for run in self.database.active_runs().await? {
            let alive = run
                .worker_pid
                .map(|pid| process_alive(pid as u32))
                .unwrap_or(false);

            if alive {
                let pid = run.worker_pid.unwrap_or_default();
                warn!(
                    "Run {} worker (pid {}) is still alive after restart; leaving it {}",
                    run.id, pid, run.status
                );
                if run.status == RunStatus::Canceling {
                    self.cancellations
                        .write()
                        .await
                        .insert(run.id, CancelReason::Stop);
                    let supervisor = self.clone();
                    let run_id = run.id;
                    tokio::spawn(async move {
                        supervisor.poll_until_dead(run_id, pid as u32).await;
                    });
                }
                continue;
            }

            let (status, error) = match run.status {
                RunStatus::Canceling => (RunStatus::Canceled, None),
                _ => (RunStatus::Failed, Some("orphaned")),
            };
            warn!(
                "Reconciling run {}: {} -> {} (worker not alive)",
                run.id, run.status, status
            );
            self.database
                .finalize_run(run.id, status, None, error)
                .await?;
            reclassified += 1;
        }

        if reclassified > 0 {
            info!("Reconciled {} orphaned run(s)", reclassified);
        }
        Ok(reclassified)
    }

    /// Tail of the worker's captured output.
    pub async fn log_tail(&self, run_id: Uuid, lines: usize) -> Vec<String> {
        let logs = self.logs.read().await;
        match logs.get(&run_id) {
            Some(buffer) => buffer
                .iter()
                .skip(buffer.len().saturating_sub(lines))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl RunLauncher for RunSupervisor {
    async fn launch(&self, run: Run) {
        self.spawn_detached(run);
    }
}

async fn push_log(
    logs: &Arc<RwLock<HashMap<Uuid, VecDeque<String>>>>,
    run_id: Uuid,
    cap: usize,
    line: String,
) {
    let mut logs = logs.write().await;
    let buffer = logs.entry(run_id).or_default();
    if buffer.len() >= cap {
        buffer.pop_front();
    }
    buffer.push_back(line);
}

fn load_result(path: &std::path::Path) -> Option<RunResult> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Unreadable result file {}: {}", path.display(), e);
            None
        }
    }
}

/// Map worker exit and cancellation state onto the run state machine.
/// `code` is `None` when the worker died from a signal.
fn classify_exit(
    code: Option<i32>,
    cancel: Option<CancelReason>,
    result: &Option<RunResult>,
) -> (RunStatus, Option<String>) {
    match (code, cancel) {
        (_, Some(CancelReason::Timeout)) => (RunStatus::Failed, Some("timeout".to_string())),
        (Some(EXIT_CODE_CANCELED), _) => (RunStatus::Canceled, None),
        (_, Some(CancelReason::Stop)) => (RunStatus::Canceled, None),
        (Some(0), None) => match result {
            Some(result) if result.has_error() => (
                RunStatus::Failed,
                Some("one or more targets reported an error".to_string()),
            ),
            _ => (RunStatus::Succeeded, None),
        },
        (Some(code), None) => (
            RunStatus::Failed,
            Some(format!("worker exited with code {code}")),
        ),
        (None, None) => (RunStatus::Failed, Some("worker killed by signal".to_string())),
    }
}

/// Deadline derived from workload size, clamped to the configured bounds.
pub fn workload_deadline(targets: &[Target], config: &SupervisorConfig) -> Duration {
    let total_pages: u64 = targets.iter().map(|t| u64::from(t.page_limit.max(1))).sum();
    let seconds = config.base_timeout_seconds + config.per_page_timeout_seconds * total_pages;
    Duration::from_secs(seconds.clamp(config.min_timeout_seconds, config.max_timeout_seconds))
}

/// Liveness check via signal 0. A pid that cannot be signalled is treated
/// as dead.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Graceful terminate to the worker's whole process group, falling back to
/// the pid itself if the group signal is rejected.
#[cfg(unix)]
fn terminate_group(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let group = -(pid as libc::pid_t);
    let rc = unsafe { libc::kill(group, signal) };
    if rc != 0 {
        unsafe { libc::kill(pid as libc::pid_t, signal) };
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
