//! Asynchronous provisioning of new downstream servers.
//!
//! `provision` validates the manifest entry and its required environment
//! variables up front — a missing variable is an immediate error and no job
//! is created. Valid requests get a job id and a background worker that
//! runs the install recipe step by step, streams progress into the job
//! record, and finally hands the new launch spec to the session manager.
//!
//! Jobs are retained for fifteen minutes after reaching a terminal state so
//! `provision_status` can be polled late.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::manifest::Manifest;
use crate::session::SessionManager;

/// How long terminal jobs stay queryable.
pub const JOB_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Timeout for a single install step.
const STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle of an install job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created, worker not yet running.
    Pending,
    /// Install recipe executing.
    Installing,
    /// Recipe done; session starting.
    Starting,
    /// Server is up. Terminal.
    Completed,
    /// A step or the session start failed. Terminal.
    Failed,
}

impl JobState {
    /// Whether the job can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Point-in-time view of a job for `provision_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Job id returned by `provision`.
    pub job_id: String,
    /// Server the job installs.
    pub server_name: String,
    /// Current state.
    pub state: JobState,
    /// Most recent progress message.
    pub message: String,
    /// Every progress message, oldest first.
    pub progress: Vec<String>,
    /// Seconds since the job was created.
    pub age_secs: u64,
}

struct JobRecord {
    server_name: String,
    state: JobState,
    progress: Vec<String>,
    created_at: Instant,
    terminal_at: Option<Instant>,
}

impl JobRecord {
    fn push_progress(&mut self, message: impl Into<String>) {
        self.progress.push(message.into());
    }

    fn finish(&mut self, state: JobState, message: impl Into<String>) {
        self.state = state;
        self.push_progress(message);
        self.terminal_at = Some(Instant::now());
    }
}

/// Runs install jobs and tracks their status.
pub struct Provisioner {
    manifest: Arc<Manifest>,
    manager: Arc<SessionManager>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    counter: AtomicU64,
}

impl Provisioner {
    /// Creates a provisioner drawing entries from the given manifest.
    #[must_use]
    pub fn new(manifest: Arc<Manifest>, manager: Arc<SessionManager>) -> Self {
        Self {
            manifest,
            manager,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(1),
        }
    }

    /// Starts an install job for a manifest server.
    ///
    /// Validates the entry and its required environment variables first;
    /// on failure no job exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionFailed` naming the unknown server or the missing
    /// variables.
    pub fn provision(
        &self,
        server_name: &str,
        extra_env: BTreeMap<String, String>,
    ) -> Result<String, GatewayError> {
        let Some(entry) = self.manifest.get(server_name) else {
            return Err(GatewayError::ProvisionFailed {
                message: format!("server '{server_name}' is not in the manifest"),
            });
        };

        let missing =
            entry.missing_env(|var| extra_env.contains_key(var) || std::env::var(var).is_ok());
        if !missing.is_empty() {
            return Err(GatewayError::ProvisionFailed {
                message: format!(
                    "missing required environment variable(s): {}",
                    missing.join(", ")
                ),
            });
        }

        self.prune();
        let job_id = format!("job-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        {
            let mut jobs = self
                .jobs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            jobs.insert(
                job_id.clone(),
                JobRecord {
                    server_name: server_name.to_string(),
                    state: JobState::Pending,
                    progress: vec![format!("job created for '{server_name}'")],
                    created_at: Instant::now(),
                    terminal_at: None,
                },
            );
        }

        info!(job_id = %job_id, server = %server_name, "provisioning started");
        let worker = JobWorker {
            job_id: job_id.clone(),
            server_name: server_name.to_string(),
            entry: entry.clone(),
            extra_env,
            manager: Arc::clone(&self.manager),
            jobs: Arc::clone(&self.jobs),
        };
        tokio::spawn(worker.run());

        Ok(job_id)
    }

    /// Returns a job's current state and progress.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown (or expired) job ids.
    pub fn status(&self, job_id: &str) -> Result<JobStatus, GatewayError> {
        self.prune();
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let record = jobs.get(job_id).ok_or_else(|| GatewayError::InvalidArgument {
            message: format!("unknown job id '{job_id}'"),
        })?;
        Ok(JobStatus {
            job_id: job_id.to_string(),
            server_name: record.server_name.clone(),
            state: record.state,
            message: record
                .progress
                .last()
                .cloned()
                .unwrap_or_default(),
            progress: record.progress.clone(),
            age_secs: record.created_at.elapsed().as_secs(),
        })
    }

    /// Drops terminal jobs older than the retention window.
    fn prune(&self) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        jobs.retain(|_, record| {
            record
                .terminal_at
                .map_or(true, |at| at.elapsed() < JOB_RETENTION)
        });
    }
}

/// The background half of one provisioning job.
struct JobWorker {
    job_id: String,
    server_name: String,
    entry: crate::manifest::ManifestEntry,
    extra_env: BTreeMap<String, String>,
    manager: Arc<SessionManager>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
}

impl JobWorker {
    async fn run(self) {
        self.update(JobState::Installing, "running install recipe");

        let steps = self.entry.install.clone();
        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            let label = step.join(" ");
            self.update(
                JobState::Installing,
                format!("step {}/{total}: {label}", index + 1),
            );
            if let Err(message) = self.run_step(step).await {
                warn!(job_id = %self.job_id, step = %label, "install step failed");
                self.finish(JobState::Failed, message);
                return;
            }
        }

        self.update(JobState::Starting, "starting server session");
        let spec = self.entry.to_server_spec(self.extra_env.clone());
        match self.manager.add_dynamic(&self.server_name, spec).await {
            Ok(_) => {
                info!(job_id = %self.job_id, server = %self.server_name, "provisioned and started");
                self.finish(
                    JobState::Completed,
                    format!("server '{}' is running", self.server_name),
                );
            }
            Err(e) => {
                self.finish(
                    JobState::Failed,
                    format!("server start failed after install: {e}"),
                );
            }
        }
    }

    /// Runs one recipe step; the error message names the step but never
    /// its environment.
    async fn run_step(&self, step: &[String]) -> Result<(), String> {
        let Some((program, args)) = step.split_first() else {
            return Err("empty install step".to_string());
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }

        let label = step.join(" ");
        let output = tokio::time::timeout(STEP_TIMEOUT, cmd.output())
            .await
            .map_err(|_| format!("install step '{label}' timed out"))?
            .map_err(|e| format!("install step '{label}' could not run: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "install step '{label}' failed with exit code {}",
                output.status.code().unwrap_or(-1)
            ))
        }
    }

    fn update(&self, state: JobState, message: impl Into<String>) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(record) = jobs.get_mut(&self.job_id) {
            record.state = state;
            record.push_progress(message);
        }
    }

    fn finish(&self, state: JobState, message: impl Into<String>) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(record) = jobs.get_mut(&self.job_id) {
            record.finish(state, message);
        }
    }
}
