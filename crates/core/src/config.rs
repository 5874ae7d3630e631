use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Policies ──────────────────────────────────────────────────

/// What a preempted task does with the time it already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    /// Re-run starts the nominal duration from zero.
    #[default]
    Restart,
    /// Re-run continues from the elapsed time of earlier runs.
    Resume,
}

impl std::str::FromStr for ResumePolicy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(ResumePolicy::Restart),
            "resume" => Ok(ResumePolicy::Resume),
            other => Err(SchedError::Config(format!(
                "invalid resume policy '{other}', expected 'restart' or 'resume'"
            ))),
        }
    }
}

// ── Dispatch config ───────────────────────────────────────────

/// Dispatcher configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Execution slice length in milliseconds. Interrupts are observed at
    /// slice boundaries only.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// How long an idle dispatcher blocks on the ready queue per poll.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// How often an executing dispatcher checks for a higher-priority arrival.
    #[serde(default = "default_preempt_poll_ms")]
    pub preempt_poll_ms: u64,
    /// Execution pool threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Caller-enforced cap on the total number of submitted tasks.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Handling of elapsed time when a preempted task re-runs.
    #[serde(default)]
    pub resume_policy: ResumePolicy,
    /// Re-queue tasks interrupted for reasons other than preemption.
    #[serde(default)]
    pub retry_interrupted: bool,
    /// Number of generated tasks the binary seeds at startup.
    #[serde(default = "default_seed_tasks")]
    pub seed_tasks: usize,
    /// Buffer size of the progress broadcast channel.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
    /// Buffer size of the log event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_tick_ms() -> u64 { 200 }
fn default_idle_poll_ms() -> u64 { 500 }
fn default_preempt_poll_ms() -> u64 { 20 }
fn default_worker_threads() -> usize { 2 }
fn default_max_tasks() -> usize { 1000 }
fn default_seed_tasks() -> usize { 10 }
fn default_progress_capacity() -> usize { 256 }
fn default_event_capacity() -> usize { 1024 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            preempt_poll_ms: default_preempt_poll_ms(),
            worker_threads: default_worker_threads(),
            max_tasks: default_max_tasks(),
            resume_policy: ResumePolicy::default(),
            retry_interrupted: false,
            seed_tasks: default_seed_tasks(),
            progress_capacity: default_progress_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DispatchConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, SchedError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RTSCHED_<FIELD>` environment overrides.
    ///
    /// Unparseable values are ignored and the existing value kept.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parsed("RTSCHED_TICK_MS") {
            self.tick_ms = v;
        }
        if let Some(v) = env_parsed("RTSCHED_IDLE_POLL_MS") {
            self.idle_poll_ms = v;
        }
        if let Some(v) = env_parsed("RTSCHED_PREEMPT_POLL_MS") {
            self.preempt_poll_ms = v;
        }
        if let Some(v) = env_parsed("RTSCHED_WORKER_THREADS") {
            self.worker_threads = v;
        }
        if let Some(v) = env_parsed("RTSCHED_MAX_TASKS") {
            self.max_tasks = v;
        }
        if let Some(v) = env_parsed("RTSCHED_RESUME_POLICY") {
            self.resume_policy = v;
        }
        if let Some(v) = env_parsed("RTSCHED_RETRY_INTERRUPTED") {
            self.retry_interrupted = v;
        }
        if let Some(v) = env_parsed("RTSCHED_SEED_TASKS") {
            self.seed_tasks = v;
        }
    }

    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), SchedError> {
        let positive = [
            ("tick_ms", self.tick_ms),
            ("idle_poll_ms", self.idle_poll_ms),
            ("preempt_poll_ms", self.preempt_poll_ms),
            ("max_tasks", self.max_tasks as u64),
            ("progress_capacity", self.progress_capacity as u64),
            ("event_capacity", self.event_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SchedError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn preempt_poll(&self) -> Duration {
        Duration::from_millis(self.preempt_poll_ms)
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            self.worker_threads
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Dispatch config loaded:");
        tracing::info!(
            "  timing:   tick={}ms, idle_poll={}ms, preempt_poll={}ms",
            self.tick_ms,
            self.idle_poll_ms,
            self.preempt_poll_ms
        );
        tracing::info!("  pool:     workers={}", self.resolved_worker_threads());
        tracing::info!(
            "  policy:   resume={:?}, retry_interrupted={}",
            self.resume_policy,
            self.retry_interrupted
        );
        tracing::info!(
            "  limits:   max_tasks={}, seed_tasks={}",
            self.max_tasks,
            self.seed_tasks
        );
    }
}
