//! rtsched: console driver for the priority dispatcher.
//!
//! Seeds a batch of random tasks, submits any `--task` given on the command
//! line, then streams the event log and periodic metrics to stdout until the
//! run timer expires or Ctrl-C is pressed.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

use rtsched_core::{load_dotenv, DispatchConfig, MetricsSnapshot, TaskSummary};
use rtsched_dispatch::{Dispatcher, LogEvent};

// ── CLI ─────────────────────────────────────────────────────────────

/// Real-time priority dispatcher simulation.
#[derive(Parser, Debug)]
#[command(name = "rtsched", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults plus RTSCHED_* overrides when absent.
    #[arg(long, env = "RTSCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Number of random tasks to seed (overrides `seed_tasks`).
    #[arg(long)]
    seed: Option<usize>,

    /// Stop after this many seconds.
    #[arg(long, env = "RTSCHED_RUN_FOR_SECS", default_value_t = 30)]
    run_for_secs: u64,

    /// Write the event log here on exit.
    #[arg(long)]
    export_logs: Option<PathBuf>,

    /// Metrics print interval in seconds.
    #[arg(long, default_value_t = 2)]
    metrics_interval_secs: u64,

    /// Extra task as `name:priority:duration_ms:deadline_offset_ms`.
    /// The deadline offset is relative to submission time.
    #[arg(long = "task", value_name = "SPEC")]
    tasks: Vec<String>,
}

/// One `--task` argument.
#[derive(Debug, PartialEq)]
struct TaskArg {
    name: String,
    priority: i64,
    duration_ms: i64,
    deadline_offset_ms: i64,
}

impl std::str::FromStr for TaskArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split from the right so the name itself may contain ':'.
        let mut parts = s.rsplitn(4, ':');
        let (Some(deadline), Some(duration), Some(priority), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("expected name:priority:duration_ms:deadline_offset_ms, got '{s}'");
        };
        Ok(Self {
            name: name.to_string(),
            priority: priority.trim().parse().context("priority")?,
            duration_ms: duration.trim().parse().context("duration_ms")?,
            deadline_offset_ms: deadline.trim().parse().context("deadline_offset_ms")?,
        })
    }
}

#[derive(Serialize)]
struct FinalReport {
    metrics: MetricsSnapshot,
    completed: Vec<TaskSummary>,
    interrupted: Vec<TaskSummary>,
    missed: Vec<TaskSummary>,
}

fn load_config(cli: &Cli) -> anyhow::Result<DispatchConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = DispatchConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env_overrides();
            config.validate()?;
            info!(path = %path.display(), "loaded dispatch config");
            config
        }
        None => DispatchConfig::from_env()?,
    };
    if let Some(count) = cli.seed {
        config.seed_tasks = count;
    }
    Ok(config)
}

fn print_event(event: &LogEvent) {
    println!("{}", event.line());
}

fn print_metrics(m: &MetricsSnapshot) {
    println!(
        "-- metrics: total={} completed={} interrupted={} missed={} avg_turnaround={}ms",
        m.total, m.completed, m.interrupted, m.missed, m.avg_turnaround_ms
    );
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    let task_args = cli
        .tasks
        .iter()
        .map(|s| s.parse::<TaskArg>())
        .collect::<anyhow::Result<Vec<_>>>()?;

    let dispatcher = Arc::new(Dispatcher::with_defaults(config));
    let mut events = dispatcher.subscribe_events();

    let runner = Arc::clone(&dispatcher);
    let loop_handle = thread::Builder::new()
        .name("rtsched-dispatcher".into())
        .spawn(move || runner.run())
        .context("spawning dispatcher thread")?;

    let submitter = dispatcher.submitter();
    if let Err(e) = submitter.seed(dispatcher.config().seed_tasks, &mut rand::rng()) {
        warn!(error = %e, "seeding stopped early");
    }
    for arg in task_args {
        let deadline = Utc::now().timestamp_millis() + arg.deadline_offset_ms;
        if let Err(e) = submitter.submit(&arg.name, arg.priority, arg.duration_ms, deadline) {
            warn!(task = %arg.name, error = %e, "task rejected");
        }
    }

    let run_for = tokio::time::sleep(Duration::from_secs(cli.run_for_secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(run_for, ctrl_c);
    let mut metrics_tick =
        tokio::time::interval(Duration::from_secs(cli.metrics_interval_secs.max(1)));

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "console fell behind the event log"),
                Err(RecvError::Closed) => break,
            },
            _ = metrics_tick.tick() => print_metrics(&dispatcher.metrics()),
            _ = &mut run_for => {
                info!(secs = cli.run_for_secs, "run time elapsed");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    dispatcher.shutdown();
    tokio::task::spawn_blocking(move || loop_handle.join())
        .await?
        .map_err(|_| anyhow::anyhow!("dispatcher thread panicked"))??;

    loop {
        match events.try_recv() {
            Ok(event) => print_event(&event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    if let Some(path) = &cli.export_logs {
        let lines = dispatcher.event_log().export_to_file(path)?;
        info!(path = %path.display(), lines, "event log written");
    }

    let results = dispatcher.results();
    let report = FinalReport {
        metrics: results.metrics(),
        completed: results.completed(),
        interrupted: results.interrupted(),
        missed: results.missed(),
    };
    print_metrics(&report.metrics);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_arg() {
        let arg: TaskArg = "render:7:1500:4000".parse().unwrap();
        assert_eq!(
            arg,
            TaskArg {
                name: "render".into(),
                priority: 7,
                duration_ms: 1500,
                deadline_offset_ms: 4000,
            }
        );
    }

    #[test]
    fn task_name_may_contain_colons() {
        let arg: TaskArg = "job:a:b:3:100:200".parse().unwrap();
        assert_eq!(arg.name, "job:a:b");
        assert_eq!(arg.priority, 3);
    }

    #[test]
    fn rejects_malformed_task_arg() {
        assert!("only:two".parse::<TaskArg>().is_err());
        let err = "x:high:100:200".parse::<TaskArg>().unwrap_err();
        assert!(err.to_string().contains("priority"), "got: {err}");
    }

    #[test]
    fn cli_accepts_repeated_tasks() {
        let cli = Cli::try_parse_from([
            "rtsched", "--seed", "0", "--task", "a:1:10:100", "--task", "b:2:10:100",
        ])
        .unwrap();
        assert_eq!(cli.seed, Some(0));
        assert_eq!(cli.tasks.len(), 2);
    }
}
