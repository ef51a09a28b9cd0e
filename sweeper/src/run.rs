//! Run orchestration: discover repositories, process every (repository,
//! task) pair and persist run state.
//!
//! Host listings run on scoped threads and stream batches over a channel.
//! Processing stays on the calling thread, so tasks and their counters are
//! never shared.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::result::ProcessResult;
use crate::host::{Discovery, Host, Repository, RepositorySink, repository_from_name};
use crate::io::git::GitClient;
use crate::io::run_state::{RUN_STATE_FILE, RunState, TaskChecksum, load_run_state, write_run_state};
use crate::metrics;
use crate::processor::Processor;
use crate::task::Task;

#[derive(Debug, thiserror::Error)]
#[error("no hosts configured")]
pub struct NoHostsConfiguredError;

/// Message of the error returned when any pair failed.
pub const RUN_FAILED_MESSAGE: &str = "errors occurred, check previous log messages";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Explicit repositories. Non-empty disables discovery and filters.
    pub repository_names: Vec<String>,
    /// Holds `cache.json`.
    pub data_dir: PathBuf,
}

/// Outcome of one (repository, task) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub repository: String,
    pub task: String,
    pub result: ProcessResult,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<RunResult>,
    /// False if any pair failed.
    pub success: bool,
}

/// Execute one run over `tasks`.
///
/// Pair failures are logged and recorded in the summary. Discovery errors,
/// run state I/O and a missing host abort the run.
#[instrument(skip_all, fields(dry_run = options.dry_run, tasks = tasks.len()))]
pub fn execute_run<G: GitClient>(
    hosts: &[Box<dyn Host>],
    processor: &mut Processor<G>,
    tasks: &mut [Task],
    options: &RunOptions,
) -> Result<RunSummary> {
    if hosts.is_empty() {
        return Err(NoHostsConfiguredError.into());
    }
    let started_at = Utc::now();
    metrics::describe();
    metrics::record_run_start(started_at);
    let outcome = run_pass(hosts, processor, tasks, options, started_at);
    metrics::record_run_finish(Utc::now());
    outcome
}

fn run_pass<G: GitClient>(
    hosts: &[Box<dyn Host>],
    processor: &mut Processor<G>,
    tasks: &mut [Task],
    options: &RunOptions,
    started_at: DateTime<Utc>,
) -> Result<RunSummary> {
    let state_path = options.data_dir.join(RUN_STATE_FILE);
    let state = load_run_state(&state_path)?;

    if tasks.is_empty() {
        warn!("0 tasks loaded, stopping");
        return Ok(RunSummary {
            results: Vec::new(),
            success: true,
        });
    }

    let checksums: Vec<TaskChecksum> = tasks
        .iter()
        .map(|task| TaskChecksum {
            name: task.name().to_string(),
            checksum: task.checksum.clone(),
        })
        .collect();

    let mut pass = Pass {
        processor,
        tasks,
        dry_run: options.dry_run,
        visited: HashSet::new(),
        summary: RunSummary {
            results: Vec::new(),
            success: true,
        },
    };

    if options.repository_names.is_empty() {
        let since = state.since(&checksums);
        info!(since = ?since, "discovering repositories");
        discover(hosts, since, |repo| pass.visit(repo.as_ref(), true))?;
    } else {
        info!(count = options.repository_names.len(), "applying all tasks to repositories from CLI");
        for name in &options.repository_names {
            let repo = repository_from_name(hosts, name)?;
            pass.visit(repo.as_ref(), false);
        }
    }

    if options.dry_run {
        debug!("dry run, leaving run state untouched");
    } else {
        let next = RunState {
            last_execution_at: Some(started_at.timestamp_micros()),
            tasks: checksums,
        };
        write_run_state(&state_path, &next)?;
    }

    Ok(pass.summary)
}

struct Pass<'a, G: GitClient> {
    processor: &'a mut Processor<G>,
    tasks: &'a mut [Task],
    dry_run: bool,
    visited: HashSet<String>,
    summary: RunSummary,
}

impl<G: GitClient> Pass<'_, G> {
    fn visit(&mut self, repo: &dyn Repository, do_filter: bool) {
        let full_name = repo.full_name();
        if !self.visited.insert(full_name.clone()) {
            debug!(repository = %full_name, "repository already visited");
            return;
        }
        for task in &mut *self.tasks {
            let outcome = self.processor.process(self.dry_run, repo, task, do_filter);
            let (result, err) = match outcome {
                Ok(result) => {
                    task.record_result(result);
                    (result, None)
                }
                Err(err) => {
                    error!(repository = %full_name, task = %task.name(), err = %format!("{err:#}"), "task failed");
                    self.summary.success = false;
                    (ProcessResult::Unknown, Some(format!("{err:#}")))
                }
            };
            metrics::record_task_result(task.name(), result);
            self.summary.results.push(RunResult {
                repository: full_name.clone(),
                task: task.name().to_string(),
                result,
                error: err,
            });
        }
    }
}

/// Stream repositories from every host into `visit` until all listings
/// finished. The first listing error aborts.
fn discover(
    hosts: &[Box<dyn Host>],
    since: Option<DateTime<Utc>>,
    mut visit: impl FnMut(Box<dyn Repository>),
) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        let mut expected = 0;
        for host in hosts {
            let sink = RepositorySink::new(tx.clone());
            expected += 1;
            scope.spawn(move || {
                debug!(host = %host.name(), since = ?since, "listing repositories");
                let outcome = host
                    .list_repositories(since, &sink)
                    .with_context(|| format!("list repositories of host {}", host.name()));
                sink.finish(outcome);
            });
            if since.is_some() {
                let sink = RepositorySink::new(tx.clone());
                expected += 1;
                scope.spawn(move || {
                    debug!(host = %host.name(), "listing repositories with open pull requests");
                    let outcome = host
                        .list_repositories_with_open_pull_requests(&sink)
                        .with_context(|| {
                            format!("list repositories with open pull requests of host {}", host.name())
                        });
                    sink.finish(outcome);
                });
            }
        }
        drop(tx);

        let mut finished = 0;
        while finished < expected {
            match rx.recv() {
                Ok(Discovery::Batch(batch)) => {
                    for repo in batch {
                        visit(repo);
                    }
                }
                Ok(Discovery::Finished(outcome)) => {
                    outcome?;
                    finished += 1;
                }
                Err(_) => bail!("repository discovery stopped before all hosts finished"),
            }
        }
        Ok(())
    })
}
