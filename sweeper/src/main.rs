//! `sweeper` CLI: apply task files to repositories and validate them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sweeper::action::ActionSettings;
use sweeper::exit_codes;
use sweeper::host::Host;
use sweeper::io::config::{DEFAULT_CONFIG_PATH, SweeperConfig, load_config};
use sweeper::io::git::{Git, GitSettings};
use sweeper::io::task_file::{TaskFile, load_task_file};
use sweeper::logging;
use sweeper::processor::Processor;
use sweeper::run::{NoHostsConfiguredError, RUN_FAILED_MESSAGE, RunOptions, execute_run};
use sweeper::task::build_tasks;
use sweeper::template::Templates;

#[derive(Parser)]
#[command(
    name = "sweeper",
    version,
    about = "Apply declarative tasks across git repositories and manage their pull requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply tasks to matching repositories.
    Run {
        /// Task files (YAML).
        #[arg(required = true)]
        task_files: Vec<PathBuf>,
        /// Only process these repositories; filters are not evaluated.
        #[arg(long = "repository", value_name = "NAME")]
        repositories: Vec<String>,
        /// Decide outcomes without pushing or changing pull requests.
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Task input, `key=value`. Repeatable.
        #[arg(long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },
    /// Parse task files and build their filters and actions.
    Validate {
        #[arg(required = true)]
        task_files: Vec<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() {
    logging::init("info");
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task_files,
            repositories,
            dry_run,
            config,
            inputs,
        } => cmd_run(&task_files, repositories, dry_run, &config, inputs.into_iter().collect()),
        Command::Validate { task_files, config } => cmd_validate(&task_files, &config),
    }
}

fn parse_input(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("input must look like key=value");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("input key must not be empty");
    }
    Ok((key.to_string(), value.to_string()))
}

fn load_task_files(paths: &[PathBuf]) -> Result<Vec<TaskFile>> {
    paths.iter().map(|path| load_task_file(path)).collect()
}

fn action_settings(cfg: &SweeperConfig, task_path: &Path) -> ActionSettings {
    ActionSettings {
        // Actions run inside the checkout, so the task directory must not
        // stay relative to the working directory.
        task_dir: std::path::absolute(task_path)
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf))
            .unwrap_or_default(),
        default_timeout: Duration::from_secs(cfg.action_timeout_secs),
        output_limit_bytes: cfg.action_output_limit_bytes,
    }
}

fn cmd_run(
    task_files: &[PathBuf],
    repositories: Vec<String>,
    dry_run: bool,
    config: &Path,
    inputs: BTreeMap<String, String>,
) -> Result<i32> {
    let cfg = load_config(config)?;
    let files = load_task_files(task_files)?;
    let mut tasks = build_tasks(
        &files,
        |path| action_settings(&cfg, path),
        &inputs,
        &cfg.labels,
    )?;

    let git = Git::new(GitSettings::from_config(&cfg)?);
    let mut processor = Processor::new(Some(cfg.data_dir.clone()), git, Templates::new());
    let options = RunOptions {
        dry_run: dry_run || cfg.dry_run,
        repository_names: repositories,
        data_dir: cfg.data_dir.clone(),
    };

    // Host API clients are provided by embedding programs.
    let hosts: Vec<Box<dyn Host>> = Vec::new();
    let summary = match execute_run(&hosts, &mut processor, &mut tasks, &options) {
        Ok(summary) => summary,
        Err(err) if err.downcast_ref::<NoHostsConfiguredError>().is_some() => return Err(err),
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(exit_codes::FAILED);
        }
    };

    for result in &summary.results {
        match &result.error {
            Some(err) => println!("{}\t{}\terror\t{}", result.repository, result.task, err),
            None => println!("{}\t{}\t{}", result.repository, result.task, result.result),
        }
    }
    if !summary.success {
        eprintln!("{RUN_FAILED_MESSAGE}");
        return Ok(exit_codes::FAILED);
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(task_files: &[PathBuf], config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let files = load_task_files(task_files)?;
    for file in &files {
        let tasks = build_tasks(
            std::slice::from_ref(file),
            |path| action_settings(&cfg, path),
            &BTreeMap::new(),
            &cfg.labels,
        )
        .with_context(|| format!("validate {}", file.path.display()))?;
        println!("{}: {} task(s) OK", file.path.display(), tasks.len());
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "sweeper",
            "run",
            "--dry-run",
            "--repository",
            "github.com/acme/a",
            "--repository",
            "github.com/acme/b",
            "--input",
            "version=1.22",
            "tasks/go.yaml",
        ]);
        let Command::Run {
            task_files,
            repositories,
            dry_run,
            config,
            inputs,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(dry_run);
        assert_eq!(task_files, vec![PathBuf::from("tasks/go.yaml")]);
        assert_eq!(repositories.len(), 2);
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(inputs, vec![("version".to_string(), "1.22".to_string())]);
    }

    #[test]
    fn run_requires_task_files() {
        assert!(Cli::try_parse_from(["sweeper", "run"]).is_err());
    }

    #[test]
    fn input_must_have_a_key() {
        assert!(parse_input("=x").is_err());
        assert!(parse_input("novalue").is_err());
        assert_eq!(
            parse_input("a=b=c").expect("input"),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn validate_reports_broken_task_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.yaml");
        std::fs::write(
            &path,
            "name: broken\nactions:\n  - action: nope\n",
        )
        .expect("write");
        let err = cmd_validate(&[path], &temp.path().join("missing.toml")).expect_err("invalid");
        assert!(format!("{err:#}").contains("nope"));
    }

    #[test]
    fn stock_binary_has_no_hosts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.yaml");
        std::fs::write(&path, "name: demo\n").expect("write");
        let err = cmd_run(
            &[path],
            Vec::new(),
            true,
            &temp.path().join("missing.toml"),
            BTreeMap::new(),
        )
        .expect_err("no hosts");
        assert!(err.downcast_ref::<NoHostsConfiguredError>().is_some());
    }
}
