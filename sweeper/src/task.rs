//! Runtime form of a task: its definition plus built filters, actions,
//! hooks and the run-scoped counters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::action::{Action, ActionSettings, build_action};
use crate::core::duration::parse_duration;
use crate::core::result::ProcessResult;
use crate::core::schedule::Schedule;
use crate::core::slug::{default_branch_name, truncate_branch_name};
use crate::filter::{Filter, build_filter};
use crate::host::Repository;
use crate::io::task_file::{TaskDefinition, TaskFile};
use crate::template::{TemplateData, Templates};

/// Callbacks fired after the processor decided a PR outcome.
///
/// Errors fail the (repository, task) pair. Out-of-process plugins attach
/// here.
pub trait TaskHook {
    fn on_pr_created(&self, _repo: &dyn Repository) -> Result<()> {
        Ok(())
    }

    fn on_pr_closed(&self, _repo: &dyn Repository) -> Result<()> {
        Ok(())
    }

    fn on_pr_merged(&self, _repo: &dyn Repository) -> Result<()> {
        Ok(())
    }
}

/// A task ready to be processed.
///
/// `open_prs` and `change_count` are shared by every repository of a run:
/// results of earlier repositories gate later ones. A task must not be
/// processed from more than one thread.
pub struct Task {
    pub definition: TaskDefinition,
    /// File the task was loaded from.
    pub path: PathBuf,
    pub checksum: String,
    filters: Vec<Box<dyn Filter>>,
    actions: Vec<Box<dyn Action>>,
    hooks: Vec<Box<dyn TaskHook>>,
    schedule: Schedule,
    auto_merge_after: Option<Duration>,
    auto_close_after: Option<Duration>,
    inputs: BTreeMap<String, String>,
    open_prs: u32,
    change_count: u32,
}

impl Task {
    /// Task with no filters, actions or hooks; durations and schedule parsed.
    pub fn new(definition: TaskDefinition) -> Result<Self> {
        let name = definition.name.clone();
        let schedule = Schedule::parse(&definition.schedule)
            .with_context(|| format!("task '{name}'"))?;
        let auto_merge_after = parse_optional_duration(definition.auto_merge_after.as_deref())
            .with_context(|| format!("task '{name}': autoMergeAfter"))?;
        let auto_close_after = parse_optional_duration(definition.auto_close_after.as_deref())
            .with_context(|| format!("task '{name}': autoCloseAfter"))?;
        Ok(Self {
            definition,
            path: PathBuf::new(),
            checksum: String::new(),
            filters: Vec::new(),
            actions: Vec::new(),
            hooks: Vec::new(),
            schedule,
            auto_merge_after,
            auto_close_after,
            inputs: BTreeMap::new(),
            open_prs: 0,
            change_count: 0,
        })
    }

    /// Build a task with its built-in filters and actions.
    pub fn build(
        definition: TaskDefinition,
        path: &Path,
        checksum: &str,
        settings: &ActionSettings,
        cli_inputs: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut task = Self::new(definition)?;
        let name = task.definition.name.clone();
        task.path = path.to_path_buf();
        task.checksum = checksum.to_string();
        for (idx, spec) in task.definition.filters.iter().enumerate() {
            let filter = build_filter(spec)
                .with_context(|| format!("task '{name}': filter {}", idx + 1))?;
            task.filters.push(filter);
        }
        for (idx, spec) in task.definition.actions.iter().enumerate() {
            let action = build_action(spec, settings)
                .with_context(|| format!("task '{name}': action {}", idx + 1))?;
            task.actions.push(action);
        }
        task.inputs = resolve_inputs(&task.definition, cli_inputs)
            .with_context(|| format!("task '{name}'"))?;
        Ok(task)
    }

    pub fn with_filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_action(mut self, action: Box<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn TaskHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn filters(&self) -> &[Box<dyn Filter>] {
        &self.filters
    }

    pub fn actions(&self) -> &[Box<dyn Action>] {
        &self.actions
    }

    pub fn hooks(&self) -> &[Box<dyn TaskHook>] {
        &self.hooks
    }

    pub fn auto_merge_after(&self) -> Option<Duration> {
        self.auto_merge_after
    }

    pub fn auto_close_after(&self) -> Option<Duration> {
        self.auto_close_after
    }

    pub fn is_within_schedule(&self, now: DateTime<Utc>) -> bool {
        self.schedule.matches(now)
    }

    pub fn has_reached_max_open_prs(&self) -> bool {
        self.definition.max_open_prs > 0 && self.open_prs >= self.definition.max_open_prs
    }

    pub fn has_reached_change_limit(&self) -> bool {
        self.definition.change_limit > 0 && self.change_count >= self.definition.change_limit
    }

    pub fn open_prs(&self) -> u32 {
        self.open_prs
    }

    pub fn change_count(&self) -> u32 {
        self.change_count
    }

    /// Feed a processing result into the run-scoped counters.
    pub fn record_result(&mut self, result: ProcessResult) {
        if result.counts_as_open_pr() {
            self.open_prs += 1;
        }
        if result.counts_as_change() {
            self.change_count += 1;
        }
    }

    pub fn template_data(&self, repo: &dyn Repository) -> TemplateData {
        TemplateData::new(repo, self.name(), self.inputs.clone())
    }

    /// Deterministic branch of this task, bounded to the host limit.
    pub fn render_branch_name(&self, templates: &Templates, data: &TemplateData) -> Result<String> {
        if self.definition.branch_name.is_empty() {
            return Ok(default_branch_name(self.name()));
        }
        let rendered = templates
            .render_str(&self.definition.branch_name, data)
            .context("render branch name")?;
        let rendered = rendered.trim().to_string();
        if rendered.is_empty() {
            bail!("branch name template rendered to an empty string");
        }
        Ok(truncate_branch_name(rendered))
    }

    pub fn render_pr_title(&self, templates: &Templates, data: &TemplateData) -> Result<String> {
        let source = if self.definition.pr_title.is_empty() {
            "sweeper: task {{ task_name }}"
        } else {
            &self.definition.pr_title
        };
        let title = templates.render_str(source, data).context("render pr title")?;
        Ok(title.trim().to_string())
    }

    pub fn render_pr_body(&self, templates: &Templates, data: &TemplateData) -> Result<String> {
        let source = if self.definition.pr_body.is_empty() {
            "Apply changes from task {{ task_name }}."
        } else {
            &self.definition.pr_body
        };
        templates.render_str(source, data).context("render pr body")
    }

    pub fn on_pr_created(&self, repo: &dyn Repository) -> Result<()> {
        for hook in &self.hooks {
            hook.on_pr_created(repo).context("pr created hook")?;
        }
        Ok(())
    }

    pub fn on_pr_closed(&self, repo: &dyn Repository) -> Result<()> {
        for hook in &self.hooks {
            hook.on_pr_closed(repo).context("pr closed hook")?;
        }
        Ok(())
    }

    pub fn on_pr_merged(&self, repo: &dyn Repository) -> Result<()> {
        for hook in &self.hooks {
            hook.on_pr_merged(repo).context("pr merged hook")?;
        }
        Ok(())
    }
}

fn parse_optional_duration(raw: Option<&str>) -> Result<Option<Duration>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_duration(raw).map(Some),
    }
}

fn resolve_inputs(
    definition: &TaskDefinition,
    cli_inputs: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    for input in &definition.inputs {
        let value = match (cli_inputs.get(&input.name), &input.default) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => bail!("input '{}' is required", input.name),
        };
        resolved.insert(input.name.clone(), value);
    }
    Ok(resolved)
}

/// Build every active task of the given files.
///
/// Inactive tasks are dropped with a warning. `extra_labels` are appended to
/// each task's labels.
pub fn build_tasks(
    files: &[TaskFile],
    settings_for: impl Fn(&Path) -> ActionSettings,
    cli_inputs: &BTreeMap<String, String>,
    extra_labels: &[String],
) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for file in files {
        let settings = settings_for(&file.path);
        for definition in &file.definitions {
            if !definition.active {
                warn!(task = %definition.name, path = %file.path.display(), "task inactive, skipping");
                continue;
            }
            let mut definition = definition.clone();
            for label in extra_labels {
                if !definition.labels.contains(label) {
                    definition.labels.push(label.clone());
                }
            }
            tasks.push(Task::build(
                definition,
                &file.path,
                &file.checksum,
                &settings,
                cli_inputs,
            )?);
        }
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::task_file::{InputSpec, parse_definitions};
    use crate::test_support::FakeRepository;

    fn settings() -> ActionSettings {
        ActionSettings {
            task_dir: PathBuf::from("/tasks"),
            default_timeout: Duration::from_secs(5),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn counters_gate_only_when_limits_are_set() {
        let mut definition = TaskDefinition::named("t");
        let mut unlimited = Task::new(definition.clone()).expect("task");
        unlimited.record_result(ProcessResult::PrCreated);
        assert!(!unlimited.has_reached_max_open_prs());
        assert!(!unlimited.has_reached_change_limit());

        definition.max_open_prs = 2;
        definition.change_limit = 1;
        let mut limited = Task::new(definition).expect("task");
        limited.record_result(ProcessResult::PrOpen);
        assert!(!limited.has_reached_max_open_prs());
        assert!(!limited.has_reached_change_limit());
        limited.record_result(ProcessResult::PrCreated);
        assert!(limited.has_reached_max_open_prs());
        assert!(limited.has_reached_change_limit());
        assert_eq!(limited.open_prs(), 2);
        assert_eq!(limited.change_count(), 1);
    }

    #[test]
    fn branch_name_defaults_and_templates() {
        let templates = Templates::new();
        let repo = FakeRepository::new("github.com/acme/widgets");

        let task = Task::new(TaskDefinition::named("Bump Go")).expect("task");
        let data = task.template_data(&repo);
        assert_eq!(
            task.render_branch_name(&templates, &data).expect("render"),
            "sweeper--bump-go"
        );

        let mut definition = TaskDefinition::named("Bump Go");
        definition.branch_name = format!("bot/{{{{ repository.name }}}}-{}", "x".repeat(300));
        let task = Task::new(definition).expect("task");
        let name = task.render_branch_name(&templates, &data).expect("render");
        assert!(name.starts_with("bot/widgets-"));
        assert_eq!(name.len(), 230);
    }

    #[test]
    fn default_title_and_body_mention_task() {
        let templates = Templates::new();
        let repo = FakeRepository::new("github.com/acme/widgets");
        let task = Task::new(TaskDefinition::named("cleanup")).expect("task");
        let data = task.template_data(&repo);
        assert_eq!(
            task.render_pr_title(&templates, &data).expect("title"),
            "sweeper: task cleanup"
        );
        assert_eq!(
            task.render_pr_body(&templates, &data).expect("body"),
            "Apply changes from task cleanup."
        );
    }

    #[test]
    fn inputs_fall_back_to_defaults_and_require_values() {
        let mut definition = TaskDefinition::named("t");
        definition.inputs = vec![
            InputSpec {
                name: "version".to_string(),
                default: Some("1.0".to_string()),
                description: None,
            },
            InputSpec {
                name: "ticket".to_string(),
                default: None,
                description: None,
            },
        ];
        let mut cli = BTreeMap::new();
        assert!(Task::build(definition.clone(), Path::new("t.yaml"), "c", &settings(), &cli).is_err());

        cli.insert("ticket".to_string(), "OPS-1".to_string());
        let task = Task::build(definition, Path::new("t.yaml"), "c", &settings(), &cli).expect("build");
        let data = task.template_data(&FakeRepository::new("github.com/a/b"));
        assert_eq!(data.run["version"], "1.0");
        assert_eq!(data.run["ticket"], "OPS-1");
    }

    #[test]
    fn invalid_durations_fail_the_task() {
        let mut definition = TaskDefinition::named("t");
        definition.auto_merge_after = Some("two days".to_string());
        assert!(Task::new(definition).is_err());
    }

    #[test]
    fn build_tasks_skips_inactive_and_merges_labels() {
        let defs = parse_definitions(
            "name: a\nlabels: [deps]\n---\nname: b\nactive: false\n",
        )
        .expect("parse");
        let file = TaskFile {
            path: PathBuf::from("/tasks/t.yaml"),
            checksum: "abc".to_string(),
            definitions: defs,
        };
        let tasks = build_tasks(
            &[file],
            |_| settings(),
            &BTreeMap::new(),
            &["automated".to_string(), "deps".to_string()],
        )
        .expect("build");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].definition.labels, vec!["deps", "automated"]);
        assert_eq!(tasks[0].checksum, "abc");
    }
}
