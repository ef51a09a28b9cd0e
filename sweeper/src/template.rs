//! Rendering of branch names, PR titles/bodies and bot comments.
//!
//! One [`Templates`] value is built at startup and passed to whoever renders;
//! there is no process-wide template cache.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::duration::format_duration;
use crate::host::Repository;

const PULL_REQUEST_DESCRIPTION_TEMPLATE: &str = include_str!("templates/pull_request_description.md");
const BRANCH_MODIFIED_TEMPLATE: &str = include_str!("templates/branch_modified.md");

/// Repository fields exposed to task templates as `repository.*`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RepositoryData {
    pub full_name: String,
    pub host: String,
    pub name: String,
    pub owner: String,
    pub web_url: String,
}

/// Root value every task template is rendered with.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TemplateData {
    /// Task inputs, `run.<name>` in templates.
    pub run: BTreeMap<String, String>,
    pub repository: RepositoryData,
    pub task_name: String,
}

impl TemplateData {
    pub fn new(repo: &dyn Repository, task_name: &str, run: BTreeMap<String, String>) -> Self {
        Self {
            run,
            repository: RepositoryData {
                full_name: repo.full_name(),
                host: repo.host().name(),
                name: repo.name(),
                owner: repo.owner(),
                web_url: repo.web_url(),
            },
            task_name: task_name.to_string(),
        }
    }
}

/// Policy sentences embedded in every PR description.
#[derive(Debug, Clone, Copy)]
pub struct DescriptionPolicy {
    pub auto_merge: bool,
    pub auto_merge_after: Option<Duration>,
    pub merge_once: bool,
}

impl DescriptionPolicy {
    fn auto_merge_text(&self) -> String {
        if !self.auto_merge {
            return "Disabled. Merge this manually.".to_string();
        }
        match self.auto_merge_after {
            Some(after) if !after.is_zero() => format!(
                "Enabled. The bot merges this automatically in {} once all checks have passed.",
                format_duration(after)
            ),
            _ => "Enabled. The bot merges this automatically on its next run once all checks have passed."
                .to_string(),
        }
    }

    fn ignore_text(&self) -> &'static str {
        if self.merge_once {
            "Close this PR and it will not be recreated again."
        } else {
            "This PR will be recreated if closed."
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct Templates {
    env: Environment<'static>,
}

impl Default for Templates {
    fn default() -> Self {
        Self::new()
    }
}

impl Templates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // File contents rendered by actions must keep their final newline.
        env.set_keep_trailing_newline(true);
        env.add_template("pull_request_description.md", PULL_REQUEST_DESCRIPTION_TEMPLATE)
            .expect("pull request description template should be valid");
        env.add_template("branch_modified.md", BRANCH_MODIFIED_TEMPLATE)
            .expect("branch modified template should be valid");
        Self { env }
    }

    /// Render a task-authored template string.
    pub fn render_str(&self, source: &str, data: &TemplateData) -> Result<String> {
        self.env
            .render_str(source, data)
            .with_context(|| format!("render template '{source}'"))
    }

    /// Wrap a rendered PR body with the policy footer and the rebase checkbox.
    pub fn render_pull_request_description(
        &self,
        body: &str,
        policy: DescriptionPolicy,
    ) -> Result<String> {
        let template = self.env.get_template("pull_request_description.md")?;
        let rendered = template
            .render(context! {
                body => body.trim(),
                auto_merge_text => policy.auto_merge_text(),
                ignore_text => policy.ignore_text(),
            })
            .context("render pull request description")?;
        Ok(rendered)
    }

    /// Warning comment listing commits the bot will not overwrite.
    pub fn render_branch_modified(&self, checksums: &[String], base_branch: &str) -> Result<String> {
        let template = self.env.get_template("branch_modified.md")?;
        let rendered = template
            .render(context! {
                checksums => checksums,
                base_branch => base_branch,
            })
            .context("render branch modified comment")?;
        Ok(rendered)
    }
}
