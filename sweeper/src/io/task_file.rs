//! YAML task definition files.
//!
//! A file holds one or more documents separated by `---`; each document is a
//! [`TaskDefinition`]. All tasks of a file share the file's checksum.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::schedule::EVERY_MINUTE;

/// Parameters of a filter or action, as written in the task file.
pub type Params = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    pub filter: String,
    #[serde(default)]
    pub params: Params,
    /// Negate the filter outcome.
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    pub action: String,
    #[serde(default)]
    pub params: Params,
}

/// Input a task expects from the command line (`--input name=value`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One task as authored in YAML (camelCase keys).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    /// Template; empty means `sweeper--<slug(name)>`.
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub pr_title: String,
    #[serde(default)]
    pub pr_body: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub merge_once: bool,
    #[serde(default)]
    pub create_only: bool,
    #[serde(default)]
    pub auto_merge: bool,
    /// Duration string such as `48h`.
    #[serde(default)]
    pub auto_merge_after: Option<String>,
    #[serde(default)]
    pub auto_close_after: Option<String>,
    #[serde(default, rename = "maxOpenPRs")]
    pub max_open_prs: u32,
    #[serde(default)]
    pub change_limit: u32,
    #[serde(default)]
    pub keep_branch_after_merge: bool,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
}

fn default_active() -> bool {
    true
}

fn default_schedule() -> String {
    EVERY_MINUTE.to_string()
}

impl TaskDefinition {
    /// Minimal definition with every optional field at its default.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: true,
            filters: Vec::new(),
            actions: Vec::new(),
            branch_name: String::new(),
            pr_title: String::new(),
            pr_body: String::new(),
            commit_message: String::new(),
            assignees: Vec::new(),
            reviewers: Vec::new(),
            labels: Vec::new(),
            merge_once: false,
            create_only: false,
            auto_merge: false,
            auto_merge_after: None,
            auto_close_after: None,
            max_open_prs: 0,
            change_limit: 0,
            keep_branch_after_merge: false,
            schedule: default_schedule(),
            inputs: Vec::new(),
        }
    }
}

/// Parsed content of one task file.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub path: PathBuf,
    /// Hex SHA-256 of the raw file bytes.
    pub checksum: String,
    pub definitions: Vec<TaskDefinition>,
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Read and parse a task file.
pub fn load_task_file(path: &Path) -> Result<TaskFile> {
    let bytes = fs::read(path).with_context(|| format!("read task file {}", path.display()))?;
    let contents = std::str::from_utf8(&bytes)
        .with_context(|| format!("task file {} is not UTF-8", path.display()))?;
    let definitions =
        parse_definitions(contents).with_context(|| format!("parse task file {}", path.display()))?;
    debug!(path = %path.display(), tasks = definitions.len(), "task file loaded");
    Ok(TaskFile {
        path: path.to_path_buf(),
        checksum: checksum(&bytes),
        definitions,
    })
}

/// Parse every non-empty YAML document of `contents`.
pub fn parse_definitions(contents: &str) -> Result<Vec<TaskDefinition>> {
    let mut definitions = Vec::new();
    for (idx, document) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("document {}", idx + 1))?;
        if value.is_null() {
            continue;
        }
        let definition: TaskDefinition = serde_yaml::from_value(value)
            .with_context(|| format!("document {}", idx + 1))?;
        if definition.name.trim().is_empty() {
            bail!("document {}: task name must not be empty", idx + 1);
        }
        definitions.push(definition);
    }
    if definitions.is_empty() {
        bail!("no task defined");
    }
    Ok(definitions)
}
