//! Filters decide whether a task applies to a repository.
//!
//! Filters only read from the host; they never need a checkout. A task's
//! filters are combined with logical AND by the processor.

use std::fmt;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::action::parse_params;
use crate::host::Repository;
use crate::io::task_file::FilterSpec;

/// What a filter may inspect.
pub struct FilterContext<'a> {
    pub repository: &'a dyn Repository,
}

/// A predicate over a repository.
pub trait Filter: fmt::Display {
    fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool>;
}

/// Construct a built-in filter from its task-file spec.
pub fn build_filter(spec: &FilterSpec) -> Result<Box<dyn Filter>> {
    let filter: Box<dyn Filter> = match spec.filter.as_str() {
        "repositoryName" => Box::new(RepositoryNameFilter::from_params(parse_params(
            &spec.params,
        )?)?),
        "file" => Box::new(FileFilter::from_params(parse_params(&spec.params)?)?),
        "fileContent" => Box::new(FileContentFilter::from_params(parse_params(&spec.params)?)?),
        other => bail!("unknown filter '{other}'"),
    };
    if spec.reverse {
        return Ok(Box::new(Reverse(filter)));
    }
    Ok(filter)
}

/// Negates the wrapped filter. Errors pass through unchanged.
pub struct Reverse(pub Box<dyn Filter>);

impl fmt::Display for Reverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{}", self.0)
    }
}

impl Filter for Reverse {
    fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool> {
        Ok(!self.0.matches(ctx)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryNameParams {
    names: Vec<String>,
}

/// Matches the repository full name against anchored regular expressions.
pub struct RepositoryNameFilter {
    patterns: Vec<Regex>,
    raw: Vec<String>,
}

impl RepositoryNameFilter {
    fn from_params(params: RepositoryNameParams) -> Result<Self> {
        if params.names.is_empty() {
            bail!("repositoryName: names must not be empty");
        }
        let patterns = params
            .names
            .iter()
            .map(|name| {
                Regex::new(&format!("^{name}$"))
                    .with_context(|| format!("repositoryName: invalid pattern '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            raw: params.names,
        })
    }
}

impl fmt::Display for RepositoryNameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repositoryName(names=[{}])", self.raw.join(","))
    }
}

impl Filter for RepositoryNameFilter {
    fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool> {
        let full_name = ctx.repository.full_name();
        Ok(self.patterns.iter().any(|re| re.is_match(&full_name)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileParams {
    path: String,
}

/// Matches if the file exists on the base branch.
pub struct FileFilter {
    path: String,
}

impl FileFilter {
    fn from_params(params: FileParams) -> Result<Self> {
        if params.path.trim().is_empty() {
            bail!("file: path must not be empty");
        }
        Ok(Self { path: params.path })
    }
}

impl fmt::Display for FileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file(path={})", self.path)
    }
}

impl Filter for FileFilter {
    fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool> {
        ctx.repository
            .has_file(&self.path)
            .with_context(|| format!("check file {}", self.path))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileContentParams {
    path: String,
    search: String,
}

/// Matches if any line of a file matches `search`. A missing file never matches.
pub struct FileContentFilter {
    path: String,
    search: Regex,
}

impl FileContentFilter {
    fn from_params(params: FileContentParams) -> Result<Self> {
        let search = Regex::new(&params.search)
            .with_context(|| format!("fileContent: invalid search '{}'", params.search))?;
        Ok(Self {
            path: params.path,
            search,
        })
    }
}

impl fmt::Display for FileContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fileContent(path={}, search={})", self.path, self.search)
    }
}

impl Filter for FileContentFilter {
    fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool> {
        let Some(content) = ctx
            .repository
            .get_file(&self.path)
            .with_context(|| format!("read file {}", self.path))?
        else {
            debug!(path = %self.path, "file not found");
            return Ok(false);
        };
        Ok(content.lines().any(|line| self.search.is_match(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::task_file::Params;
    use crate::test_support::FakeRepository;
    use serde_json::json;

    fn spec(filter: &str, params: serde_json::Value, reverse: bool) -> FilterSpec {
        let params: Params = serde_json::from_value(params).expect("params");
        FilterSpec {
            filter: filter.to_string(),
            params,
            reverse,
        }
    }

    #[test]
    fn repository_name_is_anchored() {
        let repo = FakeRepository::new("github.com/acme/widgets");
        let ctx = FilterContext { repository: &repo };
        let exact = build_filter(&spec(
            "repositoryName",
            json!({"names": ["github.com/acme/.*"]}),
            false,
        ))
        .expect("build");
        assert!(exact.matches(&ctx).expect("match"));
        let partial = build_filter(&spec(
            "repositoryName",
            json!({"names": ["acme/widgets"]}),
            false,
        ))
        .expect("build");
        assert!(!partial.matches(&ctx).expect("match"));
    }

    #[test]
    fn file_and_content_filters_read_the_host() {
        let repo = FakeRepository::new("github.com/acme/widgets")
            .with_file("go.mod", "module x\n\ngo 1.21\n");
        let ctx = FilterContext { repository: &repo };

        let has = build_filter(&spec("file", json!({"path": "go.mod"}), false)).expect("build");
        assert!(has.matches(&ctx).expect("match"));
        let missing = build_filter(&spec("file", json!({"path": "Cargo.toml"}), true))
            .expect("build");
        assert_eq!(missing.to_string(), "!file(path=Cargo.toml)");
        assert!(missing.matches(&ctx).expect("match"));

        let content = build_filter(&spec(
            "fileContent",
            json!({"path": "go.mod", "search": "^go 1\\.21$"}),
            false,
        ))
        .expect("build");
        assert!(content.matches(&ctx).expect("match"));
        let absent = build_filter(&spec(
            "fileContent",
            json!({"path": "nope", "search": "x"}),
            false,
        ))
        .expect("build");
        assert!(!absent.matches(&ctx).expect("match"));
    }

    #[test]
    fn rejects_unknown_filters_and_bad_params() {
        assert!(build_filter(&spec("jq", json!({}), false)).is_err());
        assert!(build_filter(&spec("repositoryName", json!({"names": []}), false)).is_err());
        assert!(build_filter(&spec("fileContent", json!({"path": "x", "search": "("}), false)).is_err());
    }
}
