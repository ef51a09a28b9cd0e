use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{Action, ActionContext};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LineReplaceParams {
    path: String,
    regexp: String,
    line: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LineDeleteParams {
    path: String,
    regexp: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LineInsertParams {
    path: String,
    line: String,
    /// `BOF` or `EOF` (default).
    #[serde(default)]
    position: Option<String>,
}

/// Replace every line matching `regexp` with `line`.
#[derive(Debug, Clone)]
pub struct LineReplaceAction {
    path: String,
    regexp: Regex,
    line: String,
}

/// Drop every line matching `regexp`.
#[derive(Debug, Clone)]
pub struct LineDeleteAction {
    path: String,
    regexp: Regex,
}

/// Add `line` at the start or end of a file unless it is already present.
#[derive(Debug, Clone)]
pub struct LineInsertAction {
    path: String,
    line: String,
    at_start: bool,
}

fn compile(action: &str, raw: &str) -> Result<Regex> {
    Regex::new(raw).with_context(|| format!("{action}: invalid regexp '{raw}'"))
}

impl LineReplaceAction {
    pub(crate) fn from_params(params: LineReplaceParams) -> Result<Self> {
        Ok(Self {
            regexp: compile("lineReplace", &params.regexp)?,
            path: params.path,
            line: params.line,
        })
    }
}

impl LineDeleteAction {
    pub(crate) fn from_params(params: LineDeleteParams) -> Result<Self> {
        Ok(Self {
            regexp: compile("lineDelete", &params.regexp)?,
            path: params.path,
        })
    }
}

impl LineInsertAction {
    pub(crate) fn from_params(params: LineInsertParams) -> Result<Self> {
        let at_start = match params.position.as_deref() {
            None | Some("EOF") => false,
            Some("BOF") => true,
            Some(other) => bail!("lineInsert: position must be BOF or EOF, got '{other}'"),
        };
        Ok(Self {
            path: params.path,
            line: params.line,
            at_start,
        })
    }
}

/// Read a file as lines. `None` if it does not exist.
fn read_lines(path: &Path) -> Result<Option<(Vec<String>, bool)>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trailing_newline = contents.ends_with('\n');
            Ok(Some((
                contents.lines().map(str::to_string).collect(),
                trailing_newline,
            )))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn write_lines(path: &Path, lines: &[String], trailing_newline: bool) -> Result<()> {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("write {}", path.display()))
}

impl fmt::Display for LineReplaceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lineReplace(path={}, regexp={})", self.path, self.regexp)
    }
}

impl Action for LineReplaceAction {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let target = ctx.resolve(&self.path)?;
        let Some((mut lines, trailing)) = read_lines(&target)? else {
            debug!(path = %self.path, "file missing, nothing to replace");
            return Ok(());
        };
        let line = ctx.templates.render_str(&self.line, ctx.data)?;
        let mut changed = false;
        for current in &mut lines {
            if self.regexp.is_match(current) && *current != line {
                current.clone_from(&line);
                changed = true;
            }
        }
        if changed {
            write_lines(&target, &lines, trailing)?;
        }
        Ok(())
    }
}

impl fmt::Display for LineDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lineDelete(path={}, regexp={})", self.path, self.regexp)
    }
}

impl Action for LineDeleteAction {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let target = ctx.resolve(&self.path)?;
        let Some((lines, trailing)) = read_lines(&target)? else {
            return Ok(());
        };
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| !self.regexp.is_match(line))
            .collect();
        if kept.len() != before {
            write_lines(&target, &kept, trailing)?;
        }
        Ok(())
    }
}

impl fmt::Display for LineInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = if self.at_start { "BOF" } else { "EOF" };
        write!(f, "lineInsert(path={}, position={position})", self.path)
    }
}

impl Action for LineInsertAction {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let target = ctx.resolve(&self.path)?;
        let line = ctx.templates.render_str(&self.line, ctx.data)?;
        let (mut lines, trailing) = read_lines(&target)?.unwrap_or((Vec::new(), true));
        if lines.iter().any(|existing| *existing == line) {
            return Ok(());
        }
        if self.at_start {
            lines.insert(0, line);
        } else {
            lines.push(line);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        write_lines(&target, &lines, trailing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TemplateData, Templates};
    use crate::test_support::FakeRepository;
    use std::collections::BTreeMap;

    struct Fixture {
        dir: tempfile::TempDir,
        repo: FakeRepository,
        data: TemplateData,
        templates: Templates,
    }

    impl Fixture {
        fn new(file: &str) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            fs::write(dir.path().join("f.txt"), file).expect("write");
            let repo = FakeRepository::new("github.com/acme/widgets");
            let data = TemplateData::new(&repo, "t", BTreeMap::new());
            Self {
                dir,
                repo,
                data,
                templates: Templates::new(),
            }
        }

        fn apply(&self, action: &dyn Action) {
            let ctx = ActionContext {
                checkout: self.dir.path(),
                repository: &self.repo,
                data: &self.data,
                templates: &self.templates,
            };
            action.apply(&ctx).expect("apply");
        }

        fn read(&self) -> String {
            fs::read_to_string(self.dir.path().join("f.txt")).expect("read")
        }
    }

    #[test]
    fn replace_rewrites_matching_lines() {
        let fx = Fixture::new("go 1.21\nrequire x\n");
        let action = LineReplaceAction::from_params(LineReplaceParams {
            path: "f.txt".to_string(),
            regexp: "^go ".to_string(),
            line: "go 1.22".to_string(),
        })
        .expect("build");
        fx.apply(&action);
        assert_eq!(fx.read(), "go 1.22\nrequire x\n");
    }

    #[test]
    fn delete_drops_matching_lines() {
        let fx = Fixture::new("a\n# remove me\nb");
        let action = LineDeleteAction::from_params(LineDeleteParams {
            path: "f.txt".to_string(),
            regexp: "^#".to_string(),
        })
        .expect("build");
        fx.apply(&action);
        assert_eq!(fx.read(), "a\nb");
    }

    #[test]
    fn insert_is_idempotent() {
        let fx = Fixture::new("a\n");
        let action = LineInsertAction::from_params(LineInsertParams {
            path: "f.txt".to_string(),
            line: "top".to_string(),
            position: Some("BOF".to_string()),
        })
        .expect("build");
        fx.apply(&action);
        fx.apply(&action);
        assert_eq!(fx.read(), "top\na\n");
    }

    #[test]
    fn insert_rejects_unknown_position() {
        let result = LineInsertAction::from_params(LineInsertParams {
            path: "f.txt".to_string(),
            line: "x".to_string(),
            position: Some("middle".to_string()),
        });
        assert!(result.is_err());
    }
}
