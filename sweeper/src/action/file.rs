use std::fmt;
use std::fs;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use super::{Action, ActionContext};

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileCreateParams {
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_overwrite")]
    overwrite: bool,
    /// Octal permission bits such as `"755"`.
    #[serde(default)]
    mode: Option<String>,
}

/// Write a file, rendering its content as a task template.
#[derive(Debug, Clone)]
pub struct FileCreateAction {
    path: String,
    content: String,
    overwrite: bool,
    mode: Option<u32>,
}

impl FileCreateAction {
    pub(crate) fn from_params(params: FileCreateParams) -> Result<Self> {
        let mode = params
            .mode
            .as_deref()
            .map(|raw| {
                u32::from_str_radix(raw.trim_start_matches("0o"), 8)
                    .with_context(|| format!("fileCreate: invalid mode '{raw}'"))
            })
            .transpose()?;
        if params.path.trim().is_empty() {
            bail!("fileCreate: path must not be empty");
        }
        Ok(Self {
            path: params.path,
            content: params.content,
            overwrite: params.overwrite,
            mode,
        })
    }
}

impl fmt::Display for FileCreateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fileCreate(path={})", self.path)
    }
}

impl Action for FileCreateAction {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let target = ctx.resolve(&self.path)?;
        if target.exists() && !self.overwrite {
            debug!(path = %self.path, "file exists and overwrite is off");
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let content = ctx.templates.render_str(&self.content, ctx.data)?;
        fs::write(&target, content).with_context(|| format!("write {}", target.display()))?;
        if let Some(mode) = self.mode {
            set_mode(&target, mode)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("set mode of {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileDeleteParams {
    path: String,
}

/// Remove a file or directory. A missing path is not an error.
#[derive(Debug, Clone)]
pub struct FileDeleteAction {
    path: String,
}

impl FileDeleteAction {
    pub(crate) fn from_params(params: FileDeleteParams) -> Result<Self> {
        if params.path.trim().is_empty() {
            bail!("fileDelete: path must not be empty");
        }
        Ok(Self { path: params.path })
    }
}

impl fmt::Display for FileDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fileDelete(path={})", self.path)
    }
}

impl Action for FileDeleteAction {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let target = ctx.resolve(&self.path)?;
        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path, "file already absent");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("delete {}", target.display())),
        }
    }
}
