//! Capability traits over code-hosting platforms.
//!
//! Host API clients live outside this crate. The processor and the git
//! reconciler depend only on [`Repository`]; the orchestrator additionally
//! uses [`Host`] for discovery. Host-specific pull-request payloads stay
//! behind [`PullRequestRaw`] so they never leak into policy code.

use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity the host reports for the authenticated bot account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
    Unknown,
}

/// Host-specific representation of a pull request, kept opaque.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PullRequestRaw {
    GitHub(serde_json::Value),
    GitLab(serde_json::Value),
    #[default]
    None,
}

/// An existing change request, found by its source branch.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub web_url: String,
    pub created_at: DateTime<Utc>,
    pub state: PullRequestState,
    pub branch_name: String,
    pub title: String,
    pub body: String,
    pub raw: PullRequestRaw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestComment {
    pub id: u64,
    pub body: String,
}

/// Fully rendered content of a pull request to create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequestData {
    pub title: String,
    pub body: String,
    pub assignees: Vec<String>,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
    pub auto_merge: bool,
    pub auto_merge_after: Option<Duration>,
    pub merge_once: bool,
    pub task_name: String,
}

/// Metadata of the host serving a repository.
pub trait HostDetail {
    /// Host name, e.g. `github.com`.
    fn name(&self) -> String;

    /// Account the bot authenticates as. `None` if the host cannot tell.
    fn authenticated_user(&self) -> Result<Option<UserInfo>>;
}

/// A hosted repository and every pull-request operation on it.
///
/// Implementations are consumed, never owned, by the processor: the core
/// keeps no repository state beyond a single processing pass.
pub trait Repository: Send + Sync {
    fn host(&self) -> &dyn HostDetail;

    /// `<host>/<owner>/<name>`.
    fn full_name(&self) -> String;
    fn name(&self) -> String;
    fn owner(&self) -> String;
    fn base_branch(&self) -> String;
    fn clone_url_http(&self) -> String;
    fn clone_url_ssh(&self) -> String;
    fn web_url(&self) -> String;

    /// Last change the host knows about. Used to skip needless pulls.
    fn updated_at(&self) -> DateTime<Utc>;

    /// Content of a file on the base branch; `None` if absent.
    fn get_file(&self, path: &str) -> Result<Option<String>>;

    fn has_file(&self, path: &str) -> Result<bool> {
        Ok(self.get_file(path)?.is_some())
    }

    /// Look up the change request whose source branch is `branch`.
    ///
    /// `Ok(None)` is the common "never created" state, not an error.
    fn find_pull_request(&self, branch: &str) -> Result<Option<PullRequest>>;

    fn is_pull_request_open(&self, pr: &PullRequest) -> bool {
        pr.state == PullRequestState::Open
    }

    fn is_pull_request_closed(&self, pr: &PullRequest) -> bool {
        pr.state == PullRequestState::Closed
    }

    fn is_pull_request_merged(&self, pr: &PullRequest) -> bool {
        pr.state == PullRequestState::Merged
    }

    fn get_pull_request_body(&self, pr: &PullRequest) -> String {
        pr.body.clone()
    }

    fn get_pull_request_creation_time(&self, pr: &PullRequest) -> DateTime<Utc> {
        pr.created_at
    }

    fn create_pull_request(&self, branch: &str, data: &PullRequestData) -> Result<PullRequest>;
    fn update_pull_request(&self, data: &PullRequestData, pr: &PullRequest) -> Result<()>;
    fn close_pull_request(&self, message: &str, pr: &PullRequest) -> Result<()>;
    fn merge_pull_request(&self, delete_branch: bool, pr: &PullRequest) -> Result<()>;
    fn delete_branch(&self, pr: &PullRequest) -> Result<()>;
    fn can_merge_pull_request(&self, pr: &PullRequest) -> Result<bool>;
    fn has_successful_pull_request_build(&self, pr: &PullRequest) -> Result<bool>;
    fn list_pull_request_comments(&self, pr: &PullRequest) -> Result<Vec<PullRequestComment>>;
    fn create_pull_request_comment(&self, body: &str, pr: &PullRequest) -> Result<()>;
    fn delete_pull_request_comment(
        &self,
        comment: &PullRequestComment,
        pr: &PullRequest,
    ) -> Result<()>;
}

impl fmt::Debug for dyn Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("full_name", &self.full_name())
            .finish()
    }
}

/// Message a host sends while discovering repositories.
pub enum Discovery {
    Batch(Vec<Box<dyn Repository>>),
    /// Last message of one listing; carries its outcome.
    Finished(Result<()>),
}

/// Write end of a discovery channel handed to [`Host`] listings.
#[derive(Clone)]
pub struct RepositorySink {
    tx: Sender<Discovery>,
}

impl RepositorySink {
    pub fn new(tx: Sender<Discovery>) -> Self {
        Self { tx }
    }

    /// Forward a batch. Fails once the orchestrator stopped listening.
    pub fn send(&self, batch: Vec<Box<dyn Repository>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Discovery::Batch(batch))
            .map_err(|_| anyhow::anyhow!("repository receiver dropped"))
    }

    pub(crate) fn finish(&self, outcome: Result<()>) {
        // A dropped receiver means the run already aborted.
        let _ = self.tx.send(Discovery::Finished(outcome));
    }
}

/// A code-hosting platform able to resolve and list repositories.
pub trait Host: HostDetail + Send + Sync {
    /// Resolve a repository by name. `None` if this host does not serve it.
    fn create_from_name(&self, name: &str) -> Result<Option<Box<dyn Repository>>>;

    /// Stream all repositories, or only those updated after `since`.
    fn list_repositories(&self, since: Option<DateTime<Utc>>, sink: &RepositorySink)
    -> Result<()>;

    /// Stream repositories with open pull requests authored by the bot.
    fn list_repositories_with_open_pull_requests(&self, sink: &RepositorySink) -> Result<()>;
}

/// Resolve `name` through the first host that serves it.
pub fn repository_from_name(hosts: &[Box<dyn Host>], name: &str) -> Result<Box<dyn Repository>> {
    for host in hosts {
        if let Some(repo) = host
            .create_from_name(name)
            .with_context(|| format!("resolve repository '{name}' on host '{}'", host.name()))?
        {
            return Ok(repo);
        }
    }
    let names: Vec<String> = hosts.iter().map(|h| format!("'{}'", h.name())).collect();
    bail!(
        "no host found for repository '{name}' (available hosts: {})",
        names.join(", ")
    )
}

/// Hidden prefix that tags a bot comment with `identifier`.
pub fn comment_marker(identifier: &str) -> String {
    format!("<!-- sweeper::{{{identifier}}} -->")
}

/// Post `body` tagged with `identifier` unless a tagged comment already exists.
pub fn create_pull_request_comment_with_identifier(
    repo: &dyn Repository,
    body: &str,
    identifier: &str,
    pr: &PullRequest,
) -> Result<()> {
    if identifier.is_empty() {
        bail!("comment identifier is empty");
    }
    let marker = comment_marker(identifier);
    let comments = repo
        .list_pull_request_comments(pr)
        .context("list pull request comments")?;
    if comments.iter().any(|c| c.body.starts_with(&marker)) {
        debug!(identifier, "tagged comment already present");
        return Ok(());
    }
    debug!(repository = %repo.full_name(), identifier, "creating tagged comment");
    repo.create_pull_request_comment(&format!("{marker}\n{body}"), pr)
        .context("create pull request comment")
}

/// Delete the first comment tagged with `identifier`, if any.
pub fn delete_pull_request_comment_by_identifier(
    repo: &dyn Repository,
    identifier: &str,
    pr: &PullRequest,
) -> Result<()> {
    if identifier.is_empty() {
        bail!("comment identifier is empty");
    }
    let marker = comment_marker(identifier);
    let comments = repo
        .list_pull_request_comments(pr)
        .context("list pull request comments")?;
    if let Some(comment) = comments.iter().find(|c| c.body.starts_with(&marker)) {
        debug!(repository = %repo.full_name(), identifier, "deleting tagged comment");
        repo.delete_pull_request_comment(comment, pr)
            .with_context(|| format!("delete comment by identifier {identifier}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeHost, FakeRepository, pull_request};
    use chrono::TimeDelta;

    fn pr() -> PullRequest {
        pull_request(7, "sweeper--demo", PullRequestState::Open, TimeDelta::hours(1))
    }

    #[test]
    fn tagged_comment_is_created_once() {
        let repo = FakeRepository::new("github.com/acme/widgets");
        create_pull_request_comment_with_identifier(&repo, "hello", "greeting", &pr())
            .expect("first");
        create_pull_request_comment_with_identifier(&repo, "hello again", "greeting", &pr())
            .expect("second");

        let comments = repo.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].body, "<!-- sweeper::{greeting} -->\nhello");
    }

    #[test]
    fn delete_only_touches_tagged_comments() {
        let repo = FakeRepository::new("github.com/acme/widgets")
            .with_comment("unrelated")
            .with_comment(&format!("{}\nbody", comment_marker("greeting")));

        delete_pull_request_comment_by_identifier(&repo, "greeting", &pr()).expect("delete");
        delete_pull_request_comment_by_identifier(&repo, "greeting", &pr()).expect("no-op");

        let bodies: Vec<String> = repo.comments().into_iter().map(|c| c.body).collect();
        assert_eq!(bodies, vec!["unrelated".to_string()]);
        assert_eq!(repo.calls().delete_comment, 1);
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let repo = FakeRepository::new("github.com/acme/widgets");
        assert!(create_pull_request_comment_with_identifier(&repo, "x", "", &pr()).is_err());
        assert!(delete_pull_request_comment_by_identifier(&repo, "", &pr()).is_err());
    }

    #[test]
    fn repository_resolves_through_the_first_serving_host() {
        let hosts: Vec<Box<dyn Host>> = vec![
            Box::new(FakeHost::new("gitlab.com")),
            Box::new(
                FakeHost::new("github.com")
                    .with_repository(FakeRepository::new("github.com/acme/widgets")),
            ),
        ];
        let repo = repository_from_name(&hosts, "github.com/acme/widgets").expect("resolve");
        assert_eq!(repo.owner(), "acme");
        assert_eq!(repo.name(), "widgets");
        assert_eq!(repo.host().name(), "github.com");

        let err = repository_from_name(&hosts, "bitbucket.org/x/y").expect_err("unknown");
        assert!(err.to_string().contains("'gitlab.com', 'github.com'"));
    }
}
