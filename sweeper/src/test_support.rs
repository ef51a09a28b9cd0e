//! Test doubles for the processor and the orchestrator.
//!
//! Doubles share their recorded state through `Arc`, so a test can hand a
//! clone to the code under test and still inspect calls afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, TimeDelta, Utc};

use crate::action::{Action, ActionContext};
use crate::filter::{Filter, FilterContext};
use crate::host::{
    Host, HostDetail, PullRequest, PullRequestComment, PullRequestData, PullRequestRaw,
    PullRequestState, Repository, RepositorySink, UserInfo,
};
use crate::io::config::{GitAuthor, GitUrl};
use crate::io::git::{BranchModifiedError, EmptyRepositoryError, GitClient, GitSettings};
use crate::task::TaskHook;

pub const BOT_NAME: &str = "sweeper-bot";
pub const BOT_EMAIL: &str = "bot@example.com";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a pull request in `state`, created `age` ago.
pub fn pull_request(number: u64, branch: &str, state: PullRequestState, age: TimeDelta) -> PullRequest {
    PullRequest {
        number,
        web_url: format!("https://example.com/pr/{number}"),
        created_at: Utc::now() - age,
        state,
        branch_name: branch.to_string(),
        title: format!("PR {number}"),
        body: String::new(),
        raw: PullRequestRaw::None,
    }
}

#[derive(Debug, Clone)]
pub struct FakeHostDetail {
    pub name: String,
    pub user: Option<UserInfo>,
}

impl HostDetail for FakeHostDetail {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn authenticated_user(&self) -> Result<Option<UserInfo>> {
        Ok(self.user.clone())
    }
}

/// Number of mutating host calls made on a [`FakeRepository`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryCalls {
    pub create_pull_request: usize,
    pub update_pull_request: usize,
    pub close_pull_request: usize,
    pub merge_pull_request: usize,
    pub delete_branch: usize,
    pub create_comment: usize,
    pub delete_comment: usize,
}

impl RepositoryCalls {
    pub fn mutating(&self) -> usize {
        self.create_pull_request
            + self.update_pull_request
            + self.close_pull_request
            + self.merge_pull_request
            + self.delete_branch
            + self.create_comment
            + self.delete_comment
    }
}

#[derive(Debug, Default)]
struct FakeRepositoryState {
    base_branch: String,
    updated_at: Option<DateTime<Utc>>,
    pull_requests: Vec<PullRequest>,
    comments: Vec<PullRequestComment>,
    next_comment_id: u64,
    close_messages: Vec<String>,
    merge_delete_branch: Vec<bool>,
    last_data: Option<PullRequestData>,
    calls: RepositoryCalls,
}

/// In-memory [`Repository`] with scripted PR behavior.
#[derive(Debug, Clone)]
pub struct FakeRepository {
    full_name: String,
    host: FakeHostDetail,
    clone_url: String,
    files: BTreeMap<String, String>,
    build_success: bool,
    mergeable: bool,
    state: Arc<Mutex<FakeRepositoryState>>,
}

impl FakeRepository {
    /// `full_name` is `<host>/<owner>/<name>`.
    pub fn new(full_name: &str) -> Self {
        let host = full_name.split('/').next().unwrap_or_default().to_string();
        Self {
            full_name: full_name.to_string(),
            host: FakeHostDetail {
                name: host,
                user: Some(UserInfo {
                    name: BOT_NAME.to_string(),
                    email: BOT_EMAIL.to_string(),
                }),
            },
            clone_url: format!("https://{full_name}.git"),
            files: BTreeMap::new(),
            build_success: true,
            mergeable: true,
            state: Arc::new(Mutex::new(FakeRepositoryState {
                base_branch: "main".to_string(),
                updated_at: Some(Utc::now()),
                next_comment_id: 1,
                ..FakeRepositoryState::default()
            })),
        }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_clone_url(mut self, url: impl Into<String>) -> Self {
        self.clone_url = url.into();
        self
    }

    pub fn with_pull_request(self, pr: PullRequest) -> Self {
        lock(&self.state).pull_requests.push(pr);
        self
    }

    pub fn with_comment(self, body: &str) -> Self {
        {
            let mut state = lock(&self.state);
            let id = state.next_comment_id;
            state.next_comment_id += 1;
            state.comments.push(PullRequestComment {
                id,
                body: body.to_string(),
            });
        }
        self
    }

    pub fn with_build_success(mut self, success: bool) -> Self {
        self.build_success = success;
        self
    }

    pub fn with_mergeable(mut self, mergeable: bool) -> Self {
        self.mergeable = mergeable;
        self
    }

    pub fn with_user(mut self, user: Option<UserInfo>) -> Self {
        self.host.user = user;
        self
    }

    pub fn set_base_branch(&self, branch: &str) {
        lock(&self.state).base_branch = branch.to_string();
    }

    pub fn set_updated_at(&self, at: DateTime<Utc>) {
        lock(&self.state).updated_at = Some(at);
    }

    /// Simulate a user editing the description of PR `number`.
    pub fn set_pull_request_body(&self, number: u64, body: &str) {
        let mut state = lock(&self.state);
        if let Some(pr) = state.pull_requests.iter_mut().find(|pr| pr.number == number) {
            pr.body = body.to_string();
        }
    }

    pub fn calls(&self) -> RepositoryCalls {
        lock(&self.state).calls.clone()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        lock(&self.state).pull_requests.clone()
    }

    pub fn comments(&self) -> Vec<PullRequestComment> {
        lock(&self.state).comments.clone()
    }

    pub fn close_messages(&self) -> Vec<String> {
        lock(&self.state).close_messages.clone()
    }

    pub fn merge_delete_branch(&self) -> Vec<bool> {
        lock(&self.state).merge_delete_branch.clone()
    }

    pub fn last_pull_request_data(&self) -> Option<PullRequestData> {
        lock(&self.state).last_data.clone()
    }

    fn set_state(&self, pr: &PullRequest, new_state: PullRequestState) -> Result<()> {
        let mut state = lock(&self.state);
        let existing = state
            .pull_requests
            .iter_mut()
            .find(|p| p.number == pr.number)
            .ok_or_else(|| anyhow!("pull request {} not found", pr.number))?;
        existing.state = new_state;
        Ok(())
    }
}

impl Repository for FakeRepository {
    fn host(&self) -> &dyn HostDetail {
        &self.host
    }

    fn full_name(&self) -> String {
        self.full_name.clone()
    }

    fn name(&self) -> String {
        self.full_name.rsplit('/').next().unwrap_or_default().to_string()
    }

    fn owner(&self) -> String {
        let parts: Vec<&str> = self.full_name.split('/').collect();
        if parts.len() >= 3 {
            parts[1..parts.len() - 1].join("/")
        } else {
            String::new()
        }
    }

    fn base_branch(&self) -> String {
        lock(&self.state).base_branch.clone()
    }

    fn clone_url_http(&self) -> String {
        self.clone_url.clone()
    }

    fn clone_url_ssh(&self) -> String {
        self.clone_url.clone()
    }

    fn web_url(&self) -> String {
        format!("https://{}", self.full_name)
    }

    fn updated_at(&self) -> DateTime<Utc> {
        lock(&self.state).updated_at.unwrap_or_else(Utc::now)
    }

    fn get_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }

    fn find_pull_request(&self, branch: &str) -> Result<Option<PullRequest>> {
        Ok(lock(&self.state)
            .pull_requests
            .iter()
            .rev()
            .find(|pr| pr.branch_name == branch)
            .cloned())
    }

    fn create_pull_request(&self, branch: &str, data: &PullRequestData) -> Result<PullRequest> {
        let mut state = lock(&self.state);
        state.calls.create_pull_request += 1;
        let number = state.pull_requests.len() as u64 + 1;
        let pr = PullRequest {
            number,
            web_url: format!("https://{}/pull/{number}", self.full_name),
            created_at: Utc::now(),
            state: PullRequestState::Open,
            branch_name: branch.to_string(),
            title: data.title.clone(),
            body: data.body.clone(),
            raw: PullRequestRaw::None,
        };
        state.pull_requests.push(pr.clone());
        state.last_data = Some(data.clone());
        Ok(pr)
    }

    fn update_pull_request(&self, data: &PullRequestData, pr: &PullRequest) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.update_pull_request += 1;
        state.last_data = Some(data.clone());
        if let Some(existing) = state.pull_requests.iter_mut().find(|p| p.number == pr.number) {
            existing.title.clone_from(&data.title);
            existing.body.clone_from(&data.body);
        }
        Ok(())
    }

    fn close_pull_request(&self, message: &str, pr: &PullRequest) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.calls.close_pull_request += 1;
            state.close_messages.push(message.to_string());
        }
        self.set_state(pr, PullRequestState::Closed)
    }

    fn merge_pull_request(&self, delete_branch: bool, pr: &PullRequest) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.calls.merge_pull_request += 1;
            state.merge_delete_branch.push(delete_branch);
        }
        self.set_state(pr, PullRequestState::Merged)
    }

    fn delete_branch(&self, _pr: &PullRequest) -> Result<()> {
        lock(&self.state).calls.delete_branch += 1;
        Ok(())
    }

    fn can_merge_pull_request(&self, _pr: &PullRequest) -> Result<bool> {
        Ok(self.mergeable)
    }

    fn has_successful_pull_request_build(&self, _pr: &PullRequest) -> Result<bool> {
        Ok(self.build_success)
    }

    fn list_pull_request_comments(&self, _pr: &PullRequest) -> Result<Vec<PullRequestComment>> {
        Ok(lock(&self.state).comments.clone())
    }

    fn create_pull_request_comment(&self, body: &str, _pr: &PullRequest) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.create_comment += 1;
        let id = state.next_comment_id;
        state.next_comment_id += 1;
        state.comments.push(PullRequestComment {
            id,
            body: body.to_string(),
        });
        Ok(())
    }

    fn delete_pull_request_comment(
        &self,
        comment: &PullRequestComment,
        _pr: &PullRequest,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.delete_comment += 1;
        state.comments.retain(|c| c.id != comment.id);
        Ok(())
    }
}

/// [`Host`] serving a fixed set of [`FakeRepository`] values.
#[derive(Clone)]
pub struct FakeHost {
    detail: FakeHostDetail,
    repositories: Vec<FakeRepository>,
    with_open_prs: Vec<FakeRepository>,
    fail_listing: bool,
    listed_since: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
}

impl FakeHost {
    pub fn new(name: &str) -> Self {
        Self {
            detail: FakeHostDetail {
                name: name.to_string(),
                user: None,
            },
            repositories: Vec::new(),
            with_open_prs: Vec::new(),
            fail_listing: false,
            listed_since: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_repository(mut self, repo: FakeRepository) -> Self {
        self.repositories.push(repo);
        self
    }

    /// Repository reported by the open-PR listing.
    pub fn with_open_pr_repository(mut self, repo: FakeRepository) -> Self {
        self.with_open_prs.push(repo);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// `since` argument of every `list_repositories` call.
    pub fn listed_since(&self) -> Vec<Option<DateTime<Utc>>> {
        lock(&self.listed_since).clone()
    }
}

impl HostDetail for FakeHost {
    fn name(&self) -> String {
        self.detail.name.clone()
    }

    fn authenticated_user(&self) -> Result<Option<UserInfo>> {
        Ok(self.detail.user.clone())
    }
}

impl Host for FakeHost {
    fn create_from_name(&self, name: &str) -> Result<Option<Box<dyn Repository>>> {
        Ok(self
            .repositories
            .iter()
            .find(|repo| repo.full_name == name)
            .map(|repo| Box::new(repo.clone()) as Box<dyn Repository>))
    }

    fn list_repositories(
        &self,
        since: Option<DateTime<Utc>>,
        sink: &RepositorySink,
    ) -> Result<()> {
        lock(&self.listed_since).push(since);
        if self.fail_listing {
            bail!("listing repositories of {} failed", self.detail.name);
        }
        for repo in &self.repositories {
            sink.send(vec![Box::new(repo.clone())])?;
        }
        Ok(())
    }

    fn list_repositories_with_open_pull_requests(&self, sink: &RepositorySink) -> Result<()> {
        let batch: Vec<Box<dyn Repository>> = self
            .with_open_prs
            .iter()
            .map(|repo| Box::new(repo.clone()) as Box<dyn Repository>)
            .collect();
        sink.send(batch)
    }
}

/// Outcome [`ScriptedGit::update_task_branch`] reports.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated { conflict: bool },
    BranchModified(Vec<String>),
    Empty,
    Fail(String),
}

/// Calls recorded by [`ScriptedGit`].
#[derive(Debug, Clone, Default)]
pub struct GitLog {
    pub prepared: usize,
    /// `(branch, force_rebase)` per update.
    pub updates: Vec<(String, bool)>,
    pub commits: Vec<String>,
    pub pushes: Vec<String>,
}

/// [`GitClient`] returning scripted answers without touching disk.
#[derive(Debug, Clone)]
pub struct ScriptedGit {
    pub checkout: PathBuf,
    pub prepare_error: Option<String>,
    pub update: UpdateOutcome,
    pub local_changes: bool,
    /// `has_remote_changes` answer per branch; missing branches answer `true`.
    pub remote_changes: BTreeMap<String, bool>,
    pub log: Arc<Mutex<GitLog>>,
}

impl Default for ScriptedGit {
    fn default() -> Self {
        Self {
            checkout: std::env::temp_dir(),
            prepare_error: None,
            update: UpdateOutcome::Updated { conflict: false },
            local_changes: true,
            remote_changes: BTreeMap::new(),
            log: Arc::new(Mutex::new(GitLog::default())),
        }
    }
}

impl ScriptedGit {
    pub fn with_remote_changes(mut self, branch: &str, changed: bool) -> Self {
        self.remote_changes.insert(branch.to_string(), changed);
        self
    }

    pub fn log(&self) -> GitLog {
        lock(&self.log).clone()
    }
}

impl GitClient for ScriptedGit {
    fn prepare(&mut self, _repo: &dyn Repository, _retry: bool) -> Result<PathBuf> {
        lock(&self.log).prepared += 1;
        if let Some(msg) = &self.prepare_error {
            bail!("{msg}");
        }
        Ok(self.checkout.clone())
    }

    fn has_local_changes(&self) -> Result<bool> {
        Ok(self.local_changes)
    }

    fn has_remote_changes(&self, branch: &str) -> Result<bool> {
        Ok(self.remote_changes.get(branch).copied().unwrap_or(true))
    }

    fn update_task_branch(
        &mut self,
        branch: &str,
        force_rebase: bool,
        _repo: &dyn Repository,
    ) -> Result<bool> {
        lock(&self.log)
            .updates
            .push((branch.to_string(), force_rebase));
        match &self.update {
            UpdateOutcome::Updated { conflict } => Ok(*conflict),
            UpdateOutcome::BranchModified(checksums) => Err(BranchModifiedError {
                checksums: checksums.clone(),
            }
            .into()),
            UpdateOutcome::Empty => Err(EmptyRepositoryError.into()),
            UpdateOutcome::Fail(msg) => Err(anyhow!("{msg}")),
        }
    }

    fn commit_changes(&self, message: &str) -> Result<()> {
        lock(&self.log).commits.push(message.to_string());
        Ok(())
    }

    fn push(&self, branch: &str) -> Result<()> {
        lock(&self.log).pushes.push(branch.to_string());
        Ok(())
    }
}

/// Filter with a fixed answer that counts its invocations.
pub struct StaticFilter {
    pub name: String,
    pub answer: Result<bool, String>,
    pub calls: Arc<AtomicUsize>,
}

impl StaticFilter {
    pub fn boxed(name: &str, answer: Result<bool, String>) -> (Box<dyn Filter>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let filter = Self {
            name: name.to_string(),
            answer,
            calls: Arc::clone(&calls),
        };
        (Box::new(filter), calls)
    }
}

impl fmt::Display for StaticFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "static({})", self.name)
    }
}

impl Filter for StaticFilter {
    fn matches(&self, _ctx: &FilterContext<'_>) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(|msg| anyhow!(msg))
    }
}

/// Action that records each call and optionally fails.
pub struct RecordingAction {
    pub fail: Option<String>,
    pub calls: Arc<AtomicUsize>,
}

impl RecordingAction {
    pub fn boxed(fail: Option<&str>) -> (Box<dyn Action>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Self {
            fail: fail.map(str::to_string),
            calls: Arc::clone(&calls),
        };
        (Box::new(action), calls)
    }
}

impl fmt::Display for RecordingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("recording")
    }
}

impl Action for RecordingAction {
    fn apply(&self, _ctx: &ActionContext<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

/// Hook that records which events fired.
#[derive(Clone, Default)]
pub struct RecordingHook {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<&'static str> {
        lock(&self.events).clone()
    }
}

impl TaskHook for RecordingHook {
    fn on_pr_created(&self, _repo: &dyn Repository) -> Result<()> {
        lock(&self.events).push("created");
        Ok(())
    }

    fn on_pr_closed(&self, _repo: &dyn Repository) -> Result<()> {
        lock(&self.events).push("closed");
        Ok(())
    }

    fn on_pr_merged(&self, _repo: &dyn Repository) -> Result<()> {
        lock(&self.events).push("merged");
        Ok(())
    }
}

/// Local bare "origin" plus helpers to commit to it as someone else.
pub struct GitFixture {
    root: tempfile::TempDir,
    pub origin: PathBuf,
    pub data_dir: PathBuf,
    clones: AtomicUsize,
}

impl GitFixture {
    /// Origin with one commit on `main` containing `README.md`.
    pub fn new() -> Result<Self> {
        let fixture = Self::empty()?;
        fixture.commit_to_origin("main", "README.md", "hello\n", "seed@example.com")?;
        Ok(fixture)
    }

    /// Origin without any commit.
    pub fn empty() -> Result<Self> {
        let root = tempfile::tempdir().context("create tempdir")?;
        let origin = root.path().join("origin.git");
        let data_dir = root.path().join("data");
        run_git(root.path(), &["init", "--bare", "-b", "main", "origin.git"])?;
        Ok(Self {
            root,
            origin,
            data_dir,
            clones: AtomicUsize::new(0),
        })
    }

    pub fn repository(&self) -> FakeRepository {
        FakeRepository::new("example.com/acme/widgets")
            .with_clone_url(self.origin.to_string_lossy().into_owned())
    }

    pub fn settings(&self) -> GitSettings {
        GitSettings {
            data_dir: self.data_dir.clone(),
            git_path: "git".to_string(),
            author: Some(GitAuthor {
                name: BOT_NAME.to_string(),
                email: BOT_EMAIL.to_string(),
            }),
            clone_options: Vec::new(),
            default_commit_message: "changes by sweeper".to_string(),
            git_url: GitUrl::Https,
            env: Vec::new(),
        }
    }

    /// Commit `content` to `path` on `branch` of origin as `email`; returns the sha.
    ///
    /// A missing branch is created from `main`.
    pub fn commit_to_origin(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        email: &str,
    ) -> Result<String> {
        let n = self.clones.fetch_add(1, Ordering::SeqCst);
        let work = self.root.path().join(format!("work-{n}"));
        run_git(
            self.root.path(),
            &["clone", &self.origin.to_string_lossy(), &work.to_string_lossy()],
        )?;
        let has_remote = run_git(&work, &["branch", "-r", "--format", "%(refname)"])?
            .lines()
            .any(|line| line.trim() == format!("refs/remotes/origin/{branch}"));
        if has_remote {
            run_git(&work, &["checkout", branch])?;
        } else if branch != "main" {
            run_git(&work, &["checkout", "-b", branch, "origin/main"])?;
        } else {
            // Unborn HEAD of an empty origin.
            run_git(&work, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;
        }
        let target = work.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create parent")?;
        }
        fs::write(&target, content).context("write file")?;
        run_git(&work, &["add", "."])?;
        run_git(
            &work,
            &[
                "-c",
                "user.name=Someone",
                "-c",
                &format!("user.email={email}"),
                "commit",
                "-m",
                &format!("edit {path}"),
            ],
        )?;
        run_git(&work, &["push", "origin", &format!("HEAD:{branch}")])?;
        Ok(run_git(&work, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Sha of `branch` in origin, `None` if the branch does not exist.
    pub fn origin_sha(&self, branch: &str) -> Result<Option<String>> {
        let out = Command::new("git")
            .arg("--git-dir")
            .arg(&self.origin)
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .output()
            .context("spawn git rev-parse")?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Content of `path` on `branch` in origin.
    pub fn origin_file(&self, branch: &str, path: &str) -> Result<Option<String>> {
        let out = Command::new("git")
            .arg("--git-dir")
            .arg(&self.origin)
            .args(["show", &format!("{branch}:{path}")])
            .output()
            .context("spawn git show")?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned()))
    }

    pub fn checkout_dir(&self, repo: &FakeRepository) -> PathBuf {
        self.data_dir.join("git").join(repo.full_name())
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// In-memory `metrics` recorder for use with `metrics::with_local_recorder`.
///
/// Series are keyed as `name{label=value,...}` with labels sorted by name.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    counters: Arc<Mutex<BTreeMap<String, Arc<CounterCell>>>>,
    gauges: Arc<Mutex<BTreeMap<String, Arc<GaugeCell>>>>,
    histograms: Arc<Mutex<BTreeMap<String, Arc<HistogramCell>>>>,
}

impl MetricsRecorder {
    pub fn counter(&self, key: &str) -> u64 {
        lock(&self.counters)
            .get(key)
            .map_or(0, |cell| cell.0.load(Ordering::SeqCst))
    }

    pub fn gauge(&self, key: &str) -> Option<f64> {
        lock(&self.gauges).get(key).map(|cell| *lock(&cell.0))
    }

    pub fn histogram(&self, key: &str) -> Vec<f64> {
        lock(&self.histograms)
            .get(key)
            .map(|cell| lock(&cell.0).clone())
            .unwrap_or_default()
    }

    /// All series names seen, with labels.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.counters).keys().cloned().collect();
        keys.extend(lock(&self.gauges).keys().cloned());
        keys.extend(lock(&self.histograms).keys().cloned());
        keys.sort();
        keys
    }
}

fn series_key(key: &metrics::Key) -> String {
    let mut labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect();
    if labels.is_empty() {
        return key.name().to_string();
    }
    labels.sort();
    format!("{}{{{}}}", key.name(), labels.join(","))
}

#[derive(Debug, Default)]
struct CounterCell(std::sync::atomic::AtomicU64);

impl metrics::CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::SeqCst);
    }

    fn absolute(&self, value: u64) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct GaugeCell(Mutex<f64>);

impl metrics::GaugeFn for GaugeCell {
    fn increment(&self, value: f64) {
        *lock(&self.0) += value;
    }

    fn decrement(&self, value: f64) {
        *lock(&self.0) -= value;
    }

    fn set(&self, value: f64) {
        *lock(&self.0) = value;
    }
}

#[derive(Debug, Default)]
struct HistogramCell(Mutex<Vec<f64>>);

impl metrics::HistogramFn for HistogramCell {
    fn record(&self, value: f64) {
        lock(&self.0).push(value);
    }
}

impl metrics::Recorder for MetricsRecorder {
    fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn describe_histogram(
        &self,
        _: metrics::KeyName,
        _: Option<metrics::Unit>,
        _: metrics::SharedString,
    ) {
    }

    fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
        let cell = lock(&self.counters).entry(series_key(key)).or_default().clone();
        metrics::Counter::from_arc(cell)
    }

    fn register_gauge(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
        let cell = lock(&self.gauges).entry(series_key(key)).or_default().clone();
        metrics::Gauge::from_arc(cell)
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        let cell = lock(&self.histograms).entry(series_key(key)).or_default().clone();
        metrics::Histogram::from_arc(cell)
    }
}
