//! Processor and git reconciler against real local repositories.
//!
//! Requires a `git` binary on `PATH`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use sweeper::action::ActionSettings;
use sweeper::core::result::ProcessResult;
use sweeper::host::{Repository, comment_marker};
use sweeper::io::git::{Git, GitClient};
use sweeper::io::task_file::parse_definitions;
use sweeper::processor::{Processor, UP_TO_DATE_CLOSE_MESSAGE};
use sweeper::task::Task;
use sweeper::template::Templates;
use sweeper::test_support::{FakeRepository, GitFixture, MetricsRecorder};

const BRANCH: &str = "sweeper--demo";

const TASK: &str = r#"
name: demo
filters:
  - filter: repositoryName
    params:
      names: ["example\\.com/acme/widgets"]
actions:
  - action: fileCreate
    params:
      path: hello.txt
      content: "hello from {{ task_name }}\n"
"#;

fn task() -> Task {
    let definition = parse_definitions(TASK)
        .expect("parse")
        .into_iter()
        .next()
        .expect("one task");
    let settings = ActionSettings {
        task_dir: PathBuf::from("."),
        default_timeout: Duration::from_secs(30),
        output_limit_bytes: 10_000,
    };
    Task::build(definition, Path::new("demo.yaml"), "sum", &settings, &BTreeMap::new())
        .expect("build task")
}

fn processor(fixture: &GitFixture) -> Processor<Git> {
    Processor::new(
        Some(fixture.data_dir.clone()),
        Git::new(fixture.settings()),
        Templates::new(),
    )
}

fn process(processor: &mut Processor<Git>, repo: &FakeRepository, task: &Task) -> ProcessResult {
    processor.process(false, repo, task, true).expect("process")
}

#[test]
fn creates_branch_and_stays_idempotent() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let task = task();
    let mut processor = processor(&fixture);

    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrCreated);
    assert_eq!(
        fixture.origin_file(BRANCH, "hello.txt").expect("show").as_deref(),
        Some("hello from demo\n")
    );
    let pushed = fixture.origin_sha(BRANCH).expect("sha").expect("branch pushed");

    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrOpen);
    assert_eq!(fixture.origin_sha(BRANCH).expect("sha"), Some(pushed));
    assert_eq!(repo.pull_requests().len(), 1);
    assert_eq!(repo.calls().create_pull_request, 1);
}

#[test]
fn dry_run_commits_locally_but_never_pushes() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let mut processor = processor(&fixture);

    let result = processor
        .process(true, &repo, &task(), true)
        .expect("process");

    assert_eq!(result, ProcessResult::PrCreated);
    assert_eq!(fixture.origin_sha(BRANCH).expect("sha"), None);
    assert_eq!(repo.calls().mutating(), 0);
}

#[test]
fn foreign_commits_block_updates_until_rebase_is_requested() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let task = task();
    let mut processor = processor(&fixture);
    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrCreated);

    let foreign = fixture
        .commit_to_origin(BRANCH, "other.txt", "manual edit\n", "human@example.com")
        .expect("foreign commit");

    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::BranchModified);
    assert_eq!(fixture.origin_sha(BRANCH).expect("sha"), Some(foreign.clone()));
    let comments = repo.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].body.starts_with(&comment_marker("branch-modified")));
    assert!(comments[0].body.contains(&foreign));

    let pr = repo.pull_requests().remove(0);
    repo.set_pull_request_body(
        pr.number,
        &pr.body.replace("- [ ] If you want", "- [x] If you want"),
    );

    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrOpen);
    assert!(repo.comments().is_empty());
    assert_ne!(fixture.origin_sha(BRANCH).expect("sha"), Some(foreign));
    assert_eq!(fixture.origin_file(BRANCH, "other.txt").expect("show"), None);
    assert_eq!(
        fixture.origin_file(BRANCH, "hello.txt").expect("show").as_deref(),
        Some("hello from demo\n")
    );
}

#[test]
fn closes_pull_request_once_base_contains_the_change() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let task = task();
    let mut processor = processor(&fixture);
    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrCreated);

    fixture
        .commit_to_origin("main", "hello.txt", "hello from demo\n", "human@example.com")
        .expect("merge by hand");
    repo.set_updated_at(Utc::now() + TimeDelta::hours(1));

    assert_eq!(process(&mut processor, &repo, &task), ProcessResult::PrClosed);
    assert_eq!(repo.close_messages(), vec![UP_TO_DATE_CLOSE_MESSAGE.to_string()]);
    assert_eq!(repo.calls().delete_branch, 1);
}

#[test]
fn empty_repository_is_not_processed() {
    let fixture = GitFixture::empty().expect("fixture");
    let repo = fixture.repository();
    let mut processor = processor(&fixture);

    assert_eq!(process(&mut processor, &repo, &task()), ProcessResult::NoMatch);
    assert_eq!(repo.calls().mutating(), 0);
}

#[test]
fn prepare_pulls_only_when_host_reports_updates() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let mut git = Git::new(fixture.settings());
    let readme = fixture.checkout_dir(&repo).join("README.md");

    git.prepare(&repo, false).expect("clone");
    git.prepare(&repo, false).expect("first pull");
    fixture
        .commit_to_origin("main", "README.md", "updated\n", "human@example.com")
        .expect("commit");

    repo.set_updated_at(Utc::now() - TimeDelta::hours(1));
    git.prepare(&repo, false).expect("skip pull");
    assert_eq!(fs::read_to_string(&readme).expect("read"), "hello\n");

    repo.set_updated_at(Utc::now() + TimeDelta::hours(1));
    git.prepare(&repo, false).expect("pull");
    assert_eq!(fs::read_to_string(&readme).expect("read"), "updated\n");
}

#[test]
fn prepare_reclones_a_broken_checkout() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let mut git = Git::new(fixture.settings());

    let checkout = git.prepare(&repo, false).expect("clone");
    let marker = checkout.join(".git").join("stale-marker");
    fs::write(&marker, "x").expect("marker");

    repo.set_base_branch("does-not-exist");
    let again = git.prepare(&repo, false).expect("reclone");

    assert_eq!(again, checkout);
    assert!(!marker.exists());
    assert!(checkout.join("README.md").exists());
}

#[test]
fn prepare_sets_the_configured_author() {
    let fixture = GitFixture::new().expect("fixture");
    let repo = fixture.repository();
    let mut git = Git::new(fixture.settings());
    let checkout = git.prepare(&repo, false).expect("clone");

    let out = std::process::Command::new("git")
        .args(["config", "user.email"])
        .current_dir(&checkout)
        .output()
        .expect("git config");
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "bot@example.com");
    assert_eq!(repo.full_name(), "example.com/acme/widgets");
}

/// Run git in `dir` as a human would, with an identity for commits.
fn human_git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(["-c", "user.name=Human", "-c", "user.email=human@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed");
}

/// Working copy holding the task files, with uncommitted edits in `notes.txt`.
fn enclosing_repository() -> tempfile::TempDir {
    let outer = tempfile::tempdir().expect("tempdir");
    human_git(outer.path(), &["init", "-b", "main"]);
    fs::write(outer.path().join("notes.txt"), "v1\n").expect("write");
    human_git(outer.path(), &["add", "notes.txt"]);
    human_git(outer.path(), &["commit", "-m", "notes"]);
    fs::write(outer.path().join("notes.txt"), "uncommitted work\n").expect("write");
    outer
}

#[test]
fn failed_clone_leaves_no_checkout_and_spares_the_enclosing_repository() {
    let fixture = GitFixture::new().expect("fixture");
    let outer = enclosing_repository();
    let mut settings = fixture.settings();
    settings.data_dir = outer.path().join(".sweeper");
    let mut git = Git::new(settings);

    let broken = FakeRepository::new("example.com/acme/widgets")
        .with_clone_url(outer.path().join("missing.git").to_string_lossy().into_owned());
    git.prepare(&broken, false).expect_err("clone fails");
    let checkout = outer.path().join(".sweeper/git/example.com/acme/widgets");
    assert!(!checkout.exists());

    let checkout = git.prepare(&fixture.repository(), false).expect("clone");
    assert!(checkout.join("README.md").exists());
    assert_eq!(
        fs::read_to_string(outer.path().join("notes.txt")).expect("read"),
        "uncommitted work\n"
    );
}

#[test]
fn leftover_directory_without_git_metadata_is_cloned_over() {
    let fixture = GitFixture::new().expect("fixture");
    let outer = enclosing_repository();
    let mut settings = fixture.settings();
    settings.data_dir = outer.path().join(".sweeper");
    let repo = fixture.repository();
    let checkout = outer.path().join(".sweeper/git").join(repo.full_name());
    fs::create_dir_all(&checkout).expect("leftover dir");
    fs::write(checkout.join("partial"), "x").expect("write");

    let prepared = Git::new(settings).prepare(&repo, false).expect("clone");

    assert_eq!(prepared, checkout);
    assert!(prepared.join("README.md").exists());
    assert!(!prepared.join("partial").exists());
    assert_eq!(
        fs::read_to_string(outer.path().join("notes.txt")).expect("read"),
        "uncommitted work\n"
    );
}

#[test]
fn git_commands_are_timed_per_subcommand() {
    let fixture = GitFixture::new().expect("fixture");
    let recorder = MetricsRecorder::default();
    let mut git = Git::new(fixture.settings());

    metrics::with_local_recorder(&recorder, || {
        git.prepare(&fixture.repository(), false).expect("clone");
    });

    assert_eq!(
        recorder
            .histogram("sweeper_git_command_duration_seconds{command=clone}")
            .len(),
        1
    );
    assert!(!recorder.histogram("sweeper_git_command_duration_seconds{command=config}").is_empty());
}
