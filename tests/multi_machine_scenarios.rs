//! Scenarios 4 (octopus finalize) and 5 (drift radar) from spec §8, which
//! need more than one machine identity cooperating through a shared remote.
//! Each "machine" is a separate working clone of one bare repo in a
//! TempDir; nothing here ever touches a real network.

use std::fs;
use std::path::Path;
use std::process::Command;

use git_pulsar::config::Config;
use git_pulsar::drift::DriftDetector;
use git_pulsar::git::GitPlumbing;
use git_pulsar::probe::SystemProbe;
use git_pulsar::reconcile::{FinalizeOutcome, Reconciler};
use git_pulsar::shadow::ShadowEngine;

fn run(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args(args)
        .status()
        .expect("spawning git");
    assert!(status.success(), "git {args:?} failed");
}

/// One bare "remote" plus N working clones, each configured with `origin`
/// pointing at the bare repo.
struct Cluster {
    _remote_dir: tempfile::TempDir,
    clones: Vec<tempfile::TempDir>,
}

impl Cluster {
    fn new(n: usize) -> Self {
        let remote_dir = tempfile::TempDir::new().unwrap();
        run(remote_dir.path(), &["init", "-q", "--bare", "-b", "main"]);

        let seed = tempfile::TempDir::new().unwrap();
        run(seed.path(), &["init", "-q", "-b", "main"]);
        run(seed.path(), &["config", "user.email", "test@example.com"]);
        run(seed.path(), &["config", "user.name", "Test"]);
        fs::write(seed.path().join("README.md"), b"hello\n").unwrap();
        run(seed.path(), &["add", "-A"]);
        run(seed.path(), &["commit", "-q", "-m", "initial"]);
        run(
            seed.path(),
            &[
                "push",
                remote_dir.path().to_str().unwrap(),
                "main:main",
            ],
        );

        let mut clones = Vec::with_capacity(n);
        for _ in 0..n {
            let clone_dir = tempfile::TempDir::new().unwrap();
            run(
                clone_dir.path().parent().unwrap(),
                &[
                    "clone",
                    "-q",
                    remote_dir.path().to_str().unwrap(),
                    clone_dir.path().to_str().unwrap(),
                ],
            );
            run(clone_dir.path(), &["config", "user.email", "test@example.com"]);
            run(clone_dir.path(), &["config", "user.name", "Test"]);
            clones.push(clone_dir);
        }

        Self {
            _remote_dir: remote_dir,
            clones,
        }
    }
}

/// Scenario 4: Octopus finalize. Three machines each snapshot a distinct
/// change, push their own shadow namespace, and one of them finalizes -
/// the resulting commit on `main` must have the prior tip plus all three
/// shadow tips as parents, in machine-id sorted order.
#[tokio::test]
async fn octopus_finalize_merges_three_machines_in_sorted_order() {
    let cluster = Cluster::new(3);
    let machine_ids = ["m1", "m2", "m3"];
    let config = Config::default();

    for (i, clone_dir) in cluster.clones.iter().enumerate() {
        fs::write(
            clone_dir.path().join(format!("file{i}.txt")),
            format!("content from {}", machine_ids[i]),
        )
        .unwrap();

        let git = GitPlumbing::new(clone_dir.path());
        let probe = SystemProbe::new(clone_dir.path().join(".pulsar-state"));
        let engine = ShadowEngine::new(&git, &probe, machine_ids[i].to_owned());
        engine.snapshot("main", &config).await.unwrap();
        engine.push(&config).await.unwrap();
    }

    let finalizer_dir = &cluster.clones[0];
    let git = GitPlumbing::new(finalizer_dir.path());
    let reconciler = Reconciler::new(&git, "m1".to_owned());

    let outcome = reconciler.finalize("main", &config).await.unwrap();
    match outcome {
        FinalizeOutcome::Committed {
            commit,
            contributing_machines,
        } => {
            assert_eq!(contributing_machines, vec!["m1", "m2", "m3"]);

            let output = Command::new("git")
                .current_dir(finalizer_dir.path())
                .args(["log", "-1", "--format=%P", &commit.to_string()])
                .output()
                .unwrap();
            let parents: Vec<&str> = std::str::from_utf8(&output.stdout)
                .unwrap()
                .trim()
                .split_whitespace()
                .collect();
            assert_eq!(parents.len(), 4, "prior tip + 3 machine tips");
        }
        other => panic!("expected Committed, got {other:?}"),
    }

    let main_tip = git.resolve_ref("main").await.unwrap();
    assert!(main_tip.is_some());
}

/// Scenario 5: Drift radar. M1 pushes a shadow commit, M2 polls and records
/// the observation without ever advancing its own working tree or branch.
#[tokio::test]
async fn drift_detector_observes_a_foreign_machines_push() {
    let cluster = Cluster::new(2);
    let config = Config::default();

    fs::write(cluster.clones[0].path().join("a.txt"), b"from m1").unwrap();
    let git_m1 = GitPlumbing::new(cluster.clones[0].path());
    let probe_m1 = SystemProbe::new(cluster.clones[0].path().join(".pulsar-state"));
    let engine_m1 = ShadowEngine::new(&git_m1, &probe_m1, "m1".to_owned());
    engine_m1.snapshot("main", &config).await.unwrap();
    engine_m1.push(&config).await.unwrap();

    let git_m2 = GitPlumbing::new(cluster.clones[1].path());
    let probe_m2 = SystemProbe::new(cluster.clones[1].path().join(".pulsar-state"));
    let detector_m2 = DriftDetector::new(&git_m2, &probe_m2, "m2".to_owned());
    detector_m2.poll(&config).await.unwrap();

    let state = detector_m2.read_cached().unwrap().expect("drift state recorded");
    assert!(state.observed_machines.contains(&"m1".to_owned()));
    assert!(!state.acknowledged);

    // M2's own branch must be untouched by the poll - drift radar only
    // reads, it never writes to the working tree or the branch ref.
    let m2_head_before = git_m2.resolve_ref("main").await.unwrap();
    assert!(git_m2.is_working_tree_clean().await.unwrap());
    assert_eq!(m2_head_before, git_m2.resolve_ref("main").await.unwrap());
}
