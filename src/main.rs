use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as _;
use flexi_logger::{FileSpec, Logger};
use log::{error, info};

use git_pulsar::cli::{Cli, Command};
use git_pulsar::config::ConfigCascade;
use git_pulsar::daemon::DaemonLoop;
use git_pulsar::drift::DriftDetector;
use git_pulsar::error::PulsarError;
use git_pulsar::git::GitPlumbing;
use git_pulsar::probe::SystemProbe;
use git_pulsar::reconcile::{FinalizeOutcome, NegotiationChoice, Reconciler, RestoreOutcome, SyncOutcome};
use git_pulsar::registry::{Registry, RepoEntry};
use git_pulsar::shadow::{unix_now, ShadowEngine};
use git_pulsar::status;

fn state_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_STATE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("git-pulsar");
        }
    }
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    PathBuf::from(home).join(".local/state/git-pulsar")
}

fn init_logging(daemon: bool) -> anyhow::Result<()> {
    let mut logger = Logger::try_with_env_or_str("info")?;
    if daemon {
        logger = logger.log_to_file(FileSpec::default().directory(state_dir()).basename("daemon"));
    }
    logger.start()?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let is_daemon = matches!(cli.command, Some(Command::Daemon));
    if let Err(e) = init_logging(is_daemon) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            if matches!(PulsarError::classify(&e), Some(PulsarError::Fatal(_))) {
                eprintln!("FATAL: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let command = cli.command.unwrap_or(Command::Register);
    let state_dir = state_dir();
    std::fs::create_dir_all(&state_dir)?;

    if matches!(command, Command::Daemon) {
        let daemon = DaemonLoop::new(state_dir);
        let cancel = tokio_util::sync::CancellationToken::new();
        let cancel_for_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel_for_signal.cancel();
            }
        });
        daemon.run(cancel).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let cwd = env::current_dir()?;
    let probing_git = GitPlumbing::new(&cwd);
    let repo_root = probing_git.show_toplevel().await?;
    let git = GitPlumbing::new(&repo_root);
    let probe = SystemProbe::new(state_dir.clone());
    let machine_id = probe.machine_id()?;
    let registry = Registry::new(state_dir.clone());
    let config = ConfigCascade::load(&repo_root)?;
    let branch = git
        .current_branch()
        .await?
        .ok_or_else(|| anyhow::anyhow!("detached HEAD is not supported"))?;

    match command {
        Command::Register => {
            let entry = RepoEntry::new(repo_root.clone(), machine_id, branch);
            if registry.register(entry)? {
                info!("registered {}", repo_root.display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{} is already registered", repo_root.display());
                Ok(ExitCode::from(2))
            }
        }
        Command::Now => {
            let engine = ShadowEngine::new(&git, &probe, machine_id);
            let outcome = engine.snapshot(&branch, &config).await?;
            use git_pulsar::shadow::SnapshotOutcome;
            match outcome {
                SnapshotOutcome::Committed { .. } | SnapshotOutcome::NoChange => {
                    engine.push(&config).await?;
                    registry.record_snapshot(&repo_root, unix_now())?;
                    Ok(ExitCode::SUCCESS)
                }
                SnapshotOutcome::Skipped { .. } | SnapshotOutcome::Blocked { .. } => {
                    Ok(ExitCode::from(1))
                }
            }
        }
        Command::Sync => {
            let reconciler = Reconciler::new(&git, machine_id);
            match reconciler.sync(&branch, &config, true).await? {
                SyncOutcome::FastForwarded { .. } => Ok(ExitCode::SUCCESS),
                SyncOutcome::WorkingTreeDirty => Ok(ExitCode::from(1)),
                SyncOutcome::NoDrift => Ok(ExitCode::from(2)),
            }
        }
        Command::Restore { path } => {
            let reconciler = Reconciler::new(&git, machine_id);
            let outcome = reconciler
                .restore(&branch, &path, |_diff| NegotiationChoice::Overwrite)
                .await?;
            match outcome {
                RestoreOutcome::Overwritten | RestoreOutcome::NotModifiedLocally => {
                    Ok(ExitCode::SUCCESS)
                }
                RestoreOutcome::Canceled => Ok(ExitCode::from(1)),
            }
        }
        Command::Finalize => {
            let reconciler = Reconciler::new(&git, machine_id);
            match reconciler.finalize(&branch, &config).await? {
                FinalizeOutcome::Committed { .. } | FinalizeOutcome::NoShadowRefs => {
                    Ok(ExitCode::SUCCESS)
                }
                FinalizeOutcome::Conflict { paths } => {
                    for path in paths {
                        println!("conflict: {}", path.display());
                    }
                    Ok(ExitCode::from(3))
                }
            }
        }
        Command::Pause => {
            registry.set_paused(&repo_root, true)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume => {
            registry.set_paused(&repo_root, false)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove => {
            registry.remove(&repo_root)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let entries = registry.list()?;
            let detector = DriftDetector::new(&git, &probe, machine_id);
            let mut pairs = Vec::with_capacity(entries.len());
            for entry in entries {
                let drift = if entry.path == repo_root {
                    detector.read_cached()?
                } else {
                    None
                };
                pairs.push((entry, drift));
            }
            let lines = status::build(&pairs);
            print!("{}", status::render(&lines));
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune => {
            let reconciler = Reconciler::new(&git, machine_id);
            let pruned = reconciler.prune(unix_now()).await?;
            for ref_name in pruned {
                info!("pruned {ref_name}");
            }
            registry.prune(|path| path.join(".git").exists())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Daemon => unreachable!("handled above"),
    }
}
