//! Two-cadence scheduler driving `ShadowEngine` and `DriftDetector` across
//! every registered repo (spec §4.8, §5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigCascade;
use crate::drift::DriftDetector;
use crate::error::PulsarError;
use crate::git::GitPlumbing;
use crate::probe::SystemProbe;
use crate::registry::{Registry, RepoEntry};
use crate::shadow::{unix_now, ShadowEngine};
use crate::util::{ErrGroup, ResultExt as _};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

pub struct DaemonLoop {
    pub state_dir: PathBuf,
    pub tick_interval: Duration,
    pub worker_pool_size: usize,
}

impl DaemonLoop {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            tick_interval: DEFAULT_TICK_INTERVAL,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }

    /// Runs until `cancel` fires (SIGTERM), draining any in-flight ticks.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let registry = Registry::new(self.state_dir.clone());
        let probe = SystemProbe::new(self.state_dir.clone());
        let machine_id = probe
            .machine_id()
            .map_err(|e| PulsarError::Fatal(format!("resolving machine id: {e}")))?;

        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("daemon loop shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&registry, &machine_id, &cancel).await {
                        // Only a Fatal-classified error reaches here - see tick().
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn tick(
        &self,
        registry: &Registry,
        machine_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let repos = registry.list()?;
        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size.max(1)));
        let mut group = ErrGroup::new(cancel.clone());

        for repo in repos {
            if repo.paused {
                continue;
            }
            let semaphore = Arc::clone(&semaphore);
            let state_dir = self.state_dir.clone();
            let machine_id = machine_id.to_owned();

            group.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                process_repo(repo, state_dir, machine_id).await
            });
        }

        group.wait().await
    }
}

/// Runs every due job for one repo. Repo-local faults (busy, blocked,
/// transient network errors) are logged and swallowed - spec §4.8: "Any job
/// exception is logged with repo path; the next tick is unaffected." Only a
/// `PulsarError::Fatal` propagates, since that's the one kind that's meant
/// to bring the daemon down (spec §7).
async fn process_repo(
    repo: RepoEntry,
    state_dir: PathBuf,
    machine_id: String,
) -> anyhow::Result<()> {
    let registry = Registry::new(state_dir.clone());
    let config = match ConfigCascade::load(&repo.path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}: config load failed: {e}", repo.path.display());
            return Ok(());
        }
    };

    let git = GitPlumbing::new(&repo.path);
    let probe = SystemProbe::new(state_dir);
    let now = unix_now();

    let commit_due = repo
        .last_snapshot_at
        .map(|last| now - last >= config.commit_interval.as_secs() as i64)
        .unwrap_or(true);
    if commit_due {
        let engine = ShadowEngine::new(&git, &probe, machine_id.clone());
        match engine.snapshot(&repo.branch_at_register, &config).await {
            Ok(_) => {
                registry.record_snapshot(&repo.path, now).or_log_error(&format!(
                    "recording snapshot timestamp for {}",
                    repo.path.display()
                ));
            }
            Err(e) => {
                if let Some(PulsarError::Fatal(_)) = PulsarError::classify(&e) {
                    return Err(e);
                }
                log_classified(&repo.path, &e);
            }
        }
    }

    let push_due = repo
        .last_push_at
        .map(|last| now - last >= config.push_interval.as_secs() as i64)
        .unwrap_or(true);
    if push_due {
        let engine = ShadowEngine::new(&git, &probe, machine_id.clone());
        match engine.push(&config).await {
            Ok(true) => {
                registry.record_push(&repo.path, now).or_log_error(&format!(
                    "recording push timestamp for {}",
                    repo.path.display()
                ));
            }
            Ok(false) => {
                debug!(
                    "{}: push deferred (eco mode), not recording a push timestamp",
                    repo.path.display()
                );
            }
            Err(e) => {
                if let Some(PulsarError::Fatal(_)) = PulsarError::classify(&e) {
                    return Err(e);
                }
                log_classified(&repo.path, &e);
            }
        }
    }

    let drift_due = repo
        .last_drift_check_at
        .map(|last| now - last >= config.drift_poll_interval.as_secs() as i64)
        .unwrap_or(true);
    if drift_due {
        let detector = DriftDetector::new(&git, &probe, machine_id);
        match detector.poll(&config).await {
            Ok(()) => {
                registry
                    .record_drift_check(&repo.path, now)
                    .or_log_error(&format!(
                        "recording drift-check timestamp for {}",
                        repo.path.display()
                    ));
            }
            Err(e) => {
                if let Some(PulsarError::Fatal(_)) = PulsarError::classify(&e) {
                    return Err(e);
                }
                log_classified(&repo.path, &e);
            }
        }
    }

    Ok(())
}

fn log_classified(repo_path: &std::path::Path, err: &anyhow::Error) {
    match PulsarError::classify(err) {
        Some(PulsarError::Transient(msg)) => {
            log::info!("{}: transient: {msg}", repo_path.display())
        }
        Some(PulsarError::Busy(msg)) => log::debug!("{}: busy: {msg}", repo_path.display()),
        Some(PulsarError::Blocker(msg)) => {
            log::warn!("{}: blocked: {msg}", repo_path.display())
        }
        Some(PulsarError::Corruption { r#ref, detail }) => {
            log::error!("{}: corrupt ref {ref}: {detail}", repo_path.display())
        }
        Some(PulsarError::Fatal(_)) => unreachable!("Fatal is handled by the caller"),
        None => log::warn!("{}: {err:#}", repo_path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_size_is_at_least_one() {
        assert!(DEFAULT_WORKER_POOL_SIZE >= 1);
    }
}
