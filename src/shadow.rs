//! The snapshot engine: builds one shadow commit per cycle via an isolated
//! index, with large-file and busy-state gating (spec §4.5).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context as _};
use log::{debug, info, warn};

use crate::config::Config;
use crate::drift::{DriftState, DRIFT_STATE_FILENAME};
use crate::error::PulsarError;
use crate::git::{CommitHash, GitPlumbing, ShortStat};
use crate::probe::SystemProbe;
use crate::util::AdvisoryLock;

pub const PULSAR_REF_PREFIX: &str = "refs/heads/wip/pulsar";
pub const PULSAR_INDEX_FILENAME: &str = "pulsar_index";
pub const PULSAR_LOCK_FILENAME: &str = "pulsar.lock";

/// `refs/heads/wip/pulsar/<machine-id>/<branch>`, with `/` in the branch
/// name percent-encoded so embedded slashes can't collide with the
/// namespace's own separators (spec §6).
pub fn shadow_ref_name(machine_id: &str, branch: &str) -> String {
    format!(
        "{PULSAR_REF_PREFIX}/{machine_id}/{}",
        urlencoding::encode(branch)
    )
}

pub fn machine_namespace_prefix(machine_id: &str) -> String {
    format!("{PULSAR_REF_PREFIX}/{machine_id}/")
}

/// Force-push refspec scoped to this machine's own segment - never another
/// machine's (spec §6).
pub fn push_refspec(machine_id: &str) -> String {
    let ns = machine_namespace_prefix(machine_id);
    format!("+{ns}*:{ns}*")
}

pub fn fetch_refspec() -> String {
    format!("{PULSAR_REF_PREFIX}/*:{PULSAR_REF_PREFIX}/*")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Committed { commit: CommitHash, stat: ShortStat },
    NoChange,
    Skipped { reason: &'static str },
    Blocked { path: PathBuf },
}

pub struct ShadowEngine<'a> {
    pub git: &'a GitPlumbing,
    pub probe: &'a SystemProbe,
    pub machine_id: String,
}

impl<'a> ShadowEngine<'a> {
    pub fn new(git: &'a GitPlumbing, probe: &'a SystemProbe, machine_id: String) -> Self {
        Self {
            git,
            probe,
            machine_id,
        }
    }

    fn lock_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .git
            .repo_path
            .join(".git")
            .join(PULSAR_LOCK_FILENAME))
    }

    fn index_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .git
            .repo_path
            .join(".git")
            .join(PULSAR_INDEX_FILENAME))
    }

    /// Run one snapshot cycle for `branch` under `config`. Never touches the
    /// real index (invariant 1, spec §8); every write is plumbing (invariant
    /// 2).
    pub async fn snapshot(
        &self,
        branch: &str,
        config: &Config,
    ) -> anyhow::Result<SnapshotOutcome> {
        let lock_path = self.lock_path().context("computing lock path")?;
        let Some(_lock) = AdvisoryLock::try_acquire(&lock_path)? else {
            debug!("{}: pulsar.lock held, skipping cycle", self.git.repo_path.display());
            return Ok(SnapshotOutcome::Skipped { reason: "locked" });
        };

        if self.git.working_tree_busy().await? {
            debug!("{}: working tree busy, skipping cycle", self.git.repo_path.display());
            return Ok(SnapshotOutcome::Skipped { reason: "busy" });
        }

        let index_path = self.index_path().context("computing index path")?;

        if let Some(offender) = self
            .find_oversized_file(config.large_file_threshold, &config.ignore)
            .await?
        {
            self.mark_blocked(&offender).await?;
            warn!(
                "{}: {} exceeds large-file threshold of {} bytes, snapshot aborted",
                self.git.repo_path.display(),
                offender.display(),
                config.large_file_threshold
            );
            self.probe.notify(
                "Git Pulsar: snapshot blocked",
                &format!("{} is too large to snapshot", offender.display()),
            );
            return Ok(SnapshotOutcome::Blocked { path: offender });
        }

        self.git
            .add_all_to_shadow_index(&index_path, &config.ignore)
            .await
            .context("building shadow index")?;
        let tree = self
            .git
            .write_tree(&index_path)
            .await
            .context("writing shadow tree")?;

        let shadow_ref = shadow_ref_name(&self.machine_id, branch);
        let prior_tip = self.git.resolve_ref(&shadow_ref).await?;

        if let Some(prior_tip) = &prior_tip {
            let prior_tree = match self.git.tree_of(prior_tip).await {
                Ok(tree) => tree,
                Err(e) => {
                    // The ref resolves but its object is gone - quarantine
                    // it rather than fail the whole cycle (spec §7).
                    let broken = format!("{shadow_ref}.broken");
                    self.git.rename_ref(&shadow_ref, &broken).await.ok();
                    bail!(PulsarError::Corruption {
                        r#ref: shadow_ref.clone(),
                        detail: e.to_string(),
                    });
                }
            };
            if prior_tree == tree {
                return Ok(SnapshotOutcome::NoChange);
            }
        }

        let parent = match &prior_tip {
            Some(tip) => tip.clone(),
            None => self
                .git
                .resolve_ref(branch)
                .await?
                .ok_or_else(|| PulsarError::Blocker(format!("branch {branch} has no commits yet")))?,
        };

        let stat = match &prior_tip {
            Some(tip) => {
                let prior_tree = self.git.tree_of(tip).await.unwrap_or_else(|_| tree.clone());
                self.git
                    .diff_shortstat(&prior_tree, &tree)
                    .await
                    .unwrap_or_default()
            }
            None => self
                .git
                .diff_shortstat(&self.git.tree_of(&parent).await.unwrap_or_else(|_| tree.clone()), &tree)
                .await
                .unwrap_or_default(),
        };

        let message = format!(
            "pulsar: {} @ {} ({} files, +{}/-{})",
            self.machine_id,
            iso8601_now(),
            stat.files_changed,
            stat.insertions,
            stat.deletions,
        );

        let commit = self
            .git
            .commit_tree(&tree, std::slice::from_ref(&parent), &message)
            .await
            .context("committing shadow snapshot")?;

        self.git
            .update_ref_cas(&shadow_ref, &commit, prior_tip.as_ref())
            .await
            .context("updating shadow ref")?;

        info!(
            "{}: snapshot {} ({} files, +{}/-{})",
            self.git.repo_path.display(),
            commit.abbrev(),
            stat.files_changed,
            stat.insertions,
            stat.deletions,
        );

        Ok(SnapshotOutcome::Committed { commit, stat })
    }

    /// Push this machine's shadow namespace. Deferred (not an error) when on
    /// battery below the configured eco threshold.
    pub async fn push(&self, config: &Config) -> anyhow::Result<bool> {
        if !self.probe.on_ac_power().unwrap_or(true) {
            if let Ok(Some(percent)) = self.probe.battery_percent() {
                if percent < config.eco_mode_percent {
                    debug!(
                        "{}: eco mode ({}% < {}%), deferring push",
                        self.git.repo_path.display(),
                        percent,
                        config.eco_mode_percent
                    );
                    return Ok(false);
                }
            }
        }
        self.git
            .push(&config.remote_name, &push_refspec(&self.machine_id))
            .await?;
        Ok(true)
    }

    /// Veto check over the same candidate set `add_all_to_shadow_index`
    /// would stage, so an ignored build artifact never blocks a snapshot
    /// that would never have included it anyway.
    async fn find_oversized_file(
        &self,
        threshold: u64,
        ignore: &[String],
    ) -> anyhow::Result<Option<PathBuf>> {
        for path in self.git.list_candidate_paths(ignore).await? {
            let abs_path = self.git.repo_path.join(&path);
            if let Ok(metadata) = tokio::fs::symlink_metadata(&abs_path).await {
                if metadata.is_file() && metadata.len() > threshold {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    async fn mark_blocked(&self, path: &Path) -> anyhow::Result<()> {
        let state_path = self
            .git
            .repo_path
            .join(".git")
            .join(DRIFT_STATE_FILENAME);
        let mut state = DriftState::load(&state_path)?.unwrap_or_default();
        state.blocked_path = Some(path.to_owned());
        state.save(&state_path)
    }
}

fn iso8601_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_ref_name_encodes_slashes_in_branch() {
        assert_eq!(
            shadow_ref_name("m1", "feature/x"),
            "refs/heads/wip/pulsar/m1/feature%2Fx"
        );
    }

    #[test]
    fn push_refspec_is_scoped_to_machine_segment() {
        assert_eq!(
            push_refspec("m1"),
            "+refs/heads/wip/pulsar/m1/*:refs/heads/wip/pulsar/m1/*"
        );
    }

    #[test]
    fn fetch_refspec_covers_whole_namespace() {
        assert_eq!(
            fetch_refspec(),
            "refs/heads/wip/pulsar/*:refs/heads/wip/pulsar/*"
        );
    }
}
