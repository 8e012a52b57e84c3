//! Octopus merge, sync, and restore: the three foreground-only operations
//! that touch the user's real branch or working tree (spec §4.7).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use itertools::Itertools as _;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::git::{CommitHash, GitPlumbing, ReadTreeResult, TreeHash};
use crate::shadow::{fetch_refspec, shadow_ref_name, PULSAR_REF_PREFIX};
use crate::util::atomic_write;

const RECONCILED_FILENAME: &str = "pulsar_reconciled_refs";

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct ReconciledRefs(HashMap<String, String>);

impl ReconciledRefs {
    fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).with_context(|| format!("parsing {path:?}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.0).context("serializing reconciled refs")?;
        atomic_write(path, &bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    FastForwarded { tree: TreeHash },
    NoDrift,
    WorkingTreeDirty,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Committed {
        commit: CommitHash,
        contributing_machines: Vec<String>,
    },
    NoShadowRefs,
    Conflict {
        paths: Vec<PathBuf>,
    },
}

/// `restore`'s interactive loop (spec §4.7 Negotiation state machine). The
/// caller supplies the three user-facing actions; this function owns only
/// the PROMPT → OVERWRITE/VIEW_DIFF/CANCEL transition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationChoice {
    Overwrite,
    ViewDiff,
    Cancel,
}

pub enum RestoreOutcome {
    Overwritten,
    Canceled,
    NotModifiedLocally,
}

pub struct Reconciler<'a> {
    pub git: &'a GitPlumbing,
    pub machine_id: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(git: &'a GitPlumbing, machine_id: String) -> Self {
        Self { git, machine_id }
    }

    fn reconciled_path(&self) -> PathBuf {
        self.git.repo_path.join(".git").join(RECONCILED_FILENAME)
    }

    async fn shadow_refs_for_branch(
        &self,
        branch: &str,
    ) -> anyhow::Result<Vec<(String, String, CommitHash)>> {
        let refs = self.git.list_refs(PULSAR_REF_PREFIX).await?;
        let encoded_branch = urlencoding::encode(branch).into_owned();
        Ok(refs
            .into_iter()
            .filter_map(|(name, sha)| {
                let rest = name.strip_prefix(&format!("{PULSAR_REF_PREFIX}/"))?;
                let (machine_id, branch_part) = rest.split_once('/')?;
                (branch_part == encoded_branch).then(|| (name, machine_id.to_owned(), sha))
            })
            .collect())
    }

    /// Fast-forward the working tree to the newest cross-machine shadow
    /// tip. Never mutates the user branch ref. Interactive confirmation is
    /// the caller's responsibility before invoking this with `confirmed =
    /// true`; with `confirmed = false` this only reports what would happen.
    pub async fn sync(
        &self,
        branch: &str,
        config: &Config,
        confirmed: bool,
    ) -> anyhow::Result<SyncOutcome> {
        self.git
            .fetch(&config.remote_name, &fetch_refspec())
            .await
            .context("fetching pulsar namespace")?;

        let refs = self.shadow_refs_for_branch(branch).await?;
        let mut newest: Option<(CommitHash, i64)> = None;
        for (_, _, sha) in &refs {
            let t = self.git.commit_time(sha).await.unwrap_or(0);
            if newest.as_ref().map(|(_, nt)| t > *nt).unwrap_or(true) {
                newest = Some((sha.clone(), t));
            }
        }
        let Some((tip, _)) = newest else {
            return Ok(SyncOutcome::NoDrift);
        };

        if !self.git.is_working_tree_clean().await? {
            return Ok(SyncOutcome::WorkingTreeDirty);
        }

        let tree = self.git.tree_of(&tip).await?;
        if confirmed {
            self.git.read_tree_checkout(&tree).await?;
        }
        Ok(SyncOutcome::FastForwarded { tree })
    }

    /// Negotiate restoring `path` from this machine's own latest shadow
    /// tip. `choose` is invoked once per PROMPT state and returns the next
    /// transition; VIEW_DIFF loops back to another PROMPT.
    pub async fn restore(
        &self,
        branch: &str,
        path: &Path,
        mut choose: impl FnMut(&[u8]) -> NegotiationChoice,
    ) -> anyhow::Result<RestoreOutcome> {
        let shadow_ref = shadow_ref_name(&self.machine_id, branch);
        let tip = self
            .git
            .resolve_ref(&shadow_ref)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no shadow ref for this machine/branch yet"))?;

        let shadow_blob = self.git.read_blob(&tip, path).await.unwrap_or_default();
        let local_path = self.git.repo_path.join(path);

        if !local_path.exists() {
            self.git.checkout_file(&tip, path).await?;
            return Ok(RestoreOutcome::Overwritten);
        }

        let local_bytes = std::fs::read(&local_path).unwrap_or_default();
        if local_bytes == shadow_blob {
            return Ok(RestoreOutcome::NotModifiedLocally);
        }

        loop {
            match choose(&shadow_blob) {
                NegotiationChoice::Overwrite => {
                    self.git.checkout_file(&tip, path).await?;
                    return Ok(RestoreOutcome::Overwritten);
                }
                NegotiationChoice::ViewDiff => continue,
                NegotiationChoice::Cancel => return Ok(RestoreOutcome::Canceled),
            }
        }
    }

    /// Octopus squash of every machine's shadow tip for `branch` onto the
    /// user branch.
    pub async fn finalize(&self, branch: &str, config: &Config) -> anyhow::Result<FinalizeOutcome> {
        self.git
            .fetch(&config.remote_name, &fetch_refspec())
            .await
            .context("fetching pulsar namespace")?;

        let mut refs = self.shadow_refs_for_branch(branch).await?;
        if refs.is_empty() {
            return Ok(FinalizeOutcome::NoShadowRefs);
        }
        // Deterministic parent ordering (spec §4.7 step 4, invariant 5).
        refs.sort_by(|a, b| a.1.cmp(&b.1));

        let prior_tip = self
            .git
            .resolve_ref(branch)
            .await?
            .ok_or_else(|| anyhow::anyhow!("branch {branch} has no commits yet"))?;

        let mut all_commits: Vec<CommitHash> = vec![prior_tip.clone()];
        all_commits.extend(refs.iter().map(|(_, _, sha)| sha.clone()));
        let base = self.git.merge_base_octopus(&all_commits).await?;

        let trees = {
            let mut trees = Vec::with_capacity(refs.len());
            for (_, _, sha) in &refs {
                trees.push(self.git.tree_of(sha).await?);
            }
            trees
        };
        let base_tree = match &base {
            Some(b) => Some(self.git.tree_of(b).await?),
            None => None,
        };

        let index_path = self
            .git
            .repo_path
            .join(".git")
            .join("pulsar_finalize_index");
        let result = self
            .git
            .read_tree_merge(&index_path, base_tree.as_ref(), &trees)
            .await?;

        let merged_tree = match result {
            ReadTreeResult::Merged(tree) => tree,
            ReadTreeResult::Conflicts(paths) => return Ok(FinalizeOutcome::Conflict { paths }),
        };

        let machines: Vec<String> = refs.iter().map(|(_, m, _)| m.clone()).collect();
        let message = format!(
            "pulsar: finalize {} ({} machines: {})",
            branch,
            machines.len(),
            machines.iter().join(", ")
        );

        let mut parents = vec![prior_tip.clone()];
        parents.extend(refs.iter().map(|(_, _, sha)| sha.clone()));

        let commit = self
            .git
            .commit_tree(&merged_tree, &parents, &message)
            .await
            .context("committing finalize squash")?;

        self.git
            .update_ref_cas(branch, &commit, Some(&prior_tip))
            .await
            .context("advancing user branch")?;

        let reconciled_path = self.reconciled_path();
        let mut reconciled = ReconciledRefs::load(&reconciled_path)?;
        for (ref_name, _, _) in &refs {
            reconciled.0.insert(ref_name.clone(), commit.to_string());
        }
        reconciled.save(&reconciled_path)?;

        info!(
            "{}: finalized {} onto {} from {} machines",
            self.git.repo_path.display(),
            commit.abbrev(),
            branch,
            machines.len()
        );

        Ok(FinalizeOutcome::Committed {
            commit,
            contributing_machines: machines,
        })
    }

    pub fn reconciled_up_to(&self, ref_name: &str) -> anyhow::Result<Option<CommitHash>> {
        let reconciled = ReconciledRefs::load(&self.reconciled_path())?;
        Ok(reconciled.0.get(ref_name).map(|s| CommitHash::new(s.clone())))
    }

    /// Delete shadow refs across the whole namespace (not just `branch`)
    /// that are either already reconciled or older than 30 days (spec §6,
    /// §9 open question: age-based prune is required, eager prune of
    /// reconciled refs is permitted - we do both).
    pub async fn prune(&self, now: i64) -> anyhow::Result<Vec<String>> {
        const THIRTY_DAYS_SECS: i64 = 30 * 24 * 60 * 60;

        let reconciled = ReconciledRefs::load(&self.reconciled_path())?;
        let refs = self.git.list_refs(PULSAR_REF_PREFIX).await?;
        let mut pruned = Vec::new();

        for (ref_name, sha) in refs {
            let is_reconciled = reconciled.0.contains_key(&ref_name);
            let is_stale = self
                .git
                .commit_time(&sha)
                .await
                .map(|t| now - t > THIRTY_DAYS_SECS)
                .unwrap_or(false);
            if is_reconciled || is_stale {
                self.git.delete_ref(&ref_name).await?;
                pruned.push(ref_name);
            }
        }

        Ok(pruned)
    }
}
