//! Roaming radar: per-repo remote polling and cached drift state
//! (spec §4.6).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::git::GitPlumbing;
use crate::probe::SystemProbe;
use crate::shadow::{fetch_refspec, machine_namespace_prefix, unix_now, PULSAR_REF_PREFIX};
use crate::util::atomic_write;

pub const DRIFT_STATE_FILENAME: &str = "pulsar_drift_state";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DriftState {
    #[serde(default)]
    pub observed_machines: Vec<String>,
    #[serde(default)]
    pub latest_shadow_sha_seen: Option<String>,
    #[serde(default)]
    pub at_time: Option<i64>,
    #[serde(default)]
    pub acknowledged: bool,
    /// Populated by `ShadowEngine` when a snapshot is vetoed for an
    /// oversized file; not part of the spec's drift-state shape proper but
    /// piggybacks on the same atomically-rewritten file so both concerns
    /// share one lock window.
    #[serde(default)]
    pub blocked_path: Option<PathBuf>,
}

impl DriftState {
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).with_context(|| format!("parsing {path:?}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing drift state")?;
        atomic_write(path, &bytes)
    }
}

pub struct DriftDetector<'a> {
    pub git: &'a GitPlumbing,
    pub probe: &'a SystemProbe,
    pub machine_id: String,
}

impl<'a> DriftDetector<'a> {
    pub fn new(git: &'a GitPlumbing, probe: &'a SystemProbe, machine_id: String) -> Self {
        Self {
            git,
            probe,
            machine_id,
        }
    }

    fn state_path(&self) -> PathBuf {
        self.git.repo_path.join(".git").join(DRIFT_STATE_FILENAME)
    }

    /// One poll tick: fetch, compare observed machine tips against the
    /// cached `at_time`, and notify on newly-observed drift. Reading drift
    /// state for `status` (see `crate::doctor`) never calls this - it reads
    /// the file directly, preserving the Zero-Latency invariant.
    pub async fn poll(&self, config: &Config) -> anyhow::Result<()> {
        self.git
            .fetch(&config.remote_name, &fetch_refspec())
            .await
            .context("fetching pulsar namespace")?;

        let refs = self.git.list_refs(PULSAR_REF_PREFIX).await?;
        let own_prefix = machine_namespace_prefix(&self.machine_id);

        let state_path = self.state_path();
        let mut state = DriftState::load(&state_path)?.unwrap_or_default();

        let mut newest_foreign: Option<(String, i64, String)> = None;
        for (ref_name, sha) in &refs {
            if ref_name.starts_with(&own_prefix) {
                continue;
            }
            let Some(machine_id) = extract_machine_id(ref_name) else {
                continue;
            };
            let commit_time = self.git.commit_time(sha).await.unwrap_or(0);
            if newest_foreign
                .as_ref()
                .map(|(_, t, _)| commit_time > *t)
                .unwrap_or(true)
            {
                newest_foreign = Some((machine_id, commit_time, sha.to_string()));
            }
        }

        let Some((newest_machine, newest_time, newest_sha)) = newest_foreign else {
            debug!(
                "{}: no cross-machine shadow refs observed",
                self.git.repo_path.display()
            );
            return Ok(());
        };

        let is_new = state
            .at_time
            .map(|prior| newest_time > prior)
            .unwrap_or(true);

        if is_new {
            let mut observed: HashSet<String> = state.observed_machines.into_iter().collect();
            observed.insert(newest_machine.clone());
            state.observed_machines = observed.into_iter().collect();
            state.observed_machines.sort();
            state.latest_shadow_sha_seen = Some(newest_sha);
            state.at_time = Some(newest_time);
            state.acknowledged = false;
            state.save(&state_path)?;

            info!(
                "{}: drift observed from {newest_machine}",
                self.git.repo_path.display()
            );
            self.probe.notify(
                "Git Pulsar: remote changes detected",
                &format!("{newest_machine} pushed new shadow commits - run `pulsar sync`"),
            );
        }

        Ok(())
    }

    /// Called by `sync`/`status --ack` to clear the banner.
    pub fn acknowledge(&self) -> anyhow::Result<()> {
        let state_path = self.state_path();
        let Some(mut state) = DriftState::load(&state_path)? else {
            return Ok(());
        };
        state.acknowledged = true;
        state.save(&state_path)
    }

    pub fn read_cached(&self) -> anyhow::Result<Option<DriftState>> {
        DriftState::load(&self.state_path())
    }

    pub fn due(&self, last_drift_check_at: Option<i64>, config: &Config) -> bool {
        let interval = config.drift_poll_interval.as_secs() as i64;
        match last_drift_check_at {
            Some(last) => unix_now() - last >= interval,
            None => true,
        }
    }
}

fn extract_machine_id(ref_name: &str) -> Option<String> {
    // refs/heads/wip/pulsar/<machine-id>/<branch...>
    let rest = ref_name.strip_prefix(&format!("{PULSAR_REF_PREFIX}/"))?;
    rest.split('/').next().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_machine_id_reads_segment_after_prefix() {
        assert_eq!(
            extract_machine_id("refs/heads/wip/pulsar/m1/feature%2Fx"),
            Some("m1".to_owned())
        );
    }

    #[test]
    fn extract_machine_id_none_outside_namespace() {
        assert_eq!(extract_machine_id("refs/heads/main"), None);
    }

    #[test]
    fn drift_state_roundtrips_through_json() {
        let state = DriftState {
            observed_machines: vec!["m1".to_owned(), "m2".to_owned()],
            latest_shadow_sha_seen: Some("deadbeef".to_owned()),
            at_time: Some(1000),
            acknowledged: false,
            blocked_path: None,
        };
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DRIFT_STATE_FILENAME);
        state.save(&path).unwrap();
        assert_eq!(DriftState::load(&path).unwrap(), Some(state));
    }

    #[test]
    fn missing_state_file_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DRIFT_STATE_FILENAME);
        assert_eq!(DriftState::load(&path).unwrap(), None);
    }
}
