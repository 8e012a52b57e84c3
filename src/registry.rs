//! Persistent set of tracked repositories (spec §3, §4.3).
//!
//! Single JSON file, read-compute-write-rename on every mutation so the
//! daemon and any concurrently-running CLI invocation never observe a
//! half-written file - the same atomic-rewrite discipline as drift state
//! (`crate::drift`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::util::atomic_write;

pub const REGISTRY_FILENAME: &str = "registry.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RepoEntry {
    pub path: PathBuf,
    pub machine_id: String,
    pub branch_at_register: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub last_snapshot_at: Option<i64>,
    #[serde(default)]
    pub last_push_at: Option<i64>,
    #[serde(default)]
    pub last_drift_check_at: Option<i64>,
}

impl RepoEntry {
    pub fn new(path: PathBuf, machine_id: String, branch_at_register: String) -> Self {
        Self {
            path,
            machine_id,
            branch_at_register,
            paused: false,
            last_snapshot_at: None,
            last_push_at: None,
            last_drift_check_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
struct RegistryFile {
    #[serde(default)]
    repos: HashMap<String, RepoEntry>,
}

pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            path: state_dir.join(REGISTRY_FILENAME),
        }
    }

    fn read(&self) -> anyhow::Result<RegistryFile> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).with_context(|| format!("parsing {:?}", self.path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e).with_context(|| format!("reading {:?}", self.path)),
        }
    }

    fn write(&self, file: &RegistryFile) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(file).context("serializing registry")?;
        atomic_write(&self.path, &bytes)
    }

    pub fn list(&self) -> anyhow::Result<Vec<RepoEntry>> {
        Ok(self.read()?.repos.into_values().collect())
    }

    pub fn get(&self, canonical_path: &Path) -> anyhow::Result<Option<RepoEntry>> {
        Ok(self.read()?.repos.get(&key(canonical_path)).cloned())
    }

    /// Returns `false` (and leaves the registry untouched) if the path is
    /// already registered - callers map this to the `register` command's
    /// "already registered" exit code (spec §6).
    pub fn register(&self, entry: RepoEntry) -> anyhow::Result<bool> {
        let mut file = self.read()?;
        let k = key(&entry.path);
        if file.repos.contains_key(&k) {
            return Ok(false);
        }
        file.repos.insert(k, entry);
        self.write(&file)?;
        Ok(true)
    }

    pub fn remove(&self, canonical_path: &Path) -> anyhow::Result<bool> {
        let mut file = self.read()?;
        let removed = file.repos.remove(&key(canonical_path)).is_some();
        if removed {
            self.write(&file)?;
        }
        Ok(removed)
    }

    pub fn set_paused(&self, canonical_path: &Path, paused: bool) -> anyhow::Result<bool> {
        self.mutate(canonical_path, |entry| entry.paused = paused)
    }

    pub fn record_snapshot(&self, canonical_path: &Path, at: i64) -> anyhow::Result<bool> {
        self.mutate(canonical_path, |entry| entry.last_snapshot_at = Some(at))
    }

    pub fn record_push(&self, canonical_path: &Path, at: i64) -> anyhow::Result<bool> {
        self.mutate(canonical_path, |entry| entry.last_push_at = Some(at))
    }

    pub fn record_drift_check(&self, canonical_path: &Path, at: i64) -> anyhow::Result<bool> {
        self.mutate(canonical_path, |entry| entry.last_drift_check_at = Some(at))
    }

    fn mutate(
        &self,
        canonical_path: &Path,
        f: impl FnOnce(&mut RepoEntry),
    ) -> anyhow::Result<bool> {
        let mut file = self.read()?;
        let Some(entry) = file.repos.get_mut(&key(canonical_path)) else {
            return Ok(false);
        };
        f(entry);
        self.write(&file)?;
        Ok(true)
    }

    /// Remove entries whose path was proved absent or proved to no longer
    /// be a git repository. `is_repo` is injected so tests don't need a
    /// real filesystem/git binary to exercise the pruning invariant (spec
    /// §4.3: never prune on a whitespace/encoding quirk, only on proof).
    pub fn prune(&self, is_repo: impl Fn(&Path) -> bool) -> anyhow::Result<Vec<PathBuf>> {
        let mut file = self.read()?;
        let mut removed = Vec::new();
        file.repos.retain(|_, entry| {
            let exists = entry.path.exists();
            let keep = exists && is_repo(&entry.path);
            if !keep {
                removed.push(entry.path.clone());
            }
            keep
        });
        if !removed.is_empty() {
            self.write(&file)?;
        }
        Ok(removed)
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
