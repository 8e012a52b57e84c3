use core::fmt;
use std::{
    fmt::{Display, Formatter},
    fs::{self, File},
    future::Future,
    io::{self, Write as _},
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
#[allow(unused_imports)]
use log::{debug, error};
use nix::fcntl::{Flock, FlockArg};
use sha3::digest;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct DisplayablePathBuf(pub PathBuf);

impl FromStr for DisplayablePathBuf {
    type Err = <PathBuf as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathBuf::from_str(s).map(Self)
    }
}

impl From<PathBuf> for DisplayablePathBuf {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl From<DisplayablePathBuf> for PathBuf {
    fn from(d: DisplayablePathBuf) -> PathBuf {
        d.0
    }
}

impl Display for DisplayablePathBuf {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0.display(), f)
    }
}

impl Deref for DisplayablePathBuf {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

// It's an ErrGroup like from Go lol.
// https://stackoverflow.com/questions/79172707/concise-tokio-equivalent-of-gos-errgroup
pub struct ErrGroup {
    ct: CancellationToken,
    join_set: JoinSet<anyhow::Result<()>>,
}

impl ErrGroup {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            ct,
            join_set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // Drop the returned AbortHandle so we can unwrap the result of the join in wait.
        self.join_set.spawn(task);
    }

    // Block until all tasks are complete, return the first error. As soon as
    // any returns an error, cancel the token passed to new. Panics if any of
    // the tasks panic.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut final_result: anyhow::Result<()> = Ok(());

        while let Some(result) = self.join_set.join_next().await {
            if let Err(err) = result.expect("joining ErrGroup tasks") {
                if final_result.is_ok() {
                    final_result = Err(err)
                }
                self.ct.cancel();
                break;
            }
        }

        // Wait for remaining tasks to exit due to cancellation
        let _ = self.join_set.join_all().await;

        final_result
    }
}

pub trait IoResultExt {
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) => {
                if e.kind() == kind {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

// I want to use the RustCrypto hasher types as a Hasher (i.e. on objects that
// don't actually provide bytes). This is an adapter for making a
// std::hash::Hasher from a digest::Digest, used for the hostname+user
// machine-id fallback hash.
pub struct DigestHasher<D: digest::Digest> {
    pub digest: D,
}

impl<D: digest::Digest> std::hash::Hasher for DigestHasher<D> {
    fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes)
    }

    // This is required for the Hasher trait, but you shouldn't call it, it's
    // just throwing hash bits away for no reason.
    fn finish(&self) -> u64 {
        panic!("don't call this");
    }
}

/// Atomically replace the contents of `path` with `contents`: write to a
/// sibling `.tmp` file then rename over the target, so readers never observe
/// a partially-written file (Registry/drift-state invariant, spec §3d).
pub fn atomic_write(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
    }
    {
        let mut tmp = File::create(&tmp_path).with_context(|| format!("creating {tmp_path:?}"))?;
        tmp.write_all(contents)
            .with_context(|| format!("writing {tmp_path:?}"))?;
        tmp.sync_all()
            .with_context(|| format!("syncing {tmp_path:?}"))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("renaming {tmp_path:?} to {path:?}"))?;
    Ok(())
}

/// A zero-length advisory lock file, held non-blocking for the guard's
/// lifetime. Used for the per-repo `pulsar.lock` (spec §5).
pub struct AdvisoryLock {
    _flock: Flock<File>,
}

impl AdvisoryLock {
    /// Try to acquire the lock at `path`, creating the file if absent.
    /// Returns `Ok(None)` if another process already holds it - callers
    /// should skip the current cycle, not retry or block.
    pub fn try_acquire(path: &Path) -> anyhow::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating lock directory")?;
        }
        let file = File::create(path).with_context(|| format!("opening lock file {path:?}"))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self { _flock: flock })),
            Err((_file, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_file, e)) => Err(anyhow::anyhow!("flock failed: {e}")),
        }
    }
}
