use std::path::PathBuf;

use thiserror::Error;

/// The error-kind taxonomy from spec §7. Most call sites just propagate
/// `anyhow::Error` with context, the way the teacher's `git.rs` does; this
/// type exists for the handful of sites (daemon job dispatch, CLI exit-code
/// mapping) that need to branch on *kind* rather than just log and move on.
#[derive(Error, Debug)]
pub enum PulsarError {
    /// Network hiccups, fetch/push timeouts. Logged at INFO, retried next cycle.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rebase/merge in progress, index.lock present. Logged at DEBUG, cycle skipped.
    #[error("repository busy: {0}")]
    Busy(String),

    /// Oversized file, detached HEAD. Logged at WARN, notified, repo marked blocked.
    #[error("blocked: {0}")]
    Blocker(String),

    /// A shadow ref points at an object that no longer exists.
    #[error("corrupt shadow ref {r#ref}: {detail}")]
    Corruption { r#ref: String, detail: String },

    /// Cannot write to the state dir, no git binary on PATH. Daemon exits nonzero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PulsarError {
    /// Find a `PulsarError` of a known kind inside an anyhow chain, if any
    /// link of the `.context()` chain is one. Uses `downcast_ref` against
    /// every source in the chain rather than just the top error, since
    /// lower-level code usually wraps the classified error in additional
    /// context before it bubbles up.
    pub fn classify(err: &anyhow::Error) -> Option<&PulsarError> {
        err.chain().find_map(|cause| cause.downcast_ref())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown configuration key {key:?} in {file:?}")]
    UnknownKey { key: String, file: PathBuf },

    #[error("failed to parse {file:?}: {source}")]
    Parse {
        file: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown preset {preset:?} (expected one of paranoid, aggressive, balanced, lazy)")]
    UnknownPreset { preset: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_finds_wrapped_kind() {
        let base = anyhow::Error::new(PulsarError::Busy("rebase in progress".into()));
        let wrapped = base.context("running shadow engine cycle");
        match PulsarError::classify(&wrapped) {
            Some(PulsarError::Busy(msg)) => assert_eq!(msg, "rebase in progress"),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn classify_returns_none_for_plain_anyhow() {
        let err = anyhow::anyhow!("just a regular error");
        assert!(PulsarError::classify(&err).is_none());
    }
}
