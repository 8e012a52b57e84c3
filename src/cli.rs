//! Thin `clap`-derived CLI surface mirroring spec §6's collaborator
//! contract. This is intentionally minimal - no Rich-style rendering, no
//! `--env` bootstrap - it exists to make every core operation reachable as
//! a process for testing and manual use (spec.md §1, SPEC_FULL.md §0.4).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pulsar", about = "Background state-capture daemon for multi-machine git working trees")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add the current repo to the registry (default action with no subcommand).
    Register,
    /// Synchronous snapshot + push for the current repo.
    Now,
    /// Fast-forward the working tree to the newest cross-machine shadow tip.
    Sync,
    /// Negotiate restoring one path from this machine's latest shadow tip.
    Restore { path: PathBuf },
    /// Octopus-squash every machine's shadow stream onto the current branch.
    Finalize,
    /// Stop snapshotting the current repo without removing it.
    Pause,
    /// Resume snapshotting a paused repo.
    Resume,
    /// Remove the current repo from the registry.
    Remove,
    /// Print registry + cached drift state; never touches the network.
    Status,
    /// Delete shadow refs older than 30 days and already-reconciled refs.
    Prune,
    /// Run the long-lived daemon loop.
    Daemon,
}
