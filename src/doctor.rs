//! Pure decoupling of repository *state* from historical daemon *events*
//! for the `doctor`/`status` surface (spec §7).
//!
//! This module does no I/O of its own: callers load the `Registry` entry,
//! cached `DriftState`, and recent log events, and pass them in. That keeps
//! it composable with the Zero-Latency invariant on `status` (spec §4.6) -
//! nothing here can accidentally reach for the network.

use crate::drift::DriftState;
use crate::registry::RepoEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorLine {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentEvent {
    pub kind: &'static str,
    pub resolved: bool,
}

/// Produce the `doctor` report for one repo. A historical transient-failure
/// event is suppressed if the current state shows the condition has since
/// resolved (spec §7: "a transient log entry is suppressed if the current
/// state shows the condition is resolved").
pub fn report(
    entry: &RepoEntry,
    drift: Option<&DriftState>,
    recent_events: &[RecentEvent],
) -> Vec<DoctorLine> {
    let mut lines = Vec::new();

    if entry.paused {
        lines.push(DoctorLine {
            severity: Severity::Info,
            message: "paused".to_owned(),
        });
    }

    if let Some(drift) = drift {
        if let Some(blocked) = &drift.blocked_path {
            lines.push(DoctorLine {
                severity: Severity::Warning,
                message: format!("blocked: {} exceeds the large-file threshold", blocked.display()),
            });
        }
        if !drift.acknowledged && drift.at_time.is_some() {
            let machines = drift.observed_machines.join(", ");
            lines.push(DoctorLine {
                severity: Severity::Info,
                message: format!("drift detected from: {machines} (run `pulsar sync`)"),
            });
        }
    }

    for event in recent_events {
        if event.kind == "transient" && event.resolved {
            continue;
        }
        if event.kind == "transient" {
            lines.push(DoctorLine {
                severity: Severity::Info,
                message: "transient failure on last cycle, will retry".to_owned(),
            });
        }
    }

    if lines.is_empty() {
        lines.push(DoctorLine {
            severity: Severity::Info,
            message: "healthy".to_owned(),
        });
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry() -> RepoEntry {
        RepoEntry::new(PathBuf::from("/repo"), "m1".to_owned(), "main".to_owned())
    }

    #[test]
    fn healthy_repo_with_no_drift_reports_healthy() {
        let lines = report(&entry(), None, &[]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "healthy");
    }

    #[test]
    fn paused_repo_reports_paused() {
        let mut entry = entry();
        entry.paused = true;
        let lines = report(&entry, None, &[]);
        assert!(lines.iter().any(|l| l.message == "paused"));
    }

    #[test]
    fn resolved_transient_event_is_suppressed() {
        let events = [RecentEvent {
            kind: "transient",
            resolved: true,
        }];
        let lines = report(&entry(), None, &events);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "healthy");
    }

    #[test]
    fn unresolved_transient_event_is_reported() {
        let events = [RecentEvent {
            kind: "transient",
            resolved: false,
        }];
        let lines = report(&entry(), None, &events);
        assert!(lines
            .iter()
            .any(|l| l.message.contains("transient failure")));
    }

    #[test]
    fn unacknowledged_drift_surfaces_machine_list() {
        let drift = DriftState {
            observed_machines: vec!["m2".to_owned()],
            latest_shadow_sha_seen: Some("abc".to_owned()),
            at_time: Some(100),
            acknowledged: false,
            blocked_path: None,
        };
        let lines = report(&entry(), Some(&drift), &[]);
        assert!(lines.iter().any(|l| l.message.contains("m2")));
    }
}
