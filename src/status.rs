//! Renders the `status` dashboard: Registry entries plus their cached
//! drift/doctor state. Unlike the teacher's `Tracker` (a live, repainted
//! terminal view driven by a running test-job stream), this is a one-shot
//! render - `status` itself is one-shot and must never block on the
//! network (spec §4.6 Zero-Latency invariant), so there's nothing to
//! repaint.

use colored::Colorize as _;

use crate::doctor::{self, RecentEvent, Severity};
use crate::drift::DriftState;
use crate::registry::RepoEntry;

pub struct StatusLine {
    pub path: String,
    pub doctor_lines: Vec<doctor::DoctorLine>,
}

pub fn build(entries: &[(RepoEntry, Option<DriftState>)]) -> Vec<StatusLine> {
    entries
        .iter()
        .map(|(entry, drift)| StatusLine {
            path: entry.path.display().to_string(),
            doctor_lines: doctor::report(entry, drift.as_ref(), &[] as &[RecentEvent]),
        })
        .collect()
}

pub fn render(lines: &[StatusLine]) -> String {
    if lines.is_empty() {
        return "no repositories registered\n".to_owned();
    }
    let mut out = String::new();
    for line in lines {
        out.push_str(&format!("{}\n", line.path.bold()));
        for doctor_line in &line.doctor_lines {
            let rendered = match doctor_line.severity {
                Severity::Info => doctor_line.message.normal(),
                Severity::Warning => doctor_line.message.yellow(),
                Severity::Error => doctor_line.message.red(),
            };
            out.push_str(&format!("  {rendered}\n"));
        }
    }
    out
}
