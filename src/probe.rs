//! Stable machine identity plus power/load telemetry (spec §4.2).
//!
//! All OS-specific reads live here so the rest of the crate only depends on
//! `SystemProbe`'s narrow interface, the same separation the teacher draws
//! between `git.rs`'s subprocess plumbing and the rest of the engine.

use std::fs;
use std::hash::{Hash as _, Hasher as _};
use std::path::PathBuf;
use std::process::Command;

use anyhow::Context as _;
use sha3::{Digest, Sha3_256};

use crate::util::DigestHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now(pub i64);

pub struct SystemProbe {
    state_dir: PathBuf,
}

impl SystemProbe {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Stable per-host id, cached at `${state_dir}/machine_id` after first
    /// resolution so subsequent calls (and subsequent processes) agree even
    /// if the underlying OS primitive becomes briefly unavailable.
    pub fn machine_id(&self) -> anyhow::Result<String> {
        let cache_path = self.state_dir.join("machine_id");
        if let Ok(cached) = fs::read_to_string(&cache_path) {
            let cached = cached.trim();
            if !cached.is_empty() {
                return Ok(cached.to_owned());
            }
        }
        let resolved = Self::resolve_machine_id()?;
        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        crate::util::atomic_write(&cache_path, resolved.as_bytes())
            .with_context(|| format!("caching machine id at {cache_path:?}"))?;
        Ok(resolved)
    }

    fn resolve_machine_id() -> anyhow::Result<String> {
        if cfg!(target_os = "macos") {
            if let Some(id) = Self::macos_platform_uuid() {
                return Ok(id);
            }
        }
        if let Ok(id) = fs::read_to_string("/etc/machine-id") {
            let id = id.trim();
            if !id.is_empty() {
                return Ok(id.to_owned());
            }
        }
        Ok(Self::hostname_username_fallback())
    }

    fn macos_platform_uuid() -> Option<String> {
        let output = Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines().find_map(|line| {
            let line = line.trim();
            line.strip_prefix("\"IOPlatformUUID\" = \"")
                .and_then(|rest| rest.strip_suffix('"'))
                .map(|s| s.to_owned())
        })
    }

    fn hostname_username_fallback() -> String {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                Command::new("hostname")
                    .output()
                    .ok()
                    .filter(|o| o.status.success())
                    .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
            })
            .unwrap_or_else(|| "unknown-host".to_owned());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown-user".to_owned());

        let mut hasher = DigestHasher {
            digest: Sha3_256::new(),
        };
        hostname.hash(&mut hasher);
        username.hash(&mut hasher);
        hex::encode(hasher.digest.finalize())
    }

    pub fn on_ac_power(&self) -> anyhow::Result<bool> {
        if cfg!(target_os = "linux") {
            let power_supply_dir = PathBuf::from("/sys/class/power_supply");
            let Ok(entries) = fs::read_dir(&power_supply_dir) else {
                // No power-supply subsystem at all: desktop-class, always OK.
                return Ok(true);
            };
            let mut saw_battery = false;
            for entry in entries.flatten() {
                let type_path = entry.path().join("type");
                let Ok(kind) = fs::read_to_string(&type_path) else {
                    continue;
                };
                if kind.trim() == "Battery" {
                    saw_battery = true;
                    let online = fs::read_to_string(entry.path().join("status"))
                        .map(|s| s.trim() != "Discharging")
                        .unwrap_or(true);
                    if online {
                        return Ok(true);
                    }
                }
            }
            return Ok(!saw_battery);
        }
        if cfg!(target_os = "macos") {
            if let Some(output) = Self::pmset_output() {
                return Ok(!output.contains("Battery Power"));
            }
        }
        Ok(true)
    }

    pub fn battery_percent(&self) -> anyhow::Result<Option<u8>> {
        if cfg!(target_os = "linux") {
            let power_supply_dir = PathBuf::from("/sys/class/power_supply");
            let Ok(entries) = fs::read_dir(&power_supply_dir) else {
                return Ok(None);
            };
            for entry in entries.flatten() {
                let type_path = entry.path().join("type");
                let Ok(kind) = fs::read_to_string(&type_path) else {
                    continue;
                };
                if kind.trim() != "Battery" {
                    continue;
                }
                if let Ok(capacity) = fs::read_to_string(entry.path().join("capacity")) {
                    if let Ok(percent) = capacity.trim().parse::<u8>() {
                        return Ok(Some(percent));
                    }
                }
            }
            return Ok(None);
        }
        if cfg!(target_os = "macos") {
            if let Some(output) = Self::pmset_output() {
                if let Some(percent) = parse_pmset_percent(&output) {
                    return Ok(Some(percent));
                }
            }
        }
        Ok(None)
    }

    fn pmset_output() -> Option<String> {
        let output = Command::new("pmset").args(["-g", "batt"]).output().ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn cpu_load_1m(&self) -> anyhow::Result<f64> {
        let text = fs::read_to_string("/proc/loadavg").context("reading /proc/loadavg")?;
        let first = text
            .split_whitespace()
            .next()
            .context("empty /proc/loadavg")?;
        first.parse::<f64>().context("parsing /proc/loadavg")
    }

    /// Best-effort desktop notification. Absence of the notifier binary is
    /// swallowed, never fatal (spec §4.2).
    pub fn notify(&self, title: &str, body: &str) {
        let result = if cfg!(target_os = "macos") {
            Command::new("osascript")
                .arg("-e")
                .arg(format!(
                    "display notification {body:?} with title {title:?}"
                ))
                .status()
        } else {
            Command::new("notify-send").arg(title).arg(body).status()
        };
        if let Err(e) = result {
            log::debug!("notification delivery unavailable: {e}");
        }
    }

    pub fn now(&self) -> Now {
        Now(chrono::Utc::now().timestamp())
    }
}

fn parse_pmset_percent(output: &str) -> Option<u8> {
    // e.g. "-InternalBattery-0 (id=...)\t62%; discharging; ..."
    let percent_idx = output.find('%')?;
    let digits_start = output[..percent_idx]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    output[digits_start..percent_idx].parse().ok()
}
