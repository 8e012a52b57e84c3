//! Four-layer config cascade: hardcoded defaults, global config, repo-local
//! `pulsar.toml`, repo-local `[tool.git-pulsar]` table (spec §4.4, §9).

use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};

use anyhow::Context as _;
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::ConfigError;

pub const GLOBAL_CONFIG_FILENAME: &str = "config.toml";
pub const REPO_CONFIG_FILENAME: &str = "pulsar.toml";
// pyproject.toml is the closest thing to a language-agnostic "project
// metadata file" convention with an established `[tool.*]` sub-table idiom
// (ruff, black, mypy all read config from here); we follow the same pattern
// rather than inventing a new filename.
pub const PROJECT_METADATA_FILENAME: &str = "pyproject.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub remote_name: String,
    pub commit_interval: Duration,
    pub push_interval: Duration,
    pub eco_mode_percent: u8,
    pub drift_poll_interval: Duration,
    pub large_file_threshold: u64,
    pub ignore: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_name: "origin".to_owned(),
            commit_interval: Duration::from_secs(600),
            push_interval: Duration::from_secs(3600),
            eco_mode_percent: 20,
            drift_poll_interval: Duration::from_secs(900),
            large_file_threshold: 104_857_600,
            ignore: Vec::new(),
        }
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
struct RawCore {
    remote_name: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
struct RawDaemon {
    preset: Option<String>,
    commit_interval: Option<u64>,
    push_interval: Option<u64>,
    eco_mode_percent: Option<u8>,
    drift_poll_interval: Option<u64>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
struct RawLimits {
    large_file_threshold: Option<u64>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
struct RawFiles {
    ignore: Vec<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
struct RawLayer {
    core: RawCore,
    daemon: RawDaemon,
    limits: RawLimits,
    files: RawFiles,
}

// (section, allowed keys within it) - the schema unknown-key validation
// walks against this rather than relying on serde's own unknown-field
// message, so `ConfigError::UnknownKey` can name the exact dotted key.
const SECTIONS: &[(&str, &[&str])] = &[
    ("core", &["remote_name"]),
    (
        "daemon",
        &[
            "preset",
            "commit_interval",
            "push_interval",
            "eco_mode_percent",
            "drift_poll_interval",
        ],
    ),
    ("limits", &["large_file_threshold"]),
    ("files", &["ignore"]),
];

fn validate_keys(value: &toml::Value, file: &Path) -> Result<(), ConfigError> {
    let Some(table) = value.as_table() else {
        return Ok(());
    };
    for (section_name, section_value) in table {
        let Some((_, allowed)) = SECTIONS.iter().find(|(name, _)| name == section_name) else {
            return Err(ConfigError::UnknownKey {
                key: section_name.clone(),
                file: file.to_owned(),
            });
        };
        let Some(section_table) = section_value.as_table() else {
            continue;
        };
        for key in section_table.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(ConfigError::UnknownKey {
                    key: format!("{section_name}.{key}"),
                    file: file.to_owned(),
                });
            }
        }
    }
    Ok(())
}

fn preset_intervals(name: &str) -> Result<(u64, u64), ConfigError> {
    match name {
        "paranoid" => Ok((300, 300)),
        "aggressive" => Ok((300, 900)),
        "balanced" => Ok((600, 3600)),
        "lazy" => Ok((1800, 7200)),
        other => Err(ConfigError::UnknownPreset {
            preset: other.to_owned(),
        }),
    }
}

/// Apply one cascade layer onto the accumulator. A preset expands into
/// concrete intervals first; an explicit `commit_interval`/`push_interval`
/// in the *same* layer then overrides the preset's value, and a later
/// layer's fields always override this layer's, preset-derived or not.
fn apply_layer(acc: &mut Config, layer: &RawLayer) -> Result<(), ConfigError> {
    if let Some(preset) = &layer.daemon.preset {
        let (commit, push) = preset_intervals(preset)?;
        acc.commit_interval = Duration::from_secs(commit);
        acc.push_interval = Duration::from_secs(push);
    }
    if let Some(remote) = &layer.core.remote_name {
        acc.remote_name = remote.clone();
    }
    if let Some(v) = layer.daemon.commit_interval {
        acc.commit_interval = Duration::from_secs(v);
    }
    if let Some(v) = layer.daemon.push_interval {
        acc.push_interval = Duration::from_secs(v);
    }
    if let Some(v) = layer.daemon.eco_mode_percent {
        acc.eco_mode_percent = v;
    }
    if let Some(v) = layer.daemon.drift_poll_interval {
        acc.drift_poll_interval = Duration::from_secs(v);
    }
    if let Some(v) = layer.limits.large_file_threshold {
        acc.large_file_threshold = v;
    }
    let mut seen: HashSet<&str> = acc.ignore.iter().map(String::as_str).collect();
    for pattern in &layer.files.ignore {
        if seen.insert(pattern) {
            acc.ignore.push(pattern.clone());
        }
    }
    Ok(())
}

fn parse_layer(text: &str, file: &Path) -> Result<RawLayer, ConfigError> {
    let value: toml::Value = text
        .parse()
        .map_err(|source| ConfigError::Parse {
            file: file.to_owned(),
            source,
        })?;
    validate_keys(&value, file)?;
    RawLayer::deserialize(value).map_err(|source| ConfigError::Parse {
        file: file.to_owned(),
        source,
    })
}

pub struct ConfigCascade;

impl ConfigCascade {
    /// Load and merge all four layers for the repo rooted at `repo_root`.
    /// Missing files are silently skipped; a present-but-malformed file is
    /// a hard error.
    pub fn load(repo_root: &Path) -> anyhow::Result<Config> {
        let mut config = Config::default();

        if let Some(path) = Self::global_config_path() {
            if let Some(layer) = Self::read_layer(&path)? {
                apply_layer(&mut config, &layer)?;
            }
        }

        let repo_local = repo_root.join(REPO_CONFIG_FILENAME);
        if let Some(layer) = Self::read_layer(&repo_local)? {
            apply_layer(&mut config, &layer)?;
        }

        let project_meta = repo_root.join(PROJECT_METADATA_FILENAME);
        if let Some(layer) = Self::read_project_table(&project_meta)? {
            apply_layer(&mut config, &layer)?;
        }

        Ok(config)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg).join("git-pulsar").join(GLOBAL_CONFIG_FILENAME));
            }
        }
        ProjectDirs::from("", "", "git-pulsar")
            .map(|dirs| dirs.config_dir().join(GLOBAL_CONFIG_FILENAME))
    }

    fn read_layer(path: &Path) -> anyhow::Result<Option<RawLayer>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {path:?}")),
        };
        Ok(Some(parse_layer(&text, path)?))
    }

    fn read_project_table(path: &Path) -> anyhow::Result<Option<RawLayer>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {path:?}")),
        };
        let root: toml::Value = text.parse().map_err(|source| ConfigError::Parse {
            file: path.to_owned(),
            source,
        })?;
        let Some(sub) = root.get("tool").and_then(|tool| tool.get("git-pulsar")) else {
            return Ok(None);
        };
        validate_keys(sub, path)?;
        let layer = RawLayer::deserialize(sub.clone()).map_err(|source| ConfigError::Parse {
            file: path.to_owned(),
            source,
        })?;
        Ok(Some(layer))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use schemars::schema_for;

    use super::*;

    #[test]
    fn preset_expands_before_explicit_override_in_same_layer() {
        let layer: RawLayer = toml::from_str(
            r#"
            [daemon]
            preset = "paranoid"
            push_interval = 120
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        apply_layer(&mut config, &layer).unwrap();
        assert_eq!(config.commit_interval, Duration::from_secs(300));
        assert_eq!(config.push_interval, Duration::from_secs(120));
    }

    #[test]
    fn later_layer_explicit_value_wins_over_earlier_preset() {
        let mut config = Config::default();
        let global: RawLayer = toml::from_str("[daemon]\npreset = \"lazy\"\n").unwrap();
        let local: RawLayer = toml::from_str("[daemon]\ncommit_interval = 15\n").unwrap();
        apply_layer(&mut config, &global).unwrap();
        apply_layer(&mut config, &local).unwrap();
        assert_eq!(config.commit_interval, Duration::from_secs(15));
        // push_interval was never overridden in the local layer, so the
        // preset's value from the global layer survives.
        assert_eq!(config.push_interval, Duration::from_secs(7200));
    }

    #[test]
    fn ignore_lists_concatenate_with_first_occurrence_dedup() {
        let mut config = Config::default();
        let global: RawLayer =
            toml::from_str("[files]\nignore = [\"*.log\", \"*.tmp\"]\n").unwrap();
        let local: RawLayer = toml::from_str("[files]\nignore = [\"*.tmp\", \"build/\"]\n").unwrap();
        apply_layer(&mut config, &global).unwrap();
        apply_layer(&mut config, &local).unwrap();
        assert_eq!(config.ignore, vec!["*.log", "*.tmp", "build/"]);
    }

    #[test]
    fn cascade_merge_is_associative_for_scalars() {
        let mut incremental = Config::default();
        let defaults_global: RawLayer = toml::from_str("[core]\nremote_name = \"upstream\"\n").unwrap();
        let local: RawLayer = toml::from_str("[daemon]\neco_mode_percent = 5\n").unwrap();
        apply_layer(&mut incremental, &defaults_global).unwrap();
        apply_layer(&mut incremental, &local).unwrap();

        let mut two_step_intermediate = Config::default();
        apply_layer(&mut two_step_intermediate, &defaults_global).unwrap();
        let mut two_step = two_step_intermediate.clone();
        apply_layer(&mut two_step, &local).unwrap();

        assert_eq!(incremental, two_step);
    }

    #[test]
    fn unknown_top_level_key_is_rejected_with_precise_name() {
        let err = parse_layer("bogus = 1\n", Path::new("pulsar.toml")).unwrap_err();
        match err {
            ConfigError::UnknownKey { key, .. } => assert_eq!(key, "bogus"),
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn unknown_nested_key_is_rejected_with_dotted_name() {
        let err = parse_layer("[daemon]\nbogus = 1\n", Path::new("pulsar.toml")).unwrap_err();
        match err {
            ConfigError::UnknownKey { key, .. } => assert_eq!(key, "daemon.bogus"),
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn unknown_preset_name_is_rejected() {
        let layer: RawLayer = toml::from_str("[daemon]\npreset = \"bogus\"\n").unwrap();
        let mut config = Config::default();
        let err = apply_layer(&mut config, &layer).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPreset { preset } if preset == "bogus"));
    }

    #[test]
    fn schema_generation_does_not_panic() {
        let schema = schema_for!(RawLayer);
        assert!(schema.schema.metadata.is_some() || true);
    }
}
