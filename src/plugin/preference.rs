use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const PREFERENCES_FILE: &str = "plugin_preferences.toml";

/// How a plugin's tool should be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPreference {
    /// Follow the manifest's `prefer_system`, falling back to whatever exists.
    #[default]
    Auto,
    System,
    Portable,
}

impl ExecutionPreference {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionPreference::Auto => "auto",
            ExecutionPreference::System => "system",
            ExecutionPreference::Portable => "portable",
        }
    }
}

impl fmt::Display for ExecutionPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExecutionPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ExecutionPreference::Auto),
            "system" => Ok(ExecutionPreference::System),
            "portable" => Ok(ExecutionPreference::Portable),
            other => Err(format!(
                "unknown execution preference '{other}' (expected auto, system or portable)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPreference {
    pub execution_preference: ExecutionPreference,
    pub enabled: bool,
    pub notes: String,
}

impl Default for PluginPreference {
    fn default() -> Self {
        Self {
            execution_preference: ExecutionPreference::Auto,
            enabled: true,
            notes: String::new(),
        }
    }
}

/// Partial change to a preference; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferenceUpdate {
    pub execution_preference: Option<ExecutionPreference>,
    pub enabled: Option<bool>,
    pub notes: Option<String>,
}

impl PreferenceUpdate {
    pub fn is_empty(&self) -> bool {
        self.execution_preference.is_none() && self.enabled.is_none() && self.notes.is_none()
    }

    fn apply(self, preference: &mut PluginPreference) {
        if let Some(mode) = self.execution_preference {
            preference.execution_preference = mode;
        }
        if let Some(enabled) = self.enabled {
            preference.enabled = enabled;
        }
        if let Some(notes) = self.notes {
            preference.notes = notes;
        }
    }
}

/// Per-plugin user overrides persisted next to the main config.
///
/// Every write re-reads and rewrites the whole file. Two processes writing at
/// once can lose an update; the last writer wins.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join(PREFERENCES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all preferences, skipping entries that do not parse.
    pub fn load(&self) -> BTreeMap<String, PluginPreference> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                tracing::warn!("cannot read {}: {err}", self.path.display());
                return BTreeMap::new();
            }
        };

        let table: toml::Table = match toml::from_str(&text) {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!("ignoring malformed {}: {err}", self.path.display());
                return BTreeMap::new();
            }
        };

        table
            .into_iter()
            .filter_map(|(id, value)| match value.try_into::<PluginPreference>() {
                Ok(preference) => Some((id, preference)),
                Err(err) => {
                    tracing::warn!("skipping preference for plugin {id}: {err}");
                    None
                }
            })
            .collect()
    }

    pub fn save(&self, preferences: &BTreeMap<String, PluginPreference>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string(preferences).context("serializing plugin preferences")?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Stored preference or the default; never writes.
    pub fn get(&self, plugin_id: &str) -> PluginPreference {
        self.load().remove(plugin_id).unwrap_or_default()
    }

    pub fn set(&self, plugin_id: &str, preference: PluginPreference) -> Result<()> {
        let mut all = self.load();
        all.insert(plugin_id.to_string(), preference);
        self.save(&all)?;
        tracing::info!("saved preference for plugin {plugin_id}");
        Ok(())
    }

    pub fn update(&self, plugin_id: &str, update: PreferenceUpdate) -> Result<PluginPreference> {
        let mut preference = self.get(plugin_id);
        update.apply(&mut preference);
        self.set(plugin_id, preference.clone())?;
        Ok(preference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PreferenceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = PreferenceStore::in_dir(&tmp.path().join("config"));
        (tmp, store)
    }

    #[test]
    fn missing_entry_defaults_without_persisting() {
        let (_tmp, store) = store();
        let preference = store.get("nonexistent-plugin");
        assert_eq!(preference, PluginPreference::default());
        assert_eq!(preference.execution_preference, ExecutionPreference::Auto);
        assert!(preference.enabled);
        assert!(preference.notes.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn set_persists_and_get_reads_back() {
        let (_tmp, store) = store();
        let preference = PluginPreference {
            execution_preference: ExecutionPreference::System,
            enabled: false,
            notes: "use distro ffmpeg".to_string(),
        };
        store.set("ffmpeg", preference.clone()).unwrap();

        assert_eq!(store.get("ffmpeg"), preference);
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn update_changes_only_given_fields() {
        let (_tmp, store) = store();
        store
            .set(
                "git",
                PluginPreference {
                    notes: "keep".to_string(),
                    ..PluginPreference::default()
                },
            )
            .unwrap();

        let updated = store
            .update(
                "git",
                PreferenceUpdate {
                    execution_preference: Some(ExecutionPreference::Portable),
                    ..PreferenceUpdate::default()
                },
            )
            .unwrap();

        assert_eq!(updated.execution_preference, ExecutionPreference::Portable);
        assert_eq!(updated.notes, "keep");
        assert_eq!(store.get("git"), updated);
    }

    #[test]
    fn sequential_writers_last_write_wins() {
        let (_tmp, first) = store();
        let second = PreferenceStore::new(first.path());

        first
            .update(
                "exiftool",
                PreferenceUpdate {
                    enabled: Some(false),
                    ..PreferenceUpdate::default()
                },
            )
            .unwrap();
        second
            .update(
                "exiftool",
                PreferenceUpdate {
                    enabled: Some(true),
                    notes: Some("re-enabled".to_string()),
                    ..PreferenceUpdate::default()
                },
            )
            .unwrap();
        first.set("git", PluginPreference::default()).unwrap();

        let all = second.load();
        assert_eq!(all.len(), 2);
        assert!(all["exiftool"].enabled);
        assert_eq!(all["exiftool"].notes, "re-enabled");
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"
[git]
execution_preference = "system"

[ffmpeg]
execution_preference = "sometimes"

[exiftool]
enabled = "yes please"

[imagemagick]
notes = "partial entries fill defaults"
"#,
        )
        .unwrap();

        let all = store.load();
        let ids: Vec<&str> = all.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["git", "imagemagick"]);
        assert_eq!(all["git"].execution_preference, ExecutionPreference::System);
        assert!(all["imagemagick"].enabled);
    }

    #[test]
    fn malformed_file_loads_empty() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "[git\nbroken").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn parses_preference_names() {
        assert_eq!(
            "SYSTEM".parse::<ExecutionPreference>(),
            Ok(ExecutionPreference::System)
        );
        assert!("sometimes".parse::<ExecutionPreference>().is_err());
    }
}
