use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::platform::AppDirs;
use crate::plugin::preference::{PluginPreference, PreferenceStore, PreferenceUpdate};

const BUILTIN_DEFAULTS: &str = include_str!("../../config/default.toml");

pub const DEFAULT_FILE: &str = "default.toml";
pub const USER_FILE: &str = "user.toml";
pub const REDACTED: &str = "***REDACTED***";

// Substring match, so `api_keystone` is redacted as well.
const SENSITIVE_KEYWORDS: [&str; 5] = ["password", "token", "secret", "key", "api_key"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub ui: UiConfig,
    pub plugins: PluginsConfig,
    /// Loaded from the preferences file, never from the config layers.
    #[serde(default)]
    pub plugin_preferences: BTreeMap<String, PluginPreference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub data_dir: String,
    pub cache_dir: String,
    pub plugins_dir: String,
    pub log_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub keep_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    pub theme: String,
    pub language: String,
    pub show_welcome_wizard: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    pub auto_download: bool,
    pub verify_checksums: bool,
    pub github_token: String,
    /// Free-form per-plugin settings, keyed by plugin id.
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Table>,
}

impl AppConfig {
    pub fn plugins_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.plugins_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.log_dir)
    }

    /// Empty paths take the resolved directories; `~` expands to home.
    fn fill_paths(&mut self, dirs: &AppDirs) {
        let slots = [
            (&mut self.paths.data_dir, &dirs.data_dir),
            (&mut self.paths.cache_dir, &dirs.cache_dir),
            (&mut self.paths.plugins_dir, &dirs.plugins_dir),
            (&mut self.paths.log_dir, &dirs.log_dir),
        ];

        for (slot, fallback) in slots {
            if slot.trim().is_empty() {
                *slot = fallback.to_string_lossy().into_owned();
            } else if slot.starts_with('~') {
                *slot = expand_tilde(Path::new(slot.as_str()))
                    .to_string_lossy()
                    .into_owned();
            }
        }
    }
}

/// Owns the merged configuration and every write to it.
///
/// Layers, lowest first: built-in defaults, `<config>/default.toml`,
/// `<config>/user.toml`. Plugin preferences come from their own file and are
/// attached after the merge.
#[derive(Debug)]
pub struct ConfigService {
    dirs: AppDirs,
    preferences: PreferenceStore,
    base: toml::Table,
    config: AppConfig,
}

impl ConfigService {
    pub fn new(dirs: AppDirs, legacy_dir: Option<&Path>) -> Result<Self> {
        if let Some(legacy_dir) = legacy_dir {
            copy_legacy_config(legacy_dir, &dirs.config_dir)?;
        }

        let preferences = PreferenceStore::in_dir(&dirs.config_dir);
        let base = builtin_defaults()?;
        let config = deserialize_layer(&base)?;

        let mut service = Self {
            dirs,
            preferences,
            base,
            config,
        };
        service.load()?;
        Ok(service)
    }

    /// Each on-disk layer is checked on its own; a layer that does not parse
    /// or does not fit the schema is skipped and the others still apply.
    pub fn load(&mut self) -> Result<&AppConfig> {
        let mut base = builtin_defaults()?;
        let default_path = self.default_path();
        if let Some(layer) = read_layer(&default_path) {
            base = merge_checked(base, layer, &default_path);
        }

        let mut merged = base.clone();
        let user_path = self.user_path();
        if let Some(layer) = read_layer(&user_path) {
            merged = merge_checked(merged, layer, &user_path);
        }

        let mut config = deserialize_layer(&merged)?;
        config.plugin_preferences = self.preferences.load();
        config.fill_paths(&self.dirs);

        self.base = base;
        self.config = config;
        Ok(&self.config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn default_path(&self) -> PathBuf {
        self.dirs.config_dir.join(DEFAULT_FILE)
    }

    pub fn user_path(&self) -> PathBuf {
        self.dirs.config_dir.join(USER_FILE)
    }

    /// Sets one dotted key (`ui.theme`) and persists the result.
    pub fn set(&mut self, key_path: &str, value: toml::Value) -> Result<()> {
        let mut table = to_table(&self.config)?;
        insert_dotted(&mut table, key_path, value)?;
        let config =
            deserialize_layer(&table).with_context(|| format!("invalid value for {key_path}"))?;
        self.save_user(&config)
    }

    /// Persists only the fields of `config` that differ from the defaults, so
    /// later changes to the default layers still reach untouched fields.
    pub fn save_user(&mut self, config: &AppConfig) -> Result<()> {
        let mut baseline = deserialize_layer(&self.base)?;
        baseline.fill_paths(&self.dirs);

        let baseline = to_table(&baseline)?;
        let current = to_table(config)?;
        let mut layer = diff_tables(&baseline, &current);
        layer.remove("plugin_preferences");

        self.write_user(&layer)?;
        self.load()?;
        Ok(())
    }

    /// Deletes the user layer and reloads pure defaults.
    pub fn reset(&mut self) -> Result<&AppConfig> {
        let user_path = self.user_path();
        if user_path.exists() {
            fs::remove_file(&user_path)
                .with_context(|| format!("removing {}", user_path.display()))?;
            tracing::info!("removed {}", user_path.display());
        }
        self.load()
    }

    pub fn export(&self, path: &Path, redact: bool) -> Result<()> {
        let mut value = toml::Value::try_from(&self.config).context("serializing config")?;
        if redact {
            redact_sensitive(&mut value);
        }

        let text = toml::to_string_pretty(&value).context("rendering config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("exported config to {} (redacted: {redact})", path.display());
        Ok(())
    }

    /// Read from disk, so writes by other processes are visible.
    pub fn plugin_preference(&self, plugin_id: &str) -> PluginPreference {
        self.preferences.get(plugin_id)
    }

    pub fn set_plugin_preference(
        &mut self,
        plugin_id: &str,
        update: PreferenceUpdate,
    ) -> Result<PluginPreference> {
        let preference = self.preferences.update(plugin_id, update)?;
        self.config
            .plugin_preferences
            .insert(plugin_id.to_string(), preference.clone());
        Ok(preference)
    }

    fn write_user(&self, layer: &toml::Table) -> Result<()> {
        let user_path = self.user_path();
        fs::create_dir_all(&self.dirs.config_dir)?;
        let text = toml::to_string_pretty(layer).context("rendering user config")?;
        fs::write(&user_path, text).with_context(|| format!("writing {}", user_path.display()))?;
        tracing::info!("saved {}", user_path.display());
        Ok(())
    }
}

/// Recursively merges `overlay` into `base`: tables merge key by key, every
/// other value (arrays included) replaces what was there.
pub fn deep_merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                deep_merge(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Replaces the value of every sensitive key, at any depth.
pub fn redact_sensitive(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, entry) in table.iter_mut() {
                if is_sensitive(key) {
                    *entry = toml::Value::String(REDACTED.to_string());
                } else {
                    redact_sensitive(entry);
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(redact_sensitive),
        _ => {}
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|word| key.contains(word))
}

/// Parses a command-line value as TOML (`true`, `3`, `["a"]`), falling back
/// to a plain string.
pub fn parse_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn builtin_defaults() -> Result<toml::Table> {
    toml::from_str(BUILTIN_DEFAULTS).context("parsing built-in defaults")
}

/// `layer` on top of `base`, or `base` alone when the result is not a valid
/// config.
fn merge_checked(base: toml::Table, layer: toml::Table, path: &Path) -> toml::Table {
    let mut merged = base.clone();
    deep_merge(&mut merged, layer);
    match deserialize_layer(&merged) {
        Ok(_) => merged,
        Err(err) => {
            tracing::warn!("ignoring {}: {err:#}", path.display());
            base
        }
    }
}

fn deserialize_layer(table: &toml::Table) -> Result<AppConfig> {
    toml::Value::Table(table.clone())
        .try_into()
        .map_err(|err| anyhow!("{err}"))
}

fn to_table<T: Serialize>(value: &T) -> Result<toml::Table> {
    match toml::Value::try_from(value)? {
        toml::Value::Table(table) => Ok(table),
        other => bail!("expected a table, got {}", other.type_str()),
    }
}

fn read_layer(path: &Path) -> Option<toml::Table> {
    if !path.exists() {
        return None;
    }

    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| toml::from_str::<toml::Table>(&text).map_err(anyhow::Error::from));

    match parsed {
        Ok(table) => Some(table),
        Err(err) => {
            tracing::warn!("ignoring malformed {}: {err}", path.display());
            None
        }
    }
}

/// Keys of `current` whose values differ from `base`, nested tables included.
fn diff_tables(base: &toml::Table, current: &toml::Table) -> toml::Table {
    let mut out = toml::Table::new();
    for (key, value) in current {
        match (base.get(key), value) {
            (Some(toml::Value::Table(old)), toml::Value::Table(new)) => {
                let nested = diff_tables(old, new);
                if !nested.is_empty() {
                    out.insert(key.clone(), toml::Value::Table(nested));
                }
            }
            (Some(old), new) if old == new => {}
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn insert_dotted(table: &mut toml::Table, key_path: &str, value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key_path.split('.').map(str::trim).collect();
    if parts.iter().any(|part| part.is_empty()) {
        bail!("invalid config key: {key_path:?}");
    }

    let last = parts.pop().unwrap_or_default();
    let mut cursor = table;
    for part in parts {
        let entry = cursor
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        cursor = match entry {
            toml::Value::Table(next) => next,
            _ => bail!("config key {part:?} in {key_path:?} is not a table"),
        };
    }
    cursor.insert(last.to_string(), value);
    Ok(())
}

/// One-shot copy of config files from the pre-platform-dirs location.
///
/// Runs only while the new location has no user file; the legacy files stay
/// where they are.
fn copy_legacy_config(legacy_dir: &Path, config_dir: &Path) -> Result<usize> {
    if !legacy_dir.is_dir() || legacy_dir == config_dir || config_dir.join(USER_FILE).exists() {
        return Ok(0);
    }

    fs::create_dir_all(config_dir)?;
    let mut copied = 0;
    for entry in fs::read_dir(legacy_dir)? {
        let path = entry?.path();
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let Some(name) = path.file_name() else {
            continue;
        };
        if !path.is_file() || !is_toml {
            continue;
        }

        let target = config_dir.join(name);
        if target.exists() {
            continue;
        }
        fs::copy(&path, &target)
            .with_context(|| format!("copying {} to {}", path.display(), target.display()))?;
        copied += 1;
    }

    if copied > 0 {
        tracing::info!(
            "copied {copied} legacy config file(s) from {}",
            legacy_dir.display()
        );
    }
    Ok(copied)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if !text.starts_with('~') {
        return path.to_path_buf();
    }

    if let Some(base_dirs) = directories::BaseDirs::new() {
        let home = base_dirs.home_dir().to_string_lossy();
        return PathBuf::from(text.replacen('~', &home, 1));
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::preference::ExecutionPreference;

    fn service_in(root: &Path) -> ConfigService {
        ConfigService::new(AppDirs::under(root), None).unwrap()
    }

    fn write_config(root: &Path, file: &str, text: &str) {
        let dir = AppDirs::under(root).config_dir;
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), text).unwrap();
    }

    #[test]
    fn loads_builtin_defaults_and_resolves_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_in(tmp.path());
        let config = service.config();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ui.theme, "dark");
        assert!(config.plugins.verify_checksums);
        assert_eq!(config.plugins_dir(), AppDirs::under(tmp.path()).plugins_dir);
        assert!(config.plugin_preferences.is_empty());
    }

    #[test]
    fn layers_merge_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            DEFAULT_FILE,
            "[ui]\ntheme = \"light\"\nlanguage = \"de\"\n",
        );
        write_config(
            tmp.path(),
            USER_FILE,
            "[ui]\ntheme = \"solarized\"\n[logging]\nlevel = \"debug\"\n",
        );

        let service = service_in(tmp.path());
        let config = service.config();
        assert_eq!(config.ui.theme, "solarized");
        assert_eq!(config.ui.language, "de");
        assert!(config.ui.show_welcome_wizard);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.keep_days, 7);
    }

    #[test]
    fn malformed_or_mistyped_user_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), USER_FILE, "[ui\ntheme = ");
        assert_eq!(service_in(tmp.path()).config().ui.theme, "dark");

        write_config(tmp.path(), USER_FILE, "[logging]\nkeep_days = \"forever\"\n");
        assert_eq!(service_in(tmp.path()).config().logging.keep_days, 7);
    }

    #[test]
    fn mistyped_default_file_keeps_user_layer() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), DEFAULT_FILE, "[logging]\nkeep_days = \"forever\"\n");
        write_config(tmp.path(), USER_FILE, "[ui]\ntheme = \"solarized\"\n");

        let service = service_in(tmp.path());
        assert_eq!(service.config().ui.theme, "solarized");
        assert_eq!(service.config().logging.keep_days, 7);
    }

    #[test]
    fn mistyped_user_file_keeps_default_layer() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), DEFAULT_FILE, "[ui]\nlanguage = \"de\"\n");
        write_config(tmp.path(), USER_FILE, "[ui]\nshow_welcome_wizard = \"maybe\"\n");

        let service = service_in(tmp.path());
        assert_eq!(service.config().ui.language, "de");
        assert!(service.config().ui.show_welcome_wizard);
    }

    #[test]
    fn setting_a_default_value_drops_the_override() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service_in(tmp.path());
        service.set("ui.theme", parse_value("light")).unwrap();
        service.set("logging.level", parse_value("debug")).unwrap();
        service.set("ui.theme", parse_value("dark")).unwrap();

        let written: toml::Table =
            toml::from_str(&fs::read_to_string(service.user_path()).unwrap()).unwrap();
        let expected: toml::Table = toml::from_str("[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(written, expected);
        assert_eq!(service.config().ui.theme, "dark");
    }

    #[test]
    fn save_user_writes_only_changed_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service_in(tmp.path());

        let mut config = service.config().clone();
        config.ui.theme = "light".to_string();
        service.save_user(&config).unwrap();

        let written: toml::Table =
            toml::from_str(&fs::read_to_string(service.user_path()).unwrap()).unwrap();
        let expected: toml::Table = toml::from_str("[ui]\ntheme = \"light\"\n").unwrap();
        assert_eq!(written, expected);

        // A later default-file change still reaches fields the user never set.
        write_config(tmp.path(), DEFAULT_FILE, "[ui]\nlanguage = \"fr\"\n");
        service.load().unwrap();
        assert_eq!(service.config().ui.theme, "light");
        assert_eq!(service.config().ui.language, "fr");
    }

    #[test]
    fn set_validates_and_persists_dotted_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service_in(tmp.path());

        service.set("logging.level", parse_value("warn")).unwrap();
        service
            .set("plugins.settings.ffmpeg.threads", parse_value("4"))
            .unwrap();
        assert_eq!(service.config().logging.level, "warn");
        assert_eq!(
            service.config().plugins.settings["ffmpeg"]["threads"],
            toml::Value::Integer(4)
        );

        assert!(service.set("logging.keep_days", parse_value("soon")).is_err());
        assert_eq!(service_in(tmp.path()).config().logging.keep_days, 7);
    }

    #[test]
    fn reset_removes_user_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service_in(tmp.path());
        service.set("ui.theme", parse_value("light")).unwrap();
        assert!(service.user_path().exists());

        let config = service.reset().unwrap();
        assert_eq!(config.ui.theme, "dark");
        assert!(!service.user_path().exists());
    }

    #[test]
    fn export_redacts_sensitive_keys_at_any_depth() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            USER_FILE,
            r#"
[plugins]
github_token = "ghp_live"

[plugins.settings.uploader]
api_key = "abc123"
api_keystone = "over-redacted"
endpoint = "https://upload.example"
accounts = [{ name = "main", password = "hunter2" }]
"#,
        );
        let service = service_in(tmp.path());

        let out = tmp.path().join("export").join("config.toml");
        service.export(&out, true).unwrap();
        let exported: toml::Table = toml::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        let uploader = &exported["plugins"]["settings"]["uploader"];

        assert_eq!(exported["plugins"]["github_token"].as_str(), Some(REDACTED));
        assert_eq!(uploader["api_key"].as_str(), Some(REDACTED));
        assert_eq!(uploader["api_keystone"].as_str(), Some(REDACTED));
        assert_eq!(uploader["endpoint"].as_str(), Some("https://upload.example"));
        assert_eq!(uploader["accounts"][0]["password"].as_str(), Some(REDACTED));
        assert_eq!(uploader["accounts"][0]["name"].as_str(), Some("main"));

        service.export(&out, false).unwrap();
        let raw: toml::Table = toml::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(
            raw["plugins"]["settings"]["uploader"]["api_key"].as_str(),
            Some("abc123")
        );
    }

    #[test]
    fn redaction_matches_keyword_substrings_case_insensitively() {
        assert!(is_sensitive("API_KEY"));
        assert!(is_sensitive("SessionToken"));
        assert!(is_sensitive("keyboard_layout"));
        assert!(!is_sensitive("theme"));
    }

    #[test]
    fn legacy_files_are_copied_once() {
        let tmp = tempfile::tempdir().unwrap();
        let legacy = tmp.path().join("legacy");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join(USER_FILE), "[ui]\ntheme = \"legacy\"\n").unwrap();
        fs::write(legacy.join("notes.txt"), "not config").unwrap();

        let root = tmp.path().join("state");
        let service = ConfigService::new(AppDirs::under(&root), Some(&legacy)).unwrap();
        assert_eq!(service.config().ui.theme, "legacy");
        assert!(legacy.join(USER_FILE).exists());
        assert!(!AppDirs::under(&root).config_dir.join("notes.txt").exists());

        fs::write(legacy.join(USER_FILE), "[ui]\ntheme = \"changed\"\n").unwrap();
        let service = ConfigService::new(AppDirs::under(&root), Some(&legacy)).unwrap();
        assert_eq!(service.config().ui.theme, "legacy");
    }

    #[test]
    fn plugin_preferences_are_attached_and_kept_in_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service_in(tmp.path());
        assert_eq!(service.plugin_preference("git"), PluginPreference::default());

        service
            .set_plugin_preference(
                "git",
                PreferenceUpdate {
                    execution_preference: Some(ExecutionPreference::System),
                    ..PreferenceUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(
            service.plugin_preference("git").execution_preference,
            ExecutionPreference::System
        );

        let reloaded = service_in(tmp.path());
        assert_eq!(
            reloaded.config().plugin_preferences["git"].execution_preference,
            ExecutionPreference::System
        );
        assert!(!fs::read_to_string(reloaded.user_path()).is_ok_and(|t| t.contains("git")));
    }

    #[test]
    fn parse_value_understands_toml_literals() {
        assert_eq!(parse_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_value("12"), toml::Value::Integer(12));
        assert_eq!(parse_value("dark mode"), toml::Value::String("dark mode".into()));
    }
}
