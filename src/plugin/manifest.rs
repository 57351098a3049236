use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::platform::Platform;
use crate::plugin::constraint::VersionConstraint;

pub const MANIFEST_FILE: &str = "plugin.yaml";
pub const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retrieval method for a portable binary. Only direct URLs are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceType,
    #[serde(default)]
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Directory of the executable, relative to the plugin root.
    #[serde(default)]
    pub path: String,
    pub executable: String,
}

impl Command {
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.path).join(&self.executable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
}

impl PlatformConfig {
    /// True when the manifest offers a portable binary for this platform.
    pub fn has_download(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|source| !source.download_url.trim().is_empty())
    }

    pub fn constraint(&self) -> Option<VersionConstraint> {
        self.version_constraint
            .as_deref()
            .and_then(|raw| raw.parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Core,
    Media,
    Metadata,
    Development,
    Utility,
}

impl Category {
    const ALL: [(&'static str, Category); 5] = [
        ("core", Category::Core),
        ("media", Category::Media),
        ("metadata", Category::Metadata),
        ("development", Category::Development),
        ("utility", Category::Utility),
    ];

    fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(key, _)| *key == value)
            .map(|(_, category)| *category)
    }
}

/// A validated schema-v2 plugin descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub schema_version: u64,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub mandatory: bool,
    pub enabled: bool,
    pub prefer_system: bool,
    pub register_to_path: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    pub platforms: BTreeMap<Platform, PlatformConfig>,
}

impl PluginManifest {
    pub fn platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        self.platforms.get(&platform)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Every rule a manifest violated, in document order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid manifest: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

#[cfg(test)]
impl ValidationError {
    pub fn issues_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldIssue> + 'a {
        self.issues.iter().filter(move |issue| issue.field == field)
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.field.contains(needle) || issue.message.contains(needle))
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        source: ValidationError,
    },
}

/// Reads `path` and validates it as a schema-v2 manifest.
pub fn load_manifest(path: &Path) -> Result<PluginManifest, ManifestError> {
    let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: Value = serde_yaml::from_str(&text).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_manifest(&raw).map_err(|source| ManifestError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

/// Immediate plugin subdirectories holding a manifest, sorted by id.
pub fn manifest_paths(plugins_root: &Path) -> Vec<(String, PathBuf)> {
    if !plugins_root.is_dir() {
        tracing::warn!("plugins directory not found: {}", plugins_root.display());
        return Vec::new();
    }

    let mut entries: Vec<(String, PathBuf)> = WalkBuilder::new(plugins_root)
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path == plugins_root || !entry.file_type()?.is_dir() {
                return None;
            }

            let manifest = path.join(MANIFEST_FILE);
            if !manifest.is_file() {
                return None;
            }

            let id = entry.file_name().to_str()?.to_string();
            Some((id, manifest))
        })
        .collect();

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Checks a parsed manifest against every schema rule.
///
/// All fields are checked before deciding, so the error lists every problem
/// at once. Unknown top-level keys are ignored; unknown platform keys are not.
pub fn validate_manifest(raw: &Value) -> Result<PluginManifest, ValidationError> {
    let mut issues = Issues::default();

    let Some(doc) = raw.as_mapping() else {
        issues.push("", "manifest must be a mapping");
        return Err(issues.into_error());
    };

    let schema_version = check_schema_version(doc, &mut issues);
    let name = required_text(doc, "name", "name", &mut issues);
    let version = required_text(doc, "version", "version", &mut issues);
    let description = optional_text(doc, "description", "description", &mut issues);
    let category = check_category(doc, &mut issues);
    let mandatory = bool_field(doc, "mandatory", false, &mut issues);
    let enabled = bool_field(doc, "enabled", true, &mut issues);
    let prefer_system = bool_field(doc, "prefer_system", false, &mut issues);
    let register_to_path = bool_field(doc, "register_to_path", false, &mut issues);
    let dependencies = check_dependencies(doc, &mut issues);
    let platforms = check_platforms(doc, &mut issues);

    if !issues.is_empty() {
        return Err(issues.into_error());
    }

    Ok(PluginManifest {
        schema_version,
        name: name.unwrap_or_default(),
        version: version.unwrap_or_default(),
        description,
        category,
        mandatory,
        enabled,
        prefer_system,
        register_to_path,
        dependencies,
        platforms,
    })
}

#[derive(Debug, Default)]
struct Issues(Vec<FieldIssue>);

impl Issues {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn into_error(self) -> ValidationError {
        ValidationError { issues: self.0 }
    }
}

fn field<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| !value.is_null())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_text(map: &Mapping, key: &str, path: &str, issues: &mut Issues) -> Option<String> {
    let value = field(map, key)?;
    match scalar_text(value) {
        Some(text) if text.trim().is_empty() => None,
        Some(text) => Some(text),
        None => {
            issues.push(path, "must be a string");
            None
        }
    }
}

fn required_text(map: &Mapping, key: &str, path: &str, issues: &mut Issues) -> Option<String> {
    let Some(value) = field(map, key) else {
        issues.push(path, "is required");
        return None;
    };

    match scalar_text(value) {
        Some(text) if text.trim().is_empty() => {
            issues.push(path, "must not be empty");
            None
        }
        Some(text) => Some(text.trim().to_string()),
        None => {
            issues.push(path, "must be a string");
            None
        }
    }
}

fn bool_field(map: &Mapping, key: &str, default: bool, issues: &mut Issues) -> bool {
    match field(map, key) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            issues.push(key, "must be true or false");
            default
        }
    }
}

/// `schema_version` as a number; quoted integers (`"2"`) are accepted too.
pub fn schema_number(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn check_schema_version(doc: &Mapping, issues: &mut Issues) -> u64 {
    match field(doc, "schema_version") {
        None => SCHEMA_VERSION,
        Some(value) if schema_number(value) == Some(SCHEMA_VERSION) => SCHEMA_VERSION,
        Some(value) => {
            let shown = scalar_text(value).unwrap_or_else(|| "?".to_string());
            issues.push(
                "schema_version",
                format!("unsupported schema version {shown} (expected {SCHEMA_VERSION}; migrate v1 manifests first)"),
            );
            SCHEMA_VERSION
        }
    }
}

fn check_category(doc: &Mapping, issues: &mut Issues) -> Option<Category> {
    let text = optional_text(doc, "category", "category", issues)?;
    let category = Category::parse(text.trim());
    if category.is_none() {
        let allowed: Vec<&str> = Category::ALL.iter().map(|(key, _)| *key).collect();
        issues.push(
            "category",
            format!("unknown category '{text}' (expected one of {})", allowed.join(", ")),
        );
    }
    category
}

fn check_dependencies(doc: &Mapping, issues: &mut Issues) -> Vec<String> {
    let Some(value) = field(doc, "dependencies") else {
        return Vec::new();
    };
    let Some(entries) = value.as_sequence() else {
        issues.push("dependencies", "must be a list of plugin names");
        return Vec::new();
    };

    let mut dependencies = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let path = format!("dependencies[{idx}]");
        match scalar_text(entry) {
            Some(name) if !name.trim().is_empty() => dependencies.push(name.trim().to_string()),
            Some(_) | None if entry.is_string() || entry.is_null() => {
                issues.push(path, "dependency name must not be empty")
            }
            _ => issues.push(path, "dependency name must be a string"),
        }
    }
    dependencies
}

fn check_platforms(doc: &Mapping, issues: &mut Issues) -> BTreeMap<Platform, PlatformConfig> {
    let mut platforms = BTreeMap::new();

    let Some(value) = field(doc, "platforms") else {
        issues.push("platforms", "is required");
        return platforms;
    };
    let Some(entries) = value.as_mapping() else {
        issues.push("platforms", "must be a mapping of platform name to configuration");
        return platforms;
    };
    if entries.is_empty() {
        issues.push("platforms", "must define at least one platform");
        return platforms;
    }

    let mut invalid = Vec::new();
    for (key, config) in entries {
        let key_text = scalar_text(key).unwrap_or_else(|| format!("{key:?}"));
        match key_text.parse::<Platform>() {
            Ok(platform) => {
                let path = format!("platforms.{platform}");
                if let Some(parsed) = check_platform_config(config, &path, issues) {
                    platforms.insert(platform, parsed);
                }
            }
            Err(_) => invalid.push(key_text),
        }
    }

    if !invalid.is_empty() {
        let allowed: Vec<&str> = Platform::all().iter().map(Platform::key).collect();
        issues.push(
            "platforms",
            format!(
                "invalid platform keys: {} (expected {})",
                invalid.join(", "),
                allowed.join(", ")
            ),
        );
    }

    platforms
}

fn check_platform_config(value: &Value, path: &str, issues: &mut Issues) -> Option<PlatformConfig> {
    let Some(map) = value.as_mapping() else {
        issues.push(path, "must be a mapping");
        return None;
    };

    let command = check_command(map, path, issues);
    let source = check_source(map, path, issues);
    let system_package = optional_text(map, "system_package", &format!("{path}.system_package"), issues)
        .map(|pkg| pkg.trim().to_string());
    let version_constraint = check_version_constraint(map, path, issues);

    Some(PlatformConfig {
        source: source?,
        command: command?,
        system_package,
        version_constraint,
    })
}

fn check_command(map: &Mapping, path: &str, issues: &mut Issues) -> Option<Command> {
    let command_path = format!("{path}.command");
    let Some(value) = field(map, "command") else {
        issues.push(command_path, "is required");
        return None;
    };
    let Some(command) = value.as_mapping() else {
        issues.push(command_path, "must be a mapping");
        return None;
    };

    let executable = required_text(
        command,
        "executable",
        &format!("{command_path}.executable"),
        issues,
    );
    let dir = optional_text(command, "path", &format!("{command_path}.path"), issues);

    Some(Command {
        path: dir.unwrap_or_default(),
        executable: executable?,
    })
}

/// `Some(None)` means "no source", `None` means the block was invalid.
fn check_source(map: &Mapping, path: &str, issues: &mut Issues) -> Option<Option<Source>> {
    let source_path = format!("{path}.source");
    let Some(value) = field(map, "source") else {
        return Some(None);
    };
    let Some(source) = value.as_mapping() else {
        issues.push(source_path, "must be a mapping");
        return None;
    };

    let before = issues.0.len();

    match field(source, "type").map(scalar_text) {
        None => issues.push(format!("{source_path}.type"), "is required"),
        Some(Some(kind)) if kind == "url" => {}
        Some(Some(kind)) => issues.push(
            format!("{source_path}.type"),
            format!("unsupported source type '{kind}' (only 'url' is supported)"),
        ),
        Some(None) => issues.push(format!("{source_path}.type"), "must be a string"),
    }

    let download_url = optional_text(
        source,
        "download_url",
        &format!("{source_path}.download_url"),
        issues,
    )
    .unwrap_or_default();

    let checksum_sha256 = optional_text(
        source,
        "checksum_sha256",
        &format!("{source_path}.checksum_sha256"),
        issues,
    )
    .map(|sum| sum.trim().to_string());
    if let Some(sum) = checksum_sha256.as_deref() {
        let field_path = format!("{source_path}.checksum_sha256");
        if sum.len() != 64 {
            issues.push(
                field_path.clone(),
                format!("must be 64 characters (got {})", sum.len()),
            );
        }
        if !sum.chars().all(|c| c.is_ascii_hexdigit()) {
            issues.push(field_path, "must contain only hexadecimal characters");
        }
    }

    let file_size = match field(source, "file_size") {
        None => None,
        Some(value) => match value.as_i64() {
            Some(size) if size > 0 => Some(size as u64),
            Some(size) => {
                issues.push(
                    format!("{source_path}.file_size"),
                    format!("must be positive (got {size})"),
                );
                None
            }
            None => {
                issues.push(format!("{source_path}.file_size"), "must be an integer");
                None
            }
        },
    };

    if issues.0.len() > before {
        return None;
    }

    Some(Some(Source {
        kind: SourceType::Url,
        download_url,
        checksum_sha256,
        file_size,
    }))
}

fn check_version_constraint(map: &Mapping, path: &str, issues: &mut Issues) -> Option<String> {
    let field_path = format!("{path}.version_constraint");
    let raw = optional_text(map, "version_constraint", &field_path, issues)?;
    match raw.parse::<VersionConstraint>() {
        Ok(_) => Some(raw.trim().to_string()),
        Err(err) => {
            issues.push(
                field_path,
                format!("invalid version constraint '{raw}': {err}"),
            );
            None
        }
    }
}
