//! Schema v1 to v2 manifest migration.
//!
//! v1 manifests carry a single flat `source`/`command` pair; v2 nests them per
//! platform. Migration is one-way. Written files keep a `.bak` sibling that
//! [`rollback`] restores.

use serde_yaml::{Mapping, Value};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::platform::Platform;
use crate::plugin::manifest::{
    SCHEMA_VERSION, ValidationError, manifest_paths, schema_number, validate_manifest,
};

/// Tool name to distro package. `None` marks tools with no known package.
const SYSTEM_PACKAGES: &[(&str, Option<&str>)] = &[
    ("git", Some("git")),
    ("ffmpeg", Some("ffmpeg")),
    ("exiftool", Some("exiftool")),
    ("imagemagick", Some("imagemagick")),
    ("mediainfo", Some("mediainfo")),
    ("7-zip", Some("p7zip")),
    ("rclone", Some("rclone")),
    ("yt-dlp", Some("yt-dlp")),
    ("python", Some("python3")),
    ("handbrake", Some("handbrake-cli")),
    ("digikam", None),
    ("xnview mp", None),
    ("irfanview", None),
];

// Top-level v1 keys copied through in this order, ahead of `platforms`.
const LEADING_KEYS: [&str; 6] = [
    "name",
    "version",
    "description",
    "category",
    "mandatory",
    "enabled",
];

// Keys consumed or rewritten by the conversion.
const CONVERTED_KEYS: [&str; 7] = [
    "schema_version",
    "source",
    "command",
    "version_constraint",
    "prefer_system",
    "register_to_path",
    "platforms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to render migrated manifest: {0}")]
    Render(#[source] serde_yaml::Error),
    #[error("unsupported schema_version {0} (expected the integer 1 or 2)")]
    UnsupportedSchema(String),
    #[error("manifest must be a mapping")]
    NotAMapping,
    #[error("v1 manifest has no command block")]
    MissingCommand,
    #[error("migrated manifest is invalid: {0}")]
    Invalid(#[from] ValidationError),
    #[error("no backup found at {}", .0.display())]
    NoBackup(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOptions {
    pub dry_run: bool,
    pub backup: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            backup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    AlreadyCurrent,
    Previewed,
    Migrated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub message: String,
    /// Unified diff of original vs migrated text; empty when nothing changed.
    pub diff: String,
    pub backup: Option<PathBuf>,
}

/// Explicit `schema_version` wins; otherwise everything is treated as v1.
pub fn detect_version(raw: &Value) -> Result<SchemaVersion, MigrationError> {
    let Some(doc) = raw.as_mapping() else {
        return Err(MigrationError::NotAMapping);
    };

    if let Some(value) = doc.get("schema_version").filter(|v| !v.is_null()) {
        return match schema_number(value) {
            Some(1) => Ok(SchemaVersion::V1),
            Some(2) => Ok(SchemaVersion::V2),
            _ => Err(MigrationError::UnsupportedSchema(render_scalar(value))),
        };
    }

    if doc.contains_key("source") && doc.contains_key("command") {
        return Ok(SchemaVersion::V1);
    }

    // Neither marker nor v1 shape: still v1, `convert` refuses it if no
    // `command` block exists.
    Ok(SchemaVersion::V1)
}

/// Looks up the distro package for a tool name, case-insensitively.
pub fn system_package_for(name: &str) -> Option<&'static str> {
    let needle = name.trim().to_lowercase();
    SYSTEM_PACKAGES
        .iter()
        .find(|(tool, _)| *tool == needle)
        .and_then(|(_, package)| *package)
}

/// Fans a v1 document out into the per-platform v2 shape.
///
/// Every result is stamped `schema_version: 2` and `prefer_system: true`.
/// When a system package is known, only Windows keeps its download URL.
pub fn convert(raw: &Value) -> Result<Value, MigrationError> {
    let doc = raw.as_mapping().ok_or(MigrationError::NotAMapping)?;
    let command = doc
        .get("command")
        .and_then(Value::as_mapping)
        .ok_or(MigrationError::MissingCommand)?;
    let source = doc.get("source").and_then(Value::as_mapping);
    let name = doc.get("name").and_then(Value::as_str).unwrap_or_default();
    let system_package = system_package_for(name);
    let version_constraint = doc.get("version_constraint").filter(|v| !v.is_null());

    let mut out = Mapping::new();
    out.insert(key("schema_version"), Value::from(SCHEMA_VERSION));
    for field in LEADING_KEYS {
        if let Some(value) = doc.get(field) {
            out.insert(key(field), value.clone());
        }
    }
    out.insert(key("prefer_system"), Value::Bool(true));
    out.insert(
        key("register_to_path"),
        doc.get("register_to_path")
            .cloned()
            .unwrap_or(Value::Bool(false)),
    );

    let mut platforms = Mapping::new();
    for platform in Platform::all() {
        let block = platform_block(platform, source, command, system_package, version_constraint);
        platforms.insert(key(platform.key()), Value::Mapping(block));
    }

    // Unknown fields ride along untouched, after the known ones.
    for (field, value) in doc {
        let known = field
            .as_str()
            .is_some_and(|f| LEADING_KEYS.contains(&f) || CONVERTED_KEYS.contains(&f));
        if !known {
            out.insert(field.clone(), value.clone());
        }
    }

    out.insert(key("platforms"), Value::Mapping(platforms));
    Ok(Value::Mapping(out))
}

fn platform_block(
    platform: Platform,
    source: Option<&Mapping>,
    command: &Mapping,
    system_package: Option<&str>,
    version_constraint: Option<&Value>,
) -> Mapping {
    let use_system = system_package.is_some() && platform != Platform::Windows;
    let mut block = Mapping::new();

    if let Some(source) = source {
        let url = ["download_url", "base_uri", "url"]
            .iter()
            .find_map(|field| source.get(*field).and_then(Value::as_str))
            .unwrap_or_default();

        let mut out = Mapping::new();
        out.insert(
            key("type"),
            source
                .get("type")
                .cloned()
                .unwrap_or_else(|| Value::from("url")),
        );
        out.insert(
            key("download_url"),
            Value::from(if use_system { "" } else { url }),
        );
        for field in ["checksum_sha256", "file_size"] {
            if let Some(value) = source.get(field) {
                out.insert(key(field), value.clone());
            }
        }
        block.insert(key("source"), Value::Mapping(out));
    }

    let executable = command
        .get("executable")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let executable = match platform {
        Platform::Windows => executable,
        _ => strip_exe_suffix(executable),
    };

    let mut cmd = Mapping::new();
    cmd.insert(
        key("path"),
        command
            .get("path")
            .cloned()
            .unwrap_or_else(|| Value::from("")),
    );
    cmd.insert(key("executable"), Value::from(executable));
    block.insert(key("command"), Value::Mapping(cmd));

    if let Some(package) = system_package.filter(|_| use_system) {
        block.insert(key("system_package"), Value::from(package));
    }
    if let Some(constraint) = version_constraint {
        block.insert(key("version_constraint"), constraint.clone());
    }

    block
}

fn strip_exe_suffix(executable: &str) -> &str {
    let stem_len = executable.len().saturating_sub(4);
    match executable.get(stem_len..) {
        Some(suffix) if stem_len > 0 && suffix.eq_ignore_ascii_case(".exe") => {
            &executable[..stem_len]
        }
        _ => executable,
    }
}

/// Migrates one manifest file in place (or previews it with `dry_run`).
pub fn migrate(path: &Path, options: MigrateOptions) -> Result<MigrationReport, MigrationError> {
    let original = fs::read_to_string(path).map_err(|source| MigrationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: Value = serde_yaml::from_str(&original).map_err(|source| MigrationError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if detect_version(&raw)? == SchemaVersion::V2 {
        return Ok(MigrationReport {
            status: MigrationStatus::AlreadyCurrent,
            message: format!("{} is already schema v2", path.display()),
            diff: String::new(),
            backup: None,
        });
    }

    let converted = convert(&raw)?;
    validate_manifest(&converted)?;
    let rendered = serde_yaml::to_string(&converted).map_err(MigrationError::Render)?;
    let diff = unified_diff(path, &original, &rendered);

    if options.dry_run {
        return Ok(MigrationReport {
            status: MigrationStatus::Previewed,
            message: format!("{} would be migrated to schema v2", path.display()),
            diff,
            backup: None,
        });
    }

    let backup = if options.backup {
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|source| MigrationError::Write {
            path: backup.clone(),
            source,
        })?;
        Some(backup)
    } else {
        None
    };

    fs::write(path, &rendered).map_err(|source| MigrationError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("migrated {} to schema v2", path.display());

    Ok(MigrationReport {
        status: MigrationStatus::Migrated,
        message: format!("migrated {} to schema v2", path.display()),
        diff,
        backup,
    })
}

/// Restores `path` from its `.bak` sibling and removes the backup.
pub fn rollback(path: &Path) -> Result<(), MigrationError> {
    let backup = backup_path(path);
    if !backup.is_file() {
        return Err(MigrationError::NoBackup(backup));
    }

    fs::copy(&backup, path).map_err(|source| MigrationError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    fs::remove_file(&backup).map_err(|source| MigrationError::Write {
        path: backup.clone(),
        source,
    })?;

    tracing::info!("restored {} from backup", path.display());
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

pub fn migrate_all(
    plugins_root: &Path,
    options: MigrateOptions,
) -> BTreeMap<String, Result<MigrationReport, MigrationError>> {
    manifest_paths(plugins_root)
        .into_iter()
        .map(|(id, manifest)| {
            let result = migrate(&manifest, options);
            if let Err(err) = &result {
                tracing::warn!("plugin {id}: migration failed: {err}");
            }
            (id, result)
        })
        .collect()
}

pub fn rollback_all(plugins_root: &Path) -> BTreeMap<String, Result<(), MigrationError>> {
    manifest_paths(plugins_root)
        .into_iter()
        .map(|(id, manifest)| {
            let result = rollback(&manifest);
            if let Err(err) = &result {
                tracing::warn!("plugin {id}: rollback failed: {err}");
            }
            (id, result)
        })
        .collect()
}

fn unified_diff(path: &Path, before: &str, after: &str) -> String {
    let name = path.display().to_string();
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(&format!("{name} (v1)"), &format!("{name} (v2)"))
        .to_string()
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}
