use semver::Version;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::model::platform::Platform;
use crate::plugin::manifest::PluginManifest;
use crate::plugin::preference::{ExecutionPreference, PluginPreference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemTool {
    pub path: PathBuf,
    /// Reported version, when the locator knows it.
    pub version: Option<Version>,
}

/// Finds system-installed executables.
pub trait ToolLocator {
    fn locate(&self, executable: &str) -> Option<SystemTool>;
}

/// Looks executables up in the directories of `PATH` and asks each match for
/// its `--version`.
#[derive(Debug, Clone, Default)]
pub struct PathLocator {
    dirs: Vec<PathBuf>,
}

impl PathLocator {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn from_env() -> Self {
        let dirs = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();
        Self::new(dirs)
    }
}

impl ToolLocator for PathLocator {
    fn locate(&self, executable: &str) -> Option<SystemTool> {
        let mut names = vec![executable.to_string()];
        if cfg!(windows) && Path::new(executable).extension().is_none() {
            names.push(format!("{executable}.exe"));
        }

        let names = &names;
        self.dirs
            .iter()
            .flat_map(move |dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
            .map(|path| {
                let version = read_version(&path);
                SystemTool { path, version }
            })
    }
}

fn read_version(executable: &Path) -> Option<Version> {
    let output = Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|err| tracing::debug!("cannot run {} --version: {err}", executable.display()))
        .ok()?;

    let text = if output.stdout.is_empty() {
        &output.stderr
    } else {
        &output.stdout
    };
    parse_version_output(&String::from_utf8_lossy(text))
}

/// First dotted number in `--version` output (`git version 2.43.0`,
/// `ffmpeg version n6.1`, `12.76`), padded to three segments.
pub fn parse_version_output(text: &str) -> Option<Version> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | ':'))
        .find_map(version_token)
}

fn version_token(token: &str) -> Option<Version> {
    let token = token
        .strip_prefix(['v', 'V', 'n'])
        .unwrap_or(token);
    let end = token
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(token.len());
    let release = &token[..end];
    if !release.starts_with(|c: char| c.is_ascii_digit()) || !release.contains('.') {
        return None;
    }

    let mut parts = release
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPlan {
    System { executable: PathBuf },
    Portable { executable: PathBuf },
    Unavailable { reason: String },
}

impl ExecutionPlan {
    fn unavailable(reason: impl Into<String>) -> Self {
        ExecutionPlan::Unavailable {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
impl ExecutionPlan {
    pub fn executable(&self) -> Option<&Path> {
        match self {
            ExecutionPlan::System { executable } | ExecutionPlan::Portable { executable } => {
                Some(executable)
            }
            ExecutionPlan::Unavailable { .. } => None,
        }
    }
}

/// Picks the binary to run for a plugin on `platform`.
///
/// `system` and `portable` preferences are strict. `auto` tries the
/// manifest's preferred kind first and falls back to the other one.
pub fn resolve_execution(
    manifest: &PluginManifest,
    plugin_root: &Path,
    platform: Platform,
    preference: &PluginPreference,
    locator: &dyn ToolLocator,
) -> ExecutionPlan {
    if !manifest.enabled || !preference.enabled {
        return ExecutionPlan::unavailable(format!("{} is disabled", manifest.name));
    }

    let Some(config) = manifest.platform(platform) else {
        return ExecutionPlan::unavailable(format!(
            "{} has no configuration for {platform}",
            manifest.name
        ));
    };

    let executable = &config.command.executable;
    let located = locator.locate(executable);
    // A tool whose version cannot be read never satisfies a constraint.
    let mismatch = match (&located, config.constraint()) {
        (Some(tool), Some(constraint)) => match &tool.version {
            Some(version) if constraint.matches(version) => None,
            Some(version) => Some(format!(
                "system {executable} {version} does not satisfy {constraint}"
            )),
            None => Some(format!(
                "cannot determine the version of system {executable} (requires {constraint})"
            )),
        },
        _ => None,
    };
    if let Some(reason) = &mismatch {
        tracing::debug!("{reason}");
    }
    let system = located
        .filter(|_| mismatch.is_none())
        .map(|tool| ExecutionPlan::System {
            executable: tool.path,
        });

    let bundled = plugin_root.join(config.command.relative_path());
    let portable = bundled
        .is_file()
        .then(|| ExecutionPlan::Portable {
            executable: bundled.clone(),
        });

    let missing_system = || {
        if let Some(reason) = &mismatch {
            return ExecutionPlan::unavailable(reason.clone());
        }
        ExecutionPlan::unavailable(format!(
            "{executable} not found on PATH{}",
            config
                .system_package
                .as_deref()
                .map(|pkg| format!(" (install package '{pkg}')"))
                .unwrap_or_default()
        ))
    };
    let missing_portable = || {
        if config.has_download() {
            ExecutionPlan::unavailable(format!(
                "portable binary not downloaded: {}",
                bundled.display()
            ))
        } else {
            ExecutionPlan::unavailable(format!("no portable binary for {platform}"))
        }
    };

    match preference.execution_preference {
        ExecutionPreference::System => system.unwrap_or_else(missing_system),
        ExecutionPreference::Portable => portable.unwrap_or_else(missing_portable),
        ExecutionPreference::Auto if manifest.prefer_system => system
            .or(portable)
            .unwrap_or_else(missing_system),
        ExecutionPreference::Auto => portable.or(system).unwrap_or_else(missing_portable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::validate_manifest;
    use std::collections::HashMap;
    use std::fs;

    #[derive(Default)]
    struct FakeLocator(HashMap<String, SystemTool>);

    impl FakeLocator {
        fn with(executable: &str, version: Option<&str>) -> Self {
            let tool = SystemTool {
                path: PathBuf::from("/usr/bin").join(executable),
                version: version.map(|v| Version::parse(v).unwrap()),
            };
            Self(HashMap::from([(executable.to_string(), tool)]))
        }
    }

    impl ToolLocator for FakeLocator {
        fn locate(&self, executable: &str) -> Option<SystemTool> {
            self.0.get(executable).cloned()
        }
    }

    fn manifest(prefer_system: bool) -> PluginManifest {
        let raw = format!(
            r#"
name: FFmpeg
version: "6.1"
prefer_system: {prefer_system}
platforms:
  linux:
    source:
      type: url
      download_url: https://example.com/ffmpeg.tar.xz
    command:
      path: bin
      executable: ffmpeg
    system_package: ffmpeg
    version_constraint: ">=5"
"#
        );
        validate_manifest(&serde_yaml::from_str(&raw).unwrap()).unwrap()
    }

    fn with_preference(mode: ExecutionPreference) -> PluginPreference {
        PluginPreference {
            execution_preference: mode,
            ..PluginPreference::default()
        }
    }

    fn install_portable(root: &Path) -> PathBuf {
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let exe = bin.join("ffmpeg");
        fs::write(&exe, b"").unwrap();
        exe
    }

    #[test]
    fn auto_follows_manifest_preference() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = install_portable(tmp.path());
        let locator = FakeLocator::with("ffmpeg", Some("6.1.0"));
        let auto = with_preference(ExecutionPreference::Auto);

        let plan = resolve_execution(&manifest(true), tmp.path(), Platform::Linux, &auto, &locator);
        assert_eq!(
            plan,
            ExecutionPlan::System {
                executable: PathBuf::from("/usr/bin/ffmpeg")
            }
        );

        let plan = resolve_execution(&manifest(false), tmp.path(), Platform::Linux, &auto, &locator);
        assert_eq!(plan, ExecutionPlan::Portable { executable: exe });
    }

    #[test]
    fn auto_falls_back_to_whatever_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = install_portable(tmp.path());
        let auto = with_preference(ExecutionPreference::Auto);

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &auto,
            &FakeLocator::default(),
        );
        assert_eq!(plan.executable(), Some(exe.as_path()));
    }

    #[test]
    fn strict_preferences_do_not_fall_back() {
        let tmp = tempfile::tempdir().unwrap();
        let locator = FakeLocator::with("ffmpeg", None);

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::Portable),
            &locator,
        );
        assert!(matches!(
            plan,
            ExecutionPlan::Unavailable { reason } if reason.contains("not downloaded")
        ));

        install_portable(tmp.path());
        let plan = resolve_execution(
            &manifest(false),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::System),
            &FakeLocator::default(),
        );
        assert!(matches!(
            plan,
            ExecutionPlan::Unavailable { reason } if reason.contains("install package 'ffmpeg'")
        ));
    }

    #[test]
    fn system_tool_outside_constraint_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = install_portable(tmp.path());
        let locator = FakeLocator::with("ffmpeg", Some("4.4.2"));

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::Auto),
            &locator,
        );
        assert_eq!(plan, ExecutionPlan::Portable { executable: exe });
    }

    #[test]
    fn unknown_system_version_fails_a_constraint() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = install_portable(tmp.path());
        let locator = FakeLocator::with("ffmpeg", None);

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::Auto),
            &locator,
        );
        assert_eq!(plan, ExecutionPlan::Portable { executable: exe });

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::System),
            &locator,
        );
        assert!(matches!(
            plan,
            ExecutionPlan::Unavailable { reason } if reason.contains("cannot determine the version")
        ));
    }

    #[test]
    fn parses_common_version_banners() {
        assert_eq!(
            parse_version_output("git version 2.43.0.windows.1\n"),
            Some(Version::new(2, 43, 0))
        );
        assert_eq!(
            parse_version_output("ffmpeg version n6.1 Copyright (c) 2000-2023"),
            Some(Version::new(6, 1, 0))
        );
        assert_eq!(parse_version_output("12.76\n"), Some(Version::new(12, 76, 0)));
        assert_eq!(
            parse_version_output("Python 3.12.1"),
            Some(Version::new(3, 12, 1))
        );
        assert_eq!(parse_version_output("usage: tool [options]"), None);
    }

    #[cfg(unix)]
    #[test]
    fn path_locator_reads_version_from_the_tool() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let sys = tmp.path().join("sys");
        fs::create_dir_all(&sys).unwrap();
        let tool = sys.join("ffmpeg");
        fs::write(
            &tool,
            "#!/bin/sh\necho 'ffmpeg version 4.4.2-0ubuntu1 Copyright (c) 2000-2021'\n",
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let locator = PathLocator::new(vec![sys]);
        assert_eq!(
            locator.locate("ffmpeg").and_then(|tool| tool.version),
            Some(Version::new(4, 4, 2))
        );

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Linux,
            &with_preference(ExecutionPreference::System),
            &locator,
        );
        assert!(matches!(
            plan,
            ExecutionPlan::Unavailable { reason } if reason.contains("4.4.2 does not satisfy >=5")
        ));
    }

    #[test]
    fn disabled_or_unsupported_plugins_are_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let locator = FakeLocator::with("ffmpeg", None);
        let disabled = PluginPreference {
            enabled: false,
            ..PluginPreference::default()
        };

        let plan = resolve_execution(&manifest(true), tmp.path(), Platform::Linux, &disabled, &locator);
        assert!(plan.executable().is_none());

        let plan = resolve_execution(
            &manifest(true),
            tmp.path(),
            Platform::Windows,
            &PluginPreference::default(),
            &locator,
        );
        assert!(matches!(
            plan,
            ExecutionPlan::Unavailable { reason } if reason.contains("windows")
        ));
    }

    #[test]
    fn path_locator_scans_directories_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("exiftool"), b"").unwrap();

        let locator = PathLocator::new(vec![first, second.clone()]);
        assert_eq!(
            locator.locate("exiftool").map(|tool| tool.path),
            Some(second.join("exiftool"))
        );
        assert!(locator.locate("git").is_none());
    }
}
