use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

pub const PORTABLE_ENV_VAR: &str = "MEDIAPORT_PORTABLE";

const FALSY_VALUES: [&str; 4] = ["0", "false", "off", "no"];

/// Which rule decided the portable-mode setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortableSource {
    Cli,
    Env,
    Auto,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortableConfig {
    pub enabled: bool,
    pub source: PortableSource,
    pub auto_detected_removable: bool,
}

impl PortableConfig {
    fn new(enabled: bool, source: PortableSource) -> Self {
        Self {
            enabled,
            source,
            auto_detected_removable: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no mounted disk contains {}", .0.display())]
    NoDisk(PathBuf),
    #[error("storage probe unavailable: {0}")]
    Unavailable(String),
}

/// Answers whether a path lives on removable media.
pub trait StorageProbe {
    fn is_removable(&self, path: &Path) -> Result<bool, ProbeError>;
}

/// Probe backed by the OS disk list.
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl StorageProbe for SysinfoProbe {
    fn is_removable(&self, path: &Path) -> Result<bool, ProbeError> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        if disks.list().is_empty() {
            return Err(ProbeError::Unavailable("no disks reported".to_string()));
        }

        // The deepest mount point containing the path owns it.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.is_removable())
            .ok_or_else(|| ProbeError::NoDisk(path.to_path_buf()))
    }
}

/// Decides portable vs installed mode.
///
/// Rules are checked in order and the first match wins: CLI flag, the
/// `MEDIAPORT_PORTABLE` environment variable, removable-media detection, and
/// finally the default, which is portable.
#[derive(Debug, Clone)]
pub struct PortableResolver {
    env_value: Option<String>,
    executable: PathBuf,
}

impl PortableResolver {
    pub fn new(env_value: Option<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            env_value,
            executable: executable.into(),
        }
    }

    /// Reads the environment variable and the current executable path once.
    pub fn from_env() -> Self {
        let env_value = env::var_os(PORTABLE_ENV_VAR).map(|v| v.to_string_lossy().into_owned());
        let executable = env::current_exe().unwrap_or_default();
        Self::new(env_value, executable)
    }

    pub fn resolve(
        &self,
        cli_flag: Option<bool>,
        probe: Option<&dyn StorageProbe>,
    ) -> PortableConfig {
        if let Some(enabled) = cli_flag {
            return PortableConfig::new(enabled, PortableSource::Cli);
        }

        if let Some(value) = self.env_value.as_deref() {
            return PortableConfig::new(env_value_enables(value), PortableSource::Env);
        }

        let Some(probe) = probe else {
            return PortableConfig::new(true, PortableSource::Default);
        };

        match probe.is_removable(&self.executable) {
            Ok(true) => PortableConfig {
                enabled: true,
                source: PortableSource::Auto,
                auto_detected_removable: true,
            },
            Ok(false) => PortableConfig::new(true, PortableSource::Default),
            Err(err) => {
                tracing::debug!(
                    "removable-media probe failed for {}: {err}",
                    self.executable.display()
                );
                PortableConfig::new(true, PortableSource::Default)
            }
        }
    }
}

fn env_value_enables(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    !FALSY_VALUES.contains(&normalized.as_str())
}
