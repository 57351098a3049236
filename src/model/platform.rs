use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::model::portable::PortableConfig;

pub const APP_NAME: &str = "mediaport";

/// Operating systems a plugin can target.
///
/// Ordering follows the manifest convention (windows, linux, macos), so maps
/// keyed by `Platform` render in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    pub fn all() -> [Platform; 3] {
        [Platform::Windows, Platform::Linux, Platform::MacOs]
    }

    /// Key used for this platform inside a manifest's `platforms` mapping.
    pub fn key(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::all()
            .into_iter()
            .find(|platform| platform.key() == s)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Resolved on-disk locations for application state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub plugins_dir: PathBuf,
}

impl AppDirs {
    /// OS-standard locations (XDG on Linux, AppData on Windows,
    /// Application Support on macOS).
    pub fn installed() -> Result<Self> {
        let proj_dirs = directories::ProjectDirs::from("", "", APP_NAME)
            .ok_or_else(|| anyhow!("cannot determine home directory"))?;
        let data_dir = proj_dirs.data_dir().to_path_buf();

        Ok(Self {
            config_dir: proj_dirs.config_dir().to_path_buf(),
            cache_dir: proj_dirs.cache_dir().to_path_buf(),
            log_dir: data_dir.join("logs"),
            plugins_dir: data_dir.join("plugins"),
            data_dir,
        })
    }

    /// Portable layout: everything under `<exe_dir>/data`.
    pub fn portable(exe_dir: &Path) -> Self {
        Self::under(exe_dir.join("data"))
    }

    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            log_dir: root.join("logs"),
            plugins_dir: root.join("plugins"),
            data_dir: root,
        }
    }

    pub fn for_mode(portable: &PortableConfig, exe_dir: &Path) -> Result<Self> {
        if portable.enabled {
            Ok(Self::portable(exe_dir))
        } else {
            Self::installed()
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.cache_dir,
            &self.log_dir,
            &self.plugins_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Directory used by releases that predate platform-specific locations.
pub fn legacy_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(format!(".{APP_NAME}")))
}

pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable has no parent directory: {}", exe.display()))
}
