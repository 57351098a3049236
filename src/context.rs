use anyhow::{Context, Result};
use std::path::Path;

use crate::model::config::ConfigService;
use crate::model::platform::{AppDirs, Platform, executable_dir, legacy_config_dir};
use crate::model::portable::{PortableConfig, PortableResolver, SysinfoProbe};

/// Everything a command needs, resolved once per process.
#[derive(Debug)]
pub struct AppContext {
    pub platform: Platform,
    pub portable: PortableConfig,
    pub dirs: AppDirs,
    pub config: ConfigService,
}

impl AppContext {
    /// `portable_flag` is `Some(true)` for `--portable`, `Some(false)` for
    /// `--installed`.
    pub fn from_env(portable_flag: Option<bool>) -> Result<Self> {
        let probe = SysinfoProbe;
        let portable = PortableResolver::from_env().resolve(portable_flag, Some(&probe));
        let exe_dir = executable_dir()?;
        let dirs = AppDirs::for_mode(&portable, &exe_dir)?;

        let legacy = if portable.enabled {
            None
        } else {
            legacy_config_dir()
        };
        Self::build(portable, dirs, legacy.as_deref())
    }

    pub fn build(
        portable: PortableConfig,
        dirs: AppDirs,
        legacy_dir: Option<&Path>,
    ) -> Result<Self> {
        dirs.ensure()
            .with_context(|| format!("creating {}", dirs.data_dir.display()))?;
        let config = ConfigService::new(dirs.clone(), legacy_dir)?;

        Ok(Self {
            platform: Platform::current(),
            portable,
            dirs,
            config,
        })
    }
}
