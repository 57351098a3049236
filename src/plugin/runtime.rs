use std::path::{Path, PathBuf};

use crate::model::platform::Platform;
use crate::plugin::manifest::{MANIFEST_FILE, PluginId, PluginManifest, load_manifest};
use crate::plugin::preference::PluginPreference;
use crate::plugin::resolve::{ExecutionPlan, ToolLocator, resolve_execution};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Discovered,
    Disabled,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PluginRuntime {
    pub id: PluginId,
    pub root_dir: PathBuf,
    pub manifest: Option<PluginManifest>,
    pub status: PluginStatus,
}

impl PluginRuntime {
    pub fn discover(id: PluginId, root_dir: PathBuf, preference: &PluginPreference) -> Self {
        match Self::read_manifest(&root_dir) {
            Ok(manifest) => {
                let status = if manifest.enabled && preference.enabled {
                    PluginStatus::Discovered
                } else {
                    PluginStatus::Disabled
                };
                Self {
                    id,
                    root_dir,
                    manifest: Some(manifest),
                    status,
                }
            }
            Err(err) => Self {
                id,
                root_dir,
                manifest: None,
                status: PluginStatus::Error(err),
            },
        }
    }

    pub fn status(&self) -> &PluginStatus {
        &self.status
    }

    pub fn display_name(&self) -> String {
        self.manifest
            .as_ref()
            .map(|manifest| manifest.name.clone())
            .unwrap_or_else(|| self.id.0.clone())
    }

    pub fn execution_plan(
        &self,
        platform: Platform,
        preference: &PluginPreference,
        locator: &dyn ToolLocator,
    ) -> ExecutionPlan {
        match (&self.manifest, &self.status) {
            (Some(manifest), _) => {
                resolve_execution(manifest, &self.root_dir, platform, preference, locator)
            }
            (None, PluginStatus::Error(err)) => ExecutionPlan::Unavailable {
                reason: err.clone(),
            },
            (None, _) => ExecutionPlan::Unavailable {
                reason: "missing plugin manifest".to_string(),
            },
        }
    }

    fn read_manifest(root_dir: &Path) -> Result<PluginManifest, String> {
        load_manifest(&root_dir.join(MANIFEST_FILE)).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn invalid_manifest_becomes_error_status() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(MANIFEST_FILE),
            "name: Broken\nversion: '1'\nplatforms: {}\n",
        )
        .unwrap();

        let runtime = PluginRuntime::discover(
            PluginId::new("broken"),
            tmp.path().to_path_buf(),
            &PluginPreference::default(),
        );
        assert!(matches!(runtime.status(), PluginStatus::Error(err) if err.contains("platforms")));
        assert_eq!(runtime.display_name(), "broken");
    }

    #[test]
    fn user_disabled_plugin_is_marked_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(MANIFEST_FILE),
            "name: Git\nversion: '2.40'\nplatforms:\n  linux:\n    command: { executable: git }\n",
        )
        .unwrap();

        let preference = PluginPreference {
            enabled: false,
            ..PluginPreference::default()
        };
        let runtime = PluginRuntime::discover(PluginId::new("git"), tmp.path().to_path_buf(), &preference);
        assert_eq!(runtime.status(), &PluginStatus::Disabled);
        assert_eq!(runtime.display_name(), "Git");
    }
}
