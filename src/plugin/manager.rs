use std::collections::BTreeMap;
use std::path::Path;

use crate::plugin::manifest::{PluginId, manifest_paths};
use crate::plugin::preference::PluginPreference;
use crate::plugin::runtime::{PluginRuntime, PluginStatus};

#[derive(Debug, Default)]
pub struct PluginManager {
    runtimes: BTreeMap<PluginId, PluginRuntime>,
}

impl PluginManager {
    /// Loads every plugin under `plugins_dir`. A bad manifest only affects
    /// its own plugin.
    pub fn discover(plugins_dir: &Path, preferences: &BTreeMap<String, PluginPreference>) -> Self {
        let mut manager = Self::default();

        for (id, manifest_path) in manifest_paths(plugins_dir) {
            let Some(root_dir) = manifest_path.parent().map(Path::to_path_buf) else {
                continue;
            };
            let preference = preferences.get(&id).cloned().unwrap_or_default();
            let plugin_id = PluginId::new(id);
            manager.runtimes.insert(
                plugin_id.clone(),
                PluginRuntime::discover(plugin_id, root_dir, &preference),
            );
        }

        for line in manager.error_notifications() {
            tracing::warn!("{line}");
        }
        tracing::info!("{}", manager.summary_notification());
        manager
    }

    pub fn get(&self, id: &str) -> Option<&PluginRuntime> {
        self.runtimes.get(&PluginId::new(id))
    }

    pub fn plugin_count(&self) -> usize {
        self.runtimes.len()
    }

    pub fn error_count(&self) -> usize {
        self.runtimes
            .values()
            .filter(|runtime| matches!(runtime.status(), PluginStatus::Error(_)))
            .count()
    }

    pub fn summary_notification(&self) -> String {
        let discovered = self.plugin_count().saturating_sub(self.error_count());
        format!(
            "plugins: {discovered} discovered, {} errors",
            self.error_count()
        )
    }

    pub fn error_notifications(&self) -> Vec<String> {
        self.runtimes
            .values()
            .filter_map(|runtime| {
                if let PluginStatus::Error(err) = runtime.status() {
                    Some(format!("plugin {}: {err}", runtime.id))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn list_notifications(&self) -> Vec<String> {
        if self.runtimes.is_empty() {
            return vec!["plugins: none installed".to_string()];
        }

        self.runtimes
            .values()
            .map(|runtime| {
                let status = match runtime.status() {
                    PluginStatus::Discovered => "discovered".to_string(),
                    PluginStatus::Disabled => "disabled".to_string(),
                    PluginStatus::Error(err) => format!("error: {err}"),
                };
                let version = runtime
                    .manifest
                    .as_ref()
                    .map(|manifest| format!(" {}", manifest.version))
                    .unwrap_or_default();

                format!(
                    "{} ({}{version}) [{status}]",
                    runtime.id,
                    runtime.display_name()
                )
            })
            .collect()
    }

    /// Dependencies naming neither a plugin id nor a plugin name.
    pub fn dependency_notifications(&self) -> Vec<String> {
        let known: Vec<String> = self
            .runtimes
            .values()
            .flat_map(|runtime| {
                let name = runtime.manifest.as_ref().map(|m| m.name.to_lowercase());
                std::iter::once(runtime.id.0.to_lowercase()).chain(name)
            })
            .collect();

        let known = &known;
        self.runtimes
            .values()
            .filter_map(|runtime| runtime.manifest.as_ref().map(|m| (runtime, m)))
            .flat_map(move |(runtime, manifest)| {
                manifest
                    .dependencies
                    .iter()
                    .filter(move |dep| !known.contains(&dep.to_lowercase()))
                    .map(move |dep| format!("plugin {}: missing dependency '{dep}'", runtime.id))
            })
            .collect()
    }
}
