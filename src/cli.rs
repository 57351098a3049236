use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::AppContext;
use crate::model::config::{parse_value, redact_sensitive};
use crate::model::portable::PortableSource;
use crate::plugin::PluginManager;
use crate::plugin::installer::PluginInstaller;
use crate::plugin::manifest::validate_manifest;
use crate::plugin::migrate::{self, MigrateOptions, MigrationError, MigrationReport};
use crate::plugin::preference::{ExecutionPreference, PluginPreference, PreferenceUpdate};
use crate::plugin::resolve::{ExecutionPlan, PathLocator};

#[derive(Debug, Parser)]
#[command(name = "mediaport", version, about = "Portable media tool and plugin manager")]
pub struct Cli {
    /// Keep all state next to the executable
    #[arg(long, global = true, conflicts_with = "installed")]
    pub portable: bool,

    /// Use the OS-standard per-user directories
    #[arg(long, global = true)]
    pub installed: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn portable_flag(&self) -> Option<bool> {
        match (self.portable, self.installed) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate, migrate and roll back plugin manifests
    Manifest {
        #[command(subcommand)]
        action: ManifestCommand,
    },
    /// Inspect and edit the application configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Per-plugin user preferences
    Pref {
        #[command(subcommand)]
        action: PrefCommand,
    },
    /// Installed plugins
    Plugins {
        #[command(subcommand)]
        action: PluginsCommand,
    },
    /// Show how portable mode was decided and where state lives
    Portable,
}

#[derive(Debug, Subcommand)]
pub enum ManifestCommand {
    Validate {
        path: PathBuf,
    },
    Migrate {
        #[arg(required_unless_present = "all")]
        path: Option<PathBuf>,
        /// Migrate every plugin under ROOT (defaults to the plugins directory)
        #[arg(long, value_name = "ROOT", num_args = 0..=1, conflicts_with = "path")]
        all: Option<Option<PathBuf>>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_backup: bool,
    },
    Rollback {
        #[arg(required_unless_present = "all")]
        path: Option<PathBuf>,
        #[arg(long, value_name = "ROOT", num_args = 0..=1, conflicts_with = "path")]
        all: Option<Option<PathBuf>>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets redacted
    Show,
    Export {
        path: PathBuf,
        #[arg(long)]
        no_redact: bool,
    },
    /// Remove user overrides
    Reset,
    /// Set a dotted key, e.g. `ui.theme light`
    Set { key: String, value: String },
}

#[derive(Debug, Subcommand)]
pub enum PrefCommand {
    Get {
        id: String,
    },
    Set {
        id: String,
        /// auto, system or portable
        #[arg(long)]
        mode: Option<ExecutionPreference>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PluginsCommand {
    List,
    /// Show which binary would run for a plugin
    Resolve { id: String },
    /// Check a downloaded file against the plugin's manifest
    Verify { id: String, file: PathBuf },
}

pub fn run(command: Commands, ctx: &mut AppContext) -> Result<()> {
    match command {
        Commands::Manifest { action } => run_manifest(action, ctx),
        Commands::Config { action } => run_config(action, ctx),
        Commands::Pref { action } => run_pref(action, ctx),
        Commands::Plugins { action } => run_plugins(action, ctx),
        Commands::Portable => {
            print_portable(ctx);
            Ok(())
        }
    }
}

fn run_manifest(action: ManifestCommand, ctx: &AppContext) -> Result<()> {
    match action {
        ManifestCommand::Validate { path } => validate(&path),
        ManifestCommand::Migrate {
            path,
            all,
            dry_run,
            no_backup,
        } => {
            let options = MigrateOptions {
                dry_run,
                backup: !no_backup,
            };
            match (path, all) {
                (Some(path), _) => {
                    print_report(&migrate::migrate(&path, options)?);
                    Ok(())
                }
                (None, all) => {
                    let root = batch_root(all.flatten(), ctx);
                    let results = migrate::migrate_all(&root, options);
                    for (id, result) in &results {
                        match result {
                            Ok(report) => {
                                println!("{id}: {}", report.message);
                                if !report.diff.is_empty() {
                                    print!("{}", report.diff);
                                }
                            }
                            Err(err) => println!("{id}: error: {err}"),
                        }
                    }
                    finish_batch("migrated", &results)
                }
            }
        }
        ManifestCommand::Rollback { path, all } => match (path, all) {
            (Some(path), _) => {
                migrate::rollback(&path)?;
                println!("restored {}", path.display());
                Ok(())
            }
            (None, all) => {
                let root = batch_root(all.flatten(), ctx);
                let results = migrate::rollback_all(&root);
                for (id, result) in &results {
                    match result {
                        Ok(()) => println!("{id}: restored"),
                        Err(err) => println!("{id}: error: {err}"),
                    }
                }
                finish_batch("restored", &results)
            }
        },
    }
}

fn validate(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    match validate_manifest(&raw) {
        Ok(manifest) => {
            let platforms: Vec<&str> = manifest.platforms.keys().map(|p| p.key()).collect();
            println!(
                "{}: valid ({} {}, platforms: {})",
                path.display(),
                manifest.name,
                manifest.version,
                platforms.join(", ")
            );
            Ok(())
        }
        Err(err) => {
            for issue in &err.issues {
                println!("  {issue}");
            }
            bail!("{}: {} problem(s)", path.display(), err.issues.len())
        }
    }
}

fn batch_root(root: Option<PathBuf>, ctx: &AppContext) -> PathBuf {
    root.unwrap_or_else(|| ctx.config.config().plugins_dir())
}

fn print_report(report: &MigrationReport) {
    println!("{}", report.message);
    if !report.diff.is_empty() {
        print!("{}", report.diff);
    }
    if let Some(backup) = &report.backup {
        println!("backup: {}", backup.display());
    }
}

fn finish_batch<T>(verb: &str, results: &BTreeMap<String, Result<T, MigrationError>>) -> Result<()> {
    let failed = results.values().filter(|result| result.is_err()).count();
    println!("{} {verb}, {failed} failed", results.len() - failed);
    if failed > 0 {
        bail!("{failed} plugin(s) failed");
    }
    Ok(())
}

fn run_config(action: ConfigCommand, ctx: &mut AppContext) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            let mut value = toml::Value::try_from(ctx.config.config())?;
            redact_sensitive(&mut value);
            print!("{}", toml::to_string_pretty(&value)?);
        }
        ConfigCommand::Export { path, no_redact } => {
            ctx.config.export(&path, !no_redact)?;
            println!("exported to {}", path.display());
        }
        ConfigCommand::Reset => {
            ctx.config.reset()?;
            println!("user configuration reset to defaults");
        }
        ConfigCommand::Set { key, value } => {
            ctx.config.set(&key, parse_value(&value))?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn run_pref(action: PrefCommand, ctx: &mut AppContext) -> Result<()> {
    match action {
        PrefCommand::Get { id } => {
            print_preference(&id, &ctx.config.plugin_preference(&id));
        }
        PrefCommand::Set {
            id,
            mode,
            enabled,
            notes,
        } => {
            let update = PreferenceUpdate {
                execution_preference: mode,
                enabled,
                notes,
            };
            if update.is_empty() {
                bail!("nothing to change; pass --mode, --enabled or --notes");
            }
            let preference = ctx.config.set_plugin_preference(&id, update)?;
            print_preference(&id, &preference);
        }
    }
    Ok(())
}

fn print_preference(id: &str, preference: &PluginPreference) {
    println!(
        "{id}: mode={} enabled={}",
        preference.execution_preference, preference.enabled
    );
    if !preference.notes.is_empty() {
        println!("  notes: {}", preference.notes);
    }
}

fn run_plugins(action: PluginsCommand, ctx: &AppContext) -> Result<()> {
    let config = ctx.config.config();
    let manager = PluginManager::discover(&config.plugins_dir(), &config.plugin_preferences);

    match action {
        PluginsCommand::List => {
            for line in manager
                .list_notifications()
                .into_iter()
                .chain(manager.dependency_notifications())
            {
                println!("{line}");
            }
            println!("{}", manager.summary_notification());
        }
        PluginsCommand::Resolve { id } => {
            let runtime = manager
                .get(&id)
                .ok_or_else(|| anyhow!("plugin '{id}' is not installed"))?;
            let preference = ctx.config.plugin_preference(&id);
            match runtime.execution_plan(ctx.platform, &preference, &PathLocator::from_env()) {
                ExecutionPlan::System { executable } => {
                    println!("{id}: system {}", executable.display())
                }
                ExecutionPlan::Portable { executable } => {
                    println!("{id}: portable {}", executable.display())
                }
                ExecutionPlan::Unavailable { reason } => bail!("{id}: unavailable: {reason}"),
            }
        }
        PluginsCommand::Verify { id, file } => {
            let manifest = manager
                .get(&id)
                .and_then(|runtime| runtime.manifest.as_ref())
                .ok_or_else(|| anyhow!("plugin '{id}' has no valid manifest"))?;
            let source = manifest
                .platform(ctx.platform)
                .and_then(|platform| platform.source.as_ref())
                .ok_or_else(|| anyhow!("plugin '{id}' has no download for {}", ctx.platform))?;

            let verified = PluginInstaller::new(config.plugins.verify_checksums)
                .verify(&file, source)
                .with_context(|| format!("verifying {}", file.display()))?;
            println!(
                "{}: ok ({} bytes, sha256 {})",
                file.display(),
                verified.size,
                verified.sha256
            );
        }
    }
    Ok(())
}

fn print_portable(ctx: &AppContext) {
    let portable = &ctx.portable;
    let mode = if portable.enabled { "portable" } else { "installed" };
    let source = match portable.source {
        PortableSource::Cli => "command line",
        PortableSource::Env => "environment",
        PortableSource::Auto => "removable media",
        PortableSource::Default => "default",
    };

    println!("mode: {mode} (decided by {source})");
    if portable.auto_detected_removable {
        println!("running from removable media");
    }
    println!("platform: {}", ctx.platform);
    println!("default config: {}", ctx.config.default_path().display());
    println!("user config: {}", ctx.config.user_path().display());
    println!("preferences: {}", ctx.config.preferences().path().display());
    for (label, dir) in [
        ("config", &ctx.dirs.config_dir),
        ("data", &ctx.dirs.data_dir),
        ("cache", &ctx.dirs.cache_dir),
        ("logs", &ctx.dirs.log_dir),
        ("plugins", &ctx.dirs.plugins_dir),
    ] {
        println!("{label}: {}", dir.display());
    }
}
