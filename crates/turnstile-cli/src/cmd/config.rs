use crate::cmd::load_settings;
use crate::output::{print_fields, print_json};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use turnstile_core::paths;
use turnstile_core::settings::{Settings, WarnLevel};

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the merged settings (global overlaid with project)
    Show,

    /// Validate both settings files for common mistakes
    Validate,

    /// Print where settings are read from
    Path,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root),
        ConfigSubcommand::Validate => validate(root, json),
        ConfigSubcommand::Path => path(root, json),
    }
}

fn show(root: &Path) -> anyhow::Result<()> {
    let settings = load_settings(root)?;
    print_json(&settings)
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let global_path = paths::global_settings_path().context("cannot locate global settings")?;
    let project_path = paths::project_settings_path(root);

    let mut report = Vec::new();
    for (scope, path) in [("global", &global_path), ("project", &project_path)] {
        let settings = Settings::load_file(path)
            .with_context(|| format!("failed to read {scope} settings {}", path.display()))?;
        for w in settings.validate() {
            report.push((scope, w));
        }
    }

    if json {
        let warnings: Vec<_> = report
            .iter()
            .map(|(scope, w)| {
                serde_json::json!({
                    "scope": scope,
                    "level": w.level,
                    "message": w.message,
                })
            })
            .collect();
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if report.is_empty() {
        println!("Settings are valid. No warnings.");
    } else {
        for (scope, w) in &report {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {scope}: {}", w.message);
        }
    }

    if report.iter().any(|(_, w)| w.level == WarnLevel::Error) {
        anyhow::bail!("settings validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// path
// ---------------------------------------------------------------------------

fn path(root: &Path, json: bool) -> anyhow::Result<()> {
    let global = paths::global_settings_path().context("cannot locate global settings")?;
    let project = paths::project_settings_path(root);
    if json {
        print_json(&serde_json::json!({
            "global": global,
            "project": project,
        }))?;
    } else {
        print_fields(&[
            ("global", global.display().to_string()),
            ("project", project.display().to_string()),
        ]);
    }
    Ok(())
}
