use crate::cmd::load_settings;
use crate::output::{print_fields, print_json};
use crate::prompt::TerminalConfirm;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use tracing::warn;
use turnstile_core::classifier::CommandClassifier;
use turnstile_core::paths;
use turnstile_core::permission::{PermissionGate, ToolRequest};
use turnstile_core::settings;
use turnstile_core::tier::PermissionTier;

#[derive(Subcommand)]
pub enum PermissionSubcommand {
    /// Show the tier a command needs and why
    Classify {
        /// The command line (quote it, or pass words after --)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a command through the gate; exits 1 when it is blocked
    Check {
        /// Evaluate at this level instead of the configured one
        #[arg(long)]
        level: Option<PermissionTier>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show the effective level, or set it
    Level {
        /// off, low, medium or high
        tier: Option<PermissionTier>,
        /// Write to the project settings instead of the global file
        #[arg(long)]
        project: bool,
    },
}

pub fn run(root: &Path, subcmd: PermissionSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PermissionSubcommand::Classify { command } => classify(root, &command.join(" "), json),
        PermissionSubcommand::Check { level, command } => {
            check(root, &command.join(" "), level, json)
        }
        PermissionSubcommand::Level { tier, project } => match tier {
            Some(tier) => set_level(root, tier, project, json),
            None => show_level(root, json),
        },
    }
}

// ---------------------------------------------------------------------------
// classify / check
// ---------------------------------------------------------------------------

fn classify(root: &Path, command: &str, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(root)?;
    let gate = PermissionGate::from_settings(&settings);
    let c = gate.classify(command);

    if json {
        return print_json(&c);
    }
    let mut fields = vec![
        ("command", c.command.clone()),
        ("normalized", c.normalized.clone()),
        ("tier", format!("{} ({})", c.tier, c.tier.description())),
        ("dangerous", c.dangerous.to_string()),
        ("reason", c.reason.clone()),
    ];
    if let Some(rule) = &c.matched_rule {
        fields.push(("rule", rule.clone()));
    }
    print_fields(&fields);
    Ok(())
}

fn check(
    root: &Path,
    command: &str,
    level: Option<PermissionTier>,
    json: bool,
) -> anyhow::Result<()> {
    let settings = load_settings(root)?;
    let mut gate = match level {
        // A one-off level is never written back by an escalation.
        Some(level) => PermissionGate::new(
            CommandClassifier::new(&settings.permission_config),
            level,
            settings.effective_mode(),
        ),
        None => PermissionGate::from_settings(&settings),
    };
    let request = ToolRequest::Bash {
        command: command.to_string(),
    };
    let outcome = gate.resolve(&request, &TerminalConfirm);

    if json {
        print_json(&outcome)?;
    } else if outcome.allowed {
        println!("allow: {}", outcome.reason);
    } else {
        println!("block: {}", outcome.reason);
    }
    if !outcome.allowed {
        anyhow::bail!("command blocked");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// level
// ---------------------------------------------------------------------------

fn show_level(root: &Path, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(root)?;
    let level = settings.effective_level();
    let from_env = std::env::var(paths::LEVEL_ENV)
        .is_ok_and(|v| v.trim().parse::<PermissionTier>().is_ok());
    let source = if from_env {
        paths::LEVEL_ENV
    } else if settings.permission_level.is_some() {
        "settings"
    } else {
        "default"
    };

    if json {
        print_json(&serde_json::json!({
            "level": level,
            "mode": settings.effective_mode(),
            "source": source,
        }))?;
    } else {
        println!("{level} ({}) from {source}", level.description());
    }
    Ok(())
}

fn set_level(root: &Path, tier: PermissionTier, project: bool, json: bool) -> anyhow::Result<()> {
    let path = if project {
        paths::project_settings_path(root)
    } else {
        paths::global_settings_path().context("cannot locate global settings")?
    };
    settings::persist_permission_level_at(&path, tier)
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        print_json(&serde_json::json!({
            "level": tier,
            "path": path,
        }))?;
    } else {
        println!("Permission level set to {tier} in {}", path.display());
    }
    if std::env::var_os(paths::LEVEL_ENV).is_some() {
        warn!("{} is set and overrides the saved level", paths::LEVEL_ENV);
    }
    Ok(())
}
