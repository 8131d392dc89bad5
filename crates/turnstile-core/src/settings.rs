use crate::error::Result;
use crate::paths;
use crate::pattern::{pattern_problem, MAX_PATTERN_LEN};
use crate::tier::{PermissionMode, PermissionTier};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

pub const MAX_PATTERNS_PER_TIER: usize = 64;
pub const MAX_PREFIX_MAPPINGS: usize = 32;

// ---------------------------------------------------------------------------
// SettingsWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PermissionConfig
// ---------------------------------------------------------------------------

/// Override patterns keyed by the tier they assign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierPatterns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub off: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub low: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub medium: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub high: Vec<String>,
}

impl TierPatterns {
    pub fn for_tier(&self, tier: PermissionTier) -> &[String] {
        match tier {
            PermissionTier::Off => &self.off,
            PermissionTier::Low => &self.low,
            PermissionTier::Medium => &self.medium,
            PermissionTier::High => &self.high,
        }
    }

    fn for_tier_mut(&mut self, tier: PermissionTier) -> &mut Vec<String> {
        match tier {
            PermissionTier::Off => &mut self.off,
            PermissionTier::Low => &mut self.low,
            PermissionTier::Medium => &mut self.medium,
            PermissionTier::High => &mut self.high,
        }
    }

    pub fn is_empty(&self) -> bool {
        PermissionTier::all()
            .iter()
            .all(|t| self.for_tier(*t).is_empty())
    }

    /// `first` entries then `second` entries, tier by tier.
    fn concat(first: &Self, second: &Self) -> Self {
        let mut out = Self::default();
        for tier in PermissionTier::all() {
            let list = out.for_tier_mut(*tier);
            list.extend(first.for_tier(*tier).iter().cloned());
            list.extend(second.for_tier(*tier).iter().cloned());
        }
        out
    }
}

/// Rewrites a leading command prefix, e.g. `fvm flutter` -> `flutter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionConfig {
    #[serde(default, skip_serializing_if = "TierPatterns::is_empty")]
    pub overrides: TierPatterns,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefix_mappings: Vec<PrefixMapping>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PermissionConfig {
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.prefix_mappings.is_empty() && self.extra.is_empty()
    }

    /// Copy with every list cut to its bound. Dropped entries are logged.
    pub fn bounded(&self) -> Self {
        let mut out = self.clone();
        for tier in PermissionTier::all() {
            let list = out.overrides.for_tier_mut(*tier);
            if list.len() > MAX_PATTERNS_PER_TIER {
                warn!(
                    tier = tier.as_str(),
                    dropped = list.len() - MAX_PATTERNS_PER_TIER,
                    "too many override patterns; extras ignored"
                );
                list.truncate(MAX_PATTERNS_PER_TIER);
            }
            list.retain(|p| {
                let keep = p.len() <= MAX_PATTERN_LEN;
                if !keep {
                    warn!(tier = tier.as_str(), len = p.len(), "override pattern too long; ignored");
                }
                keep
            });
        }
        if out.prefix_mappings.len() > MAX_PREFIX_MAPPINGS {
            warn!(
                dropped = out.prefix_mappings.len() - MAX_PREFIX_MAPPINGS,
                "too many prefix mappings; extras ignored"
            );
            out.prefix_mappings.truncate(MAX_PREFIX_MAPPINGS);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// CheckpointSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_namespace(),
            extra: Map::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    paths::DEFAULT_NAMESPACE.to_string()
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// One settings file. Keys this crate does not know are kept in `extra` and
/// written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_level: Option<PermissionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "PermissionConfig::is_empty")]
    pub permission_config: PermissionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Read a settings file; a missing or blank file is the default.
    pub fn load_file(path: &Path) -> Result<Self> {
        match crate::io::read_if_exists(path)? {
            Some(data) if !data.trim().is_empty() => Ok(serde_json::from_str(&data)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn save_file(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn load_global() -> Result<Self> {
        Self::load_file(&paths::global_settings_path()?)
    }

    pub fn load_project(root: &Path) -> Result<Self> {
        Self::load_file(&paths::project_settings_path(root))
    }

    /// Global settings overlaid with the project's. A missing home directory
    /// only loses the global layer.
    pub fn load(root: &Path) -> Result<Self> {
        let global = match paths::global_settings_path() {
            Ok(path) => Self::load_file(&path)?,
            Err(e) => {
                warn!(error = %e, "global settings unavailable");
                Self::default()
            }
        };
        let project = Self::load_project(root)?;
        Ok(Self::merge(&global, &project))
    }

    /// Project scalars win; pattern lists and mappings are concatenated with
    /// the project's entries first.
    pub fn merge(global: &Self, project: &Self) -> Self {
        let mut extra = global.extra.clone();
        extra.extend(project.extra.clone());
        let mut config_extra = global.permission_config.extra.clone();
        config_extra.extend(project.permission_config.extra.clone());

        let mut prefix_mappings = project.permission_config.prefix_mappings.clone();
        prefix_mappings.extend(global.permission_config.prefix_mappings.iter().cloned());

        Self {
            permission_level: project.permission_level.or(global.permission_level),
            permission_mode: project.permission_mode.or(global.permission_mode),
            permission_config: PermissionConfig {
                overrides: TierPatterns::concat(
                    &project.permission_config.overrides,
                    &global.permission_config.overrides,
                ),
                prefix_mappings,
                extra: config_extra,
            },
            checkpoint: project.checkpoint.clone().or_else(|| global.checkpoint.clone()),
            extra,
        }
    }

    /// Level from `TURNSTILE_PERMISSION_LEVEL` when set and valid, else the
    /// configured level, else `off`.
    pub fn effective_level(&self) -> PermissionTier {
        if let Ok(raw) = std::env::var(paths::LEVEL_ENV) {
            if !raw.trim().is_empty() {
                match raw.parse() {
                    Ok(tier) => return tier,
                    Err(e) => warn!(error = %e, "ignoring {}", paths::LEVEL_ENV),
                }
            }
        }
        self.permission_level.unwrap_or_default()
    }

    pub fn effective_mode(&self) -> PermissionMode {
        self.permission_mode.unwrap_or_default()
    }

    pub fn checkpoint_settings(&self) -> CheckpointSettings {
        self.checkpoint.clone().unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<SettingsWarning> {
        let mut warnings = Vec::new();
        let config = &self.permission_config;

        for tier in PermissionTier::all() {
            let patterns = config.overrides.for_tier(*tier);
            if patterns.len() > MAX_PATTERNS_PER_TIER {
                warnings.push(SettingsWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "{} override patterns for '{tier}'; only the first {MAX_PATTERNS_PER_TIER} are used",
                        patterns.len()
                    ),
                });
            }
            for pattern in patterns {
                if let Some(problem) = pattern_problem(pattern) {
                    warnings.push(SettingsWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "override pattern '{pattern}' for '{tier}' is ignored: {problem}"
                        ),
                    });
                }
            }
        }

        if config.prefix_mappings.len() > MAX_PREFIX_MAPPINGS {
            warnings.push(SettingsWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "{} prefix mappings; only the first {MAX_PREFIX_MAPPINGS} are used",
                    config.prefix_mappings.len()
                ),
            });
        }
        for mapping in &config.prefix_mappings {
            if mapping.from.trim().is_empty() {
                warnings.push(SettingsWarning {
                    level: WarnLevel::Error,
                    message: format!("prefix mapping to '{}' has an empty 'from'", mapping.to),
                });
            }
        }

        if let Some(cp) = &self.checkpoint {
            if let Err(e) = paths::validate_namespace(&cp.namespace) {
                warnings.push(SettingsWarning {
                    level: WarnLevel::Error,
                    message: e.to_string(),
                });
            }
        }

        warnings
    }
}

/// Write `permissionLevel` into the global settings file, keeping every
/// other key as it was.
pub fn persist_permission_level(tier: PermissionTier) -> Result<()> {
    persist_permission_level_at(&paths::global_settings_path()?, tier)
}

pub fn persist_permission_level_at(path: &Path, tier: PermissionTier) -> Result<()> {
    let mut settings = Settings::load_file(path)?;
    settings.permission_level = Some(tier);
    settings.save_file(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
