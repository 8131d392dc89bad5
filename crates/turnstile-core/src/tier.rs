use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// PermissionTier
// ---------------------------------------------------------------------------

/// Risk level a command needs before it runs without confirmation.
/// Ordered from most to least restrictive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    /// Read-only commands only.
    #[default]
    Off,
    /// Plus safe writes: creating, copying and moving files, staging.
    Low,
    /// Plus development commands: installs, builds, tests, local git history.
    Medium,
    /// Everything.
    High,
}

impl PermissionTier {
    pub fn all() -> &'static [PermissionTier] {
        &[
            PermissionTier::Off,
            PermissionTier::Low,
            PermissionTier::Medium,
            PermissionTier::High,
        ]
    }

    pub fn next(self) -> Option<PermissionTier> {
        Self::all().get(self as usize + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionTier::Off => "off",
            PermissionTier::Low => "low",
            PermissionTier::Medium => "medium",
            PermissionTier::High => "high",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PermissionTier::Off => "read-only",
            PermissionTier::Low => "safe writes",
            PermissionTier::Medium => "dev commands",
            PermissionTier::High => "unrestricted",
        }
    }

    /// True when a session at `self` may run something requiring `required`.
    pub fn permits(self, required: PermissionTier) -> bool {
        required <= self
    }
}

impl fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionTier {
    type Err = crate::error::TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(PermissionTier::Off),
            "low" => Ok(PermissionTier::Low),
            "medium" => Ok(PermissionTier::Medium),
            "high" => Ok(PermissionTier::High),
            _ => Err(crate::error::TurnstileError::InvalidTier(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PermissionMode
// ---------------------------------------------------------------------------

/// What happens when a command needs more than the current tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Prompt the user when a confirmer is available; block otherwise.
    #[default]
    Ask,
    /// Never prompt; block.
    Block,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Ask => "ask",
            PermissionMode::Block => "block",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = crate::error::TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(PermissionMode::Ask),
            "block" => Ok(PermissionMode::Block),
            _ => Err(crate::error::TurnstileError::InvalidMode(s.to_string())),
        }
    }
}
