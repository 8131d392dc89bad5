use crate::error::{Result, TurnstileError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TURNSTILE_DIR: &str = ".turnstile";
pub const SETTINGS_FILE: &str = "settings.json";

/// Overrides the global settings directory (default `~/.turnstile`).
pub const HOME_ENV: &str = "TURNSTILE_HOME";
/// Overrides the effective permission tier without persisting it.
pub const LEVEL_ENV: &str = "TURNSTILE_PERMISSION_LEVEL";

pub const DEFAULT_NAMESPACE: &str = "turnstile-checkpoints";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn project_dir(root: &Path) -> PathBuf {
    root.join(TURNSTILE_DIR)
}

pub fn project_settings_path(root: &Path) -> PathBuf {
    project_dir(root).join(SETTINGS_FILE)
}

/// `$TURNSTILE_HOME`, or `~/.turnstile`.
pub fn global_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = home::home_dir().ok_or(TurnstileError::HomeNotFound)?;
    Ok(home.join(TURNSTILE_DIR))
}

pub fn global_settings_path() -> Result<PathBuf> {
    Ok(global_dir()?.join(SETTINGS_FILE))
}

// ---------------------------------------------------------------------------
// Ref names
// ---------------------------------------------------------------------------

/// `refs/<namespace>/` with the trailing slash, as used for enumeration.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("refs/{}/", namespace.trim_matches('/'))
}

pub fn checkpoint_ref(namespace: &str, id: &str) -> String {
    format!("{}{id}", namespace_prefix(namespace))
}

static COMPONENT_RE: OnceLock<Regex> = OnceLock::new();

fn component_re() -> &'static Regex {
    COMPONENT_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-][A-Za-z0-9._\-]*$").unwrap())
}

fn is_valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 200
        && component_re().is_match(s)
        && !s.contains("..")
        && !s.ends_with('.')
        && !s.ends_with(".lock")
}

pub fn validate_checkpoint_id(id: &str) -> Result<()> {
    if !is_valid_component(id) {
        return Err(TurnstileError::InvalidCheckpointId(id.to_string()));
    }
    Ok(())
}

pub fn validate_namespace(namespace: &str) -> Result<()> {
    let trimmed = namespace.trim_matches('/');
    if trimmed.is_empty() || !trimmed.split('/').all(is_valid_component) {
        return Err(TurnstileError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

/// Fold an arbitrary session id into something usable inside a ref component.
pub fn sanitize_ref_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    let mut out = out.trim_start_matches('.').to_string();
    if out.ends_with(".lock") {
        out.truncate(out.len() - ".lock".len());
        out.push_str("-lock");
    }
    let out = out.trim_end_matches('.').to_string();
    if out.is_empty() {
        "session".to_string()
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["abc-turn-1-1700000000000", "a", "s_1.x", "-lead"] {
            validate_checkpoint_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_ids() {
        for id in ["", ".hidden", "a..b", "ends.", "x.lock", "has space", "a/b", "a~1"] {
            assert!(validate_checkpoint_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn namespaces() {
        validate_namespace("turnstile-checkpoints").unwrap();
        validate_namespace("agent/checkpoints").unwrap();
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("a//b").is_err());
        assert!(validate_namespace("bad name").is_err());
    }

    #[test]
    fn sanitize_produces_valid_components() {
        for raw in ["session 1", "../etc", "x.lock", "...", "ü/ñ", "ok-id"] {
            let s = sanitize_ref_component(raw);
            validate_checkpoint_id(&s).unwrap_or_else(|_| panic!("{raw} -> {s}"));
        }
        assert_eq!(sanitize_ref_component("ok-id"), "ok-id");
        assert_eq!(sanitize_ref_component("a b/c"), "a-b-c");
    }

    #[test]
    fn ref_helpers() {
        assert_eq!(namespace_prefix("ns"), "refs/ns/");
        assert_eq!(namespace_prefix("/ns/"), "refs/ns/");
        assert_eq!(checkpoint_ref("ns", "id-1"), "refs/ns/id-1");
        assert_eq!(
            project_settings_path(Path::new("/tmp/proj")),
            PathBuf::from("/tmp/proj/.turnstile/settings.json")
        );
    }
}
