//! Host integration: one JSON event in, one JSON response out.
//!
//! The host reports session lifecycle, turn boundaries and tool calls;
//! [`HookSession`] turns them into checkpoints and permission decisions.
//! Nothing here panics or returns an error to the host loop: failures come
//! back as [`HookResponse::Error`].

use crate::checkpoint::{find_closest_checkpoint, CheckpointData};
use crate::permission::{Confirm, PermissionGate, ToolRequest};
use crate::settings::{CheckpointSettings, Settings};
use crate::store::{CheckpointStore, LoadOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    SessionStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    SessionSwitch {
        session_id: String,
    },
    /// Branch the conversation of `session_id` at `target_timestamp` (ms).
    SessionFork {
        session_id: String,
        target_timestamp: i64,
        #[serde(default)]
        restore: bool,
    },
    TurnStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        turn_index: u64,
    },
    ToolCall {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_name: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HookResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Checkpoint {
        id: String,
    },
    /// Checkpointing is off for this session (no repository, or disabled).
    Disabled {
        reason: String,
    },
    Allow {
        reason: String,
    },
    Block {
        reason: String,
    },
    Found {
        checkpoint_id: String,
        timestamp: i64,
    },
    Restored {
        checkpoint_id: String,
        backup_id: String,
    },
    NotFound {
        message: String,
    },
    Error {
        message: String,
    },
}

impl HookResponse {
    fn ok() -> Self {
        HookResponse::Ok { message: None }
    }

    fn error(message: impl Into<String>) -> Self {
        HookResponse::Error {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// HookSession
// ---------------------------------------------------------------------------

/// State carried across the events of one host process.
#[derive(Debug)]
pub struct HookSession {
    cwd: PathBuf,
    checkpoint: CheckpointSettings,
    store: Option<CheckpointStore>,
    disabled_reason: String,
    gate: PermissionGate,
    session_id: Option<String>,
    turn_index: u64,
    /// Checkpoints of `session_id`, once preloaded.
    cache: Option<Vec<CheckpointData>>,
    /// Checkpoints written before the preload landed; folded in by `prime`.
    pending: Vec<CheckpointData>,
    /// Bumped whenever the cache is invalidated (new session or new store).
    generation: u64,
}

impl HookSession {
    pub fn new(cwd: &Path, settings: &Settings) -> Self {
        let mut session = Self {
            cwd: cwd.to_path_buf(),
            checkpoint: settings.checkpoint_settings(),
            store: None,
            disabled_reason: String::new(),
            gate: PermissionGate::from_settings(settings),
            session_id: None,
            turn_index: 0,
            cache: None,
            pending: Vec::new(),
            generation: 0,
        };
        session.open_store();
        session
    }

    pub fn with_gate(mut self, gate: PermissionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn cached(&self) -> Option<&[CheckpointData]> {
        self.cache.as_deref()
    }

    /// Changes whenever cached checkpoints stop being valid. A preload taken
    /// at one generation is only accepted by [`HookSession::prime`] at the same one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// What a background preload should fetch for the current session.
    pub fn preload_request(&self) -> Option<(CheckpointStore, LoadOptions)> {
        let store = self.store.clone()?;
        let session = self.session_id.clone()?;
        Some((
            store,
            LoadOptions {
                session: Some(session),
                low_priority: true,
            },
        ))
    }

    /// Install preloaded checkpoints. Ignored when the session or store has
    /// moved on since `generation`. Checkpoints written while the preload
    /// was running are merged in.
    pub fn prime(&mut self, session_id: &str, generation: u64, checkpoints: Vec<CheckpointData>) {
        if self.session_id.as_deref() != Some(session_id) || self.generation != generation {
            debug!(session_id, generation, "discarding stale preload");
            return;
        }
        let mut merged = self.cache.take().unwrap_or_default();
        for cp in checkpoints.into_iter().chain(self.pending.drain(..)) {
            if !merged.iter().any(|e| e.id == cp.id) {
                merged.push(cp);
            }
        }
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        self.cache = Some(merged);
    }

    fn invalidate_cache(&mut self) {
        self.cache = None;
        self.pending.clear();
        self.generation += 1;
    }

    /// Record a checkpoint of the active session in the cache, or hold it
    /// until the preload arrives.
    fn remember(&mut self, cp: CheckpointData) {
        match &mut self.cache {
            Some(cache) => cache.push(cp),
            None => self.pending.push(cp),
        }
    }

    /// Parse and handle one protocol line.
    pub fn handle_line(&mut self, line: &str, confirm: &dyn Confirm) -> HookResponse {
        match serde_json::from_str::<HookEvent>(line) {
            Ok(event) => self.handle(event, confirm),
            Err(e) => {
                warn!(error = %e, "malformed hook event");
                HookResponse::error(format!("malformed event: {e}"))
            }
        }
    }

    pub fn handle(&mut self, event: HookEvent, confirm: &dyn Confirm) -> HookResponse {
        match event {
            HookEvent::SessionStart { session_id, cwd } => {
                if let Some(cwd) = cwd {
                    if cwd != self.cwd {
                        self.cwd = cwd;
                        self.open_store();
                        self.invalidate_cache();
                    }
                }
                self.activate(session_id)
            }
            HookEvent::SessionSwitch { session_id } => self.activate(session_id),
            HookEvent::TurnStart {
                session_id,
                turn_index,
            } => self.turn_start(session_id, turn_index),
            HookEvent::ToolCall { tool_name, input } => {
                let request = ToolRequest::from_tool_call(&tool_name, &input);
                let outcome = self.gate.resolve(&request, confirm);
                debug!(tool = %tool_name, allowed = outcome.allowed, reason = %outcome.reason, "tool call");
                if outcome.allowed {
                    HookResponse::Allow {
                        reason: outcome.reason,
                    }
                } else {
                    HookResponse::Block {
                        reason: outcome.reason,
                    }
                }
            }
            HookEvent::ToolResult {
                tool_name,
                is_error,
            } => {
                debug!(tool = %tool_name, is_error, "tool result");
                HookResponse::ok()
            }
            HookEvent::SessionFork {
                session_id,
                target_timestamp,
                restore,
            } => self.fork(&session_id, target_timestamp, restore),
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn open_store(&mut self) {
        self.store = None;
        if !self.checkpoint.enabled {
            self.disabled_reason = "checkpoints disabled in settings".to_string();
            return;
        }
        match CheckpointStore::open(&self.cwd, &self.checkpoint.namespace) {
            Ok(store) => {
                debug!(root = %store.root().display(), "checkpoint store ready");
                self.store = Some(store);
            }
            Err(e) => {
                debug!(error = %e, "checkpointing disabled");
                self.disabled_reason = e.to_string();
            }
        }
    }

    fn activate(&mut self, session_id: String) -> HookResponse {
        if self.session_id.as_deref() != Some(session_id.as_str()) {
            self.invalidate_cache();
            self.turn_index = 0;
        }
        info!(session_id = %session_id, checkpoints = self.store.is_some(), "session active");
        self.session_id = Some(session_id);
        if self.store.is_some() {
            HookResponse::ok()
        } else {
            self.disabled()
        }
    }

    fn disabled(&self) -> HookResponse {
        HookResponse::Disabled {
            reason: self.disabled_reason.clone(),
        }
    }

    fn turn_start(&mut self, session_id: Option<String>, turn_index: u64) -> HookResponse {
        if let Some(id) = session_id {
            if self.session_id.as_deref() != Some(id.as_str()) {
                self.activate(id);
            }
        }
        self.turn_index = turn_index;
        let Some(session_id) = self.session_id.clone() else {
            return HookResponse::error("turn_start before any session");
        };
        let Some(store) = &self.store else {
            return self.disabled();
        };
        match store.create_for_turn(&session_id, turn_index) {
            Ok(cp) => {
                let id = cp.id.clone();
                self.remember(cp);
                HookResponse::Checkpoint { id }
            }
            Err(e) => {
                warn!(error = %e, turn_index, "turn checkpoint failed");
                HookResponse::error(format!("checkpoint failed: {e}"))
            }
        }
    }

    fn fork(&mut self, session_id: &str, target: i64, restore: bool) -> HookResponse {
        let Some(store) = &self.store else {
            return self.disabled();
        };
        let loaded;
        let checkpoints: &[CheckpointData] = match &self.cache {
            Some(cache) if self.session_id.as_deref() == Some(session_id) => cache,
            _ => match store.load_all(&LoadOptions::for_session(session_id)) {
                Ok(list) => {
                    loaded = list;
                    &loaded
                }
                Err(e) => return HookResponse::error(format!("could not list checkpoints: {e}")),
            },
        };
        let Some(target_cp) = find_closest_checkpoint(checkpoints, target).cloned() else {
            return HookResponse::NotFound {
                message: format!("no checkpoints for session '{session_id}'"),
            };
        };
        if !restore {
            return HookResponse::Found {
                checkpoint_id: target_cp.id,
                timestamp: target_cp.timestamp,
            };
        }
        match store.restore_with_backup(&target_cp, session_id, self.turn_index) {
            Ok(backup) => {
                info!(id = %target_cp.id, backup = %backup.id, "forked to checkpoint");
                let backup_id = backup.id.clone();
                if self.session_id.as_deref() == Some(session_id) {
                    self.remember(backup);
                }
                HookResponse::Restored {
                    checkpoint_id: target_cp.id,
                    backup_id,
                }
            }
            Err(e) => {
                warn!(id = %target_cp.id, error = %e, "restore failed");
                HookResponse::error(format!("restore of '{}' failed: {e}", target_cp.id))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::CommandClassifier;
    use crate::git::test_repo;
    use crate::permission::NonInteractive;
    use crate::tier::{PermissionMode, PermissionTier};
    use tempfile::TempDir;

    fn session_in(dir: &Path, tier: PermissionTier) -> HookSession {
        let gate = PermissionGate::new(CommandClassifier::default(), tier, PermissionMode::Ask);
        HookSession::new(dir, &Settings::default()).with_gate(gate)
    }

    fn repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        test_repo::init(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        test_repo::commit_all(dir.path(), "init");
        dir
    }

    fn line(s: &mut HookSession, json: &str) -> HookResponse {
        s.handle_line(json, &NonInteractive)
    }

    #[test]
    fn events_parse_from_snake_case_json() {
        let e: HookEvent =
            serde_json::from_str(r#"{"event":"turn_start","turn_index":3}"#).unwrap();
        assert_eq!(
            e,
            HookEvent::TurnStart {
                session_id: None,
                turn_index: 3
            }
        );
        let e: HookEvent = serde_json::from_str(
            r#"{"event":"tool_call","tool_name":"bash","input":{"command":"ls"}}"#,
        )
        .unwrap();
        assert!(matches!(e, HookEvent::ToolCall { .. }));
        let json = serde_json::to_string(&HookResponse::Checkpoint { id: "x".into() }).unwrap();
        assert_eq!(json, r#"{"status":"checkpoint","id":"x"}"#);
    }

    #[test]
    fn malformed_line_is_an_error_response() {
        let dir = TempDir::new().unwrap();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        assert!(matches!(line(&mut s, "not json"), HookResponse::Error { .. }));
        assert!(matches!(
            line(&mut s, r#"{"event":"nope"}"#),
            HookResponse::Error { .. }
        ));
    }

    #[test]
    fn no_repository_disables_checkpoints_only() {
        let dir = TempDir::new().unwrap();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        assert!(matches!(
            line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#),
            HookResponse::Disabled { .. }
        ));
        assert!(matches!(
            line(&mut s, r#"{"event":"turn_start","turn_index":1}"#),
            HookResponse::Disabled { .. }
        ));
        assert!(matches!(
            line(&mut s, r#"{"event":"tool_call","tool_name":"bash","input":{"command":"ls"}}"#),
            HookResponse::Allow { .. }
        ));
    }

    #[test]
    fn turn_start_without_session_is_error() {
        let dir = repo();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        assert!(matches!(
            line(&mut s, r#"{"event":"turn_start","turn_index":1}"#),
            HookResponse::Error { .. }
        ));
    }

    #[test]
    fn turn_start_creates_checkpoint() {
        let dir = repo();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        let HookResponse::Checkpoint { id } =
            line(&mut s, r#"{"event":"turn_start","turn_index":2}"#)
        else {
            panic!("expected checkpoint");
        };
        assert!(id.starts_with("s1-turn-2-"));
        let cp = s.store().unwrap().load(&id).unwrap();
        assert_eq!(cp.turn_index, 2);
        assert_eq!(s.turn_index(), 2);
    }

    #[test]
    fn tool_calls_go_through_gate() {
        let dir = TempDir::new().unwrap();
        let mut s = session_in(dir.path(), PermissionTier::Low);
        assert!(matches!(
            line(&mut s, r#"{"event":"tool_call","tool_name":"bash","input":{"command":"npm install"}}"#),
            HookResponse::Block { .. }
        ));
        assert!(matches!(
            line(&mut s, r#"{"event":"tool_call","tool_name":"write","input":{"path":"x"}}"#),
            HookResponse::Allow { .. }
        ));
        assert!(matches!(
            line(&mut s, r#"{"event":"tool_result","tool_name":"write","is_error":false}"#),
            HookResponse::Ok { .. }
        ));
    }

    #[test]
    fn fork_finds_and_restores_closest() {
        let dir = repo();
        let root = dir.path();
        let mut s = session_in(root, PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        let HookResponse::Checkpoint { id: first } =
            line(&mut s, r#"{"event":"turn_start","turn_index":0}"#)
        else {
            panic!("expected checkpoint");
        };
        let first_ts = s.store().unwrap().load(&first).unwrap().timestamp;

        std::fs::write(root.join("a.txt"), "changed\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        line(&mut s, r#"{"event":"turn_start","turn_index":1}"#);

        let found = line(
            &mut s,
            &format!(r#"{{"event":"session_fork","session_id":"s1","target_timestamp":{first_ts}}}"#),
        );
        assert_eq!(
            found,
            HookResponse::Found {
                checkpoint_id: first.clone(),
                timestamp: first_ts
            }
        );

        let restored = line(
            &mut s,
            &format!(
                r#"{{"event":"session_fork","session_id":"s1","target_timestamp":{first_ts},"restore":true}}"#
            ),
        );
        let HookResponse::Restored { checkpoint_id, backup_id } = restored else {
            panic!("expected restore, got {restored:?}");
        };
        assert_eq!(checkpoint_id, first);
        assert!(backup_id.starts_with("s1-before-restore-"));
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "one\n");
    }

    #[test]
    fn fork_of_unknown_session_is_not_found() {
        let dir = repo();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        assert!(matches!(
            line(&mut s, r#"{"event":"session_fork","session_id":"ghost","target_timestamp":0}"#),
            HookResponse::NotFound { .. }
        ));
    }

    #[test]
    fn prime_only_applies_to_active_session() {
        let dir = repo();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        let (store, options) = s.preload_request().unwrap();
        assert!(options.low_priority);
        let generation = s.generation();
        let list = store.load_all(&options).unwrap();

        s.prime("other", generation, Vec::new());
        assert!(s.cached().is_none());
        s.prime("s1", generation, list);
        assert!(s.cached().is_some());

        line(&mut s, r#"{"event":"session_switch","session_id":"s2"}"#);
        assert!(s.cached().is_none());
        assert_ne!(s.generation(), generation);
    }

    #[test]
    fn turns_during_preload_survive_priming() {
        let dir = repo();
        let mut s = session_in(dir.path(), PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        let (store, options) = s.preload_request().unwrap();
        let generation = s.generation();
        let early = store.load_all(&options).unwrap();
        assert!(early.is_empty());

        let HookResponse::Checkpoint { id } =
            line(&mut s, r#"{"event":"turn_start","turn_index":0}"#)
        else {
            panic!("expected checkpoint");
        };
        assert!(s.cached().is_none());

        s.prime("s1", generation, early);
        let cached = s.cached().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, id);

        let found = line(
            &mut s,
            &format!(
                r#"{{"event":"session_fork","session_id":"s1","target_timestamp":{}}}"#,
                i64::MAX
            ),
        );
        assert!(
            matches!(&found, HookResponse::Found { checkpoint_id, .. } if *checkpoint_id == id),
            "{found:?}"
        );
    }

    #[test]
    fn preload_from_before_a_store_change_is_discarded() {
        let first = repo();
        let second = repo();
        let mut s = session_in(first.path(), PermissionTier::Off);
        line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#);
        line(&mut s, r#"{"event":"turn_start","turn_index":0}"#);
        let (store, options) = s.preload_request().unwrap();
        let generation = s.generation();
        let old = store.load_all(&options).unwrap();
        assert_eq!(old.len(), 1);

        let start = serde_json::json!({
            "event": "session_start",
            "session_id": "s1",
            "cwd": second.path(),
        });
        line(&mut s, &start.to_string());
        assert_ne!(s.generation(), generation);
        assert!(s.cached().is_none());

        s.prime("s1", generation, old);
        assert!(s.cached().is_none());
        assert!(matches!(
            line(&mut s, r#"{"event":"session_fork","session_id":"s1","target_timestamp":0}"#),
            HookResponse::NotFound { .. }
        ));
    }

    #[test]
    fn disabled_in_settings() {
        let dir = repo();
        let settings: Settings =
            serde_json::from_str(r#"{"checkpoint":{"enabled":false}}"#).unwrap();
        let mut s = HookSession::new(dir.path(), &settings).with_gate(PermissionGate::new(
            CommandClassifier::default(),
            PermissionTier::Off,
            PermissionMode::Ask,
        ));
        assert!(s.store().is_none());
        let HookResponse::Disabled { reason } =
            line(&mut s, r#"{"event":"session_start","session_id":"s1"}"#)
        else {
            panic!("expected disabled");
        };
        assert!(reason.contains("disabled"));
    }
}
