use crate::error::{Result, TurnstileError};
use crate::paths::sanitize_ref_component;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Recorded in place of a commit sha when HEAD had no commits yet.
pub const UNBORN_HEAD: &str = "0000000000000000000000000000000000000000";

const MESSAGE_PREFIX: &str = "checkpoint:";

// ---------------------------------------------------------------------------
// CheckpointData
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of a working tree, addressed by
/// `refs/<namespace>/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    pub id: String,
    pub turn_index: u64,
    pub session_id: String,
    pub head_sha: String,
    pub index_tree_sha: String,
    pub worktree_tree_sha: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl CheckpointData {
    pub fn is_unborn(&self) -> bool {
        self.head_sha == UNBORN_HEAD
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_default()
    }

    /// Encode as the line-oriented commit message stored on the ref.
    pub fn to_message(&self) -> String {
        format!(
            "{MESSAGE_PREFIX}{}\nsessionId {}\nturn {}\nhead {}\nindex-tree {}\nworktree-tree {}\ncreated {}\n",
            self.id,
            self.session_id,
            self.turn_index,
            self.head_sha,
            self.index_tree_sha,
            self.worktree_tree_sha,
            self.created_at().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    /// Parse a commit message produced by [`CheckpointData::to_message`].
    /// Unknown lines are ignored; every known key is required.
    pub fn from_message(message: &str) -> Result<Self> {
        let mut lines = message.lines();
        let id = lines
            .next()
            .and_then(|l| l.trim_end().strip_prefix(MESSAGE_PREFIX))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| parse_err("missing 'checkpoint:<id>' header"))?
            .to_string();

        let mut session_id = None;
        let mut turn = None;
        let mut head = None;
        let mut index_tree = None;
        let mut worktree_tree = None;
        let mut created = None;

        for line in lines {
            let line = line.trim_end();
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "sessionId" => session_id = Some(value.to_string()),
                "turn" => {
                    turn = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| parse_err(&format!("bad turn '{value}'")))?,
                    )
                }
                "head" => head = Some(parse_sha(value)?),
                "index-tree" => index_tree = Some(parse_sha(value)?),
                "worktree-tree" => worktree_tree = Some(parse_sha(value)?),
                "created" => {
                    let ts = DateTime::parse_from_rfc3339(value)
                        .map_err(|_| parse_err(&format!("bad timestamp '{value}'")))?;
                    created = Some(ts.with_timezone(&Utc).timestamp_millis());
                }
                _ => {}
            }
        }

        Ok(Self {
            id,
            session_id: session_id.ok_or_else(|| parse_err("missing sessionId"))?,
            turn_index: turn.ok_or_else(|| parse_err("missing turn"))?,
            head_sha: head.ok_or_else(|| parse_err("missing head"))?,
            index_tree_sha: index_tree.ok_or_else(|| parse_err("missing index-tree"))?,
            worktree_tree_sha: worktree_tree.ok_or_else(|| parse_err("missing worktree-tree"))?,
            timestamp: created.ok_or_else(|| parse_err("missing created"))?,
        })
    }
}

fn parse_err(msg: &str) -> TurnstileError {
    TurnstileError::MessageParse(msg.to_string())
}

fn parse_sha(value: &str) -> Result<String> {
    let ok = (4..=64).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        return Err(parse_err(&format!("bad object id '{value}'")));
    }
    Ok(value.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Id helpers
// ---------------------------------------------------------------------------

/// `<session>-turn-<turn>-<timestamp>`, with the session folded into a valid
/// ref component.
pub fn turn_checkpoint_id(session_id: &str, turn_index: u64, timestamp: i64) -> String {
    format!(
        "{}-turn-{turn_index}-{timestamp}",
        sanitize_ref_component(session_id)
    )
}

/// Id of the protective snapshot taken right before a restore.
pub fn before_restore_id(session_id: &str, timestamp: i64) -> String {
    format!(
        "{}-before-restore-{timestamp}",
        sanitize_ref_component(session_id)
    )
}

pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.trim().is_empty()
        || session_id.trim() != session_id
        || session_id.contains(['\n', '\r'])
    {
        return Err(TurnstileError::InvalidSessionId(session_id.escape_debug().to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Pick the checkpoint that best represents the state at `target` (ms).
///
/// A checkpoint at or before the target always beats one after it. Among
/// those at or before, the latest wins; if every checkpoint is later, the
/// earliest one wins.
pub fn find_closest_checkpoint(
    checkpoints: &[CheckpointData],
    target: i64,
) -> Option<&CheckpointData> {
    let before = checkpoints
        .iter()
        .filter(|c| c.timestamp <= target)
        .fold(None::<&CheckpointData>, |best, c| match best {
            Some(b) if b.timestamp >= c.timestamp => Some(b),
            _ => Some(c),
        });
    if before.is_some() {
        return before;
    }
    checkpoints
        .iter()
        .filter(|c| c.timestamp > target)
        .fold(None::<&CheckpointData>, |best, c| match best {
            Some(b) if b.timestamp <= c.timestamp => Some(b),
            _ => Some(c),
        })
}

/// Latest checkpoint recorded for `turn_index` in `session_id`.
pub fn find_by_turn<'a>(
    checkpoints: &'a [CheckpointData],
    session_id: &str,
    turn_index: u64,
) -> Option<&'a CheckpointData> {
    checkpoints
        .iter()
        .filter(|c| c.session_id == session_id && c.turn_index == turn_index)
        .max_by_key(|c| c.timestamp)
}

pub fn find_by_id<'a>(checkpoints: &'a [CheckpointData], id: &str) -> Option<&'a CheckpointData> {
    checkpoints.iter().find(|c| c.id == id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(id: &str, session: &str, turn: u64, ts: i64) -> CheckpointData {
        CheckpointData {
            id: id.to_string(),
            turn_index: turn,
            session_id: session.to_string(),
            head_sha: "a".repeat(40),
            index_tree_sha: "b".repeat(40),
            worktree_tree_sha: "c".repeat(40),
            timestamp: ts,
        }
    }

    #[test]
    fn message_roundtrip_preserves_every_field() {
        let original = CheckpointData {
            id: "sess-1-turn-3-1700000000123".to_string(),
            turn_index: 3,
            session_id: "sess 1/odd".to_string(),
            head_sha: UNBORN_HEAD.to_string(),
            index_tree_sha: "4b825dc642cb6eb9a060e54bf8d69288fbee4904".to_string(),
            worktree_tree_sha: "9f2c3e1d2b7a4c5d6e7f8091a2b3c4d5e6f70819".to_string(),
            timestamp: 1_700_000_000_123,
        };
        let message = original.to_message();
        assert!(message.starts_with("checkpoint:sess-1-turn-3-1700000000123\n"));
        assert!(message.contains("\ncreated 2023-11-14T22:13:20.123Z\n"));
        assert_eq!(CheckpointData::from_message(&message).unwrap(), original);
    }

    #[test]
    fn message_parse_ignores_unknown_lines() {
        let msg = "checkpoint:x\nsessionId s\nextra stuff here\nturn 0\nhead aaaa\nindex-tree bbbb\nworktree-tree cccc\ncreated 2024-01-01T00:00:00.000Z\n";
        let parsed = CheckpointData::from_message(msg).unwrap();
        assert_eq!(parsed.id, "x");
        assert_eq!(parsed.timestamp, 1_704_067_200_000);
    }

    #[test]
    fn message_parse_rejects_incomplete() {
        for msg in [
            "",
            "not a checkpoint",
            "checkpoint:\nsessionId s",
            "checkpoint:x\nsessionId s\nturn 1\nhead aaaa\nindex-tree bbbb\ncreated 2024-01-01T00:00:00Z",
            "checkpoint:x\nsessionId s\nturn one\nhead aaaa\nindex-tree bbbb\nworktree-tree cccc\ncreated 2024-01-01T00:00:00Z",
            "checkpoint:x\nsessionId s\nturn 1\nhead zzzz\nindex-tree bbbb\nworktree-tree cccc\ncreated 2024-01-01T00:00:00Z",
        ] {
            assert!(CheckpointData::from_message(msg).is_err(), "should fail: {msg:?}");
        }
    }

    #[test]
    fn ids_are_valid_ref_components() {
        let id = turn_checkpoint_id("abc def", 4, 1700);
        assert_eq!(id, "abc-def-turn-4-1700");
        crate::paths::validate_checkpoint_id(&id).unwrap();
        let id = before_restore_id("abc", 1700);
        assert_eq!(id, "abc-before-restore-1700");
    }

    #[test]
    fn session_ids_with_newlines_rejected() {
        assert!(validate_session_id("a\nb").is_err());
        assert!(validate_session_id("  ").is_err());
        assert!(validate_session_id("padded ").is_err());
        validate_session_id("session 42").unwrap();
    }

    #[test]
    fn closest_prefers_at_or_before() {
        let cps = vec![cp("a", "s", 0, 100), cp("b", "s", 1, 200), cp("c", "s", 2, 300)];
        assert_eq!(find_closest_checkpoint(&cps, 250).unwrap().id, "b");
        // 290 is nearer to 300 but 200 is not after the target.
        assert_eq!(find_closest_checkpoint(&cps, 290).unwrap().id, "b");
        assert_eq!(find_closest_checkpoint(&cps, 300).unwrap().id, "c");
        assert_eq!(find_closest_checkpoint(&cps, 10_000).unwrap().id, "c");
    }

    #[test]
    fn closest_falls_back_to_earliest_after() {
        let cps = vec![cp("late", "s", 2, 900), cp("early", "s", 1, 500)];
        assert_eq!(find_closest_checkpoint(&cps, 100).unwrap().id, "early");
    }

    #[test]
    fn closest_of_nothing_is_none() {
        assert!(find_closest_checkpoint(&[], 100).is_none());
    }

    #[test]
    fn closest_is_order_independent() {
        let mut cps = vec![cp("a", "s", 0, 100), cp("b", "s", 1, 200), cp("c", "s", 2, 300)];
        cps.reverse();
        assert_eq!(find_closest_checkpoint(&cps, 250).unwrap().id, "b");
    }

    #[test]
    fn find_by_turn_takes_latest_in_session() {
        let cps = vec![
            cp("a", "s", 1, 100),
            cp("b", "s", 1, 150),
            cp("c", "other", 1, 200),
        ];
        assert_eq!(find_by_turn(&cps, "s", 1).unwrap().id, "b");
        assert!(find_by_turn(&cps, "s", 2).is_none());
        assert_eq!(find_by_id(&cps, "c").unwrap().session_id, "other");
    }
}
