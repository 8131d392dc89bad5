//! Checkpoint store over git refs.
//!
//! A checkpoint is a commit under `refs/<namespace>/<id>`:
//!
//! - its tree is the full working tree (tracked + untracked, ignore rules
//!   respected), captured through a scratch copy of the index;
//! - its first parent is HEAD when HEAD has commits;
//! - its last parent is a commit of the staged index tree;
//! - its message is [`CheckpointData::to_message`].
//!
//! Both trees are therefore reachable from the ref and survive `git gc`.

use crate::checkpoint::{before_restore_id, turn_checkpoint_id, validate_session_id, CheckpointData, UNBORN_HEAD};
use crate::error::{Result, TurnstileError};
use crate::git::Git;
use crate::paths::{self, checkpoint_ref, namespace_prefix, validate_checkpoint_id};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Refs read per `for-each-ref` call in low-priority mode.
pub const LOW_PRIORITY_BATCH: usize = 8;
const LOW_PRIORITY_PAUSE: Duration = Duration::from_millis(5);
/// Suffixes tried when a generated id is already taken.
const MAX_ID_SUFFIX: u32 = 16;

const RECORD_FORMAT: &str = "--format=%(refname)%00%(contents)%1e";
const RECORD_SEP: char = '\u{1e}';

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Only return checkpoints whose recorded session id matches.
    pub session: Option<String>,
    /// Read refs in small batches, pausing between them.
    pub low_priority: bool,
}

impl LoadOptions {
    pub fn for_session(session: impl Into<String>) -> Self {
        Self {
            session: Some(session.into()),
            low_priority: false,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    git: Git,
    namespace: String,
}

impl CheckpointStore {
    /// Open the store for the repository containing `root`.
    /// Fails with `NotARepository` outside a git work tree.
    pub fn open(root: &Path, namespace: &str) -> Result<Self> {
        paths::validate_namespace(namespace)?;
        let git = Git::open(root)?;
        Ok(Self {
            git,
            namespace: namespace.trim_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        self.git.root()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ref_name(&self, id: &str) -> String {
        checkpoint_ref(&self.namespace, id)
    }

    fn ref_exists(&self, ref_name: &str) -> bool {
        self.git
            .succeeds(["rev-parse", "--verify", "--quiet", ref_name])
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    pub fn create(&self, id: &str, turn_index: u64, session_id: &str) -> Result<CheckpointData> {
        self.create_at(id, turn_index, session_id, chrono::Utc::now().timestamp_millis())
    }

    /// Snapshot the start of a turn under `<session>-turn-<n>-<now>`.
    pub fn create_for_turn(&self, session_id: &str, turn_index: u64) -> Result<CheckpointData> {
        let now = chrono::Utc::now().timestamp_millis();
        let id = turn_checkpoint_id(session_id, turn_index, now);
        self.create_unique(&id, turn_index, session_id, now)
    }

    /// `create_at` under `base`, or `base-1`, `base-2`, ... when an earlier
    /// checkpoint already took the id within the same millisecond.
    fn create_unique(
        &self,
        base: &str,
        turn_index: u64,
        session_id: &str,
        timestamp: i64,
    ) -> Result<CheckpointData> {
        let mut attempt = 0u32;
        loop {
            let id = match attempt {
                0 => base.to_string(),
                n => format!("{base}-{n}"),
            };
            match self.create_at(&id, turn_index, session_id, timestamp) {
                Err(TurnstileError::CheckpointExists(_)) if attempt < MAX_ID_SUFFIX => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn create_at(
        &self,
        id: &str,
        turn_index: u64,
        session_id: &str,
        timestamp: i64,
    ) -> Result<CheckpointData> {
        validate_checkpoint_id(id)?;
        validate_session_id(session_id)?;
        let ref_name = self.ref_name(id);
        if self.ref_exists(&ref_name) {
            return Err(TurnstileError::CheckpointExists(id.to_string()));
        }

        let head_sha = self.head_sha();
        let index_tree_sha = self.git.run(["write-tree"])?;
        let worktree_tree_sha = self.worktree_tree()?;

        let data = CheckpointData {
            id: id.to_string(),
            turn_index,
            session_id: session_id.to_string(),
            head_sha,
            index_tree_sha,
            worktree_tree_sha,
            timestamp,
        };

        let index_commit =
            self.git
                .commit_tree(&data.index_tree_sha, &[], &format!("checkpoint-index:{id}"))?;
        let mut parents: Vec<&str> = Vec::with_capacity(2);
        if !data.is_unborn() {
            parents.push(&data.head_sha);
        }
        parents.push(&index_commit);
        let commit = self
            .git
            .commit_tree(&data.worktree_tree_sha, &parents, &data.to_message())?;

        // Empty old value: the update fails if another writer created the ref meanwhile.
        self.git
            .run(["update-ref", ref_name.as_str(), commit.as_str(), ""])?;
        info!(id = %data.id, turn = data.turn_index, "checkpoint created");
        Ok(data)
    }

    fn head_sha(&self) -> String {
        self.git
            .run(["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNBORN_HEAD.to_string())
    }

    /// Tree of the whole working tree, built in a scratch index so the real
    /// index is never modified.
    fn worktree_tree(&self) -> Result<String> {
        let scratch = tempfile::Builder::new()
            .prefix("turnstile-index")
            .tempdir()?;
        let scratch_index = scratch.path().join("index");
        let real_index = self.git.git_path("index")?;
        if real_index.exists() {
            std::fs::copy(&real_index, &scratch_index)?;
        }
        let env: [(&str, &OsStr); 1] = [("GIT_INDEX_FILE", scratch_index.as_os_str())];
        self.git.run_with_env(["add", "-A", "--", "."], &env)?;
        self.git.run_with_env(["write-tree"], &env)
    }

    // -----------------------------------------------------------------------
    // restore
    // -----------------------------------------------------------------------

    /// Reset HEAD, index and working tree to `checkpoint`. Destructive:
    /// callers outside this module go through [`CheckpointStore::restore_with_backup`].
    pub fn restore(&self, checkpoint: &CheckpointData) -> Result<()> {
        let mut required = vec![
            (checkpoint.index_tree_sha.as_str(), "tree"),
            (checkpoint.worktree_tree_sha.as_str(), "tree"),
        ];
        if !checkpoint.is_unborn() {
            required.push((checkpoint.head_sha.as_str(), "commit"));
        }
        for (sha, kind) in required {
            if !self.git.object_exists(sha, kind) {
                return Err(TurnstileError::CheckpointObjectMissing {
                    id: checkpoint.id.clone(),
                    sha: sha.to_string(),
                });
            }
        }

        if checkpoint.is_unborn() {
            warn!(id = %checkpoint.id, "checkpoint predates the first commit; HEAD is left in place");
        } else {
            self.git
                .run(["reset", "--hard", "-q", checkpoint.head_sha.as_str()])?;
        }
        let keep = format!("--exclude={}", paths::TURNSTILE_DIR);
        self.git.run(["clean", "-fdq", keep.as_str()])?;
        self.git
            .run(["read-tree", "--reset", "-u", checkpoint.worktree_tree_sha.as_str()])?;
        self.git
            .run(["read-tree", "--reset", checkpoint.index_tree_sha.as_str()])?;
        info!(id = %checkpoint.id, "checkpoint restored");
        Ok(())
    }

    /// Snapshot the current state, then restore `checkpoint`. The restore is
    /// not attempted if the protective snapshot cannot be written.
    pub fn restore_with_backup(
        &self,
        checkpoint: &CheckpointData,
        session_id: &str,
        current_turn: u64,
    ) -> Result<CheckpointData> {
        let now = chrono::Utc::now().timestamp_millis();
        let backup = self.create_unique(
            &before_restore_id(session_id, now),
            current_turn,
            session_id,
            now,
        )?;
        self.restore(checkpoint)?;
        Ok(backup)
    }

    // -----------------------------------------------------------------------
    // load
    // -----------------------------------------------------------------------

    pub fn load(&self, id: &str) -> Result<CheckpointData> {
        validate_checkpoint_id(id)?;
        let ref_name = self.ref_name(id);
        let out = self.git.run(["for-each-ref", RECORD_FORMAT, ref_name.as_str()])?;
        self.parse_records(&out)
            .into_iter()
            .next()
            .ok_or_else(|| TurnstileError::CheckpointNotFound(id.to_string()))
    }

    /// Every parseable checkpoint in the namespace, oldest first. Refs whose
    /// message does not parse are skipped.
    pub fn load_all(&self, options: &LoadOptions) -> Result<Vec<CheckpointData>> {
        let prefix = namespace_prefix(&self.namespace);
        let mut checkpoints = if options.low_priority {
            self.load_batched(&prefix)?
        } else {
            let out = self.git.run(["for-each-ref", RECORD_FORMAT, prefix.as_str()])?;
            self.parse_records(&out)
        };

        if let Some(session) = &options.session {
            checkpoints.retain(|c| &c.session_id == session);
        }
        checkpoints.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    fn load_batched(&self, prefix: &str) -> Result<Vec<CheckpointData>> {
        let names = self
            .git
            .run(["for-each-ref", "--format=%(refname)", prefix])?;
        let names: Vec<&str> = names.lines().filter(|l| !l.is_empty()).collect();
        let mut checkpoints = Vec::with_capacity(names.len());
        for (i, batch) in names.chunks(LOW_PRIORITY_BATCH).enumerate() {
            if i > 0 {
                std::thread::sleep(LOW_PRIORITY_PAUSE);
            }
            let mut args = vec!["for-each-ref", RECORD_FORMAT];
            args.extend(batch.iter().copied());
            let out = self.git.run(args)?;
            checkpoints.extend(self.parse_records(&out));
        }
        Ok(checkpoints)
    }

    fn parse_records(&self, out: &str) -> Vec<CheckpointData> {
        let prefix = namespace_prefix(&self.namespace);
        out.split(RECORD_SEP)
            .filter_map(|record| {
                let record = record.trim_start_matches('\n');
                let (refname, message) = record.split_once('\0')?;
                let ref_id = refname.strip_prefix(&prefix)?;
                match CheckpointData::from_message(message) {
                    Ok(data) if data.id == ref_id => Some(data),
                    Ok(data) => {
                        debug!(refname, id = %data.id, "skipping ref whose message names another id");
                        None
                    }
                    Err(e) => {
                        debug!(refname, error = %e, "skipping unparseable checkpoint ref");
                        None
                    }
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // delete
    // -----------------------------------------------------------------------

    pub fn delete(&self, id: &str) -> Result<()> {
        validate_checkpoint_id(id)?;
        let ref_name = self.ref_name(id);
        if !self.ref_exists(&ref_name) {
            return Err(TurnstileError::CheckpointNotFound(id.to_string()));
        }
        self.git.run(["update-ref", "-d", ref_name.as_str()])?;
        info!(id, "checkpoint deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
