use crate::cmd::open_store;
use crate::output::{print_fields, print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat};
use clap::Subcommand;
use std::path::Path;
use turnstile_core::checkpoint::{find_closest_checkpoint, CheckpointData};
use turnstile_core::store::LoadOptions;

/// Session recorded on checkpoints made by hand.
const CLI_SESSION: &str = "cli";

#[derive(Subcommand)]
pub enum CheckpointSubcommand {
    /// Snapshot HEAD, the index and the working tree
    Create {
        /// Session to record (default: "cli")
        #[arg(long)]
        session: Option<String>,
        /// Turn index to record
        #[arg(long, default_value_t = 0)]
        turn: u64,
        /// Explicit checkpoint id (default: <session>-turn-<turn>-<ms>)
        #[arg(long)]
        id: Option<String>,
    },
    /// List checkpoints, oldest first
    List {
        /// Only checkpoints recorded for this session
        #[arg(long)]
        session: Option<String>,
        /// Read refs in small batches
        #[arg(long)]
        low_priority: bool,
    },
    /// Show one checkpoint
    Show { id: String },
    /// Restore a checkpoint, snapshotting the current state first
    Restore {
        id: String,
        /// Session recorded on the backup (default: the checkpoint's)
        #[arg(long)]
        session: Option<String>,
    },
    /// Find the checkpoint closest to a point in time
    Closest {
        /// Epoch milliseconds or an RFC 3339 timestamp
        #[arg(long)]
        at: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Delete a checkpoint ref
    Delete { id: String },
}

pub fn run(root: &Path, subcmd: CheckpointSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        CheckpointSubcommand::Create { session, turn, id } => {
            create(root, session.as_deref(), turn, id.as_deref(), json)
        }
        CheckpointSubcommand::List {
            session,
            low_priority,
        } => list(root, session, low_priority, json),
        CheckpointSubcommand::Show { id } => show(root, &id, json),
        CheckpointSubcommand::Restore { id, session } => {
            restore(root, &id, session.as_deref(), json)
        }
        CheckpointSubcommand::Closest { at, session } => {
            closest(root, &at, session, json)
        }
        CheckpointSubcommand::Delete { id } => delete(root, &id, json),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn create(
    root: &Path,
    session: Option<&str>,
    turn: u64,
    id: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let session = session.unwrap_or(CLI_SESSION);
    let cp = match id {
        Some(id) => store.create(id, turn, session),
        None => store.create_for_turn(session, turn),
    }
    .context("failed to create checkpoint")?;

    if json {
        print_json(&cp)?;
    } else {
        println!("Created checkpoint {}", cp.id);
    }
    Ok(())
}

fn list(root: &Path, session: Option<String>, low_priority: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let checkpoints = store
        .load_all(&LoadOptions {
            session,
            low_priority,
        })
        .context("failed to list checkpoints")?;

    if json {
        print_json(&checkpoints)?;
        return Ok(());
    }
    if checkpoints.is_empty() {
        println!("No checkpoints.");
        return Ok(());
    }
    let rows = checkpoints
        .iter()
        .map(|c| {
            vec![
                c.id.clone(),
                c.session_id.clone(),
                c.turn_index.to_string(),
                created(c),
                short_head(c),
            ]
        })
        .collect();
    print_table(&["ID", "SESSION", "TURN", "CREATED", "HEAD"], rows);
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let cp = store
        .load(id)
        .with_context(|| format!("failed to load checkpoint '{id}'"))?;
    if json {
        print_json(&cp)?;
    } else {
        print_checkpoint(&cp);
    }
    Ok(())
}

fn restore(root: &Path, id: &str, session: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let cp = store
        .load(id)
        .with_context(|| format!("failed to load checkpoint '{id}'"))?;
    let session = session.unwrap_or(cp.session_id.as_str());
    let backup = store
        .restore_with_backup(&cp, session, cp.turn_index)
        .with_context(|| format!("failed to restore checkpoint '{id}'"))?;

    if json {
        print_json(&serde_json::json!({
            "restored": cp.id,
            "backup": backup.id,
        }))?;
    } else {
        println!("Restored {} (previous state saved as {})", cp.id, backup.id);
    }
    Ok(())
}

fn closest(root: &Path, at: &str, session: Option<String>, json: bool) -> anyhow::Result<()> {
    let target = parse_timestamp(at)?;
    let store = open_store(root)?;
    let checkpoints = store
        .load_all(&LoadOptions {
            session,
            low_priority: false,
        })
        .context("failed to list checkpoints")?;
    let cp = find_closest_checkpoint(&checkpoints, target)
        .with_context(|| format!("no checkpoints to match against {at}"))?;
    if json {
        print_json(cp)?;
    } else {
        print_checkpoint(cp);
    }
    Ok(())
}

fn delete(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    store
        .delete(id)
        .with_context(|| format!("failed to delete checkpoint '{id}'"))?;
    if json {
        print_json(&serde_json::json!({ "deleted": id }))?;
    } else {
        println!("Deleted checkpoint {id}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn created(cp: &CheckpointData) -> String {
    cp.created_at().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn short_head(cp: &CheckpointData) -> String {
    if cp.is_unborn() {
        "(unborn)".to_string()
    } else {
        cp.head_sha.chars().take(10).collect()
    }
}

fn print_checkpoint(cp: &CheckpointData) {
    print_fields(&[
        ("id", cp.id.clone()),
        ("session", cp.session_id.clone()),
        ("turn", cp.turn_index.to_string()),
        ("created", created(cp)),
        ("head", short_head(cp)),
        ("index tree", cp.index_tree_sha.clone()),
        ("worktree tree", cp.worktree_tree_sha.clone()),
    ]);
}

/// Epoch milliseconds, or an RFC 3339 date-time.
fn parse_timestamp(raw: &str) -> anyhow::Result<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    let ts = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("'{raw}' is neither epoch milliseconds nor RFC 3339"))?;
    Ok(ts.timestamp_millis())
}
