use crate::cmd::load_settings;
use crate::prompt::TerminalConfirm;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turnstile_core::checkpoint::CheckpointData;
use turnstile_core::hook::{HookEvent, HookResponse, HookSession};
use turnstile_core::permission::{Confirm, NonInteractive};
use turnstile_core::settings::Settings;

type Loaded = (String, u64, turnstile_core::Result<Vec<CheckpointData>>);
type Preload = JoinHandle<Loaded>;

pub fn run(root: &Path, session: Option<String>, no_prompt: bool) -> anyhow::Result<()> {
    let settings = load_settings(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(root.to_path_buf(), settings, session, no_prompt))
}

async fn serve(
    root: PathBuf,
    settings: Settings,
    session: Option<String>,
    no_prompt: bool,
) -> anyhow::Result<()> {
    let confirm: Box<dyn Confirm> = if no_prompt {
        Box::new(NonInteractive)
    } else {
        Box::new(TerminalConfirm)
    };
    let mut hook = HookSession::new(&root, &settings);

    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    hook.handle(
        HookEvent::SessionStart {
            session_id,
            cwd: None,
        },
        confirm.as_ref(),
    );
    let mut preload = spawn_preload(&hook);
    info!(root = %root.display(), checkpoints = hook.store().is_some(), "hook ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read hook input")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let generation = hook.generation();
                let response = tokio::task::block_in_place(|| hook.handle_line(&line, confirm.as_ref()));
                write_response(&mut stdout, &response).await?;
                // New session or new repository: the running preload is stale.
                if hook.generation() != generation {
                    preload = spawn_preload(&hook);
                }
            }
            done = wait(&mut preload), if preload.is_some() => {
                preload = None;
                match done {
                    Ok((session_id, generation, Ok(checkpoints))) => {
                        debug!(session_id = %session_id, count = checkpoints.len(), "checkpoints preloaded");
                        hook.prime(&session_id, generation, checkpoints);
                    }
                    Ok((session_id, _, Err(e))) => {
                        warn!(session_id = %session_id, error = %e, "checkpoint preload failed");
                    }
                    Err(e) => warn!(error = %e, "checkpoint preload task failed"),
                }
            }
        }
    }
    Ok(())
}

/// Read the session's checkpoints on the blocking pool, in small batches.
fn spawn_preload(hook: &HookSession) -> Option<Preload> {
    let (store, options) = hook.preload_request()?;
    let session_id = options.session.clone().unwrap_or_default();
    let generation = hook.generation();
    Some(tokio::task::spawn_blocking(move || {
        (session_id, generation, store.load_all(&options))
    }))
}

async fn wait(
    preload: &mut Option<Preload>,
) -> Result<Loaded, tokio::task::JoinError> {
    match preload {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    response: &HookResponse,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stdout
        .write_all(line.as_bytes())
        .await
        .context("failed to write hook response")?;
    stdout.flush().await?;
    Ok(())
}
