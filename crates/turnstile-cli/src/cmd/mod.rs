pub mod checkpoint;
pub mod config;
pub mod hook;
pub mod permission;

use anyhow::Context;
use std::path::Path;
use turnstile_core::settings::Settings;
use turnstile_core::store::CheckpointStore;

pub(crate) fn load_settings(root: &Path) -> anyhow::Result<Settings> {
    Settings::load(root).context("failed to load settings")
}

pub(crate) fn open_store(root: &Path) -> anyhow::Result<CheckpointStore> {
    let settings = load_settings(root)?;
    let namespace = settings.checkpoint_settings().namespace;
    CheckpointStore::open(root, &namespace)
        .with_context(|| format!("cannot use checkpoints in {}", root.display()))
}
