pub mod checkpoint;
pub mod classifier;
pub mod error;
pub mod git;
pub mod hook;
pub mod io;
pub mod paths;
pub mod pattern;
pub mod permission;
pub mod rules;
pub mod settings;
pub mod shell;
pub mod store;
pub mod tier;

pub use error::{Result, TurnstileError};
