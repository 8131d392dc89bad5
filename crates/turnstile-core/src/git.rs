//! Thin wrapper over the `git` executable.
//!
//! Every checkpoint operation is a short sequence of plumbing commands run
//! against the repository top level. Output is captured; a non-zero exit
//! becomes [`TurnstileError::GitFailed`] carrying the trimmed stderr.

use crate::error::{Result, TurnstileError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Identity used for checkpoint commits so `commit-tree` works in
/// repositories without `user.name` / `user.email` configured.
const COMMIT_NAME: &str = "turnstile";
const COMMIT_EMAIL: &str = "turnstile@localhost";

#[derive(Debug, Clone)]
pub struct Git {
    root: PathBuf,
}

impl Git {
    /// Open the repository containing `dir`, resolving its top level.
    pub fn open(dir: &Path) -> Result<Self> {
        which::which("git").map_err(|_| TurnstileError::GitNotFound)?;
        let out = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|_| TurnstileError::NotARepository(dir.display().to_string()))?;
        if !out.status.success() {
            return Err(TurnstileError::NotARepository(dir.display().to_string()));
        }
        let top = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if top.is_empty() {
            // Inside .git itself or a bare repository: no work tree to snapshot.
            return Err(TurnstileError::NotARepository(dir.display().to_string()));
        }
        Ok(Self {
            root: PathBuf::from(top),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git and return trimmed stdout.
    pub fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_with_env(args, &[])
    }

    pub fn run_with_env<I, S>(&self, args: I, env: &[(&str, &OsStr)]) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let rendered = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("git {rendered}");

        let mut cmd = Command::new("git");
        cmd.args(&args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in env {
            cmd.env(k, v);
        }
        let out = cmd.output()?;
        if !out.status.success() {
            return Err(TurnstileError::GitFailed {
                args: rendered,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim_end().to_string())
    }

    /// Like [`Git::run`] but reports only whether git exited successfully.
    pub fn succeeds<I, S>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(args).is_ok()
    }

    /// `git commit-tree` with a fixed identity and signing disabled.
    pub fn commit_tree(&self, tree: &str, parents: &[&str], message: &str) -> Result<String> {
        let mut args: Vec<&str> = vec!["-c", "commit.gpgsign=false", "commit-tree", tree];
        for p in parents {
            args.push("-p");
            args.push(p);
        }
        args.push("-m");
        args.push(message);
        let env: [(&str, &OsStr); 4] = [
            ("GIT_AUTHOR_NAME", OsStr::new(COMMIT_NAME)),
            ("GIT_AUTHOR_EMAIL", OsStr::new(COMMIT_EMAIL)),
            ("GIT_COMMITTER_NAME", OsStr::new(COMMIT_NAME)),
            ("GIT_COMMITTER_EMAIL", OsStr::new(COMMIT_EMAIL)),
        ];
        self.run_with_env(args, &env)
    }

    /// Absolute path of a file inside the git directory (`git rev-parse --git-path`).
    pub fn git_path(&self, name: &str) -> Result<PathBuf> {
        let rel = self.run(["rev-parse", "--git-path", name])?;
        let path = PathBuf::from(rel);
        Ok(if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        })
    }

    pub fn object_exists(&self, sha: &str, kind: &str) -> bool {
        let spec = format!("{sha}^{{{kind}}}");
        self.succeeds(["cat-file", "-e", spec.as_str()])
    }
}

/// True when `dir` is inside a git work tree and git is installed.
pub fn is_git_repository(dir: &Path) -> bool {
    Git::open(dir).is_ok()
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_outside_repository_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Git::open(dir.path()),
            Err(TurnstileError::NotARepository(_))
        ));
        assert!(!is_git_repository(dir.path()));
    }

    #[test]
    fn open_resolves_toplevel_from_subdir() {
        let dir = TempDir::new().unwrap();
        test_repo::init(dir.path());
        let sub = dir.path().join("src/deep");
        std::fs::create_dir_all(&sub).unwrap();
        let git = Git::open(&sub).unwrap();
        assert_eq!(
            git.root().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn failed_command_carries_stderr() {
        let dir = TempDir::new().unwrap();
        test_repo::init(dir.path());
        let git = Git::open(dir.path()).unwrap();
        let err = git.run(["rev-parse", "--verify", "no-such-ref"]).unwrap_err();
        assert!(matches!(err, TurnstileError::GitFailed { .. }));
    }

    #[test]
    fn commit_tree_works_without_identity() {
        let dir = TempDir::new().unwrap();
        test_repo::git(dir.path(), &["init", "-q"]);
        let git = Git::open(dir.path()).unwrap();
        let tree = git.run(["write-tree"]).unwrap();
        let commit = git.commit_tree(&tree, &[], "msg").unwrap();
        assert!(git.object_exists(&commit, "commit"));
    }
}
