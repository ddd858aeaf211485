//! Three-way merge with conflict detection and automated resolution.
//!
//! When an agent's branch lands, it is merged into the target branch with
//! `--no-ff`. Conflicted files are enumerated, their conflict hunks parsed,
//! and a per-file strategy applied. A merge that cannot be fully resolved is
//! aborted so the target branch stays untouched.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from merge operations.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Checking out the target branch failed.
    #[error("failed to checkout {branch}: {stderr}")]
    Checkout { branch: String, stderr: String },

    /// The merge reported conflicts. Carries the conflicted file list.
    #[error("merge conflicts in {} file(s)", .files.len())]
    Conflict { files: Vec<String> },

    /// A git sub-process could not be spawned.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git sub-process exited non-zero outside the conflict path.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A conflicted file could not be read or written.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Strategies for resolving a conflicted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Keep the target branch's side.
    Ours,
    /// Keep the source branch's side. Default for agent branches: the
    /// agent's change is the intent of the merge.
    Theirs,
    /// Keep both sides, ours then theirs. Syntactically unsafe; callers
    /// must opt in explicitly, it is never chosen automatically.
    Combined,
}

/// Outcome of attempting a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge completed without conflicts.
    Clean,
    /// The merge stopped on conflicts in the listed files. The merge is
    /// left in progress for resolution (or abort).
    Conflicts(Vec<String>),
}

impl MergeOutcome {
    /// Treat conflicts as a hard error, for callers that will not attempt
    /// resolution.
    pub fn into_result(self) -> Result<(), MergeError> {
        match self {
            MergeOutcome::Clean => Ok(()),
            MergeOutcome::Conflicts(files) => Err(MergeError::Conflict { files }),
        }
    }
}

/// One conflict hunk parsed from `<<<<<<<` / `=======` / `>>>>>>>` markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictHunk {
    pub ours: Vec<String>,
    pub theirs: Vec<String>,
}

/// Resolves merges in the main checkout.
pub struct MergeResolver {
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl MergeResolver {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Merge `source_branch` into `target_branch` with `--no-ff`.
    ///
    /// A clean merge returns [`MergeOutcome::Clean`]. Conflicts leave the
    /// merge in progress and return the conflicted files so the caller can
    /// resolve or abort.
    pub fn merge_branch(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let checkout = self.git(&["checkout", target_branch])?;
        if !checkout.status.success() {
            return Err(MergeError::Checkout {
                branch: target_branch.to_string(),
                stderr: String::from_utf8_lossy(&checkout.stderr).trim().to_string(),
            });
        }

        let merge = self.git(&["merge", "--no-ff", source_branch])?;
        if merge.status.success() {
            tracing::info!(source_branch, target_branch, "merge completed cleanly");
            return Ok(MergeOutcome::Clean);
        }

        let files = self.conflicted_files_locked()?;
        if files.is_empty() {
            // Non-conflict failure (e.g. unknown branch).
            return Err(MergeError::GitExit {
                command: format!("merge --no-ff {source_branch}"),
                code: merge.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&merge.stderr).trim().to_string(),
            });
        }

        tracing::warn!(
            source_branch,
            target_branch,
            conflicts = files.len(),
            "merge stopped on conflicts"
        );
        Ok(MergeOutcome::Conflicts(files))
    }

    /// Files currently in the unmerged state.
    pub fn conflicted_files(&self) -> Result<Vec<String>, MergeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.conflicted_files_locked()
    }

    fn conflicted_files_locked(&self) -> Result<Vec<String>, MergeError> {
        let output = self.git(&["diff", "--name-only", "--diff-filter=U"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Parse the conflict hunks in a file, if any.
    pub fn parse_conflicts(&self, file: &str) -> Result<Vec<ConflictHunk>, MergeError> {
        let full_path = self.repo_path.join(file);
        let content = std::fs::read_to_string(&full_path).map_err(|source| MergeError::Io {
            path: full_path,
            source,
        })?;
        Ok(parse_conflict_hunks(&content))
    }

    /// Resolve every conflict hunk in `file` with `strategy`, rewrite the
    /// file and stage it. Returns the number of hunks resolved.
    ///
    /// Running this on a file without conflict markers rewrites identical
    /// bytes, so resolution is idempotent.
    pub fn auto_resolve(&self, file: &str, strategy: MergeStrategy) -> Result<usize, MergeError> {
        let full_path = self.repo_path.join(file);
        let content = std::fs::read_to_string(&full_path).map_err(|source| MergeError::Io {
            path: full_path.clone(),
            source,
        })?;

        let (resolved, hunks) = resolve_content(&content, strategy);
        std::fs::write(&full_path, resolved).map_err(|source| MergeError::Io {
            path: full_path,
            source,
        })?;

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.git(&["add", file])?;
        if !output.status.success() {
            return Err(MergeError::GitExit {
                command: format!("add {file}"),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::info!(file, ?strategy, hunks, "conflict auto-resolved");
        Ok(hunks)
    }

    /// Conclude an in-progress merge after all conflicts were staged.
    pub fn commit_merge(&self, message: &str) -> Result<(), MergeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.git(&["commit", "-m", message])?;
        if !output.status.success() {
            return Err(MergeError::GitExit {
                command: "commit".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Abort the in-progress merge, restoring the pre-merge state.
    pub fn abort_merge(&self) -> Result<(), MergeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = self.git(&["merge", "--abort"])?;
        if !output.status.success() {
            return Err(MergeError::GitExit {
                command: "merge --abort".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!("merge aborted");
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output, MergeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| MergeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }
}

/// Scan a file's lines for conflict hunks.
fn parse_conflict_hunks(content: &str) -> Vec<ConflictHunk> {
    let mut hunks = Vec::new();
    let mut ours: Vec<String> = Vec::new();
    let mut theirs: Vec<String> = Vec::new();
    let mut section = Section::None;

    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            section = Section::Ours;
            ours.clear();
            theirs.clear();
        } else if line.starts_with("=======") && section == Section::Ours {
            section = Section::Theirs;
        } else if line.starts_with(">>>>>>>") && section == Section::Theirs {
            hunks.push(ConflictHunk {
                ours: std::mem::take(&mut ours),
                theirs: std::mem::take(&mut theirs),
            });
            section = Section::None;
        } else {
            match section {
                Section::Ours => ours.push(line.to_string()),
                Section::Theirs => theirs.push(line.to_string()),
                Section::None => {}
            }
        }
    }

    hunks
}

#[derive(PartialEq, Clone, Copy)]
enum Section {
    None,
    Ours,
    Theirs,
}

/// Rewrite `content` with every conflict hunk replaced per `strategy`.
/// Returns the resolved text and the number of hunks replaced. Content
/// without markers passes through byte-identical.
fn resolve_content(content: &str, strategy: MergeStrategy) -> (String, usize) {
    let mut out: Vec<&str> = Vec::new();
    let mut ours: Vec<&str> = Vec::new();
    let mut theirs: Vec<&str> = Vec::new();
    let mut section = Section::None;
    let mut hunks = 0usize;

    for line in content.lines() {
        match section {
            Section::None => {
                if line.starts_with("<<<<<<<") {
                    section = Section::Ours;
                    ours.clear();
                    theirs.clear();
                } else {
                    out.push(line);
                }
            }
            Section::Ours => {
                if line.starts_with("=======") {
                    section = Section::Theirs;
                } else {
                    ours.push(line);
                }
            }
            Section::Theirs => {
                if line.starts_with(">>>>>>>") {
                    hunks += 1;
                    match strategy {
                        MergeStrategy::Ours => out.extend(ours.iter().copied()),
                        MergeStrategy::Theirs => out.extend(theirs.iter().copied()),
                        MergeStrategy::Combined => {
                            out.extend(ours.iter().copied());
                            out.extend(theirs.iter().copied());
                        }
                    }
                    section = Section::None;
                } else {
                    theirs.push(line);
                }
            }
        }
    }

    let mut resolved = out.join("\n");
    if content.ends_with('\n') && !resolved.is_empty() {
        resolved.push('\n');
    }
    (resolved, hunks)
}
