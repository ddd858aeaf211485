//! Git worktree management for parallel agent execution.
//!
//! Each worker mutates its own worktree (a separate checkout sharing the main
//! repository's object store) so agents never contend on files. Worktrees
//! live under `<repo>/.worktrees/<sanitized-branch>`; per-agent worktrees are
//! the only mutation surface, the main checkout is never written by agents.
//!
//! Git serialises worktree operations through a repository-level lock file,
//! so all mutating git calls here go through an internal mutex.

pub mod merge;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The repository path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// Worktree allocation failed.
    #[error("worktree create failed: {0}")]
    Create(String),

    /// Worktree removal failed.
    #[error("worktree remove failed: {0}")]
    Remove(String),

    /// A git sub-process could not be spawned.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git sub-process exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Porcelain output could not be parsed.
    #[error("failed to parse worktree list output: {0}")]
    Parse(String),
}

/// Information about a single worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// Agent currently owning this worktree, if any.
    pub agent_id: Option<String>,
    /// Whether this is the main checkout.
    pub is_main: bool,
}

/// Replace the characters git branch names allow but filesystems dislike.
/// Only `/` and spaces are sanitized; branch naming is otherwise free-form.
pub fn sanitize_branch(branch: &str) -> String {
    branch.replace(['/', ' '], "-")
}

/// Manages worktrees for a repository and the `agent -> worktree` ownership
/// map. One active worktree per agent: creating a new worktree for an agent
/// replaces its previous association.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    agent_map: Mutex<HashMap<String, PathBuf>>,
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Create a manager rooted at `repo_path`. Worktrees default to
    /// `<repo>/.worktrees/`; pass `worktree_base` to override.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| repo_path.join(".worktrees"));

        Ok(Self {
            repo_path,
            worktree_base,
            agent_map: Mutex::new(HashMap::new()),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Create (or reuse) the worktree for `branch_name` and associate it
    /// with `agent_id`. The branch is forked from `base_branch` when it does
    /// not exist yet.
    pub fn create(
        &self,
        branch_name: &str,
        agent_id: Option<&str>,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let worktree_path = self.worktree_base.join(sanitize_branch(branch_name));

        if worktree_path.exists() {
            tracing::info!(
                path = %worktree_path.display(),
                branch = branch_name,
                "worktree path exists, reusing"
            );
            self.associate(agent_id, &worktree_path);
            return Ok(worktree_path);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::Create(format!(
                    "failed to create worktree base {}: {e}",
                    self.worktree_base.display()
                ))
            })?;
        }

        // Fork the branch from base when missing. A missing base falls back
        // to HEAD so fresh repositories still work.
        if !self.branch_exists(branch_name)? {
            let start = if self.branch_exists(base_branch)? {
                base_branch.to_string()
            } else {
                "HEAD".to_string()
            };
            let output = self.git(&["branch", branch_name, start.as_str()])?;
            if !output.status.success() {
                return Err(WorktreeError::Create(format!(
                    "failed to fork branch {branch_name} from {start}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        let output = Command::new("git")
            .args(["worktree", "add"])
            .arg(&worktree_path)
            .arg(branch_name)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::Create(stderr.trim().to_string()));
        }

        self.associate(agent_id, &worktree_path);

        tracing::info!(
            path = %worktree_path.display(),
            branch = branch_name,
            agent_id = agent_id.unwrap_or("-"),
            "worktree created"
        );

        Ok(worktree_path)
    }

    /// Remove a worktree. When git refuses and the directory is still
    /// present, the directory is force-deleted and stale references pruned.
    /// Idempotent: removing an unknown path is a no-op.
    pub fn remove(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut args = vec!["worktree".to_string(), "remove".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(path.display().to_string());

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "git worktree remove failed, force-removing directory"
                );
                std::fs::remove_dir_all(path)
                    .map_err(|e| WorktreeError::Remove(format!("{e}: {stderr}")))?;
                let _ = self.prune_locked();
            } else if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::Remove(stderr.trim().to_string()));
            }
        }

        let mut agents = self.agent_map.lock().unwrap_or_else(|e| e.into_inner());
        agents.retain(|_, p| p != path);

        tracing::info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Enumerate worktrees from `git worktree list --porcelain`, annotated
    /// with agent ownership and the main-checkout flag.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = self.git(&["worktree", "list", "--porcelain"])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let agents = self.agent_map.lock().unwrap_or_else(|e| e.into_inner());
        let repo_canonical = self
            .repo_path
            .canonicalize()
            .unwrap_or_else(|_| self.repo_path.clone());

        parse_porcelain(&stdout).map(|entries| {
            entries
                .into_iter()
                .map(|(path, branch)| {
                    let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                    let agent_id = agents
                        .iter()
                        .find(|(_, p)| {
                            p.canonicalize().unwrap_or_else(|_| (*p).clone()) == canonical
                        })
                        .map(|(id, _)| id.clone());
                    WorktreeInfo {
                        is_main: canonical == repo_canonical,
                        path,
                        branch,
                        agent_id,
                    }
                })
                .collect()
        })
    }

    /// Worktree currently owned by an agent.
    pub fn worktree_for(&self, agent_id: &str) -> Option<PathBuf> {
        let agents = self.agent_map.lock().unwrap_or_else(|e| e.into_inner());
        agents.get(agent_id).cloned()
    }

    /// Remove every non-main worktree, prune stale references, and clear
    /// the ownership map.
    pub fn cleanup_all(&self) -> Result<usize, WorktreeError> {
        let worktrees = self.list()?;
        let mut removed = 0;
        for wt in worktrees.iter().filter(|wt| !wt.is_main) {
            self.remove(&wt.path, true)?;
            removed += 1;
        }
        self.prune()?;
        let mut agents = self.agent_map.lock().unwrap_or_else(|e| e.into_inner());
        agents.clear();
        tracing::info!(removed, "cleaned up all worktrees");
        Ok(removed)
    }

    /// Prune references to worktrees whose directories disappeared.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.prune_locked()
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let refname = format!("refs/heads/{branch_name}");
        let output = self.git(&["rev-parse", "--verify", refname.as_str()])?;
        Ok(output.status.success())
    }

    fn prune_locked(&self) -> Result<(), WorktreeError> {
        let output = self.git(&["worktree", "prune"])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn associate(&self, agent_id: Option<&str>, path: &Path) {
        if let Some(agent_id) = agent_id {
            let mut agents = self.agent_map.lock().unwrap_or_else(|e| e.into_inner());
            agents.insert(agent_id.to_string(), path.to_path_buf());
        }
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune_locked();
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }
}

/// Parse `git worktree list --porcelain` into `(path, branch)` pairs.
///
/// Blocks are blank-line separated:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// Detached or bare entries yield `branch: None`.
fn parse_porcelain(output: &str) -> Result<Vec<(PathBuf, Option<String>)>, WorktreeError> {
    let mut entries = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(path) = current_path.take() {
                entries.push((path, current_branch.take()));
            }
            current_branch = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
        // `HEAD`, `bare`, `detached`, `prunable` lines are ignored.
    }
    if let Some(path) = current_path {
        entries.push((path, current_branch));
    }

    Ok(entries)
}
