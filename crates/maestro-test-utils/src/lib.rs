//! Shared test utilities for maestro integration tests.
//!
//! Provides temporary git repositories for worktree/merge tests and a
//! scripted planner that returns canned task breakdowns without a model
//! call.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tempfile::TempDir;

use maestro_core::orchestrator::Planner;

/// Create a temporary git repository with an initial commit on `main`.
/// The returned `TempDir` must be held alive for the repository's lifetime.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    git(&repo_path, &["init", "-b", "main"]);
    git(&repo_path, &["config", "user.email", "test@maestro.dev"]);
    git(&repo_path, &["config", "user.name", "Maestro Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("failed to write README");
    git(&repo_path, &["add", "."]);
    git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Run a git command in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write `content` to `file` in `dir` and commit it.
pub fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(dir.join(file), content).expect("failed to write file");
    git(dir, &["add", file]);
    git(dir, &["commit", "-m", message]);
}

/// Planner stub returning a fixed reply.
pub struct ScriptedPlanner {
    reply: String,
}

impl ScriptedPlanner {
    /// Return this exact reply for every goal.
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }

    /// A planner producing a single write-code task with the given name.
    pub fn single_task(name: &str) -> Self {
        let doc = serde_json::json!({
            "tasks": [
                {
                    "name": name,
                    "description": format!("Implement: {name}"),
                    "type": "write_code",
                    "priority": 5,
                    "complexity": 3
                }
            ]
        });
        Self::new(doc.to_string())
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _goal: &str, _context: &Map<String, Value>) -> anyhow::Result<String> {
        Ok(self.reply.clone())
    }
}

/// Planner stub that always fails, for decomposition error paths.
pub struct FailingPlanner;

#[async_trait]
impl Planner for FailingPlanner {
    async fn plan(&self, _goal: &str, _context: &Map<String, Value>) -> anyhow::Result<String> {
        anyhow::bail!("planner collaborator unavailable")
    }
}
