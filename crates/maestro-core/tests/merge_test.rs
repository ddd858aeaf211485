//! Tests for worktree-based parallel execution and merge resolution.

use maestro_core::worktree::merge::{MergeOutcome, MergeResolver, MergeStrategy};
use maestro_core::worktree::WorktreeManager;
use maestro_test_utils::{commit_file, create_temp_repo, git};

// ===========================================================================
// Clean merges
// ===========================================================================

#[test]
fn non_overlapping_changes_merge_cleanly() {
    let (_dir, repo) = create_temp_repo();
    let mgr = WorktreeManager::new(&repo, None).unwrap();
    let resolver = MergeResolver::new(&repo);

    let wt = mgr.create("feat/new-file", Some("backend-1"), "main").unwrap();
    commit_file(&wt, "feature.txt", "new feature\n", "Add feature");
    mgr.remove(&wt, true).unwrap();

    let outcome = resolver.merge_branch("feat/new-file", "main").unwrap();
    assert_eq!(outcome, MergeOutcome::Clean);
    assert!(repo.join("feature.txt").exists());
}

// ===========================================================================
// Conflict detection and auto-resolution
// ===========================================================================

/// Build the §-classic conflict: both sides edit line 3 of app.py.
fn conflicted_repo() -> (tempfile::TempDir, std::path::PathBuf, WorktreeManager) {
    let (dir, repo) = create_temp_repo();
    commit_file(
        &repo,
        "app.py",
        "line 1\nline 2\nline 3\nline 4\n",
        "Add app.py",
    );

    let mgr = WorktreeManager::new(&repo, None).unwrap();
    let wt = mgr.create("feat/a", Some("backend-1"), "main").unwrap();
    commit_file(
        &wt,
        "app.py",
        "line 1\nline 2\nX\nline 4\n",
        "Agent edit: line 3 -> X",
    );
    mgr.remove(&wt, true).unwrap();

    // Meanwhile main moves the same line to Y.
    commit_file(
        &repo,
        "app.py",
        "line 1\nline 2\nY\nline 4\n",
        "Main edit: line 3 -> Y",
    );

    (dir, repo, mgr)
}

#[test]
fn conflicting_edit_is_detected_and_resolved_theirs() {
    let (_dir, repo, _mgr) = conflicted_repo();
    let resolver = MergeResolver::new(&repo);

    let outcome = resolver.merge_branch("feat/a", "main").unwrap();
    let files = match outcome {
        MergeOutcome::Conflicts(files) => files,
        other => panic!("expected conflicts, got {other:?}"),
    };
    assert_eq!(files, vec!["app.py".to_string()]);

    let hunks = resolver.parse_conflicts("app.py").unwrap();
    assert_eq!(hunks.len(), 1);
    assert_eq!(hunks[0].ours, vec!["Y"]);
    assert_eq!(hunks[0].theirs, vec!["X"]);

    let resolved = resolver.auto_resolve("app.py", MergeStrategy::Theirs).unwrap();
    assert_eq!(resolved, 1);

    let content = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(content, "line 1\nline 2\nX\nline 4\n");

    // Second pass over the already-resolved file changes nothing.
    resolver.auto_resolve("app.py", MergeStrategy::Theirs).unwrap();
    let again = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(again, content);

    resolver.commit_merge("Merge feat/a into main").unwrap();
    assert!(resolver.conflicted_files().unwrap().is_empty());
}

#[test]
fn ours_strategy_keeps_the_target_side() {
    let (_dir, repo, _mgr) = conflicted_repo();
    let resolver = MergeResolver::new(&repo);

    resolver.merge_branch("feat/a", "main").unwrap();
    resolver.auto_resolve("app.py", MergeStrategy::Ours).unwrap();

    let content = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(content, "line 1\nline 2\nY\nline 4\n");
}

#[test]
fn abort_restores_the_pre_merge_state() {
    let (_dir, repo, _mgr) = conflicted_repo();
    let resolver = MergeResolver::new(&repo);

    resolver.merge_branch("feat/a", "main").unwrap();
    assert!(!resolver.conflicted_files().unwrap().is_empty());

    resolver.abort_merge().unwrap();
    assert!(resolver.conflicted_files().unwrap().is_empty());

    let content = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(content, "line 1\nline 2\nY\nline 4\n", "target untouched");
}

#[test]
fn strict_callers_see_conflicts_as_errors() {
    let (_dir, repo, _mgr) = conflicted_repo();
    let resolver = MergeResolver::new(&repo);

    let err = resolver
        .merge_branch("feat/a", "main")
        .unwrap()
        .into_result()
        .unwrap_err();
    match err {
        maestro_core::worktree::merge::MergeError::Conflict { files } => {
            assert_eq!(files, vec!["app.py".to_string()]);
        }
        other => panic!("expected Conflict, got {other}"),
    }
    resolver.abort_merge().unwrap();
}

#[test]
fn merging_unknown_branch_is_an_error_not_a_conflict() {
    let (_dir, repo) = create_temp_repo();
    let resolver = MergeResolver::new(&repo);
    assert!(resolver.merge_branch("does/not-exist", "main").is_err());
}

// ===========================================================================
// Worktree isolation during parallel work
// ===========================================================================

#[test]
fn two_agents_work_in_parallel_then_land_sequentially() {
    let (_dir, repo) = create_temp_repo();
    let mgr = WorktreeManager::new(&repo, None).unwrap();
    let resolver = MergeResolver::new(&repo);

    let wt_a = mgr.create("feat/alpha", Some("backend-1"), "main").unwrap();
    let wt_b = mgr.create("feat/beta", Some("backend-2"), "main").unwrap();
    assert_ne!(wt_a, wt_b);

    commit_file(&wt_a, "alpha.txt", "alpha\n", "Alpha work");
    commit_file(&wt_b, "beta.txt", "beta\n", "Beta work");

    // Neither agent's file leaks into the other's tree or into main.
    assert!(!wt_a.join("beta.txt").exists());
    assert!(!wt_b.join("alpha.txt").exists());
    assert!(!repo.join("alpha.txt").exists());

    mgr.remove(&wt_a, true).unwrap();
    mgr.remove(&wt_b, true).unwrap();

    assert_eq!(resolver.merge_branch("feat/alpha", "main").unwrap(), MergeOutcome::Clean);
    assert_eq!(resolver.merge_branch("feat/beta", "main").unwrap(), MergeOutcome::Clean);
    assert!(repo.join("alpha.txt").exists());
    assert!(repo.join("beta.txt").exists());
}

#[test]
fn sanitized_directory_names_for_slashed_branches() {
    let (_dir, repo) = create_temp_repo();
    let mgr = WorktreeManager::new(&repo, None).unwrap();

    let path = mgr
        .create("agents/backend/one", Some("backend-1"), "main")
        .unwrap();
    assert!(path.ends_with(".worktrees/agents-backend-one"));
    assert!(path.exists());

    // The branch name itself keeps its original form.
    git(&repo, &["rev-parse", "--verify", "refs/heads/agents/backend/one"]);
}
