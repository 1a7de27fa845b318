use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::WorkspacePolicy;
use crate::lock::FifoMutex;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("git {op} failed: {detail}")]
    Git { op: String, detail: String },
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchStatus {
    /// Commits on the feature branch not on base (`count(base..branch)`).
    pub ahead: u64,
    pub clean: bool,
}

/// Owns the shared repository and one worktree per track. Everything that
/// touches shared repository metadata runs under `git_mutex`; the
/// orchestrator's merge-verify lock is a separate, longer-held concern.
pub struct WorkspaceManager {
    project_dir: PathBuf,
    base_branch: String,
    policy: WorkspacePolicy,
    git_mutex: FifoMutex,
}

impl WorkspaceManager {
    pub fn new(project_dir: impl Into<PathBuf>, base_branch: &str, policy: WorkspacePolicy) -> Self {
        Self {
            project_dir: project_dir.into(),
            base_branch: base_branch.into(),
            policy,
            git_mutex: FifoMutex::new(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn worktree_path(&self, track: &str) -> PathBuf {
        self.project_dir.join(&self.policy.worktrees_dir).join(track)
    }

    /// Bring the shared repository to a known state: stale worktrees pruned,
    /// leftover modifications stashed, base branch checked out and up to
    /// date, preserved files intact.
    pub async fn init(&self) -> Result<(), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let preserved = self.snapshot_preserved();

        self.git(&self.project_dir, &["worktree", "prune"], "worktree prune")?;

        // Only tracked modifications block branch operations; untracked
        // runtime files (the .autodev dir, logs) are left alone.
        if self.tracked_dirty(&self.project_dir)? {
            info!("stashing leftover modifications");
            self.restore_tracked_preserved();
            if self.tracked_dirty(&self.project_dir)? {
                self.git(&self.project_dir, &["stash"], "stash")?;
            }
        }

        if !self.branch_exists(&self.base_branch)? {
            info!(branch = %self.base_branch, "creating base branch from HEAD");
            self.git(
                &self.project_dir,
                &["branch", &self.base_branch],
                "branch create",
            )?;
        }
        self.git(
            &self.project_dir,
            &["checkout", &self.base_branch],
            "checkout base",
        )?;
        if self.has_upstream(&self.base_branch) {
            if let Err(e) = self.git(&self.project_dir, &["pull"], "pull") {
                warn!(error = %e, "pull failed during init, continuing with local state");
            }
        }

        self.restore_preserved(preserved);
        Ok(())
    }

    /// Create (or re-attach) the track's worktree on the feature branch.
    /// Returns the branch name and the worktree path.
    pub async fn prepare_branch(
        &self,
        track: &str,
        feature_id: u64,
        feature_name: &str,
        is_retry: bool,
    ) -> Result<(String, PathBuf), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let branch = branch_name(feature_id, feature_name);
        let worktree = self.worktree_path(track);
        info!(track, branch = %branch, retry = is_retry, "preparing worktree");

        self.remove_worktree_inner(&worktree);

        if let Some(parent) = worktree.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let worktree_str = worktree.to_string_lossy().into_owned();
        if self.branch_exists(&branch)? {
            self.git(
                &self.project_dir,
                &["worktree", "add", &worktree_str, &branch],
                "worktree add",
            )?;
        } else {
            self.git(
                &self.project_dir,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    &worktree_str,
                    &self.base_branch,
                ],
                "worktree add -b",
            )?;
        }

        self.post_setup(track, &worktree)?;
        Ok((branch, worktree))
    }

    /// Symlinks, file copies, metadata hygiene, and the optional generated
    /// setup script for a freshly added worktree.
    fn post_setup(&self, track: &str, worktree: &Path) -> Result<(), WorkspaceError> {
        // Relative links back to the project root, so pre-populated
        // dependency trees are shared, and the link still resolves when the
        // worktree is bind-mounted at a different absolute path.
        let to_root = relative_to_root(&self.policy.worktrees_dir);
        for dir in &self.policy.symlink_dirs {
            let link = worktree.join(dir);
            if link.exists() || !self.project_dir.join(dir).exists() {
                continue;
            }
            if let Some(parent) = link.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let depth = Path::new(dir).components().count().saturating_sub(1);
            let mut target = PathBuf::new();
            for _ in 0..depth {
                target.push("..");
            }
            let target = target.join(&to_root).join(dir);
            std::os::unix::fs::symlink(&target, &link)?;
            debug!(link = %link.display(), target = %target.display(), "linked");
        }

        for file in &self.policy.copy_files {
            let src = self.project_dir.join(file);
            if !src.exists() {
                continue;
            }
            let dst = worktree.join(file);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }

        // Worktree admin dir: make sure nothing left a stale index lock.
        let admin = self.project_dir.join(".git/worktrees").join(track);
        let stale_lock = admin.join("index.lock");
        if stale_lock.exists() {
            warn!(path = %stale_lock.display(), "removing stale index lock");
            let _ = std::fs::remove_file(&stale_lock);
        }

        if let (Some(script), Some(docker)) =
            (&self.policy.setup_script, &self.policy.docker)
        {
            let body = format!(
                "#!/bin/sh\n# Generated per-worktree setup for container runs.\nset -e\nexport COMPOSE_FILE={}\ndocker compose --project-name {} up -d\n",
                if docker.compose_file.is_empty() {
                    "docker-compose.yml"
                } else {
                    &docker.compose_file
                },
                track,
            );
            std::fs::write(worktree.join(script), body)?;
            self.append_to_exclude(script)?;
        }
        Ok(())
    }

    pub async fn cleanup_worktree(&self, track: &str) -> Result<(), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let worktree = self.worktree_path(track);
        self.remove_worktree_inner(&worktree);
        self.git(&self.project_dir, &["worktree", "prune"], "worktree prune")?;
        Ok(())
    }

    /// Stage and commit everything, untracked included. Returns false when
    /// the tree was already clean.
    pub async fn commit_all_if_dirty(
        &self,
        worktree: &Path,
        message: &str,
    ) -> Result<bool, WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        if self.status_clean(worktree)? {
            return Ok(false);
        }
        self.git(worktree, &["add", "-A"], "add")?;
        self.git(worktree, &["commit", "-m", message], "commit")?;
        Ok(true)
    }

    pub async fn get_branch_status(
        &self,
        branch: &str,
        worktree: &Path,
    ) -> Result<BranchStatus, WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let range = format!("{}..{}", self.base_branch, branch);
        let count = self.git(worktree, &["rev-list", "--count", &range], "rev-list")?;
        let ahead = count.trim().parse::<u64>().unwrap_or(0);
        let clean = self.status_clean(worktree)?;
        Ok(BranchStatus { ahead, clean })
    }

    /// Merge the latest base into the feature branch, inside its worktree.
    /// A conflict aborts the merge and surfaces; the worktree is never left
    /// mid-merge.
    pub async fn update_feature_branch(&self, worktree: &Path) -> Result<(), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let preserved = snapshot_files(worktree, &self.policy.preserve_files);
        self.checkout_paths(worktree, &self.policy.preserve_files);

        let result = self.git(
            worktree,
            &["merge", &self.base_branch, "--no-edit"],
            "merge base into feature",
        );
        if let Err(e) = result {
            let _ = self.git(worktree, &["merge", "--abort"], "merge abort");
            restore_files(worktree, preserved);
            return Err(WorkspaceError::MergeConflict(e.to_string()));
        }
        restore_files(worktree, preserved);
        Ok(())
    }

    /// Merge a feature branch into base in the shared repository. Returns
    /// the pre-merge commit so callers that want to revert can.
    pub async fn merge_locally(&self, branch: &str) -> Result<String, WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let preserved = self.snapshot_preserved();
        self.restore_tracked_preserved();

        self.git(
            &self.project_dir,
            &["checkout", &self.base_branch],
            "checkout base",
        )?;
        if self.has_upstream(&self.base_branch) {
            if let Err(e) = self.git(&self.project_dir, &["pull"], "pull") {
                warn!(error = %e, "pull before merge failed, merging local state");
            }
        }
        let pre_merge = self
            .git(&self.project_dir, &["rev-parse", "HEAD"], "rev-parse")?
            .trim()
            .to_string();

        let result = self.git(
            &self.project_dir,
            &["merge", branch, "--no-ff", "--no-edit"],
            "merge feature into base",
        );
        if let Err(e) = result {
            let _ = self.git(&self.project_dir, &["merge", "--abort"], "merge abort");
            self.restore_preserved(preserved);
            return Err(WorkspaceError::MergeConflict(format!(
                "merging {branch} into {}: {e}",
                self.base_branch
            )));
        }
        self.restore_preserved(preserved);
        info!(branch, pre_merge = %pre_merge, "merged into base");
        Ok(pre_merge)
    }

    /// Push base to its remote. A repository without a remote is a no-op.
    pub async fn push_base_branch(&self) -> Result<(), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        if !self.has_remote() {
            return Ok(());
        }
        self.git(
            &self.project_dir,
            &["push", "origin", &self.base_branch],
            "push",
        )?;
        Ok(())
    }

    /// Reset base to a pre-merge commit. Not called by the scheduler itself;
    /// failed verifications deliberately leave merged code in place.
    pub async fn revert_merge(&self, pre_merge_commit: &str) -> Result<(), WorkspaceError> {
        let _guard = self.git_mutex.lock().await;
        let preserved = self.snapshot_preserved();
        self.git(
            &self.project_dir,
            &["checkout", &self.base_branch],
            "checkout base",
        )?;
        self.git(
            &self.project_dir,
            &["reset", "--hard", pre_merge_commit],
            "reset",
        )?;
        self.restore_preserved(preserved);
        Ok(())
    }

    // ----- internals -----

    fn git(&self, dir: &Path, args: &[&str], op: &str) -> Result<String, WorkspaceError> {
        let output = Command::new("git").args(args).current_dir(dir).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorkspaceError::Git {
                op: op.into(),
                detail: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn status_clean(&self, dir: &Path) -> Result<bool, WorkspaceError> {
        let out = self.git(dir, &["status", "--porcelain"], "status")?;
        Ok(out.trim().is_empty())
    }

    fn tracked_dirty(&self, dir: &Path) -> Result<bool, WorkspaceError> {
        let out = self.git(dir, &["status", "--porcelain", "-uno"], "status")?;
        Ok(!out.trim().is_empty())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let refname = format!("refs/heads/{branch}");
        Ok(Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &refname])
            .current_dir(&self.project_dir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false))
    }

    fn has_remote(&self) -> bool {
        Command::new("git")
            .args(["remote"])
            .current_dir(&self.project_dir)
            .output()
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
    }

    fn has_upstream(&self, branch: &str) -> bool {
        let refspec = format!("{branch}@{{upstream}}");
        Command::new("git")
            .args(["rev-parse", "--abbrev-ref", &refspec])
            .current_dir(&self.project_dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn remove_worktree_inner(&self, worktree: &Path) {
        if !worktree.exists() {
            return;
        }
        let worktree_str = worktree.to_string_lossy().into_owned();
        let _ = self.git(
            &self.project_dir,
            &["worktree", "remove", "--force", &worktree_str],
            "worktree remove",
        );
        // A broken worktree (deleted admin dir) survives remove; scrub it.
        if worktree.exists() {
            let _ = std::fs::remove_dir_all(worktree);
        }
    }

    fn snapshot_preserved(&self) -> HashMap<PathBuf, Vec<u8>> {
        snapshot_files(&self.project_dir, &self.policy.preserve_files)
    }

    fn restore_preserved(&self, snapshot: HashMap<PathBuf, Vec<u8>>) {
        restore_files(&self.project_dir, snapshot)
    }

    /// Drop working-tree edits to preserved paths so git operations see a
    /// clean tree. The bytes were snapshotted first.
    fn restore_tracked_preserved(&self) {
        self.checkout_paths(&self.project_dir, &self.policy.preserve_files);
    }

    fn checkout_paths(&self, dir: &Path, paths: &[String]) {
        for path in paths {
            // Untracked preserved files make checkout fail; that is fine.
            let _ = self.git(dir, &["checkout", "--", path], "checkout path");
        }
    }

    fn append_to_exclude(&self, name: &str) -> Result<(), WorkspaceError> {
        let exclude = self.project_dir.join(".git/info/exclude");
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if !existing.lines().any(|l| l == name) {
            std::fs::write(&exclude, format!("{existing}{name}\n"))?;
        }
        Ok(())
    }
}

/// `feature/<id>-<slug>`: lowercase, runs of non-alphanumerics collapse to
/// one hyphen, no leading or trailing hyphen, slug capped at 50 chars.
pub fn branch_name(feature_id: u64, feature_name: &str) -> String {
    format!("feature/{feature_id}-{}", slugify(feature_name))
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_hyphen = true;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    slug.truncate(50);
    slug.trim_matches('-').to_string()
}

fn relative_to_root(worktrees_dir: &str) -> PathBuf {
    // A worktree lives at <root>/<worktrees_dir>/<track>; walk back up.
    let depth = Path::new(worktrees_dir).components().count() + 1;
    let mut path = PathBuf::new();
    for _ in 0..depth {
        path.push("..");
    }
    path
}

fn snapshot_files(root: &Path, files: &[String]) -> HashMap<PathBuf, Vec<u8>> {
    let mut snapshot = HashMap::new();
    for file in files {
        let path = root.join(file);
        if let Ok(bytes) = std::fs::read(&path) {
            snapshot.insert(path, bytes);
        }
    }
    snapshot
}

fn restore_files(_root: &Path, snapshot: HashMap<PathBuf, Vec<u8>>) {
    for (path, bytes) in snapshot {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!(path = %path.display(), error = %e, "failed to restore preserved file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    fn init_repo(dir: &Path) {
        git_in(dir, &["init", "--initial-branch", "main"]);
        git_in(dir, &["config", "user.email", "test@test.com"]);
        git_in(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        std::fs::write(dir.join("features.json"), "[]\n").unwrap();
        git_in(dir, &["add", "-A"]);
        git_in(dir, &["commit", "-m", "init"]);
    }

    fn manager(dir: &Path) -> WorkspaceManager {
        WorkspaceManager::new(dir, "main", WorkspacePolicy::default())
    }

    #[test]
    fn slug_shape() {
        assert_eq!(slugify("Add User Login!"), "add-user-login");
        assert_eq!(slugify("  --weird--  input  "), "weird-input");
        assert_eq!(slugify("CamelCase and 123"), "camelcase-and-123");

        let long = slugify(&"word ".repeat(30));
        assert!(long.len() <= 50);
        assert!(!long.starts_with('-') && !long.ends_with('-'));
        assert!(!long.contains("--"));
        assert!(long.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(branch_name(7, "Fix the thing"), "feature/7-fix-the-thing");
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();
        ws.init().await.unwrap();
    }

    #[tokio::test]
    async fn init_creates_missing_base_branch() {
        let dir = tempfile::tempdir().unwrap();
        git_in(dir.path(), &["init", "--initial-branch", "trunk"]);
        git_in(dir.path(), &["config", "user.email", "t@t.com"]);
        git_in(dir.path(), &["config", "user.name", "T"]);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        git_in(dir.path(), &["add", "-A"]);
        git_in(dir.path(), &["commit", "-m", "init"]);

        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let head = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), "main");
    }

    #[tokio::test]
    async fn prepare_branch_creates_worktree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (branch, worktree) = ws
            .prepare_branch("alpha", 3, "Add login page", false)
            .await
            .unwrap();
        assert_eq!(branch, "feature/3-add-login-page");
        assert!(worktree.ends_with(".autodev/worktrees/alpha"));
        assert!(worktree.join("README.md").exists());

        // Re-preparing on the now-existing branch re-attaches
        let (branch2, _) = ws
            .prepare_branch("alpha", 3, "Add login page", true)
            .await
            .unwrap();
        assert_eq!(branch2, branch);

        ws.cleanup_worktree("alpha").await.unwrap();
        assert!(!worktree.exists());
    }

    #[tokio::test]
    async fn commit_all_and_branch_status() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (branch, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();

        // Clean tree: nothing to commit, zero ahead
        assert!(!ws.commit_all_if_dirty(&worktree, "noop").await.unwrap());
        let status = ws.get_branch_status(&branch, &worktree).await.unwrap();
        assert_eq!(status.ahead, 0);
        assert!(status.clean);

        std::fs::write(worktree.join("new.txt"), "work").unwrap();
        assert!(ws.commit_all_if_dirty(&worktree, "add work").await.unwrap());
        let status = ws.get_branch_status(&branch, &worktree).await.unwrap();
        assert_eq!(status.ahead, 1);
        assert!(status.clean);
    }

    #[tokio::test]
    async fn merge_locally_returns_pre_merge_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (branch, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();
        std::fs::write(worktree.join("new.txt"), "work").unwrap();
        ws.commit_all_if_dirty(&worktree, "add work").await.unwrap();

        let before = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let before = String::from_utf8_lossy(&before.stdout).trim().to_string();

        let pre_merge = ws.merge_locally(&branch).await.unwrap();
        assert_eq!(pre_merge, before);
        assert!(dir.path().join("new.txt").exists());

        // Reverting puts base back where it was
        ws.revert_merge(&pre_merge).await.unwrap();
        assert!(!dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn merge_conflict_aborts_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (branch, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();
        std::fs::write(worktree.join("README.md"), "feature version\n").unwrap();
        ws.commit_all_if_dirty(&worktree, "feature edit").await.unwrap();

        // Conflicting change on base
        std::fs::write(dir.path().join("README.md"), "base version\n").unwrap();
        let git = |args: &[&str]| git_in(dir.path(), args);
        git(&["add", "-A"]);
        git(&["commit", "-m", "base edit"]);

        let result = ws.merge_locally(&branch).await;
        assert!(matches!(result, Err(WorkspaceError::MergeConflict(_))));

        // Shared repo is back on base with a clean tree
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }

    #[tokio::test]
    async fn update_feature_branch_pulls_in_base() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (_, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();

        // Advance base after the worktree was created
        std::fs::write(dir.path().join("base-only.txt"), "x").unwrap();
        git_in(dir.path(), &["add", "-A"]);
        git_in(dir.path(), &["commit", "-m", "advance base"]);

        ws.update_feature_branch(&worktree).await.unwrap();
        assert!(worktree.join("base-only.txt").exists());
    }

    #[tokio::test]
    async fn preserved_files_survive_merge() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ws = manager(dir.path());
        ws.init().await.unwrap();

        let (branch, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();
        // The feature branch rewrites the coordination file
        std::fs::write(worktree.join("features.json"), "[{\"from\":\"agent\"}]\n").unwrap();
        ws.commit_all_if_dirty(&worktree, "agent edit").await.unwrap();

        // Meanwhile the orchestrator's copy has its own content
        let orchestrator_bytes = b"[{\"id\":1,\"status\":\"verifying\"}]\n".to_vec();
        std::fs::write(dir.path().join("features.json"), &orchestrator_bytes).unwrap();

        ws.merge_locally(&branch).await.unwrap();

        let after = std::fs::read(dir.path().join("features.json")).unwrap();
        assert_eq!(after, orchestrator_bytes);
    }

    #[tokio::test]
    async fn symlink_dirs_are_relative() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("node_modules/.bin")).unwrap();

        let policy = WorkspacePolicy {
            symlink_dirs: vec!["node_modules".into()],
            ..WorkspacePolicy::default()
        };
        let ws = WorkspaceManager::new(dir.path(), "main", policy);
        ws.init().await.unwrap();

        let (_, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();
        let link = worktree.join("node_modules");
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink());
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.is_relative());
        // And it resolves to the real dependency tree
        assert!(link.join(".bin").exists());
    }

    #[tokio::test]
    async fn setup_script_written_and_excluded() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let policy = WorkspacePolicy {
            setup_script: Some("worktree-setup.sh".into()),
            docker: Some(crate::config::DockerConfig {
                image: "app:dev".into(),
                compose_file: String::new(),
            }),
            ..WorkspacePolicy::default()
        };
        let ws = WorkspaceManager::new(dir.path(), "main", policy);
        ws.init().await.unwrap();

        let (_, worktree) = ws.prepare_branch("alpha", 1, "thing", false).await.unwrap();
        assert!(worktree.join("worktree-setup.sh").exists());
        let exclude = std::fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert!(exclude.lines().any(|l| l == "worktree-setup.sh"));
    }
}
