//! Branch-plus-worktree workspaces
//!
//! Namespace `ns` maps to branch `<prefix>/ns` and a linked worktree named
//! `ns` under the workspace root. The repository is reopened for every
//! operation since `git2::Repository` cannot be shared between threads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use switchyard_core::config::WorkspaceConfig;
use switchyard_core::{GitError, ProvisioningError};
use switchyard_tasks::{WorkspaceBackend, WorkspaceHandle};

use crate::repository::GitRepo;

/// Lock files git leaves in a worktree's administrative directory
const WORKTREE_LOCKS: &[&str] = &["index.lock", "HEAD.lock"];

/// [`WorkspaceBackend`] giving every namespace its own branch and worktree
#[derive(Debug, Clone)]
pub struct GitWorktreeBackend {
    repo_path: PathBuf,
    git_dir: PathBuf,
    root: PathBuf,
    branch_prefix: String,
    base_ref: String,
    keep_branches: bool,
}

impl GitWorktreeBackend {
    /// Set up the backend for the repository containing `start`. A relative
    /// workspace root is taken relative to the repository's work tree.
    pub fn discover(start: &Path, config: &WorkspaceConfig) -> Result<Self, GitError> {
        let repo = GitRepo::discover(start)?;
        let root = if config.root.is_absolute() {
            config.root.clone()
        } else {
            repo.path().join(&config.root)
        };
        // Fail early on a base that does not resolve
        repo.resolve_commit(&config.base_ref)?;

        info!(
            repo = %repo.path().display(),
            root = %root.display(),
            base = %config.base_ref,
            "git workspace backend ready"
        );
        Ok(Self {
            repo_path: repo.path().to_path_buf(),
            git_dir: repo.git_dir().to_path_buf(),
            root,
            branch_prefix: config.branch_prefix.trim_end_matches('/').to_string(),
            base_ref: config.base_ref.clone(),
            keep_branches: config.keep_branches,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch_name(&self, namespace: &str) -> String {
        if self.branch_prefix.is_empty() {
            namespace.to_string()
        } else {
            format!("{}/{}", self.branch_prefix, namespace)
        }
    }

    fn open(&self, namespace: &str) -> Result<GitRepo, ProvisioningError> {
        GitRepo::open(&self.repo_path).map_err(|e| backend_error(namespace, e))
    }
}

fn backend_error(namespace: &str, err: impl std::fmt::Display) -> ProvisioningError {
    ProvisioningError::Backend {
        namespace: namespace.to_string(),
        reason: err.to_string(),
    }
}

impl WorkspaceBackend for GitWorktreeBackend {
    fn name(&self) -> &str {
        "git"
    }

    #[instrument(skip(self))]
    fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
        let handle = self.locate(namespace);
        let branch = self.branch_name(namespace);
        if !git2::Reference::is_valid_name(&format!("refs/heads/{}", branch)) {
            return Err(backend_error(
                namespace,
                format!("'{}' is not a valid branch name", branch),
            ));
        }

        let repo = self.open(namespace)?;
        if repo.worktree_exists(namespace) || handle.path.exists() {
            return Err(ProvisioningError::NamespaceInUse(namespace.to_string()));
        }

        // An existing branch may carry someone's work; only reclaim removes it
        repo.create_branch(&branch, &self.base_ref, false)
            .map_err(|e| match e {
                GitError::BranchExists(_) => {
                    ProvisioningError::NamespaceInUse(namespace.to_string())
                }
                other => backend_error(namespace, other),
            })?;
        fs::create_dir_all(&self.root).map_err(|e| backend_error(namespace, e))?;
        repo.add_worktree(namespace, &handle.path, &branch)
            .map_err(|e| backend_error(namespace, e))?;

        debug!(path = %handle.path.display(), branch = %branch, "worktree created");
        Ok(handle)
    }

    #[instrument(skip(self, handle), fields(namespace = %handle.namespace))]
    fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
        let namespace = handle.namespace.as_str();
        match fs::remove_dir_all(&handle.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(backend_error(namespace, e)),
        }

        let repo = self.open(namespace)?;
        repo.prune_worktree(namespace)
            .map_err(|e| backend_error(namespace, e))?;

        if !self.keep_branches {
            if let Some(branch) = &handle.branch {
                repo.delete_branch(branch)
                    .map_err(|e| backend_error(namespace, e))?;
            }
        }
        debug!(keep_branch = self.keep_branches, "worktree destroyed");
        Ok(())
    }

    /// Like `destroy`, but the branch goes too, whatever `keep_branches` says
    fn reclaim(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
        self.destroy(handle)?;
        if let Some(branch) = &handle.branch {
            let deleted = self
                .open(&handle.namespace)?
                .delete_branch(branch)
                .map_err(|e| backend_error(&handle.namespace, e))?;
            if deleted {
                warn!(namespace = %handle.namespace, branch = %branch, "deleted abandoned branch");
            }
        }
        Ok(())
    }

    fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
        if self.locate(namespace).path.exists() {
            return Ok(true);
        }
        let repo = self.open(namespace)?;
        if repo.worktree_exists(namespace) {
            return Ok(true);
        }
        repo.branch_exists(&self.branch_name(namespace))
            .map_err(|e| backend_error(namespace, e))
    }

    fn locate(&self, namespace: &str) -> WorkspaceHandle {
        WorkspaceHandle {
            namespace: namespace.to_string(),
            path: self.root.join(namespace),
            branch: Some(self.branch_name(namespace)),
        }
    }

    fn leftover_locks(&self, handle: &WorkspaceHandle) -> Vec<PathBuf> {
        let admin = self.git_dir.join("worktrees").join(&handle.namespace);
        let mut locks: Vec<PathBuf> = WORKTREE_LOCKS
            .iter()
            .map(|name| admin.join(name))
            .filter(|p| p.exists())
            .collect();

        if let Some(branch) = &handle.branch {
            let ref_lock = self
                .git_dir
                .join("refs")
                .join("heads")
                .join(format!("{}.lock", branch));
            if ref_lock.exists() {
                locks.push(ref_lock);
            }
        }
        if !locks.is_empty() {
            warn!(namespace = %handle.namespace, count = locks.len(), "found leftover git locks");
        }
        locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::init_repo_with_commit;
    use std::sync::Arc;
    use std::time::Duration;
    use switchyard_core::config::WorkspaceBackendKind;
    use switchyard_tasks::{
        CircuitBreaker, ManualClock, Provisioner, Resilience, RetryPolicy, TaskId, TaskStatus,
    };
    use tempfile::TempDir;

    fn config(keep_branches: bool) -> WorkspaceConfig {
        WorkspaceConfig {
            backend: WorkspaceBackendKind::Git,
            root: PathBuf::from(".switchyard/workspaces"),
            branch_prefix: "switchyard".to_string(),
            base_ref: "HEAD".to_string(),
            keep_branches,
        }
    }

    fn backend(temp: &TempDir, keep_branches: bool) -> GitWorktreeBackend {
        GitWorktreeBackend::discover(temp.path(), &config(keep_branches)).unwrap()
    }

    #[test]
    fn test_create_checks_out_base() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);

        assert!(!backend.exists("b1--A").unwrap());
        let handle = backend.create("b1--A").unwrap();
        assert_eq!(handle.branch.as_deref(), Some("switchyard/b1--A"));
        assert!(handle.path.ends_with(".switchyard/workspaces/b1--A"));
        assert_eq!(
            fs::read_to_string(handle.path.join("README.md")).unwrap(),
            "hello\n"
        );
        assert!(backend.exists("b1--A").unwrap());

        let repo = GitRepo::open(temp.path()).unwrap();
        assert!(repo.branch_exists("switchyard/b1--A").unwrap());
    }

    #[test]
    fn test_create_twice_is_refused() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);
        backend.create("b1--A").unwrap();
        assert_eq!(
            backend.create("b1--A").unwrap_err(),
            ProvisioningError::NamespaceInUse("b1--A".to_string())
        );
    }

    #[test]
    fn test_workspaces_are_isolated() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);
        let a = backend.create("b1--A").unwrap();
        let b = backend.create("b1--B").unwrap();

        fs::write(a.path.join("README.md"), "changed by A\n").unwrap();
        assert_eq!(
            fs::read_to_string(b.path.join("README.md")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("README.md")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn test_destroy_keeps_branch() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);
        let handle = backend.create("b1--A").unwrap();

        backend.destroy(&handle).unwrap();
        assert!(!handle.path.exists());
        let repo = GitRepo::open(temp.path()).unwrap();
        assert!(repo.branch_exists("switchyard/b1--A").unwrap());

        // the kept branch still counts until the namespace is reclaimed
        assert!(backend.exists("b1--A").unwrap());
        assert_eq!(
            backend.create("b1--A").unwrap_err(),
            ProvisioningError::NamespaceInUse("b1--A".to_string())
        );
        backend.reclaim(&handle).unwrap();
        assert!(!backend.exists("b1--A").unwrap());
        backend.create("b1--A").unwrap();
    }

    fn commit_on_branch(temp: &TempDir, branch: &str) -> git2::Oid {
        let repo = git2::Repository::open(temp.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch(branch, &head, false).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let tree = head.tree().unwrap();
        repo.commit(
            Some(&format!("refs/heads/{}", branch)),
            &sig,
            &sig,
            "work in progress",
            &tree,
            &[&head],
        )
        .unwrap()
    }

    #[test]
    fn test_existing_branch_is_not_reset() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);
        let tip = commit_on_branch(&temp, "switchyard/b1--A");

        assert!(backend.exists("b1--A").unwrap());
        assert_eq!(
            backend.create("b1--A").unwrap_err(),
            ProvisioningError::NamespaceInUse("b1--A".to_string())
        );
        let repo = GitRepo::open(temp.path()).unwrap();
        assert_eq!(repo.resolve_commit("switchyard/b1--A").unwrap().id(), tip);
    }

    #[test]
    fn test_destroy_deletes_branch() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, false);
        let handle = backend.create("b1--A").unwrap();

        backend.destroy(&handle).unwrap();
        let repo = GitRepo::open(temp.path()).unwrap();
        assert!(!repo.branch_exists("switchyard/b1--A").unwrap());
        // destroying again is harmless
        backend.destroy(&handle).unwrap();
    }

    #[test]
    fn test_leftover_locks() {
        let temp = init_repo_with_commit();
        let backend = backend(&temp, true);
        let handle = backend.create("b1--A").unwrap();
        assert!(backend.leftover_locks(&handle).is_empty());

        let lock = temp
            .path()
            .join(".git")
            .join("worktrees")
            .join("b1--A")
            .join("index.lock");
        fs::write(&lock, "").unwrap();
        let locks = backend.leftover_locks(&handle);
        assert_eq!(locks.len(), 1);
        assert!(locks[0].ends_with("index.lock"));
    }

    #[test]
    fn test_bad_base_ref() {
        let temp = init_repo_with_commit();
        let mut cfg = config(true);
        cfg.base_ref = "no-such-branch".to_string();
        assert!(matches!(
            GitWorktreeBackend::discover(temp.path(), &cfg),
            Err(GitError::ReferenceNotFound(_))
        ));
    }

    #[test]
    fn test_not_a_repository() {
        let temp = TempDir::new().unwrap();
        assert!(GitWorktreeBackend::discover(temp.path(), &config(true)).is_err());
    }

    #[tokio::test]
    async fn test_provisioner_over_git() {
        let temp = init_repo_with_commit();
        let resilience = Resilience::new(
            RetryPolicy {
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(1),
            },
            Arc::new(CircuitBreaker::new(
                "provisioner",
                5,
                Duration::from_secs(30),
                Arc::new(ManualClock::new()),
            )),
        );
        let provisioner = Provisioner::new(Arc::new(backend(&temp, true)), resilience);

        let ws = provisioner
            .acquire("b1", &TaskId::new("A"))
            .await
            .unwrap();
        assert!(ws.path().join("README.md").exists());
        let path = ws.path().to_path_buf();

        provisioner.release(ws, TaskStatus::Succeeded).await;
        assert!(!path.exists());
        assert_eq!(provisioner.stats().released, 1);
    }

    #[tokio::test]
    async fn test_provisioner_leaves_foreign_branch_alone() {
        let temp = init_repo_with_commit();
        let tip = commit_on_branch(&temp, "switchyard/b1--A");
        let resilience = Resilience::new(
            RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(1),
            },
            Arc::new(CircuitBreaker::new(
                "provisioner",
                5,
                Duration::from_secs(30),
                Arc::new(ManualClock::new()),
            )),
        );
        let provisioner = Provisioner::new(Arc::new(backend(&temp, true)), resilience);

        let err = provisioner
            .acquire("b1", &TaskId::new("A"))
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::NamespaceInUse("b1--A".to_string()));
        let repo = GitRepo::open(temp.path()).unwrap();
        assert_eq!(repo.resolve_commit("switchyard/b1--A").unwrap().id(), tip);

        // once known abandoned it is reclaimed from the base
        provisioner.mark_abandoned("b1--A");
        let ws = provisioner
            .acquire("b1", &TaskId::new("A"))
            .await
            .unwrap();
        let head = repo.resolve_commit("HEAD").unwrap().id();
        assert_eq!(repo.resolve_commit("switchyard/b1--A").unwrap().id(), head);
        provisioner.release(ws, TaskStatus::Succeeded).await;
    }
}
