//! Git repository operations

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, Repository, WorktreeAddOptions, WorktreePruneOptions};
use tracing::{debug, info, instrument};

use switchyard_core::GitError;

/// Result type for git operations
pub type Result<T> = std::result::Result<T, GitError>;

/// Git repository wrapper
pub struct GitRepo {
    pub(crate) repo: Repository,
    path: PathBuf,
}

impl GitRepo {
    /// Open a repository at the given path
    #[instrument(fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::RepositoryNotFound(path.to_path_buf())
            } else {
                GitError::OpenFailed(e.to_string())
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            repo,
        })
    }

    /// Discover and open a repository by searching parent directories
    #[instrument(fields(start_path = %start_path.display()))]
    pub fn discover(start_path: &Path) -> Result<Self> {
        info!(start_path = %start_path.display(), "discovering git repository");
        let repo = Repository::discover(start_path).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::NotARepository(start_path.to_path_buf())
            } else {
                GitError::OpenFailed(e.to_string())
            }
        })?;

        let path = repo.workdir().unwrap_or_else(|| repo.path()).to_path_buf();

        Ok(Self { repo, path })
    }

    /// Get the repository path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the workdir path
    pub fn workdir(&self) -> Option<&Path> {
        self.repo.workdir()
    }

    /// The `.git` directory
    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    /// Get a reference to the inner git2 Repository
    pub fn inner(&self) -> &Repository {
        &self.repo
    }

    /// Check if the repository is bare
    pub fn is_bare(&self) -> bool {
        self.repo.is_bare()
    }

    /// Resolve a revision to the commit it points at
    pub fn resolve_commit(&self, rev: &str) -> Result<git2::Commit<'_>> {
        let object = self.repo.revparse_single(rev).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::ReferenceNotFound(rev.to_string())
            } else {
                GitError::Git2(e)
            }
        })?;
        object.peel_to_commit().map_err(GitError::Git2)
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(GitError::Git2(e)),
        }
    }

    /// Create a local branch at `base`. An existing branch is an error
    /// unless `force` is set, in which case it is reset to `base`.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: &str, base: &str, force: bool) -> Result<()> {
        if !force && self.branch_exists(name)? {
            return Err(GitError::BranchExists(name.to_string()));
        }
        let commit = self.resolve_commit(base)?;
        self.repo.branch(name, &commit, force)?;
        debug!(branch = name, commit = %commit.id(), "created branch");
        Ok(())
    }

    /// Delete a local branch. Returns whether there was one.
    pub fn delete_branch(&self, name: &str) -> Result<bool> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(mut branch) => {
                branch.delete()?;
                debug!(branch = name, "deleted branch");
                Ok(true)
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(GitError::Git2(e)),
        }
    }

    /// Check `branch` out into a new linked worktree at `path`
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        let branch_ref = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| GitError::WorktreeFailed {
                name: name.to_string(),
                reason: format!("branch {}: {}", branch, e.message()),
            })?;
        let reference = branch_ref.into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        self.repo
            .worktree(name, path, Some(&opts))
            .map_err(|e| GitError::WorktreeFailed {
                name: name.to_string(),
                reason: e.message().to_string(),
            })?;
        info!(worktree = name, branch, "added worktree");
        Ok(())
    }

    /// Whether a linked worktree is registered under `name`
    pub fn worktree_exists(&self, name: &str) -> bool {
        self.repo.find_worktree(name).is_ok()
    }

    /// Remove the administrative data of a linked worktree, together with
    /// whatever is left of its working tree. Returns whether there was one.
    pub fn prune_worktree(&self, name: &str) -> Result<bool> {
        let worktree = match self.repo.find_worktree(name) {
            Ok(w) => w,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(GitError::Git2(e)),
        };
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).locked(true).working_tree(true);
        worktree
            .prune(Some(&mut opts))
            .map_err(|e| GitError::WorktreeFailed {
                name: name.to_string(),
                reason: e.message().to_string(),
            })?;
        debug!(worktree = name, "pruned worktree");
        Ok(true)
    }

    /// Administrative directory of a linked worktree
    pub fn worktree_admin_dir(&self, name: &str) -> PathBuf {
        self.git_dir().join("worktrees").join(name)
    }
}
