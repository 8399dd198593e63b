//! Switchyard Git - worktree-backed task workspaces
//!
//! Each task gets its own branch and a linked worktree checked out from a
//! common base reference, so concurrent tasks never share a working copy.

pub mod repository;
pub mod worktree;

pub use repository::GitRepo;
pub use worktree::GitWorktreeBackend;
