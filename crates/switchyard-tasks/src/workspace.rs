//! Isolated per-task workspaces
//!
//! A [`WorkspaceBackend`] knows how to materialize a namespace (a directory,
//! a branch plus worktree, ...). The [`Provisioner`] sits in front of it and
//! owns the lease bookkeeping: a namespace is handed to at most one task at a
//! time, and an existing namespace is only reclaimed when it is known to be
//! abandoned.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use switchyard_core::ProvisioningError;

use crate::resilience::{Resilience, ResilienceError};
use crate::task::{TaskId, TaskStatus};

/// What a backend hands back for a created namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub namespace: String,
    /// Directory the task runs in
    pub path: PathBuf,
    /// Version-control branch backing the workspace, if any
    pub branch: Option<String>,
}

/// Something that can create and destroy isolated namespaces
pub trait WorkspaceBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Create a fresh namespace. Fails if it already exists.
    fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError>;

    /// Tear a namespace down
    fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError>;

    /// Tear down a namespace confirmed abandoned, including anything
    /// `destroy` would normally keep
    fn reclaim(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
        self.destroy(handle)
    }

    /// Whether anything is left of a namespace
    fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError>;

    /// Handle a namespace would have, whether or not it exists
    fn locate(&self, namespace: &str) -> WorkspaceHandle;

    /// Lock files left behind in a workspace
    fn leftover_locks(&self, _handle: &WorkspaceHandle) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// One plain directory per namespace
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn backend_error(namespace: &str, err: impl std::fmt::Display) -> ProvisioningError {
        ProvisioningError::Backend {
            namespace: namespace.to_string(),
            reason: err.to_string(),
        }
    }
}

impl WorkspaceBackend for DirectoryBackend {
    fn name(&self) -> &str {
        "directory"
    }

    fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
        let handle = self.locate(namespace);
        fs::create_dir_all(&self.root).map_err(|e| Self::backend_error(namespace, e))?;
        // create_dir (not _all) so an existing directory is reported, not reused
        fs::create_dir(&handle.path).map_err(|e| Self::backend_error(namespace, e))?;
        debug!(path = %handle.path.display(), "created workspace directory");
        Ok(handle)
    }

    fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
        match fs::remove_dir_all(&handle.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::backend_error(&handle.namespace, e)),
        }
    }

    fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
        Ok(self.locate(namespace).path.exists())
    }

    fn locate(&self, namespace: &str) -> WorkspaceHandle {
        WorkspaceHandle {
            namespace: namespace.to_string(),
            path: self.root.join(namespace),
            branch: None,
        }
    }
}

/// Namespace for a task of a batch, restricted to `[A-Za-z0-9._-]`.
///
/// A part that had to be rewritten gets a short hash of its raw value, so
/// `fix/a` and `fix_a` still map to different namespaces.
pub fn namespace_for(batch_id: &str, task: &TaskId) -> String {
    format!("{}--{}", namespace_part(batch_id), namespace_part(task.as_str()))
}

fn namespace_part(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe == raw {
        return safe;
    }
    let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
    format!("{}-{}", safe, &digest[..8])
}

/// A workspace leased to one task
#[derive(Debug, PartialEq, Eq)]
pub struct Workspace {
    task: TaskId,
    handle: WorkspaceHandle,
}

impl Workspace {
    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn namespace(&self) -> &str {
        &self.handle.namespace
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    pub fn handle(&self) -> &WorkspaceHandle {
        &self.handle
    }
}

#[derive(Debug, Default)]
struct Leases {
    active: HashSet<String>,
    attempted: HashSet<String>,
    abandoned: HashSet<String>,
}

/// Lease counters, used to check acquire/release pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionerStats {
    pub acquired: usize,
    pub released: usize,
}

/// Hands out and takes back task workspaces
pub struct Provisioner {
    backend: Arc<dyn WorkspaceBackend>,
    resilience: Resilience,
    leases: Mutex<Leases>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, resilience: Resilience) -> Self {
        Self {
            backend,
            resilience,
            leases: Mutex::new(Leases::default()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &dyn WorkspaceBackend {
        self.backend.as_ref()
    }

    fn leases(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow an existing namespace to be reclaimed, e.g. one left by a
    /// crashed run that is being resumed.
    pub fn mark_abandoned(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        debug!(namespace = %namespace, "namespace marked abandoned");
        self.leases().abandoned.insert(namespace);
    }

    pub fn stats(&self) -> ProvisionerStats {
        ProvisionerStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }

    /// Acquire an isolated workspace for a task.
    ///
    /// Backend failures go through the `provisioner` breaker and retry
    /// policy. Retrying is safe: a namespace this provisioner already tried to
    /// create is destroyed and recreated.
    #[instrument(skip(self), fields(backend = %self.backend.name()))]
    pub async fn acquire(
        &self,
        batch_id: &str,
        task: &TaskId,
    ) -> Result<Workspace, ProvisioningError> {
        let namespace = namespace_for(batch_id, task);

        if !self.leases().active.insert(namespace.clone()) {
            return Err(ProvisioningError::AlreadyLeased(namespace));
        }

        let this = self;
        let ns = namespace.as_str();
        let result = self
            .resilience
            .call(
                move |_| async move { this.provision_once(ns).await },
                |attempt, err, _| {
                    warn!(namespace = %ns, attempt, error = %err, "provisioning failed, retrying")
                },
            )
            .await;

        match result {
            Ok(done) => {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                info!(
                    task = %task,
                    namespace = %namespace,
                    attempts = done.attempts,
                    "workspace acquired"
                );
                Ok(Workspace {
                    task: task.clone(),
                    handle: done.value,
                })
            }
            Err(err) => {
                self.leases().active.remove(&namespace);
                Err(match err {
                    ResilienceError::BreakerOpen { dependency } => {
                        ProvisioningError::BreakerOpen { dependency }
                    }
                    ResilienceError::Exhausted { attempts, last } => {
                        ProvisioningError::RetriesExhausted {
                            attempts,
                            reason: last.to_string(),
                        }
                    }
                    ResilienceError::Fatal(e) => e,
                })
            }
        }
    }

    /// Run a backend call on the blocking pool; checkouts can take a while
    async fn blocking<T, F>(&self, namespace: &str, f: F) -> Result<T, ProvisioningError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn WorkspaceBackend) -> Result<T, ProvisioningError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(backend.as_ref()))
            .await
            .map_err(|e| ProvisioningError::Backend {
                namespace: namespace.to_string(),
                reason: format!("backend call did not complete: {}", e),
            })?
    }

    async fn provision_once(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
        let ns = namespace.to_string();
        if self.blocking(namespace, move |b| b.exists(&ns)).await? {
            let reclaimable = {
                let leases = self.leases();
                leases.attempted.contains(namespace) || leases.abandoned.contains(namespace)
            };
            if !reclaimable {
                return Err(ProvisioningError::NamespaceInUse(namespace.to_string()));
            }
            warn!(namespace = %namespace, "reclaiming abandoned workspace");
            let ns = namespace.to_string();
            self.blocking(namespace, move |b| b.reclaim(&b.locate(&ns)))
                .await?;
        }

        self.leases().attempted.insert(namespace.to_string());
        let ns = namespace.to_string();
        self.blocking(namespace, move |b| b.create(&ns)).await
    }

    /// Give a workspace back. Cleanup problems are logged, never returned.
    pub async fn release(&self, workspace: Workspace, status: TaskStatus) {
        let Workspace { task, handle } = workspace;

        let (lock_task, target) = (task.clone(), handle.clone());
        let cleanup = self
            .blocking(&handle.namespace, move |b| {
                for lock in b.leftover_locks(&target) {
                    warn!(
                        task = %lock_task,
                        lock = %lock.display(),
                        "removing leftover lock file"
                    );
                    if let Err(e) = fs::remove_file(&lock) {
                        warn!(lock = %lock.display(), error = %e, "failed to remove lock file");
                    }
                }
                b.destroy(&target)
            })
            .await;
        if let Err(e) = cleanup {
            warn!(
                task = %task,
                namespace = %handle.namespace,
                error = %e,
                "workspace cleanup failed"
            );
        }

        {
            let mut leases = self.leases();
            leases.active.remove(&handle.namespace);
            leases.abandoned.remove(&handle.namespace);
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!(task = %task, status = %status, "workspace released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreaker, ManualClock, RetryPolicy};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resilience(max_attempts: u32) -> Resilience {
        Resilience::new(
            RetryPolicy {
                max_attempts,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(10),
            },
            Arc::new(CircuitBreaker::new(
                "provisioner",
                5,
                Duration::from_secs(30),
                Arc::new(ManualClock::new()),
            )),
        )
    }

    fn provisioner(temp: &TempDir) -> Provisioner {
        Provisioner::new(
            Arc::new(DirectoryBackend::new(temp.path().join("ws"))),
            resilience(3),
        )
    }

    #[test]
    fn test_namespace_is_sanitized() {
        assert_eq!(namespace_for("b1", &TaskId::new("A")), "b1--A");

        let ns = namespace_for("b1", &TaskId::new("fix/login#1"));
        assert!(ns.starts_with("b1--fix_login_1-"));
        assert_eq!(ns.len(), "b1--fix_login_1-".len() + 8);
        assert!(ns
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        assert_eq!(ns, namespace_for("b1", &TaskId::new("fix/login#1")));
    }

    #[test]
    fn test_rewritten_ids_keep_distinct_namespaces() {
        let slash = namespace_for("b1", &TaskId::new("fix/a"));
        let underscore = namespace_for("b1", &TaskId::new("fix_a"));
        let space = namespace_for("b1", &TaskId::new("fix a"));
        assert_eq!(underscore, "b1--fix_a");
        assert_ne!(slash, underscore);
        assert_ne!(slash, space);
        assert_ne!(space, underscore);
    }

    #[tokio::test]
    async fn test_similar_ids_lease_side_by_side() {
        let temp = TempDir::new().unwrap();
        let p = provisioner(&temp);

        let a = p.acquire("b1", &TaskId::new("fix/a")).await.unwrap();
        let b = p.acquire("b1", &TaskId::new("fix_a")).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir() && b.path().is_dir());

        p.release(a, TaskStatus::Succeeded).await;
        p.release(b, TaskStatus::Succeeded).await;
        assert_eq!(p.stats().released, 2);
    }

    #[test]
    fn test_directory_backend_lifecycle() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(temp.path());

        assert!(!backend.exists("a").unwrap());
        let handle = backend.create("a").unwrap();
        assert!(handle.path.is_dir());
        assert!(backend.exists("a").unwrap());
        assert!(backend.create("a").is_err());

        backend.destroy(&handle).unwrap();
        assert!(!backend.exists("a").unwrap());
        // destroying twice is fine
        backend.destroy(&handle).unwrap();
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let p = provisioner(&temp);
        let task = TaskId::new("A");

        let ws = p.acquire("b1", &task).await.unwrap();
        assert_eq!(ws.namespace(), "b1--A");
        assert!(ws.path().is_dir());
        let path = ws.path().to_path_buf();

        p.release(ws, TaskStatus::Succeeded).await;
        assert!(!path.exists());
        assert_eq!(
            p.stats(),
            ProvisionerStats {
                acquired: 1,
                released: 1
            }
        );
    }

    #[tokio::test]
    async fn test_leased_namespace_not_handed_out_twice() {
        let temp = TempDir::new().unwrap();
        let p = provisioner(&temp);
        let task = TaskId::new("A");

        let ws = p.acquire("b1", &task).await.unwrap();
        let err = p.acquire("b1", &task).await.unwrap_err();
        assert_eq!(err, ProvisioningError::AlreadyLeased("b1--A".to_string()));

        p.release(ws, TaskStatus::Failed).await;
        let again = p.acquire("b1", &task).await.unwrap();
        p.release(again, TaskStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn test_existing_namespace_fails_closed() {
        let temp = TempDir::new().unwrap();
        let dirty = temp.path().join("ws").join("b1--A");
        fs::create_dir_all(&dirty).unwrap();
        fs::write(dirty.join("stale.txt"), "left over").unwrap();

        let p = provisioner(&temp);
        let err = p.acquire("b1", &TaskId::new("A")).await.unwrap_err();
        assert_eq!(err, ProvisioningError::NamespaceInUse("b1--A".to_string()));
        // not touched
        assert!(dirty.join("stale.txt").exists());
        assert_eq!(p.stats().acquired, 0);
    }

    /// Keeps a marker on destroy, drops it only on reclaim
    struct KeepingBackend {
        inner: DirectoryBackend,
        kept: PathBuf,
    }

    impl WorkspaceBackend for KeepingBackend {
        fn name(&self) -> &str {
            "keeping"
        }

        fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
            if self.kept.exists() {
                return Err(ProvisioningError::NamespaceInUse(namespace.to_string()));
            }
            fs::write(&self.kept, namespace).unwrap();
            self.inner.create(namespace)
        }

        fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
            self.inner.destroy(handle)
        }

        fn reclaim(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
            let _ = fs::remove_file(&self.kept);
            self.inner.destroy(handle)
        }

        fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
            Ok(self.kept.exists() || self.inner.exists(namespace)?)
        }

        fn locate(&self, namespace: &str) -> WorkspaceHandle {
            self.inner.locate(namespace)
        }
    }

    #[tokio::test]
    async fn test_kept_state_blocks_until_abandoned() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(KeepingBackend {
            inner: DirectoryBackend::new(temp.path().join("ws")),
            kept: temp.path().join("kept"),
        });
        fs::write(temp.path().join("kept"), "earlier run").unwrap();

        let p = Provisioner::new(backend.clone(), resilience(1));
        let err = p.acquire("b1", &TaskId::new("A")).await.unwrap_err();
        assert_eq!(err, ProvisioningError::NamespaceInUse("b1--A".to_string()));
        assert_eq!(
            fs::read_to_string(temp.path().join("kept")).unwrap(),
            "earlier run"
        );

        p.mark_abandoned("b1--A");
        let ws = p.acquire("b1", &TaskId::new("A")).await.unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join("kept")).unwrap(),
            "b1--A"
        );
        p.release(ws, TaskStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn test_abandoned_namespace_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let dirty = temp.path().join("ws").join("b1--A");
        fs::create_dir_all(&dirty).unwrap();
        fs::write(dirty.join("stale.txt"), "left over").unwrap();

        let p = provisioner(&temp);
        p.mark_abandoned("b1--A");
        let ws = p.acquire("b1", &TaskId::new("A")).await.unwrap();
        assert!(ws.path().is_dir());
        assert!(!ws.path().join("stale.txt").exists());
        p.release(ws, TaskStatus::Succeeded).await;
    }

    /// Creates a partial workspace and then fails, a fixed number of times
    struct FlakyBackend {
        inner: DirectoryBackend,
        failures: AtomicU32,
    }

    impl WorkspaceBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
            let handle = self.inner.create(namespace)?;
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ProvisioningError::Backend {
                    namespace: namespace.to_string(),
                    reason: "disk hiccup".to_string(),
                });
            }
            Ok(handle)
        }

        fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
            self.inner.destroy(handle)
        }

        fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
            self.inner.exists(namespace)
        }

        fn locate(&self, namespace: &str) -> WorkspaceHandle {
            self.inner.locate(namespace)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_idempotent_under_retry() {
        let temp = TempDir::new().unwrap();
        let backend = FlakyBackend {
            inner: DirectoryBackend::new(temp.path()),
            failures: AtomicU32::new(2),
        };
        let p = Provisioner::new(Arc::new(backend), resilience(3));

        let ws = p.acquire("b1", &TaskId::new("A")).await.unwrap();
        assert!(ws.path().is_dir());
        p.release(ws, TaskStatus::Succeeded).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_exhausted() {
        let temp = TempDir::new().unwrap();
        let backend = FlakyBackend {
            inner: DirectoryBackend::new(temp.path()),
            failures: AtomicU32::new(5),
        };
        let p = Provisioner::new(Arc::new(backend), resilience(2));

        let err = p.acquire("b1", &TaskId::new("A")).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::RetriesExhausted { attempts: 2, .. }
        ));
        // the lease is given back on failure
        assert!(p.leases().active.is_empty());
    }

    struct LockingBackend {
        inner: DirectoryBackend,
    }

    impl WorkspaceBackend for LockingBackend {
        fn name(&self) -> &str {
            "locking"
        }

        fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
            let handle = self.inner.create(namespace)?;
            fs::write(handle.path.join("index.lock"), "").unwrap();
            Ok(handle)
        }

        fn destroy(&self, _handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
            Err(ProvisioningError::Backend {
                namespace: "x".to_string(),
                reason: "busy".to_string(),
            })
        }

        fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
            self.inner.exists(namespace)
        }

        fn locate(&self, namespace: &str) -> WorkspaceHandle {
            self.inner.locate(namespace)
        }

        fn leftover_locks(&self, handle: &WorkspaceHandle) -> Vec<PathBuf> {
            let lock = handle.path.join("index.lock");
            if lock.exists() {
                vec![lock]
            } else {
                Vec::new()
            }
        }
    }

    /// Notes which thread each backend call ran on
    struct ThreadNotingBackend {
        inner: DirectoryBackend,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThreadNotingBackend {
        fn note(&self) {
            self.threads.lock().unwrap().push(std::thread::current().id());
        }
    }

    impl WorkspaceBackend for ThreadNotingBackend {
        fn name(&self) -> &str {
            "thread-noting"
        }

        fn create(&self, namespace: &str) -> Result<WorkspaceHandle, ProvisioningError> {
            self.note();
            self.inner.create(namespace)
        }

        fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), ProvisioningError> {
            self.note();
            self.inner.destroy(handle)
        }

        fn exists(&self, namespace: &str) -> Result<bool, ProvisioningError> {
            self.note();
            self.inner.exists(namespace)
        }

        fn locate(&self, namespace: &str) -> WorkspaceHandle {
            self.inner.locate(namespace)
        }
    }

    #[tokio::test]
    async fn test_backend_calls_stay_off_runtime_thread() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(ThreadNotingBackend {
            inner: DirectoryBackend::new(temp.path()),
            threads: Mutex::new(Vec::new()),
        });
        let p = Provisioner::new(backend.clone(), resilience(1));

        let ws = p.acquire("b1", &TaskId::new("A")).await.unwrap();
        p.release(ws, TaskStatus::Succeeded).await;

        let runtime_thread = std::thread::current().id();
        let threads = backend.threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[tokio::test]
    async fn test_release_removes_locks_and_swallows_cleanup_errors() {
        let temp = TempDir::new().unwrap();
        let p = Provisioner::new(
            Arc::new(LockingBackend {
                inner: DirectoryBackend::new(temp.path()),
            }),
            resilience(1),
        );

        let ws = p.acquire("b1", &TaskId::new("A")).await.unwrap();
        let lock = ws.path().join("index.lock");
        assert!(lock.exists());

        p.release(ws, TaskStatus::Failed).await;
        assert!(!lock.exists());
        assert_eq!(p.stats().released, 1);
    }
}
