//! The session's file tree, kept in step with the sandbox filesystem.
//!
//! Writes go to the sandbox first; the in-memory mirror only changes once the
//! sandbox write succeeded. Reads and snapshots come from the mirror and never
//! wait on sandbox I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use project_store::{ProjectKey, ProjectStore, UploadReceipt};
use sandbox::{SandboxError, SandboxInstance};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkbenchError};
use crate::handle::SandboxHandle;
use crate::notify::{ChangeNotifier, ChangeObserver};
use crate::tree::{self, FileSystemTree, FileTree};

struct Session {
    project: ProjectKey,
    tree: FileTree,
}

/// Periodic save; cancelled when dropped.
struct AutoSaveTask {
    period: Duration,
    _cancel: DropGuard,
}

struct Shared {
    sandbox: SandboxHandle,
    store: Arc<dyn ProjectStore>,
    session: Mutex<Option<Session>>,
    /// Serializes mutations so they apply, and notify, in call order.
    write_gate: tokio::sync::Mutex<()>,
    notifier: ChangeNotifier,
    current_file: Mutex<Option<String>>,
    auto_save: Mutex<Option<AutoSaveTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
        match lock(&self.session).as_mut() {
            Some(session) => f(session),
            None => Err(WorkbenchError::NotInitialized),
        }
    }

    fn notify(&self) {
        self.notifier.notify(|| {
            lock(&self.session)
                .as_ref()
                .map(|s| s.tree.enumerate())
                .unwrap_or_default()
        });
    }

    fn instance(&self) -> Result<Arc<dyn SandboxInstance>> {
        self.sandbox
            .current()
            .ok_or(WorkbenchError::Sandbox(SandboxError::NotRunning))
    }

    async fn save(&self) -> Result<UploadReceipt> {
        let (project, files) =
            self.with_session(|s| Ok((s.project.clone(), s.tree.flatten())))?;
        let receipt = self
            .store
            .upload(&project, &files)
            .await
            .map_err(WorkbenchError::PersistenceFailed)?;
        info!(
            project_id = %receipt.project_id,
            files = receipt.stored_paths.len(),
            store = self.store.name(),
            "project saved"
        );
        Ok(receipt)
    }
}

pub struct FileManager {
    shared: Arc<Shared>,
}

impl FileManager {
    pub fn new(sandbox: SandboxHandle, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sandbox,
                store,
                session: Mutex::new(None),
                write_gate: tokio::sync::Mutex::new(()),
                notifier: ChangeNotifier::new(),
                current_file: Mutex::new(None),
                auto_save: Mutex::new(None),
            }),
        }
    }

    /// Replace the change observer.
    pub fn set_on_change(&self, observer: ChangeObserver) {
        self.shared.notifier.subscribe(observer);
    }

    /// Start the session with `files`. The project id is assigned on the
    /// first call and kept for later calls with the same name, so repeated
    /// saves replace one stored project.
    pub async fn initialize(&self, project_name: &str, files: FileTree) -> Result<()> {
        let name = project_name.trim();
        if name.is_empty() {
            return Err(WorkbenchError::InvalidProjectName(project_name.to_owned()));
        }

        let _gate = self.shared.write_gate.lock().await;
        {
            let mut session = lock(&self.shared.session);
            let project = match session.take() {
                Some(previous) if previous.project.name == name => previous.project,
                _ => ProjectKey::new(name),
            };
            info!(project_id = %project.id, files = files.file_count(), "file manager initialized");
            *session = Some(Session {
                project,
                tree: files,
            });
        }
        self.shared.notify();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.shared.session).is_some()
    }

    pub fn project(&self) -> Option<ProjectKey> {
        lock(&self.shared.session)
            .as_ref()
            .map(|s| s.project.clone())
    }

    /// Snapshot of the mirror.
    pub fn files(&self) -> Result<FileSystemTree> {
        self.shared.with_session(|s| Ok(s.tree.enumerate()))
    }

    /// Copy of the mirror's tree.
    pub fn tree(&self) -> Result<FileTree> {
        self.shared.with_session(|s| Ok(s.tree.clone()))
    }

    pub fn read_file(&self, path: &str) -> Result<String> {
        self.shared
            .with_session(|s| s.tree.read(path).map(str::to_owned))
    }

    pub fn flatten(&self) -> Result<BTreeMap<String, String>> {
        self.shared.with_session(|s| Ok(s.tree.flatten()))
    }

    /// Write through to the sandbox, then to the mirror.
    ///
    /// Conflicts with the mirror are detected before touching the sandbox. If
    /// the sandbox write fails the mirror is unchanged and no notification is
    /// sent.
    pub async fn write_file(&self, path: &str, contents: String) -> Result<()> {
        let _gate = self.shared.write_gate.lock().await;
        self.shared.with_session(|s| s.tree.check_write(path))?;

        let instance = self.shared.instance()?;
        if let Some(parent) = tree::parent_dir(path) {
            instance.mkdir(parent, true).await?;
        }
        instance.write_file(path, &contents).await?;

        self.shared
            .with_session(|s| s.tree.write(path, contents))?;
        debug!(path, "file written");
        self.shared.notify();
        Ok(())
    }

    /// Pull `path` from the sandbox into the mirror, for files changed by
    /// processes running in the sandbox.
    pub async fn sync_from_sandbox(&self, path: &str) -> Result<()> {
        let _gate = self.shared.write_gate.lock().await;
        self.shared.with_session(|s| s.tree.check_write(path))?;

        let contents = self.shared.instance()?.read_file(path).await?;
        self.shared
            .with_session(|s| s.tree.write(path, contents))?;
        debug!(path, "file synced from sandbox");
        self.shared.notify();
        Ok(())
    }

    pub fn set_current_file(&self, path: &str) -> Result<()> {
        tree::split_path(path)?;
        *lock(&self.shared.current_file) = Some(path.to_owned());
        Ok(())
    }

    pub fn current_file(&self) -> Option<String> {
        lock(&self.shared.current_file).clone()
    }

    /// Upload the current tree. Errors are returned, not swallowed.
    pub async fn save_now(&self) -> Result<UploadReceipt> {
        self.shared.save().await
    }

    /// Save every `period`, first one period from now. Replaces a running
    /// auto-save. Failed saves are logged and the timer keeps going.
    pub fn start_auto_save(&self, period: Duration) -> Result<()> {
        if !self.is_initialized() {
            return Err(WorkbenchError::NotInitialized);
        }
        if period.is_zero() {
            return Err(WorkbenchError::Config("auto-save period must be positive".into()));
        }
        let first = Instant::now()
            .checked_add(period)
            .ok_or_else(|| WorkbenchError::Config("auto-save period is too long".into()))?;

        let token = CancellationToken::new();
        tokio::spawn(auto_save_loop(
            Arc::downgrade(&self.shared),
            first,
            period,
            token.clone(),
        ));

        let previous = lock(&self.shared.auto_save).replace(AutoSaveTask {
            period,
            _cancel: token.drop_guard(),
        });
        if previous.is_some() {
            debug!("replaced running auto-save");
        }
        info!(period_secs = period.as_secs(), "auto-save started");
        Ok(())
    }

    pub fn stop_auto_save(&self) {
        if lock(&self.shared.auto_save).take().is_some() {
            info!("auto-save stopped");
        }
    }

    /// Period of the running auto-save, if any.
    pub fn auto_save_period(&self) -> Option<Duration> {
        lock(&self.shared.auto_save).as_ref().map(|t| t.period)
    }
}

async fn auto_save_loop(
    shared: Weak<Shared>,
    first: Instant,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(first, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticks.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(e) = shared.save().await {
                    warn!(error = %e, "auto-save failed");
                }
            }
        }
    }
    debug!("auto-save loop exited");
}
