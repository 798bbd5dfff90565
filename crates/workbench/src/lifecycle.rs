//! One project session: boot, mount, install, serve.
//!
//! ```text
//! Idle -> Booting -> Mounting -> Installing -> Serving -> Ready
//!            \          \            \            \
//!             +----------+------------+------------+--> Failed
//! ```
//!
//! `Failed` can be retried from `Mounting` (or `Booting` when the sandbox is
//! gone). `shutdown()` returns any phase to `Idle`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use project_store::{ProjectStore, UploadReceipt};
use sandbox::{OutputStream, SandboxInstance, SandboxRuntime, SpawnRequest, SpawnedProcess};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::{Classifier, Outcome, RuleSet, find_url};
use crate::config::WorkbenchConfig;
use crate::error::{Result, WorkbenchError};
use crate::file_manager::FileManager;
use crate::handle::SandboxHandle;
use crate::notify::OutputSink;
use crate::tree::{self, Entry, FileTree};

/// How long to wait for install output to drain after the process exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Booting,
    Mounting,
    Installing,
    Serving,
    Ready,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Booting => "booting",
            Phase::Mounting => "mounting",
            Phase::Installing => "installing",
            Phase::Serving => "serving",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl Phase {
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, Booting)
                | (Booting, Mounting)
                | (Mounting, Installing)
                | (Installing, Serving)
                | (Serving, Ready)
                | (Booting | Mounting | Installing | Serving, Failed)
                | (Failed, Booting | Mounting)
        )
    }

    /// A phase in which work is in progress.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Phase::Booting | Phase::Mounting | Phase::Installing | Phase::Serving
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one project session against a sandbox runtime and a store.
pub struct Orchestrator {
    config: WorkbenchConfig,
    rules: RuleSet,
    sandbox: SandboxHandle,
    store: Arc<dyn ProjectStore>,
    sink: OutputSink,
    phase: watch::Sender<Phase>,
    files: Mutex<Option<Arc<FileManager>>>,
    server_url: Mutex<Option<String>>,
    serve_pid: Mutex<Option<u32>>,
}

impl Orchestrator {
    /// Validates `config`. `sink` receives all install and serve output.
    pub fn new(
        config: WorkbenchConfig,
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn ProjectStore>,
        sink: OutputSink,
    ) -> Result<Self> {
        config.validate()?;
        let rules = config.serve_rules.build()?;
        let sandbox = SandboxHandle::new(runtime, config.boot_timeout());
        let (phase, _) = watch::channel(Phase::Idle);
        Ok(Self {
            config,
            rules,
            sandbox,
            store,
            sink,
            phase,
            files: Mutex::new(None),
            server_url: Mutex::new(None),
            serve_pid: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver that sees every phase change.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn file_manager(&self) -> Option<Arc<FileManager>> {
        lock(&self.files).clone()
    }

    /// Dev server URL, once `Ready` and if the server printed one.
    pub fn server_url(&self) -> Option<String> {
        lock(&self.server_url).clone()
    }

    /// Start a session for `files`. Only valid from `Idle`.
    pub async fn start(&self, project_name: &str, files: FileTree) -> Result<()> {
        let from = self.phase();
        if from != Phase::Idle {
            return Err(WorkbenchError::InvalidTransition {
                from,
                to: Phase::Booting,
            });
        }

        let manager = Arc::new(FileManager::new(
            self.sandbox.clone(),
            Arc::clone(&self.store),
        ));
        manager.initialize(project_name, files).await?;
        *lock(&self.files) = Some(manager);

        self.run(Phase::Booting).await
    }

    /// Re-run a failed session from `Mounting`, booting a new sandbox first
    /// if the old one is gone.
    pub async fn retry(&self) -> Result<()> {
        let from = self.phase();
        if from != Phase::Failed {
            return Err(WorkbenchError::InvalidTransition {
                from,
                to: Phase::Mounting,
            });
        }
        let entry = if self.sandbox.current().is_some() {
            Phase::Mounting
        } else {
            Phase::Booting
        };
        info!(from = %entry, "retrying session");
        self.run(entry).await
    }

    /// Stop auto-save, tear the sandbox down and forget the session.
    pub async fn shutdown(&self) {
        let manager = lock(&self.files).take();
        if let Some(manager) = &manager {
            manager.stop_auto_save();
        }
        lock(&self.serve_pid).take();
        lock(&self.server_url).take();
        self.sandbox.teardown().await;
        self.phase.send_replace(Phase::Idle);
        info!("session shut down");
    }

    pub async fn save_now(&self) -> Result<UploadReceipt> {
        let manager = self.file_manager().ok_or(WorkbenchError::NotInitialized)?;
        manager.save_now().await
    }

    async fn run(&self, entry: Phase) -> Result<()> {
        match self.drive(entry).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let phase = self.phase();
                let err = e.in_phase(phase);
                warn!(phase = %phase, error = %err, retryable = err.is_retryable(), "session failed");
                self.phase.send_if_modified(|current| {
                    let fail = current.can_transition(Phase::Failed);
                    if fail {
                        *current = Phase::Failed;
                    }
                    fail
                });
                Err(err)
            }
        }
    }

    async fn drive(&self, entry: Phase) -> Result<()> {
        let manager = self.file_manager().ok_or(WorkbenchError::NotInitialized)?;

        let instance = if entry == Phase::Booting {
            self.transition(Phase::Booting)?;
            self.sandbox.acquire().await?
        } else {
            self.sandbox
                .current()
                .ok_or(WorkbenchError::Sandbox(sandbox::SandboxError::NotRunning))?
        };

        self.transition(Phase::Mounting)?;
        mount(instance.as_ref(), &manager.tree()?).await?;

        self.transition(Phase::Installing)?;
        self.install(instance.as_ref()).await?;

        self.transition(Phase::Serving)?;
        let url = self.serve(instance.as_ref()).await?;

        self.transition(Phase::Ready)?;
        if let Some(url) = &url {
            info!(url = %url, "dev server ready");
        }
        *lock(&self.server_url) = url;
        manager.start_auto_save(self.config.auto_save_period())?;
        Ok(())
    }

    fn transition(&self, to: Phase) -> Result<()> {
        let mut from = to;
        let changed = self.phase.send_if_modified(|current| {
            from = *current;
            let ok = current.can_transition(to);
            if ok {
                *current = to;
            }
            ok
        });
        if changed {
            info!(from = %from, to = %to, "phase changed");
            Ok(())
        } else {
            Err(WorkbenchError::InvalidTransition { from, to })
        }
    }

    async fn install(&self, instance: &dyn SandboxInstance) -> Result<()> {
        let process = spawn(instance, &self.config.install_command).await?;
        let pid = process.pid;
        let output = Classifier::new(RuleSet::new(), Arc::clone(&self.sink))
            .watch(combined(process.output, process.errors));

        let deadline = self.config.install_timeout();
        let exit_code = match tokio::time::timeout(deadline, process.exit).await {
            Ok(exit) => exit?,
            Err(_) => {
                kill(instance, pid).await;
                return Err(WorkbenchError::Timeout(deadline));
            }
        };

        if exit_code == 0 {
            info!(pid, "install finished");
            return Ok(());
        }
        let tail = output.settle(OUTPUT_DRAIN).await.tail;
        Err(WorkbenchError::InstallFailed { exit_code, tail })
    }

    /// Start the dev server and wait until its output says it is ready.
    /// Returns the URL it printed, if any.
    async fn serve(&self, instance: &dyn SandboxInstance) -> Result<Option<String>> {
        // A server left over from an earlier attempt would hold the port.
        match instance.list_processes().await {
            Ok(stale) => {
                for process in stale {
                    info!(pid = process.pid, command = %process.command, "killing stale process");
                    kill(instance, process.pid).await;
                }
            }
            Err(e) => warn!(error = %e, "list processes failed"),
        }

        let process = spawn(instance, &self.config.serve_command).await?;
        let pid = process.pid;
        *lock(&self.serve_pid) = Some(pid);

        let deadline = self.config.serve_timeout();
        let result = Classifier::new(self.rules.clone(), Arc::clone(&self.sink))
            .watch(combined(process.output, process.errors))
            .settle(deadline)
            .await;

        let failure = match result.outcome {
            Outcome::Success(verdict) => {
                return Ok(find_url(&verdict.excerpt).or_else(|| find_url(&result.tail)));
            }
            Outcome::Failure(verdict) => WorkbenchError::ServeFailed {
                reason: verdict.pattern,
                excerpt: verdict.excerpt,
            },
            Outcome::Timeout => WorkbenchError::Timeout(deadline),
            Outcome::StreamAborted(message) => WorkbenchError::StreamAborted(message),
            Outcome::Closed => WorkbenchError::ServeFailed {
                reason: "dev server exited before it was ready".into(),
                excerpt: result.tail,
            },
        };

        kill(instance, pid).await;
        lock(&self.serve_pid).take();
        Err(failure)
    }
}

/// Push the tree into the sandbox: directories before their contents, and
/// each file's parent created before the file is written.
async fn mount(instance: &dyn SandboxInstance, tree: &FileTree) -> Result<()> {
    let mut files = 0usize;
    for entry in tree.walk() {
        match entry {
            Entry::Dir { path } => instance.mkdir(&path, true).await?,
            Entry::File { path, contents } => {
                if let Some(parent) = tree::parent_dir(&path) {
                    instance.mkdir(parent, true).await?;
                }
                instance.write_file(&path, contents).await?;
                files += 1;
            }
        }
    }
    info!(id = instance.id(), files, "project mounted");
    Ok(())
}

async fn spawn(instance: &dyn SandboxInstance, command: &[String]) -> Result<SpawnedProcess> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| WorkbenchError::Config("empty command".into()))?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let request = SpawnRequest {
        program,
        args: &args,
    };
    info!(command = %request.command_line(), "spawning");
    Ok(instance.spawn(&request).await?)
}

async fn kill(instance: &dyn SandboxInstance, pid: u32) {
    if let Err(e) = instance.kill(pid).await {
        warn!(pid, error = %e, "kill failed");
    }
}

/// Output and error streams interleaved in arrival order.
fn combined(output: OutputStream, errors: Option<OutputStream>) -> OutputStream {
    match errors {
        Some(errors) => futures_util::stream::select(output, errors).boxed(),
        None => output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use Phase::*;
        assert!(Idle.can_transition(Booting));
        assert!(!Idle.can_transition(Mounting));
        assert!(Serving.can_transition(Ready));
        assert!(Installing.can_transition(Failed));
        assert!(Failed.can_transition(Mounting));
        assert!(!Ready.can_transition(Failed));
        assert!(!Ready.can_transition(Booting));
        assert!(!Failed.can_transition(Ready));
        assert!(!Idle.can_transition(Failed));
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Installing.to_string(), "installing");
        assert!(Phase::Serving.is_active());
        assert!(!Phase::Ready.is_active());
    }
}
