use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use sandbox::{
    ErrorListener, ProcessInfo, SandboxError, SandboxInstance, SpawnRequest, SpawnedProcess,
};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::paths::SandboxPaths;
use crate::process::{exit_code, kill_process_group};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Running = 0,
    Stopped = 1,
}

type ProcessTable = Arc<Mutex<BTreeMap<u32, String>>>;
type Listeners = Arc<Mutex<Vec<ErrorListener>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A sandbox backed by a host workspace directory.
///
/// Processes run as host children in their own process group, with the
/// workspace as working directory.
pub struct LocalSandbox {
    id: String,
    paths: SandboxPaths,
    env: Vec<(String, String)>,
    keep_workspace: bool,
    state: AtomicU8,
    /// pid -> command line, shared with per-process waiter tasks.
    processes: ProcessTable,
    listeners: Listeners,
}

impl LocalSandbox {
    pub(crate) fn new(
        id: String,
        paths: SandboxPaths,
        env: Vec<(String, String)>,
        keep_workspace: bool,
    ) -> Self {
        Self {
            id,
            paths,
            env,
            keep_workspace,
            state: AtomicU8::new(SandboxState::Running as u8),
            processes: Arc::new(Mutex::new(BTreeMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    fn ensure_running(&self) -> sandbox::Result<()> {
        if self.state.load(Ordering::Acquire) == SandboxState::Running as u8 {
            Ok(())
        } else {
            Err(SandboxError::NotRunning)
        }
    }
}

/// Deliver a fatal error to every registered listener.
fn notify_listeners(listeners: &Listeners, err: &SandboxError) {
    for listener in lock(listeners).iter() {
        listener(err);
    }
}

#[async_trait]
impl SandboxInstance for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> sandbox::Result<()> {
        self.ensure_running()?;
        let host_path = self.paths.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&host_path).await
        } else {
            tokio::fs::create_dir(&host_path).await
        };
        result.map_err(|e| SandboxError::fs(path, format!("mkdir: {e}")))
    }

    async fn write_file(&self, path: &str, contents: &str) -> sandbox::Result<()> {
        self.ensure_running()?;
        let host_path = self.paths.resolve(path)?;
        tokio::fs::write(&host_path, contents.as_bytes())
            .await
            .map_err(|e| SandboxError::fs(path, format!("write: {e}")))
    }

    async fn read_file(&self, path: &str) -> sandbox::Result<String> {
        self.ensure_running()?;
        let host_path = self.paths.resolve(path)?;
        tokio::fs::read_to_string(&host_path)
            .await
            .map_err(|e| SandboxError::fs(path, format!("read: {e}")))
    }

    async fn spawn(&self, request: &SpawnRequest<'_>) -> sandbox::Result<SpawnedProcess> {
        self.ensure_running()?;
        let command = request.command_line();

        let mut child = tokio::process::Command::new(request.program)
            .args(request.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(self.paths.workspace())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(format!("{command}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| SandboxError::SpawnFailed(format!("{command}: exited before start")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed(format!("{command}: stdout not piped")))?;
        let errors = child
            .stderr
            .take()
            .map(|stderr| ReaderStream::new(stderr).boxed());

        lock(&self.processes).insert(pid, command.clone());
        info!(id = %self.id, pid, command = %command, "process spawned");

        // The waiter owns the child: it reaps the process, drops it from the
        // table, and resolves the exit future.
        let (exit_tx, exit_rx) = oneshot::channel();
        let processes = Arc::clone(&self.processes);
        let listeners = Arc::clone(&self.listeners);
        let id = self.id.clone();
        tokio::spawn(async move {
            let result = child.wait().await;
            lock(&processes).remove(&pid);
            let exit = match result {
                Ok(status) => {
                    let code = exit_code(status);
                    info!(id = %id, pid, code, "process exited");
                    Ok(code)
                }
                Err(e) => {
                    let err = SandboxError::Process(format!("wait for pid {pid}: {e}"));
                    warn!(id = %id, error = %err, "lost track of process");
                    notify_listeners(&listeners, &err);
                    Err(err)
                }
            };
            let _ = exit_tx.send(exit);
        });

        let exit = async move {
            match exit_rx.await {
                Ok(exit) => exit,
                Err(_) => Err(SandboxError::Process(format!("waiter for pid {pid} dropped"))),
            }
        }
        .boxed();

        Ok(SpawnedProcess {
            pid,
            output: ReaderStream::new(stdout).boxed(),
            errors,
            exit,
        })
    }

    async fn list_processes(&self) -> sandbox::Result<Vec<ProcessInfo>> {
        self.ensure_running()?;
        Ok(lock(&self.processes)
            .iter()
            .map(|(pid, command)| ProcessInfo {
                pid: *pid,
                command: command.clone(),
            })
            .collect())
    }

    async fn kill(&self, pid: u32) -> sandbox::Result<()> {
        if !lock(&self.processes).contains_key(&pid) {
            return Err(SandboxError::Process(format!("no such process: {pid}")));
        }
        if !kill_process_group(pid) {
            warn!(id = %self.id, pid, "killpg failed, process may already be gone");
        }
        Ok(())
    }

    async fn teardown(&self) -> sandbox::Result<()> {
        let prev = self
            .state
            .swap(SandboxState::Stopped as u8, Ordering::AcqRel);
        if prev == SandboxState::Stopped as u8 {
            return Ok(());
        }

        let pids: Vec<u32> = lock(&self.processes).keys().copied().collect();
        for pid in pids {
            kill_process_group(pid);
        }

        if !self.keep_workspace
            && let Err(e) = tokio::fs::remove_dir_all(self.paths.workspace()).await
        {
            warn!(id = %self.id, error = %e, "failed to delete workspace");
        }

        info!(id = %self.id, "sandbox torn down");
        Ok(())
    }

    fn on_error(&self, listener: ErrorListener) {
        lock(&self.listeners).push(listener);
    }
}
