use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use sandbox::{
    ErrorListener, OutputStream, ProcessInfo, SandboxError, SandboxInstance, SpawnRequest,
    SpawnedProcess,
};
use tokio::sync::{mpsc, oneshot};

use crate::lock;
use crate::runtime::Scripts;
use crate::script::{ProcessScript, Step};

/// Exit code reported for killed processes (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File(String),
}

struct Running {
    command: String,
    kill: Option<oneshot::Sender<()>>,
}

type Chunks = mpsc::UnboundedSender<io::Result<Bytes>>;

pub struct MockSandbox {
    id: String,
    scripts: Scripts,
    fs: Mutex<BTreeMap<String, Entry>>,
    failing_writes: Mutex<HashSet<String>>,
    /// Filesystem operations in call order, e.g. `mkdir -p a`, `write a/b.txt`.
    ops: Mutex<Vec<String>>,
    processes: Arc<Mutex<BTreeMap<u32, Running>>>,
    spawned: Mutex<Vec<String>>,
    killed: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
    torn_down: AtomicBool,
    listeners: Mutex<Vec<ErrorListener>>,
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn receiver_stream(rx: mpsc::UnboundedReceiver<io::Result<Bytes>>) -> OutputStream {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Replay a script; returns the exit code, or never returns for
/// long-running scripts.
async fn run_script(script: ProcessScript, stdout: Chunks, stderr: Chunks) -> i32 {
    for step in script.steps {
        match step {
            Step::Wait(delay) => tokio::time::sleep(delay).await,
            Step::Stdout(chunk) => {
                let _ = stdout.send(Ok(Bytes::from(chunk)));
            }
            Step::Stderr(chunk) => {
                let _ = stderr.send(Ok(Bytes::from(chunk)));
            }
            Step::StreamError(message) => {
                let _ = stdout.send(Err(io::Error::new(io::ErrorKind::BrokenPipe, message)));
            }
        }
    }
    match script.exit {
        Some(code) => code,
        None => std::future::pending().await,
    }
}

impl MockSandbox {
    pub(crate) fn new(id: String, scripts: Scripts) -> Self {
        Self {
            id,
            scripts,
            fs: Mutex::new(BTreeMap::new()),
            failing_writes: Mutex::new(HashSet::new()),
            ops: Mutex::new(Vec::new()),
            processes: Arc::new(Mutex::new(BTreeMap::new())),
            spawned: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(100),
            torn_down: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn ensure_running(&self) -> sandbox::Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            Err(SandboxError::NotRunning)
        } else {
            Ok(())
        }
    }

    fn is_dir_locked(fs: &BTreeMap<String, Entry>, path: &str) -> bool {
        path.is_empty() || fs.get(path) == Some(&Entry::Dir)
    }

    // -- inspection --

    pub fn file(&self, path: &str) -> Option<String> {
        match lock(&self.fs).get(path) {
            Some(Entry::File(contents)) => Some(contents.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        Self::is_dir_locked(&lock(&self.fs), path)
    }

    pub fn ops(&self) -> Vec<String> {
        lock(&self.ops).clone()
    }

    /// Command lines of every spawned process, in spawn order.
    pub fn spawned(&self) -> Vec<String> {
        lock(&self.spawned).clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.killed).clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    // -- fault injection --

    /// Make every write to `path` fail.
    pub fn fail_writes_to(&self, path: &str) {
        lock(&self.failing_writes).insert(path.to_owned());
    }

    /// Change a file behind the caller's back, as a process inside the
    /// sandbox would.
    pub fn set_file(&self, path: &str, contents: &str) {
        lock(&self.fs).insert(path.to_owned(), Entry::File(contents.to_owned()));
    }

    /// Deliver a fatal error to every registered listener.
    pub fn emit_error(&self, err: &SandboxError) {
        for listener in lock(&self.listeners).iter() {
            listener(err);
        }
    }
}

#[async_trait]
impl SandboxInstance for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> sandbox::Result<()> {
        self.ensure_running()?;
        let mut fs = lock(&self.fs);
        if recursive {
            lock(&self.ops).push(format!("mkdir -p {path}"));
            let mut prefix = String::new();
            for segment in path.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                match fs.get(&prefix) {
                    Some(Entry::File(_)) => return Err(SandboxError::fs(path, "not a directory")),
                    Some(Entry::Dir) => {}
                    None => {
                        fs.insert(prefix.clone(), Entry::Dir);
                    }
                }
            }
            return Ok(());
        }

        lock(&self.ops).push(format!("mkdir {path}"));
        if fs.contains_key(path) {
            return Err(SandboxError::fs(path, "already exists"));
        }
        if !Self::is_dir_locked(&fs, parent_of(path).unwrap_or("")) {
            return Err(SandboxError::fs(path, "parent directory does not exist"));
        }
        fs.insert(path.to_owned(), Entry::Dir);
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &str) -> sandbox::Result<()> {
        self.ensure_running()?;
        lock(&self.ops).push(format!("write {path}"));
        if lock(&self.failing_writes).contains(path) {
            return Err(SandboxError::fs(path, "injected write failure"));
        }
        let mut fs = lock(&self.fs);
        if !Self::is_dir_locked(&fs, parent_of(path).unwrap_or("")) {
            return Err(SandboxError::fs(path, "parent directory does not exist"));
        }
        if fs.get(path) == Some(&Entry::Dir) {
            return Err(SandboxError::fs(path, "is a directory"));
        }
        fs.insert(path.to_owned(), Entry::File(contents.to_owned()));
        Ok(())
    }

    async fn read_file(&self, path: &str) -> sandbox::Result<String> {
        self.ensure_running()?;
        self.file(path)
            .ok_or_else(|| SandboxError::fs(path, "no such file"))
    }

    async fn spawn(&self, request: &SpawnRequest<'_>) -> sandbox::Result<SpawnedProcess> {
        self.ensure_running()?;
        let command = request.command_line();
        let script = lock(&self.scripts)
            .get(&command)
            .cloned()
            .unwrap_or_default();

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();

        lock(&self.spawned).push(command.clone());
        lock(&self.processes).insert(
            pid,
            Running {
                command,
                kill: Some(kill_tx),
            },
        );

        let processes = Arc::clone(&self.processes);
        tokio::spawn(async move {
            let code = tokio::select! {
                code = run_script(script, stdout_tx, stderr_tx) => code,
                _ = kill_rx => KILLED_EXIT_CODE,
            };
            lock(&processes).remove(&pid);
            let _ = exit_tx.send(code);
        });

        let exit = async move {
            exit_rx
                .await
                .map_err(|_| SandboxError::Process(format!("process {pid} vanished")))
        }
        .boxed();

        Ok(SpawnedProcess {
            pid,
            output: receiver_stream(stdout_rx),
            errors: Some(receiver_stream(stderr_rx)),
            exit,
        })
    }

    async fn list_processes(&self) -> sandbox::Result<Vec<ProcessInfo>> {
        self.ensure_running()?;
        Ok(lock(&self.processes)
            .iter()
            .map(|(pid, running)| ProcessInfo {
                pid: *pid,
                command: running.command.clone(),
            })
            .collect())
    }

    async fn kill(&self, pid: u32) -> sandbox::Result<()> {
        let sender = lock(&self.processes)
            .get_mut(&pid)
            .and_then(|running| running.kill.take());
        match sender {
            Some(sender) => {
                lock(&self.killed).push(pid);
                let _ = sender.send(());
                Ok(())
            }
            None => Err(SandboxError::Process(format!("no such process: {pid}"))),
        }
    }

    async fn teardown(&self) -> sandbox::Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let senders: Vec<(u32, oneshot::Sender<()>)> = lock(&self.processes)
            .iter_mut()
            .filter_map(|(pid, running)| running.kill.take().map(|tx| (*pid, tx)))
            .collect();
        for (pid, sender) in senders {
            lock(&self.killed).push(pid);
            let _ = sender.send(());
        }
        Ok(())
    }

    fn on_error(&self, listener: ErrorListener) {
        lock(&self.listeners).push(listener);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::MockRuntime;
    use sandbox::{SandboxConfig, SandboxRuntime};

    async fn drain(mut stream: OutputStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(Ok(chunk)) = stream.next().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn write_needs_parent() {
        let runtime = MockRuntime::new();
        let sandbox = runtime.boot(SandboxConfig::new()).await.unwrap();

        assert!(sandbox.write_file("a/b.txt", "x").await.is_err());
        sandbox.mkdir("a", true).await.unwrap();
        sandbox.write_file("a/b.txt", "x").await.unwrap();
        assert_eq!(sandbox.read_file("a/b.txt").await.unwrap(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_process_replays_output() {
        let runtime = MockRuntime::new();
        runtime.script(
            "npm run dev",
            ProcessScript::new()
                .stdout("booting\n")
                .wait(Duration::from_secs(1))
                .stderr("warn\n")
                .exit(2),
        );
        let sandbox = runtime.boot(SandboxConfig::new()).await.unwrap();

        let process = sandbox
            .spawn(&SpawnRequest {
                program: "npm",
                args: &["run", "dev"],
            })
            .await
            .unwrap();

        assert_eq!(drain(process.output).await, b"booting\n");
        assert_eq!(drain(process.errors.unwrap()).await, b"warn\n");
        assert_eq!(process.exit.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn kill_ends_long_running_process() {
        let runtime = MockRuntime::new();
        runtime.script("sleep", ProcessScript::new().run_forever());
        let sandbox = runtime.boot(SandboxConfig::new()).await.unwrap();

        let process = sandbox
            .spawn(&SpawnRequest {
                program: "sleep",
                args: &[],
            })
            .await
            .unwrap();
        assert_eq!(sandbox.list_processes().await.unwrap().len(), 1);

        sandbox.kill(process.pid).await.unwrap();
        assert_eq!(process.exit.await.unwrap(), KILLED_EXIT_CODE);
        assert!(sandbox.list_processes().await.unwrap().is_empty());
    }
}
