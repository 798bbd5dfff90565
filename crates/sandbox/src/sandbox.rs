use async_trait::async_trait;

use crate::error::{Result, SandboxError};
use crate::types::{ProcessInfo, SpawnRequest, SpawnedProcess};

/// Callback invoked on a fatal, instance-level error.
pub type ErrorListener = Box<dyn Fn(&SandboxError) + Send + Sync>;

/// One running sandbox: a private filesystem plus a process table.
///
/// Paths are relative to the sandbox root and `/`-separated.
#[async_trait]
pub trait SandboxInstance: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;

    // -- filesystem --
    /// Create a directory. With `recursive`, missing parents are created and
    /// an existing directory is not an error.
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()>;
    /// Write a file. Fails if the parent directory does not exist.
    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;
    async fn read_file(&self, path: &str) -> Result<String>;

    // -- processes --
    async fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedProcess>;
    /// Processes currently owned by this instance.
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;
    async fn kill(&self, pid: u32) -> Result<()>;

    // -- lifecycle --
    /// Stop every process and release the instance. Idempotent.
    async fn teardown(&self) -> Result<()>;
    /// Register a listener for fatal instance errors.
    fn on_error(&self, listener: ErrorListener);
}
