use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::SandboxInstance;

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable name for this runtime implementation (e.g. "local").
    fn name(&self) -> &str;
    /// Verify the capability preconditions for booting.
    ///
    /// Returns [`SandboxError::EnvironmentUnsupported`](crate::SandboxError)
    /// when the host cannot run a sandbox at all. Callers check this before
    /// `boot()` so an unsupported environment fails fast instead of timing out.
    fn check_environment(&self) -> Result<()>;
    /// Boot a new sandbox instance. The instance is running when this returns.
    async fn boot(&self, config: SandboxConfig) -> Result<Arc<dyn SandboxInstance>>;
}
