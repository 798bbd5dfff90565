mod config;
mod error;
mod runtime;
mod sandbox;
mod types;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use runtime::SandboxRuntime;
pub use sandbox::{ErrorListener, SandboxInstance};
pub use types::{ExitFuture, OutputStream, ProcessInfo, SpawnRequest, SpawnedProcess};
