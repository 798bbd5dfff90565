mod config;
mod paths;
mod prerequisites;
mod process;
mod runtime;
mod sandbox;

pub use config::LocalConfig;
pub use paths::{RuntimePaths, SandboxPaths};
pub use runtime::LocalRuntime;
pub use self::sandbox::LocalSandbox;
