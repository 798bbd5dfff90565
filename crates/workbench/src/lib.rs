//! Sandbox orchestration for generated web projects.
//!
//! A session mirrors a project's file tree in memory, pushes it into a
//! sandbox, installs dependencies, starts the dev server and watches its
//! output until the server is ready. While the session is live, the tree is
//! saved periodically to a [`project_store::ProjectStore`].

pub mod classifier;
mod config;
mod error;
pub mod file_manager;
pub mod handle;
pub mod lifecycle;
pub mod notify;
pub mod tree;

pub use config::{RuleConfig, RuleEntry, WorkbenchConfig};
pub use error::{Result, WorkbenchError};
pub use file_manager::FileManager;
pub use handle::SandboxHandle;
pub use lifecycle::{Orchestrator, Phase};
pub use tree::{FileSystemTree, FileTree, GeneratedProject, PathNode};
