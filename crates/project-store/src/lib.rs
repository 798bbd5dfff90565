//! Persistence for project file trees.
//!
//! A project is stored as a flat `path -> contents` map plus a metadata row.
//! Backends: a local directory ([`LocalStore`]), Supabase storage and
//! PostgREST ([`SupabaseStore`]), and process memory ([`MemoryStore`]).

mod error;
mod http;
mod local;
mod lock;
mod memory;
mod store;
mod supabase;
mod types;

pub use error::{StoreError, StoreResult};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::ProjectStore;
pub use supabase::{SupabaseConfig, SupabaseStore};
pub use types::{
    ProjectFiles, ProjectKey, ProjectMetadata, StoredFile, UploadReceipt, validate_file_path,
    validate_project_id,
};
