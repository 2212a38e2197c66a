//! File backend implementations.
//!
//! - [BaseSandbox]: implement `execute` (plus binary upload/download) and every file
//!   operation comes for free, each one a single generated command. See [scripts].
//! - [LocalShellSandbox]: runs commands with a local shell in a working directory.
//! - [StoreBackend]: files stored in a [crate::tools::ToolStore]; reports `files_update`.
//! - [CompositeBackend]: routes requests by path prefix to different backends
//!   (longest-prefix match), e.g. `/memories/` to a [StoreBackend] over a sandbox default.
//! - [SandboxProvider]: named factories that create sandboxes on demand.

mod composite;
pub mod glob;
mod local_shell;
mod provider;
mod sandbox;
pub mod scripts;
mod store;

pub use crate::tools::{
    is_sandbox_backend, EditResult, ExecuteResponse, FileBackend, FileInfo, GrepMatch,
    GrepOutput, SandboxBackend, WriteResult,
};
pub use composite::CompositeBackend;
pub use glob::GlobMatcher;
pub use local_shell::{
    LocalShellConfig, LocalShellSandbox, LocalShellSandboxProvider, LOCAL_SHELL_SANDBOX_PROVIDER,
};
pub use provider::{SandboxCreateOptions, SandboxProvider};
pub use sandbox::BaseSandbox;
pub use store::StoreBackend;
