//! # deepagents-sandbox
//!
//! The sandbox backend protocol for deep agent filesystem tools: one trait surface for
//! listing, reading, searching, writing and editing files, whether those files live on a
//! remote container, a local directory or an agent's state store.
//!
//! ## Overview
//!
//! - **Protocol** ([tools]): [tools::FileBackend], [tools::SandboxBackend] and the
//!   result records they exchange
//! - **Base sandbox** ([backends::BaseSandbox]): implement `execute` once, get every file
//!   operation as a generated `node -e` command
//! - **Backends**: local shell sandbox, store-backed files, prefix routing
//!
//! ## Example
//!
//! ```ignore
//! use deepagents_sandbox::backends::{LocalShellConfig, LocalShellSandbox};
//! use deepagents_sandbox::tools::{FileBackend, DEFAULT_READ_LIMIT};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sandbox = LocalShellSandbox::new(LocalShellConfig::new("/tmp/agent"))?;
//! sandbox.write("/tmp/agent/notes.txt", "hello\n").await?;
//! let text = sandbox.read("/tmp/agent/notes.txt", 0, DEFAULT_READ_LIMIT).await?;
//! # Ok(()) }
//! ```

/// Backends: base sandbox adapter, local shell sandbox, store and composite backends.
pub mod backends;
/// Protocol types: file backend traits, result records, errors, stores.
pub mod tools;

use std::sync::Arc;

/// Type alias for a file backend wrapped in Arc
pub type Backend = Arc<dyn crate::tools::FileBackend>;

/// Type alias for a sandbox backend wrapped in Arc
pub type Sandbox = Arc<dyn crate::tools::SandboxBackend>;

/// Type alias for tool store
pub type ToolStore = Arc<dyn crate::tools::ToolStore>;
