//! Pluggable file backend protocol.
//!
//! Two traits describe what a backend can do:
//!
//! - [FileBackend]: structured file operations (ls, read, grep, glob, write, edit)
//!   plus batch upload/download.
//! - [SandboxBackend]: a [FileBackend] that can also run commands. Every sandbox has an
//!   opaque [SandboxBackend::id].
//!
//! Use [FileBackend::as_sandbox] (or [is_sandbox_backend]) to find out whether a given
//! backend is sandbox-capable; do not re-derive the check elsewhere.
//!
//! Methods return `Err(BackendError)` only when the backend could not run the operation
//! at all. Not-found files, ambiguous edits and invalid patterns are `Ok` values.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::BackendError;
use super::store::ToolStore;

/// Default 0-indexed line offset for [FileBackend::read].
pub const DEFAULT_READ_OFFSET: usize = 0;
/// Default maximum number of lines returned by [FileBackend::read].
pub const DEFAULT_READ_LIMIT: usize = 500;
/// Default base path for [FileBackend::grep_raw] and [FileBackend::glob_info].
pub const DEFAULT_SEARCH_PATH: &str = "/";

/// Metadata for a single file or directory.
///
/// Only `path` is guaranteed. Directories carry a trailing `/` and `is_dir = Some(true)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// RFC 3339 timestamp of last modification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            is_dir: Some(false),
            size: Some(size),
            modified_at: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            is_dir: Some(true),
            size: Some(0),
            modified_at: None,
        }
    }

    pub fn with_modified_at(mut self, modified_at: impl Into<String>) -> Self {
        self.modified_at = Some(modified_at.into());
        self
    }
}

/// A single grep match (path, 1-indexed line number, line text).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line: u64,
    pub text: String,
}

/// Result of [FileBackend::grep_raw]: matches, or an error message for invalid input
/// (e.g. a pattern that is not a valid regex).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrepOutput {
    Matches(Vec<GrepMatch>),
    Error(String),
}

impl GrepOutput {
    pub fn matches(&self) -> Option<&[GrepMatch]> {
        match self {
            GrepOutput::Matches(m) => Some(m),
            GrepOutput::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            GrepOutput::Matches(_) => None,
            GrepOutput::Error(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<Vec<GrepMatch>, String> {
        match self {
            GrepOutput::Matches(m) => Ok(m),
            GrepOutput::Error(e) => Err(e),
        }
    }
}

/// In-memory representation of a file for state-backed backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    /// Lines of text content.
    pub content: Vec<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last modification timestamp.
    pub modified_at: String,
}

impl FileData {
    pub fn new(content: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            content: split_lines(content),
            created_at: now.clone(),
            modified_at: now,
        }
    }

    /// Same file with new content; keeps `created_at`.
    pub fn updated(&self, content: &str) -> Self {
        Self {
            content: split_lines(content),
            created_at: self.created_at.clone(),
            modified_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn text(&self) -> String {
        self.content.join("\n")
    }

    pub fn size(&self) -> u64 {
        self.text().len() as u64
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content.split('\n').map(String::from).collect()
}

/// State update for checkpoint backends: `{file_path: file_data}`.
pub type FilesUpdate = HashMap<String, FileData>;

/// Free-form metadata attached to write/edit outcomes.
pub type Metadata = Map<String, Value>;

/// Result of [FileBackend::write]. Exactly one of `error()` / `path()` is set.
///
/// Backends over external storage (disk, container, remote agent) leave
/// `files_update` as `None`: the data is already persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteResult {
    Written {
        path: String,
        files_update: Option<FilesUpdate>,
        metadata: Option<Metadata>,
    },
    Failed {
        error: String,
    },
}

impl WriteResult {
    pub fn written(path: impl Into<String>) -> Self {
        WriteResult::Written {
            path: path.into(),
            files_update: None,
            metadata: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        WriteResult::Failed {
            error: error.into(),
        }
    }

    pub fn with_files_update(self, update: FilesUpdate) -> Self {
        match self {
            WriteResult::Written { path, metadata, .. } => WriteResult::Written {
                path,
                files_update: Some(update),
                metadata,
            },
            failed => failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            WriteResult::Written { .. } => None,
            WriteResult::Failed { error } => Some(error),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            WriteResult::Written { path, .. } => Some(path),
            WriteResult::Failed { .. } => None,
        }
    }

    pub fn files_update(&self) -> Option<&FilesUpdate> {
        match self {
            WriteResult::Written { files_update, .. } => files_update.as_ref(),
            WriteResult::Failed { .. } => None,
        }
    }
}

/// Result of [FileBackend::edit].
///
/// A replacement is applied only when the old string occurs exactly once, or when
/// `replace_all` was requested and it occurs at least once. Ambiguity is never guessed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EditResult {
    Applied {
        path: String,
        occurrences: usize,
        files_update: Option<FilesUpdate>,
        metadata: Option<Metadata>,
    },
    /// The old string does not occur in the file.
    StringNotFound { path: String },
    /// The old string occurs more than once and `replace_all` was not set.
    MultipleOccurrences { path: String },
    /// The file does not exist or could not be read.
    FileNotFound { path: String },
    /// The backend reported an outcome outside the known taxonomy.
    Unknown { path: String, exit_code: Option<i32> },
}

impl EditResult {
    pub fn applied(path: impl Into<String>, occurrences: usize) -> Self {
        EditResult::Applied {
            path: path.into(),
            occurrences,
            files_update: None,
            metadata: None,
        }
    }

    pub fn with_files_update(self, update: FilesUpdate) -> Self {
        match self {
            EditResult::Applied {
                path,
                occurrences,
                metadata,
                ..
            } => EditResult::Applied {
                path,
                occurrences,
                files_update: Some(update),
                metadata,
            },
            other => other,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, EditResult::Applied { .. })
    }

    /// Human-readable error message, `None` on success.
    pub fn error(&self) -> Option<String> {
        match self {
            EditResult::Applied { .. } => None,
            EditResult::StringNotFound { path } => {
                Some(format!("String not found in file '{}'", path))
            }
            EditResult::MultipleOccurrences { path } => Some(format!(
                "Multiple occurrences found in '{}'. Use replace_all=true to replace all.",
                path
            )),
            EditResult::FileNotFound { path } => Some(format!("Error: File '{}' not found", path)),
            EditResult::Unknown { path, .. } => {
                Some(format!("Unknown error editing file '{}'", path))
            }
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            EditResult::Applied { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn occurrences(&self) -> Option<usize> {
        match self {
            EditResult::Applied { occurrences, .. } => Some(*occurrences),
            _ => None,
        }
    }

    pub fn files_update(&self) -> Option<&FilesUpdate> {
        match self {
            EditResult::Applied { files_update, .. } => files_update.as_ref(),
            _ => None,
        }
    }
}

/// Result of [SandboxBackend::execute].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Combined stdout and stderr.
    pub output: String,
    /// Process exit code; `None` when the process did not exit normally (timeout, signal).
    pub exit_code: Option<i32>,
    /// Whether `output` was cut short by the backend.
    pub truncated: bool,
}

impl ExecuteResponse {
    pub fn new(output: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            output: output.into(),
            exit_code,
            truncated: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Standardized per-file error codes for upload/download batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationError {
    FileNotFound,
    PermissionDenied,
    IsDirectory,
    InvalidPath,
}

impl FileOperationError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperationError::FileNotFound => "file_not_found",
            FileOperationError::PermissionDenied => "permission_denied",
            FileOperationError::IsDirectory => "is_directory",
            FileOperationError::InvalidPath => "invalid_path",
        }
    }

    /// Map an IO error onto the closed error set; anything unrecognized is `invalid_path`.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FileOperationError::FileNotFound,
            std::io::ErrorKind::PermissionDenied => FileOperationError::PermissionDenied,
            std::io::ErrorKind::IsADirectory => FileOperationError::IsDirectory,
            _ => FileOperationError::InvalidPath,
        }
    }
}

impl std::fmt::Display for FileOperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of uploading one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub path: String,
    pub error: Option<FileOperationError>,
}

impl FileUploadResponse {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: FileOperationError) -> Self {
        Self {
            path: path.into(),
            error: Some(error),
        }
    }
}

/// Outcome of downloading one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadResponse {
    pub path: String,
    pub content: Option<Vec<u8>>,
    pub error: Option<FileOperationError>,
}

impl FileDownloadResponse {
    pub fn ok(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: FileOperationError) -> Self {
        Self {
            path: path.into(),
            content: None,
            error: Some(error),
        }
    }
}

/// Pluggable backend for filesystem tools (ls, read_file, write_file, edit_file, glob, grep).
///
/// Implementations: [crate::backends::BaseSandbox] types (anything reachable through a
/// command channel), [crate::backends::StoreBackend] (state-backed),
/// [crate::backends::CompositeBackend] (routing).
///
/// No serialization is provided between concurrent calls. Two callers doing
/// read-then-edit on the same path race; serialize at a higher level if needed.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// List entries directly inside `path` (non-recursive). Failure to list yields an empty list.
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>, BackendError>;

    /// Read up to `limit` lines starting at the 0-indexed line `offset`, formatted as
    /// `"{line_number:>6}\t{text}"`. A missing file yields `"Error: File '<path>' not found"`.
    async fn read(&self, file_path: &str, offset: usize, limit: usize)
        -> Result<String, BackendError>;

    /// Regex search over files under `path` (default `/`), optionally filtered by a glob.
    async fn grep_raw(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<GrepOutput, BackendError>;

    /// Files under `path` whose relative path matches the glob `pattern`.
    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, BackendError>;

    /// Create a new file. Never overwrites: an existing path yields [WriteResult::Failed].
    async fn write(&self, file_path: &str, content: &str) -> Result<WriteResult, BackendError>;

    /// Replace `old_string` with `new_string`. See [EditResult] for the outcome taxonomy.
    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult, BackendError>;

    /// Upload files. Returns exactly one response per input, in input order.
    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError>;

    /// Download files. Returns exactly one response per input, in input order.
    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError>;

    /// This backend as a [SandboxBackend], if it supports command execution.
    fn as_sandbox(&self) -> Option<&dyn SandboxBackend> {
        None
    }
}

/// A [FileBackend] running in an isolated environment that can execute commands.
#[async_trait]
pub trait SandboxBackend: FileBackend {
    /// Unique identifier of this sandbox instance.
    fn id(&self) -> &str;

    /// Run a command string and capture combined output and exit status.
    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError>;
}

/// Whether `backend` supports command execution.
pub fn is_sandbox_backend(backend: &dyn FileBackend) -> bool {
    backend.as_sandbox().is_some()
}

/// What a backend needs at construction time: current agent state, an optional
/// persistent store and an optional assistant id for per-assistant isolation.
#[derive(Clone, Default)]
pub struct StateAndStore {
    pub state: Value,
    pub store: Option<Arc<dyn ToolStore>>,
    pub assistant_id: Option<String>,
}

impl StateAndStore {
    pub fn new(state: Value) -> Self {
        Self {
            state,
            store: None,
            assistant_id: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ToolStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_assistant_id(mut self, assistant_id: impl Into<String>) -> Self {
        self.assistant_id = Some(assistant_id.into());
        self
    }
}

impl std::fmt::Debug for StateAndStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAndStore")
            .field("state", &self.state)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("assistant_id", &self.assistant_id)
            .finish()
    }
}

/// Builds a backend for a request context.
pub type BackendFactory = Arc<dyn Fn(&StateAndStore) -> Arc<dyn FileBackend> + Send + Sync>;
