//! Base sandbox: every file operation derived from a single `execute` primitive.
//!
//! Implement [BaseSandbox] (an id, `execute`, and the binary upload/download pair) and
//! the type becomes a full [FileBackend] and [SandboxBackend]. Each provided method
//! synthesizes one command with [super::scripts], runs it once, and maps the exit code
//! and stdout back into a typed result.
//!
//! The execution target needs Node.js 20+ (see [super::scripts]).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::scripts::{
    build_edit_command, build_glob_command, build_grep_command, build_ls_command,
    build_read_command, build_write_command, EDIT_EXIT_AMBIGUOUS, EDIT_EXIT_FILE_MISSING,
    EDIT_EXIT_NOT_FOUND, FILE_EXISTS_MARKER, INVALID_REGEX_MARKER, WRITE_EXIT_EXISTS,
};
use crate::tools::{
    BackendError, EditResult, ExecuteResponse, FileBackend, FileDownloadResponse, FileInfo,
    FileUploadResponse, GrepMatch, GrepOutput, SandboxBackend, WriteResult, DEFAULT_SEARCH_PATH,
};

/// Sandbox with `execute` as the only operation that touches the environment.
///
/// The provided methods issue exactly one `execute` call each and never retry. They do
/// not coordinate with each other: two concurrent `edit` calls on the same file each
/// count occurrences on whatever content they see when their script runs, so the second
/// may act on a stale count. Serialize conflicting calls above this layer if that matters.
#[async_trait]
pub trait BaseSandbox: Send + Sync {
    /// Unique identifier for this sandbox instance.
    fn id(&self) -> &str;

    /// Run a command and capture combined stdout/stderr and exit status.
    ///
    /// Return `Err` only if the command could not be run at all.
    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError>;

    /// Upload files. Must return one response per input and support partial success.
    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError>;

    /// Download files. Must return one response per input and support partial success.
    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError>;

    /// List entries directly inside `path`. Listing failures yield an empty list.
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let command = build_ls_command(path);
        let result = BaseSandbox::execute(self, &command).await?;
        if !result.success() {
            log::debug!(
                "sandbox {}: ls {} exited with {:?}",
                BaseSandbox::id(self),
                path,
                result.exit_code
            );
            return Ok(Vec::new());
        }
        Ok(parse_json_lines::<EntryLine>(&result.output)
            .into_iter()
            .map(EntryLine::into_file_info)
            .collect())
    }

    /// Line-numbered content, or `"Error: File '<path>' not found"`.
    async fn read(
        &self,
        file_path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<String, BackendError> {
        let command = build_read_command(file_path, offset, limit);
        let result = BaseSandbox::execute(self, &command).await?;
        if !result.success() {
            return Ok(format!("Error: File '{}' not found", file_path));
        }
        Ok(result
            .output
            .strip_suffix('\n')
            .unwrap_or(&result.output)
            .to_string())
    }

    /// Regex search; an invalid pattern yields [GrepOutput::Error].
    async fn grep_raw(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<GrepOutput, BackendError> {
        let search_path = path.unwrap_or(DEFAULT_SEARCH_PATH);
        let command = build_grep_command(pattern, search_path, glob);
        let result = BaseSandbox::execute(self, &command).await?;
        if result.exit_code == Some(1) && result.output.contains(INVALID_REGEX_MARKER) {
            return Ok(GrepOutput::Error(result.output.trim().to_string()));
        }
        Ok(GrepOutput::Matches(parse_json_lines::<GrepMatch>(
            &result.output,
        )))
    }

    /// Files matching `pattern` under `path`; a missing `path` yields an empty list.
    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let command = build_glob_command(path, pattern);
        let result = BaseSandbox::execute(self, &command).await?;
        Ok(parse_json_lines::<EntryLine>(&result.output)
            .into_iter()
            .map(EntryLine::into_file_info)
            .collect())
    }

    /// Create a new file; existing paths are never overwritten.
    async fn write(&self, file_path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let command = build_write_command(file_path, content);
        let result = BaseSandbox::execute(self, &command).await?;
        Ok(match result.exit_code {
            Some(0) => WriteResult::written(file_path),
            Some(WRITE_EXIT_EXISTS) if result.output.contains(FILE_EXISTS_MARKER) => {
                WriteResult::failed(format!(
                    "Cannot write to {} because it already exists. Read and then make an edit, or write to a new path.",
                    file_path
                ))
            }
            code => {
                log::warn!(
                    "sandbox {}: write {} exited with {:?}",
                    BaseSandbox::id(self),
                    file_path,
                    code
                );
                WriteResult::failed(format!(
                    "Error writing file '{}': {}",
                    file_path,
                    result.output.trim()
                ))
            }
        })
    }

    /// String replacement with the exit-code taxonomy of the edit script.
    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult, BackendError> {
        let command = build_edit_command(file_path, old_string, new_string, replace_all);
        let result = BaseSandbox::execute(self, &command).await?;
        let path = file_path.to_string();
        Ok(match result.exit_code {
            Some(0) => {
                let occurrences = result
                    .output
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .unwrap_or(1);
                EditResult::applied(path, occurrences)
            }
            // the script exits 1 silently; output here means the command never ran
            Some(EDIT_EXIT_NOT_FOUND) if result.output.trim().is_empty() => {
                EditResult::StringNotFound { path }
            }
            Some(EDIT_EXIT_AMBIGUOUS) => EditResult::MultipleOccurrences { path },
            Some(EDIT_EXIT_FILE_MISSING) => EditResult::FileNotFound { path },
            exit_code => {
                log::warn!(
                    "sandbox {}: edit {} exited with {:?}: {}",
                    BaseSandbox::id(self),
                    file_path,
                    exit_code,
                    result.output.trim()
                );
                EditResult::Unknown { path, exit_code }
            }
        })
    }
}

#[async_trait]
impl<T: BaseSandbox> FileBackend for T {
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        BaseSandbox::ls_info(self, path).await
    }

    async fn read(
        &self,
        file_path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<String, BackendError> {
        BaseSandbox::read(self, file_path, offset, limit).await
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<GrepOutput, BackendError> {
        BaseSandbox::grep_raw(self, pattern, path, glob).await
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        BaseSandbox::glob_info(self, pattern, path).await
    }

    async fn write(&self, file_path: &str, content: &str) -> Result<WriteResult, BackendError> {
        BaseSandbox::write(self, file_path, content).await
    }

    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult, BackendError> {
        BaseSandbox::edit(self, file_path, old_string, new_string, replace_all).await
    }

    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError> {
        BaseSandbox::upload_files(self, files).await
    }

    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError> {
        BaseSandbox::download_files(self, paths).await
    }

    fn as_sandbox(&self) -> Option<&dyn SandboxBackend> {
        Some(self)
    }
}

#[async_trait]
impl<T: BaseSandbox> SandboxBackend for T {
    fn id(&self) -> &str {
        BaseSandbox::id(self)
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError> {
        BaseSandbox::execute(self, command).await
    }
}

/// One line of ls/glob script output.
#[derive(Deserialize)]
struct EntryLine {
    path: String,
    #[serde(default)]
    size: Option<u64>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    mtime: Option<f64>,
    #[serde(default, rename = "isDir")]
    is_dir: Option<bool>,
}

impl EntryLine {
    fn into_file_info(self) -> FileInfo {
        FileInfo {
            path: self.path,
            is_dir: self.is_dir,
            size: self.size,
            modified_at: self.mtime.and_then(millis_to_rfc3339),
        }
    }
}

fn millis_to_rfc3339(millis: f64) -> Option<String> {
    if !millis.is_finite() || millis == 0.0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse one JSON value per non-empty line, skipping lines that do not parse.
fn parse_json_lines<T: DeserializeOwned>(output: &str) -> Vec<T> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(_) => {
                log::debug!("skipping unparseable output line: {}", line);
                None
            }
        })
        .collect()
}
