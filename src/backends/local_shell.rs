//! Local shell sandbox: runs commands with a local shell inside a working directory.
//!
//! All file operations come from [BaseSandbox]; this type only provides `execute` and
//! binary upload/download. It offers no isolation beyond the working directory used as
//! the process cwd: commands can reach anything the current user can.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::provider::{SandboxCreateOptions, SandboxProvider};
use super::sandbox::BaseSandbox;
use crate::tools::{
    BackendError, ExecuteResponse, FileDownloadResponse, FileOperationError, FileUploadResponse,
    SandboxBackend,
};

/// Type key of [LocalShellSandboxProvider].
pub const LOCAL_SHELL_SANDBOX_PROVIDER: &str = "local-shell-sandbox";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_SHELL: &str = "/bin/bash";
const TIMEOUT_NOTICE: &str = "\n[Command timed out]";

/// Configuration for [LocalShellSandbox].
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalShellConfig {
    /// Directory commands run in; created if missing. Relative paths resolve against the process cwd.
    pub working_directory: PathBuf,
    /// Per-command timeout in milliseconds.
    pub timeout_ms: u64,
    /// Combined stdout/stderr kept per command; the rest is dropped and `truncated` set.
    pub max_output_bytes: usize,
    /// Shell invoked as `<shell> -c <command>`.
    pub shell: String,
}

impl Default for LocalShellConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("sandbox"),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

impl LocalShellConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn validate(&self) -> Result<(), BackendError> {
        if self.timeout_ms == 0 {
            return Err(BackendError::Configuration(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(BackendError::Configuration(
                "shell must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sandbox that executes commands with a local shell in a working directory.
pub struct LocalShellSandbox {
    id: String,
    working_directory: PathBuf,
    config: LocalShellConfig,
}

impl LocalShellSandbox {
    /// Create the sandbox, creating its working directory if needed.
    pub fn new(config: LocalShellConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let dir = if config.working_directory.is_absolute() {
            config.working_directory.clone()
        } else {
            std::env::current_dir()?.join(&config.working_directory)
        };
        std::fs::create_dir_all(&dir)?;
        let working_directory = dir.canonicalize()?;
        let id = format!(
            "local-shell-{}",
            working_directory
                .to_string_lossy()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect::<String>()
        );
        log::debug!("created local shell sandbox {}", id);
        Ok(Self {
            id,
            working_directory,
            config,
        })
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn config(&self) -> &LocalShellConfig {
        &self.config
    }

    /// Map a caller path onto the working directory. Absolute paths inside the working
    /// directory are used as is; any other leading `/` is ignored. `..`, prefixes and
    /// empty paths are rejected.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let path = Path::new(path.trim());
        let relative = path.strip_prefix(&self.working_directory).unwrap_or(path);
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        if relative.as_os_str().is_empty() {
            return None;
        }
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        contained.then(|| self.working_directory.join(relative))
    }
}

impl std::fmt::Debug for LocalShellSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalShellSandbox")
            .field("id", &self.id)
            .field("working_directory", &self.working_directory)
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}

/// Combined output of both pipes, capped at a byte budget.
struct OutputBuffer {
    bytes: Vec<u8>,
    max: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(max: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.max.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, buffer: Arc<Mutex<OutputBuffer>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().await.push(&chunk[..n]),
        }
    }
}

fn upload_error(err: &std::io::Error) -> FileOperationError {
    match FileOperationError::from_io(err) {
        FileOperationError::FileNotFound => FileOperationError::InvalidPath,
        other => other,
    }
}

fn download_error(err: &std::io::Error) -> FileOperationError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => FileOperationError::PermissionDenied,
        _ => FileOperationError::FileNotFound,
    }
}

async fn write_bytes(full: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Ok(meta) = tokio::fs::metadata(full).await {
        if meta.is_dir() {
            return Err(std::io::ErrorKind::IsADirectory.into());
        }
    }
    tokio::fs::write(full, content).await
}

#[async_trait]
impl BaseSandbox for LocalShellSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError> {
        let spawned = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                log::warn!("sandbox {}: failed to spawn {}: {}", self.id, self.config.shell, e);
                return Ok(ExecuteResponse::new(
                    format!("Error spawning process: {}", e),
                    Some(1),
                ));
            }
        };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.config.max_output_bytes)));
        let stdout = pump(child.stdout.take(), buffer.clone());
        let stderr = pump(child.stderr.take(), buffer.clone());
        let wait = child.wait();
        let run = async move {
            let (_, _, status) = tokio::join!(stdout, stderr, wait);
            status
        };
        let outcome =
            tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), run).await;

        let (exit_code, timed_out) = match outcome {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                log::warn!(
                    "sandbox {}: command timed out after {}ms",
                    self.id,
                    self.config.timeout_ms
                );
                if let Err(e) = child.kill().await {
                    log::warn!("sandbox {}: failed to kill timed out command: {}", self.id, e);
                }
                (None, true)
            }
        };

        let buffer = buffer.lock().await;
        let mut output = String::from_utf8_lossy(&buffer.bytes).into_owned();
        if timed_out {
            output.push_str(TIMEOUT_NOTICE);
        }
        Ok(ExecuteResponse {
            output,
            exit_code,
            truncated: buffer.truncated,
        })
    }

    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError> {
        let mut results = Vec::with_capacity(files.len());
        for (path, content) in files {
            let response = match self.resolve(&path) {
                None => FileUploadResponse::failed(path, FileOperationError::InvalidPath),
                Some(full) => match write_bytes(&full, &content).await {
                    Ok(()) => FileUploadResponse::ok(path),
                    Err(e) => FileUploadResponse::failed(path, upload_error(&e)),
                },
            };
            results.push(response);
        }
        Ok(results)
    }

    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(full) = self.resolve(path) else {
                results.push(FileDownloadResponse::failed(
                    path.clone(),
                    FileOperationError::InvalidPath,
                ));
                continue;
            };
            let response = match tokio::fs::metadata(&full).await {
                Err(e) => FileDownloadResponse::failed(path.clone(), download_error(&e)),
                Ok(meta) if meta.is_dir() => {
                    FileDownloadResponse::failed(path.clone(), FileOperationError::IsDirectory)
                }
                Ok(_) => match tokio::fs::read(&full).await {
                    Ok(bytes) => FileDownloadResponse::ok(path.clone(), bytes),
                    Err(e) => FileDownloadResponse::failed(path.clone(), download_error(&e)),
                },
            };
            results.push(response);
        }
        Ok(results)
    }
}

/// Provider creating [LocalShellSandbox] instances.
///
/// Without an explicit working directory, sandboxes run in `<cwd>/sandbox`.
#[derive(Clone, Debug, Default)]
pub struct LocalShellSandboxProvider {
    config: LocalShellConfig,
}

impl LocalShellSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template config; its working directory is replaced per [SandboxCreateOptions].
    pub fn with_config(mut self, config: LocalShellConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_working_dir() -> Result<PathBuf, BackendError> {
        Ok(std::env::current_dir()?.join("sandbox"))
    }
}

#[async_trait]
impl SandboxProvider for LocalShellSandboxProvider {
    fn provider_type(&self) -> &str {
        LOCAL_SHELL_SANDBOX_PROVIDER
    }

    fn name(&self) -> &str {
        "Local Shell Sandbox"
    }

    async fn create(
        &self,
        options: SandboxCreateOptions,
    ) -> Result<Arc<dyn SandboxBackend>, BackendError> {
        let dir = match options.working_directory {
            Some(dir) => dir,
            None => Self::default_working_dir()?,
        };
        let sandbox = LocalShellSandbox::new(self.config.clone().with_working_directory(dir))?;
        Ok(Arc::new(sandbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_sandbox_backend;

    fn sandbox_in(dir: &Path) -> LocalShellSandbox {
        LocalShellSandbox::new(LocalShellConfig::new(dir)).unwrap()
    }

    #[tokio::test]
    async fn test_execute_combines_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let res = BaseSandbox::execute(&sandbox, "echo out; echo err 1>&2; exit 3")
            .await
            .unwrap();
        assert!(res.output.contains("out"));
        assert!(res.output.contains("err"));
        assert_eq!(res.exit_code, Some(3));
        assert!(!res.truncated);
    }

    #[tokio::test]
    async fn test_execute_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let res = BaseSandbox::execute(&sandbox, "pwd").await.unwrap();
        assert_eq!(
            res.output.trim(),
            sandbox.working_directory().to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalShellSandbox::new(
            LocalShellConfig::new(dir.path()).with_max_output_bytes(10),
        )
        .unwrap();

        let res = BaseSandbox::execute(&sandbox, "printf 'abcdefghijklmnopqrstuvwxyz'")
            .await
            .unwrap();
        assert_eq!(res.output, "abcdefghij");
        assert!(res.truncated);
        assert_eq!(res.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_reports_no_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalShellSandbox::new(
            LocalShellConfig::new(dir.path()).with_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let res = BaseSandbox::execute(&sandbox, "exec sleep 5").await.unwrap();
        assert_eq!(res.exit_code, None);
        assert!(res.output.ends_with("[Command timed out]"));
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_exit_code_one() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalShellSandbox::new(
            LocalShellConfig::new(dir.path()).with_shell("/definitely/not/a/shell"),
        )
        .unwrap();

        let res = BaseSandbox::execute(&sandbox, "true").await.unwrap();
        assert_eq!(res.exit_code, Some(1));
        assert!(res.output.starts_with("Error spawning process"));
    }

    #[test]
    fn test_id_and_directory_creation() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a b").join("c");
        let sandbox = sandbox_in(&nested);

        assert!(nested.is_dir());
        assert!(sandbox.id.starts_with("local-shell-"));
        assert!(sandbox.id["local-shell-".len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalShellSandbox::new(LocalShellConfig::new(dir.path()).with_shell(" "))
            .unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: LocalShellConfig =
            serde_json::from_str(r#"{"working_directory": "/srv/box", "timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/srv/box"));
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(config.shell, DEFAULT_SHELL);
    }

    #[tokio::test]
    async fn test_upload_and_download_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let uploaded = BaseSandbox::upload_files(
            &sandbox,
            vec![
                ("/data/a.bin".to_string(), vec![0, 159, 146, 150]),
                ("../escape.bin".to_string(), vec![1]),
                ("notes.txt".to_string(), b"hi".to_vec()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(uploaded.len(), 3);
        assert_eq!(uploaded[0].error, None);
        assert_eq!(uploaded[1].error, Some(FileOperationError::InvalidPath));
        assert_eq!(uploaded[2].error, None);
        assert!(dir.path().join("data/a.bin").is_file());

        let downloaded = BaseSandbox::download_files(
            &sandbox,
            &[
                "/data/a.bin".to_string(),
                "missing.txt".to_string(),
                "data".to_string(),
                "/notes.txt".to_string(),
            ],
        )
        .await
        .unwrap();
        assert_eq!(downloaded.len(), 4);
        assert_eq!(downloaded[0].content.as_deref(), Some(&[0, 159, 146, 150][..]));
        assert_eq!(downloaded[1].error, Some(FileOperationError::FileNotFound));
        assert_eq!(downloaded[2].error, Some(FileOperationError::IsDirectory));
        assert_eq!(downloaded[3].content.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_upload_onto_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("taken")).unwrap();
        let sandbox = sandbox_in(dir.path());

        let res = BaseSandbox::upload_files(&sandbox, vec![("taken".to_string(), vec![1])])
            .await
            .unwrap();
        assert_eq!(res[0].error, Some(FileOperationError::IsDirectory));
    }

    #[tokio::test]
    async fn test_provider_creates_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalShellSandboxProvider::new();
        assert_eq!(provider.provider_type(), LOCAL_SHELL_SANDBOX_PROVIDER);

        let sandbox = provider
            .create(SandboxCreateOptions::default().with_working_directory(dir.path()))
            .await
            .unwrap();
        assert!(sandbox.id().starts_with("local-shell-"));
        assert!(is_sandbox_backend(sandbox.as_ref()));

        let res = sandbox.execute("echo ok").await.unwrap();
        assert_eq!(res.output.trim(), "ok");
    }
}
