//! Store backend: files kept as [FileData] records in a [ToolStore].
//!
//! The state-backed variant of the protocol. Writes and edits return `files_update`
//! so callers that checkpoint agent state can merge the change; the store itself is
//! also updated, so later reads through this backend see it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use super::glob::GlobMatcher;
use super::scripts::EMPTY_FILE_REMINDER;
use crate::tools::{
    BackendError, EditResult, FileBackend, FileData, FileDownloadResponse, FileInfo,
    FileOperationError, FileUploadResponse, FilesUpdate, GrepMatch, GrepOutput, StateAndStore,
    ToolStore, WriteResult, DEFAULT_SEARCH_PATH,
};

const FS_NAMESPACE: &str = "fs";

/// Normalize to an absolute, slash-separated key without `.` segments or trailing `/`.
/// Returns `None` for paths that climb out of the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => parts.push(s),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

/// `dir` as a key prefix: `/` stays `/`, `/a/b` becomes `/a/b/`.
fn dir_prefix(dir: &str) -> String {
    if dir == "/" {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

fn format_lines(data: &FileData, offset: usize, limit: usize) -> String {
    let mut lines: &[String] = &data.content;
    if lines.len() > 1 && lines.last().is_some_and(|l| l.is_empty()) {
        lines = &lines[..lines.len() - 1];
    }
    lines
        .iter()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Backend that stores file contents in a [ToolStore] (in-memory, Redis, database, ...).
///
/// Files live under namespace `["fs"]`, or `["fs", assistant_id]` when built with an
/// assistant id so that assistants sharing a store do not see each other's files.
pub struct StoreBackend {
    store: Arc<dyn ToolStore>,
    assistant_id: Option<String>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self {
            store,
            assistant_id: None,
        }
    }

    pub fn with_assistant_id(mut self, assistant_id: impl Into<String>) -> Self {
        self.assistant_id = Some(assistant_id.into());
        self
    }

    /// Build from a request context. Fails when the context carries no store.
    pub fn from_context(ctx: &StateAndStore) -> Result<Self, BackendError> {
        let store = ctx.store.clone().ok_or_else(|| {
            BackendError::Configuration("StoreBackend requires a store in the context".to_string())
        })?;
        Ok(Self {
            store,
            assistant_id: ctx.assistant_id.clone(),
        })
    }

    fn namespace(&self) -> Vec<&str> {
        let mut ns = vec![FS_NAMESPACE];
        if let Some(id) = &self.assistant_id {
            ns.push(id);
        }
        ns
    }

    async fn keys(&self) -> Vec<String> {
        self.store.list(&self.namespace()).await
    }

    async fn load(&self, key: &str) -> Result<Option<FileData>, BackendError> {
        match self.store.get(&self.namespace(), key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, data: &FileData) -> Result<(), BackendError> {
        let value = serde_json::to_value(data)?;
        self.store.put(&self.namespace(), key, value).await;
        Ok(())
    }

    /// Files under `dir` (or the file `dir` itself), with their path relative to `dir`.
    async fn files_under(&self, dir: &str) -> Vec<(String, String)> {
        let prefix = dir_prefix(dir);
        self.keys()
            .await
            .into_iter()
            .filter_map(|key| {
                if key == dir {
                    let name = key.rsplit('/').next().unwrap_or_default().to_string();
                    Some((key, name))
                } else {
                    let rel = key.strip_prefix(&prefix)?.to_string();
                    Some((key, rel))
                }
            })
            .collect()
    }

    async fn is_directory(&self, key: &str) -> bool {
        let prefix = dir_prefix(key);
        self.keys().await.iter().any(|k| k.starts_with(&prefix))
    }

    /// Whether some proper ancestor of `key` is stored as a file.
    async fn has_file_ancestor(&self, key: &str) -> bool {
        self.keys()
            .await
            .iter()
            .any(|k| key.starts_with(&dir_prefix(k)) && k.as_str() != "/")
    }

    async fn file_info(&self, key: &str) -> Result<Option<FileInfo>, BackendError> {
        Ok(self.load(key).await?.map(|data| {
            FileInfo::file(key, data.size()).with_modified_at(data.modified_at.clone())
        }))
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackend")
            .field("namespace", &self.namespace())
            .finish()
    }
}

#[async_trait]
impl FileBackend for StoreBackend {
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let Some(dir) = normalize(path) else {
            return Ok(Vec::new());
        };
        let prefix = dir_prefix(&dir);
        let mut files = Vec::new();
        let mut subdirs = BTreeSet::new();
        for key in self.keys().await {
            let Some(rel) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rel.split_once('/') {
                Some((child, _)) => {
                    subdirs.insert(format!("{}{}/", prefix, child));
                }
                None => files.push(key),
            }
        }

        let mut infos = Vec::with_capacity(files.len() + subdirs.len());
        for key in files {
            if let Some(info) = self.file_info(&key).await? {
                infos.push(info);
            }
        }
        infos.extend(subdirs.into_iter().map(FileInfo::directory));
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    async fn read(
        &self,
        file_path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<String, BackendError> {
        let not_found = || format!("Error: File '{}' not found", file_path);
        let Some(key) = normalize(file_path) else {
            return Ok(not_found());
        };
        let Some(data) = self.load(&key).await? else {
            return Ok(not_found());
        };
        if data.size() == 0 {
            return Ok(EMPTY_FILE_REMINDER.to_string());
        }
        Ok(format_lines(&data, offset, limit))
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<GrepOutput, BackendError> {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => return Ok(GrepOutput::Error(format!("Invalid regex: {}", e))),
        };
        let filter = match glob.map(GlobMatcher::new).transpose() {
            Ok(filter) => filter,
            Err(e) => {
                log::debug!("ignoring grep with unusable glob {:?}: {}", glob, e);
                return Ok(GrepOutput::Matches(Vec::new()));
            }
        };
        let Some(root) = normalize(path.unwrap_or(DEFAULT_SEARCH_PATH)) else {
            return Ok(GrepOutput::Matches(Vec::new()));
        };

        let mut matches = Vec::new();
        for (key, rel) in self.files_under(&root).await {
            if filter.as_ref().is_some_and(|m| !m.is_match(&rel)) {
                continue;
            }
            let Some(data) = self.load(&key).await? else {
                continue;
            };
            for (i, line) in data.content.iter().enumerate() {
                if regex.is_match(line) {
                    matches.push(GrepMatch {
                        path: key.clone(),
                        line: (i + 1) as u64,
                        text: line.clone(),
                    });
                }
            }
        }
        Ok(GrepOutput::Matches(matches))
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let matcher = match GlobMatcher::new(pattern) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("invalid glob {:?}: {}", pattern, e);
                return Ok(Vec::new());
            }
        };
        let Some(root) = normalize(path) else {
            return Ok(Vec::new());
        };
        let prefix = dir_prefix(&root);

        let mut infos = Vec::new();
        for key in self.keys().await {
            let Some(rel) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !matcher.is_match(rel) {
                continue;
            }
            if let Some(info) = self.file_info(&key).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn write(&self, file_path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let Some(key) = normalize(file_path).filter(|k| k != "/") else {
            return Ok(WriteResult::failed(format!(
                "Error writing file '{}': invalid path",
                file_path
            )));
        };
        let already_exists = || {
            WriteResult::failed(format!(
                "Cannot write to {} because it already exists. Read and then make an edit, or write to a new path.",
                file_path
            ))
        };
        if self.is_directory(&key).await {
            return Ok(already_exists());
        }
        if self.has_file_ancestor(&key).await {
            return Ok(WriteResult::failed(format!(
                "Error writing file '{}': not a directory",
                file_path
            )));
        }
        let data = FileData::new(content);
        let value = serde_json::to_value(&data)?;
        if !self.store.put_if_absent(&self.namespace(), &key, value).await {
            return Ok(already_exists());
        }
        let update = FilesUpdate::from([(key, data)]);
        Ok(WriteResult::written(file_path).with_files_update(update))
    }

    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult, BackendError> {
        let path = file_path.to_string();
        let Some(key) = normalize(file_path) else {
            return Ok(EditResult::FileNotFound { path });
        };
        let Some(data) = self.load(&key).await? else {
            return Ok(EditResult::FileNotFound { path });
        };
        if old_string.is_empty() {
            return Ok(EditResult::StringNotFound { path });
        }

        let text = data.text();
        let occurrences = text.matches(old_string).count();
        if occurrences == 0 {
            return Ok(EditResult::StringNotFound { path });
        }
        if occurrences > 1 && !replace_all {
            return Ok(EditResult::MultipleOccurrences { path });
        }

        let updated = data.updated(&text.replace(old_string, new_string));
        self.save(&key, &updated).await?;
        let update = FilesUpdate::from([(key, updated)]);
        Ok(EditResult::applied(path, occurrences).with_files_update(update))
    }

    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError> {
        let mut results = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let Some(key) = normalize(&path).filter(|k| k != "/") else {
                results.push(FileUploadResponse::failed(path, FileOperationError::InvalidPath));
                continue;
            };
            let Ok(text) = String::from_utf8(bytes) else {
                results.push(FileUploadResponse::failed(path, FileOperationError::InvalidPath));
                continue;
            };
            if self.is_directory(&key).await {
                results.push(FileUploadResponse::failed(path, FileOperationError::IsDirectory));
                continue;
            }
            if self.has_file_ancestor(&key).await {
                results.push(FileUploadResponse::failed(path, FileOperationError::InvalidPath));
                continue;
            }
            let data = match self.load(&key).await? {
                Some(existing) => existing.updated(&text),
                None => FileData::new(&text),
            };
            self.save(&key, &data).await?;
            results.push(FileUploadResponse::ok(path));
        }
        Ok(results)
    }

    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(key) = normalize(path) else {
                results.push(FileDownloadResponse::failed(
                    path.clone(),
                    FileOperationError::InvalidPath,
                ));
                continue;
            };
            let response = match self.load(&key).await? {
                Some(data) => FileDownloadResponse::ok(path.clone(), data.text().into_bytes()),
                None => {
                    let error = if self.is_directory(&key).await {
                        FileOperationError::IsDirectory
                    } else {
                        FileOperationError::FileNotFound
                    };
                    FileDownloadResponse::failed(path.clone(), error)
                }
            };
            results.push(response);
        }
        Ok(results)
    }
}
