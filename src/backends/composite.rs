//! Composite backend: route by path prefix (longest-prefix match).
//!
//! Paths are absolute. A route prefix such as `/memories/` sends `/memories/notes.txt`
//! to its backend as `/notes.txt`; returned paths get the prefix back. Everything else
//! goes to the default backend untouched.

use std::sync::Arc;

use async_trait::async_trait;

use crate::tools::{
    BackendError, EditResult, ExecuteResponse, FileBackend, FileDownloadResponse, FileInfo,
    FileUploadResponse, FilesUpdate, GrepOutput, SandboxBackend, WriteResult,
};

/// Normalize a route prefix to `/name` form (leading slash, no trailing slash).
fn normalize_prefix(prefix: &str) -> String {
    format!("/{}", prefix.trim().trim_matches('/'))
}

fn restore_prefix(prefix: &str, inner_path: &str) -> String {
    if prefix.is_empty() {
        inner_path.to_string()
    } else if inner_path.starts_with('/') {
        format!("{}{}", prefix, inner_path)
    } else {
        format!("{}/{}", prefix, inner_path)
    }
}

fn restore_update(prefix: &str, update: FilesUpdate) -> FilesUpdate {
    update
        .into_iter()
        .map(|(path, data)| (restore_prefix(prefix, &path), data))
        .collect()
}

fn is_root(path: &str) -> bool {
    path.trim().trim_matches('/').is_empty()
}

/// Default backend plus prefix-routed backends.
pub struct CompositeBackend {
    default: Arc<dyn FileBackend>,
    /// `(prefix, backend)`, longest prefix first.
    routes: Vec<(String, Arc<dyn FileBackend>)>,
}

/// Where a path goes: the backend, the path it sees, and the prefix to restore
/// (empty for the default backend).
struct Route<'a> {
    backend: &'a Arc<dyn FileBackend>,
    inner_path: String,
    prefix: &'a str,
}

impl CompositeBackend {
    /// Build a composite with a default backend and no routes.
    pub fn new(default: Arc<dyn FileBackend>) -> Self {
        Self {
            default,
            routes: Vec::new(),
        }
    }

    /// Add a route: paths under `prefix` use the given backend, with the prefix stripped.
    pub fn with_route(mut self, prefix: impl AsRef<str>, backend: Arc<dyn FileBackend>) -> Self {
        self.routes.push((normalize_prefix(prefix.as_ref()), backend));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn default_backend(&self) -> &Arc<dyn FileBackend> {
        &self.default
    }

    fn route(&self, path: &str) -> Route<'_> {
        let path = path.trim();
        for (prefix, backend) in &self.routes {
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() || rest.starts_with('/') {
                let inner_path = if rest.is_empty() { "/" } else { rest };
                return Route {
                    backend,
                    inner_path: inner_path.to_string(),
                    prefix,
                };
            }
        }
        Route {
            backend: &self.default,
            inner_path: path.to_string(),
            prefix: "",
        }
    }

    /// Group `items` by route, keeping each item's input index.
    fn split_batch<T>(&self, items: Vec<(String, T)>) -> Vec<(Route<'_>, Vec<(usize, String, T)>)> {
        let mut groups: Vec<(Route<'_>, Vec<(usize, String, T)>)> = Vec::new();
        for (index, (path, item)) in items.into_iter().enumerate() {
            let route = self.route(&path);
            let inner = route.inner_path.clone();
            match groups
                .iter_mut()
                .find(|(r, _)| Arc::ptr_eq(r.backend, route.backend) && r.prefix == route.prefix)
            {
                Some((_, members)) => members.push((index, inner, item)),
                None => groups.push((route, vec![(index, inner, item)])),
            }
        }
        groups
    }
}

impl std::fmt::Debug for CompositeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBackend")
            .field(
                "routes",
                &self.routes.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl FileBackend for CompositeBackend {
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let route = self.route(path);
        let mut infos: Vec<FileInfo> = route
            .backend
            .ls_info(&route.inner_path)
            .await?
            .into_iter()
            .map(|f| FileInfo {
                path: restore_prefix(route.prefix, &f.path),
                ..f
            })
            .collect();
        if route.prefix.is_empty() && is_root(path) {
            for (prefix, _) in &self.routes {
                let dir = FileInfo::directory(prefix.as_str());
                if !infos.iter().any(|f| f.path == dir.path) {
                    infos.push(dir);
                }
            }
            infos.sort_by(|a, b| a.path.cmp(&b.path));
        }
        Ok(infos)
    }

    async fn read(
        &self,
        file_path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<String, BackendError> {
        let route = self.route(file_path);
        let content = route.backend.read(&route.inner_path, offset, limit).await?;
        // not-found messages name the path the caller used
        if !route.prefix.is_empty() && content.starts_with("Error: File '") {
            return Ok(format!("Error: File '{}' not found", file_path));
        }
        Ok(content)
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<GrepOutput, BackendError> {
        let targets: Vec<Route<'_>> = match path {
            Some(p) if !is_root(p) => vec![self.route(p)],
            _ => {
                let mut all = vec![self.route(path.unwrap_or("/"))];
                all.extend(self.routes.iter().map(|(prefix, backend)| Route {
                    backend,
                    inner_path: "/".to_string(),
                    prefix,
                }));
                all
            }
        };

        let mut matches = Vec::new();
        for route in targets {
            let found = route
                .backend
                .grep_raw(pattern, Some(&route.inner_path), glob)
                .await?;
            match found {
                GrepOutput::Error(e) => return Ok(GrepOutput::Error(e)),
                GrepOutput::Matches(found) => {
                    matches.extend(found.into_iter().map(|mut m| {
                        m.path = restore_prefix(route.prefix, &m.path);
                        m
                    }))
                }
            }
        }
        Ok(GrepOutput::Matches(matches))
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>, BackendError> {
        let mut targets = vec![self.route(path)];
        if targets[0].prefix.is_empty() && is_root(path) {
            targets.extend(self.routes.iter().map(|(prefix, backend)| Route {
                backend,
                inner_path: "/".to_string(),
                prefix,
            }));
        }

        let mut infos = Vec::new();
        for route in targets {
            let found = route.backend.glob_info(pattern, &route.inner_path).await?;
            infos.extend(found.into_iter().map(|f| FileInfo {
                path: restore_prefix(route.prefix, &f.path),
                ..f
            }));
        }
        Ok(infos)
    }

    async fn write(&self, file_path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let route = self.route(file_path);
        let res = route.backend.write(&route.inner_path, content).await?;
        Ok(match res {
            WriteResult::Written {
                files_update,
                metadata,
                ..
            } => WriteResult::Written {
                path: file_path.to_string(),
                files_update: files_update.map(|u| restore_update(route.prefix, u)),
                metadata,
            },
            failed => failed,
        })
    }

    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult, BackendError> {
        let route = self.route(file_path);
        let res = route
            .backend
            .edit(&route.inner_path, old_string, new_string, replace_all)
            .await?;
        let path = file_path.to_string();
        Ok(match res {
            EditResult::Applied {
                occurrences,
                files_update,
                metadata,
                ..
            } => EditResult::Applied {
                path,
                occurrences,
                files_update: files_update.map(|u| restore_update(route.prefix, u)),
                metadata,
            },
            EditResult::StringNotFound { .. } => EditResult::StringNotFound { path },
            EditResult::MultipleOccurrences { .. } => EditResult::MultipleOccurrences { path },
            EditResult::FileNotFound { .. } => EditResult::FileNotFound { path },
            EditResult::Unknown { exit_code, .. } => EditResult::Unknown { path, exit_code },
        })
    }

    async fn upload_files(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<FileUploadResponse>, BackendError> {
        let total = files.len();
        let mut slots: Vec<Option<FileUploadResponse>> = vec![None; total];
        for (route, members) in self.split_batch(files) {
            let (indices, batch): (Vec<usize>, Vec<(String, Vec<u8>)>) = members
                .into_iter()
                .map(|(index, inner, content)| (index, (inner, content)))
                .unzip();
            let responses = route.backend.upload_files(batch).await?;
            for (index, response) in indices.into_iter().zip(responses) {
                slots[index] = Some(FileUploadResponse {
                    path: restore_prefix(route.prefix, &response.path),
                    ..response
                });
            }
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| BackendError::Other("routed upload returned too few responses".to_string()))
    }

    async fn download_files(
        &self,
        paths: &[String],
    ) -> Result<Vec<FileDownloadResponse>, BackendError> {
        let items: Vec<(String, ())> = paths.iter().map(|p| (p.clone(), ())).collect();
        let mut slots: Vec<Option<FileDownloadResponse>> = vec![None; paths.len()];
        for (route, members) in self.split_batch(items) {
            let (indices, batch): (Vec<usize>, Vec<String>) = members
                .into_iter()
                .map(|(index, inner, ())| (index, inner))
                .unzip();
            let responses = route.backend.download_files(&batch).await?;
            for (index, response) in indices.into_iter().zip(responses) {
                slots[index] = Some(FileDownloadResponse {
                    path: restore_prefix(route.prefix, &response.path),
                    ..response
                });
            }
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                BackendError::Other("routed download returned too few responses".to_string())
            })
    }

    fn as_sandbox(&self) -> Option<&dyn SandboxBackend> {
        match self.default.as_sandbox() {
            Some(_) => Some(self),
            None => None,
        }
    }
}

/// Command execution goes to the default backend, when that backend is a sandbox.
#[async_trait]
impl SandboxBackend for CompositeBackend {
    fn id(&self) -> &str {
        self.default
            .as_sandbox()
            .map(|sandbox| sandbox.id())
            .unwrap_or("composite")
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse, BackendError> {
        match self.default.as_sandbox() {
            Some(sandbox) => sandbox.execute(command).await,
            None => Err(BackendError::Unsupported(
                "execute: default backend is not a sandbox".to_string(),
            )),
        }
    }
}
