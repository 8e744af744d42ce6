use crate::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// File and command primitives on one remote machine. Paths are absolute
/// POSIX paths on that machine.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, AgentError>;

    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, AgentError>;

    async fn exists(&self, path: &str) -> Result<bool, AgentError> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AgentError>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), AgentError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), AgentError>;
    async fn unlink(&self, path: &str) -> Result<(), AgentError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, AgentError>;
    async fn create_dir_all(&self, path: &str) -> Result<(), AgentError>;

    /// Paths of files under `root` whose content contains `query` literally.
    async fn search(
        &self,
        query: &str,
        root: &str,
        max_results: usize,
    ) -> Result<Vec<String>, AgentError>;
}

/// Resolves remote-session references to channels.
pub trait RemoteProvider: Send + Sync {
    fn channel(&self, remote_ref: &str) -> Option<Arc<dyn RemoteChannel>>;
}

/// Fixed set of remote references, registered up front.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    channels: HashMap<String, Arc<dyn RemoteChannel>>,
}

impl RemoteRegistry {
    pub fn register(&mut self, remote_ref: impl Into<String>, channel: Arc<dyn RemoteChannel>) {
        self.channels.insert(remote_ref.into(), channel);
    }

    pub fn with_channel(
        mut self,
        remote_ref: impl Into<String>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        self.register(remote_ref, channel);
        self
    }
}

impl RemoteProvider for RemoteRegistry {
    fn channel(&self, remote_ref: &str) -> Option<Arc<dyn RemoteChannel>> {
        self.channels.get(remote_ref).cloned()
    }
}

const SEARCH_MAX_FILE_BYTES: u64 = 1024 * 1024;
const SEARCH_SKIPPED_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__"];

/// Runs against the local filesystem and `sh -c`.
#[derive(Clone, Debug, Default)]
pub struct LocalRemoteChannel;

impl LocalRemoteChannel {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(operation: &str, path: &str, error: std::io::Error) -> AgentError {
    AgentError::Remote(format!("{operation} {path}: {error}"))
}

#[async_trait]
impl RemoteChannel for LocalRemoteChannel {
    async fn exec(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, AgentError> {
        let mut process = tokio::process::Command::new("sh");
        process.arg("-c").arg(command).kill_on_drop(true);
        if let Some(cwd) = cwd {
            process.current_dir(cwd);
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, process.output()).await {
            Ok(Ok(output)) => Ok(ExecResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Ok(Err(error)) => Err(io_error("exec", command, error)),
            Err(_) => Ok(ExecResult {
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
                exit_code: None,
                timed_out: true,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, AgentError> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(FileStat {
                size: metadata.len(),
                is_dir: metadata.is_dir(),
            })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error("stat", path, error)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        tokio::fs::read(path)
            .await
            .map_err(|error| io_error("read", path, error))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), AgentError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|error| io_error("write", path, error))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), AgentError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|error| io_error("rename", from, error))
    }

    async fn unlink(&self, path: &str) -> Result<(), AgentError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|error| io_error("unlink", path, error))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, AgentError> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|error| io_error("read_dir", path, error))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| io_error("read_dir", path, error))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|error| io_error("read_dir", path, error))?;
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            let size = match kind {
                EntryKind::File => entry.metadata().await.ok().map(|m| m.len()),
                _ => None,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size,
            });
        }
        Ok(entries)
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|error| io_error("mkdir", path, error))
    }

    async fn search(
        &self,
        query: &str,
        root: &str,
        max_results: usize,
    ) -> Result<Vec<String>, AgentError> {
        let query = query.to_string();
        let root = root.to_string();
        tokio::task::spawn_blocking(move || search_tree(&query, Path::new(&root), max_results))
            .await
            .map_err(|error| AgentError::Remote(format!("search task failed: {error}")))
    }
}

fn search_tree(query: &str, root: &Path, max_results: usize) -> Vec<String> {
    let mut matches = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('.') || (entry.file_type().is_dir() && SEARCH_SKIPPED_DIRS.contains(&name.as_ref())))
        });

    for entry in walker.filter_map(Result::ok) {
        if matches.len() >= max_results {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let too_large = entry
            .metadata()
            .map(|metadata| metadata.len() > SEARCH_MAX_FILE_BYTES)
            .unwrap_or(true);
        if too_large {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.contains(&0) {
            continue;
        }
        if String::from_utf8_lossy(&bytes).contains(query) {
            matches.push(entry.path().to_string_lossy().into_owned());
        }
    }
    matches
}
