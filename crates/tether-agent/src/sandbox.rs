//! Per-session tool surface over one remote machine.
//!
//! Every operation validates its inputs first, then talks to the remote
//! channel. The first mutation of a path takes a snapshot and records a
//! [`FileChange`]; later mutations of the same path reuse that entry so
//! [`Sandbox::rollback_all`] restores the content from before the session
//! touched it.

use crate::validator::{normalize_path, validate_command, validate_path};
use crate::{
    DirEntry, EntryKind, FileAction, FileChange, RemoteChannel, RuntimeConfig, SnapshotRef,
    SnapshotStore, ToolError, ToolRequest, TruncationMode, truncate_chars,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SEARCH_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\'', '"', '\n', '\r',
];

/// How a single call is authorized. `Granted` means a human approved this
/// specific call, which elevates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Standard,
    Granted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxLimits {
    pub max_read_bytes: u64,
    pub max_write_bytes: usize,
    pub max_changed_files: usize,
    pub max_search_results: usize,
    pub command_timeout: Duration,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
}

impl From<&RuntimeConfig> for SandboxLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_read_bytes: config.max_read_bytes,
            max_write_bytes: config.max_write_bytes,
            max_changed_files: config.max_changed_files,
            max_search_results: config.max_search_results,
            command_timeout: config.command_timeout,
            stdout_limit: config.stdout_limit,
            stderr_limit: config.stderr_limit,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub path: String,
    pub action: FileAction,
    pub bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameOutcome {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Result of one dispatched tool request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Listing { path: String, entries: Vec<DirEntry> },
    Read(ReadOutcome),
    Written(WriteOutcome),
    Deleted { path: String },
    Renamed(RenameOutcome),
    Matches { query: String, paths: Vec<String> },
    Command(CommandOutcome),
}

pub struct Sandbox {
    remote_ref: String,
    workspace_root: String,
    allow_system_access: bool,
    channel: Arc<dyn RemoteChannel>,
    snapshots: Arc<dyn SnapshotStore>,
    limits: SandboxLimits,
    /// Paths with a recorded change, keyed by normalized path.
    tracked: HashMap<String, Option<SnapshotRef>>,
    changes: Vec<FileChange>,
}

impl Sandbox {
    pub fn new(
        remote_ref: impl Into<String>,
        workspace_root: impl Into<String>,
        channel: Arc<dyn RemoteChannel>,
        snapshots: Arc<dyn SnapshotStore>,
        limits: SandboxLimits,
    ) -> Self {
        Self {
            remote_ref: remote_ref.into(),
            workspace_root: normalize_path(&workspace_root.into()),
            allow_system_access: false,
            channel,
            snapshots,
            limits,
            tracked: HashMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn with_system_access(mut self, allow: bool) -> Self {
        self.allow_system_access = allow;
        self
    }

    pub fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }

    pub fn changed_file_count(&self) -> usize {
        self.changes.len()
    }

    fn elevated(&self, access: Access) -> bool {
        self.allow_system_access || access == Access::Granted
    }

    fn checked_path(&self, path: &str, access: Access) -> Result<String, ToolError> {
        validate_path(path, &self.workspace_root, self.elevated(access))?;
        Ok(normalize_path(path))
    }

    fn ensure_capacity(&self, new_entries: usize) -> Result<(), ToolError> {
        if new_entries > 0 && self.changes.len() + new_entries > self.limits.max_changed_files {
            return Err(ToolError::Limit(format!(
                "session already changed {} files (limit {})",
                self.changes.len(),
                self.limits.max_changed_files
            )));
        }
        Ok(())
    }

    async fn snapshot(&self, path: &str) -> Result<Option<SnapshotRef>, ToolError> {
        Ok(self.snapshots.create_backup(&self.remote_ref, path).await?)
    }

    fn record(&mut self, path: &str, action: FileAction, snapshot: Option<SnapshotRef>) {
        tracing::debug!(remote_ref = %self.remote_ref, %path, ?action, "file change recorded");
        self.tracked.insert(path.to_string(), snapshot.clone());
        self.changes.push(FileChange {
            path: path.to_string(),
            action,
            snapshot,
        });
    }

    pub async fn execute(
        &mut self,
        request: &ToolRequest,
        access: Access,
    ) -> Result<ToolOutput, ToolError> {
        match request {
            ToolRequest::ListFiles(args) => {
                let entries = self.list(&args.path, access).await?;
                Ok(ToolOutput::Listing {
                    path: normalize_path(&args.path),
                    entries,
                })
            }
            ToolRequest::ReadFile(args) => self.read(&args.path, access).await.map(ToolOutput::Read),
            ToolRequest::WriteFile(args) => self
                .write(&args.path, &args.content, access)
                .await
                .map(ToolOutput::Written),
            ToolRequest::CreateFile(args) => self
                .create(&args.path, &args.content, access)
                .await
                .map(ToolOutput::Written),
            ToolRequest::DeleteFile(args) => {
                let path = self.delete(&args.path, access).await?;
                Ok(ToolOutput::Deleted { path })
            }
            ToolRequest::RenameFile(args) => self
                .rename(&args.old_path, &args.new_path, access)
                .await
                .map(ToolOutput::Renamed),
            ToolRequest::SearchFiles(args) => {
                let paths = self.search(&args.query, args.path.as_deref(), access).await?;
                Ok(ToolOutput::Matches {
                    query: args.query.clone(),
                    paths,
                })
            }
            ToolRequest::RunCmd(args) => self
                .run(&args.command, args.cwd.as_deref(), access)
                .await
                .map(ToolOutput::Command),
        }
    }

    pub async fn list(&self, path: &str, access: Access) -> Result<Vec<DirEntry>, ToolError> {
        let path = self.checked_path(path, access)?;
        let mut entries: Vec<DirEntry> = self
            .channel
            .read_dir(&path)
            .await?
            .into_iter()
            .filter(|entry| !entry.name.starts_with('.'))
            .collect();
        entries.sort_by(|a, b| {
            let a_dir = a.kind == EntryKind::Directory;
            let b_dir = b.kind == EntryKind::Directory;
            b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    pub async fn read(&self, path: &str, access: Access) -> Result<ReadOutcome, ToolError> {
        let path = self.checked_path(path, access)?;
        let Some(stat) = self.channel.stat(&path).await? else {
            return Err(ToolError::Validation(format!("{path} does not exist")));
        };
        if stat.is_dir {
            return Err(ToolError::Validation(format!("{path} is a directory")));
        }
        if stat.size > self.limits.max_read_bytes {
            return Err(ToolError::Limit(format!(
                "{path} is {} bytes; files larger than {} bytes cannot be read",
                stat.size, self.limits.max_read_bytes
            )));
        }
        let bytes = self.channel.read(&path).await?;
        Ok(ReadOutcome {
            size: bytes.len() as u64,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            path,
        })
    }

    pub async fn write(
        &mut self,
        path: &str,
        content: &str,
        access: Access,
    ) -> Result<WriteOutcome, ToolError> {
        let path = self.checked_path(path, access)?;
        if content.len() > self.limits.max_write_bytes {
            return Err(ToolError::Limit(format!(
                "content is {} bytes; the write limit is {} bytes",
                content.len(),
                self.limits.max_write_bytes
            )));
        }

        let existing = self.channel.stat(&path).await?;
        if existing.is_some_and(|stat| stat.is_dir) {
            return Err(ToolError::Validation(format!("{path} is a directory")));
        }
        let existed = existing.is_some();
        let first_touch = !self.tracked.contains_key(&path);
        if first_touch {
            self.ensure_capacity(1)?;
        }
        let snapshot = if first_touch && existed {
            self.snapshot(&path).await?
        } else {
            None
        };

        let temp = temp_sibling(&path);
        self.channel.write(&temp, content.as_bytes()).await?;
        if let Err(error) = self.channel.rename(&temp, &path).await {
            if let Err(cleanup) = self.channel.unlink(&temp).await {
                tracing::warn!(path = %temp, error = %cleanup, "failed to remove temp file");
            }
            return Err(error.into());
        }

        let action = if existed {
            FileAction::Modified
        } else {
            FileAction::Created
        };
        if first_touch {
            self.record(&path, action, snapshot);
        }
        Ok(WriteOutcome {
            path,
            action,
            bytes: content.len(),
        })
    }

    pub async fn create(
        &mut self,
        path: &str,
        content: &str,
        access: Access,
    ) -> Result<WriteOutcome, ToolError> {
        let path = self.checked_path(path, access)?;
        if self.channel.exists(&path).await? {
            return Err(ToolError::Validation(format!("{path} already exists")));
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() {
                self.channel.create_dir_all(parent).await?;
            }
        }
        self.write(&path, content, access).await
    }

    pub async fn delete(&mut self, path: &str, access: Access) -> Result<String, ToolError> {
        let path = self.checked_path(path, access)?;
        let Some(stat) = self.channel.stat(&path).await? else {
            return Err(ToolError::Validation(format!("{path} does not exist")));
        };
        if stat.is_dir {
            return Err(ToolError::Validation(format!(
                "{path} is a directory; only files can be deleted"
            )));
        }
        let first_touch = !self.tracked.contains_key(&path);
        if first_touch {
            self.ensure_capacity(1)?;
        }
        let snapshot = if first_touch {
            self.snapshot(&path).await?
        } else {
            None
        };
        self.channel.unlink(&path).await?;
        if first_touch {
            self.record(&path, FileAction::Deleted, snapshot);
        }
        Ok(path)
    }

    pub async fn rename(
        &mut self,
        old_path: &str,
        new_path: &str,
        access: Access,
    ) -> Result<RenameOutcome, ToolError> {
        let old_path = self.checked_path(old_path, access)?;
        let new_path = self.checked_path(new_path, access)?;
        if old_path == new_path {
            return Err(ToolError::Validation(
                "old_path and new_path are the same".to_string(),
            ));
        }
        if self.channel.stat(&old_path).await?.is_none() {
            return Err(ToolError::Validation(format!("{old_path} does not exist")));
        }
        let destination = self.channel.stat(&new_path).await?;
        if destination.is_some_and(|stat| stat.is_dir) {
            return Err(ToolError::Validation(format!("{new_path} is a directory")));
        }

        let old_first = !self.tracked.contains_key(&old_path);
        let new_first = !self.tracked.contains_key(&new_path);
        self.ensure_capacity(usize::from(old_first) + usize::from(new_first))?;

        let old_snapshot = if old_first {
            self.snapshot(&old_path).await?
        } else {
            None
        };
        let new_snapshot = if new_first && destination.is_some() {
            self.snapshot(&new_path).await?
        } else {
            None
        };

        self.channel.rename(&old_path, &new_path).await?;

        if old_first {
            self.record(&old_path, FileAction::Renamed, old_snapshot);
        }
        if new_first {
            let action = if destination.is_some() {
                FileAction::Modified
            } else {
                FileAction::Created
            };
            self.record(&new_path, action, new_snapshot);
        }
        Ok(RenameOutcome { old_path, new_path })
    }

    pub async fn search(
        &self,
        query: &str,
        path: Option<&str>,
        access: Access,
    ) -> Result<Vec<String>, ToolError> {
        if query.trim().is_empty() {
            return Err(ToolError::Validation("search query is empty".to_string()));
        }
        if query.contains(SEARCH_METACHARACTERS) {
            return Err(ToolError::Validation(
                "search query contains shell metacharacters".to_string(),
            ));
        }
        let root = match path {
            Some(path) => self.checked_path(path, access)?,
            None => self.workspace_root.clone(),
        };
        let mut paths = self
            .channel
            .search(query, &root, self.limits.max_search_results)
            .await?;
        paths.truncate(self.limits.max_search_results);
        Ok(paths)
    }

    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        access: Access,
    ) -> Result<CommandOutcome, ToolError> {
        validate_command(command, self.elevated(access))?;
        let cwd = match cwd {
            Some(cwd) => self.checked_path(cwd, access)?,
            None => self.workspace_root.clone(),
        };
        tracing::info!(remote_ref = %self.remote_ref, %command, %cwd, "running command");
        let result = self
            .channel
            .exec(command, Some(&cwd), self.limits.command_timeout)
            .await?;
        Ok(CommandOutcome {
            command: command.to_string(),
            cwd,
            exit_code: result.exit_code,
            stdout: truncate_chars(&result.stdout, self.limits.stdout_limit, TruncationMode::Tail),
            stderr: truncate_chars(&result.stderr, self.limits.stderr_limit, TruncationMode::Tail),
            timed_out: result.timed_out,
            duration_ms: result.duration_ms,
        })
    }

    /// Undoes every recorded change in recording order and returns the paths
    /// that were restored. Failures are logged and skipped.
    pub async fn rollback_all(&mut self) -> Vec<String> {
        let changes = std::mem::take(&mut self.changes);
        self.tracked.clear();
        let mut restored = Vec::with_capacity(changes.len());

        for change in changes {
            let outcome = match (&change.action, &change.snapshot) {
                (FileAction::Created, _) => match self.channel.exists(&change.path).await {
                    Ok(true) => self.channel.unlink(&change.path).await,
                    Ok(false) => Ok(()),
                    Err(error) => Err(error),
                },
                (_, Some(snapshot)) => {
                    self.snapshots
                        .restore_backup(&self.remote_ref, snapshot, &change.path)
                        .await
                }
                (_, None) => {
                    tracing::debug!(path = %change.path, "no snapshot to restore");
                    continue;
                }
            };
            match outcome {
                Ok(()) => restored.push(change.path),
                Err(error) => {
                    tracing::warn!(path = %change.path, action = ?change.action, %error, "rollback entry failed");
                }
            }
        }
        restored
    }
}

fn temp_sibling(path: &str) -> String {
    let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
    format!("{parent}/.{name}.tether-{}.tmp", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemorySnapshotStore, LocalRemoteChannel, RemoteRegistry};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        sandbox: Sandbox,
        store: Arc<InMemorySnapshotStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_limits(SandboxLimits::default())
        }

        fn with_limits(limits: SandboxLimits) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let channel: Arc<dyn RemoteChannel> = Arc::new(LocalRemoteChannel::new());
            let remotes = RemoteRegistry::default().with_channel("local", channel.clone());
            let store = Arc::new(InMemorySnapshotStore::new(Arc::new(remotes)));
            let root = dir.path().to_string_lossy().into_owned();
            let sandbox = Sandbox::new("local", root, channel, store.clone(), limits);
            Self { dir, sandbox, store }
        }

        fn path(&self, relative: &str) -> String {
            self.dir.path().join(relative).to_string_lossy().into_owned()
        }

        fn read(&self, relative: &str) -> Option<String> {
            std::fs::read_to_string(self.dir.path().join(relative)).ok()
        }

        fn seed(&self, relative: &str, content: &str) {
            let path = self.dir.path().join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn writing_twice_takes_a_single_snapshot() {
        let mut fx = Fixture::new();
        fx.seed("app.js", "v1");
        let path = fx.path("app.js");

        let first = fx.sandbox.write(&path, "v2", Access::Standard).await.unwrap();
        let second = fx.sandbox.write(&path, "v3", Access::Standard).await.unwrap();
        assert_eq!(first.action, FileAction::Modified);
        assert_eq!(second.action, FileAction::Modified);
        assert_eq!(fx.sandbox.changes().len(), 1);
        assert!(fx.sandbox.changes()[0].snapshot.is_some());
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.read("app.js").as_deref(), Some("v3"));

        let restored = fx.sandbox.rollback_all().await;
        assert_eq!(restored, vec![path]);
        assert_eq!(fx.read("app.js").as_deref(), Some("v1"));
        assert!(fx.sandbox.changes().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rollback_deletes_created_files_and_restores_modified_ones() {
        let mut fx = Fixture::new();
        fx.seed("b.txt", "original");
        let a = fx.path("a.txt");
        let b = fx.path("b.txt");

        let created = fx.sandbox.write(&a, "new file", Access::Standard).await.unwrap();
        assert_eq!(created.action, FileAction::Created);
        fx.sandbox.write(&b, "changed", Access::Standard).await.unwrap();

        let restored = fx.sandbox.rollback_all().await;
        assert_eq!(restored, vec![a, b]);
        assert_eq!(fx.read("a.txt"), None);
        assert_eq!(fx.read("b.txt").as_deref(), Some("original"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_then_modify_rolls_back_to_absent() {
        let mut fx = Fixture::new();
        let path = fx.path("nested/dir/new.rs");
        fx.sandbox.create(&path, "one", Access::Standard).await.unwrap();
        fx.sandbox.write(&path, "two", Access::Standard).await.unwrap();
        assert_eq!(fx.sandbox.changes().len(), 1);
        assert_eq!(fx.store.len(), 0);

        fx.sandbox.rollback_all().await;
        assert_eq!(fx.read("nested/dir/new.rs"), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_fails_when_the_path_exists() {
        let mut fx = Fixture::new();
        fx.seed("exists.txt", "x");
        let error = fx
            .sandbox
            .create(&fx.path("exists.txt"), "y", Access::Standard)
            .await
            .unwrap_err();
        assert!(matches!(error, ToolError::Validation(_)));
        assert!(fx.sandbox.changes().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delete_and_rename_are_reversible() {
        let mut fx = Fixture::new();
        fx.seed("old.txt", "keep me");
        fx.seed("gone.txt", "bye");
        let old = fx.path("old.txt");
        let new = fx.path("new.txt");
        let gone = fx.path("gone.txt");

        fx.sandbox.rename(&old, &new, Access::Standard).await.unwrap();
        fx.sandbox.delete(&gone, Access::Standard).await.unwrap();
        assert_eq!(fx.read("old.txt"), None);
        assert_eq!(fx.read("new.txt").as_deref(), Some("keep me"));
        assert_eq!(
            fx.sandbox
                .changes()
                .iter()
                .map(|change| change.action)
                .collect::<Vec<_>>(),
            vec![FileAction::Renamed, FileAction::Created, FileAction::Deleted]
        );

        fx.sandbox.rollback_all().await;
        assert_eq!(fx.read("old.txt").as_deref(), Some("keep me"));
        assert_eq!(fx.read("new.txt"), None);
        assert_eq!(fx.read("gone.txt").as_deref(), Some("bye"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rollback_skips_failed_entries_and_continues() {
        let mut fx = Fixture::new();
        fx.seed("a.txt", "a0");
        fx.seed("b.txt", "b0");
        let a = fx.path("a.txt");
        let b = fx.path("b.txt");
        fx.sandbox.write(&a, "a1", Access::Standard).await.unwrap();
        fx.sandbox.write(&b, "b1", Access::Standard).await.unwrap();

        // A directory where the file was makes restoring `a` fail.
        std::fs::remove_file(fx.dir.path().join("a.txt")).unwrap();
        std::fs::create_dir(fx.dir.path().join("a.txt")).unwrap();

        let restored = fx.sandbox.rollback_all().await;
        assert_eq!(restored, vec![b]);
        assert_eq!(fx.read("b.txt").as_deref(), Some("b0"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn paths_outside_workspace_need_a_grant() {
        let mut fx = Fixture::new();
        let outside_dir = tempfile::tempdir().unwrap();
        let outside = outside_dir.path().join("x.txt").to_string_lossy().into_owned();

        let error = fx.sandbox.write(&outside, "x", Access::Standard).await.unwrap_err();
        assert!(matches!(error, ToolError::Path(ref v) if v.needs_elevation()));

        fx.sandbox.write(&outside, "x", Access::Granted).await.unwrap();
        assert_eq!(std::fs::read_to_string(&outside).unwrap(), "x");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn size_and_change_caps_are_enforced() {
        let limits = SandboxLimits {
            max_read_bytes: 4,
            max_write_bytes: 8,
            max_changed_files: 2,
            ..SandboxLimits::default()
        };
        let mut fx = Fixture::with_limits(limits);
        fx.seed("big.txt", "0123456789");

        let read = fx.sandbox.read(&fx.path("big.txt"), Access::Standard).await;
        assert!(matches!(read, Err(ToolError::Limit(_))));

        let write = fx
            .sandbox
            .write(&fx.path("w.txt"), "too long content", Access::Standard)
            .await;
        assert!(matches!(write, Err(ToolError::Limit(_))));

        fx.sandbox.write(&fx.path("1"), "a", Access::Standard).await.unwrap();
        fx.sandbox.write(&fx.path("2"), "b", Access::Standard).await.unwrap();
        let third = fx.sandbox.write(&fx.path("3"), "c", Access::Standard).await;
        assert!(matches!(third, Err(ToolError::Limit(_))));
        fx.sandbox.write(&fx.path("1"), "again", Access::Standard).await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn list_hides_dotfiles_and_sorts_directories_first() {
        let fx = Fixture::new();
        fx.seed("zeta.txt", "");
        fx.seed("alpha.txt", "");
        fx.seed(".env", "SECRET=1");
        fx.seed("src/main.rs", "");
        fx.seed("docs/readme.md", "");

        let entries = fx
            .sandbox
            .list(fx.sandbox.workspace_root(), Access::Standard)
            .await
            .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "src", "alpha.txt", "zeta.txt"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn search_rejects_metacharacters() {
        let fx = Fixture::new();
        fx.seed("src/lib.rs", "pub fn target() {}");
        for query in ["x; rm -rf /", "$(id)", "a|b", "`id`"] {
            let result = fx.sandbox.search(query, None, Access::Standard).await;
            assert!(matches!(result, Err(ToolError::Validation(_))), "{query}");
        }
        let found = fx.sandbox.search("pub fn target", None, Access::Standard).await.unwrap();
        assert_eq!(found, vec![fx.path("src/lib.rs")]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_truncates_output_and_rejects_disallowed_commands() {
        let limits = SandboxLimits {
            stdout_limit: 5,
            ..SandboxLimits::default()
        };
        let fx = Fixture::with_limits(limits);
        let outcome = fx
            .sandbox
            .run("echo 0123456789", None, Access::Standard)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("[output truncated: first"));
        assert_eq!(outcome.cwd, fx.sandbox.workspace_root());

        let denied = fx.sandbox.run("rm -rf /", None, Access::Granted).await;
        assert!(matches!(denied, Err(ToolError::Command(_))));

        let needs = fx.sandbox.run("whoami", None, Access::Standard).await.unwrap_err();
        assert!(matches!(needs, ToolError::Command(ref v) if v.needs_elevation()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn system_access_option_elevates_every_call_but_not_hard_denies() {
        let fx = Fixture::new();
        let sandbox = Sandbox::new(
            "local",
            fx.sandbox.workspace_root(),
            Arc::new(LocalRemoteChannel::new()),
            fx.store.clone(),
            SandboxLimits::default(),
        )
        .with_system_access(true);

        assert!(sandbox.run("whoami", Some("/"), Access::Standard).await.is_ok());
        let denied = sandbox.run("rm -rf /", None, Access::Standard).await;
        assert!(matches!(denied, Err(ToolError::Command(_))));
    }
}
