use crate::{AgentError, RemoteChannel, RemoteProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Opaque handle to a stored copy of a file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(pub String);

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Copies the current content at `path`. `Ok(None)` when nothing exists
    /// there to copy.
    async fn create_backup(
        &self,
        remote_ref: &str,
        path: &str,
    ) -> Result<Option<SnapshotRef>, AgentError>;

    async fn restore_backup(
        &self,
        remote_ref: &str,
        snapshot: &SnapshotRef,
        target: &str,
    ) -> Result<(), AgentError>;
}

/// Keeps snapshot bytes in process memory and moves them over the remote
/// channel. Snapshots live as long as the store.
pub struct InMemorySnapshotStore {
    remotes: Arc<dyn RemoteProvider>,
    snapshots: Mutex<HashMap<SnapshotRef, Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new(remotes: Arc<dyn RemoteProvider>) -> Self {
        Self {
            remotes,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn channel(&self, remote_ref: &str) -> Result<Arc<dyn RemoteChannel>, AgentError> {
        self.remotes
            .channel(remote_ref)
            .ok_or_else(|| AgentError::UnknownRemote(remote_ref.to_string()))
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn create_backup(
        &self,
        remote_ref: &str,
        path: &str,
    ) -> Result<Option<SnapshotRef>, AgentError> {
        let channel = self.channel(remote_ref)?;
        match channel.stat(path).await? {
            Some(stat) if !stat.is_dir => {}
            _ => return Ok(None),
        }
        let content = channel.read(path).await?;
        let snapshot = SnapshotRef(format!("snap-{}", Uuid::new_v4()));
        self.snapshots
            .lock()
            .map_err(|_| AgentError::Remote("snapshot store mutex poisoned".to_string()))?
            .insert(snapshot.clone(), content);
        tracing::debug!(%remote_ref, %path, %snapshot, "snapshot stored");
        Ok(Some(snapshot))
    }

    async fn restore_backup(
        &self,
        remote_ref: &str,
        snapshot: &SnapshotRef,
        target: &str,
    ) -> Result<(), AgentError> {
        let content = self
            .snapshots
            .lock()
            .map_err(|_| AgentError::Remote("snapshot store mutex poisoned".to_string()))?
            .get(snapshot)
            .cloned()
            .ok_or_else(|| AgentError::Remote(format!("unknown snapshot {snapshot}")))?;
        let channel = self.channel(remote_ref)?;
        if let Some(parent) = target.rsplit_once('/').map(|(parent, _)| parent) {
            if !parent.is_empty() {
                channel.create_dir_all(parent).await?;
            }
        }
        channel.write(target, &content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalRemoteChannel, RemoteRegistry};

    fn store() -> InMemorySnapshotStore {
        let remotes = RemoteRegistry::default().with_channel("local", Arc::new(LocalRemoteChannel));
        InMemorySnapshotStore::new(Arc::new(remotes))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn backup_and_restore_round_trip_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 80").unwrap();
        let path = path.to_string_lossy().into_owned();

        let store = store();
        let snapshot = store.create_backup("local", &path).await.unwrap().unwrap();
        std::fs::write(&path, "port = 8080").unwrap();
        store.restore_backup("local", &snapshot, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "port = 80");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_file_has_nothing_to_back_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").to_string_lossy().into_owned();
        let store = store();
        assert_eq!(store.create_backup("local", &path).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_remote_is_an_error() {
        let error = store().create_backup("nowhere", "/tmp/x").await.unwrap_err();
        assert!(matches!(error, AgentError::UnknownRemote(_)));
    }
}
