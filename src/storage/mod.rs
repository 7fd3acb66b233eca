pub mod archive;
pub mod remote;

pub use remote::{ArchiveScope, RemoteStore};

use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::models::{FileOperation, OperationRecord, SessionMetadata, SyncError};

/// Reserved collaboration directory inside a session tree. Holds the
/// operation log; never surfaced by listings and never writable over the
/// wire.
pub const COLLAB_DIR: &str = ".collaboration";

const METADATA_FILE: &str = "metadata.json";
const OPERATIONS_LOG: &str = "operations.log";

/// Stateless facade over the local session trees and the optional remote
/// blob store. Owns no session state.
#[derive(Debug)]
pub struct StorageClient {
    root: PathBuf,
    remote: Option<RemoteStore>,
    scope: ArchiveScope,
}

impl StorageClient {
    pub fn new(root: impl Into<PathBuf>, remote: Option<RemoteStore>, scope: ArchiveScope) -> Self {
        Self {
            root: root.into(),
            remote,
            scope,
        }
    }

    /// Local-only client: materialize never touches the network, persist is
    /// a no-op.
    pub fn local_only(root: impl Into<PathBuf>) -> Self {
        Self::new(root, None, ArchiveScope::Session)
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("session-{}", session_id))
    }

    pub fn workspace_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("workspace")
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(METADATA_FILE)
    }

    fn operations_log_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(COLLAB_DIR).join(OPERATIONS_LOG)
    }

    /// Restore a session tree from the remote archive, or create an empty
    /// skeleton when there is no prior state. Returns whether an archive was
    /// restored. A missing archive is not an error; any other transport
    /// failure propagates and aborts the triggering join.
    pub async fn materialize(&self, session_id: &str) -> Result<bool, SyncError> {
        if let Some(remote) = &self.remote {
            match remote.download(&self.scope.key(session_id)).await {
                Ok(bytes) => {
                    let size = bytes.len();
                    let dir = self.session_dir(session_id);
                    // Tree extraction is synchronous I/O; keep it off the
                    // async scheduler.
                    tokio::task::spawn_blocking(move || archive::unpack_into(&bytes, &dir))
                        .await
                        .map_err(|e| SyncError::Archive(format!("unpack task failed: {}", e)))??;
                    self.ensure_skeleton(session_id).await?;
                    info!(
                        "Materialized session {} from archive ({} bytes)",
                        session_id, size
                    );
                    return Ok(true);
                }
                Err(SyncError::NotFound(_)) => {
                    info!("No archive for session {}, starting empty", session_id);
                }
                Err(e) => return Err(e),
            }
        }
        self.ensure_skeleton(session_id).await?;
        Ok(false)
    }

    async fn ensure_skeleton(&self, session_id: &str) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(self.workspace_dir(session_id)).await?;
        tokio::fs::create_dir_all(self.session_dir(session_id).join(COLLAB_DIR)).await?;
        let metadata_path = self.metadata_path(session_id);
        if !metadata_path.exists() {
            let metadata = SessionMetadata::new(session_id);
            let json = serde_json::to_vec_pretty(&metadata)?;
            tokio::fs::write(&metadata_path, json).await?;
        }
        Ok(())
    }

    /// Upload the whole session tree as one archive. Local-only mode skips
    /// the upload.
    pub async fn persist(&self, session_id: &str) -> Result<(), SyncError> {
        let Some(remote) = &self.remote else {
            debug!("Local-only mode, skipping persist of session {}", session_id);
            return Ok(());
        };
        let dir = self.session_dir(session_id);
        let bytes = tokio::task::spawn_blocking(move || archive::pack_dir(&dir))
            .await
            .map_err(|e| SyncError::Archive(format!("pack task failed: {}", e)))??;
        remote.upload(&self.scope.key(session_id), bytes).await?;
        info!("Persisted session {} to remote storage", session_id);
        Ok(())
    }

    pub async fn read_metadata(&self, session_id: &str) -> Result<SessionMetadata, SyncError> {
        let bytes = tokio::fs::read(self.metadata_path(session_id))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SyncError::NotFound(format!("metadata for {}", session_id)),
                _ => SyncError::Filesystem(e),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whole-file rewrite, always restamping `lastModified`.
    pub async fn write_metadata(
        &self,
        session_id: &str,
        metadata: &mut SessionMetadata,
    ) -> Result<(), SyncError> {
        metadata.touch();
        let json = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(self.metadata_path(session_id), json).await?;
        Ok(())
    }

    /// Append one JSON line to the audit log. Independent of the actual file
    /// write; never read back by the synchronization path.
    pub async fn append_operation_log(
        &self,
        session_id: &str,
        user_id: &str,
        operation: &FileOperation,
    ) -> Result<(), SyncError> {
        let path = self.operations_log_path(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = OperationRecord {
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            operation: operation.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// List workspace files as sorted root-relative paths, excluding the
    /// reserved collaboration directory.
    pub async fn list_files(&self, session_id: &str) -> Result<Vec<String>, SyncError> {
        let workspace = self.workspace_dir(session_id);
        let mut files = Vec::new();
        let mut stack = vec![workspace.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_name() == COLLAB_DIR {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&workspace) {
                    files.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<String, SyncError> {
        let rel = sanitize_rel_path(path)?;
        tokio::fs::read_to_string(self.workspace_dir(session_id).join(rel))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SyncError::NotFound(path.to_string()),
                _ => SyncError::Filesystem(e),
            })
    }
}

/// Validate a wire-supplied workspace path. Absolute paths, parent escapes
/// and the reserved collaboration directory are rejected before any
/// filesystem call.
pub fn sanitize_rel_path(path: &str) -> Result<PathBuf, SyncError> {
    if path.is_empty() {
        return Err(SyncError::Protocol("empty path".to_string()));
    }
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => {
                if segment == COLLAB_DIR {
                    return Err(SyncError::Protocol(format!(
                        "path uses reserved directory: {}",
                        path
                    )));
                }
                clean.push(segment);
            }
            Component::CurDir => {}
            _ => {
                return Err(SyncError::Protocol(format!("invalid path: {}", path)));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SyncError::Protocol(format!("invalid path: {}", path)));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    type BlobMap = Arc<RwLock<HashMap<String, Vec<u8>>>>;

    async fn fetch_blob(
        State(store): State<BlobMap>,
        AxumPath(key): AxumPath<String>,
    ) -> Result<Vec<u8>, StatusCode> {
        store.read().await.get(&key).cloned().ok_or(StatusCode::NOT_FOUND)
    }

    async fn put_blob(
        State(store): State<BlobMap>,
        AxumPath(key): AxumPath<String>,
        body: Bytes,
    ) -> StatusCode {
        store.write().await.insert(key, body.to_vec());
        StatusCode::OK
    }

    /// In-process blob store standing in for the remote backend.
    async fn spawn_blob_server() -> String {
        let store: BlobMap = Arc::new(RwLock::new(HashMap::new()));
        let app = Router::new()
            .route("/*key", get(fetch_blob).put(put_blob))
            .with_state(store);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn materialize_without_prior_state_creates_a_skeleton() {
        let root = tempdir().unwrap();
        let storage = StorageClient::local_only(root.path());

        let restored = storage.materialize("s1").await.unwrap();
        assert!(!restored);
        assert!(storage.workspace_dir("s1").is_dir());
        assert!(storage.session_dir("s1").join(COLLAB_DIR).is_dir());

        let metadata = storage.read_metadata("s1").await.unwrap();
        assert_eq!(metadata.session_id, "s1");
        assert!(metadata.participants.is_empty());
        assert!(storage.list_files("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_then_materialize_round_trips_the_tree() {
        let endpoint = spawn_blob_server().await;
        let remote = |root: &std::path::Path| {
            StorageClient::new(
                root,
                Some(RemoteStore::new(
                    endpoint.clone(),
                    None,
                    Duration::from_secs(5),
                )),
                ArchiveScope::Session,
            )
        };

        let first_root = tempdir().unwrap();
        let storage = remote(first_root.path());
        assert!(!storage.materialize("s1").await.unwrap());
        let workspace = storage.workspace_dir("s1");
        tokio::fs::create_dir_all(workspace.join("src")).await.unwrap();
        tokio::fs::write(workspace.join("src/lib.rs"), "pub fn f() {}")
            .await
            .unwrap();
        tokio::fs::write(workspace.join("README.md"), "# s1").await.unwrap();
        storage.persist("s1").await.unwrap();

        let second_root = tempdir().unwrap();
        let storage = remote(second_root.path());
        assert!(storage.materialize("s1").await.unwrap());
        assert_eq!(
            storage.list_files("s1").await.unwrap(),
            vec!["README.md".to_string(), "src/lib.rs".to_string()]
        );
        assert_eq!(
            storage.read_file("s1", "src/lib.rs").await.unwrap(),
            "pub fn f() {}"
        );
    }

    #[tokio::test]
    async fn operation_log_appends_one_json_line_per_mutation() {
        let root = tempdir().unwrap();
        let storage = StorageClient::local_only(root.path());
        storage.materialize("s1").await.unwrap();

        let op = FileOperation::Create {
            path: "a.txt".to_string(),
            content: "hi".to_string(),
        };
        storage.append_operation_log("s1", "u1", &op).await.unwrap();
        storage
            .append_operation_log("s1", "u2", &FileOperation::Delete { path: "a.txt".to_string() })
            .await
            .unwrap();

        let log = tokio::fs::read_to_string(storage.operations_log_path("s1"))
            .await
            .unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: OperationRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.operation, op);
    }

    #[tokio::test]
    async fn listings_exclude_the_collaboration_directory() {
        let root = tempdir().unwrap();
        let storage = StorageClient::local_only(root.path());
        storage.materialize("s1").await.unwrap();

        let workspace = storage.workspace_dir("s1");
        tokio::fs::write(workspace.join("kept.txt"), "x").await.unwrap();
        // A stray collaboration directory inside the workspace stays hidden.
        tokio::fs::create_dir_all(workspace.join(COLLAB_DIR)).await.unwrap();
        tokio::fs::write(workspace.join(COLLAB_DIR).join("notes"), "y")
            .await
            .unwrap();

        assert_eq!(storage.list_files("s1").await.unwrap(), vec!["kept.txt"]);
    }

    #[test]
    fn rel_paths_are_validated() {
        assert!(sanitize_rel_path("src/main.rs").is_ok());
        assert!(sanitize_rel_path("./a.txt").is_ok());
        assert!(sanitize_rel_path("").is_err());
        assert!(sanitize_rel_path("/etc/passwd").is_err());
        assert!(sanitize_rel_path("../outside.txt").is_err());
        assert!(sanitize_rel_path("a/../../b").is_err());
        assert!(sanitize_rel_path(".collaboration/operations.log").is_err());
    }
}
