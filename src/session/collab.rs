use loro::LoroDoc;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::models::{FileOperation, SessionMetadata, SyncError};
use crate::storage::{sanitize_rel_path, StorageClient};

/// Per-session holder of replicated-document state and the file-mutation
/// applier. One instance per live session; callers serialize access per
/// session, invocations across different sessions are independent.
pub struct CollabManager {
    session_id: String,
    storage: Arc<StorageClient>,
    documents: HashMap<String, LoroDoc>,
    last_activity: Instant,
    disposed: bool,
}

impl CollabManager {
    pub fn new(session_id: &str, storage: Arc<StorageClient>) -> Self {
        Self {
            session_id: session_id.to_string(),
            storage,
            documents: HashMap::new(),
            last_activity: Instant::now(),
            disposed: false,
        }
    }

    /// Log, apply and account one workspace mutation: append to the audit
    /// log, mutate the filesystem, union the actor into the metadata, mark
    /// the session active.
    pub async fn apply_file_operation(
        &mut self,
        user_id: &str,
        operation: &FileOperation,
    ) -> Result<(), SyncError> {
        // The wire is untrusted; validate paths before any side effect.
        match operation {
            FileOperation::Create { path, .. }
            | FileOperation::Update { path, .. }
            | FileOperation::Delete { path } => {
                sanitize_rel_path(path)?;
            }
            FileOperation::Rename { old_path, new_path } => {
                sanitize_rel_path(old_path)?;
                sanitize_rel_path(new_path)?;
            }
        }

        self.storage
            .append_operation_log(&self.session_id, user_id, operation)
            .await?;

        let workspace = self.storage.workspace_dir(&self.session_id);
        match operation {
            FileOperation::Create { path, content } | FileOperation::Update { path, content } => {
                let target = workspace.join(sanitize_rel_path(path)?);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await?;
            }
            FileOperation::Delete { path } => {
                let target = workspace.join(sanitize_rel_path(path)?);
                // Deleting an already-missing file is not an error.
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        debug!("Delete of missing file {} in session {}", path, self.session_id);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            FileOperation::Rename { old_path, new_path } => {
                let from = workspace.join(sanitize_rel_path(old_path)?);
                let to = workspace.join(sanitize_rel_path(new_path)?);
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&from, &to).await?;
            }
        }

        let mut metadata = match self.storage.read_metadata(&self.session_id).await {
            Ok(metadata) => metadata,
            Err(SyncError::NotFound(_)) => SessionMetadata::new(&self.session_id),
            Err(e) => return Err(e),
        };
        metadata.add_participant(user_id);
        metadata.git_repo = workspace.join(".git").is_dir();
        self.storage
            .write_metadata(&self.session_id, &mut metadata)
            .await?;

        self.touch_activity();
        Ok(())
    }

    /// Full-state snapshot of a replicated document, creating it on first
    /// reference.
    pub fn document_state(&mut self, doc_id: &str) -> Result<Vec<u8>, SyncError> {
        let doc = self
            .documents
            .entry(doc_id.to_string())
            .or_insert_with(LoroDoc::new);
        doc.export(loro::ExportMode::Snapshot)
            .map_err(|e| SyncError::Protocol(format!("document encode failed: {}", e)))
    }

    /// Merge a remote delta. Convergence under arbitrary interleaving is
    /// guaranteed by the CRDT, independent of file-operation ordering.
    pub fn merge_document_update(&mut self, doc_id: &str, delta: &[u8]) -> Result<(), SyncError> {
        let doc = self
            .documents
            .entry(doc_id.to_string())
            .or_insert_with(LoroDoc::new);
        doc.import(delta)
            .map_err(|e| SyncError::Protocol(format!("document merge failed: {}", e)))?;
        self.touch_activity();
        Ok(())
    }

    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_active(&self, cooldown: Duration) -> bool {
        self.last_activity.elapsed() < cooldown
    }

    /// Release every replicated document. Called once per session teardown;
    /// a second call is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        debug!(
            "Disposing session {} ({} documents)",
            self.session_id,
            self.documents.len()
        );
        self.documents.clear();
        self.disposed = true;
    }
}
