use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::models::SyncError;

/// Archive addressing scheme of a deployment. Callers must use one scheme
/// consistently per backend.
#[derive(Debug, Clone)]
pub enum ArchiveScope {
    /// `{sessionId}/session.tar.gz`
    Session,
    /// `{owner}/{repo}/{branch}/session.tar.gz` for GitHub-scoped sessions
    Repo {
        owner: String,
        repo: String,
        branch: String,
    },
}

impl ArchiveScope {
    pub fn key(&self, session_id: &str) -> String {
        match self {
            ArchiveScope::Session => format!("{}/session.tar.gz", session_id),
            ArchiveScope::Repo {
                owner,
                repo,
                branch,
            } => format!("{}/{}/{}/session.tar.gz", owner, repo, branch),
        }
    }
}

/// HTTP client for the remote blob store.
#[derive(Debug)]
pub struct RemoteStore {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl RemoteStore {
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            endpoint,
            token,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), key)
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>, SyncError> {
        let url = self.url(key);
        debug!("Downloading archive from {}", url);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), SyncError> {
        let url = self.url(key);
        debug!("Uploading archive to {} ({} bytes)", url, bytes.len());
        let mut request = self
            .client
            .put(&url)
            .header("Content-Type", "application/gzip")
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
