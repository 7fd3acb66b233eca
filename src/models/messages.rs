use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

/// One mutation of the shared workspace.
///
/// `create`/`update` always carry content; `delete`/`rename` never do.
/// The enum shape makes the invariant unrepresentable rather than checked.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum FileOperation {
    #[serde(rename_all = "camelCase")]
    Create { path: String, content: String },
    #[serde(rename_all = "camelCase")]
    Update { path: String, content: String },
    #[serde(rename_all = "camelCase")]
    Delete { path: String },
    #[serde(rename_all = "camelCase")]
    Rename { old_path: String, new_path: String },
}

/// One line of the append-only operation audit log.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: FileOperation,
}

/// A replicated-document delta, base64-encoded on the wire.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdate {
    pub doc_id: String,
    #[serde_as(as = "Base64")]
    pub delta: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GetFile {
    pub path: String,
}

/// Messages a client may send.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Both ids are required for a join to succeed; they are optional here
    /// so an incomplete join yields an `error` reply instead of a parse
    /// failure.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        session_id: Option<String>,
        user_id: Option<String>,
    },
    #[serde(rename = "fileOperation")]
    FileOperation { data: FileOperation },
    #[serde(rename = "docUpdate")]
    DocUpdate { data: DocUpdate },
    #[serde(rename = "getFiles")]
    GetFiles,
    #[serde(rename = "getFile")]
    GetFile { data: GetFile },
    #[serde(rename = "ping")]
    Ping,
}

/// Messages the server sends.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined {
        session_id: String,
        user_id: String,
        restored: bool,
    },
    #[serde(rename = "userJoined", rename_all = "camelCase")]
    UserJoined { user_id: String },
    #[serde(rename = "userLeft", rename_all = "camelCase")]
    UserLeft { user_id: String },
    /// Relay of a peer's file operation, stamped with actor and time.
    #[serde(rename = "fileOperation", rename_all = "camelCase")]
    FileOperation {
        user_id: String,
        timestamp: DateTime<Utc>,
        data: FileOperation,
    },
    /// Relay of a peer's document delta.
    #[serde(rename = "docUpdate", rename_all = "camelCase")]
    DocUpdate { user_id: String, data: DocUpdate },
    #[serde(rename = "fileOperationSuccess")]
    FileOperationSuccess,
    #[serde(rename = "files")]
    Files { data: Vec<String> },
    #[serde(rename = "fileContent")]
    FileContent { data: FileContent },
    #[serde(rename = "pong")]
    Pong { date: String },
    #[serde(rename = "error")]
    Error { error: String },
}
