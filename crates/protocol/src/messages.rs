use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks whether an artifact with this fingerprint is already published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckExistingRequest {
    pub digest: String,
    pub name: String,
    pub size: u64,
}

/// Creates a receiver task, or returns the existing one for the same fingerprint.
///
/// `token` is a task identifier issued by an earlier initialize; it lets a
/// sender without a content digest resume the same task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
}

/// Header of a chunk upload. The chunk bytes travel as the binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChunkRequest {
    pub task_id: String,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_digest: Option<String>,
}

/// Asks which chunk indices the receiver still lacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMissingRequest {
    pub task_id: String,
    pub chunk_count: u32,
}

/// Requests reassembly and verification of a complete task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub size: u64,
    pub name: String,
}

/// Discards a task and its partial chunk storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskRequest {
    pub task_id: String,
}

/// Queries a task's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusRequest {
    pub task_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Result of an existence check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckExistingResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Acknowledges task initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTaskResponse {
    pub task_id: String,
    pub missing_indices: Vec<u32>,
    #[serde(default)]
    pub resumed: bool,
}

/// Acknowledges a persisted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendChunkResponse {
    pub ok: bool,
    pub index: u32,
}

/// Indices still missing from a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMissingResponse {
    pub missing_indices: Vec<u32>,
}

/// Confirms a published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub artifact_location: String,
    pub final_size: u64,
}

/// Confirms task deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTaskResponse {
    pub ok: bool,
}

/// Progress of a receiver task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub name: String,
    pub size: u64,
    pub received_count: u32,
    pub chunk_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received_indices: Vec<u32>,
    pub progress: f64,
}

/// Coordinator liveness summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_tasks: usize,
}
