pub mod multipart;
pub mod rest;
pub mod retry;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::Result;

/// Server hints from `GET upload/config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadServerConfig {
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub max_concurrent_uploads: Option<usize>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

/// Answer from the existence check (`GET upload/check`).
///
/// `exist: true` means the store already has the full content and the
/// upload can complete instantly; otherwise `uploaded_chunks` lists the
/// chunk indices the store already holds from a previous attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckExistResponse {
    pub exist: bool,
    #[serde(default)]
    pub uploaded_chunks: Vec<usize>,
    #[serde(default)]
    pub file_url: Option<String>,
}

/// Metadata accompanying one chunk body (`POST upload/chunk`).
#[derive(Debug, Clone)]
pub struct ChunkMeta<'a> {
    pub file_hash: &'a str,
    pub file_name: &'a str,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Configured chunk size, not this chunk's length.
    pub chunk_size: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
    pub file_name: String,
    pub total_chunks: usize,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub file_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub file_hash: String,
    pub file_name: String,
    pub total_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    #[serde(default)]
    pub success: bool,
    pub valid: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResumeResponse {
    pub can_resume: bool,
    #[serde(default)]
    pub uploaded_chunks: Vec<usize>,
    #[serde(default)]
    pub total_chunks: usize,
}

/// Server-side record of one upload task (`GET upload/tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: usize,
    pub uploaded_chunks: usize,
    pub status: String,
    pub progress: f64,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub last_update_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub total_files: u64,
    pub success_files: u64,
    pub failed_files: u64,
    pub total_size: u64,
    pub uploaded_size: u64,
    #[serde(default)]
    pub average_speed: f64,
    #[serde(default)]
    pub estimated_time: f64,
}

/// Progress callback for a chunk transfer: `(bytes_sent, total_bytes)`.
pub type ChunkProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// The remote upload service consumed by the engine.
///
/// The seam between the engine and the network: the production
/// implementation is [`rest::RestEndpoint`]; tests substitute an
/// in-memory fake. All methods are synchronous; concurrency comes from
/// the scheduler calling them from several upload threads.
pub trait UploadEndpoint: Send + Sync {
    fn fetch_config(&self) -> Result<UploadServerConfig>;

    fn check_exist(
        &self,
        file_hash: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<CheckExistResponse>;

    /// Upload one chunk body. Implementations report transfer progress
    /// through `on_progress` and abort promptly once `cancel` is set.
    fn upload_chunk(
        &self,
        meta: &ChunkMeta<'_>,
        data: &[u8],
        on_progress: ChunkProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()>;

    fn uploaded_chunks(&self, file_hash: &str, file_name: &str) -> Result<Vec<usize>>;

    fn merge_chunks(&self, request: &MergeRequest) -> Result<MergeResponse>;

    fn validate_chunks(&self, request: &ValidateRequest) -> Result<ValidateResponse>;

    fn cancel_upload(&self, file_hash: &str, file_name: &str) -> Result<()>;

    fn verify_resume(&self, file_hash: &str, file_name: &str) -> Result<VerifyResumeResponse>;

    fn pause_upload(&self, file_hash: &str, file_name: &str) -> Result<()>;

    fn list_tasks(&self) -> Result<Vec<RemoteTask>>;

    fn delete_task(&self, file_hash: &str, file_name: &str) -> Result<()>;

    fn delete_tasks(&self, file_hashes: &[String]) -> Result<()>;

    fn stats(&self) -> Result<UploadStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_records_use_camel_case() {
        let resp: CheckExistResponse = serde_json::from_str(
            r#"{"exist": false, "uploadedChunks": [0, 2], "fileUrl": null}"#,
        )
        .unwrap();
        assert!(!resp.exist);
        assert_eq!(resp.uploaded_chunks, vec![0, 2]);
        assert!(resp.file_url.is_none());

        let merge = MergeRequest {
            file_hash: "abc".into(),
            file_name: "a.bin".into(),
            total_chunks: 3,
            file_size: 10,
            mime_type: None,
        };
        let json = serde_json::to_string(&merge).unwrap();
        assert!(json.contains("\"fileHash\""));
        assert!(json.contains("\"totalChunks\""));
        assert!(!json.contains("mimeType"), "None mime type is omitted");
    }

    #[test]
    fn check_exist_defaults_are_lenient() {
        // A dedup hit may carry only `exist` and `fileUrl`.
        let resp: CheckExistResponse =
            serde_json::from_str(r#"{"exist": true, "fileUrl": "https://x/y"}"#).unwrap();
        assert!(resp.exist);
        assert!(resp.uploaded_chunks.is_empty());
        assert_eq!(resp.file_url.as_deref(), Some("https://x/y"));
    }
}
