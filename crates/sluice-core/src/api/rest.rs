use std::io::{Cursor, Read};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::cancel::CancelToken;
use crate::config::ServerConfig;
use crate::error::{Result, SluiceError};

use super::multipart::MultipartForm;
use super::{
    CheckExistResponse, ChunkMeta, ChunkProgressFn, MergeRequest, MergeResponse, RemoteTask,
    UploadEndpoint, UploadServerConfig, UploadStats, ValidateRequest, ValidateResponse,
    VerifyResumeResponse,
};

/// Longest server error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// HTTP client for the remote upload service.
///
/// Two agents: metadata calls share short timeouts, chunk bodies get the
/// longer configured transfer timeout.
pub struct RestEndpoint {
    base_url: String,
    agent: ureq::Agent,
    chunk_agent: ureq::Agent,
    token: Option<String>,
}

impl RestEndpoint {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let connect = Duration::from_secs(config.connect_timeout_seconds);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(Duration::from_secs(config.request_timeout_seconds))
            .timeout_write(Duration::from_secs(config.request_timeout_seconds))
            .build();
        let chunk_agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(Duration::from_secs(config.chunk_timeout_seconds))
            .timeout_write(Duration::from_secs(config.chunk_timeout_seconds))
            .build();

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent,
            chunk_agent,
            token: config.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.token {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let mut req = self.apply_auth(self.agent.get(&self.url(path)));
        for (key, value) in query {
            req = req.query(key, value);
        }
        let resp = req.call().map_err(|e| map_http_err(path, e))?;
        parse_json(path, resp)
    }

    fn post_json<T: DeserializeOwned>(&self, path: &str, body: impl serde::Serialize) -> Result<T> {
        let req = self.apply_auth(self.agent.post(&self.url(path)));
        let resp = req.send_json(body).map_err(|e| map_http_err(path, e))?;
        parse_json(path, resp)
    }

    /// POST with query parameters and no body (cancel, pause).
    fn post_query(&self, path: &str, query: &[(&str, String)]) -> Result<()> {
        let mut req = self.apply_auth(self.agent.post(&self.url(path)));
        for (key, value) in query {
            req = req.query(key, value);
        }
        req.call().map_err(|e| map_http_err(path, e))?;
        Ok(())
    }

    fn delete_query(&self, path: &str, query: &[(&str, String)]) -> Result<()> {
        let mut req = self.apply_auth(self.agent.delete(&self.url(path)));
        for (key, value) in query {
            req = req.query(key, value);
        }
        req.call().map_err(|e| map_http_err(path, e))?;
        Ok(())
    }
}

fn parse_json<T: DeserializeOwned>(path: &str, resp: ureq::Response) -> Result<T> {
    resp.into_json()
        .map_err(|e| SluiceError::Other(format!("{path}: invalid response body: {e}")))
}

fn map_http_err(op: &str, err: ureq::Error) -> SluiceError {
    match err {
        ureq::Error::Status(status, resp) => {
            let mut message = resp.into_string().unwrap_or_default();
            message.truncate(MAX_ERROR_BODY);
            if message.trim().is_empty() {
                message = "(empty body)".to_string();
            }
            SluiceError::Server { status, message }
        }
        ureq::Error::Transport(t) => SluiceError::Network(format!("{op}: {t}")),
    }
}

/// Body reader that counts transferred bytes into the progress callback
/// and aborts the transfer once the task's cancel token is set.
struct ProgressReader<'a, R> {
    inner: R,
    sent: u64,
    total: u64,
    on_progress: ChunkProgressFn<'a>,
    cancel: &'a CancelToken,
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "upload cancelled",
            ));
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            (self.on_progress)(self.sent, self.total);
        }
        Ok(n)
    }
}

impl UploadEndpoint for RestEndpoint {
    fn fetch_config(&self) -> Result<UploadServerConfig> {
        self.get_json("upload/config", &[])
    }

    fn check_exist(
        &self,
        file_hash: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<CheckExistResponse> {
        self.get_json(
            "upload/check",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
                ("fileSize", file_size.to_string()),
            ],
        )
    }

    fn upload_chunk(
        &self,
        meta: &ChunkMeta<'_>,
        data: &[u8],
        on_progress: ChunkProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;

        let (content_type, body) = MultipartForm::new()
            .text("fileHash", meta.file_hash)
            .text("chunkIndex", &meta.chunk_index.to_string())
            .text("totalChunks", &meta.total_chunks.to_string())
            .text("fileName", meta.file_name)
            .text("chunkSize", &meta.chunk_size.to_string())
            .text("fileSize", &meta.file_size.to_string())
            .file("file", meta.file_name, "application/octet-stream", data)
            .finish();

        let total = body.len() as u64;
        let reader = ProgressReader {
            inner: Cursor::new(body),
            sent: 0,
            total,
            on_progress,
            cancel,
        };

        let result = self
            .apply_auth(self.chunk_agent.post(&self.url("upload/chunk")))
            .set("Content-Type", &content_type)
            .set("Content-Length", &total.to_string())
            .send(reader);

        match result {
            Ok(_) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(SluiceError::Cancelled),
            Err(e) => Err(map_http_err("upload/chunk", e)),
        }
    }

    fn uploaded_chunks(&self, file_hash: &str, file_name: &str) -> Result<Vec<usize>> {
        self.get_json(
            "upload/chunks",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
            ],
        )
    }

    fn merge_chunks(&self, request: &MergeRequest) -> Result<MergeResponse> {
        self.post_json("upload/merge", request)
    }

    fn validate_chunks(&self, request: &ValidateRequest) -> Result<ValidateResponse> {
        self.post_json("upload/validate", request)
    }

    fn cancel_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        self.post_query(
            "upload/cancel",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
            ],
        )
    }

    fn verify_resume(&self, file_hash: &str, file_name: &str) -> Result<VerifyResumeResponse> {
        self.get_json(
            "upload/verify",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
            ],
        )
    }

    fn pause_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        self.post_query(
            "upload/pause",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
            ],
        )
    }

    fn list_tasks(&self) -> Result<Vec<RemoteTask>> {
        self.get_json("upload/tasks", &[])
    }

    fn delete_task(&self, file_hash: &str, file_name: &str) -> Result<()> {
        self.delete_query(
            "upload/task",
            &[
                ("fileHash", file_hash.to_string()),
                ("fileName", file_name.to_string()),
            ],
        )
    }

    fn delete_tasks(&self, file_hashes: &[String]) -> Result<()> {
        let req = self.apply_auth(self.agent.delete(&self.url("upload/tasks")));
        req.send_json(file_hashes)
            .map_err(|e| map_http_err("upload/tasks", e))?;
        Ok(())
    }

    fn stats(&self) -> Result<UploadStats> {
        self.get_json("upload/stats", &[])
    }
}
