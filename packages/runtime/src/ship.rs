// ABOUTME: Ship runtime adapter - code execution, shell and filesystem capabilities
// ABOUTME: HTTP client against the Ship container's REST API

use crate::wire::RuntimeHttp;
use crate::{
    ExecOutcome, FileEntry, Result, RuntimeAdapter, RuntimeError, RuntimeKind, RuntimeMeta,
};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Serialize)]
struct CodeBody<'a> {
    code: &'a str,
    timeout: u64,
}

#[derive(Serialize)]
struct ShellBody<'a> {
    command: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Serialize)]
struct PathBody<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct UploadBody<'a> {
    path: &'a str,
    content_b64: String,
}

#[derive(Deserialize)]
struct PythonReply {
    success: bool,
    #[serde(default)]
    output: String,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ShellReply {
    #[serde(default)]
    output: String,
    error: Option<String>,
    exit_code: Option<i64>,
}

#[derive(Deserialize)]
struct ReadReply {
    content: String,
}

#[derive(Deserialize)]
struct ListReply {
    entries: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct DownloadReply {
    content_b64: String,
}

#[derive(Deserialize)]
struct OkReply {
    #[allow(dead_code)]
    #[serde(default)]
    status: String,
}

/// Adapter for the Ship runtime (python, shell, filesystem).
pub struct ShipAdapter {
    http: RuntimeHttp,
    meta_cache: OnceCell<RuntimeMeta>,
}

impl ShipAdapter {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: RuntimeHttp::new(endpoint, RuntimeKind::Ship),
            meta_cache: OnceCell::new(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for ShipAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ship
    }

    fn endpoint(&self) -> &str {
        self.http.base_url()
    }

    async fn meta(&self) -> Result<RuntimeMeta> {
        // Failures are not cached: readiness polling retries until this
        // succeeds once, then every later call is served from the cache.
        self.meta_cache
            .get_or_try_init(|| self.http.fetch_meta())
            .await
            .cloned()
    }

    async fn exec_python(&self, code: &str, timeout_secs: u64) -> Result<ExecOutcome> {
        debug!(code_len = code.len(), "ship.exec_python");
        let reply: PythonReply = self
            .http
            .post("/ipython/exec", &CodeBody { code, timeout: timeout_secs }, Some(timeout_secs))
            .await?;
        Ok(ExecOutcome {
            success: reply.success,
            output: reply.output,
            error: reply.error,
            exit_code: None,
        })
    }

    async fn exec_shell(
        &self,
        command: &str,
        timeout_secs: u64,
        cwd: Option<&str>,
    ) -> Result<ExecOutcome> {
        debug!(command = %command.chars().take(100).collect::<String>(), "ship.exec_shell");
        let reply: ShellReply = self
            .http
            .post(
                "/shell/exec",
                &ShellBody {
                    command,
                    timeout: timeout_secs,
                    cwd,
                },
                Some(timeout_secs),
            )
            .await?;
        Ok(ExecOutcome {
            success: reply.exit_code == Some(0),
            output: reply.output,
            error: reply.error,
            exit_code: reply.exit_code,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let reply: ReadReply = self
            .http
            .post("/fs/read_file", &PathBody { path }, None)
            .await?;
        Ok(reply.content)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let _: OkReply = self
            .http
            .post("/fs/write_file", &WriteBody { path, content }, None)
            .await?;
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let reply: ListReply = self.http.post("/fs/list", &PathBody { path }, None).await?;
        Ok(reply.entries)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let _: OkReply = self
            .http
            .post("/fs/delete", &PathBody { path }, None)
            .await?;
        Ok(())
    }

    async fn upload_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let content_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let _: OkReply = self
            .http
            .post(
                "/fs/upload",
                &UploadBody { path, content_b64 },
                None,
            )
            .await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let reply: DownloadReply = self
            .http
            .post("/fs/download", &PathBody { path }, None)
            .await?;
        base64::engine::general_purpose::STANDARD
            .decode(reply.content_b64.as_bytes())
            .map_err(|e| RuntimeError::Protocol(format!("download payload: {e}")))
    }
}
