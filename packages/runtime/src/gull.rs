// ABOUTME: Gull runtime adapter - browser automation capability
// ABOUTME: Passes command lines through verbatim; the runtime owns argument splitting

use crate::wire::RuntimeHttp;
use crate::{
    BrowserBatchOutcome, BrowserStep, Result, RuntimeAdapter, RuntimeKind, RuntimeMeta,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Serialize)]
struct ExecBody<'a> {
    command: &'a str,
    timeout: u64,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    commands: &'a [String],
    timeout: u64,
    stop_on_error: bool,
}

#[derive(Deserialize)]
struct StepReply {
    command: String,
    success: bool,
    #[serde(default)]
    output: String,
    error: Option<String>,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Deserialize)]
struct BatchReply {
    success: bool,
    steps: Vec<StepReply>,
}

impl From<StepReply> for BrowserStep {
    fn from(r: StepReply) -> Self {
        BrowserStep {
            command: r.command,
            success: r.success,
            output: r.output,
            error: r.error,
            duration_ms: r.duration_ms,
        }
    }
}

/// Adapter for the Gull browser runtime.
///
/// Commands go over the wire as single strings; Gull splits them into
/// arguments and injects its own session and profile flags. Bay never
/// prepends a prefix.
pub struct GullAdapter {
    http: RuntimeHttp,
    meta_cache: OnceCell<RuntimeMeta>,
}

impl GullAdapter {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: RuntimeHttp::new(endpoint, RuntimeKind::Gull),
            meta_cache: OnceCell::new(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for GullAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Gull
    }

    fn endpoint(&self) -> &str {
        self.http.base_url()
    }

    async fn meta(&self) -> Result<RuntimeMeta> {
        self.meta_cache
            .get_or_try_init(|| self.http.fetch_meta())
            .await
            .cloned()
    }

    async fn exec_browser(&self, command: &str, timeout_secs: u64) -> Result<BrowserStep> {
        debug!(command = %command, "gull.exec_browser");
        let reply: StepReply = self
            .http
            .post(
                "/browser/exec",
                &ExecBody {
                    command,
                    timeout: timeout_secs,
                },
                Some(timeout_secs),
            )
            .await?;
        Ok(reply.into())
    }

    async fn exec_browser_batch(
        &self,
        commands: &[String],
        timeout_secs: u64,
        stop_on_error: bool,
    ) -> Result<BrowserBatchOutcome> {
        debug!(steps = commands.len(), stop_on_error, "gull.exec_browser_batch");
        let reply: BatchReply = self
            .http
            .post(
                "/browser/exec_batch",
                &BatchBody {
                    commands,
                    timeout: timeout_secs,
                    stop_on_error,
                },
                Some(timeout_secs),
            )
            .await?;
        Ok(BrowserBatchOutcome {
            success: reply.success,
            steps: reply.steps.into_iter().map(Into::into).collect(),
        })
    }
}
