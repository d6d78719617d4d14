// ABOUTME: Shared HTTP plumbing for runtime adapters
// ABOUTME: One long-lived client per runtime kind; translates transport and wire failures

use crate::{Result, RuntimeError, RuntimeKind, RuntimeMeta};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Slack added on top of the operation timeout so the runtime can report its
/// own timeout before the transport gives up.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Default per-request deadline when the operation carries no timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static SHIP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
static GULL_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn client_for(kind: RuntimeKind) -> &'static reqwest::Client {
    let cell = match kind {
        RuntimeKind::Ship => &SHIP_CLIENT,
        RuntimeKind::Gull => &GULL_CLIENT,
    };
    cell.get_or_init(|| {
        reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("runtime http client construction cannot fail")
    })
}

/// Thin request helper bound to one runtime endpoint.
pub(crate) struct RuntimeHttp {
    base_url: String,
    kind: RuntimeKind,
}

impl RuntimeHttp {
    pub(crate) fn new(base_url: &str, kind: RuntimeKind) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_transport(e: reqwest::Error, path: &str) -> RuntimeError {
        if e.is_timeout() {
            RuntimeError::Timeout(path.to_string())
        } else if e.is_connect() || e.is_request() {
            RuntimeError::Unreachable(format!("{path}: {e}"))
        } else {
            RuntimeError::Protocol(format!("{path}: {e}"))
        }
    }

    async fn into_json<T: DeserializeOwned>(
        response: reqwest::Response,
        path: &str,
    ) -> Result<T> {
        let status = response.status();
        if status.as_u16() == 404 {
            let message = response.text().await.unwrap_or_default();
            return Err(RuntimeError::FileNotFound(message));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RuntimeError::Protocol(format!("{path}: {e}")))
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = client_for(self.kind)
            .get(format!("{}{}", self.base_url, path))
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::map_transport(e, path))?;
        Self::into_json(response, path).await
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        op_timeout_secs: Option<u64>,
    ) -> Result<T> {
        let timeout = op_timeout_secs
            .map(|t| Duration::from_secs(t) + TIMEOUT_MARGIN)
            .unwrap_or(DEFAULT_TIMEOUT);

        let response = client_for(self.kind)
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_transport(e, path))?;
        Self::into_json(response, path).await
    }

    /// Fetch and decode the `/meta` probe document.
    pub(crate) async fn fetch_meta(&self) -> Result<RuntimeMeta> {
        #[derive(serde::Deserialize)]
        struct MetaRuntime {
            name: String,
            version: String,
            api_version: String,
        }
        #[derive(serde::Deserialize)]
        struct MetaWorkspace {
            mount_path: String,
        }
        #[derive(serde::Deserialize)]
        struct MetaDoc {
            runtime: MetaRuntime,
            workspace: MetaWorkspace,
            capabilities: Vec<String>,
        }

        let doc: MetaDoc = self.get("/meta").await?;
        Ok(RuntimeMeta {
            name: doc.runtime.name,
            version: doc.runtime.version,
            api_version: doc.runtime.api_version,
            mount_path: doc.workspace.mount_path,
            capabilities: doc.capabilities,
        })
    }
}
