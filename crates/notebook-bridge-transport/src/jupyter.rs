//! Jupyter server transport.
//!
//! REST calls go through `reqwest`; kernel channels are a single
//! multiplexed WebSocket at `/api/kernels/{id}/channels`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use notebook_bridge_core::{
    Credential, KernelChannels, KernelId, KernelInfo, KernelMessage, NotebookFile,
    NotebookServer, ServerAddress, ServerConnector, ServerStatus, TransportError,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message, client::IntoClientRequest, http::HeaderValue,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to Jupyter servers over HTTP(S).
#[derive(Debug, Clone)]
pub struct JupyterConnector {
    request_timeout: Duration,
}

impl Default for JupyterConnector {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl JupyterConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-request HTTP timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ServerConnector for JupyterConnector {
    async fn connect(
        &self,
        address: &ServerAddress,
        credential: &Credential,
    ) -> Result<Arc<dyn NotebookServer>, TransportError> {
        let server = JupyterServer::new(address.clone(), credential.clone(), self.request_timeout)?;
        let status = server.status().await?;
        tracing::info!(
            "Connected to {} ({} kernel(s) running)",
            address,
            status.kernels.unwrap_or(0)
        );
        Ok(Arc::new(server))
    }
}

/// A connected Jupyter server.
pub struct JupyterServer {
    http: reqwest::Client,
    address: ServerAddress,
    credential: Credential,
}

#[derive(Deserialize)]
struct SessionModel {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    notebook: Option<NotebookRef>,
    kernel: KernelInfo,
}

#[derive(Deserialize)]
struct NotebookRef {
    path: String,
}

impl SessionModel {
    fn is_for(&self, notebook_path: &str) -> bool {
        self.path.as_deref() == Some(notebook_path)
            || self
                .notebook
                .as_ref()
                .is_some_and(|n| n.path == notebook_path)
    }
}

#[derive(Deserialize)]
struct ContentsModel {
    content: NotebookFile,
}

fn map_reqwest(e: &reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Protocol(format!("invalid request: {e}"))
    } else if e.is_decode() {
        TransportError::Protocol(format!("invalid response body: {e}"))
    } else {
        TransportError::Unreachable(e.to_string())
    }
}

fn map_ws(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(resp)
            if matches!(resp.status().as_u16(), 401 | 403) =>
        {
            TransportError::Auth(format!("kernel channel rejected: {}", resp.status()))
        }
        tungstenite::Error::Http(resp) if resp.status().as_u16() == 404 => {
            TransportError::NotFound("kernel channel".to_string())
        }
        tungstenite::Error::Url(e) => TransportError::Protocol(e.to_string()),
        other => TransportError::Unreachable(other.to_string()),
    }
}

async fn check(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().path().to_string();
    let message = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Auth(format!("{status} for {url}"))
        }
        StatusCode::NOT_FOUND => TransportError::NotFound(url),
        _ => TransportError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

impl JupyterServer {
    /// Build a server handle. Does not touch the network.
    ///
    /// # Errors
    /// Returns `Protocol` if the HTTP client cannot be constructed.
    pub fn new(
        address: ServerAddress,
        credential: Credential,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("notebook-bridge/{}", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Protocol(format!("http client: {e}")))?;
        Ok(Self {
            http,
            address,
            credential,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.address.join(path))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {}", self.credential.expose()),
            )
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        let resp = builder.send().await.map_err(|e| map_reqwest(&e))?;
        check(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        resp.json().await.map_err(|e| map_reqwest(&e))
    }

    /// Like [`Self::get_json`], but a 404 is `None`.
    async fn find_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, TransportError> {
        match self.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(TransportError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_empty(&self, path: &str) -> Result<(), TransportError> {
        self.send(self.request(Method::POST, path).json(&json!({})))
            .await
            .map(drop)
    }

    fn channels_url(&self, id: &KernelId) -> String {
        format!(
            "{}/api/kernels/{}/channels?token={}",
            self.address.websocket_base(),
            id,
            self.credential.expose()
        )
    }
}

#[async_trait]
impl NotebookServer for JupyterServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn status(&self) -> Result<ServerStatus, TransportError> {
        self.get_json("/api/status").await
    }

    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelInfo, TransportError> {
        let resp = self
            .send(
                self.request(Method::POST, "/api/kernels")
                    .json(&json!({ "name": kernel_name })),
            )
            .await?;
        let kernel: KernelInfo = resp.json().await.map_err(|e| map_reqwest(&e))?;
        tracing::info!("Started {} kernel {}", kernel_name, kernel.id.short());
        Ok(kernel)
    }

    async fn get_kernel(&self, id: &KernelId) -> Result<Option<KernelInfo>, TransportError> {
        self.find_json(&format!("/api/kernels/{id}")).await
    }

    async fn interrupt_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        tracing::debug!("Interrupting kernel {}", id.short());
        self.post_empty(&format!("/api/kernels/{id}/interrupt")).await
    }

    async fn restart_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        tracing::info!("Restarting kernel {}", id.short());
        self.post_empty(&format!("/api/kernels/{id}/restart")).await
    }

    async fn shutdown_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        self.send(self.request(Method::DELETE, &format!("/api/kernels/{id}")))
            .await
            .map(drop)
    }

    async fn find_session(&self, notebook_path: &str) -> Result<Option<KernelInfo>, TransportError> {
        let sessions: Vec<SessionModel> = self.get_json("/api/sessions").await?;
        Ok(sessions
            .into_iter()
            .find(|s| s.is_for(notebook_path))
            .map(|s| s.kernel))
    }

    async fn create_session(
        &self,
        notebook_path: &str,
        kernel_name: &str,
    ) -> Result<KernelInfo, TransportError> {
        let body = json!({
            "path": notebook_path,
            "type": "notebook",
            "kernel": { "name": kernel_name },
        });
        let resp = self
            .send(self.request(Method::POST, "/api/sessions").json(&body))
            .await?;
        let session: SessionModel = resp.json().await.map_err(|e| map_reqwest(&e))?;
        Ok(session.kernel)
    }

    async fn get_notebook(&self, path: &str) -> Result<Option<NotebookFile>, TransportError> {
        let model: Option<ContentsModel> = self
            .find_json(&format!("/api/contents/{path}?type=notebook&content=1"))
            .await?;
        Ok(model.map(|m| m.content))
    }

    async fn save_notebook(&self, path: &str, notebook: &NotebookFile) -> Result<(), TransportError> {
        let body = json!({ "type": "notebook", "content": notebook });
        self.send(
            self.request(Method::PUT, &format!("/api/contents/{path}"))
                .json(&body),
        )
        .await
        .map(drop)
    }

    async fn open_channels(&self, id: &KernelId) -> Result<KernelChannels, TransportError> {
        let mut request = self
            .channels_url(id)
            .into_client_request()
            .map_err(map_ws)?;
        let auth = HeaderValue::from_str(&format!("token {}", self.credential.expose()))
            .map_err(|_| TransportError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_ws)?;
        tracing::info!("Opened channels for kernel {}", id.short());

        let (mut sink, mut stream) = socket.split();
        let (to_kernel, mut outbound) = mpsc::unbounded_channel::<KernelMessage>();
        let (inbound, from_kernel) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize kernel message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let kernel = id.short().to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(_)) => {
                        tracing::debug!("Skipping binary kernel frame");
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Kernel channel error: {e}");
                        break;
                    }
                };
                let parsed = serde_json::from_str::<KernelMessage>(&text)
                    .map_err(|e| TransportError::Protocol(format!("malformed kernel message: {e}")));
                if inbound.send(parsed).is_err() {
                    break;
                }
            }
            tracing::debug!("Channels for kernel {} closed", kernel);
        });

        Ok(KernelChannels {
            sender: to_kernel,
            receiver: from_kernel,
        })
    }
}
