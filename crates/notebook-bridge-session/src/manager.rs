//! Session manager: owns the single active session.

use notebook_bridge_core::{Credential, KernelId, ServerAddress, ServerConnector};
use notebook_bridge_kernel::KernelClientConfig;
use tokio::sync::RwLock;

use crate::{
    config::BridgeConfig,
    error::SessionError,
    session::Session,
    storage::{SavedSession, SessionStore, now},
};

/// Connection lifecycle for one session at a time.
///
/// Connecting again replaces (and closes) the previous session.
pub struct SessionManager<C, S>
where
    C: ServerConnector,
    S: SessionStore,
{
    connector: C,
    store: S,
    kernel_name: String,
    client_config: KernelClientConfig,
    current: RwLock<Option<Session>>,
}

impl<C, S> SessionManager<C, S>
where
    C: ServerConnector,
    S: SessionStore,
{
    /// Create a new session manager.
    #[must_use]
    pub fn new(connector: C, store: S) -> Self {
        Self {
            connector,
            store,
            kernel_name: "python3".to_string(),
            client_config: KernelClientConfig::default(),
            current: RwLock::new(None),
        }
    }

    /// Take the kernel name and execution settings from configuration.
    #[must_use]
    pub fn from_config(connector: C, store: S, config: &BridgeConfig) -> Self {
        Self::new(connector, store)
            .with_kernel_name(config.kernel.name.clone())
            .with_client_config(config.kernel_client())
    }

    #[must_use]
    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }

    #[must_use]
    pub fn with_client_config(mut self, config: KernelClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Connect to a server and open a session, replacing any current one.
    ///
    /// # Errors
    /// `Transport(Auth)` on a rejected credential, `Transport(Unreachable)`
    /// if the server cannot be reached.
    pub async fn connect(
        &self,
        address: ServerAddress,
        credential: Credential,
        notebook_path: Option<&str>,
    ) -> Result<Session, SessionError> {
        let server = self.connector.connect(&address, &credential).await?;
        let session = Session::open(
            server,
            credential,
            notebook_path.map(ToString::to_string),
            self.kernel_name.clone(),
            self.client_config.clone(),
        )
        .await?;

        let previous = self.current.write().await.replace(session.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!(address = %address, notebook = ?notebook_path, "Connected");
        self.remember(&session).await;
        Ok(session)
    }

    /// The live session.
    ///
    /// # Errors
    /// `NotConnected` if there is none.
    pub async fn current(&self) -> Result<Session, SessionError> {
        self.current
            .read()
            .await
            .clone()
            .filter(Session::is_live)
            .ok_or(SessionError::NotConnected)
    }

    /// Attach a kernel to the current session. Idempotent.
    ///
    /// # Errors
    /// `NotConnected` without a session, `Transport` if the server refuses.
    pub async fn attach_kernel(&self, kernel_name: Option<&str>) -> Result<KernelId, SessionError> {
        let session = self.current().await?;
        let id = session.attach_kernel(kernel_name).await?;
        self.remember(&session).await;
        Ok(id)
    }

    /// Close the current session, cancelling in-flight executions.
    /// Returns whether there was one.
    pub async fn disconnect(&self) -> bool {
        let previous = self.current.write().await.take();
        match previous {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Reconnect with the saved parameters and re-attach the saved kernel
    /// if the server still has it.
    ///
    /// # Errors
    /// `NoSavedSession` if nothing was saved, otherwise as [`Self::connect`].
    pub async fn reconnect_saved(&self) -> Result<Session, SessionError> {
        let saved = self
            .store
            .load()
            .await?
            .ok_or(SessionError::NoSavedSession)?;
        let session = self
            .connect(saved.address, saved.credential, saved.notebook_path.as_deref())
            .await?;

        if let Some(id) = saved.kernel_id {
            if session.kernel_id().await.is_none() {
                if session.attach_existing(&id).await? {
                    self.remember(&session).await;
                } else {
                    tracing::info!(kernel = %id.short(), "Saved kernel no longer exists");
                }
            }
        }
        Ok(session)
    }

    /// Forget the saved session.
    ///
    /// # Errors
    /// `Store` if the store fails.
    pub async fn forget_saved(&self) -> Result<(), SessionError> {
        Ok(self.store.clear().await?)
    }

    async fn remember(&self, session: &Session) {
        let saved = SavedSession {
            address: session.address().clone(),
            credential: session.credential().clone(),
            notebook_path: session.notebook_path().map(ToString::to_string),
            kernel_id: session.kernel_id().await,
            kernel_name: session.kernel_name().to_string(),
            saved_at: now(),
        };
        if let Err(e) = self.store.save(&saved).await {
            tracing::warn!("Failed to save session: {e}");
        }
    }
}
