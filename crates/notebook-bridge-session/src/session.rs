//! The live session context.
//!
//! A [`Session`] pairs one notebook document with at most one kernel on one
//! server. Every operation takes the session explicitly; nothing here is
//! process-global, so tests can hold several sessions side by side.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use notebook_bridge_core::{
    AttachedKernel, Cell, CellChange, CellId, CellKind, CellRef, CorrelationToken, Credential,
    Document, DocumentError, KernelId, KernelInfo, NotebookServer, OutputStore, ServerAddress,
    Snapshot, capture, diff, summarize,
};
use notebook_bridge_kernel::{
    ExecuteOptions, ExecutionHandle, ExecutionResult, KernelClient, KernelClientConfig,
    RequestState,
};
use tokio::sync::Mutex;

use crate::error::SessionError;

/// Outcome of an agent mutation.
///
/// The mutation is always applied. `WithConflict` carries the changes a
/// collaborator made since the last baseline, so the caller can warn about
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied<T> {
    Clean(T),
    WithConflict { value: T, changes: Vec<CellChange> },
}

impl<T> Applied<T> {
    fn new(value: T, changes: Vec<CellChange>) -> Self {
        if changes.is_empty() {
            Self::Clean(value)
        } else {
            Self::WithConflict { value, changes }
        }
    }

    #[must_use]
    pub const fn value(&self) -> &T {
        match self {
            Self::Clean(value) | Self::WithConflict { value, .. } => value,
        }
    }

    #[must_use]
    pub fn into_value(self) -> T {
        match self {
            Self::Clean(value) | Self::WithConflict { value, .. } => value,
        }
    }

    /// Collaborator changes detected before the mutation.
    #[must_use]
    pub fn conflicts(&self) -> &[CellChange] {
        match self {
            Self::Clean(_) => &[],
            Self::WithConflict { changes, .. } => changes,
        }
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }
}

/// Result of comparing the document against the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    pub changes: Vec<CellChange>,
    /// False when no baseline was ever captured.
    pub has_baseline: bool,
    pub summary: String,
    /// Fingerprint of the baseline the diff ran against.
    pub baseline_fingerprint: Option<String>,
}

struct NotebookState {
    document: Document,
    baseline: Option<Snapshot>,
}

struct Attached {
    info: KernelInfo,
    client: KernelClient,
}

struct Inner {
    server: Arc<dyn NotebookServer>,
    credential: Credential,
    notebook_path: Option<String>,
    kernel_name: String,
    client_config: KernelClientConfig,
    live: AtomicBool,
    kernel: Mutex<Option<Attached>>,
    notebook: Mutex<NotebookState>,
}

/// A connected notebook session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Load (or create) the notebook and adopt an existing server session's
    /// kernel when there is one.
    pub(crate) async fn open(
        server: Arc<dyn NotebookServer>,
        credential: Credential,
        notebook_path: Option<String>,
        kernel_name: String,
        client_config: KernelClientConfig,
    ) -> Result<Self, SessionError> {
        let document = match notebook_path.as_deref() {
            Some(path) => {
                if let Some(file) = server.get_notebook(path).await? {
                    let document = Document::load(file);
                    tracing::info!(path, cells = document.len(), "Loaded notebook");
                    document
                } else {
                    let document = Document::new(&kernel_name);
                    server.save_notebook(path, &document.serialize()).await?;
                    tracing::info!(path, "Created notebook");
                    document
                }
            }
            None => Document::new(&kernel_name),
        };

        let session = Self {
            inner: Arc::new(Inner {
                server,
                credential,
                notebook_path,
                kernel_name,
                client_config,
                live: AtomicBool::new(true),
                kernel: Mutex::new(None),
                notebook: Mutex::new(NotebookState {
                    baseline: Some(capture(&document)),
                    document,
                }),
            }),
        };

        if let Some(path) = session.inner.notebook_path.as_deref() {
            if let Some(info) = session.inner.server.find_session(path).await? {
                tracing::info!(path, kernel = %info.id.short(), "Adopting existing kernel session");
                session.install_kernel(info).await?;
            }
        }
        Ok(session)
    }

    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        self.inner.server.address()
    }

    pub(crate) fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    #[must_use]
    pub fn notebook_path(&self) -> Option<&str> {
        self.inner.notebook_path.as_deref()
    }

    /// Kernel spec name used when a kernel has to be started.
    #[must_use]
    pub fn kernel_name(&self) -> &str {
        &self.inner.kernel_name
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Id of the attached kernel, if any.
    pub async fn kernel_id(&self) -> Option<KernelId> {
        self.inner
            .kernel
            .lock()
            .await
            .as_ref()
            .map(|k| k.info.id.clone())
    }

    /// Attach a kernel. A no-op returning the current id when one is
    /// already attached.
    ///
    /// With a notebook path this creates a server session for it, otherwise
    /// it starts a bare kernel.
    ///
    /// # Errors
    /// `NotConnected` on a closed session, `Transport` if the server refuses.
    pub async fn attach_kernel(&self, kernel_name: Option<&str>) -> Result<KernelId, SessionError> {
        self.ensure_live()?;
        if let Some(id) = self.kernel_id().await {
            return Ok(id);
        }
        let name = kernel_name.unwrap_or(&self.inner.kernel_name);
        let info = match self.inner.notebook_path.as_deref() {
            Some(path) => self.inner.server.create_session(path, name).await?,
            None => self.inner.server.start_kernel(name).await?,
        };
        self.install_kernel(info).await
    }

    /// Re-attach a kernel by id. Returns `false` if the server no longer
    /// knows it.
    pub(crate) async fn attach_existing(&self, id: &KernelId) -> Result<bool, SessionError> {
        if self.kernel_id().await.as_ref() == Some(id) {
            return Ok(true);
        }
        match self.inner.server.get_kernel(id).await? {
            Some(info) => {
                self.install_kernel(info).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn install_kernel(&self, info: KernelInfo) -> Result<KernelId, SessionError> {
        let mut slot = self.inner.kernel.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.info.id.clone());
        }
        let client = self.spawn_client(&info.id).await?;
        tracing::info!(kernel = %info.id.short(), name = %info.name, "Kernel attached");
        let id = info.id.clone();
        *slot = Some(Attached { info, client });
        Ok(id)
    }

    async fn spawn_client(&self, id: &KernelId) -> Result<KernelClient, SessionError> {
        let channels = self.inner.server.open_channels(id).await?;
        let control = Arc::new(AttachedKernel::new(
            Arc::clone(&self.inner.server),
            id.clone(),
        ));
        Ok(KernelClient::spawn(
            channels,
            control,
            self.inner.client_config.clone(),
        ))
    }

    /// The kernel client, reopening the channels if the last ones closed.
    async fn client(&self) -> Result<KernelClient, SessionError> {
        self.ensure_live()?;
        let mut slot = self.inner.kernel.lock().await;
        let attached = slot.as_mut().ok_or(SessionError::NoKernel)?;
        if attached.client.is_closed() {
            tracing::info!(kernel = %attached.info.id.short(), "Reopening kernel channels");
            attached.client = self.spawn_client(&attached.info.id).await?;
        }
        Ok(attached.client.clone())
    }

    /// A copy of the current document, refreshed from the server.
    ///
    /// # Errors
    /// `NotConnected`, or `Transport` if the refresh fails.
    pub async fn document(&self) -> Result<Document, SessionError> {
        self.ensure_live()?;
        let mut notebook = self.inner.notebook.lock().await;
        self.refresh(&mut notebook).await?;
        Ok(notebook.document.clone())
    }

    async fn refresh(&self, notebook: &mut NotebookState) -> Result<(), SessionError> {
        let Some(path) = self.inner.notebook_path.as_deref() else {
            return Ok(());
        };
        match self.inner.server.get_notebook(path).await? {
            Some(file) => notebook.document = Document::load(file),
            None => tracing::warn!(path, "Notebook disappeared from the server, keeping local copy"),
        }
        Ok(())
    }

    async fn persist(&self, document: &Document) -> Result<(), SessionError> {
        if let Some(path) = self.inner.notebook_path.as_deref() {
            self.inner
                .server
                .save_notebook(path, &document.serialize())
                .await?;
        }
        Ok(())
    }

    /// Refresh, detect collaborator changes, apply, save, re-baseline.
    async fn mutate<T: Send>(
        &self,
        op: impl FnOnce(&mut Document) -> Result<T, DocumentError> + Send,
    ) -> Result<Applied<T>, SessionError> {
        self.ensure_live()?;
        let mut guard = self.inner.notebook.lock().await;
        let notebook = &mut *guard;
        self.refresh(notebook).await?;

        let changes = notebook
            .baseline
            .as_ref()
            .map(|baseline| diff(baseline, &notebook.document))
            .unwrap_or_default();
        if !changes.is_empty() {
            tracing::warn!(summary = %summarize(&changes), "Notebook changed since last snapshot");
        }

        let value = op(&mut notebook.document)?;
        self.persist(&notebook.document).await?;
        notebook.baseline = Some(capture(&notebook.document));
        Ok(Applied::new(value, changes))
    }

    /// Insert a cell at `position`.
    ///
    /// # Errors
    /// `IndexOutOfRange` if `position` is past the end.
    pub async fn insert_cell(
        &self,
        position: usize,
        kind: CellKind,
        source: impl Into<String> + Send,
    ) -> Result<Applied<CellId>, SessionError> {
        let source = source.into();
        self.mutate(move |doc| doc.insert_cell(position, kind, source))
            .await
    }

    /// Append a cell at the end.
    ///
    /// # Errors
    /// `NotConnected`, or `Transport` if the notebook cannot be synced.
    pub async fn append_cell(
        &self,
        kind: CellKind,
        source: impl Into<String> + Send,
    ) -> Result<Applied<CellId>, SessionError> {
        let source = source.into();
        self.mutate(move |doc| Ok(doc.push_cell(kind, source))).await
    }

    /// Replace a cell's source. Returns whether it changed.
    ///
    /// # Errors
    /// `NoSuchCell` / `IndexOutOfRange` for a bad target.
    pub async fn edit_cell_source(
        &self,
        target: impl Into<CellRef> + Send,
        source: impl Into<String> + Send,
    ) -> Result<Applied<bool>, SessionError> {
        let (target, source) = (target.into(), source.into());
        self.mutate(move |doc| {
            let id = doc.resolve(&target)?;
            doc.edit_cell_source(&id, source)
        })
        .await
    }

    /// Delete a cell and return it.
    ///
    /// # Errors
    /// `NoSuchCell` / `IndexOutOfRange` for a bad target.
    pub async fn delete_cell(
        &self,
        target: impl Into<CellRef> + Send,
    ) -> Result<Applied<Cell>, SessionError> {
        let target = target.into();
        self.mutate(move |doc| {
            let id = doc.resolve(&target)?;
            doc.delete_cell(&id)
        })
        .await
    }

    /// Move a cell to `new_position`.
    ///
    /// # Errors
    /// `NoSuchCell` / `IndexOutOfRange` for a bad target or position.
    pub async fn move_cell(
        &self,
        target: impl Into<CellRef> + Send,
        new_position: usize,
    ) -> Result<Applied<()>, SessionError> {
        let target = target.into();
        self.mutate(move |doc| {
            let id = doc.resolve(&target)?;
            doc.move_cell(&id, new_position)
        })
        .await
    }

    /// Capture a new baseline from the refreshed document.
    ///
    /// # Errors
    /// `NotConnected`, or `Transport` if the refresh fails.
    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.ensure_live()?;
        let mut notebook = self.inner.notebook.lock().await;
        self.refresh(&mut notebook).await?;
        let snapshot = capture(&notebook.document);
        tracing::debug!(fingerprint = snapshot.fingerprint(), "Captured baseline");
        notebook.baseline = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Changes since the baseline, without moving it.
    ///
    /// # Errors
    /// `NotConnected`, or `Transport` if the refresh fails.
    pub async fn diff(&self) -> Result<DiffReport, SessionError> {
        self.ensure_live()?;
        let mut notebook = self.inner.notebook.lock().await;
        self.refresh(&mut notebook).await?;
        let Some(baseline) = notebook.baseline.as_ref() else {
            return Ok(DiffReport {
                changes: Vec::new(),
                has_baseline: false,
                summary: "No snapshot taken yet.".to_string(),
                baseline_fingerprint: None,
            });
        };
        let changes = diff(baseline, &notebook.document);
        Ok(DiffReport {
            summary: summarize(&changes),
            changes,
            has_baseline: true,
            baseline_fingerprint: Some(baseline.fingerprint().to_string()),
        })
    }

    /// Queue an execution of a code cell.
    ///
    /// With `code`, the cell's source is first replaced by it. That edit
    /// goes through the same conflict check as any other mutation; the
    /// collaborator changes it found are on [`CellExecution::conflicts`].
    /// The cell's previous outputs are cleared locally and replaced once
    /// the execution reaches a terminal state.
    ///
    /// # Errors
    /// `NoKernel` without an attached kernel, `NotCodeCell` for narrative
    /// cells, `NoSuchCell` / `IndexOutOfRange` for a bad target.
    pub async fn submit_cell(
        &self,
        target: impl Into<CellRef> + Send,
        code: Option<String>,
        options: ExecuteOptions,
    ) -> Result<CellExecution, SessionError> {
        let client = self.client().await?;
        let mut target = target.into();

        let mut conflicts = Vec::new();
        if let Some(code) = code {
            let edit_target = target.clone();
            let applied = self
                .mutate(move |doc| {
                    let id = code_cell(doc, &edit_target)?;
                    doc.edit_cell_source(&id, code)?;
                    Ok(id)
                })
                .await?;
            conflicts = applied.conflicts().to_vec();
            target = CellRef::Id(applied.into_value());
        }

        let (cell, code) = {
            let mut notebook = self.inner.notebook.lock().await;
            self.refresh(&mut notebook).await?;
            let document = &mut notebook.document;
            let id = code_cell(document, &target)?;
            document.record_execution(&id, Vec::new(), None)?;
            let source = document
                .cell(&id)
                .map(|c| c.source().to_string())
                .unwrap_or_default();
            (id, source)
        };

        let handle = client.submit(code, options).await?;
        tracing::info!(cell = %cell, token = %handle.token(), "Cell submitted");
        Ok(CellExecution {
            session: self.clone(),
            cell,
            handle,
            conflicts,
        })
    }

    /// Execute a code cell and wait for its terminal state.
    ///
    /// Execution failures are reported in the result, not as errors.
    ///
    /// # Errors
    /// See [`Self::submit_cell`].
    pub async fn execute_cell(
        &self,
        target: impl Into<CellRef> + Send,
        code: Option<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, SessionError> {
        self.submit_cell(target, code, options).await?.wait().await
    }

    /// Run code without recording it in the document.
    ///
    /// # Errors
    /// `NotConnected`, `NoKernel`, or `Kernel` if the client is closed.
    pub async fn execute_code(
        &self,
        code: impl Into<String> + Send,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, SessionError> {
        let client = self.client().await?;
        Ok(client.execute(code, options).await?)
    }

    /// Interrupt the kernel. Returns the token of the request that was
    /// running, if any.
    ///
    /// # Errors
    /// `NotConnected`, `NoKernel`, or `Kernel` if the client is closed.
    pub async fn interrupt_kernel(&self) -> Result<Option<CorrelationToken>, SessionError> {
        let client = self.client().await?;
        Ok(client.interrupt().await?)
    }

    /// Restart the kernel. Queued and running requests fail with a
    /// protocol error; returns how many there were.
    ///
    /// # Errors
    /// `NotConnected`, `NoKernel`, or `Transport` if the server refuses.
    pub async fn restart_kernel(&self) -> Result<usize, SessionError> {
        let client = self.client().await?;
        let id = self.kernel_id().await.ok_or(SessionError::NoKernel)?;
        self.inner.server.restart_kernel(&id).await?;
        let invalidated = client.invalidate_all("kernel restarted").await?;
        tracing::info!(kernel = %id.short(), invalidated, "Kernel restarted");
        Ok(invalidated)
    }

    /// Invalidate the session and stop the kernel client. In-flight work
    /// is cancelled. The server-side kernel keeps running.
    pub(crate) async fn close(&self) {
        if !self.inner.live.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(attached) = self.inner.kernel.lock().await.take() {
            attached.client.shutdown().await;
        }
        tracing::info!(address = %self.address(), "Session closed");
    }

    async fn record(&self, cell: &CellId, result: &ExecutionResult) {
        if result.dispatched_at.is_none() {
            return;
        }
        let mut notebook = self.inner.notebook.lock().await;
        if let Err(e) = self.refresh(&mut notebook).await {
            tracing::warn!(cell = %cell, "Could not refresh before recording outputs: {e}");
        }
        match notebook
            .document
            .record_execution(cell, result.outputs.clone(), result.execution_count)
        {
            Ok(()) => {}
            Err(DocumentError::NoSuchCell(_)) => {
                tracing::warn!(cell = %cell, token = %result.token, "Cell deleted during execution, outputs dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(cell = %cell, "Could not record outputs: {e}");
                return;
            }
        }
        if let Err(e) = self.persist(&notebook.document).await {
            tracing::warn!(cell = %cell, "Failed to save notebook after execution: {e}");
        }
    }
}

/// Resolve `target` to a code cell.
fn code_cell(document: &Document, target: &CellRef) -> Result<CellId, DocumentError> {
    let id = document.resolve(target)?;
    if document.cell(&id).is_some_and(|c| c.kind().is_code()) {
        Ok(id)
    } else {
        Err(DocumentError::NotCodeCell(id))
    }
}

/// A submitted cell execution.
pub struct CellExecution {
    session: Session,
    cell: CellId,
    handle: ExecutionHandle,
    conflicts: Vec<CellChange>,
}

impl CellExecution {
    #[must_use]
    pub const fn cell_id(&self) -> &CellId {
        &self.cell
    }

    /// Collaborator changes found while replacing the cell's source.
    #[must_use]
    pub fn conflicts(&self) -> &[CellChange] {
        &self.conflicts
    }

    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        self.handle.token()
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.handle.state()
    }

    /// Suspend until the state satisfies `pred`.
    ///
    /// # Errors
    /// `Kernel(Closed)` if the client stopped first.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&RequestState) -> bool,
    ) -> Result<RequestState, SessionError> {
        Ok(self.handle.wait_for(pred).await?)
    }

    /// Live and buffered outputs.
    #[must_use]
    pub fn outputs(&self) -> Arc<OutputStore> {
        self.handle.outputs()
    }

    /// Request cancellation.
    ///
    /// # Errors
    /// `Kernel(Closed)` if the client stopped.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        Ok(self.handle.cancel().await?)
    }

    /// Wait for the terminal state and record the outputs on the cell.
    ///
    /// # Errors
    /// `Kernel(Closed)` if the client stopped without finalizing.
    pub async fn wait(self) -> Result<ExecutionResult, SessionError> {
        let result = self.handle.wait().await?;
        tracing::info!(
            cell = %self.cell,
            token = %result.token,
            state = ?result.terminal.request_state(),
            "Cell execution finished"
        );
        self.session.record(&self.cell, &result).await;
        Ok(result)
    }
}
