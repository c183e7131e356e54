//! Kernel client actor.
//!
//! One background task owns the kernel's message stream. It keeps a strict
//! FIFO of submitted requests, dispatches one at a time, correlates every
//! inbound message by its parent token and closes each request at its
//! `idle` fence. Callers talk to it through [`KernelClient`] commands.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use notebook_bridge_core::{
    CorrelationToken, KernelChannels, KernelControl, KernelEvent, KernelMessage, OutputStore,
    TransportError,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    collector::{Collector, Step, StopReason},
    request::{
        ExecuteOptions, ExecutionFailure, ExecutionHandle, ExecutionResult, RequestState,
        TerminalState,
    },
};

/// Kernel client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel client is closed")]
    Closed,
    #[error("Kernel is busy with request {active}")]
    KernelBusy { active: CorrelationToken },
    #[error("No such request: {0}")]
    NoSuchRequest(CorrelationToken),
}

/// Kernel client configuration.
#[derive(Debug, Clone)]
pub struct KernelClientConfig {
    /// Deadline for a request, measured from dispatch.
    pub default_timeout: Duration,
    /// How long to wait for the fence after an interrupt before forcing it.
    pub drain_grace: Duration,
    /// Number of finished tokens remembered for draining late messages.
    pub retired_capacity: usize,
    /// Session id stamped on outgoing message headers.
    pub session_id: String,
}

impl Default for KernelClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            drain_grace: Duration::from_secs(10),
            retired_capacity: 1024,
            session_id: Uuid::new_v4().to_string(),
        }
    }
}

struct Submitted {
    token: CorrelationToken,
    state: watch::Receiver<RequestState>,
    outputs: Arc<OutputStore>,
    result: oneshot::Receiver<ExecutionResult>,
}

enum Command {
    Submit {
        code: String,
        options: ExecuteOptions,
        reply: oneshot::Sender<Result<Submitted, KernelError>>,
    },
    Cancel {
        token: CorrelationToken,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    Interrupt {
        reply: oneshot::Sender<Option<CorrelationToken>>,
    },
    Invalidate {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    anomalies: AtomicU64,
}

/// Handle to a running kernel client actor. Cheap to clone.
#[derive(Clone)]
pub struct KernelClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl KernelClient {
    /// Spawn the actor over an opened kernel channel.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        channels: KernelChannels,
        control: Arc<dyn KernelControl>,
        config: KernelClientConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let actor = Actor {
            commands: commands_rx,
            outbound: channels.sender,
            inbound: channels.receiver,
            control,
            retired: Retired::new(config.retired_capacity),
            config,
            shared: Arc::clone(&shared),
            queue: VecDeque::new(),
            active: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            shared,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| KernelError::Closed)?;
        rx.await.map_err(|_| KernelError::Closed)
    }

    /// Queue code for execution and return a handle to follow it.
    ///
    /// # Errors
    /// `KernelBusy` for an exclusive request while other work is pending,
    /// `Closed` if the client has stopped.
    pub async fn submit(
        &self,
        code: impl Into<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, KernelError> {
        let code = code.into();
        let submitted = self
            .request(|reply| Command::Submit {
                code,
                options,
                reply,
            })
            .await??;

        Ok(ExecutionHandle {
            token: submitted.token,
            state: submitted.state,
            outputs: submitted.outputs,
            result: submitted.result,
            client: self.clone(),
        })
    }

    /// Submit and wait for the terminal state.
    ///
    /// # Errors
    /// See [`Self::submit`] and [`ExecutionHandle::wait`].
    pub async fn execute(
        &self,
        code: impl Into<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, KernelError> {
        self.submit(code, options).await?.wait().await
    }

    /// Cancel a request. A queued request is dropped without touching the
    /// kernel; the running one is interrupted and drained.
    ///
    /// Cancelling a request that already finished is a no-op.
    ///
    /// # Errors
    /// `NoSuchRequest` if the token was never seen, `Closed` if the client
    /// has stopped.
    pub async fn cancel(&self, token: &CorrelationToken) -> Result<(), KernelError> {
        let token = token.clone();
        self.request(|reply| Command::Cancel { token, reply }).await?
    }

    /// Cancel whatever is running. Returns its token, if any.
    ///
    /// # Errors
    /// `Closed` if the client has stopped.
    pub async fn interrupt(&self) -> Result<Option<CorrelationToken>, KernelError> {
        self.request(|reply| Command::Interrupt { reply }).await
    }

    /// Fail every in-flight and queued request as a restart protocol
    /// failure, which the supervisor never retries.
    /// Used after the kernel restarted. Returns how many were failed.
    ///
    /// # Errors
    /// `Closed` if the client has stopped.
    pub async fn invalidate_all(&self, reason: impl Into<String>) -> Result<usize, KernelError> {
        let reason = reason.into();
        self.request(|reply| Command::Invalidate { reason, reply })
            .await
    }

    /// Cancel all work and stop the actor.
    pub async fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("Kernel client already stopped");
        }
    }

    /// Whether the actor has stopped, either by shutdown or because the
    /// kernel channel closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Sequencing anomalies seen after a request's fence.
    #[must_use]
    pub fn anomalies(&self) -> u64 {
        self.shared.anomalies.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    /// Closed by its own idle status.
    Fenced,
    /// Closed without one; late messages are expected.
    Forced,
}

struct Retired {
    order: VecDeque<CorrelationToken>,
    kinds: HashMap<CorrelationToken, Retirement>,
    capacity: usize,
}

impl Retired {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            kinds: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, token: CorrelationToken, kind: Retirement) {
        if self.kinds.insert(token.clone(), kind).is_none() {
            self.order.push_back(token);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.kinds.remove(&oldest);
            }
        }
    }

    fn get(&self, token: &CorrelationToken) -> Option<Retirement> {
        self.kinds.get(token).copied()
    }
}

struct Pending {
    token: CorrelationToken,
    code: String,
    timeout: Duration,
    state: watch::Sender<RequestState>,
    outputs: Arc<OutputStore>,
    result: oneshot::Sender<ExecutionResult>,
    submitted_at: Instant,
}

impl Pending {
    /// Finish a request that never reached the kernel.
    fn finish_unsent(self, terminal: TerminalState) {
        self.outputs.push_finished();
        self.state.send_replace(terminal.request_state());
        let result = ExecutionResult::unsent(self.token, self.submitted_at.into_std(), terminal);
        let _ = self.result.send(result);
    }
}

struct Active {
    request: Pending,
    collector: Collector,
    dispatched_at: Instant,
    deadline: Instant,
    drain_deadline: Option<Instant>,
}

impl Active {
    fn next_wake(&self) -> Instant {
        self.drain_deadline.unwrap_or(self.deadline)
    }
}

struct Actor {
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedSender<KernelMessage>,
    inbound: mpsc::UnboundedReceiver<Result<KernelMessage, TransportError>>,
    control: Arc<dyn KernelControl>,
    config: KernelClientConfig,
    shared: Arc<Shared>,
    queue: VecDeque<Pending>,
    active: Option<Active>,
    retired: Retired,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let wake = self.active.as_ref().map(Active::next_wake);
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.on_command(command) {
                        break;
                    }
                }
                inbound = self.inbound.recv() => match inbound {
                    Some(Ok(msg)) => self.on_message(&msg),
                    Some(Err(e)) => {
                        self.shared.anomalies.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Unreadable kernel message: {}", e);
                    }
                    None => {
                        self.on_transport_closed();
                        break;
                    }
                },
                () = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.on_deadline();
                }
            }
            self.dispatch_next();
        }
        self.shared.closed.store(true, Ordering::Release);
        tracing::debug!("Kernel client stopped");
    }

    /// Returns `false` when the actor should stop.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit {
                code,
                options,
                reply,
            } => {
                let _ = reply.send(self.submit(code, options));
            }
            Command::Cancel { token, reply } => {
                let _ = reply.send(self.cancel(&token));
            }
            Command::Interrupt { reply } => {
                let token = self.active.as_ref().map(|a| a.request.token.clone());
                if token.is_some() {
                    self.stop_active(StopReason::Cancel);
                }
                let _ = reply.send(token);
            }
            Command::Invalidate { reason, reply } => {
                let _ = reply.send(self.invalidate(&reason));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn submit(&mut self, code: String, options: ExecuteOptions) -> Result<Submitted, KernelError> {
        if options.exclusive {
            let busy = self
                .active
                .as_ref()
                .map(|a| &a.request.token)
                .or_else(|| self.queue.front().map(|p| &p.token));
            if let Some(active) = busy {
                return Err(KernelError::KernelBusy {
                    active: active.clone(),
                });
            }
        }

        let token = CorrelationToken::generate();
        let (state_tx, state_rx) = watch::channel(RequestState::Queued);
        let (result_tx, result_rx) = oneshot::channel();
        let outputs = Arc::new(OutputStore::new());

        tracing::debug!("Queued request {} ({} ahead)", token, self.queue.len());
        self.queue.push_back(Pending {
            token: token.clone(),
            code,
            timeout: options.timeout.unwrap_or(self.config.default_timeout),
            state: state_tx,
            outputs: Arc::clone(&outputs),
            result: result_tx,
            submitted_at: Instant::now(),
        });

        Ok(Submitted {
            token,
            state: state_rx,
            outputs,
            result: result_rx,
        })
    }

    fn cancel(&mut self, token: &CorrelationToken) -> Result<(), KernelError> {
        if self
            .active
            .as_ref()
            .is_some_and(|a| &a.request.token == token)
        {
            self.stop_active(StopReason::Cancel);
            return Ok(());
        }

        if let Some(index) = self.queue.iter().position(|p| &p.token == token) {
            if let Some(pending) = self.queue.remove(index) {
                tracing::info!("Cancelled queued request {}", token);
                self.retired.insert(token.clone(), Retirement::Forced);
                pending.finish_unsent(TerminalState::Cancelled);
            }
            return Ok(());
        }

        if self.retired.get(token).is_some() {
            return Ok(());
        }
        Err(KernelError::NoSuchRequest(token.clone()))
    }

    fn invalidate(&mut self, reason: &str) -> usize {
        let mut failed = 0;
        if self.active.is_some() {
            self.finish_active(
                TerminalState::failed(ExecutionFailure::restarted(reason)),
                Retirement::Forced,
            );
            failed += 1;
        }
        for pending in self.queue.drain(..) {
            self.retired.insert(pending.token.clone(), Retirement::Forced);
            pending.finish_unsent(TerminalState::failed(ExecutionFailure::restarted(reason)));
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!("Invalidated {} request(s): {}", failed, reason);
        }
        failed
    }

    fn shutdown(&mut self) {
        for pending in self.queue.drain(..) {
            pending.finish_unsent(TerminalState::Cancelled);
        }
        if self.active.is_some() {
            self.stop_active(StopReason::Cancel);
            self.finish_active(TerminalState::Cancelled, Retirement::Forced);
        }
        self.shared.closed.store(true, Ordering::Release);
    }

    fn on_transport_closed(&mut self) {
        tracing::warn!("Kernel channel closed");
        let failure = ExecutionFailure::unreachable("kernel channel closed");
        if self.active.is_some() {
            self.finish_active(TerminalState::failed(failure.clone()), Retirement::Forced);
        }
        for pending in self.queue.drain(..) {
            pending.finish_unsent(TerminalState::failed(failure.clone()));
        }
        self.shared.closed.store(true, Ordering::Release);
    }

    fn on_message(&mut self, msg: &KernelMessage) {
        let Some(parent) = msg.parent_token() else {
            tracing::debug!("Ignoring unparented {} message", msg.msg_type());
            return;
        };

        if self
            .active
            .as_ref()
            .is_some_and(|a| a.request.token == parent)
        {
            self.on_active_event(msg.event());
            return;
        }

        match self.retired.get(&parent) {
            Some(_) if msg.msg_type() == "execute_reply" => {
                tracing::debug!("Late execute_reply for {}", parent);
            }
            Some(Retirement::Forced) => {
                tracing::debug!("Draining {} for retired request {}", msg.msg_type(), parent);
            }
            Some(Retirement::Fenced) => {
                self.shared.anomalies.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Unexpected {} after idle for request {}",
                    msg.msg_type(),
                    parent
                );
            }
            None => {
                tracing::debug!("Ignoring {} for unknown request {}", msg.msg_type(), parent);
            }
        }
    }

    fn on_active_event(&mut self, event: Result<KernelEvent, TransportError>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let step = match event {
            Ok(event) => active.collector.on_event(event),
            Err(e) => Step::Fence(TerminalState::failed(ExecutionFailure::protocol(
                e.to_string(),
            ))),
        };
        match step {
            Step::Open(Some(state)) => {
                active.request.state.send_replace(state);
            }
            Step::Open(None) => {}
            Step::Fence(terminal) => {
                let retirement = match terminal.failure() {
                    Some(ExecutionFailure::Protocol { .. }) => Retirement::Forced,
                    _ => Retirement::Fenced,
                };
                self.finish_active(terminal, retirement);
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if let Some(drain) = active.drain_deadline {
            if now >= drain {
                tracing::warn!(
                    "No idle for {} within drain grace; forcing fence",
                    active.request.token
                );
                let terminal = active.collector.terminal();
                self.finish_active(terminal, Retirement::Forced);
            }
            return;
        }
        if now >= active.deadline {
            let timeout = active.request.timeout;
            tracing::warn!("Request {} timed out after {:?}", active.request.token, timeout);
            self.stop_active(StopReason::Timeout(timeout));
        }
    }

    /// Stop collecting the running request and interrupt the kernel.
    fn stop_active(&mut self, reason: StopReason) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.collector.request_stop(reason) {
            return;
        }
        active.drain_deadline = Some(Instant::now() + self.config.drain_grace);
        let token = active.request.token.clone();

        let control = Arc::clone(&self.control);
        tokio::spawn(async move {
            if let Err(e) = control.interrupt().await {
                tracing::warn!("Failed to interrupt kernel for {}: {}", token, e);
            }
        });
    }

    fn finish_active(&mut self, terminal: TerminalState, retirement: Retirement) {
        let Some(Active {
            request,
            collector,
            dispatched_at,
            ..
        }) = self.active.take()
        else {
            return;
        };

        let partial = collector.is_stopping() || retirement == Retirement::Forced;
        request.outputs.push_finished();
        let result = ExecutionResult {
            token: request.token.clone(),
            outputs: request.outputs.outputs(),
            execution_count: collector.execution_count(),
            terminal: terminal.clone(),
            partial,
            discarded: collector.discarded(),
            submitted_at: request.submitted_at.into_std(),
            dispatched_at: Some(dispatched_at.into_std()),
            finished_at: Instant::now().into_std(),
        };

        tracing::info!(
            "Request {} finished as {:?} after {:?}",
            request.token,
            terminal.request_state(),
            result.elapsed()
        );
        self.retired.insert(request.token.clone(), retirement);
        request.state.send_replace(terminal.request_state());
        let _ = request.result.send(result);
    }

    fn dispatch_next(&mut self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        while self.active.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            let msg = KernelMessage::execute_request(
                &request.token,
                &self.config.session_id,
                &request.code,
            );
            if self.outbound.send(msg).is_err() {
                request.finish_unsent(TerminalState::failed(ExecutionFailure::unreachable(
                    "kernel channel closed",
                )));
                continue;
            }

            tracing::debug!("Dispatched request {}", request.token);
            request.state.send_replace(RequestState::Dispatched);
            let now = Instant::now();
            self.active = Some(Active {
                collector: Collector::new(request.token.clone(), Arc::clone(&request.outputs)),
                deadline: now + request.timeout,
                dispatched_at: now,
                drain_deadline: None,
                request,
            });
        }
    }
}
