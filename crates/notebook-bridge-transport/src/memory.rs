//! In-process notebook server.
//!
//! Speaks the same traits as the Jupyter transport, backed by maps and a
//! tiny line interpreter standing in for a kernel. It honours the kernel
//! message discipline (busy, content, idle, then the shell reply), reacts
//! to interrupts and restarts, and exposes hooks for injecting faults and
//! for editing notebooks behind the bridge's back.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use notebook_bridge_core::{
    Channel, Credential, Document, KernelChannels, KernelId, KernelInfo, KernelMessage,
    NotebookFile, NotebookServer, Output, ServerAddress, ServerConnector, ServerStatus,
    StreamName, TransportError,
};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

type Inbound = mpsc::UnboundedSender<Result<KernelMessage, TransportError>>;

/// Address the in-memory server answers on.
pub const MEMORY_ADDRESS: &str = "http://memory.local";

/// Hands out connections to one shared [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: Arc<MemoryServer>,
}

impl MemoryConnector {
    #[must_use]
    pub const fn new(server: Arc<MemoryServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ServerConnector for MemoryConnector {
    async fn connect(
        &self,
        address: &ServerAddress,
        credential: &Credential,
    ) -> Result<Arc<dyn NotebookServer>, TransportError> {
        if address != &self.server.address {
            return Err(TransportError::Unreachable(format!(
                "no server listening at {address}"
            )));
        }
        self.server.check()?;
        if credential.expose() != self.server.token {
            return Err(TransportError::Auth("invalid token".to_string()));
        }
        Ok(Arc::clone(&self.server) as Arc<dyn NotebookServer>)
    }
}

struct ChannelLink {
    inject: Inbound,
    closed: watch::Sender<bool>,
}

struct SimKernel {
    info: KernelInfo,
    interpreter: Mutex<Interpreter>,
    interrupts: watch::Sender<u64>,
    restarts: watch::Sender<u64>,
    interrupt_count: AtomicUsize,
    links: Mutex<Vec<ChannelLink>>,
}

impl SimKernel {
    fn new(name: &str) -> Self {
        Self {
            info: KernelInfo {
                id: KernelId::new(Uuid::new_v4().to_string()),
                name: name.to_string(),
                execution_state: Some("idle".to_string()),
            },
            interpreter: Mutex::new(Interpreter::default()),
            interrupts: watch::channel(0).0,
            restarts: watch::channel(0).0,
            interrupt_count: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    fn close_links(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            let _ = link.closed.send(true);
        }
    }

    /// Run one execute request to completion, emitting its messages.
    async fn execute(&self, request: &KernelMessage, out: &Inbound) {
        let mut interrupted = self.interrupts.subscribe();
        interrupted.mark_unchanged();
        let mut restarted = self.restarts.subscribe();
        restarted.mark_unchanged();

        let emit = |msg_type: &str, channel: Channel, content: Value| {
            let _ = out.send(Ok(KernelMessage::reply_to(request, msg_type, channel, content)));
        };

        let code = request.content["code"].as_str().unwrap_or_default().to_string();
        emit("status", Channel::Iopub, json!({"execution_state": "busy"}));
        let count = self.interpreter.lock().unwrap().next_count();
        emit(
            "execute_input",
            Channel::Iopub,
            json!({"code": code, "execution_count": count}),
        );

        let lines: Vec<&str> = code.lines().collect();
        let last = lines.iter().rposition(|l| !l.trim().is_empty());
        let mut error = None;

        for (i, line) in lines.iter().enumerate() {
            let action = self
                .interpreter
                .lock()
                .unwrap()
                .step(line, Some(i) == last, count);
            match action {
                Action::Nothing => {}
                Action::Emit(output) => {
                    let (msg_type, content) = output_message(&output);
                    emit(&msg_type, Channel::Iopub, content);
                }
                Action::Sleep(duration) => {
                    tokio::select! {
                        () = tokio::time::sleep(duration) => {}
                        _ = interrupted.changed() => {
                            error = Some(("KeyboardInterrupt".to_string(), String::new()));
                            break;
                        }
                        _ = restarted.changed() => {
                            tracing::debug!("Kernel {} restarted mid-execution", self.info.id.short());
                            return;
                        }
                    }
                }
                Action::Raise { ename, evalue } => {
                    error = Some((ename, evalue));
                    break;
                }
            }
        }

        let status = if let Some((ename, evalue)) = &error {
            let traceback = vec![
                "Traceback (most recent call last):".to_string(),
                format!("\x1b[0;31m{ename}\x1b[0m: {evalue}"),
            ];
            emit(
                "error",
                Channel::Iopub,
                json!({"ename": ename, "evalue": evalue, "traceback": traceback}),
            );
            "error"
        } else {
            "ok"
        };
        emit("status", Channel::Iopub, json!({"execution_state": "idle"}));
        emit(
            "execute_reply",
            Channel::Shell,
            json!({"status": status, "execution_count": count}),
        );
    }
}

/// Split an output into its kernel message type and content.
fn output_message(output: &Output) -> (String, Value) {
    let mut content = match serde_json::to_value(output) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let msg_type = match content.remove("output_type") {
        Some(Value::String(t)) => t,
        _ => "stream".to_string(),
    };
    (msg_type, Value::Object(content))
}

async fn run_kernel(
    kernel: Arc<SimKernel>,
    mut requests: mpsc::UnboundedReceiver<KernelMessage>,
    out: Inbound,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            msg = requests.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = closed.changed() => break,
        };
        match request.msg_type() {
            "execute_request" => {
                tokio::select! {
                    () = kernel.execute(&request, &out) => {}
                    _ = closed.changed() => break,
                }
            }
            "kernel_info_request" => {
                let _ = out.send(Ok(KernelMessage::reply_to(
                    &request,
                    "kernel_info_reply",
                    Channel::Shell,
                    json!({"status": "ok", "protocol_version": "5.3", "implementation": "memory"}),
                )));
            }
            other => tracing::debug!("Simulated kernel ignoring {}", other),
        }
    }
    tracing::debug!("Simulated kernel {} channel closed", kernel.info.id.short());
}

#[derive(Default)]
struct State {
    kernels: HashMap<KernelId, Arc<SimKernel>>,
    sessions: HashMap<String, KernelId>,
    notebooks: HashMap<String, NotebookFile>,
}

/// Shared in-memory server state.
pub struct MemoryServer {
    address: ServerAddress,
    token: String,
    state: Mutex<State>,
    unreachable: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryServer {
    /// A server at [`MEMORY_ADDRESS`] accepting `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: ServerAddress::new(MEMORY_ADDRESS),
            token: token.into(),
            state: Mutex::new(State::default()),
            unreachable: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
        })
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("server is down".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Unreachable("injected failure".to_string()));
        }
        Ok(())
    }

    fn kernel(&self, id: &KernelId) -> Result<Arc<SimKernel>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .kernels
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(format!("kernel {id}")))
    }

    /// Make every call fail as unreachable until cleared.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` calls as unreachable.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Stored notebook at `path`.
    #[must_use]
    pub fn notebook(&self, path: &str) -> Option<NotebookFile> {
        self.state.lock().unwrap().notebooks.get(path).cloned()
    }

    /// Store a notebook directly, bypassing any session.
    pub fn put_notebook(&self, path: &str, notebook: NotebookFile) {
        self.state
            .lock()
            .unwrap()
            .notebooks
            .insert(path.to_string(), notebook);
    }

    /// Edit a stored notebook out of band, as a human collaborator would.
    ///
    /// # Errors
    /// `NotFound` if there is no notebook at `path`.
    pub fn edit_notebook<T>(
        &self,
        path: &str,
        edit: impl FnOnce(&mut Document) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock().unwrap();
        let file = state
            .notebooks
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        let mut document = Document::load(file);
        let value = edit(&mut document);
        state
            .notebooks
            .insert(path.to_string(), document.serialize());
        Ok(value)
    }

    /// Ids of all running kernels.
    #[must_use]
    pub fn kernel_ids(&self) -> Vec<KernelId> {
        self.state.lock().unwrap().kernels.keys().cloned().collect()
    }

    /// Number of interrupts delivered to a kernel.
    #[must_use]
    pub fn interrupt_count(&self, id: &KernelId) -> usize {
        self.kernel(id)
            .map_or(0, |k| k.interrupt_count.load(Ordering::SeqCst))
    }

    /// Push a raw message onto every open channel of a kernel.
    ///
    /// # Errors
    /// `NotFound` if the kernel does not exist.
    pub fn inject(&self, id: &KernelId, msg: &KernelMessage) -> Result<(), TransportError> {
        let kernel = self.kernel(id)?;
        for link in kernel.links.lock().unwrap().iter() {
            let _ = link.inject.send(Ok(msg.clone()));
        }
        Ok(())
    }

    /// Sever every open channel of a kernel; the kernel keeps running.
    ///
    /// # Errors
    /// `NotFound` if the kernel does not exist.
    pub fn drop_channels(&self, id: &KernelId) -> Result<(), TransportError> {
        self.kernel(id)?.close_links();
        Ok(())
    }
}

#[async_trait]
impl NotebookServer for MemoryServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn status(&self) -> Result<ServerStatus, TransportError> {
        self.check()?;
        let kernels = self.state.lock().unwrap().kernels.len();
        Ok(ServerStatus {
            started: None,
            last_activity: None,
            connections: None,
            kernels: u32::try_from(kernels).ok(),
        })
    }

    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelInfo, TransportError> {
        self.check()?;
        let kernel = Arc::new(SimKernel::new(kernel_name));
        let info = kernel.info.clone();
        self.state
            .lock()
            .unwrap()
            .kernels
            .insert(info.id.clone(), kernel);
        tracing::debug!("Simulated {} kernel {} started", kernel_name, info.id.short());
        Ok(info)
    }

    async fn get_kernel(&self, id: &KernelId) -> Result<Option<KernelInfo>, TransportError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .kernels
            .get(id)
            .map(|k| k.info.clone()))
    }

    async fn interrupt_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        self.check()?;
        let kernel = self.kernel(id)?;
        kernel.interrupt_count.fetch_add(1, Ordering::SeqCst);
        kernel.interrupts.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn restart_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        self.check()?;
        let kernel = self.kernel(id)?;
        *kernel.interpreter.lock().unwrap() = Interpreter::default();
        kernel.restarts.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn shutdown_kernel(&self, id: &KernelId) -> Result<(), TransportError> {
        self.check()?;
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.sessions.retain(|_, k| k != id);
            state.kernels.remove(id)
        };
        let kernel = removed.ok_or_else(|| TransportError::NotFound(format!("kernel {id}")))?;
        kernel.close_links();
        Ok(())
    }

    async fn find_session(&self, notebook_path: &str) -> Result<Option<KernelInfo>, TransportError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .get(notebook_path)
            .and_then(|id| state.kernels.get(id))
            .map(|k| k.info.clone()))
    }

    async fn create_session(
        &self,
        notebook_path: &str,
        kernel_name: &str,
    ) -> Result<KernelInfo, TransportError> {
        let info = self.start_kernel(kernel_name).await?;
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(notebook_path.to_string(), info.id.clone());
        Ok(info)
    }

    async fn get_notebook(&self, path: &str) -> Result<Option<NotebookFile>, TransportError> {
        self.check()?;
        Ok(self.notebook(path))
    }

    async fn save_notebook(&self, path: &str, notebook: &NotebookFile) -> Result<(), TransportError> {
        self.check()?;
        self.put_notebook(path, notebook.clone());
        Ok(())
    }

    async fn open_channels(&self, id: &KernelId) -> Result<KernelChannels, TransportError> {
        self.check()?;
        let kernel = self.kernel(id)?;
        let (sender, requests) = mpsc::unbounded_channel();
        let (out, receiver) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);

        kernel.links.lock().unwrap().push(ChannelLink {
            inject: out.clone(),
            closed,
        });
        tokio::spawn(run_kernel(kernel, requests, out, closed_rx));

        Ok(KernelChannels { sender, receiver })
    }
}

enum Action {
    Nothing,
    Emit(Output),
    Sleep(Duration),
    Raise { ename: String, evalue: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn display(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("'{s}'"),
            other => other.display(),
        }
    }
}

type Raised = (String, String);

/// Line-at-a-time stand-in for a language kernel.
///
/// Understands literals, variables, `+`, assignment, `print`, `display`,
/// `sleep`/`time.sleep` and `raise`; a bare expression on the last line
/// becomes the execution result.
#[derive(Default)]
struct Interpreter {
    count: u32,
    vars: HashMap<String, Scalar>,
}

fn call_arg<'a>(line: &'a str, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        line.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
            .map(str::trim)
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(s: &str) -> Option<&str> {
    ['\'', '"'].iter().find_map(|q| {
        s.strip_prefix(*q)
            .and_then(|rest| rest.strip_suffix(*q))
    })
}

impl Interpreter {
    fn next_count(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    fn step(&mut self, line: &str, is_last: bool, count: u32) -> Action {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("import ") {
            return Action::Nothing;
        }

        if let Some(rest) = line.strip_prefix("raise ") {
            let (ename, evalue) = match rest.split_once('(') {
                Some((name, arg)) => {
                    let arg = arg.trim_end_matches(')').trim();
                    (name.trim(), unquote(arg).unwrap_or(arg))
                }
                None => (rest.trim(), ""),
            };
            return Action::Raise {
                ename: ename.to_string(),
                evalue: evalue.to_string(),
            };
        }

        if let Some(arg) = call_arg(line, &["sleep", "time.sleep"]) {
            return match arg.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => Action::Sleep(Duration::from_secs_f64(secs)),
                _ => raise("ValueError", format!("invalid sleep length: {arg}")),
            };
        }

        if let Some(arg) = call_arg(line, &["print"]) {
            let (arg, name) = match arg.strip_suffix("file=sys.stderr") {
                Some(rest) => (rest.trim().trim_end_matches(',').trim(), StreamName::Stderr),
                None => (arg, StreamName::Stdout),
            };
            return match self.eval(arg) {
                Ok(value) => Action::Emit(Output::stream(name, format!("{}\n", value.display()))),
                Err((ename, evalue)) => Action::Raise { ename, evalue },
            };
        }

        if let Some(arg) = call_arg(line, &["display"]) {
            return match self.eval(arg) {
                Ok(value) => Action::Emit(Output::DisplayData {
                    data: [("text/plain".to_string(), Value::String(value.repr()))].into(),
                    metadata: Map::new(),
                }),
                Err((ename, evalue)) => Action::Raise { ename, evalue },
            };
        }

        if let Some((target, expr)) = line.split_once('=') {
            let target = target.trim();
            if is_identifier(target) && !expr.starts_with('=') {
                return match self.eval(expr) {
                    Ok(value) => {
                        self.vars.insert(target.to_string(), value);
                        Action::Nothing
                    }
                    Err((ename, evalue)) => Action::Raise { ename, evalue },
                };
            }
        }

        match self.eval(line) {
            Ok(value) if is_last => Action::Emit(Output::ExecuteResult {
                data: [("text/plain".to_string(), Value::String(value.repr()))].into(),
                metadata: Map::new(),
                execution_count: Some(count),
            }),
            Ok(_) => Action::Nothing,
            Err((ename, evalue)) => Action::Raise { ename, evalue },
        }
    }

    fn eval(&self, expr: &str) -> Result<Scalar, Raised> {
        let expr = expr.trim();
        if let Some((lhs, rhs)) = expr.rsplit_once(" + ") {
            return match (self.eval(lhs)?, self.eval(rhs)?) {
                (Scalar::Int(a), Scalar::Int(b)) => Ok(Scalar::Int(a.wrapping_add(b))),
                (Scalar::Str(a), Scalar::Str(b)) => Ok(Scalar::Str(a + &b)),
                (a, b) => {
                    let (a, b) = (as_float(&a)?, as_float(&b)?);
                    Ok(Scalar::Float(a + b))
                }
            };
        }
        if let Some(text) = unquote(expr) {
            return Ok(Scalar::Str(text.to_string()));
        }
        if let Ok(i) = expr.parse::<i64>() {
            return Ok(Scalar::Int(i));
        }
        if let Ok(f) = expr.parse::<f64>() {
            return Ok(Scalar::Float(f));
        }
        if is_identifier(expr) {
            return self.vars.get(expr).cloned().ok_or_else(|| {
                (
                    "NameError".to_string(),
                    format!("name '{expr}' is not defined"),
                )
            });
        }
        Err(("SyntaxError".to_string(), "invalid syntax".to_string()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_float(value: &Scalar) -> Result<f64, Raised> {
    match value {
        Scalar::Int(i) => Ok(*i as f64),
        Scalar::Float(f) => Ok(*f),
        Scalar::Str(_) => Err((
            "TypeError".to_string(),
            "unsupported operand type(s) for +".to_string(),
        )),
    }
}

fn raise(ename: &str, evalue: String) -> Action {
    Action::Raise {
        ename: ename.to_string(),
        evalue,
    }
}
