//! Broadcast + history store for the outputs of one execution.

use std::sync::RwLock;

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::output::{Output, StreamName};

/// Replay history limit per execution (16 MB). Only late subscribers
/// are affected; [`OutputStore::outputs`] keeps every output.
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

/// Something that happened to an execution's output list.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// A new output was appended.
    Output(Output),
    /// The kernel asked for the outputs so far to be cleared.
    Cleared,
    /// The execution reached a terminal state; nothing follows.
    Finished,
}

impl OutputEvent {
    fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        match self {
            Self::Output(Output::Stream { text, .. }) => text.len() + OVERHEAD,
            Self::Output(Output::Error {
                ename,
                evalue,
                traceback,
            }) => {
                ename.len()
                    + evalue.len()
                    + traceback.iter().map(String::len).sum::<usize>()
                    + OVERHEAD
            }
            Self::Output(Output::ExecuteResult { data, .. } | Output::DisplayData { data, .. }) => {
                data.iter()
                    .map(|(k, v)| k.len() + v.to_string().len())
                    .sum::<usize>()
                    + OVERHEAD
            }
            Self::Cleared | Self::Finished => OVERHEAD,
        }
    }
}

#[derive(Clone)]
struct StoredEvent {
    event: OutputEvent,
    bytes: usize,
}

struct Inner {
    history: Vec<StoredEvent>,
    total_bytes: usize,
    /// Visible outputs, independent of history eviction.
    visible: Vec<Output>,
    evicted: usize,
    finished: bool,
}

/// Output store with broadcast and history support.
///
/// Late subscribers receive the history first and then switch to live
/// events, so a caller can attach to an execution at any point.
pub struct OutputStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<OutputEvent>,
}

impl Default for OutputStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStore {
    /// Create a new output store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: Vec::with_capacity(8),
                total_bytes: 0,
                visible: Vec::new(),
                evicted: 0,
                finished: false,
            }),
            sender,
        }
    }

    /// Record an event for history and live listeners.
    ///
    /// Events after `Finished` are dropped.
    pub fn push(&self, event: OutputEvent) {
        let bytes = event.approx_bytes();
        let mut inner = self.inner.write().unwrap();
        if inner.finished {
            return;
        }
        match &event {
            OutputEvent::Output(output) => inner.visible.push(output.clone()),
            OutputEvent::Cleared => inner.visible.clear(),
            OutputEvent::Finished => inner.finished = true,
        }
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES && !inner.history.is_empty() {
            let front = inner.history.remove(0);
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            inner.evicted += 1;
        }
        inner.history.push(StoredEvent {
            event: event.clone(),
            bytes,
        });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        // Sent under the lock so history and live order agree.
        let _ = self.sender.send(event);
    }

    /// Append an output.
    pub fn push_output(&self, output: Output) {
        self.push(OutputEvent::Output(output));
    }

    /// Record a `clear_output` request.
    pub fn push_cleared(&self) {
        self.push(OutputEvent::Cleared);
    }

    /// Mark the execution finished.
    pub fn push_finished(&self) {
        self.push(OutputEvent::Finished);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<OutputEvent> {
        self.sender.subscribe()
    }

    /// Events dropped from the front of the replay history.
    #[must_use]
    pub fn evicted(&self) -> usize {
        self.inner.read().unwrap().evicted
    }

    /// Get a snapshot of the event history.
    #[must_use]
    pub fn get_history(&self) -> Vec<OutputEvent> {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Outputs currently visible, honouring `Cleared` events.
    #[must_use]
    pub fn outputs(&self) -> Vec<Output> {
        self.inner.read().unwrap().visible.clone()
    }

    /// Stream that yields history first, then live events, ending after
    /// `Finished`.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, OutputEvent> {
        // Subscribe and copy history under one read lock so nothing is
        // missed or duplicated between the two.
        let (history, rx) = {
            let inner = self.inner.read().unwrap();
            let history: Vec<OutputEvent> =
                inner.history.iter().map(|s| s.event.clone()).collect();
            (history, self.sender.subscribe())
        };
        let already_finished = history.iter().any(|e| matches!(e, OutputEvent::Finished));

        let hist = futures::stream::iter(history);
        if already_finished {
            return hist.boxed();
        }
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        let mut done = false;
        hist.chain(live)
            .take_while(move |event| {
                let keep = !done;
                done = matches!(event, OutputEvent::Finished);
                future::ready(keep)
            })
            .boxed()
    }

    /// Text chunks written to one stream channel, until `Finished`.
    #[must_use]
    pub fn stream_chunks(&self, channel: StreamName) -> futures::stream::BoxStream<'static, String> {
        self.history_plus_stream()
            .filter_map(move |event| {
                future::ready(match event {
                    OutputEvent::Output(Output::Stream { name, text }) if name == channel => {
                        Some(text)
                    }
                    _ => None,
                })
            })
            .boxed()
    }
}
