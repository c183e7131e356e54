//! Per-request collection state machine.
//!
//! A collector owns the buffered outputs of the one dispatched request and
//! decides, message by message, whether the request is still open. The
//! `idle` status is the only fence that closes it; sequencing anomalies
//! close it early as protocol failures.

use std::{sync::Arc, time::Duration};

use notebook_bridge_core::{
    CorrelationToken, ExecutionState, KernelEvent, Output, OutputStore, output::strip_ansi,
};

use crate::request::{ExecutionFailure, RequestState, TerminalState};

/// Why collection was asked to stop before the fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Cancel,
    Timeout(Duration),
}

/// Outcome of feeding one event to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Still open; carries the new state if it changed.
    Open(Option<RequestState>),
    /// The request is closed with this terminal state.
    Fence(TerminalState),
}

pub(crate) struct Collector {
    token: CorrelationToken,
    busy: bool,
    outputs: Arc<OutputStore>,
    execution_count: Option<u32>,
    error: Option<ExecutionFailure>,
    stop: Option<StopReason>,
    clear_on_next: bool,
    discarded: usize,
}

impl Collector {
    pub(crate) const fn new(token: CorrelationToken, outputs: Arc<OutputStore>) -> Self {
        Self {
            token,
            busy: false,
            outputs,
            execution_count: None,
            error: None,
            stop: None,
            clear_on_next: false,
            discarded: 0,
        }
    }

    pub(crate) const fn execution_count(&self) -> Option<u32> {
        self.execution_count
    }

    pub(crate) const fn discarded(&self) -> usize {
        self.discarded
    }

    pub(crate) const fn is_stopping(&self) -> bool {
        self.stop.is_some()
    }

    /// Ask collection to stop. Returns `true` the first time, when the
    /// caller should interrupt the kernel.
    pub(crate) const fn request_stop(&mut self, reason: StopReason) -> bool {
        if self.stop.is_some() {
            return false;
        }
        self.stop = Some(reason);
        true
    }

    /// Feed one classified message that belongs to this request.
    pub(crate) fn on_event(&mut self, event: KernelEvent) -> Step {
        match event {
            KernelEvent::Status(ExecutionState::Busy) => {
                if self.busy {
                    return Step::Fence(TerminalState::failed(ExecutionFailure::protocol(
                        format!("duplicate busy status for {}", self.token),
                    )));
                }
                self.busy = true;
                Step::Open(Some(RequestState::Collecting))
            }
            KernelEvent::Status(ExecutionState::Idle) => {
                if !self.busy {
                    return Step::Fence(TerminalState::failed(ExecutionFailure::protocol(
                        format!("idle status without busy for {}", self.token),
                    )));
                }
                Step::Fence(self.terminal())
            }
            KernelEvent::Status(_) | KernelEvent::Other(_) => Step::Open(None),
            KernelEvent::ExecuteInput { execution_count }
            | KernelEvent::ExecuteReply {
                execution_count, ..
            } => {
                if self.execution_count.is_none() {
                    self.execution_count = execution_count;
                }
                Step::Open(None)
            }
            KernelEvent::ClearOutput { wait } => {
                if self.stop.is_some() {
                    self.discarded += 1;
                } else if wait {
                    self.clear_on_next = true;
                } else {
                    self.outputs.push_cleared();
                }
                Step::Open(None)
            }
            KernelEvent::Output(output) => {
                if self.stop.is_some() {
                    self.discarded += 1;
                    return Step::Open(None);
                }
                self.record(output);
                Step::Open(None)
            }
        }
    }

    fn record(&mut self, output: Output) {
        if std::mem::take(&mut self.clear_on_next) {
            self.outputs.push_cleared();
        }
        match &output {
            Output::Error {
                ename,
                evalue,
                traceback,
            } if self.error.is_none() => {
                self.error = Some(ExecutionFailure::ExecutionError {
                    kind: ename.clone(),
                    message: strip_ansi(evalue),
                    trace: traceback.iter().map(|line| strip_ansi(line)).collect(),
                });
            }
            Output::ExecuteResult {
                execution_count: Some(count),
                ..
            } if self.execution_count.is_none() => {
                self.execution_count = Some(*count);
            }
            _ => {}
        }
        self.outputs.push_output(output);
    }

    /// Terminal state if the fence were observed now.
    pub(crate) fn terminal(&self) -> TerminalState {
        match self.stop {
            Some(StopReason::Cancel) => TerminalState::Cancelled,
            Some(StopReason::Timeout(after)) => {
                TerminalState::failed(ExecutionFailure::Timeout {
                    after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                })
            }
            None => self
                .error
                .clone()
                .map_or(TerminalState::Finalized, TerminalState::failed),
        }
    }
}
