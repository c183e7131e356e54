//! End-to-end session scenarios against the in-memory server and kernel.

use std::{sync::Arc, time::Duration};

use notebook_bridge_core::{
    CellChange, CellKind, CellRef, Credential, Document, Output, ServerAddress, StreamName,
    TransportError,
};
use notebook_bridge_kernel::{ExecuteOptions, ExecutionFailure, RequestState, TerminalState};
use notebook_bridge_session::{
    Applied, ExecutionSupervisor, FileSessionStore, MemorySessionStore, RetryPolicy,
    SessionError, SessionManager, SupervisorError,
};
use notebook_bridge_transport::{MEMORY_ADDRESS, MemoryConnector, MemoryServer};
use tokio_test::assert_ok;

const TOKEN: &str = "t0ken";
const NOTEBOOK: &str = "work/analysis.ipynb";

fn manager(server: &Arc<MemoryServer>) -> SessionManager<MemoryConnector, MemorySessionStore> {
    SessionManager::new(
        MemoryConnector::new(Arc::clone(server)),
        MemorySessionStore::new(),
    )
}

fn address() -> ServerAddress {
    ServerAddress::new(MEMORY_ADDRESS)
}

#[tokio::test]
async fn test_execute_raise_delete_scenario() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);

    let first = assert_ok!(session.insert_cell(0, CellKind::Code, "x = 1").await).into_value();
    let result = assert_ok!(
        session
            .execute_cell(&first, None, ExecuteOptions::default())
            .await
    );
    assert_eq!(result.terminal, TerminalState::Finalized);
    assert_eq!(result.execution_count, Some(1));
    assert!(result.outputs.is_empty());

    let raiser = assert_ok!(
        session
            .insert_cell(1, CellKind::Code, "raise ValueError('boom')")
            .await
    )
    .into_value();
    let result = assert_ok!(
        session
            .execute_cell(1usize, None, ExecuteOptions::default())
            .await
    );
    match result.terminal.failure() {
        Some(ExecutionFailure::ExecutionError { kind, message, trace }) => {
            assert_eq!(kind, "ValueError");
            assert_eq!(message, "boom");
            assert!(trace.iter().all(|line| !line.contains('\x1b')));
        }
        other => panic!("expected an execution error, got {other:?}"),
    }

    let removed = assert_ok!(session.delete_cell(0usize).await).into_value();
    assert_eq!(removed.id(), &first);

    let document = assert_ok!(session.document().await);
    assert_eq!(document.len(), 1);
    let remaining = document.cell_at(0).unwrap();
    assert_eq!(remaining.id(), &raiser);
    assert_eq!(remaining.execution_count(), Some(2));
    assert!(matches!(
        remaining.outputs(),
        [Output::Error { ename, evalue, .. }] if ename == "ValueError" && evalue == "boom"
    ));
}

#[tokio::test]
async fn test_cancel_running_request_leaves_queue_clean() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    let kernel = assert_ok!(manager.attach_kernel(None).await);

    let slow = assert_ok!(
        session
            .insert_cell(0, CellKind::Code, "print('started')\nsleep(5)\nprint('finished')")
            .await
    )
    .into_value();
    let quick = assert_ok!(session.insert_cell(1, CellKind::Code, "print('b')").await).into_value();

    let mut a = assert_ok!(
        session
            .submit_cell(&slow, None, ExecuteOptions::default())
            .await
    );
    let b = assert_ok!(
        session
            .submit_cell(&quick, None, ExecuteOptions::default())
            .await
    );
    assert_eq!(b.state(), RequestState::Queued);

    // Wait until A has produced its first line and is sleeping.
    let mut live = a.outputs().get_receiver();
    assert_ok!(a.wait_for(|s| *s == RequestState::Collecting).await);
    if a.outputs().outputs().is_empty() {
        assert_ok!(live.recv().await);
    }
    assert_eq!(b.state(), RequestState::Queued);

    assert_ok!(a.cancel().await);
    let a_result = assert_ok!(a.wait().await);
    assert_eq!(a_result.terminal, TerminalState::Cancelled);
    assert!(a_result.partial);
    assert_eq!(
        a_result.outputs,
        vec![Output::stream(StreamName::Stdout, "started\n")]
    );
    assert_eq!(server.interrupt_count(&kernel), 1);

    let b_result = assert_ok!(b.wait().await);
    assert_eq!(b_result.terminal, TerminalState::Finalized);
    assert_eq!(b_result.outputs, vec![Output::stream(StreamName::Stdout, "b\n")]);
    assert!(b_result.dispatched_at >= Some(a_result.finished_at));

    let document = assert_ok!(session.document().await);
    assert_eq!(document.cell(&slow).unwrap().outputs(), a_result.outputs.as_slice());
}

#[tokio::test]
async fn test_collaborator_edits_are_reported_not_discarded() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    assert!(server.notebook(NOTEBOOK).is_some());

    let mine = assert_ok!(session.insert_cell(0, CellKind::Code, "a = 1").await);
    assert!(mine.is_clean());
    let mine = mine.into_value();

    let theirs = assert_ok!(server.edit_notebook(NOTEBOOK, |doc| {
        doc.push_cell(CellKind::Markdown, "# added by a human")
    }));

    let report = assert_ok!(session.diff().await);
    assert!(report.has_baseline);
    assert_eq!(
        report.changes,
        vec![CellChange::Added {
            id: theirs.clone(),
            position: 1
        }]
    );
    assert_eq!(report.summary, "1 cell(s) added");

    let applied = assert_ok!(session.edit_cell_source(&mine, "a = 2").await);
    match &applied {
        Applied::WithConflict { value, changes } => {
            assert!(*value);
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].cell_id(), &theirs);
        }
        Applied::Clean(_) => panic!("collaborator edit went unreported"),
    }

    // Both edits survive on the server.
    let stored = Document::load(server.notebook(NOTEBOOK).unwrap());
    assert_eq!(stored.cell(&mine).unwrap().source(), "a = 2");
    assert_eq!(stored.cell(&theirs).unwrap().source(), "# added by a human");

    // The baseline moved past the reported change.
    assert!(assert_ok!(session.move_cell(&theirs, 0).await).is_clean());
    assert!(assert_ok!(session.diff().await).changes.is_empty());
}

#[tokio::test]
async fn test_code_override_is_not_reported_as_conflict() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    assert_ok!(manager.attach_kernel(None).await);
    let id = assert_ok!(session.insert_cell(0, CellKind::Code, "x = 1").await).into_value();

    let running = assert_ok!(
        session
            .submit_cell(&id, Some("x = 2".to_string()), ExecuteOptions::default())
            .await
    );
    assert!(running.conflicts().is_empty());
    assert!(assert_ok!(running.wait().await).is_finalized());

    assert!(assert_ok!(session.diff().await).changes.is_empty());
    let next = assert_ok!(session.insert_cell(1, CellKind::Code, "x").await);
    assert!(next.is_clean());
    let stored = Document::load(server.notebook(NOTEBOOK).unwrap());
    assert_eq!(stored.cell(&id).unwrap().source(), "x = 2");

    // A collaborator edit made before the override is still reported.
    let theirs = assert_ok!(server.edit_notebook(NOTEBOOK, |doc| {
        doc.push_cell(CellKind::Markdown, "# notes")
    }));
    let running = assert_ok!(
        session
            .submit_cell(&id, Some("x = 3".to_string()), ExecuteOptions::default())
            .await
    );
    assert_eq!(
        running.conflicts(),
        &[CellChange::Added {
            id: theirs,
            position: 2
        }]
    );
    assert_ok!(running.wait().await);
}

#[tokio::test]
async fn test_explicit_snapshot_resets_baseline() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    let id = assert_ok!(session.insert_cell(0, CellKind::Code, "1").await).into_value();

    let edited = assert_ok!(server.edit_notebook(NOTEBOOK, |doc| doc.edit_cell_source(&id, "2")));
    assert_eq!(edited, Ok(true));
    let report = assert_ok!(session.diff().await);
    assert!(matches!(
        report.changes.as_slice(),
        [CellChange::SourceChanged { old_source, new_source, .. }]
            if old_source == "1" && new_source == "2"
    ));

    let snapshot = assert_ok!(session.snapshot().await);
    let report = assert_ok!(session.diff().await);
    assert!(report.changes.is_empty());
    assert_eq!(
        report.baseline_fingerprint.as_deref(),
        Some(snapshot.fingerprint())
    );
}

#[tokio::test]
async fn test_structural_errors_are_immediate() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);

    assert!(matches!(
        session.insert_cell(3, CellKind::Code, "x").await,
        Err(SessionError::Document(_))
    ));
    let note = assert_ok!(session.insert_cell(0, CellKind::Markdown, "text").await).into_value();
    assert!(matches!(
        session.execute_cell(&note, None, ExecuteOptions::default()).await,
        Err(SessionError::Document(_))
    ));
    assert!(matches!(
        session
            .execute_cell(CellRef::Position(7), None, ExecuteOptions::default())
            .await,
        Err(SessionError::Document(_))
    ));
}

#[tokio::test]
async fn test_operations_require_live_session() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    assert!(matches!(manager.current().await, Err(SessionError::NotConnected)));
    assert!(matches!(
        manager.attach_kernel(None).await,
        Err(SessionError::NotConnected)
    ));

    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert!(matches!(
        session.execute_code("1", ExecuteOptions::default()).await,
        Err(SessionError::NoKernel)
    ));

    assert!(manager.disconnect().await);
    assert!(!manager.disconnect().await);
    assert!(matches!(
        session.insert_cell(0, CellKind::Code, "x").await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(session.diff().await, Err(SessionError::NotConnected)));
}

#[tokio::test]
async fn test_auth_and_unreachable_are_distinct() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);

    let rejected = manager
        .connect(address(), Credential::new("wrong"), None)
        .await;
    assert!(matches!(
        rejected,
        Err(SessionError::Transport(TransportError::Auth(_)))
    ));

    let elsewhere = manager
        .connect(
            ServerAddress::new("http://elsewhere:8888"),
            Credential::new(TOKEN),
            None,
        )
        .await;
    assert!(matches!(
        elsewhere,
        Err(SessionError::Transport(TransportError::Unreachable(_)))
    ));

    server.set_unreachable(true);
    let down = manager.connect(address(), Credential::new(TOKEN), None).await;
    assert!(matches!(
        down,
        Err(SessionError::Transport(TransportError::Unreachable(_)))
    ));
}

#[tokio::test]
async fn test_attach_is_idempotent_and_adopts_existing_sessions() {
    let server = MemoryServer::new(TOKEN);
    let first = manager(&server);
    assert_ok!(
        first
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    let id = assert_ok!(first.attach_kernel(None).await);
    assert_eq!(assert_ok!(first.attach_kernel(Some("other")).await), id);
    assert_eq!(server.kernel_ids(), vec![id.clone()]);

    let second = manager(&server);
    let session = assert_ok!(
        second
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    assert_eq!(session.kernel_id().await, Some(id.clone()));
    assert_eq!(assert_ok!(second.attach_kernel(None).await), id);
    assert_eq!(server.kernel_ids().len(), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_work() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);
    let cell = assert_ok!(session.insert_cell(0, CellKind::Code, "sleep(30)").await).into_value();

    let mut running = assert_ok!(
        session
            .submit_cell(&cell, None, ExecuteOptions::default())
            .await
    );
    assert_ok!(running.wait_for(|s| *s == RequestState::Collecting).await);
    assert!(manager.disconnect().await);

    let result = assert_ok!(running.wait().await);
    assert_eq!(result.terminal, TerminalState::Cancelled);
}

#[tokio::test]
async fn test_reconnect_saved_reattaches_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let server = MemoryServer::new(TOKEN);

    let id = {
        let manager = SessionManager::new(
            MemoryConnector::new(Arc::clone(&server)),
            FileSessionStore::new(&path),
        );
        let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
        let id = assert_ok!(manager.attach_kernel(None).await);
        assert_ok!(session.execute_code("x = 41", ExecuteOptions::default()).await);
        manager.disconnect().await;
        id
    };

    let manager = SessionManager::new(
        MemoryConnector::new(Arc::clone(&server)),
        FileSessionStore::new(&path),
    );
    let session = assert_ok!(manager.reconnect_saved().await);
    assert_eq!(session.kernel_id().await, Some(id));

    let result = assert_ok!(session.execute_code("x + 1", ExecuteOptions::default()).await);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].plain_text(), "42");

    assert_ok!(manager.forget_saved().await);
    assert!(matches!(
        manager.reconnect_saved().await,
        Err(SessionError::NoSavedSession)
    ));
}

#[tokio::test]
async fn test_restart_invalidates_running_request() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);
    assert_ok!(session.execute_code("y = 1", ExecuteOptions::default()).await);

    let cell = assert_ok!(session.insert_cell(0, CellKind::Code, "sleep(30)").await).into_value();
    let mut running = assert_ok!(
        session
            .submit_cell(&cell, None, ExecuteOptions::default())
            .await
    );
    assert_ok!(running.wait_for(|s| *s == RequestState::Collecting).await);

    assert_eq!(assert_ok!(session.restart_kernel().await), 1);
    let result = assert_ok!(running.wait().await);
    assert!(matches!(
        result.terminal.failure(),
        Some(ExecutionFailure::Protocol {
            restarted: true,
            ..
        })
    ));

    // Kernel state is gone after the restart.
    let after = assert_ok!(session.execute_code("y", ExecuteOptions::default()).await);
    assert!(matches!(
        after.terminal.failure(),
        Some(ExecutionFailure::ExecutionError { kind, .. }) if kind == "NameError"
    ));
    assert_eq!(after.execution_count, Some(1));
}

#[tokio::test]
async fn test_supervisor_does_not_rerun_work_dropped_by_restart() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);
    let supervisor = ExecutionSupervisor::new(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    });

    let restart = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.restart_kernel().await
    };
    let (result, invalidated) = tokio::join!(
        supervisor.execute_code(
            &session,
            "print('side effect')\nsleep(5)",
            ExecuteOptions::default()
        ),
        restart
    );

    assert_eq!(assert_ok!(invalidated), 1);
    let result = assert_ok!(result);
    assert!(matches!(
        result.terminal.failure(),
        Some(ExecutionFailure::Protocol {
            restarted: true,
            ..
        })
    ));
    assert_eq!(
        result.outputs,
        vec![Output::stream(StreamName::Stdout, "side effect\n")]
    );
    assert!(session.is_live());
}

#[tokio::test]
async fn test_timeout_fails_request() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(manager.connect(address(), Credential::new(TOKEN), None).await);
    assert_ok!(manager.attach_kernel(None).await);

    let result = assert_ok!(
        session
            .execute_code(
                "print('tick')\nsleep(30)",
                ExecuteOptions::with_timeout(Duration::from_millis(200)),
            )
            .await
    );
    assert_eq!(
        result.terminal,
        TerminalState::failed(ExecutionFailure::Timeout { after_ms: 200 })
    );
    assert!(result.partial);
    assert_eq!(result.outputs, vec![Output::stream(StreamName::Stdout, "tick\n")]);
}

#[tokio::test]
async fn test_supervisor_retries_transport_faults_only() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    let kernel = assert_ok!(manager.attach_kernel(None).await);
    let supervisor = ExecutionSupervisor::new(RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    });
    let cell = assert_ok!(session.insert_cell(0, CellKind::Code, "1 + 1").await).into_value();

    // The notebook refresh fails once, then succeeds.
    server.fail_next(1);
    let result = assert_ok!(
        supervisor
            .execute_cell(&session, &cell, None, ExecuteOptions::default())
            .await
    );
    assert!(result.is_finalized());

    // A severed kernel channel is reopened on the next attempt.
    assert_ok!(server.drop_channels(&kernel));
    let result = assert_ok!(
        supervisor
            .execute_code(&session, "2 + 2", ExecuteOptions::default())
            .await
    );
    assert_eq!(result.outputs[0].plain_text(), "4");

    // Code errors come back as results on the first attempt.
    let result = assert_ok!(
        supervisor
            .execute_code(&session, "raise KeyError('k')", ExecuteOptions::default())
            .await
    );
    assert!(matches!(
        result.terminal.failure(),
        Some(ExecutionFailure::ExecutionError { .. })
    ));
}

#[tokio::test]
async fn test_supervisor_surfaces_exhaustion() {
    let server = MemoryServer::new(TOKEN);
    let manager = manager(&server);
    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    assert_ok!(manager.attach_kernel(None).await);
    let cell = assert_ok!(session.insert_cell(0, CellKind::Code, "1").await).into_value();

    server.set_unreachable(true);
    let supervisor = ExecutionSupervisor::new(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    });
    let err = supervisor
        .execute_cell(&session, &cell, None, ExecuteOptions::default())
        .await
        .err();
    assert!(matches!(
        err,
        Some(SupervisorError::Exhausted { attempts: 3, .. })
    ));

    // Exhaustion is fatal to the session; only a reconnect recovers.
    server.set_unreachable(false);
    assert!(!session.is_live());
    assert!(matches!(
        manager.current().await.err(),
        Some(SessionError::NotConnected)
    ));
    let err = supervisor
        .execute_cell(&session, &cell, None, ExecuteOptions::default())
        .await
        .err();
    assert!(matches!(
        err,
        Some(SupervisorError::Session(SessionError::NotConnected))
    ));

    let session = assert_ok!(
        manager
            .connect(address(), Credential::new(TOKEN), Some(NOTEBOOK))
            .await
    );
    assert_ok!(manager.attach_kernel(None).await);
    let err = supervisor
        .execute_cell(&session, CellRef::Position(9), None, ExecuteOptions::default())
        .await
        .err();
    assert!(matches!(err, Some(SupervisorError::Session(SessionError::Document(_)))));
}
