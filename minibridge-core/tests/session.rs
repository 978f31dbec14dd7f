//! Integration tests for sessions bound to a live backend pump.
//!
//! A session is wired to `run_backend` over `cat`; frames written through
//! the session come back to every hook, and the last release tears the
//! backend down.

#![cfg(unix)]

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minibridge_core::auth::Auth;
use minibridge_core::backend::{AgentFrames, BackendExit, BackendOptions, run_backend};
use minibridge_core::identity::IdentityFingerprint;
use minibridge_core::pipeline::{Pipeline, PipelineOptions};
use minibridge_core::process::StdioServer;
use minibridge_core::session::{
    Session, SessionConn, SessionError, SessionManager, SessionOptions, new_session_id,
};

const WAIT: Duration = Duration::from_secs(10);

struct Bridge {
    session: std::sync::Arc<Session>,
    backend: tokio::task::JoinHandle<BackendExit>,
}

fn start_bridge(identity: IdentityFingerprint) -> Bridge {
    let close = CancellationToken::new();
    let stream = StdioServer::new("cat").start(close.clone()).unwrap();

    let (to_backend, inbound) = mpsc::channel(8);
    let (outbound, from_backend) = mpsc::channel(8);

    let token = close.clone();
    let backend = tokio::spawn(async move {
        let pipeline = Pipeline::new(PipelineOptions::default());
        run_backend(
            &token,
            AgentFrames { inbound, outbound },
            &stream,
            &pipeline,
            &BackendOptions::default(),
        )
        .await
    });

    let session = Session::new(
        new_session_id(),
        identity,
        SessionConn {
            outbound: to_backend,
            inbound: from_backend,
            close,
        },
        SessionOptions {
            idle_timeout: Duration::from_secs(30),
        },
    );

    Bridge { session, backend }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_round_trip_through_backend() {
    let owner = IdentityFingerprint::compute(Some(&Auth::bearer("owner-token")), &[]);
    let intruder = IdentityFingerprint::compute(Some(&Auth::bearer("other-token")), &[]);

    let bridge = start_bridge(owner);
    let sid = bridge.session.id().to_string();
    let manager = SessionManager::new();
    manager.register(bridge.session.clone());

    let (hook_tx, mut hook_rx) = mpsc::channel(8);
    let session = manager.acquire_for(&sid, owner, Some(hook_tx.clone())).unwrap();
    assert_eq!(session.count(), 2);

    let frame = Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
    session.write(frame.clone()).await.unwrap();
    let echoed = tokio::time::timeout(WAIT, hook_rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed, frame);

    let err = manager.acquire_for(&sid, intruder, None).unwrap_err();
    assert_eq!(err, SessionError::IdentityMismatch { sid: sid.clone() });

    manager.release(&sid, Some(&hook_tx));
    assert_eq!(session.count(), 1);
    manager.release(&sid, None);

    tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    let reason = tokio::time::timeout(WAIT, bridge.backend).await.unwrap().unwrap();
    assert_eq!(reason, BackendExit::Cancelled);
    assert!(manager.get(&sid).is_none());
}
