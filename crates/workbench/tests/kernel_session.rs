//! Session client tests against a local websocket server playing the kernel.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{ok_run, refused_url, spawn_kernel, status, stream, wait_for_state, Step};
use kernel_wire::{Channel, Content, Envelope, StreamName};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;
use workbench::kernel::{KernelSession, SessionError, SessionState};
use workbench::OutputRecord;

fn stdout(text: &str) -> OutputRecord {
    OutputRecord::Stream {
        source_stream: StreamName::Stdout,
        text: text.into(),
    }
}

#[tokio::test]
async fn test_connect_reports_transitions_and_sends_token() {
    let kernel = spawn_kernel(|_| vec![]).await;
    let mut session = KernelSession::new(kernel.url.clone()).with_token("secret");
    let mut states = session.subscribe_state();

    session.connect().await.unwrap();

    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(states.recv().await.unwrap(), SessionState::Connecting);
    assert_eq!(states.recv().await.unwrap(), SessionState::Open);
    assert_eq!(
        kernel.authorization.lock().unwrap().as_deref(),
        Some("token secret")
    );
}

#[tokio::test]
async fn test_execute_request_wire_shape() {
    let kernel = spawn_kernel(|_| vec![Step::Close]).await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();

    let request_id = session.send_execution("print(1)").unwrap();
    let received = kernel.handle.await.unwrap();

    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.id(), request_id);
    assert_eq!(request.msg_type(), "execute_request");
    assert_eq!(request.channel, Channel::Shell);
    assert_eq!(request.header.session, session.session_id());
    assert!(request.parent_id.is_none());
    let Content::ExecuteRequest(content) = &request.content else {
        panic!("expected execute_request content");
    };
    assert_eq!(content.code, "print(1)");
    assert!(!content.silent);
    assert!(content.store_history);
    assert!(!content.allow_stdin);
}

#[tokio::test]
async fn test_request_ids_unique_and_session_stable() {
    let kernel = spawn_kernel(|_| vec![]).await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();

    let a = session.send_execution("1").unwrap();
    let b = session.send_execution("2").unwrap();
    session.disconnect();
    let received = kernel.handle.await.unwrap();

    assert_ne!(a, b);
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].header.session, received[1].header.session);
}

#[tokio::test]
async fn test_routed_output_and_callback_both_fire() {
    let kernel =
        spawn_kernel(|req| ok_run(req, vec![stream(req, StreamName::Stdout, "1\n")], 1)).await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let captured = outputs.clone();
    let request_id = session
        .execute(
            "print(1)",
            Box::new(move |record| captured.lock().unwrap().push(record)),
            Box::new(move |env: &Envelope| {
                let _ = tx.send(env.msg_type().to_string());
            }),
        )
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let msg_type = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(msg_type);
    }

    assert_eq!(seen, vec!["status", "stream", "execute_reply", "status"]);
    assert_eq!(*outputs.lock().unwrap(), vec![stdout("1\n")]);

    session.unregister(&request_id);
    assert!(session.has_no_routes());
}

#[tokio::test]
async fn test_unrouted_output_reaches_fallback_subscriber() {
    let kernel = spawn_kernel(|req| vec![stream(req, StreamName::Stdout, "hello\n")]).await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_output(Box::new(move |record| {
        let _ = tx.send(record);
    }));
    session.send_execution("print('hello')").unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record, stdout("hello\n"));
}

#[tokio::test]
async fn test_malformed_frames_do_not_stop_dispatch() {
    let kernel = spawn_kernel(|req| {
        vec![
            Step::Raw("this is not json".into()),
            Step::Raw(r#"{"header": {"msg_type": "stream"}, "content": {}}"#.into()),
            Step::Raw(r#"{"header": {"msg_id": "x", "msg_type": "stream"}, "channel": "bogus", "content": {}}"#.into()),
            stream(req, StreamName::Stderr, "still here\n"),
            status(req, "idle"),
        ]
    })
    .await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_output(Box::new(move |record| {
        let _ = tx.send(record);
    }));
    session.send_execution("x").unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        record,
        OutputRecord::Stream {
            source_stream: StreamName::Stderr,
            text: "still here\n".into()
        }
    );
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_server_close_clears_routes() {
    let kernel = spawn_kernel(|_| vec![Step::Close]).await;
    let mut session = KernelSession::new(kernel.url.clone());
    let mut states = session.subscribe_state();
    session.connect().await.unwrap();

    session.on_output(Box::new(|_| {}));
    session.send_execution("exit()").unwrap();

    wait_for_state(&mut states, SessionState::Closed).await;
    assert!(session.has_no_routes());
    assert_eq!(session.send_execution("1"), Err(SessionError::NotConnected));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let kernel = spawn_kernel(|_| vec![]).await;
    let mut session = KernelSession::new(kernel.url.clone());
    session.connect().await.unwrap();
    session.on_output(Box::new(|_| {}));
    session.register_callback("pending", Box::new(|_: &Envelope| {}));

    session.disconnect();
    let first = (session.state(), session.has_no_routes());
    session.disconnect();
    let second = (session.state(), session.has_no_routes());

    assert_eq!(first, (SessionState::Closed, true));
    assert_eq!(first, second);
    assert_eq!(session.send_execution("1"), Err(SessionError::NotConnected));
}

#[tokio::test]
async fn test_refused_connection_is_connection_error() {
    let mut session = KernelSession::new(refused_url().await);

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, SessionError::ConnectionError(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.send_execution("1"), Err(SessionError::NotConnected));
}

#[tokio::test]
async fn test_connect_times_out_on_silent_server() {
    // Accepts TCP but never answers the websocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/channels")).unwrap();
    let mut session =
        KernelSession::new(url).with_connect_timeout(Duration::from_millis(200));

    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, SessionError::ConnectionError(ref m) if m.contains("timed out")));
    assert_eq!(session.state(), SessionState::Closed);
    drop(listener);
}
