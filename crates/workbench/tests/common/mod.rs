//! A scripted stand-in for a Jupyter kernel behind a websocket.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kernel_wire::{
    decode, encode, Channel, Content, Envelope, ErrorContent, ExecuteReply, ReplyStatus,
    StatusContent, StreamContent, StreamName,
};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use workbench::SessionState;

/// One step of the kernel's response to a request.
pub enum Step {
    Send(Envelope),
    Raw(String),
    Close,
}

pub struct FakeKernel {
    pub url: Url,
    /// `Authorization` header seen on the handshake.
    pub authorization: Arc<Mutex<Option<String>>>,
    /// Requests received, in order.
    pub handle: JoinHandle<Vec<Envelope>>,
}

/// Accept one websocket connection and answer every request with `script`.
pub async fn spawn_kernel<F>(script: F) -> FakeKernel
where
    F: Fn(&Envelope) -> Vec<Step> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let authorization = Arc::new(Mutex::new(None));
    let seen_auth = authorization.clone();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, res: Response| -> Result<Response, ErrorResponse> {
            *seen_auth.lock().unwrap() = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(res)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let request = decode(text.as_bytes()).unwrap();
            received.push(request.clone());
            for step in script(&request) {
                match step {
                    Step::Send(envelope) => {
                        let frame = String::from_utf8(encode(&envelope).unwrap()).unwrap();
                        ws.send(Message::Text(frame)).await.unwrap();
                    }
                    Step::Raw(frame) => ws.send(Message::Text(frame)).await.unwrap(),
                    Step::Close => {
                        let _ = ws.close(None).await;
                        return received;
                    }
                }
            }
        }
        received
    });

    FakeKernel {
        url: Url::parse(&format!("ws://{addr}/user/admin/api/kernels/k1/channels")).unwrap(),
        authorization,
        handle,
    }
}

pub fn stream(parent: &Envelope, name: StreamName, text: &str) -> Step {
    Step::Send(Envelope::reply_to(
        parent,
        Content::Stream(StreamContent {
            name,
            text: text.into(),
        }),
        Channel::Iopub,
    ))
}

pub fn status(parent: &Envelope, state: &str) -> Step {
    Step::Send(Envelope::reply_to(
        parent,
        Content::Status(StatusContent {
            execution_state: state.into(),
        }),
        Channel::Iopub,
    ))
}

pub fn reply(parent: &Envelope, status: ReplyStatus, count: u32, extra: Map<String, Value>) -> Step {
    Step::Send(Envelope::reply_to(
        parent,
        Content::ExecuteReply(ExecuteReply {
            status,
            execution_count: Some(count),
            extra,
        }),
        Channel::Shell,
    ))
}

pub fn error_output(parent: &Envelope, ename: &str, evalue: &str) -> Step {
    Step::Send(Envelope::reply_to(
        parent,
        Content::Error(ErrorContent {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: vec![format!("{ename}: {evalue}")],
        }),
        Channel::Iopub,
    ))
}

pub fn error_fields(ename: &str, evalue: &str) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("ename".into(), Value::String(ename.into()));
    extra.insert("evalue".into(), Value::String(evalue.into()));
    extra.insert("traceback".into(), Value::Array(vec![]));
    extra
}

/// The usual answer to a successful request: busy, outputs, reply, idle.
pub fn ok_run(parent: &Envelope, outputs: Vec<Step>, count: u32) -> Vec<Step> {
    let mut steps = vec![status(parent, "busy")];
    steps.extend(outputs);
    steps.push(reply(parent, ReplyStatus::Ok, count, Map::new()));
    steps.push(status(parent, "idle"));
    steps
}

/// Address nothing listens on.
pub async fn refused_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("ws://{addr}/channels")).unwrap()
}

/// Wait until `rx` reports `wanted`.
pub async fn wait_for_state(rx: &mut broadcast::Receiver<SessionState>, wanted: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.recv().await.unwrap() == wanted {
                return;
            }
        }
    })
    .await
    .expect("state change");
}
