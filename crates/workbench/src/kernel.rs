//! Kernel session client: one websocket to one kernel.
//!
//! Outbound requests go through a writer task; inbound frames are decoded and
//! dispatched by a single reader task, one envelope at a time, in the order
//! they arrive. Output records are routed by the request that produced them,
//! with a fallback subscriber for output that no route claims.

use futures::{SinkExt, StreamExt};
use kernel_wire::{decode, encode, Envelope};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::output::OutputRecord;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STATE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("kernel session is not connected")]
    NotConnected,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Receives the output records of one execution (or of unrouted output).
pub type OutputSink = Box<dyn FnMut(OutputRecord) + Send>;

/// Receives every envelope whose parent is the registered request.
pub type ReplyCallback = Box<dyn FnMut(&Envelope) + Send>;

/// Which delivery paths fired for one envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub output: bool,
    pub callback: bool,
}

/// Routing table from request id to output sink and reply callback.
///
/// Sinks and callbacks run while the table is borrowed, so they must not
/// call back into the session.
#[derive(Default)]
pub struct Router {
    fallback: Option<OutputSink>,
    outputs: HashMap<String, OutputSink>,
    callbacks: HashMap<String, ReplyCallback>,
}

impl Router {
    /// Replace the fallback subscriber. Last writer wins.
    pub fn on_output(&mut self, sink: OutputSink) {
        self.fallback = Some(sink);
    }

    pub fn route_output(&mut self, request_id: &str, sink: OutputSink) {
        self.outputs.insert(request_id.to_string(), sink);
    }

    pub fn register_callback(&mut self, request_id: &str, callback: ReplyCallback) {
        self.callbacks.insert(request_id.to_string(), callback);
    }

    /// Drop both routes for a request.
    pub fn unregister(&mut self, request_id: &str) {
        self.outputs.remove(request_id);
        self.callbacks.remove(request_id);
    }

    pub fn clear(&mut self) {
        self.fallback = None;
        self.outputs.clear();
        self.callbacks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fallback.is_none() && self.outputs.is_empty() && self.callbacks.is_empty()
    }

    /// Deliver one envelope. Output and callback delivery are independent;
    /// both may fire.
    pub fn dispatch(&mut self, envelope: &Envelope) -> Delivery {
        let mut delivery = Delivery::default();
        let parent_id = envelope.parent_id.as_deref();

        if let Some(record) = OutputRecord::from_content(&envelope.content) {
            let routed = parent_id.and_then(|id| self.outputs.get_mut(id));
            if let Some(sink) = routed.or(self.fallback.as_mut()) {
                sink(record);
                delivery.output = true;
            }
        }

        if let Some(callback) = parent_id.and_then(|id| self.callbacks.get_mut(id)) {
            callback(envelope);
            delivery.callback = true;
        }

        delivery
    }

    /// Decode and deliver one frame. Malformed frames are logged and
    /// dropped.
    pub fn dispatch_frame(&mut self, frame: &[u8]) -> Option<Delivery> {
        match decode(frame) {
            Ok(envelope) => {
                debug!(
                    "[kernel-session] {} on {} parent={:?}",
                    envelope.msg_type(),
                    envelope.channel,
                    envelope.parent_id
                );
                Some(self.dispatch(&envelope))
            }
            Err(e) => {
                warn!("[kernel-session] Dropping malformed envelope: {}", e);
                None
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_state(
    state: &StdMutex<SessionState>,
    changes: &broadcast::Sender<SessionState>,
    next: SessionState,
) {
    let mut current = lock(state);
    if *current == next {
        return;
    }
    info!("[kernel-session] {:?} -> {:?}", *current, next);
    *current = next;
    drop(current);
    let _ = changes.send(next);
}

pub struct KernelSession {
    url: Url,
    token: Option<String>,
    session_id: String,
    connect_timeout: Duration,
    state: Arc<StdMutex<SessionState>>,
    state_tx: broadcast::Sender<SessionState>,
    router: Arc<StdMutex<Router>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl KernelSession {
    /// Session for the kernel channels endpoint at `url`. A `session_id`
    /// query parameter is reused; otherwise one is generated and appended.
    pub fn new(mut url: Url) -> Self {
        let existing = url
            .query_pairs()
            .find(|(key, _)| key == "session_id")
            .map(|(_, value)| value.into_owned());
        let session_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                url.query_pairs_mut().append_pair("session_id", &id);
                id
            }
        };
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        Self {
            url,
            token: None,
            session_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: Arc::new(StdMutex::new(SessionState::Disconnected)),
            state_tx,
            router: Arc::new(StdMutex::new(Router::default())),
            outbound: None,
            reader_task: None,
        }
    }

    /// Send `Authorization: token <token>` on connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Observe state transitions, including connection loss.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// True when no subscriber, sink or callback is registered.
    pub fn has_no_routes(&self) -> bool {
        lock(&self.router).is_empty()
    }

    /// Open the websocket. No retry is attempted; a failure leaves the
    /// session `Closed`.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.state() == SessionState::Open {
            return Ok(());
        }
        set_state(&self.state, &self.state_tx, SessionState::Connecting);

        match self.open_socket().await {
            Ok(()) => {
                set_state(&self.state, &self.state_tx, SessionState::Open);
                info!("[kernel-session] Connected session {}", self.session_id);
                Ok(())
            }
            Err(e) => {
                error!("[kernel-session] Connect failed: {}", e);
                set_state(&self.state, &self.state_tx, SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn open_socket(&mut self) -> Result<(), SessionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::ConnectionError(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|e| SessionError::ConnectionError(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    SessionError::ConnectionError(format!(
                        "timed out after {:?}",
                        self.connect_timeout
                    ))
                })?
                .map_err(|e| SessionError::ConnectionError(e.to_string()))?;

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    error!("[kernel-session] Write failed: {}", e);
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let router = self.router.clone();
        let state = self.state.clone();
        let state_tx = self.state_tx.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let bytes = match frame {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(frame)) => {
                        info!("[kernel-session] Server closed the socket: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("[kernel-session] Read failed: {}", e);
                        break;
                    }
                };
                lock(&router).dispatch_frame(&bytes);
            }
            set_state(&state, &state_tx, SessionState::Closed);
            lock(&router).clear();
        });

        self.outbound = Some(outbound_tx);
        self.reader_task = Some(reader_task);
        Ok(())
    }

    fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(SessionError::NotConnected)?;

        let bytes = encode(envelope).map_err(|e| SessionError::Encode(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| SessionError::Encode(e.to_string()))?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| SessionError::NotConnected)?;
        Ok(())
    }

    /// Send an `execute_request` with no routes. Returns the request id.
    pub fn send_execution(&self, code: &str) -> Result<String, SessionError> {
        let envelope = Envelope::execute_request(code, &self.session_id);
        self.send(&envelope)?;
        info!("[kernel-session] Sent execute_request: msg_id={}", envelope.id());
        Ok(envelope.id().to_string())
    }

    /// Send an `execute_request` with its output sink and reply callback
    /// registered. Routes are registered before sending and dropped again
    /// if the send fails.
    pub fn execute(
        &self,
        code: &str,
        sink: OutputSink,
        callback: ReplyCallback,
    ) -> Result<String, SessionError> {
        let envelope = Envelope::execute_request(code, &self.session_id);
        let request_id = envelope.id().to_string();

        {
            let mut router = lock(&self.router);
            router.route_output(&request_id, sink);
            router.register_callback(&request_id, callback);
        }

        if let Err(e) = self.send(&envelope) {
            lock(&self.router).unregister(&request_id);
            return Err(e);
        }
        info!("[kernel-session] Sent execute_request: msg_id={}", request_id);
        Ok(request_id)
    }

    /// Replace the fallback output subscriber.
    pub fn on_output(&self, sink: OutputSink) {
        lock(&self.router).on_output(sink);
    }

    pub fn register_callback(&self, request_id: &str, callback: ReplyCallback) {
        lock(&self.router).register_callback(request_id, callback);
    }

    pub fn unregister(&self, request_id: &str) {
        lock(&self.router).unregister(request_id);
    }

    /// Close the socket and drop every route. Idempotent. The kernel is not
    /// told to cancel anything.
    pub fn disconnect(&mut self) {
        // Dropping the sender lets the writer send a close frame.
        self.outbound = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        lock(&self.router).clear();
        if self.state() != SessionState::Disconnected {
            set_state(&self.state, &self.state_tx, SessionState::Closed);
        }
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_wire::{
        Channel, Content, ExecuteReply, ReplyStatus, StatusContent, StreamContent, StreamName,
    };
    use serde_json::json;

    fn collecting_sink() -> (OutputSink, Arc<StdMutex<Vec<OutputRecord>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: OutputSink = Box::new(move |record| captured.lock().unwrap().push(record));
        (sink, seen)
    }

    fn counting_callback() -> (ReplyCallback, Arc<StdMutex<Vec<String>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let captured = seen.clone();
        let callback: ReplyCallback =
            Box::new(move |env: &Envelope| {
                captured.lock().unwrap().push(env.msg_type().to_string())
            });
        (callback, seen)
    }

    fn request() -> Envelope {
        Envelope::execute_request("print(1)", "session-1")
    }

    fn stream_reply(parent: &Envelope, text: &str) -> Envelope {
        Envelope::reply_to(
            parent,
            Content::Stream(StreamContent {
                name: StreamName::Stdout,
                text: text.into(),
            }),
            Channel::Iopub,
        )
    }

    #[test]
    fn test_output_goes_to_routed_sink_and_callback() {
        let req = request();
        let mut router = Router::default();
        let (sink, outputs) = collecting_sink();
        let (callback, replies) = counting_callback();
        router.route_output(req.id(), sink);
        router.register_callback(req.id(), callback);

        let delivery = router.dispatch(&stream_reply(&req, "1\n"));

        assert_eq!(
            delivery,
            Delivery {
                output: true,
                callback: true
            }
        );
        assert_eq!(outputs.lock().unwrap().len(), 1);
        assert_eq!(*replies.lock().unwrap(), vec!["stream".to_string()]);
    }

    #[test]
    fn test_unrouted_output_goes_to_fallback() {
        let req = request();
        let mut router = Router::default();
        let (fallback, seen) = collecting_sink();
        router.on_output(fallback);

        let delivery = router.dispatch(&stream_reply(&req, "x"));

        assert!(delivery.output);
        assert!(!delivery.callback);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fallback_is_last_writer_wins() {
        let req = request();
        let mut router = Router::default();
        let (first, first_seen) = collecting_sink();
        let (second, second_seen) = collecting_sink();
        router.on_output(first);
        router.on_output(second);

        router.dispatch(&stream_reply(&req, "x"));

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_requests_route_separately() {
        let a = request();
        let b = request();
        let mut router = Router::default();
        let (sink_a, seen_a) = collecting_sink();
        let (sink_b, seen_b) = collecting_sink();
        router.route_output(a.id(), sink_a);
        router.route_output(b.id(), sink_b);

        router.dispatch(&stream_reply(&b, "from b"));
        router.dispatch(&stream_reply(&a, "from a"));

        assert_eq!(seen_a.lock().unwrap()[0].to_text(), "from a");
        assert_eq!(seen_b.lock().unwrap()[0].to_text(), "from b");
    }

    #[test]
    fn test_reply_triggers_callback_only() {
        let req = request();
        let mut router = Router::default();
        let (fallback, outputs) = collecting_sink();
        let (callback, replies) = counting_callback();
        router.on_output(fallback);
        router.register_callback(req.id(), callback);

        let reply = Envelope::reply_to(
            &req,
            Content::ExecuteReply(ExecuteReply {
                status: ReplyStatus::Ok,
                execution_count: Some(1),
                extra: Default::default(),
            }),
            Channel::Shell,
        );
        let delivery = router.dispatch(&reply);

        assert_eq!(
            delivery,
            Delivery {
                output: false,
                callback: true
            }
        );
        assert!(outputs.lock().unwrap().is_empty());
        assert_eq!(*replies.lock().unwrap(), vec!["execute_reply".to_string()]);
    }

    #[test]
    fn test_unknown_and_unclaimed_messages_are_dropped() {
        let req = request();
        let mut router = Router::default();
        let status = Envelope::reply_to(
            &req,
            Content::Status(StatusContent {
                execution_state: "busy".into(),
            }),
            Channel::Iopub,
        );
        let comm = Envelope::new(
            Content::Other {
                msg_type: "comm_open".into(),
                payload: json!({}),
            },
            Channel::Iopub,
            "kernel",
        );

        assert_eq!(router.dispatch(&status), Delivery::default());
        assert_eq!(router.dispatch(&comm), Delivery::default());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut router = Router::default();
        let (fallback, seen) = collecting_sink();
        router.on_output(fallback);

        assert!(router.dispatch_frame(b"not json").is_none());
        assert!(router
            .dispatch_frame(br#"{"header": {"msg_type": "stream"}, "content": {}}"#)
            .is_none());
        assert!(seen.lock().unwrap().is_empty());

        let req = request();
        let good = encode(&stream_reply(&req, "ok")).unwrap();
        assert!(router.dispatch_frame(&good).unwrap().output);
    }

    #[test]
    fn test_untyped_protocol_frames_still_reach_callback() {
        let mut router = Router::default();
        let (callback, replies) = counting_callback();
        router.register_callback("req-1", callback);

        let status = br#"{"header":{"msg_id":"a","msg_type":"status"},"parent_header":{"msg_id":"req-1"},"content":{},"channel":"iopub"}"#;
        let reply = br#"{"header":{"msg_id":"b","msg_type":"execute_reply"},"parent_header":{"msg_id":"req-1"},"content":{"status":"abort"},"channel":"shell"}"#;

        assert!(router.dispatch_frame(status).unwrap().callback);
        assert!(router.dispatch_frame(reply).unwrap().callback);
        assert_eq!(
            *replies.lock().unwrap(),
            vec!["status".to_string(), "execute_reply".to_string()]
        );
    }

    #[test]
    fn test_unregister_and_clear() {
        let req = request();
        let mut router = Router::default();
        let (sink, _) = collecting_sink();
        let (callback, _) = counting_callback();
        router.route_output(req.id(), sink);
        router.register_callback(req.id(), callback);

        router.unregister(req.id());
        assert!(router.is_empty());

        let (fallback, _) = collecting_sink();
        router.on_output(fallback);
        router.clear();
        assert!(router.is_empty());
    }

    #[test]
    fn test_new_session_appends_session_id() {
        let session = KernelSession::new(Url::parse("ws://localhost:8000/api/kernels/k/channels").unwrap());
        assert!(session
            .url
            .query()
            .unwrap()
            .contains(&format!("session_id={}", session.session_id())));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_new_session_reuses_session_id() {
        let session = KernelSession::new(
            Url::parse("ws://localhost:8000/api/kernels/k/channels?session_id=abc&token=t").unwrap(),
        );
        assert_eq!(session.session_id(), "abc");
    }

    #[test]
    fn test_send_execution_before_connect_is_not_connected() {
        let session = KernelSession::new(Url::parse("ws://localhost:1/channels").unwrap());
        assert_eq!(
            session.send_execution("print(1)"),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn test_failed_execute_leaves_no_routes() {
        let session = KernelSession::new(Url::parse("ws://localhost:1/channels").unwrap());
        let (sink, _) = collecting_sink();
        let (callback, _) = counting_callback();

        let result = session.execute("print(1)", sink, callback);

        assert_eq!(result, Err(SessionError::NotConnected));
        assert!(session.has_no_routes());
    }

    #[test]
    fn test_disconnect_before_connect_stays_disconnected() {
        let mut session = KernelSession::new(Url::parse("ws://localhost:1/channels").unwrap());
        let (fallback, _) = collecting_sink();
        session.on_output(fallback);

        session.disconnect();
        session.disconnect();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.has_no_routes());
    }
}
