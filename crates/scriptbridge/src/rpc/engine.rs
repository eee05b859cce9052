//! Bidirectional JSON-RPC engine.
//!
//! Flow:
//! 1. Outgoing calls register a pending entry keyed by id, write the Request
//!    through the shared writer, then wait on their own oneshot receiver
//! 2. One read loop per engine decodes frames: Responses go to the matching
//!    pending entry, Requests and Notifications are dispatched on their own
//!    task so a slow handler never stalls the reader
//! 3. On EOF or read error every pending call fails with `ConnectionClosed`
//!
//! All writes (outgoing calls, notifications, responses to inbound requests)
//! funnel through one `tokio::sync::Mutex` so frames never interleave.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use super::error::RpcError;
use super::handler::{HandlerTable, RequestContext};
use super::protocol::{Id, Message, Notification, Outcome, Request, Response, RpcErrorObject};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Delivery = Result<Value, RpcErrorObject>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on inbound handlers running at once. Dispatch tasks beyond
    /// the bound wait for a permit; the read loop itself never waits.
    pub max_concurrent_handlers: usize,
    pub max_frame_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_handlers(mut self, n: usize) -> Self {
        self.max_concurrent_handlers = n.max(1);
        self
    }

    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }
}

#[derive(Default)]
struct Pending {
    calls: HashMap<i64, oneshot::Sender<Delivery>>,
    closed: bool,
}

struct Shared {
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxWriter, FrameCodec>>>,
    pending: StdMutex<Pending>,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        // Nothing panics while holding this lock; recover rather than propagate.
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mark the connection dead and fail everything still waiting.
    fn fail_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending();
            pending.closed = true;
            pending.calls.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Failing pending calls: connection closed");
        }
        // Dropping the senders wakes every receiver with RecvError.
        drop(drained);
        self.closed.cancel();
    }
}

/// Removes a pending entry when the call future completes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.pending().calls.remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "Call abandoned before its response arrived");
        }
    }
}

fn to_params<P: Serialize>(params: P) -> Result<Option<Value>, RpcError> {
    match serde_json::to_value(params).map_err(RpcError::Encode)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Cloneable handle for talking to the other side.
///
/// Handlers receive one through [`RequestContext::peer`] so they can emit
/// progress notifications or call back while a request is in flight.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Issue a call and wait for its Response.
    ///
    /// Dropping the returned future cancels the call: the pending entry is
    /// removed and a late Response is discarded.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = to_params(params)?;
        let value = self.call_value(method, params).await?;
        serde_json::from_value(value).map_err(RpcError::Decode)
    }

    /// Like [`call`](Self::call), resolving to [`RpcError::Cancelled`] once
    /// `cancel` fires.
    pub async fn call_with_cancel<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            result = self.call(method, params) => result,
        }
    }

    /// Like [`call`](Self::call), resolving to [`RpcError::Timeout`] after
    /// `timeout`.
    pub async fn call_timeout<P, R>(
        &self,
        timeout: Duration,
        method: &str,
        params: P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.call(method, params))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    /// Send a notification. Does not allocate an id and does not wait for
    /// anything but the write.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        let params = to_params(params)?;
        tracing::debug!(method, "Sending notification");
        self.send(Notification::new(method, params).into()).await
    }

    async fn call_value(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if pending.closed {
                return Err(RpcError::ConnectionClosed);
            }
            pending.calls.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        tracing::debug!(id, method, "Sending request");
        self.send(Request::new(id, method, params).into()).await?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    async fn send(&self, message: Message) -> Result<(), RpcError> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(RpcError::ConnectionClosed)?;
        writer.send(message).await.map_err(RpcError::Io)
    }

    fn deliver(&self, response: Response) {
        let id = match response.id {
            Id::Number(id) => id,
            other => {
                match response.outcome {
                    Outcome::Error(err) => tracing::warn!(
                        id = %other,
                        code = err.code,
                        message = %err.message,
                        "Uncorrelated error response"
                    ),
                    Outcome::Result(_) => {
                        tracing::warn!(id = %other, "Response with an id we never issued")
                    }
                }
                return;
            }
        };

        let sender = self.shared.pending().calls.remove(&id);
        let Some(sender) = sender else {
            tracing::debug!(id, "Dropping orphaned response");
            return;
        };

        let delivery = match response.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        };
        if sender.send(delivery).is_err() {
            tracing::debug!(id, "Caller went away before delivery");
        }
    }

    /// Number of calls waiting for a Response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the read loop has ended.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fails pending calls however the read loop ends, including abort.
struct CloseOnExit(Arc<Shared>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.fail_pending();
    }
}

/// JSON-RPC endpoint over one reader/writer pair.
///
/// Cloning is cheap; the read loop stops when the last clone is dropped.
#[derive(Clone)]
pub struct RpcEngine {
    peer: Peer,
    _reader: Arc<ReaderTask>,
}

impl RpcEngine {
    /// Build the engine and start its read loop. Must be called inside a
    /// tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, handlers: HandlerTable) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, handlers, EngineConfig::default())
    }

    pub fn with_config<R, W>(
        reader: R,
        writer: W,
        handlers: HandlerTable,
        config: EngineConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxWriter = Box::new(writer);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(
                writer,
                FrameCodec::with_max_length(config.max_frame_length),
            ))),
            pending: StdMutex::new(Pending::default()),
            next_id: AtomicI64::new(1),
            closed: CancellationToken::new(),
        });
        let peer = Peer { shared };

        let frames = FramedRead::new(reader, FrameCodec::with_max_length(config.max_frame_length));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        let task = tokio::spawn(read_loop(frames, peer.clone(), Arc::new(handlers), permits));

        Self {
            peer,
            _reader: Arc::new(ReaderTask(task)),
        }
    }

    /// Handle for code that should not keep the read loop alive.
    pub fn peer(&self) -> Peer {
        self.peer.clone()
    }

    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.peer.call(method, params).await
    }

    pub async fn call_with_cancel<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.peer.call_with_cancel(cancel, method, params).await
    }

    pub async fn call_timeout<P, R>(
        &self,
        timeout: Duration,
        method: &str,
        params: P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.peer.call_timeout(timeout, method, params).await
    }

    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        self.peer.notify(method, params).await
    }

    /// Flush and drop the writer so the peer sees EOF. Later writes fail
    /// with [`RpcError::ConnectionClosed`]; the read side keeps running.
    pub async fn close(&self) -> Result<(), RpcError> {
        let writer = self.peer.shared.writer.lock().await.take();
        match writer {
            Some(mut writer) => writer.close().await.map_err(RpcError::Io),
            None => Ok(()),
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.peer.pending_calls()
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    pub async fn closed(&self) {
        self.peer.closed().await
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    peer: Peer,
    handlers: Arc<HandlerTable>,
    permits: Arc<Semaphore>,
) where
    R: AsyncRead + Unpin,
{
    let _close = CloseOnExit(Arc::clone(&peer.shared));

    loop {
        match frames.next().await {
            Some(Ok(Message::Response(response))) => peer.deliver(response),
            Some(Ok(Message::Request(request))) => {
                dispatch_request(&peer, &handlers, &permits, request);
            }
            Some(Ok(Message::Notification(notification))) => {
                dispatch_notification(&peer, &handlers, &permits, notification);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "RPC stream read failed");
                break;
            }
            None => {
                tracing::debug!("RPC stream reached EOF");
                break;
            }
        }
    }
}

fn dispatch_request(
    peer: &Peer,
    handlers: &HandlerTable,
    permits: &Arc<Semaphore>,
    request: Request,
) {
    let Request { id, method, params, .. } = request;
    let handler = handlers.get(&method).cloned();
    let peer = peer.clone();
    let permits = Arc::clone(permits);

    tokio::spawn(async move {
        let response = match handler {
            None => {
                tracing::debug!(%id, %method, "No handler registered for request");
                Response::error(id, RpcErrorObject::method_not_found(&method))
            }
            Some(handler) => {
                let _permit = permits.acquire_owned().await.ok();
                let cx = RequestContext::new(method.clone(), Some(id.clone()), peer.clone());
                match AssertUnwindSafe(handler.call(cx, params)).catch_unwind().await {
                    Ok(Ok(result)) => Response::success(id, result),
                    Ok(Err(err)) => {
                        tracing::debug!(
                            %id,
                            %method,
                            code = err.code,
                            message = %err.message,
                            "Handler returned error"
                        );
                        Response::error(id, err)
                    }
                    Err(_) => {
                        tracing::error!(%id, %method, "Handler panicked");
                        let message = format!("handler for {method} panicked");
                        Response::error(id, RpcErrorObject::internal(message))
                    }
                }
            }
        };

        if let Err(e) = peer.send(response.into()).await {
            tracing::warn!(error = %e, "Failed to write response");
        }
    });
}

fn dispatch_notification(
    peer: &Peer,
    handlers: &HandlerTable,
    permits: &Arc<Semaphore>,
    notification: Notification,
) {
    let Notification { method, params, .. } = notification;
    let Some(handler) = handlers.get(&method).cloned() else {
        tracing::debug!(%method, "No handler registered for notification");
        return;
    };
    let peer = peer.clone();
    let permits = Arc::clone(permits);

    tokio::spawn(async move {
        let _permit = permits.acquire_owned().await.ok();
        let cx = RequestContext::new(method.clone(), None, peer);
        match AssertUnwindSafe(handler.call(cx, params)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::debug!(
                    %method,
                    message = %err.message,
                    "Notification handler returned error"
                );
            }
            Err(_) => tracing::error!(%method, "Notification handler panicked"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handler::HandlerError;
    use crate::rpc::protocol::{INTERNAL_ERROR, INVALID_PARAMS};
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    fn engine_on(stream: DuplexStream, handlers: HandlerTable) -> RpcEngine {
        let (read, write) = tokio::io::split(stream);
        RpcEngine::new(read, write, handlers)
    }

    /// Two engines wired back to back.
    fn pair(host: HandlerTable, worker: HandlerTable) -> (RpcEngine, RpcEngine) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (engine_on(a, host), engine_on(b, worker))
    }

    /// Engine plus the raw frames of the other side.
    fn raw_peer(
        handlers: HandlerTable,
    ) -> (
        RpcEngine,
        FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        WriteHalf<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(b);
        (engine_on(a, handlers), FramedRead::new(read, FrameCodec::new()), write)
    }

    async fn write_line(w: &mut WriteHalf<DuplexStream>, line: &str) {
        w.write_all(line.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();
        w.flush().await.unwrap();
    }

    fn worker_handlers() -> HandlerTable {
        #[derive(serde::Deserialize)]
        struct Sleep {
            ms: u64,
            tag: String,
        }

        let mut table = HandlerTable::new();
        table
            .register_request("echo", |_cx, p: Value| async move {
                Ok::<_, HandlerError>(json!({"echoed": p["message"]}))
            })
            .unwrap();
        table
            .register_request("sleep", |_cx, p: Sleep| async move {
                tokio::time::sleep(Duration::from_millis(p.ms)).await;
                Ok::<_, HandlerError>(p.tag)
            })
            .unwrap();
        table
            .register_request("fail", |_cx, _p: Value| async move {
                Err::<Value, _>(HandlerError::new("disk full"))
            })
            .unwrap();
        table
            .register_request("panic", |_cx, _p: Value| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<Value, HandlerError>(Value::Null)
            })
            .unwrap();
        table
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let result: Value = host.call("echo", json!({"message": "hi"})).await.unwrap();
        assert_eq!(result, json!({"echoed": "hi"}));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_answered_out_of_order() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let slow = host.call::<_, String>("sleep", json!({"ms": 200, "tag": "slow"}));
        let fast = host.call::<_, String>("sleep", json!({"ms": 10, "tag": "fast"}));
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), "slow");
        assert_eq!(fast.unwrap(), "fast");
    }

    #[tokio::test]
    async fn many_concurrent_calls_each_get_their_own_result() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let calls = (0..32).map(|i| {
            let host = host.clone();
            async move {
                let tag = format!("call-{i}");
                let ms = (32 - i) as u64;
                let got: String = host.call("sleep", json!({"ms": ms, "tag": tag})).await.unwrap();
                (tag, got)
            }
        });
        for (expected, got) in futures::future::join_all(calls).await {
            assert_eq!(expected, got);
        }
    }

    #[tokio::test]
    async fn method_not_found_is_distinguishable() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let err = host.call::<_, Value>("close", ()).await.unwrap_err();
        assert!(err.is_method_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn handler_error_becomes_internal_error() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let err = host.call::<_, Value>("fail", ()).await.unwrap_err();
        match err {
            RpcError::Rpc { code, message, .. } => {
                assert_eq!(code, INTERNAL_ERROR);
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let err = host.call::<_, Value>("panic", ()).await.unwrap_err();
        assert_eq!(err.code(), Some(INTERNAL_ERROR));

        // The engine keeps serving.
        let ok: Value = host.call("echo", json!({"message": "still here"})).await.unwrap();
        assert_eq!(ok["echoed"], "still here");
    }

    #[tokio::test]
    async fn invalid_params_rejected_before_handler() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let err = host
            .call::<_, Value>("sleep", json!({"ms": "soon"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn cancelled_call_drops_late_response() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = host
            .call_with_cancel::<_, String>(&cancel, "sleep", json!({"ms": 150, "tag": "late"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled));
        assert_eq!(host.pending_calls(), 0);

        // Let the late response arrive and be discarded.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let next: String = host
            .call("sleep", json!({"ms": 1, "tag": "next"}))
            .await
            .unwrap();
        assert_eq!(next, "next");
    }

    #[tokio::test]
    async fn call_timeout_removes_pending_entry() {
        let (host, _worker) = pair(HandlerTable::new(), worker_handlers());
        let err = host
            .call_timeout::<_, String>(
                Duration::from_millis(20),
                "sleep",
                json!({"ms": 200, "tag": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn notify_does_not_allocate_an_id() {
        let (host, mut frames, mut raw) = raw_peer(HandlerTable::new());

        host.notify("progress", json!({"msg": "one"})).await.unwrap();
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call::<_, Value>("health", ()).await }
        });

        match frames.next().await.unwrap().unwrap() {
            Message::Notification(n) => {
                assert_eq!(n.method, "progress");
                assert_eq!(n.params, Some(json!({"msg": "one"})));
            }
            other => panic!("expected notification, got {other:?}"),
        }
        match frames.next().await.unwrap().unwrap() {
            Message::Request(r) => {
                assert_eq!(r.id, Id::Number(1));
                assert_eq!(r.method, "health");
                assert_eq!(r.params, None);
            }
            other => panic!("expected request, got {other:?}"),
        }

        write_line(&mut raw, r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn garbage_and_orphans_do_not_kill_the_read_loop() {
        let (host, mut frames, mut raw) = raw_peer(HandlerTable::new());
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call::<_, Value>("echo", ()).await }
        });
        let Message::Request(req) = frames.next().await.unwrap().unwrap() else {
            panic!("expected request");
        };

        write_line(&mut raw, "this is not json").await;
        write_line(&mut raw, r#"{"jsonrpc":"2.0","id":999,"result":"orphan"}"#).await;
        write_line(&mut raw, r#"{"unexpected":"shape"}"#).await;
        write_line(
            &mut raw,
            &format!(r#"{{"jsonrpc":"2.0","id":{},"result":"real"}}"#, req.id),
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("real"));
        assert!(!host.is_closed());
    }

    #[tokio::test]
    async fn eof_fails_pending_calls() {
        let (host, mut frames, raw) = raw_peer(HandlerTable::new());
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call::<_, Value>("echo", ()).await }
        });
        frames.next().await.unwrap().unwrap();

        // Closing both halves of the far side ends the read loop.
        drop(frames);
        drop(raw);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed), "{err:?}");
        host.closed().await;
        assert!(host.is_closed());

        let err = host.call::<_, Value>("echo", ()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn inbound_request_answered_with_peer_supplied_id() {
        let (_host, mut frames, mut raw) = raw_peer(worker_handlers());
        write_line(
            &mut raw,
            r#"{"jsonrpc":"2.0","id":"abc","method":"echo","params":{"message":"yo"}}"#,
        )
        .await;
        write_line(&mut raw, r#"{"jsonrpc":"2.0","id":7,"method":"nope"}"#).await;

        let mut seen = HashMap::new();
        for _ in 0..2 {
            let Message::Response(resp) = frames.next().await.unwrap().unwrap() else {
                panic!("expected response");
            };
            seen.insert(resp.id.to_string(), resp.outcome);
        }
        assert_eq!(
            seen.remove("\"abc\""),
            Some(Outcome::Result(json!({"echoed": "yo"})))
        );
        match seen.remove("7") {
            Some(Outcome::Error(err)) => {
                assert_eq!(err.code, crate::rpc::protocol::METHOD_NOT_FOUND)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handlers_can_notify_and_call_back() {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let mut host_handlers = HandlerTable::new();
        host_handlers
            .register_notification("invokeProgress", move |_cx, p: Value| {
                let progress_tx = progress_tx.clone();
                async move {
                    let _ = progress_tx.send(p["msg"].as_str().unwrap_or_default().to_string());
                }
            })
            .unwrap();
        host_handlers
            .register_request("getConfig", |_cx, _p: Value| async move {
                Ok::<_, HandlerError>(json!({"region": "eu-west-1"}))
            })
            .unwrap();

        let mut worker_handlers = HandlerTable::new();
        worker_handlers
            .register_request("invoke", |cx: RequestContext, _p: Value| async move {
                for step in 1..=3 {
                    cx.peer()
                        .notify("invokeProgress", json!({"msg": format!("step {step}")}))
                        .await
                        .map_err(|e| HandlerError::new(e.to_string()))?;
                }
                let config: Value = cx
                    .peer()
                    .call("getConfig", ())
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Ok::<_, HandlerError>(json!({"done": true, "config": config}))
            })
            .unwrap();

        let (host, _worker) = pair(host_handlers, worker_handlers);
        let result: Value = host.call("invoke", ()).await.unwrap();
        assert_eq!(result, json!({"done": true, "config": {"region": "eu-west-1"}}));

        let mut progress = Vec::new();
        while progress.len() < 3 {
            progress.push(progress_rx.recv().await.unwrap());
        }
        progress.sort();
        assert_eq!(progress, vec!["step 1", "step 2", "step 3"]);
    }

    #[tokio::test]
    async fn close_sends_eof_to_peer() {
        let (host, worker) = pair(HandlerTable::new(), HandlerTable::new());
        host.close().await.unwrap();
        worker.closed().await;
        assert!(worker.is_closed());

        let err = host.notify("late", ()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }
}
