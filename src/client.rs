//! RPC client: many concurrent calls multiplexed over one connection.
//!
//! ```text
//!   caller ─┐                                    ┌─ oneshot ─→ caller
//!   caller ─┼─→ mpsc ─→ writer task ══╗  ╔══ reader ─→ [call map] ─┼─ oneshot ─→ caller
//!   caller ─┘                         ║  ║              id → tx     └─ oneshot ─→ caller
//!                                     ╚══╝ connection
//! ```
//!
//! Every call gets a fresh `u32` id and a one-shot completion channel parked
//! in the call map. Requests go through a single writer task, which writes
//! each one whole even if its caller gives up halfway. A single receive task
//! matches each response to its id. When the connection dies (or the client
//! is closed) the receive task fails every parked call and the writer task
//! drops whatever is still queued, so no caller waits past the end of the
//! connection.
//!
//! Ids wrap at `u32::MAX`. A call still outstanding after four billion newer
//! calls would collide with its successor; this is not guarded against.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{read_message, write_message};
use crate::protocol::{decode_payload, split_method, Request, Response};
use crate::types::{ClientConfig, Error, Result};

type Completion = oneshot::Sender<Result<Response>>;

/// Requests queued for the writer task before callers are pushed back.
const OUTBOUND_QUEUE: usize = 64;

/// One request for the writer task, with a slot for the write outcome.
#[derive(Debug)]
struct Outbound {
    request: Request,
    written: oneshot::Sender<std::io::Result<()>>,
}

/// Outstanding calls plus the two one-way lifecycle flags.
#[derive(Debug, Default)]
struct CallState {
    calls: HashMap<u32, Completion>,
    /// Set by `close`: no new calls.
    closing: bool,
    /// Set by the receive task once the connection is unusable.
    shutdown: bool,
}

struct Tracker {
    outbound: mpsc::Sender<Outbound>,
    /// Map lock. Never held across an await.
    state: Mutex<CallState>,
    next_id: AtomicU32,
    cancel: CancellationToken,
}

impl Tracker {
    fn state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Park a new call, unless the client is closing or already shut down.
    fn register(&self, id: u32) -> Result<oneshot::Receiver<Result<Response>>> {
        let mut state = self.state();
        if state.closing || state.shutdown {
            return Err(Error::ClientClosed);
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(id, tx);
        Ok(rx)
    }

    fn deregister(&self, id: u32) {
        self.state().calls.remove(&id);
    }

    async fn send<I: Serialize>(&self, id: u32, method: &str, input: &I) -> Result<()> {
        let param = serde_json::value::to_raw_value(input)?;
        let request = Request {
            id,
            method: method.to_string(),
            param: Some(param),
        };
        let (written, done) = oneshot::channel();
        self.outbound
            .send(Outbound { request, written })
            .await
            .map_err(|_| self.writer_gone())?;
        done.await.map_err(|_| self.writer_gone())??;
        Ok(())
    }

    fn writer_gone(&self) -> Error {
        if self.state().closing {
            Error::ClientClosed
        } else {
            Error::shutdown("connection writer stopped")
        }
    }

    /// Hand a response to its waiting caller. Responses for unknown ids
    /// (timed out or never issued) are dropped.
    fn complete(&self, response: Response) {
        let waiter = self.state().calls.remove(&response.id);
        match waiter {
            Some(tx) => {
                // Receiver is gone if the caller timed out.
                let _ = tx.send(Ok(response));
            }
            None => tracing::debug!("Discarding response for unknown call id {}", response.id),
        }
    }

    /// Fail every outstanding call, mark the tracker shut down and stop the
    /// writer task.
    fn terminate(&self, reason: &str) {
        {
            let mut state = self.state();
            state.shutdown = true;
            let closing = state.closing;
            let pending = std::mem::take(&mut state.calls);
            if !pending.is_empty() {
                tracing::debug!("Failing {} outstanding calls: {}", pending.len(), reason);
            }
            for (_, tx) in pending {
                let err = if closing {
                    Error::ClientClosed
                } else {
                    Error::shutdown(reason)
                };
                let _ = tx.send(Err(err));
            }
        }
        self.cancel.cancel();
    }

    fn close(&self) {
        let mut state = self.state();
        if state.closing || state.shutdown {
            return;
        }
        state.closing = true;
        self.cancel.cancel();
    }
}

async fn receive_loop<R>(tracker: Arc<Tracker>, mut reader: R, max_message_bytes: usize)
where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = tracker.cancel.cancelled() => break Error::ClientClosed.to_string(),
            read = read_message::<_, Response>(&mut reader, max_message_bytes) => match read {
                Ok(Some(response)) => tracker.complete(response),
                Ok(None) => break "connection closed by peer".to_string(),
                Err(e) => break e.to_string(),
            },
        }
    };
    tracing::debug!("RPC client receive loop stopped: {}", reason);
    tracker.terminate(&reason);
}

/// Write queued requests one at a time until cancelled or the stream fails.
///
/// A write in progress is abandoned on cancel; the connection is being torn
/// down at that point anyway.
async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Outbound>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(Outbound { request, written }) = next else {
            break;
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = write_message(&mut writer, &request) => result,
        };
        let failed = result.is_err();
        let _ = written.send(result);
        if failed {
            break;
        }
    }
    // Queued requests go with the receiver; their callers see the writer gone.
    drop(outbound);
    let _ = writer.shutdown().await;
}

/// Run `connect`, failing with `TimedOut` if it takes longer than `timeout`.
async fn connect_within<T, F>(connect: F, timeout: Option<Duration>) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        None => connect.await,
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout"))?,
    }
}

/// Client for one RPC connection.
///
/// Calls may be issued concurrently from any number of tasks (share the
/// client behind an `Arc`). Dropping the client closes it.
pub struct Client {
    tracker: Arc<Tracker>,
}

impl Client {
    /// Connect over TCP.
    pub async fn dial(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    /// Connect over TCP, giving up after `timeout`.
    pub async fn dial_with_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        Self::dial_with_config(
            addr,
            &ClientConfig {
                dial_timeout: Some(timeout),
                ..ClientConfig::default()
            },
        )
        .await
    }

    /// Connect over TCP using `config` for the connect timeout and limits.
    pub async fn dial_with_config(addr: impl ToSocketAddrs, config: &ClientConfig) -> Result<Self> {
        let stream = connect_within(TcpStream::connect(addr), config.dial_timeout).await?;
        Ok(Self::with_config(stream, config))
    }

    /// Run the protocol over an already-connected stream.
    ///
    /// Spawns the receive and writer tasks, so this must be called inside a
    /// Tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, &ClientConfig::default())
    }

    pub fn with_config<S>(stream: S, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queued) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();
        let tracker = Arc::new(Tracker {
            outbound,
            state: Mutex::new(CallState::default()),
            next_id: AtomicU32::new(0),
            cancel: cancel.clone(),
        });
        tokio::spawn(write_loop(writer, queued, cancel));
        tokio::spawn(receive_loop(
            tracker.clone(),
            BufReader::new(reader),
            config.max_message_bytes,
        ));
        Self { tracker }
    }

    /// Call `method` (`"Service.Method"`) and wait for its result.
    pub async fn call<I, O>(&self, method: &str, input: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let response = self.roundtrip(method, input, None).await?;
        decode_result(&response)
    }

    /// Like [`Client::call`], but stop waiting after `timeout`.
    ///
    /// The request is not withdrawn: the server still runs it, and its
    /// late reply is discarded.
    pub async fn call_with_timeout<I, O>(&self, method: &str, input: &I, timeout: Duration) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let response = self.roundtrip(method, input, Some(timeout)).await?;
        decode_result(&response)
    }

    /// Call `method` for its side effects; any result payload is not decoded.
    pub async fn call_ignoring_output<I: Serialize>(&self, method: &str, input: &I) -> Result<()> {
        self.roundtrip(method, input, None).await?;
        Ok(())
    }

    pub async fn call_ignoring_output_with_timeout<I: Serialize>(
        &self,
        method: &str,
        input: &I,
        timeout: Duration,
    ) -> Result<()> {
        self.roundtrip(method, input, Some(timeout)).await?;
        Ok(())
    }

    async fn roundtrip<I: Serialize>(
        &self,
        method: &str,
        input: &I,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        split_method(method)?;

        let tracker = &self.tracker;
        let id = tracker.next_id();
        let mut done = tracker.register(id)?;

        if let Err(e) = tracker.send(id, method, input).await {
            tracker.deregister(id);
            // Prefer the fan-out outcome if the connection already went down.
            if let Ok(Err(failed)) = done.try_recv() {
                return Err(failed);
            }
            return Err(e);
        }

        let outcome = match timeout {
            None => done.await,
            Some(timeout) => match tokio::time::timeout(timeout, done).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Error::Timeout),
            },
        };

        let response = outcome.map_err(|_| Error::shutdown("call dropped without a response"))??;
        if response.is_error() {
            return Err(Error::remote(response.error));
        }
        Ok(response)
    }

    /// Stop accepting calls and close the connection. Outstanding calls fail
    /// with [`Error::ClientClosed`]. Calling this more than once is a no-op.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// True once the client was closed or its connection died.
    pub fn is_closed(&self) -> bool {
        let state = self.tracker.state();
        state.closing || state.shutdown
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.tracker.state().calls.len()
    }
}

fn decode_result<O: DeserializeOwned>(response: &Response) -> Result<O> {
    Ok(decode_payload(response.result.as_deref())?)
}

impl Drop for Client {
    fn drop(&mut self) {
        self.tracker.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.tracker.state();
        f.debug_struct("Client")
            .field("pending_calls", &state.calls.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, DuplexStream, Lines};

    type Peer = (Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>, tokio::io::WriteHalf<DuplexStream>);

    fn connected() -> (Arc<Client>, Peer) {
        connected_with_buffer(64 * 1024)
    }

    fn connected_with_buffer(max_buf_size: usize) -> (Arc<Client>, Peer) {
        let (client_side, server_side) = duplex(max_buf_size);
        let client = Arc::new(Client::new(client_side));
        let (read, write) = tokio::io::split(server_side);
        (client, (BufReader::new(read).lines(), write))
    }

    async fn next_request(peer: &mut Peer) -> Request {
        let line = peer.0.next_line().await.unwrap().expect("client hung up");
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(peer: &mut Peer, response: serde_json::Value) {
        let mut line = serde_json::to_vec(&response).unwrap();
        line.push(b'\n');
        peer.1.write_all(&line).await.unwrap();
    }

    async fn wait_pending(client: &Client, n: usize) {
        for _ in 0..200 {
            if client.pending_calls() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} pending calls, have {}", client.pending_calls());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        y: i64,
    }

    #[tokio::test]
    async fn test_single_call_roundtrip() {
        let (client, mut peer) = connected();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Square", &json!({"x": 1})).await }
        });

        let req = next_request(&mut peer).await;
        assert_eq!(req.id, 1);
        assert_eq!(req.method, "Calc.Square");
        assert_eq!(req.param.unwrap().get(), r#"{"x":1}"#);

        reply(&mut peer, json!({"id": 1, "result": {"y": 1}, "error": ""})).await;
        assert_eq!(call.await.unwrap().unwrap(), Reply { y: 1 });
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (client, mut peer) = connected();
        let mut calls = Vec::new();
        for x in [1, 2, 3] {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                client.call::<_, Reply>("Calc.Echo", &json!({"x": x})).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(next_request(&mut peer).await);
        }
        // Answer newest first, echoing each request's own input.
        for req in requests.iter().rev() {
            let x: serde_json::Value = serde_json::from_str(req.param.as_ref().unwrap().get()).unwrap();
            reply(&mut peer, json!({"id": req.id, "result": {"y": x["x"]}, "error": ""})).await;
        }

        for (call, x) in calls.into_iter().zip([1, 2, 3]) {
            assert_eq!(call.await.unwrap().unwrap(), Reply { y: x });
        }
    }

    #[tokio::test]
    async fn test_remote_error_wins_over_result() {
        let (client, mut peer) = connected();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Div", &json!({"x": 0})).await }
        });
        let req = next_request(&mut peer).await;
        reply(&mut peer, json!({"id": req.id, "result": {"y": 5}, "error": "divide by zero"})).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Remote(ref m) if m == "divide by zero"), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_method_sends_nothing() {
        let (client, _peer) = connected();
        for bad in ["Calc", "Calc.", "a.b.c"] {
            let err = client.call::<_, Reply>(bad, &()).await.unwrap_err();
            assert!(matches!(err, Error::InvalidMethod(_)));
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_late_reply_unclaimed() {
        let (client, mut peer) = connected();

        let err = client
            .call_with_timeout::<_, Reply>("Calc.Slow", &json!({}), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(client.pending_calls(), 1);

        let slow = next_request(&mut peer).await;
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Fast", &json!({})).await }
        });
        let fast = next_request(&mut peer).await;
        assert_ne!(slow.id, fast.id);

        reply(&mut peer, json!({"id": slow.id, "result": {"y": 111}, "error": ""})).await;
        reply(&mut peer, json!({"id": fast.id, "result": {"y": 222}, "error": ""})).await;

        assert_eq!(second.await.unwrap().unwrap(), Reply { y: 222 });
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (client, mut peer) = connected();
        let mut calls = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                client.call::<_, Reply>("Calc.Never", &()).await
            }));
        }
        for _ in 0..4 {
            next_request(&mut peer).await;
        }
        wait_pending(&client, 4).await;

        client.close();
        client.close();

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::ClientClosed), "{err}");
        }
        assert!(client.is_closed());
        assert_eq!(client.pending_calls(), 0);

        let err = client.call::<_, Reply>("Calc.Again", &()).await.unwrap_err();
        assert!(matches!(err, Error::ClientClosed));
        assert!(peer.0.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_outstanding_calls() {
        let (client, mut peer) = connected();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Never", &()).await }
        });
        next_request(&mut peer).await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Shutdown(_)), "{err}");
        assert!(err.is_disconnect());
        assert!(client.is_closed());

        client.close();
        let err = client.call::<_, Reply>("Calc.Again", &()).await.unwrap_err();
        assert!(matches!(err, Error::ClientClosed));
    }

    #[tokio::test]
    async fn test_garbage_from_peer_shuts_down() {
        let (client, mut peer) = connected();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Never", &()).await }
        });
        next_request(&mut peer).await;
        peer.1.write_all(b"<html>\n").await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Shutdown(ref m) if m.contains("Invalid message")), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let (client, mut peer) = connected();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call_ignoring_output("Calc.Touch", &()).await }
        });
        let req = next_request(&mut peer).await;
        reply(&mut peer, json!({"id": req.id + 100, "result": null, "error": ""})).await;
        reply(&mut peer, json!({"id": req.id, "result": "not decoded", "error": ""})).await;

        call.await.unwrap().unwrap();
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_ignoring_output_with_timeout() {
        let (client, mut peer) = connected();
        let err = client
            .call_ignoring_output_with_timeout("Calc.Touch", &(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        next_request(&mut peer).await;
        assert_eq!(client.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_with_stalled_writer() {
        // The peer never reads, so the first request blocks the writer.
        let (client, _peer) = connected_with_buffer(64);
        let blob = "x".repeat(4096);

        let blocked = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Big", &blob).await }
        });
        let queued = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Small", &()).await }
        });
        wait_pending(&client, 2).await;

        client.close();

        for call in [blocked, queued] {
            let err = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("call hung after close")
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, Error::ClientClosed), "{err}");
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_tear_requests() {
        let (client, mut peer) = connected_with_buffer(64);
        let blob = "x".repeat(4096);

        let abandoned = tokio::spawn({
            let client = client.clone();
            let blob = blob.clone();
            async move { client.call::<_, Reply>("Calc.Big", &blob).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        abandoned.abort();

        let next = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Reply>("Calc.Square", &json!({"x": 3})).await }
        });

        let big = next_request(&mut peer).await;
        assert_eq!(big.method, "Calc.Big");
        assert_eq!(big.param.unwrap().get().len(), blob.len() + 2);

        let square = next_request(&mut peer).await;
        assert_eq!(square.method, "Calc.Square");
        reply(&mut peer, json!({"id": square.id, "result": {"y": 9}, "error": ""})).await;
        assert_eq!(next.await.unwrap().unwrap(), Reply { y: 9 });
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_connect_within_times_out() {
        let err = connect_within(
            std::future::pending::<std::io::Result<()>>(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        let ok = connect_within(async { Ok::<_, std::io::Error>(7) }, None).await.unwrap();
        assert_eq!(ok, 7);
    }
}
