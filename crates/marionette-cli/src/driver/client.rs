//! JSON-RPC client over a pair of byte streams.
//!
//! One task owns the read side and feeds every inbound frame to the
//! [`Correlator`]. Another owns the write side: callers queue whole encoded
//! frames and the writer puts each one on the wire in full, even if the
//! caller that queued it has gone away. Ids come from a per-client counter
//! starting at 1, so concurrent calls never block each other: responses are
//! matched by id, not by arrival order.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use marionette_core::error::ClientError;
use marionette_core::framing::encode_frame;
use marionette_core::protocol::{
    methods, Incoming, Notification, Request, RequestId, Response, RpcError,
};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::correlator::Correlator;
use crate::driver::reader::{FrameReader, ReadOutcome};

/// How often the read loop wakes up to check whether it should stop.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the writer during `close()`.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One encoded frame waiting for the writer.
struct Outbound {
    frame: Vec<u8>,
    /// Told once the frame is flushed, or why it could not be.
    written: Option<oneshot::Sender<io::Result<()>>>,
}

type OutboundQueue = mpsc::UnboundedSender<Outbound>;

pub struct RpcClient {
    outbound: OutboundQueue,
    correlator: Arc<Correlator>,
    next_id: AtomicU64,
    default_timeout: Duration,
    stop_writer: Arc<Notify>,
    reader_task: JoinHandle<()>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Start a client over `reader` (peer output) and `writer` (peer input).
    ///
    /// Must be called from within a tokio runtime; the read and write loops
    /// are spawned immediately.
    pub fn new<R, W>(reader: R, writer: W, default_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let correlator = Arc::new(Correlator::new());
        let stop_writer = Arc::new(Notify::new());
        let (outbound, queue) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_loop(
            writer,
            queue,
            Arc::clone(&stop_writer),
            Arc::clone(&correlator),
        ));
        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(reader),
            Arc::clone(&correlator),
            outbound.clone(),
        ));

        Self {
            outbound,
            correlator,
            next_id: AtomicU64::new(1),
            default_timeout,
            stop_writer,
            reader_task,
            writer_task: Mutex::new(Some(writer_task)),
        }
    }

    /// Send a request and wait for its response with the default timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request and wait up to `wait` for its response.
    ///
    /// The deadline covers getting the frame onto the wire as well as the
    /// reply. A timeout fails only this call: the session stays usable and a
    /// late response for the abandoned id is discarded. Dropping the future
    /// early releases the pending slot the same way.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        wait: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let frame = encode_frame(&request).map_err(|source| ClientError::Encode {
            method: method.to_string(),
            source,
        })?;

        let rx = self.correlator.register(id)?;
        let _slot = PendingSlot {
            correlator: &self.correlator,
            id,
        };
        debug!("-> #{} {}", id, method);

        let (written_tx, written_rx) = oneshot::channel();
        self.enqueue(frame, Some(written_tx))?;

        let exchange = async {
            match written_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(ClientError::Transport(e)),
                Err(_) => return Err(ClientError::SessionClosed),
            }
            rx.await.map_err(|_| ClientError::SessionClosed)
        };

        match tokio::time::timeout(wait, exchange).await {
            Ok(Ok(Ok(result))) => {
                debug!("<- #{} ok", id);
                Ok(result)
            }
            Ok(Ok(Err(error))) => {
                debug!("<- #{} error {}", id, error.code);
                Err(ClientError::Remote {
                    method: method.to_string(),
                    error,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Request #{} ({}) timed out after {:?}", id, method, wait);
                Err(ClientError::Timeout {
                    id,
                    method: method.to_string(),
                    timeout: wait,
                })
            }
        }
    }

    /// Send a notification. Queues the frame and returns at once; nothing is
    /// registered and no response is awaited.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        if self.correlator.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        let frame = encode_frame(&Notification::new(method, params)).map_err(|source| {
            ClientError::Encode {
                method: method.to_string(),
                source,
            }
        })?;

        debug!("-> {}", method);
        self.enqueue(frame, None)
    }

    /// Observe notifications sent by the peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.correlator.subscribe()
    }

    #[allow(dead_code)]
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Whether the transport is gone, either closed locally or lost.
    pub fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    /// Stop the client. In-flight calls fail with `SessionClosed` and the
    /// peer's input is closed once the writer lets go of it.
    pub async fn close(&self) {
        let abandoned = self.correlator.close();
        if abandoned > 0 {
            info!("Closing client with {} calls in flight", abandoned);
        }
        self.reader_task.abort();
        self.stop_writer.notify_one();

        let writer_task = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = writer_task {
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("Writer busy, dropping peer input");
                task.abort();
            }
        }
    }

    fn enqueue(
        &self,
        frame: Vec<u8>,
        written: Option<oneshot::Sender<io::Result<()>>>,
    ) -> Result<(), ClientError> {
        self.outbound
            .send(Outbound { frame, written })
            .map_err(|_| ClientError::SessionClosed)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.correlator.close();
        self.reader_task.abort();
        let writer_task = self
            .writer_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = writer_task.take() {
            task.abort();
        }
    }
}

/// Releases a call's pending slot however the call ends. A no-op if the
/// response already claimed it.
struct PendingSlot<'a> {
    correlator: &'a Correlator,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.correlator.cancel(self.id) {
            debug!("Released pending slot for request #{}", self.id);
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    stop: Arc<Notify>,
    correlator: Arc<Correlator>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let outbound = tokio::select! {
            biased;
            _ = stop.notified() => break,
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        // Outside the select: a frame that has started always finishes.
        let result = write_frame(&mut writer, &outbound.frame).await;
        match result {
            Ok(()) => {
                if let Some(written) = outbound.written {
                    let _ = written.send(Ok(()));
                }
            }
            Err(e) => {
                error!("Failed to write to peer: {}", e);
                correlator.close();
                if let Some(written) = outbound.written {
                    let _ = written.send(Err(e));
                }
                return;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to close peer input: {}", e);
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_loop<R>(mut reader: FrameReader<R>, correlator: Arc<Correlator>, outbound: OutboundQueue)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_frame(READ_POLL_INTERVAL).await {
            Ok(ReadOutcome::Frame(frame)) => {
                handle_incoming(Incoming::classify(frame), &correlator, &outbound);
            }
            Ok(ReadOutcome::Timeout) => {
                if correlator.is_closed() {
                    break;
                }
            }
            Ok(ReadOutcome::Closed) => {
                info!("Peer closed its output stream");
                break;
            }
            Err(e) => {
                error!("Failed to read from peer: {}", e);
                break;
            }
        }
    }
    correlator.close();
}

fn handle_incoming(incoming: Incoming, correlator: &Correlator, outbound: &OutboundQueue) {
    match incoming {
        Incoming::Response { id, outcome } => {
            correlator.resolve(id, outcome);
        }
        Incoming::Notification(notification) => correlator.publish(notification),
        Incoming::PeerRequest { id, method, .. } => {
            answer_peer_request(id, &method, outbound);
        }
        Incoming::Anomaly { reason, frame } => {
            warn!("Ignoring frame from peer ({}): {}", reason, frame);
        }
    }
}

/// Peers may ask us things too. Only `ping` is supported; everything else
/// gets "method not found" so the peer is never left waiting.
fn answer_peer_request(id: Value, method: &str, outbound: &OutboundQueue) {
    let response = if method == methods::PING {
        Response::success(id, json!({}))
    } else {
        debug!("Rejecting peer request '{}'", method);
        Response::failure(id, RpcError::method_not_found(method))
    };

    let frame = match encode_frame(&response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to encode reply to peer request '{}': {}", method, e);
            return;
        }
    };
    if outbound
        .send(Outbound {
            frame,
            written: None,
        })
        .is_err()
    {
        warn!("Failed to answer peer request '{}': writer is gone", method);
    }
}

#[cfg(test)]
impl RpcClient {
    fn peek_next_id(&self) -> RequestId {
        self.next_id.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// The far end of the pipes, playing the peer.
    struct FakePeer {
        requests: FrameReader<DuplexStream>,
        output: DuplexStream,
    }

    impl FakePeer {
        async fn next_request(&mut self) -> Value {
            match timeout(TEST_TIMEOUT, self.requests.read_frame(TEST_TIMEOUT))
                .await
                .expect("Timed out waiting for request")
                .expect("Failed to read request")
            {
                ReadOutcome::Frame(frame) => frame,
                other => panic!("Expected a request frame, got {:?}", other),
            }
        }

        async fn send(&mut self, value: Value) {
            let frame = encode_frame(&value).expect("Failed to encode");
            self.output.write_all(&frame).await.expect("Failed to write");
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                .await;
        }
    }

    fn pair(default_timeout: Duration) -> (RpcClient, FakePeer) {
        pair_with_input_buffer(default_timeout, 64 * 1024)
    }

    /// Like `pair`, with a peer input pipe of only `capacity` bytes.
    fn pair_with_input_buffer(default_timeout: Duration, capacity: usize) -> (RpcClient, FakePeer) {
        let (client_in, peer_out) = duplex(64 * 1024);
        let (peer_in, client_out) = duplex(capacity);
        let client = RpcClient::new(client_in, client_out, default_timeout);
        let peer = FakePeer {
            requests: FrameReader::new(peer_in),
            output: peer_out,
        };
        (client, peer)
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (client, mut peer) = pair(TEST_TIMEOUT);
        assert_eq!(client.peek_next_id(), 1);

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let request = peer.next_request().await;
                let id = request["id"].clone();
                peer.reply(&id, json!({"id_seen": id})).await;
            }
            peer
        });

        let first = client.call("tools/list", None).await.expect("first call");
        let second = client.call("tools/list", None).await.expect("second call");
        assert_eq!(first["id_seen"], 1);
        assert_eq!(second["id_seen"], 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        let server = tokio::spawn(async move {
            let mut received = Vec::new();
            for _ in 0..3 {
                received.push(peer.next_request().await);
            }
            // Answer in reverse arrival order, echoing the params.
            for request in received.iter().rev() {
                peer.reply(&request["id"], json!({"echo": request["params"]}))
                    .await;
            }
            peer
        });

        let (a, b, c) = tokio::join!(
            client.call("tools/call", Some(json!({"n": "a"}))),
            client.call("tools/call", Some(json!({"n": "b"}))),
            client.call("tools/call", Some(json!({"n": "c"}))),
        );

        assert_eq!(a.expect("call a")["echo"]["n"], "a");
        assert_eq!(b.expect("call b")["echo"]["n"], "b");
        assert_eq!(c.expect("call c")["echo"]["n"], "c");
        assert_eq!(client.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_clears_slot() {
        let (client, _peer) = pair(Duration::from_millis(50));

        let err = timeout(TEST_TIMEOUT, client.call("tools/list", None))
            .await
            .expect("call should time out on its own")
            .unwrap_err();

        match err {
            ClientError::Timeout { id, method, .. } => {
                assert_eq!(id, 1);
                assert_eq!(method, "tools/list");
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed(), "a timeout must not end the session");
    }

    async fn wait_for_pending(client: &RpcClient, count: usize) {
        timeout(TEST_TIMEOUT, async {
            while client.pending_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending count never reached");
    }

    #[tokio::test]
    async fn test_abandoned_call_releases_its_slot() {
        let (client, _peer) = pair(TEST_TIMEOUT);
        let client = Arc::new(client);

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("tools/list", None).await })
        };
        wait_for_pending(&client, 1).await;

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_call_mid_write_keeps_frames_whole() {
        let (client, mut peer) = pair_with_input_buffer(TEST_TIMEOUT, 64);
        let client = Arc::new(client);
        let pad = "x".repeat(200);

        let caller = {
            let client = Arc::clone(&client);
            let params = json!({ "pad": pad.clone() });
            tokio::spawn(async move { client.call("first", Some(params)).await })
        };
        wait_for_pending(&client, 1).await;
        // Nobody reads yet, so the writer stalls part way into the frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();
        let _ = caller.await;
        assert_eq!(client.pending_count(), 0);

        client.notify("second", None).expect("notify");

        let first = peer.next_request().await;
        assert_eq!(first["id"], 1);
        assert_eq!(first["method"], "first");
        assert_eq!(first["params"]["pad"], pad.as_str());

        let second = peer.next_request().await;
        assert_eq!(second["method"], "second");
        assert!(second.get("id").is_none());
    }

    #[tokio::test]
    async fn test_timeout_covers_a_blocked_write() {
        let (client, _peer) = pair_with_input_buffer(TEST_TIMEOUT, 64);
        let params = json!({ "pad": "x".repeat(4096) });

        let err = timeout(
            TEST_TIMEOUT,
            client.call_with_timeout("stuck", Some(params), Duration::from_millis(100)),
        )
        .await
        .expect("call ignored its timeout while the pipe was full")
        .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { id: 1, .. }));
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_late_response_does_not_resolve_other_call() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        let abandoned = client
            .call_with_timeout("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(abandoned, ClientError::Timeout { id: 1, .. }));
        let first = peer.next_request().await;
        assert_eq!(first["method"], "slow");

        let server = tokio::spawn(async move {
            let second = peer.next_request().await;
            assert_eq!(second["id"], 2);
            peer.reply(&json!(1), json!("late")).await;
            peer.reply(&json!(2), json!("fresh")).await;
            peer
        });

        let result = client.call("fast", None).await.expect("second call");
        assert_eq!(result, json!("fresh"));
        assert_eq!(client.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_is_remote_error() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        let server = tokio::spawn(async move {
            let request = peer.next_request().await;
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "Invalid params"}
            }))
            .await;
            peer
        });

        let err = client.call("tools/call", None).await.unwrap_err();
        match err {
            ClientError::Remote { method, error } => {
                assert_eq!(method, "tools/call");
                assert_eq!(error.code, -32602);
            }
            other => panic!("Expected Remote, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_registers_nothing() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        for _ in 0..5 {
            client
                .notify(methods::INITIALIZED, None)
                .expect("notify");
        }
        assert_eq!(client.pending_count(), 0);

        for _ in 0..5 {
            let frame = peer.next_request().await;
            assert_eq!(frame["method"], "notifications/initialized");
            assert!(frame.get("id").is_none());
        }
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_call() {
        let (client, _peer) = pair(TEST_TIMEOUT);
        let client = Arc::new(client);

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("tools/list", None).await })
        };

        timeout(TEST_TIMEOUT, async {
            while client.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("call never became pending");

        client.close().await;

        let result = timeout(TEST_TIMEOUT, caller)
            .await
            .expect("in-flight call hung after close")
            .unwrap();
        assert!(matches!(result, Err(ClientError::SessionClosed)));
        assert!(matches!(
            client.call("tools/list", None).await,
            Err(ClientError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_eof_closes_session() {
        let (client, peer) = pair(TEST_TIMEOUT);
        let client = Arc::new(client);

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("tools/list", None).await })
        };
        drop(peer);

        let result = timeout(TEST_TIMEOUT, caller)
            .await
            .expect("call hung after peer exit")
            .unwrap();
        assert!(result.unwrap_err().is_fatal());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        peer.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}))
            .await;
        let reply = peer.next_request().await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "id": "srv-1", "result": {}}));

        peer.send(json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"}))
            .await;
        let reply = peer.next_request().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], RpcError::METHOD_NOT_FOUND);

        drop(client);
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let (client, mut peer) = pair(TEST_TIMEOUT);
        let mut notes = client.subscribe();

        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info", "data": "attached"}
        }))
        .await;

        let note = timeout(TEST_TIMEOUT, notes.recv())
            .await
            .expect("notification never arrived")
            .unwrap();
        assert_eq!(note.method, "notifications/message");
        assert_eq!(note.params.unwrap()["data"], "attached");
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_disturb_calls() {
        let (client, mut peer) = pair(TEST_TIMEOUT);

        let server = tokio::spawn(async move {
            let request = peer.next_request().await;
            peer.output
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\n")
                .await
                .unwrap();
            peer.reply(&request["id"], json!("ok")).await;
            peer
        });

        assert_eq!(client.call("tools/list", None).await.unwrap(), json!("ok"));
        server.await.unwrap();
    }
}
