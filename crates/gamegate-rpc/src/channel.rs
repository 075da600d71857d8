//! Backend channels
//!
//! An [`RpcChannel`] is one long-lived, multiplexed connection to a backend
//! address. Many calls share it concurrently; replies are matched to callers
//! by request id. [`ChannelConnector`] creates channels and is the seam the
//! pool is generic over, so tests can substitute in-process backends.

use crate::wire::{self, FrameKind, RequestFrame, ResponseFrame};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use gamegate_core::error::{GatewayError, Result, RpcError};
use gamegate_core::types::{RpcRequest, RpcResponse};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Frames buffered per channel before callers wait for the writer
const OUTBOUND_CAPACITY: usize = 1024;
/// Responses buffered per open stream
const STREAM_CAPACITY: usize = 256;

/// A multiplexed channel to one backend address.
#[async_trait]
pub trait RpcChannel: Send + Sync + 'static {
    /// Backend address this channel is connected to.
    fn address(&self) -> &str;

    /// Unary request/response call.
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse>;

    /// Opens a bidirectional stream. `first` opens the stream; every request
    /// received from `requests` is forwarded until that channel closes, which
    /// half-closes the stream.
    async fn call_stream(
        &self,
        first: RpcRequest,
        requests: flume::Receiver<RpcRequest>,
    ) -> Result<RpcStream>;

    /// Liveness probe.
    async fn probe(&self) -> Result<()>;

    /// True once the underlying transport has failed or been closed.
    fn is_closed(&self) -> bool;

    /// Closes the channel; in-flight calls fail with `ChannelUnavailable`.
    fn close(&self);
}

/// Creates channels to backend addresses.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    type Channel: RpcChannel;

    async fn connect(&self, address: &str) -> Result<Self::Channel>;
}

/// Responses of a bidirectional stream, in arrival order.
pub struct RpcStream {
    rx: flume::Receiver<Result<RpcResponse>>,
}

impl RpcStream {
    pub fn new(rx: flume::Receiver<Result<RpcResponse>>) -> Self {
        Self { rx }
    }

    /// Next response, or `None` once the backend ended the stream.
    pub async fn next(&mut self) -> Option<Result<RpcResponse>> {
        self.rx.recv_async().await.ok()
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Result<RpcResponse>> {
        self.rx.into_stream()
    }
}

enum PendingReply {
    Unary(oneshot::Sender<RpcResponse>),
    Stream(flume::Sender<Result<RpcResponse>>),
}

type PendingMap = Arc<DashMap<u64, PendingReply>>;

/// Removes a pending entry when the waiting caller goes away.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Channel speaking the length-delimited JSON wire format over any byte stream.
pub struct FramedChannel {
    address: String,
    outbound: flume::Sender<RequestFrame>,
    pending: PendingMap,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl FramedChannel {
    /// Wraps an established byte stream and spawns its reader and writer tasks.
    pub fn from_io<T>(address: impl Into<String>, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let address = address.into();
        let (sink, mut stream) = wire::framed(io).split();
        let (outbound, outbound_rx) = flume::bounded::<RequestFrame>(OUTBOUND_CAPACITY);
        let pending: PendingMap = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        // writer
        {
            let cancel = cancel.clone();
            let address = address.clone();
            let mut sink = sink;
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = outbound_rx.recv_async() => match frame {
                            Ok(frame) => frame,
                            Err(_) => break,
                        },
                    };
                    let bytes = match wire::encode(&frame) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(address = %address, error = %e, "Dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(bytes).await {
                        debug!(address = %address, error = %e, "Channel write failed");
                        break;
                    }
                }
                cancel.cancel();
                let _ = sink.close().await;
            });
        }

        // reader
        {
            let cancel = cancel.clone();
            let pending = Arc::clone(&pending);
            let address = address.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = stream.next() => frame,
                    };
                    let buf = match frame {
                        Some(Ok(buf)) => buf,
                        Some(Err(e)) => {
                            debug!(address = %address, error = %e, "Channel read failed");
                            break;
                        }
                        None => {
                            debug!(address = %address, "Backend closed channel");
                            break;
                        }
                    };
                    let frame: ResponseFrame = match wire::decode(&buf) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(address = %address, error = %e, "Malformed backend frame");
                            break;
                        }
                    };
                    Self::deliver(&pending, frame);
                }
                cancel.cancel();
                // fail everyone still waiting: unary senders drop, streams get an error
                let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
                for id in ids {
                    if let Some((_, PendingReply::Stream(tx))) = pending.remove(&id) {
                        let _ = tx.try_send(Err(RpcError::unavailable(address.clone()).into()));
                    }
                }
            });
        }

        Self {
            address,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    fn deliver(pending: &PendingMap, frame: ResponseFrame) {
        let id = frame.request_id;
        match pending.get(&id).as_deref() {
            None => {
                trace!(request_id = id, "Reply for abandoned request");
                return;
            }
            Some(PendingReply::Stream(tx)) if !frame.end_of_stream => {
                let _ = tx.try_send(Ok(frame.response));
                return;
            }
            Some(_) => {}
        }

        // removing an ended stream drops its sender, which ends the receiver
        if let Some((_, PendingReply::Unary(tx))) = pending.remove(&id) {
            let _ = tx.send(frame.response);
        }
    }

    fn unavailable(&self) -> GatewayError {
        RpcError::unavailable(self.address.clone()).into()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: RequestFrame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.unavailable());
        }
        self.outbound
            .send_async(frame)
            .await
            .map_err(|_| self.unavailable())
    }

    async fn unary(&self, kind: FrameKind, request: Option<RpcRequest>) -> Result<RpcResponse> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingReply::Unary(tx));
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        self.send_frame(RequestFrame {
            request_id: id,
            kind,
            request,
        })
        .await?;

        tokio::select! {
            reply = rx => reply.map_err(|_| self.unavailable()),
            _ = self.cancel.cancelled() => Err(self.unavailable()),
        }
    }
}

#[async_trait]
impl RpcChannel for FramedChannel {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.unary(FrameKind::Unary, Some(request)).await
    }

    async fn call_stream(
        &self,
        first: RpcRequest,
        requests: flume::Receiver<RpcRequest>,
    ) -> Result<RpcStream> {
        let id = self.next_request_id();
        let (tx, rx) = flume::bounded(STREAM_CAPACITY);
        self.pending.insert(id, PendingReply::Stream(tx));

        if let Err(e) = self
            .send_frame(RequestFrame {
                request_id: id,
                kind: FrameKind::StreamOpen,
                request: Some(first),
            })
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        let outbound = self.outbound.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = requests.recv_async() => next,
                };
                let frame = match next {
                    Ok(request) => RequestFrame {
                        request_id: id,
                        kind: FrameKind::StreamData,
                        request: Some(request),
                    },
                    Err(_) => RequestFrame {
                        request_id: id,
                        kind: FrameKind::StreamClose,
                        request: None,
                    },
                };
                let closing = frame.kind == FrameKind::StreamClose;
                if outbound.send_async(frame).await.is_err() || closing {
                    return;
                }
            }
        });

        Ok(RpcStream::new(rx))
    }

    async fn probe(&self) -> Result<()> {
        let reply = self.unary(FrameKind::Ping, None).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(RpcError::Backend {
                target: self.address.clone(),
                code: reply.code,
                message: reply.message,
            }
            .into())
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connects [`FramedChannel`]s over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ChannelConnector for TcpConnector {
    type Channel = FramedChannel;

    async fn connect(&self, address: &str) -> Result<FramedChannel> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RpcError::connect_failed(address, "connect timed out"))?
            .map_err(|e| RpcError::connect_failed(address, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::connect_failed(address, e.to_string()))?;

        debug!(address = %address, "Backend channel connected");
        Ok(FramedChannel::from_io(address, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{serve_connection, RpcService};
    use bytes::Bytes;

    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        async fn call(&self, request: RpcRequest) -> RpcResponse {
            if request.method_name == "Slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            RpcResponse::ok(request.payload)
        }
    }

    fn pair() -> (FramedChannel, CancellationToken) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        tokio::spawn(serve_connection(server, Arc::new(Echo), cancel.clone()));
        (FramedChannel::from_io("duplex", client), cancel)
    }

    #[tokio::test]
    async fn test_unary_call() {
        let (channel, _server) = pair();
        let reply = channel
            .call(RpcRequest::new("logic", "Echo", Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.payload, Bytes::from_static(b"hello"));
        assert!(channel.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_multiplexed() {
        let (channel, _server) = pair();
        let channel = Arc::new(channel);

        let slow = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .call(RpcRequest::new("logic", "Slow", Bytes::from_static(b"slow")))
                    .await
            })
        };
        let fast = channel
            .call(RpcRequest::new("logic", "Fast", Bytes::from_static(b"fast")))
            .await
            .unwrap();
        assert_eq!(fast.payload, Bytes::from_static(b"fast"));
        assert_eq!(slow.await.unwrap().unwrap().payload, Bytes::from_static(b"slow"));
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (channel, _server) = pair();
        let (tx, rx) = flume::unbounded();
        let mut stream = channel
            .call_stream(RpcRequest::new("chat", "Room", Bytes::from_static(b"open")), rx)
            .await
            .unwrap();

        tx.send(RpcRequest::new("chat", "Room", Bytes::from_static(b"one")))
            .unwrap();
        tx.send(RpcRequest::new("chat", "Room", Bytes::from_static(b"two")))
            .unwrap();
        drop(tx);

        let mut payloads = Vec::new();
        while let Some(reply) = stream.next().await {
            payloads.push(reply.unwrap().payload);
        }
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"open"),
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
            ]
        );
    }

    #[tokio::test]
    async fn test_calls_fail_after_backend_goes_away() {
        let (channel, server) = pair();
        assert!(channel.probe().await.is_ok());
        server.cancel();

        let err = channel
            .call(RpcRequest::new("logic", "Echo", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Rpc(RpcError::ChannelUnavailable { .. })
        ));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = TcpConnector::new(Duration::from_millis(200));
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connector.connect(&addr).await;
        assert!(matches!(
            result,
            Err(GatewayError::Rpc(RpcError::ConnectFailed { .. }))
        ));
    }
}
