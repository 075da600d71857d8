//! Backend side of the RPC wire format
//!
//! Game backends implement [`RpcService`]; [`serve`] accepts gateway channels
//! and answers their frames. Used by the bundled echo backend and in tests.

use crate::wire::{self, FrameKind, RequestFrame, ResponseFrame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gamegate_core::error::Result;
use gamegate_core::types::{RpcRequest, RpcResponse};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A backend service reachable over RPC channels.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn call(&self, request: RpcRequest) -> RpcResponse;

    /// Replies to one request of an open stream. Defaults to a single unary reply.
    async fn stream(&self, request: RpcRequest) -> Vec<RpcResponse> {
        vec![self.call(request).await]
    }
}

/// Accepts channels until `cancel` fires.
pub async fn serve<S: RpcService>(
    listener: TcpListener,
    service: Arc<S>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "RPC backend listening");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Gateway channel accepted");
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(stream, Arc::clone(&service), cancel.child_token()));
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
    Ok(())
}

/// Answers frames from one channel until it closes or `cancel` fires.
///
/// Unary calls run concurrently; stream frames are handled in arrival order so
/// replies keep their sequence.
pub async fn serve_connection<S, T>(io: T, service: Arc<S>, cancel: CancellationToken)
where
    S: RpcService,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut sink, mut stream) = wire::framed(io).split();
    let (replies, replies_rx) = flume::unbounded::<ResponseFrame>();

    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = replies_rx.recv_async() => match frame {
                        Ok(frame) => frame,
                        Err(_) => break,
                    },
                };
                let bytes = match wire::encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable reply");
                        continue;
                    }
                };
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let buf = match next {
            Some(Ok(buf)) => buf,
            Some(Err(e)) => {
                debug!(error = %e, "Channel read failed");
                break;
            }
            None => break,
        };
        let frame: RequestFrame = match wire::decode(&buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Malformed gateway frame");
                break;
            }
        };

        let id = frame.request_id;
        match (frame.kind, frame.request) {
            (FrameKind::Ping, _) => {
                let _ = replies.send(reply(id, RpcResponse::ok(bytes::Bytes::new()), false));
            }
            (FrameKind::Unary, Some(request)) => {
                let service = Arc::clone(&service);
                let replies = replies.clone();
                tokio::spawn(async move {
                    let response = service.call(request).await;
                    let _ = replies.send(reply(id, response, false));
                });
            }
            (FrameKind::StreamOpen | FrameKind::StreamData, Some(request)) => {
                for response in service.stream(request).await {
                    let _ = replies.send(reply(id, response, false));
                }
            }
            (FrameKind::StreamClose, _) => {
                let _ = replies.send(reply(id, RpcResponse::ok(bytes::Bytes::new()), true));
            }
            (kind, None) => {
                let _ = replies.send(reply(
                    id,
                    RpcResponse::error(400, format!("{:?} frame without request", kind)),
                    false,
                ));
            }
        }
    }

    // peer is gone; stop the writer
    cancel.cancel();
    let _ = writer.await;
}

fn reply(request_id: u64, response: RpcResponse, end_of_stream: bool) -> ResponseFrame {
    ResponseFrame {
        request_id,
        response,
        end_of_stream,
    }
}
