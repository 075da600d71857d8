//! Backend RPC wire format
//!
//! Frames are JSON documents carried in a 4-byte big-endian length-delimited
//! stream. Every frame carries a `request_id` chosen by the caller; responses
//! echo it so many calls can share one channel.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use gamegate_core::error::{Result, RpcError};
use gamegate_core::types::{RpcRequest, RpcResponse};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest backend frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// What a request frame asks of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Unary,
    StreamOpen,
    StreamData,
    StreamClose,
    /// Liveness probe; answered with an empty OK response
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: u64,
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RpcRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub response: RpcResponse,
    #[serde(default)]
    pub end_of_stream: bool,
}

/// Length-delimited framing shared by both ends of a backend channel.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec();
    Framed::new(io, codec)
}

pub fn encode<M: Serialize>(message: &M) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| RpcError::protocol(format!("encode failed: {}", e)).into())
}

pub fn decode<'a, M: Deserialize<'a>>(frame: &'a [u8]) -> Result<M> {
    serde_json::from_slice(frame)
        .map_err(|e| RpcError::protocol(format!("decode failed: {}", e)).into())
}

/// Writes one frame.
pub async fn write_frame<T, M>(framed: &mut Framed<T, LengthDelimitedCodec>, message: &M) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = encode(message)?;
    framed
        .send(bytes)
        .await
        .map_err(|e| RpcError::protocol(format!("write failed: {}", e)).into())
}

/// Reads one frame; `Ok(None)` on clean end of stream.
pub async fn read_frame<T, M>(framed: &mut Framed<T, LengthDelimitedCodec>) -> Result<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: for<'de> Deserialize<'de>,
{
    match framed.next().await {
        None => Ok(None),
        Some(Ok(buf)) => decode(&buf).map(Some),
        Some(Err(e)) => Err(RpcError::protocol(format!("read failed: {}", e)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = framed(a);
        let mut server = framed(b);

        let request = RequestFrame {
            request_id: 7,
            kind: FrameKind::Unary,
            request: Some(RpcRequest::new("logic", "Move", Bytes::from_static(b"xy"))),
        };
        write_frame(&mut client, &request).await.unwrap();
        let got: RequestFrame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got, request);

        let response = ResponseFrame {
            request_id: 7,
            response: RpcResponse::ok(Bytes::from_static(b"done")),
            end_of_stream: false,
        };
        write_frame(&mut server, &response).await.unwrap();
        let got: ResponseFrame = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(got.response.payload, Bytes::from_static(b"done"));

        drop(server);
        let end: Option<ResponseFrame> = read_frame(&mut client).await.unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_ping_frame_omits_request() {
        let ping = RequestFrame {
            request_id: 1,
            kind: FrameKind::Ping,
            request: None,
        };
        let json = String::from_utf8(encode(&ping).unwrap().to_vec()).unwrap();
        assert_eq!(json, r#"{"request_id":1,"kind":"ping"}"#);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let result: Result<ResponseFrame> = decode(b"not json");
        assert!(result.is_err());
    }
}
