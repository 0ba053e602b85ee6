//! TCP transport: one length-delimited frame per request and per response,
//! each carrying a serde_json encoded message.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use tessera_coord::{CoordError, CoordResult, DatabaseId, Request, Response, Transport};

/// Upper bound for a single frame; catalog snapshots are the largest messages.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec shared by the client and the RPC server.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Client side of the node RPC protocol. Every call opens its own connection,
/// so a slow call (e.g. a queued lock request) never blocks unrelated ones.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    rpc_timeout: Duration,
}

impl TcpTransport {
    /// `rpc_timeout` bounds connect, send and receive of one call together.
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            rpc_timeout: rpc_timeout.max(Duration::from_millis(1)),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    async fn exchange(&self, target: &DatabaseId, request: &Request) -> anyhow::Result<Response> {
        let stream = TcpStream::connect(target.address())
            .await
            .with_context(|| format!("connect to {}", target.address()))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let mut framed = Framed::new(stream, frame_codec());

        let payload = serde_json::to_vec(request).context("encode request")?;
        framed
            .send(Bytes::from(payload))
            .await
            .context("send request")?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed before response"))?
            .context("read response")?;
        serde_json::from_slice(&frame).context("decode response")
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, target: &DatabaseId, request: Request) -> CoordResult<Response> {
        match tokio::time::timeout(self.rpc_timeout, self.exchange(target, &request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                tracing::debug!(target_node = %target, error = ?err, "rpc failed");
                Err(CoordError::unreachable(target, format!("{err:#}")))
            }
            Err(_) => {
                tracing::debug!(target_node = %target, timeout_ms = self.rpc_timeout.as_millis() as u64, "rpc timed out");
                Err(CoordError::unreachable(target, "rpc timed out"))
            }
        }
    }
}
