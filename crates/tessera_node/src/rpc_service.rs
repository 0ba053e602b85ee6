//! Server side of the node RPC protocol.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use tessera_coord::{CoordError, Request, RequestHandler, Response};

use crate::transport::frame_codec;

/// Accept connections until the listener fails; each connection is served on
/// its own task.
pub async fn run(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, handler).await {
                tracing::debug!(peer = %peer, error = ?err, "rpc connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, frame_codec());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => {
                // A client that gives up closes the connection; drop the
                // in-flight call with it so queued lock requests are abandoned.
                let handled = tokio::select! {
                    response = handler.handle(request) => Some(response),
                    _ = closed(&mut framed) => None,
                };
                match handled {
                    Some(response) => response,
                    None => return Ok(()),
                }
            }
            Err(err) => Response::Error(CoordError::Protocol(format!("decode request: {err}"))),
        };
        let payload = serde_json::to_vec(&response)?;
        framed.send(Bytes::from(payload)).await?;
    }
    Ok(())
}

/// Resolves once the peer closes its side. Clients send exactly one frame per
/// request, so any further read result means the caller is gone.
async fn closed(framed: &mut Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>) {
    let _ = framed.next().await;
}
