//! TCP control server.
//!
//! One listener task accepts clients; every connection gets a reader loop
//! (frame decode, request dispatch) and a writer task. All outbound
//! traffic for a connection - responses, `pb-event` notifications and the
//! idle keep-alive - funnels through one channel into the writer task, so
//! frames never interleave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::PlayerEngine;
use crate::error::SpotihifiError;
use crate::events::PlayerObserver;
use crate::rpc::framing::{read_frame, write_frame};
use crate::rpc::handler::RpcHandler;
use crate::rpc::request::{error_response, notification, ok_response, parse_request, RpcError};

/// A connection with no outbound traffic for this long receives an empty
/// `{}` frame as a keep-alive.
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Bound TCP control server, not yet accepting.
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound local address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Propagates the socket query failure.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves clients until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the accept-loop failure; per-connection errors only drop
    /// that connection.
    pub async fn serve(
        self,
        engine: Arc<PlayerEngine>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "control server listening");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("control server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::info!(%peer, "client connected");
                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, engine, shutdown).await;
                    });
                }
            }
        }
    }
}

/// Observer that forwards player events to one connection's writer.
struct ClientObserver {
    outbound: mpsc::UnboundedSender<Value>,
}

impl PlayerObserver for ClientObserver {
    fn player_state_event(&self, event: Value) {
        // A closed channel just means the connection is going away; the
        // engine detaches us shortly after.
        let _ = self.outbound.send(notification("pb-event", event));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<PlayerEngine>,
    shutdown: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    let observer: Arc<dyn PlayerObserver> = Arc::new(ClientObserver {
        outbound: outbound.clone(),
    });
    engine.observer_attach(observer.clone());

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let handler = RpcHandler::new(engine.clone());

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(body) => {
                    let response = process_frame(&handler, &body).await;
                    if outbound.send(response).is_err() {
                        break;
                    }
                }
                Err(SpotihifiError::Protocol(message)) => {
                    // The stream is desynchronized after a bad length
                    // prefix; nothing to do but hang up.
                    tracing::error!(%peer, %message, "framing violation");
                    break;
                }
                Err(err) => {
                    tracing::error!(%peer, %err, "client receive error");
                    break;
                }
            }
        }
    }

    // Detach before closing the writer so no event lands on a dead
    // connection.
    engine.observer_detach(&observer);
    drop(outbound);
    let _ = writer_task.await;

    tracing::info!(%peer, "client disconnected");
}

/// Serializes all outbound frames for one connection and emits the idle
/// keep-alive when nothing has been sent for a while.
async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Value>) {
    loop {
        match tokio::time::timeout(IDLE_PING_INTERVAL, outbound.recv()).await {
            Ok(Some(message)) => {
                let body = match serde_json::to_vec(&message) {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::error!(%err, "failed to serialize outbound message");
                        continue;
                    }
                };
                if write_frame(&mut writer, &body).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(_elapsed) => {
                tracing::debug!("client connection idle");
                if write_frame(&mut writer, b"{}").await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn process_frame(handler: &RpcHandler, body: &[u8]) -> Value {
    let message: Value = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(err) => {
            tracing::info!(%err, "unparsable request body");
            return error_response(&Value::Null, &RpcError::invalid_request());
        }
    };

    match parse_request(message) {
        Ok(request) => match handler.call(&request.method, &request.params).await {
            Ok(result) => ok_response(&request.id, result),
            Err(error) => error_response(&request.id, &error),
        },
        Err((error, id)) => {
            tracing::info!(code = error.code, "invalid jsonrpc request");
            error_response(&id, &error)
        }
    }
}
