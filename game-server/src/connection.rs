//! One WebSocket, two tasks: a reader that routes frames into the handlers
//! and a writer that drains the connection's bounded outbound channel. When
//! either task ends, the other is aborted and the connection is finalized.

use crate::handlers;
use crate::registry::OutboundFrame;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ErrorCode, ErrorContext, OutgoingMessage, OUTBOUND_BUFFER_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A transport write exceeding this deadline ends the connection.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives one accepted socket from registration to cleanup.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
    let client_id = {
        let mut registry = state.registry.lock().await;
        registry.register(outbound_tx, Instant::now())
    };
    tracing::info!(client_id, "client connected");

    let mut send_task = tokio::spawn(write_loop(sender, outbound_rx));
    let reader_state = state.clone();
    let reader_client = client_id.clone();
    let mut receive_task =
        tokio::spawn(async move { read_loop(receiver, reader_state, reader_client).await });

    // If any one of the tasks runs to completion, we abort the other.
    let result = tokio::select! {
        res_a = &mut send_task => { receive_task.abort(); res_a }
        res_b = &mut receive_task => { send_task.abort(); res_b }
    };
    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "connection task panicked");
        "internal connection failure"
    });

    handlers::finalize_disconnect(&state, &client_id).await;
    tracing::info!(client_id, reason, "client connection ended");
}

/// Reads frames until the socket closes. Text frames go through the codec
/// and the router; anything else only refreshes the activity clock.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    client_id: String,
) -> &'static str {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handlers::handle_frame(&state, &client_id, text.as_str()).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                let mut registry = state.registry.lock().await;
                registry.touch(&client_id, Instant::now());
            }
            Ok(Message::Binary(_)) => {
                // The wire format is JSON text frames only.
                let reply = OutgoingMessage::error(
                    ErrorCode::InvalidInput,
                    "binary frames are not part of the protocol",
                    ErrorContext::default(),
                );
                let mut registry = state.registry.lock().await;
                registry.send_to(&client_id, reply.encode_for(&client_id));
            }
            Ok(Message::Close(_)) => return "client closed the connection",
            Err(_) => return "connection lost",
        }
    }
    "connection lost"
}

/// Drains the outbound channel into the socket. Each write runs under the
/// send timeout so one stuck client never backs up the rest of the server.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) -> &'static str {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            OutboundFrame::Message(text) => Message::Text(text.into()),
            OutboundFrame::Ping => Message::Ping(Bytes::new()),
            OutboundFrame::Close => {
                let _ = sender.send(Message::Close(None)).await;
                return "server closed the connection";
            }
        };
        match tokio::time::timeout(SEND_TIMEOUT, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(?err, "write to client failed");
                return "connection lost";
            }
            Err(_) => {
                tracing::warn!("write to client timed out");
                return "send timed out";
            }
        }
    }
    // The registry dropped the sender, typically through a purge.
    let _ = sender.send(Message::Close(None)).await;
    "connection expired"
}
