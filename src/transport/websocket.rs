use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::sync::Arc;

use crate::transport::handler::{AppState, Session, handle_client_message};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{BusError, Result};

pub async fn start_websocket_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BusError::Transport(format!("cannot bind {addr}: {e}")))?;

    info!("WebSocket server listening on ws://{}", addr);

    while let Ok((stream, peer)) = listener.accept().await {
        let state = state.clone();
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        debug!("Accepted {} from {}", connection_id, peer);

        tokio::spawn(async move {
            handle_connection(stream, state, connection_id).await;
        });
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>, connection_id: String) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_id = connection_id.clone();
    let send_loop = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Failed to send message to {}: {}", send_id, e);
                break;
            }
        }
        debug!("Send loop closed for {}", send_id);
    });

    let mut session = Session::default();
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };

        let response = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => handle_client_message(&state, &mut session, request).await,
            Err(err) => {
                warn!("Invalid client message from {}: {} | {}", connection_id, err, text);
                ServerMessage::bad_request(err)
            }
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode response for {}: {}", connection_id, e);
                continue;
            }
        };
        if tx.send(WsMessage::text(encoded)).is_err() {
            break;
        }
    }

    info!("{} disconnected", connection_id);

    // Messages still locked to this connection go back to the queue.
    session.release_all(&state).await;
    drop(tx);
    let _ = send_loop.await;
}
