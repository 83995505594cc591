//! WebSocket endpoint: one receive loop and one writer task per socket.

use std::fmt::Display;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use uniscan_proto::ServerMessage;

use super::{Gateway, OUTBOUND_CAPACITY};
use crate::registry::ConnId;

pub async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let mut conn = gateway.open_connection(tx);
    let conn_id = conn.conn_id;
    debug!(conn_id, "Connection opened");

    let writer = tokio::spawn(pump_outbound(sink, rx, conn_id));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => gateway.handle_text(&mut conn, text.as_str()).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => gateway.handle_text(&mut conn, text).await,
                Err(_) => debug!(conn_id, "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    gateway.on_disconnect(&conn).await;
    drop(conn);
    writer.abort();
}

/// Write queued frames to `sink` until the queue closes or a send fails,
/// then close the sink. Returns the number of frames written.
async fn pump_outbound<S>(mut sink: S, mut rx: mpsc::Receiver<ServerMessage>, conn_id: ConnId) -> usize
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut written = 0;
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(msg.to_json().into())).await {
            debug!(conn_id, error = %e, "WebSocket send failed, stopping writer");
            break;
        }
        written += 1;
    }
    if let Err(e) = sink.close().await {
        debug!(conn_id, error = %e, "WebSocket close failed");
    }
    written
}
