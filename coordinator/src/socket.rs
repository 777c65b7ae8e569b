//! Puente entre un WebSocket de axum y el coordinador.
//!
//! Cada socket tiene una tarea escritora que drena su canal de salida y un
//! loop lector que le reenvía los frames al actor. Cuando el lector termina
//! se avisa `SocketClosed` y se corta el escritor.

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::actor::{ConnId, CoordinatorHandle, Inbound, Outbound};

pub async fn serve_socket(
    socket: WebSocket,
    conn: ConnId,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    handle: CoordinatorHandle,
) {
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let (msg, last) = match out {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Binary(bytes) => (Message::Binary(bytes), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(reason),
                    })),
                    true,
                ),
            };
            if sink.send(msg).await.is_err() || last {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let inbound = match frame {
            Ok(Message::Text(text)) => Inbound::Text(text),
            Ok(Message::Binary(bytes)) => Inbound::Binary(bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("error de lectura en el socket {}: {}", conn, e);
                break;
            }
        };
        if handle.socket_message(conn, inbound).await.is_err() {
            break;
        }
    }

    if let Err(e) = handle.socket_closed(conn).await {
        warn!("no se pudo avisar el cierre de {}: {}", conn, e);
    }
    writer.abort();
}
