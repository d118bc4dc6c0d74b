//! Live event stream over WebSocket.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::adapters::event_hub::{ChannelSubscriber, SUBSCRIBER_BUFFER};

use super::AppState;

pub async fn events(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(state, socket))
}

async fn stream_events(state: Arc<AppState>, socket: WebSocket) {
    let (subscriber, mut frames) = ChannelSubscriber::pair(SUBSCRIBER_BUFFER);
    let id = state.hub.add(subscriber);
    let (mut sink, mut incoming) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Client messages are ignored; only closing matters.
    let mut reader = tokio::spawn(async move {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    state.hub.remove(id);
    debug!(subscriber = id, "websocket closed");
}
