//! Websocket transport.
//!
//! One reader loop and one writer task per socket. The writer drains the
//! connection's outbound queue; the reader parses frames, applies the
//! per-connection rate limit and hands events to the hub in order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_shared::protocol::{ClientEvent, ServerEvent};
use courier_shared::types::{ConnectionId, UserId};

use crate::api::AppState;
use crate::error::{lookup_failed, ServerError};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let verified_user = match resolve_token(&state, params.token.as_deref()).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, verified_user))
}

/// Map the query token to a user. An unknown or missing token is only
/// tolerated in unverified mode.
async fn resolve_token(state: &AppState, token: Option<&str>) -> Result<Option<UserId>, ServerError> {
    let user = match token {
        Some(token) if !token.is_empty() => state
            .sessions
            .current_user_id(token)
            .await
            .map_err(lookup_failed)?,
        _ => None,
    };

    match user {
        Some(user) => Ok(Some(user)),
        None if state.config.allow_unverified_auth => Ok(None),
        None => Err(ServerError::Unauthenticated("unknown session token".into())),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, verified_user: Option<UserId>) {
    let (conn, outbound) = state.hub.open_connection(verified_user).await;
    debug!(conn = %conn.short(), user = ?verified_user, "Socket opened");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, conn));

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        on_text(&state, conn, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state
                            .hub
                            .send_error(conn, &ServerError::Malformed("binary frames are not supported".into()))
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn = %conn.short(), error = %e, "Socket read error");
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    state.hub.close_connection(conn).await;
    state.event_limiter.forget(&conn).await;
    writer.abort();
}

async fn on_text(state: &AppState, conn: ConnectionId, text: &str) {
    if !state.event_limiter.check(conn).await {
        warn!(conn = %conn.short(), "Event rate limit exceeded");
        state.hub.send_error(conn, &ServerError::RateLimited).await;
        return;
    }

    match ClientEvent::parse(text) {
        Ok(event) => state.hub.handle_event(conn, event).await,
        Err(e) => {
            debug!(conn = %conn.short(), error = %e, "Malformed event");
            state.hub.send_error(conn, &ServerError::from(e)).await;
        }
    }
}

/// Ends when the queue closes (connection dropped by the hub) or the
/// socket refuses a write.
async fn write_loop<S>(mut sink: S, mut outbound: mpsc::Receiver<ServerEvent>, conn: ConnectionId)
where
    S: futures::Sink<Message> + Unpin,
{
    while let Some(event) = outbound.recv().await {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %conn.short(), error = %e, "Failed to encode event");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
