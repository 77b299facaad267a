//! Upgrades HTTP requests to WebSocket connections and authenticates them.

use super::{client::run_connection, error::WsError, protocol::OutboundMessage};
use crate::{metrics::record_error, state::AppState};
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::Response,
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};

/// How long a rejected handshake may take to say why before the socket drops.
const REJECT_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Deserialize, Debug, Default)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Reads the credential from `Authorization: Bearer ..`, falling back to the
/// `token` query parameter.
fn credential(headers: &HeaderMap, query: &WsQuery) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or(query.token.as_deref())
        .unwrap_or_default()
        .to_string()
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
///
/// The identity is validated before any connection task exists. A rejected
/// client still gets the upgrade so it can read one error frame.
#[instrument(name = "ws_handshake", skip_all)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let max_frame = state.config.connection.max_frame_bytes;
    let ws = ws.max_message_size(max_frame).max_frame_size(max_frame);

    match state.identity.validate(&credential(&headers, &query)) {
        Ok(identity) => {
            info!(user_id = %identity.user_id, "handshake accepted");
            ws.on_upgrade(move |socket| run_connection(socket, state, identity))
        }
        Err(e) => {
            let err = WsError::from(e);
            warn!(error = %err, "handshake rejected");
            record_error(err.category());
            ws.on_upgrade(move |socket| reject(socket, err))
        }
    }
}

async fn reject(mut socket: WebSocket, err: WsError) {
    let report = OutboundMessage::error(err.to_string());
    let goodbye = async {
        socket.send(Message::Text(report.to_json().into())).await?;
        socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "unauthorized".into(),
            })))
            .await
    };
    match tokio::time::timeout(REJECT_DEADLINE, goodbye).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to report handshake rejection"),
        Err(_) => warn!("handshake rejection timed out"),
    }
}
