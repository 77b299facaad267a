//! Frame Router
//!
//! Classifies inbound frames and hands them to the handler registered for
//! their kind. Binary frames are raw audio and skip envelope parsing; text
//! frames are `{type, body}` envelopes routed by `type`.

use super::{
    error::WsError,
    hub::{ClientId, Hub},
    protocol::{InboundEnvelope, OutboundMessage, OutboundType, SpeechCommand, SpeechResult},
};
use crate::speech::{Readiness, SessionManager};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One inbound frame as read from the socket.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Key of the handler table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Binary,
    Envelope(String),
}

/// What a handler receives: raw audio, or the raw JSON body of an envelope.
#[derive(Debug)]
pub enum Payload {
    Audio(Bytes),
    Body(String),
}

/// Per-frame context: who sent it and the trace id it is logged under.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub client_id: ClientId,
    pub user_id: String,
    pub trace_id: Uuid,
}

#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, ctx: &FrameContext, payload: Payload) -> Result<(), WsError>;
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<FrameKind, Arc<dyn FrameHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handler table used by the server.
    pub fn with_defaults(sessions: SessionManager, hub: Hub, init_timeout: Duration) -> Self {
        Self::new()
            .register(
                FrameKind::Binary,
                AudioHandler {
                    sessions: sessions.clone(),
                },
            )
            .register(
                FrameKind::Envelope("speech".to_string()),
                SpeechHandler {
                    sessions,
                    hub: hub.clone(),
                    init_timeout,
                },
            )
            .register(
                FrameKind::Envelope("heartbeat".to_string()),
                HeartbeatHandler { hub },
            )
    }

    pub fn register(mut self, kind: FrameKind, handler: impl FrameHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub async fn dispatch(&self, ctx: &FrameContext, frame: Frame) -> Result<(), WsError> {
        let (kind, payload) = match frame {
            Frame::Binary(audio) => (FrameKind::Binary, Payload::Audio(audio)),
            Frame::Text(text) => {
                let envelope = InboundEnvelope::parse(&text)
                    .map_err(|e| WsError::ProtocolViolation(format!("malformed envelope: {e}")))?;
                let body = envelope.body_str().to_string();
                (FrameKind::Envelope(envelope.kind), Payload::Body(body))
            }
        };

        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(ctx, payload).await,
            None => {
                warn!(?kind, "no handler for frame kind, dropping");
                crate::metrics::record_error("routing");
                Ok(())
            }
        }
    }
}

/// Forwards binary frames to the client's recognition session.
struct AudioHandler {
    sessions: SessionManager,
}

#[async_trait]
impl FrameHandler for AudioHandler {
    async fn handle(&self, ctx: &FrameContext, payload: Payload) -> Result<(), WsError> {
        match payload {
            Payload::Audio(audio) => self.sessions.send_audio_data(ctx.client_id, audio).await,
            Payload::Body(_) => Err(WsError::Routing("audio must be sent as binary".to_string())),
        }
    }
}

/// Starts and stops recognition sessions.
struct SpeechHandler {
    sessions: SessionManager,
    hub: Hub,
    init_timeout: Duration,
}

#[async_trait]
impl FrameHandler for SpeechHandler {
    async fn handle(&self, ctx: &FrameContext, payload: Payload) -> Result<(), WsError> {
        let Payload::Body(body) = payload else {
            return Err(WsError::Routing("speech expects a JSON body".to_string()));
        };
        let command: SpeechCommand = serde_json::from_str(&body)
            .map_err(|e| WsError::Routing(format!("invalid speech body: {e}")))?;

        match command.action.as_str() {
            "start" => {
                let session = self
                    .sessions
                    .create_session(ctx.client_id, &ctx.user_id)
                    .await?;
                match session.wait_ready(self.init_timeout).await {
                    Readiness::Active => {}
                    Readiness::TimedOut => warn!(
                        session_id = %session.session_id,
                        timeout = ?self.init_timeout,
                        "engine not ready in time, continuing degraded"
                    ),
                    Readiness::Ended => {
                        warn!(session_id = %session.session_id, "session ended before becoming active");
                        return Err(WsError::SessionNotFound(ctx.client_id));
                    }
                }
                self.hub
                    .send(ctx.client_id, SpeechResult::ack().into_message())
                    .await?;
                info!(session_id = %session.session_id, "speech started");
                Ok(())
            }
            "stop" => {
                self.sessions.close_session(ctx.client_id).await;
                info!("speech stopped");
                Ok(())
            }
            other => Err(WsError::Routing(format!("unknown speech action '{other}'"))),
        }
    }
}

/// Answers application-level heartbeats from the client.
struct HeartbeatHandler {
    hub: Hub,
}

#[async_trait]
impl FrameHandler for HeartbeatHandler {
    async fn handle(&self, ctx: &FrameContext, _payload: Payload) -> Result<(), WsError> {
        debug!("client heartbeat");
        self.hub
            .send(
                ctx.client_id,
                OutboundMessage::new(OutboundType::Heartbeat, "pong"),
            )
            .await?;
        Ok(())
    }
}
