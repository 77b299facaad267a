//! Connection Actor
//!
//! Each accepted connection runs three cooperating tasks:
//!
//! - the reader, sole consumer of the socket stream, which dispatches frames;
//! - the writer, sole consumer of the bounded outbound queue;
//! - the heartbeat, which pings the client on a fixed interval.
//!
//! Any of them can end the connection through [`Client::close`], which runs
//! the teardown at most once.

use super::{
    dispatch::{Dispatcher, Frame, FrameContext},
    error::WsError,
    hub::{ClientHandle, ClientId, Hub},
    protocol::OutboundMessage,
};
use crate::{
    config::ConnectionSettings,
    metrics::{WS_MESSAGES_RECEIVED_TOTAL, WS_MESSAGES_SENT_TOTAL, record_error},
    speech::SessionManager,
    state::AppState,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use speechrelay_core::identity::Identity;
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// The state shared by the three tasks of one connection.
pub struct Client {
    pub client_id: ClientId,
    pub user_id: String,
    hub: Hub,
    sessions: SessionManager,
    closed: AtomicBool,
}

impl Client {
    pub fn new(client_id: ClientId, user_id: String, hub: Hub, sessions: SessionManager) -> Self {
        Self {
            client_id,
            user_id,
            hub,
            sessions,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unregisters the client and closes its speech session. Only the first
    /// call does anything; returns whether this call performed the teardown.
    pub async fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(reason, "closing connection");
        if let Err(e) = self.hub.unregister(self.client_id).await {
            error!(error = %e, "failed to unregister client");
        }
        self.sessions.close_session(self.client_id).await;
        true
    }
}

/// Serves one authenticated connection until all of its tasks have stopped.
pub async fn run_connection(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let client_id = Uuid::new_v4();
    let span = tracing::info_span!("ws_connection", %client_id, user_id = %identity.user_id);
    serve(socket, state, client_id, identity.user_id)
        .instrument(span)
        .await
}

async fn serve(socket: WebSocket, state: Arc<AppState>, client_id: ClientId, user_id: String) {
    let settings = state.config.connection.clone();
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue);
    let shutdown = CancellationToken::new();

    // Tasks start only once the registry knows the client.
    let handle = ClientHandle::new(client_id, user_id.clone(), outbound_tx, shutdown.clone());
    if let Err(e) = state.hub.register(handle).await {
        error!(error = %e, "failed to register client");
        return;
    }
    info!("client connected");

    let client = Arc::new(Client::new(
        client_id,
        user_id,
        state.hub.clone(),
        state.sessions.clone(),
    ));
    let sink = Arc::new(Mutex::new(sink));

    let writer = tokio::spawn(
        write_loop(
            client.clone(),
            sink.clone(),
            outbound_rx,
            settings.write_timeout,
        )
        .in_current_span(),
    );
    let heartbeat = tokio::spawn(
        heartbeat_loop(
            client.clone(),
            sink,
            shutdown.clone(),
            settings.ping_interval,
            settings.write_timeout,
        )
        .in_current_span(),
    );

    read_loop(client, stream, &state.dispatcher, &settings, shutdown).await;
    let _ = tokio::join!(writer, heartbeat);
    info!("client disconnected");
}

/// Writes one frame, bounding the lock wait and the send by `deadline`.
async fn write_frame<S>(sink: &Mutex<S>, message: Message, deadline: Duration) -> Result<(), WsError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(deadline, async { sink.lock().await.send(message).await }).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WsError::Network(e.to_string())),
        Err(_) => Err(WsError::Network(format!(
            "write timed out after {deadline:?}"
        ))),
    }
}

async fn write_loop<S>(
    client: Arc<Client>,
    sink: Arc<Mutex<S>>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    deadline: Duration,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        let frame = Message::Text(message.to_json().into());
        match write_frame(&sink, frame, deadline).await {
            Ok(()) => {
                client.hub.settle(1);
                metrics::counter!(WS_MESSAGES_SENT_TOTAL).increment(1);
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                record_error(e.category());
                // Refuse further enqueues, then settle everything still queued.
                outbound.close();
                let mut failed = 1;
                while outbound.try_recv().is_ok() {
                    failed += 1;
                }
                client.hub.settle(failed);
                client.close("write failed").await;
                return;
            }
        }
    }

    // The registry dropped the queue: say goodbye if the socket still works.
    let goodbye = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "closing".into(),
    }));
    if let Err(e) = write_frame(&sink, goodbye, deadline).await {
        debug!(error = %e, "close frame not sent");
    }
    debug!("writer stopped");
}

async fn heartbeat_loop<S>(
    client: Arc<Client>,
    sink: Arc<Mutex<S>>,
    shutdown: CancellationToken,
    interval: Duration,
    deadline: Duration,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = write_frame(&sink, Message::Ping(Bytes::new()), deadline).await {
                    warn!(error = %e, "heartbeat failed");
                    record_error(e.category());
                    client.close("heartbeat failed").await;
                    break;
                }
            }
        }
    }
    debug!("heartbeat stopped");
}

async fn read_loop<St>(
    client: Arc<Client>,
    mut stream: St,
    dispatcher: &Dispatcher,
    settings: &ConnectionSettings,
    shutdown: CancellationToken,
) where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let reason = loop {
        if client.is_closed() {
            break "closed";
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break "unregistered",
            next = timeout(settings.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                record_error("network");
                break "read deadline exceeded";
            }
            Ok(None) => break "stream ended",
            Ok(Some(Err(e))) => {
                warn!(error = %e, "read failed");
                record_error("network");
                break "read failed";
            }
            Ok(Some(Ok(message))) => message,
        };

        let (frame, kind) = match message {
            Message::Text(text) => (Frame::Text(text.as_str().to_owned()), "text"),
            Message::Binary(data) => (Frame::Binary(data), "binary"),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(?frame, "client sent close");
                break "client closed";
            }
        };

        let size = match &frame {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        };
        if size > settings.max_frame_bytes {
            let err = WsError::ProtocolViolation(format!(
                "frame of {size} bytes exceeds limit of {}",
                settings.max_frame_bytes
            ));
            warn!(error = %err, "dropping connection");
            record_error(err.category());
            break "oversized frame";
        }
        metrics::counter!(WS_MESSAGES_RECEIVED_TOTAL, "kind" => kind).increment(1);

        let ctx = FrameContext {
            client_id: client.client_id,
            user_id: client.user_id.clone(),
            trace_id: Uuid::new_v4(),
        };
        let span = tracing::info_span!("frame", trace_id = %ctx.trace_id, kind);
        if let Err(err) = dispatcher.dispatch(&ctx, frame).instrument(span).await {
            record_error(err.category());
            if err.is_fatal() {
                warn!(error = %err, "dropping connection");
                break "protocol violation";
            }
            warn!(error = %err, "frame rejected");
            let report = OutboundMessage::error(err.to_string());
            if let Err(e) = client.hub.send(client.client_id, report).await {
                debug!(error = %e, "error report not delivered");
            }
        }
    };

    client.close(reason).await;
    // A start dispatched while another task tore the connection down may
    // have created a session after that teardown closed the last one.
    client.sessions.close_session(client.client_id).await;
    debug!("reader stopped");
}
