//! Session Manager
//!
//! Maps each client to at most one recognition session. Creation, lookup and
//! teardown share a single table lock, so session lifecycle transitions are
//! serialized across every connection.

use super::relay;
use crate::{
    metrics::SPEECH_SESSIONS_ACTIVE,
    ws::{error::WsError, hub::ClientId, hub::Hub},
};
use bytes::Bytes;
use speechrelay_core::engine::{AudioConfig, EngineControl, RecognitionEngine};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts made to forward one audio chunk before giving up.
pub const SEND_AUDIO_ATTEMPTS: u32 = 3;
const SEND_AUDIO_BACKOFF: Duration = Duration::from_millis(20);

/// Lifecycle of a recognition session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Active)
    }
}

/// One streaming use of the recognition engine by one client.
pub struct Session {
    pub session_id: Uuid,
    pub client_id: ClientId,
    pub user_id: String,
    control: Arc<dyn EngineControl>,
    state: watch::Sender<SessionState>,
}

impl Session {
    fn new(client_id: ClientId, user_id: &str, control: Arc<dyn EngineControl>) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            session_id: Uuid::new_v4(),
            client_id,
            user_id: user_id.to_string(),
            control,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Moves to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.transition(&[SessionState::Initializing], SessionState::Active)
    }

    /// Waits for the session to leave `Initializing`, for at most `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let mut state = self.subscribe();
        match tokio::time::timeout(timeout, state.wait_for(|s| *s != SessionState::Initializing))
            .await
        {
            Ok(Ok(reached)) if *reached == SessionState::Active => Readiness::Active,
            Ok(_) => Readiness::Ended,
            Err(_) => Readiness::TimedOut,
        }
    }
}

/// Outcome of [`Session::wait_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Active,
    /// Still initializing when the wait ran out.
    TimedOut,
    /// Closed before the engine became ready.
    Ended,
}

struct Inner {
    engine: Arc<dyn RecognitionEngine>,
    hub: Hub,
    audio: AudioConfig,
    sessions: Mutex<HashMap<ClientId, Arc<Session>>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn RecognitionEngine>, hub: Hub, audio: AudioConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                hub,
                audio,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Returns the live session of `client_id`, starting a new engine stream
    /// only when there is none.
    pub async fn create_session(
        &self,
        client_id: ClientId,
        user_id: &str,
    ) -> Result<Arc<Session>, WsError> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(&client_id) {
            if existing.state().is_live() {
                debug!(%client_id, session_id = %existing.session_id, "reusing live session");
                return Ok(existing.clone());
            }
        }

        let stream = self.inner.engine.start(self.inner.audio.clone()).await?;
        let session = Arc::new(Session::new(client_id, user_id, stream.control.clone()));
        sessions.insert(client_id, session.clone());
        drop(sessions);

        metrics::gauge!(SPEECH_SESSIONS_ACTIVE).increment(1.0);
        info!(
            %client_id,
            session_id = %session.session_id,
            engine = self.inner.engine.name(),
            "speech session created"
        );
        relay::spawn(self.clone(), session.clone(), stream);
        Ok(session)
    }

    /// Forwards audio to the client's active session.
    pub async fn send_audio_data(&self, client_id: ClientId, audio: Bytes) -> Result<(), WsError> {
        let session = self
            .lookup(client_id)
            .await
            .filter(|s| s.state() == SessionState::Active)
            .ok_or(WsError::SessionNotFound(client_id))?;

        let mut attempt = 1;
        loop {
            match session.control.send_audio(audio.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < SEND_AUDIO_ATTEMPTS => {
                    warn!(%client_id, attempt, error = %e, "retrying audio send");
                    tokio::time::sleep(SEND_AUDIO_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn lookup(&self, client_id: ClientId) -> Option<Arc<Session>> {
        self.inner.sessions.lock().await.get(&client_id).cloned()
    }

    /// Stops and removes the client's session. A no-op when there is none.
    pub async fn close_session(&self, client_id: ClientId) {
        let removed = self.inner.sessions.lock().await.remove(&client_id);
        if let Some(session) = removed {
            self.teardown(session).await;
        }
    }

    /// Like [`close_session`](Self::close_session), but only if the client's
    /// current session is `session_id`.
    pub(crate) async fn close_session_if(&self, client_id: ClientId, session_id: Uuid) {
        let removed = {
            let mut sessions = self.inner.sessions.lock().await;
            let is_current = sessions
                .get(&client_id)
                .is_some_and(|current| current.session_id == session_id);
            if is_current {
                sessions.remove(&client_id)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: Arc<Session>) {
        session.transition(
            &[SessionState::Initializing, SessionState::Active],
            SessionState::Closing,
        );
        if let Err(e) = session.control.stop().await {
            warn!(
                client_id = %session.client_id,
                session_id = %session.session_id,
                error = %e,
                "engine stop failed"
            );
        }
        session.transition(&[SessionState::Closing], SessionState::Closed);
        metrics::gauge!(SPEECH_SESSIONS_ACTIVE).decrement(1.0);
        info!(
            client_id = %session.client_id,
            session_id = %session.session_id,
            "speech session closed"
        );
    }
}
