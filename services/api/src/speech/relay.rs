//! Moves engine output for one session back to its client through the hub.

use super::manager::{Session, SessionManager};
use crate::ws::protocol::{OutboundMessage, SpeechResult};
use speechrelay_core::engine::{EngineError, EngineStream, Transcript};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

/// Spawns the relay bound to `session`. It is the only task that delivers
/// engine output for that session.
pub(crate) fn spawn(
    manager: SessionManager,
    session: Arc<Session>,
    stream: EngineStream,
) -> JoinHandle<()> {
    let span = tracing::info_span!(
        "speech_relay",
        client_id = %session.client_id,
        session_id = %session.session_id
    );
    tokio::spawn(run(manager, session, stream).instrument(span))
}

enum Step {
    Continue,
    Finish,
}

async fn run(manager: SessionManager, session: Arc<Session>, stream: EngineStream) {
    let EngineStream {
        ready,
        mut results,
        mut errors,
        ..
    } = stream;
    let mut ready = ready;
    let mut ready_pending = true;
    let mut errors_open = true;
    let mut state = session.subscribe();

    debug!("relay started");
    loop {
        if !session.state().is_live() {
            debug!("session closed elsewhere, relay stopping");
            return;
        }

        let step = tokio::select! {
            biased;
            changed = state.changed() => match changed {
                Ok(()) => Step::Continue,
                Err(_) => Step::Finish,
            },
            error = errors.recv(), if errors_open => match error {
                Some(err) => {
                    warn!(error = %err, "engine reported an error");
                    deliver_error(&manager, &session, &err).await;
                    Step::Finish
                }
                None => {
                    errors_open = false;
                    Step::Continue
                }
            },
            became_ready = &mut ready, if ready_pending => {
                ready_pending = false;
                match became_ready {
                    Ok(()) => {
                        if session.mark_active() {
                            info!("engine ready, session active");
                        }
                        Step::Continue
                    }
                    Err(_) => {
                        deliver_error(&manager, &session, &EngineError::Connection(
                            "engine never became ready".to_string(),
                        ))
                        .await;
                        Step::Finish
                    }
                }
            },
            result = results.recv() => match result {
                Some(transcript) => relay_transcript(&manager, &session, transcript).await,
                None => {
                    info!("engine ended the result stream");
                    deliver_error(&manager, &session, &EngineError::Closed).await;
                    Step::Finish
                }
            },
        };

        if let Step::Finish = step {
            break;
        }
    }

    manager
        .close_session_if(session.client_id, session.session_id)
        .await;
    debug!("relay finished");
}

async fn relay_transcript(
    manager: &SessionManager,
    session: &Session,
    transcript: Transcript,
) -> Step {
    let is_final = transcript.is_final;
    let message = SpeechResult {
        content: transcript.text,
        is_end: is_final,
    }
    .into_message();

    if let Err(e) = manager.hub().send(session.client_id, message).await {
        warn!(error = %e, "transcript could not be delivered, closing session");
        return Step::Finish;
    }
    if is_final {
        info!("final transcript delivered");
        Step::Finish
    } else {
        Step::Continue
    }
}

async fn deliver_error(manager: &SessionManager, session: &Session, err: &EngineError) {
    crate::metrics::record_error("engine");
    let message = OutboundMessage::error(err.to_string());
    if let Err(e) = manager.hub().send(session.client_id, message).await {
        warn!(error = %e, "engine error could not be delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        speech::manager::{
            Readiness, SessionState,
            tests::{MockControl, ScriptedEngine},
        },
        ws::{
            hub::{ClientHandle, Hub},
            protocol::OutboundType,
        },
    };
    use speechrelay_core::engine::{AudioConfig, EngineOutputs};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    type Outputs = (mpsc::Sender<Transcript>, mpsc::Sender<EngineError>);

    struct Fixture {
        manager: SessionManager,
        engine: Arc<ScriptedEngine>,
        outbound: mpsc::Receiver<OutboundMessage>,
        client_id: Uuid,
    }

    async fn fixture(control: MockControl) -> Fixture {
        let (hub, _loop) = Hub::spawn();
        let (tx, outbound) = mpsc::channel(16);
        let client_id = Uuid::new_v4();
        hub.register(ClientHandle::new(
            client_id,
            "user".to_string(),
            tx,
            CancellationToken::new(),
        ))
        .await
        .unwrap();
        let engine = Arc::new(ScriptedEngine::new(vec![Arc::new(control)]));
        Fixture {
            manager: SessionManager::new(engine.clone(), hub, AudioConfig::default()),
            engine,
            outbound,
            client_id,
        }
    }

    fn stoppable() -> MockControl {
        let mut control = MockControl::new();
        control.expect_stop().times(1).returning(|| Ok(()));
        control
    }

    async fn start(fx: &Fixture) -> (Arc<Session>, Outputs) {
        let session = fx.manager.create_session(fx.client_id, "user").await.unwrap();
        let EngineOutputs {
            ready,
            results,
            errors,
        } = fx.engine.take_outputs();
        ready.send(()).unwrap();
        assert_eq!(
            session.wait_ready(Duration::from_secs(1)).await,
            Readiness::Active
        );
        (session, (results, errors))
    }

    async fn wait_closed(session: &Session) {
        let mut state = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == SessionState::Closed),
        )
        .await
        .expect("session should close")
        .unwrap();
    }

    fn speech(message: &OutboundMessage) -> SpeechResult {
        assert_eq!(message.kind, OutboundType::Message);
        serde_json::from_str(&message.data).unwrap()
    }

    #[tokio::test]
    async fn incremental_results_keep_session_open() {
        let mut fx = fixture(stoppable()).await;
        let (session, (results, _errors)) = start(&fx).await;

        results.send(Transcript::incremental("hel")).await.unwrap();
        results.send(Transcript::incremental("hello")).await.unwrap();

        let first = fx.outbound.recv().await.unwrap();
        let second = fx.outbound.recv().await.unwrap();
        assert_eq!(speech(&first).content, "hel");
        assert!(!speech(&first).is_end);
        assert_eq!(speech(&second).content, "hello");
        assert_eq!(session.state(), SessionState::Active);

        fx.manager.close_session(fx.client_id).await;
    }

    #[tokio::test]
    async fn final_result_is_delivered_then_session_closes() {
        let mut fx = fixture(stoppable()).await;
        let (session, (results, _errors)) = start(&fx).await;

        results.send(Transcript::last("hello world")).await.unwrap();

        let message = fx.outbound.recv().await.unwrap();
        let result = speech(&message);
        assert_eq!(result.content, "hello world");
        assert!(result.is_end);
        wait_closed(&session).await;
        assert!(fx.manager.lookup(fx.client_id).await.is_none());
    }

    #[tokio::test]
    async fn engine_error_is_relayed_once_and_closes_session() {
        let mut fx = fixture(stoppable()).await;
        let (session, (results, errors)) = start(&fx).await;

        errors
            .send(EngineError::Remote("bad audio".into()))
            .await
            .unwrap();
        wait_closed(&session).await;

        let message = fx.outbound.recv().await.unwrap();
        assert_eq!(message.kind, OutboundType::Error);
        assert!(message.data.contains("bad audio"));

        // The relay is gone: later engine output goes nowhere.
        let _ = results.send(Transcript::incremental("late")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn engine_ending_stream_is_reported() {
        let mut fx = fixture(stoppable()).await;
        let (session, (results, _errors)) = start(&fx).await;

        drop(results);
        wait_closed(&session).await;

        let message = fx.outbound.recv().await.unwrap();
        assert_eq!(message.kind, OutboundType::Error);
        assert_eq!(message.data, EngineError::Closed.to_string());
        assert!(fx.manager.lookup(fx.client_id).await.is_none());
    }

    #[tokio::test]
    async fn error_sent_before_ready_is_dropped_keeps_its_cause() {
        let mut fx = fixture(stoppable()).await;
        let session = fx.manager.create_session(fx.client_id, "user").await.unwrap();
        let EngineOutputs {
            ready,
            results: _results,
            errors,
        } = fx.engine.take_outputs();
        errors
            .send(EngineError::Quota("429".to_string()))
            .await
            .unwrap();
        drop(ready);

        wait_closed(&session).await;
        let message = fx.outbound.recv().await.unwrap();
        assert_eq!(message.kind, OutboundType::Error);
        assert!(message.data.contains("quota"));
        assert!(fx.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn engine_that_never_gets_ready_reports_error() {
        let mut fx = fixture(stoppable()).await;
        let session = fx.manager.create_session(fx.client_id, "user").await.unwrap();
        let outputs = fx.engine.take_outputs();
        drop(outputs.ready);

        wait_closed(&session).await;
        let message = fx.outbound.recv().await.unwrap();
        assert_eq!(message.kind, OutboundType::Error);
    }

    #[tokio::test]
    async fn external_close_stops_relay_without_output() {
        let mut fx = fixture(stoppable()).await;
        let (session, (results, _errors)) = start(&fx).await;

        fx.manager.close_session(fx.client_id).await;
        assert_eq!(session.state(), SessionState::Closed);

        let _ = results.send(Transcript::incremental("late")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.outbound.try_recv().is_err());
    }
}
