//! Streams audio to Deepgram's live transcription WebSocket.

use crate::config::EngineSettings;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use speechrelay_core::engine::{
    AudioConfig, EngineControl, EngineError, EngineOutputs, EngineStream, RecognitionEngine,
    Transcript,
};
use std::sync::Arc;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, client::IntoClientRequest, handshake::client::Request, http::StatusCode,
        protocol::Message as WsMessage,
    },
};
use tracing::{Instrument, debug, error, info, warn};

/// Audio chunks buffered between the session manager and the socket.
const AUDIO_QUEUE: usize = 64;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

type EngineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize, Debug)]
struct DeepgramResponse {
    #[serde(rename = "type")]
    response_type: String,
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    speech_final: bool,
    description: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize, Debug)]
struct DeepgramAlternative {
    transcript: String,
}

#[derive(Debug, PartialEq)]
enum Event {
    Transcript(Transcript),
    Error(EngineError),
}

/// Maps one Deepgram text message to an engine event. A result whose
/// `speech_final` flag is set ends the utterance.
fn parse_event(text: &str) -> Result<Option<Event>, serde_json::Error> {
    let response: DeepgramResponse = serde_json::from_str(text)?;
    match response.response_type.as_str() {
        "Results" => {
            let transcript = response
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .map(|a| a.transcript)
                .unwrap_or_default();
            if response.speech_final {
                Ok(Some(Event::Transcript(Transcript::last(transcript))))
            } else if transcript.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Event::Transcript(Transcript::incremental(transcript))))
            }
        }
        "Error" => {
            let reason = response
                .description
                .or(response.message)
                .unwrap_or_else(|| "unknown error".to_string());
            Ok(Some(Event::Error(EngineError::Remote(reason))))
        }
        other => {
            debug!(response_type = other, "ignoring engine message");
            Ok(None)
        }
    }
}

fn build_request(settings: &EngineSettings, audio: &AudioConfig) -> Result<Request, EngineError> {
    let url = format!(
        "{}?model={}&language={}&encoding={}&sample_rate={}&channels={}&interim_results=true&punctuate=true",
        settings.url, audio.model, audio.language, audio.encoding, audio.sample_rate, audio.channels
    );
    let mut request = url
        .into_client_request()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;
    let auth = format!("Token {}", settings.api_key)
        .parse()
        .map_err(|_| EngineError::Configuration("API key is not a valid header".to_string()))?;
    request.headers_mut().insert("Authorization", auth);
    Ok(request)
}

fn connect_error(err: tungstenite::Error) -> EngineError {
    match err {
        tungstenite::Error::Http(response) => match response.status() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
                EngineError::Quota(response.status().to_string())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                EngineError::Configuration(response.status().to_string())
            }
            status => EngineError::Connection(status.to_string()),
        },
        other => EngineError::Connection(other.to_string()),
    }
}

#[derive(Debug)]
enum Command {
    Audio(Bytes),
    Stop,
}

struct DeepgramControl {
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl EngineControl for DeepgramControl {
    async fn send_audio(&self, chunk: Bytes) -> Result<(), EngineError> {
        self.commands
            .try_send(Command::Audio(chunk))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    EngineError::Send("audio queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => EngineError::Closed,
            })
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.commands
            .send(Command::Stop)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

/// A [`RecognitionEngine`] backed by Deepgram's streaming API.
pub struct DeepgramEngine {
    settings: EngineSettings,
}

impl DeepgramEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RecognitionEngine for DeepgramEngine {
    async fn start(&self, config: AudioConfig) -> Result<EngineStream, EngineError> {
        let request = build_request(&self.settings, &config)?;
        let (socket, _) = connect_async(request).await.map_err(|e| {
            error!(error = %e, "failed to connect to Deepgram");
            connect_error(e)
        })?;
        info!(model = %config.model, "connected to Deepgram");

        let (commands, commands_rx) = mpsc::channel(AUDIO_QUEUE);
        let (stream, outputs) = EngineStream::channel(Arc::new(DeepgramControl { commands }));

        let span = tracing::info_span!("deepgram_stream", model = %config.model);
        tokio::spawn(run(socket, commands_rx, outputs).instrument(span));
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}

/// Owns the engine socket: forwards audio, parses results, and finishes the
/// stream on `Stop` or when the session side goes away.
async fn run(socket: EngineSocket, mut commands: mpsc::Receiver<Command>, outputs: EngineOutputs) {
    let EngineOutputs {
        ready,
        results,
        errors,
    } = outputs;
    let _ = ready.send(());

    let (mut sink, mut stream) = socket.split();
    let mut stopping = false;

    loop {
        tokio::select! {
            command = commands.recv(), if !stopping => match command {
                Some(Command::Audio(chunk)) => {
                    if let Err(e) = sink.send(WsMessage::Binary(chunk)).await {
                        let _ = errors.send(EngineError::Send(e.to_string())).await;
                        break;
                    }
                }
                Some(Command::Stop) | None => {
                    debug!("closing Deepgram stream");
                    stopping = true;
                    if sink.send(WsMessage::Text(CLOSE_STREAM.into())).await.is_err() {
                        break;
                    }
                }
            },
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match parse_event(&text) {
                    Ok(Some(Event::Transcript(transcript))) => {
                        if results.send(transcript).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Event::Error(err))) => {
                        let _ = errors.send(err).await;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "unparseable Deepgram message"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Deepgram closed the stream");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if !stopping {
                        let _ = errors.send(EngineError::Connection(e.to_string())).await;
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    info!("Deepgram stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EngineSettings {
        EngineSettings {
            api_key: "dg-key".to_string(),
            url: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            sample_rate: 16000,
        }
    }

    #[test]
    fn request_carries_audio_format_and_token() {
        let request = build_request(&settings(), &AudioConfig::default()).unwrap();
        let uri = request.uri().to_string();
        assert!(uri.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(uri.contains("encoding=linear16"));
        assert!(uri.contains("sample_rate=16000"));
        assert!(uri.contains("channels=1"));
        assert!(uri.contains("interim_results=true"));
        assert_eq!(request.headers()["Authorization"], "Token dg-key");
    }

    #[test]
    fn interim_result_is_incremental() {
        let text = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hello","confidence":0.9}]},"is_final":false,"speech_final":false}"#;
        assert_eq!(
            parse_event(text).unwrap(),
            Some(Event::Transcript(Transcript::incremental("hello")))
        );
    }

    #[test]
    fn speech_final_ends_utterance() {
        let text = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hello world"}]},"is_final":true,"speech_final":true}"#;
        assert_eq!(
            parse_event(text).unwrap(),
            Some(Event::Transcript(Transcript::last("hello world")))
        );
    }

    #[test]
    fn empty_interim_result_is_skipped() {
        let text = r#"{"type":"Results","channel":{"alternatives":[{"transcript":""}]},"speech_final":false}"#;
        assert_eq!(parse_event(text).unwrap(), None);
    }

    #[test]
    fn error_message_becomes_remote_error() {
        let text = r#"{"type":"Error","description":"unsupported encoding"}"#;
        assert_eq!(
            parse_event(text).unwrap(),
            Some(Event::Error(EngineError::Remote(
                "unsupported encoding".to_string()
            )))
        );
    }

    #[test]
    fn metadata_is_ignored() {
        let text = r#"{"type":"Metadata","request_id":"abc"}"#;
        assert_eq!(parse_event(text).unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_engine_fails_start() {
        let engine = DeepgramEngine::new(EngineSettings {
            url: "ws://127.0.0.1:1/v1/listen".to_string(),
            ..settings()
        });
        let err = engine.start(AudioConfig::default()).await.err().unwrap();
        assert!(matches!(err, EngineError::Connection(_)));
    }

    #[tokio::test]
    async fn full_audio_queue_is_transient() {
        let (commands, _rx) = mpsc::channel(1);
        let control = DeepgramControl { commands };
        control
            .send_audio(Bytes::from_static(b"a"))
            .await
            .unwrap();
        let err = control
            .send_audio(Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn stopped_stream_rejects_audio() {
        let (commands, rx) = mpsc::channel(1);
        drop(rx);
        let control = DeepgramControl { commands };
        assert_eq!(
            control.send_audio(Bytes::from_static(b"a")).await,
            Err(EngineError::Closed)
        );
        assert_eq!(control.stop().await, Err(EngineError::Closed));
    }
}
