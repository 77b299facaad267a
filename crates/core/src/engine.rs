//! Recognition Engine Adapter
//!
//! Defines the streaming contract a remote speech-recognition engine must
//! satisfy. A stream is started with an [`AudioConfig`] and hands back an
//! [`EngineStream`]: a control half used to push audio and request a stop,
//! plus the channels the engine uses to report readiness, transcripts and
//! errors.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the result and error channels of an engine stream.
pub const ENGINE_CHANNEL_CAPACITY: usize = 64;

/// Audio format negotiated with the engine when a stream starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Encoding of the raw frames, e.g. `linear16`.
    pub encoding: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// BCP-47 language tag.
    pub language: String,
    /// Engine-specific model identifier.
    pub model: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate: 16000,
            channels: 1,
            language: "en-US".to_string(),
            model: "nova-2".to_string(),
        }
    }
}

/// A transcript produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// `true` once the engine considers the utterance complete.
    pub is_final: bool,
}

impl Transcript {
    pub fn incremental(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("engine quota exceeded: {0}")]
    Quota(String),
    #[error("engine rejected configuration: {0}")]
    Configuration(String),
    #[error("failed to send audio to engine: {0}")]
    Send(String),
    #[error("engine reported an error: {0}")]
    Remote(String),
    #[error("engine stream is closed")]
    Closed,
}

impl EngineError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Send(_))
    }
}

/// The write side of a running engine stream.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Forwards one chunk of raw audio to the engine.
    async fn send_audio(&self, chunk: Bytes) -> Result<(), EngineError>;

    /// Asks the engine to finish the stream and release its resources.
    async fn stop(&self) -> Result<(), EngineError>;
}

/// Everything a caller receives when a stream is started.
pub struct EngineStream {
    pub control: Arc<dyn EngineControl>,
    /// Fires once the engine is ready to accept audio. Dropped without
    /// firing if the engine never becomes ready.
    pub ready: oneshot::Receiver<()>,
    pub results: mpsc::Receiver<Transcript>,
    pub errors: mpsc::Receiver<EngineError>,
}

/// The sending halves an adapter keeps to feed an [`EngineStream`].
pub struct EngineOutputs {
    pub ready: oneshot::Sender<()>,
    pub results: mpsc::Sender<Transcript>,
    pub errors: mpsc::Sender<EngineError>,
}

impl EngineStream {
    /// Builds a stream around `control` with fresh bounded output channels.
    pub fn channel(control: Arc<dyn EngineControl>) -> (Self, EngineOutputs) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (results_tx, results_rx) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        (
            Self {
                control,
                ready: ready_rx,
                results: results_rx,
                errors: errors_rx,
            },
            EngineOutputs {
                ready: ready_tx,
                results: results_tx,
                errors: errors_tx,
            },
        )
    }
}

/// A remote streaming recognition engine.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Opens a new recognition stream. The stream may still be connecting
    /// when this returns; readiness is reported through `EngineStream::ready`.
    async fn start(&self, config: AudioConfig) -> Result<EngineStream, EngineError>;

    /// Short provider name used in logs and metrics.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        Control {}

        #[async_trait]
        impl EngineControl for Control {
            async fn send_audio(&self, chunk: Bytes) -> Result<(), EngineError>;
            async fn stop(&self) -> Result<(), EngineError>;
        }
    }

    #[test]
    fn only_send_failures_are_transient() {
        assert!(EngineError::Send("reset".into()).is_transient());
        assert!(!EngineError::Quota("limit".into()).is_transient());
        assert!(!EngineError::Closed.is_transient());
        assert!(!EngineError::Remote("bad audio".into()).is_transient());
    }

    #[tokio::test]
    async fn channel_wires_outputs_to_stream() {
        let mut control = MockControl::new();
        control.expect_stop().times(1).returning(|| Ok(()));

        let (mut stream, outputs) = EngineStream::channel(Arc::new(control));
        outputs.ready.send(()).unwrap();
        outputs
            .results
            .send(Transcript::incremental("hel"))
            .await
            .unwrap();
        outputs.errors.send(EngineError::Closed).await.unwrap();

        assert!(stream.ready.await.is_ok());
        assert_eq!(
            stream.results.recv().await,
            Some(Transcript::incremental("hel"))
        );
        assert_eq!(stream.errors.recv().await, Some(EngineError::Closed));
        stream.control.stop().await.unwrap();
    }

    #[test]
    fn default_audio_config_is_pcm16_mono() {
        let config = AudioConfig::default();
        assert_eq!(config.encoding, "linear16");
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
    }
}
