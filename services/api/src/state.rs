//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the connection
//! registry, the session manager and the other shared services.

use crate::{
    config::Config,
    speech::SessionManager,
    ws::{dispatch::Dispatcher, hub::Hub},
};
use metrics_exporter_prometheus::PrometheusHandle;
use speechrelay_core::{
    engine::{AudioConfig, RecognitionEngine},
    identity::IdentityProvider,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Hub,
    pub sessions: SessionManager,
    pub dispatcher: Arc<Dispatcher>,
    pub identity: Arc<dyn IdentityProvider>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wires the registry, sessions and frame router together. Returns the
    /// registry control loop handle alongside the state.
    pub fn new(
        config: Config,
        engine: Arc<dyn RecognitionEngine>,
        identity: Arc<dyn IdentityProvider>,
        metrics: Option<PrometheusHandle>,
    ) -> (Self, JoinHandle<()>) {
        let (hub, hub_loop) = Hub::spawn();
        let audio = AudioConfig {
            sample_rate: config.engine.sample_rate,
            language: config.engine.language.clone(),
            model: config.engine.model.clone(),
            ..AudioConfig::default()
        };
        let sessions = SessionManager::new(engine, hub.clone(), audio);
        let dispatcher = Dispatcher::with_defaults(
            sessions.clone(),
            hub.clone(),
            config.speech_init_timeout,
        );
        let state = Self {
            config: Arc::new(config),
            hub,
            sessions,
            dispatcher: Arc::new(dispatcher),
            identity,
            metrics,
        };
        (state, hub_loop)
    }
}
