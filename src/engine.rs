use crate::api::client::CatalogClient;
use crate::api::preview::{ByteFetcher, PreviewResolver};
use crate::audio::capability::PlaybackCapability;
use crate::audio::context::SharedDecodeContext;
use crate::audio::element::{streaming_factory, ElementFactory};
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::events::{StateChangedPayload, EVENT_CAPACITY};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Collaborators shared by every session on a shelf.
pub struct Engine {
    pub resolver: Arc<dyn PreviewResolver>,
    pub fetcher: Arc<dyn ByteFetcher>,
    pub decode_context: Arc<SharedDecodeContext>,
    pub elements: ElementFactory,
    pub capability: PlaybackCapability,
    pub volume_ceiling: f32,
    pub max_retries: u32,
    pub events: broadcast::Sender<StateChangedPayload>,
}

impl Engine {
    /// Wire up the real stack: HTTP catalog and relay, cpal output and the
    /// process-wide decode context. Must be called inside a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> AppResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Config(format!("No tokio runtime: {}", e)))?;
        let client = Arc::new(CatalogClient::new(config)?);
        let elements = streaming_factory(client.http_client().clone(), runtime);

        Ok(Self {
            resolver: Arc::clone(&client) as Arc<dyn PreviewResolver>,
            fetcher: client as Arc<dyn ByteFetcher>,
            decode_context: SharedDecodeContext::global(),
            elements,
            capability: PlaybackCapability::detect(config.input_modality),
            volume_ceiling: config.volume_ceiling.clamp(0.0, 1.0),
            max_retries: config.max_retries,
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedPayload> {
        self.events.subscribe()
    }
}
