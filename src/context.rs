//! Process-wide state shared by every pipeline component.

use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::PipelineConfig;
use crate::decoder::DecoderRegistry;
use crate::error::SetupError;
use crate::service::{ServiceIdentifier, ServiceStore};
use crate::stats::{CounterMap, ReassemblyStats};
use crate::writer::{ConversationWriter, NullWriter};

/// Configuration, decoder registry, counters and collaborators.
///
/// Built once before any packet is processed and passed by `Arc` to the
/// dispatcher, the connections and the stream processors.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub registry: DecoderRegistry,
    pub stats: ReassemblyStats,
    /// Packets seen per layer name.
    pub protocols: CounterMap,
    /// Error messages and how often they occurred.
    pub errors: CounterMap,
    pub services: Arc<dyn ServiceIdentifier>,
    pub writer: Arc<dyn ConversationWriter>,
    /// Runs the per-direction stream reader tasks.
    runtime: Runtime,
}

impl PipelineContext {
    /// Context with the built-in decoders, an in-memory service store and no
    /// persistence.
    pub fn new(config: PipelineConfig) -> Result<Arc<Self>, SetupError> {
        Self::builder(config).build()
    }

    pub fn builder(config: PipelineConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            registry: None,
            services: None,
            writer: None,
        }
    }

    pub(crate) fn readers(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Count an error message in the error histogram.
    pub fn record_error(&self, message: &str) {
        self.errors.increment(message);
    }
}

pub struct ContextBuilder {
    config: PipelineConfig,
    registry: Option<DecoderRegistry>,
    services: Option<Arc<dyn ServiceIdentifier>>,
    writer: Option<Arc<dyn ConversationWriter>>,
}

impl ContextBuilder {
    /// Replace the registry derived from the include/exclude lists.
    pub fn registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn services(mut self, services: Arc<dyn ServiceIdentifier>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn ConversationWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Validate the configuration and run decoder setup hooks.
    pub fn build(self) -> Result<Arc<PipelineContext>, SetupError> {
        self.config.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => DecoderRegistry::from_config(&self.config)?,
        };
        registry.init()?;
        tracing::debug!(decoders = ?registry.names(), "decoder registry ready");

        let runtime = Builder::new_multi_thread()
            .worker_threads(self.config.reader_threads)
            .thread_name("stream-reader")
            .build()
            .map_err(SetupError::Runtime)?;

        Ok(Arc::new(PipelineContext {
            config: self.config,
            registry,
            stats: ReassemblyStats::default(),
            protocols: CounterMap::new(),
            errors: CounterMap::new(),
            services: self.services.unwrap_or_else(|| Arc::new(ServiceStore::new())),
            writer: self.writer.unwrap_or_else(|| Arc::new(NullWriter)),
            runtime,
        }))
    }
}
