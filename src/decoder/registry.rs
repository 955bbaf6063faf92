use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::error::SetupError;
use crate::stats::ReassemblyStats;
use crate::stream::Conversation;

use super::{builtin_decoders, StreamDecoder};

/// Registry of available conversation decoders.
///
/// Lookup is by server port first, among the decoders registered for it
/// with a matching transport, then a linear scan in registration order. Built once at startup; only the per-decoder record counters
/// change afterwards.
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn StreamDecoder>>,
    /// Decoder indices per server port, in registration order.
    by_port: HashMap<u16, Vec<usize>>,
    records: Vec<AtomicU64>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self {
            decoders: Vec::new(),
            by_port: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Register a decoder. Decoders sharing a port are tried in
    /// registration order.
    pub fn register(&mut self, decoder: Arc<dyn StreamDecoder>) {
        let index = self.decoders.len();
        for &port in decoder.ports() {
            let owners = self.by_port.entry(port).or_default();
            if let Some(&existing) = owners.first() {
                tracing::debug!(
                    port,
                    decoder = decoder.name(),
                    owner = self.decoders[existing].name(),
                    "port shared with an earlier decoder"
                );
            }
            owners.push(index);
        }
        self.decoders.push(decoder);
        self.records.push(AtomicU64::new(0));
    }

    /// Built-in decoders narrowed by the include/exclude lists.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, SetupError> {
        let builtins = builtin_decoders();
        for name in config
            .include_decoders
            .iter()
            .chain(config.exclude_decoders.iter())
        {
            if !builtins.iter().any(|d| d.name() == name) {
                return Err(SetupError::UnknownDecoder { name: name.clone() });
            }
        }

        let mut registry = Self::new();
        for decoder in builtins {
            let name = decoder.name();
            let included =
                config.include_decoders.is_empty() || config.include_decoders.iter().any(|n| n == name);
            let excluded = config.exclude_decoders.iter().any(|n| n == name);
            if included && !excluded {
                registry.register(decoder);
            } else {
                tracing::debug!(decoder = name, "decoder disabled");
            }
        }
        Ok(registry)
    }

    /// Run every decoder's setup hook.
    pub fn init(&self) -> Result<(), SetupError> {
        for decoder in &self.decoders {
            decoder.init()?;
        }
        Ok(())
    }

    pub fn finish(&self) {
        for decoder in &self.decoders {
            decoder.finish();
        }
    }

    /// Pick the decoder for a conversation, if any claims it.
    pub fn select(&self, conversation: &Conversation) -> Option<Arc<dyn StreamDecoder>> {
        self.select_index(conversation)
            .map(|index| Arc::clone(&self.decoders[index]))
    }

    fn select_index(&self, conversation: &Conversation) -> Option<usize> {
        let transport = conversation.transport();
        let client = conversation.first_client_fragment();
        let server = conversation.first_server_fragment();

        let port_match = self.by_port.get(&conversation.server_port()).and_then(|owners| {
            owners
                .iter()
                .copied()
                .find(|&index| self.decoders[index].transport().accepts(transport))
        });
        if let Some(index) = port_match {
            if self.decoders[index].can_decode(client, server) {
                return Some(index);
            }
        }

        self.decoders
            .iter()
            .position(|d| d.transport().accepts(transport) && d.can_decode(client, server))
    }

    pub fn decoders(&self) -> &[Arc<dyn StreamDecoder>] {
        &self.decoders
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn StreamDecoder>> {
        self.decoders.iter().find(|d| d.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    /// Records emitted so far, per decoder, in registration order.
    pub fn record_counts(&self) -> Vec<(&'static str, u64)> {
        self.decoders
            .iter()
            .zip(&self.records)
            .map(|(d, n)| (d.name(), n.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Select a decoder for the conversation and run it once, writing its
/// records. Returns the number of records written.
///
/// Decoder and writer failures are logged and counted; they never
/// propagate.
pub fn decode_conversation(ctx: &PipelineContext, conversation: Arc<Conversation>) -> usize {
    if conversation.is_empty() {
        return 0;
    }
    let registry = &ctx.registry;
    let Some(index) = registry.select_index(&conversation) else {
        tracing::trace!(flow = %conversation.ident(), "no decoder claimed conversation");
        return 0;
    };
    let descriptor = &registry.decoders[index];
    let flow = conversation.ident().to_string();

    ReassemblyStats::incr(&ctx.stats.decoded_conversations);
    let records = match descriptor.decoder(conversation).decode() {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(decoder = descriptor.name(), %flow, error = %e, "decode failed");
            ctx.record_error(&e.to_string());
            return 0;
        }
    };

    let mut written = 0;
    for record in &records {
        match ctx.writer.write_record(record) {
            Ok(()) => written += 1,
            Err(e) => {
                tracing::warn!(decoder = descriptor.name(), %flow, error = %e, "failed to write record");
                ctx.record_error(&e.to_string());
            }
        }
    }
    registry.records[index].fetch_add(written as u64, Ordering::Relaxed);
    tracing::debug!(decoder = descriptor.name(), %flow, records = written, "decoded conversation");
    written
}
