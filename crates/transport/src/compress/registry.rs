// SPDX-License-Identifier: Apache-2.0

//! The process-wide compressor registry.

use super::noop::NoopMessageCompressor;
use super::snappy::SnappyMessageCompressor;
use super::zlib::ZlibMessageCompressor;
use super::{CompressorId, MessageCompressor};
use crate::error::Error;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds the compressors enabled by configuration, in the configured
/// preference order.
///
/// Only enabled compressors are registered: a frame naming a disabled
/// compressor fails to decompress, and negotiation never offers it.
pub struct CompressorRegistry {
    by_name: HashMap<&'static str, Arc<dyn MessageCompressor>>,
    by_id: HashMap<u8, Arc<dyn MessageCompressor>>,
    names: Vec<String>,
}

impl CompressorRegistry {
    /// Builds a registry from the configured compressor names.
    ///
    /// Unknown names are a configuration error. An empty list disables
    /// compression entirely.
    pub fn with_enabled(names: &[String]) -> Result<Self, Error> {
        let mut registry = Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            names: names.to_vec(),
        };
        registry.register_if_enabled(Arc::new(NoopMessageCompressor::new()));
        registry.register_if_enabled(Arc::new(SnappyMessageCompressor::new()));
        registry.register_if_enabled(Arc::new(ZlibMessageCompressor::new()));

        for name in names {
            if !registry.by_name.contains_key(name.as_str()) {
                return Err(Error::UnknownCompressorName { name: name.clone() });
            }
        }
        Ok(registry)
    }

    fn register_if_enabled(&mut self, compressor: Arc<dyn MessageCompressor>) {
        if !self.names.iter().any(|n| n == compressor.name()) {
            return;
        }
        let _ = self.by_name.insert(compressor.name(), compressor.clone());
        let _ = self.by_id.insert(compressor.id().into(), compressor);
    }

    /// The configured compressor names, in preference order.
    #[must_use]
    pub fn enabled_names(&self) -> &[String] {
        &self.names
    }

    /// Looks a compressor up by negotiation name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn MessageCompressor>> {
        self.by_name.get(name).cloned()
    }

    /// Looks a compressor up by wire id.
    #[must_use]
    pub fn by_id(&self, id: u8) -> Option<Arc<dyn MessageCompressor>> {
        self.by_id.get(&id).cloned()
    }

    /// Whether the id belongs to an enabled compressor.
    #[must_use]
    pub fn is_enabled(&self, id: CompressorId) -> bool {
        self.by_id.contains_key(&u8::from(id))
    }

    /// Builds the `compression` section of the stats document.
    #[must_use]
    pub fn append_stats(&self) -> serde_json::Value {
        let mut section = serde_json::Map::new();
        for name in &self.names {
            if let Some(compressor) = self.by_name.get(name.as_str()) {
                let _ = section.insert(
                    name.clone(),
                    serde_json::to_value(compressor.counters().snapshot())
                        .unwrap_or(serde_json::Value::Null),
                );
            }
        }
        serde_json::Value::Object(section)
    }
}
