// SPDX-License-Identifier: Apache-2.0

//! Per-session compression negotiation and framing.

use super::registry::CompressorRegistry;
use super::{CompressorId, MessageCompressor};
use crate::error::Error;
use crate::message::{MESSAGE_HEADER_SIZE, MAX_MESSAGE_SIZE, Message, OpCode};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

/// The compressed-frame prelude: original op (i32), uncompressed size
/// (i32), compressor id (u8).
const COMPRESSED_PRELUDE_SIZE: usize = 9;

/// The handshake field carrying compressor names.
const COMPRESSION_FIELD: &str = "compression";

/// Per-session compression state.
///
/// Holds the compressors this session negotiated, in the client's
/// preference order. Decompression works for any enabled compressor even
/// before negotiation, so a client may compress its very first messages.
pub struct CompressionManager {
    registry: Arc<CompressorRegistry>,
    negotiated: Vec<Arc<dyn MessageCompressor>>,
}

impl CompressionManager {
    /// Creates a manager with nothing negotiated yet.
    #[must_use]
    pub fn new(registry: Arc<CompressorRegistry>) -> Self {
        Self {
            registry,
            negotiated: Vec::new(),
        }
    }

    /// Client-side start of negotiation: the names to advertise in the
    /// first request, in preference order. `None` when compression is
    /// disabled (the request then omits the field).
    #[must_use]
    pub fn client_begin(&self) -> Option<serde_json::Value> {
        let names = self.registry.enabled_names();
        if names.is_empty() {
            return None;
        }
        Some(serde_json::Value::Array(
            names
                .iter()
                .map(|name| serde_json::Value::String(name.clone()))
                .collect(),
        ))
    }

    /// Client-side end of negotiation: adopts the compressors the server
    /// echoed back, in the server's order. Names the client does not have
    /// enabled are ignored.
    pub fn client_finish(&mut self, server_names: &[String]) {
        self.negotiated.clear();
        for name in server_names {
            if let Some(compressor) = self.registry.by_name(name) {
                self.negotiated.push(compressor);
            } else {
                tracing::debug!(
                    compressor = name.as_str(),
                    "server selected a compressor this client does not have enabled"
                );
            }
        }
    }

    /// Client-side end of negotiation from a handshake response document:
    /// reads the `compression` string array, if any.
    pub fn client_finish_document(&mut self, response: &serde_json::Value) {
        let server_names: Vec<String> = response
            .get(COMPRESSION_FIELD)
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.client_finish(&server_names);
    }

    /// Server-side negotiation: records and returns the intersection of
    /// the client's advertised compressors with the enabled set, in the
    /// client's preferred order.
    pub fn server_negotiate(&mut self, client_names: &[String]) -> Vec<String> {
        self.negotiated.clear();
        let mut agreed = Vec::new();
        for name in client_names {
            if let Some(compressor) = self.registry.by_name(name) {
                tracing::debug!(compressor = name.as_str(), "supported compressor requested");
                agreed.push(name.clone());
                self.negotiated.push(compressor);
            } else {
                tracing::debug!(compressor = name.as_str(), "unsupported compressor requested");
            }
        }
        agreed
    }

    /// Negotiates from a handshake document: reads the `compression`
    /// string array from `request` and returns the field to echo back, or
    /// `None` when there is no overlap (the response then omits the
    /// field).
    pub fn server_negotiate_document(
        &mut self,
        request: &serde_json::Value,
    ) -> Option<serde_json::Value> {
        let client_names: Vec<String> = request
            .get(COMPRESSION_FIELD)?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let agreed = self.server_negotiate(&client_names);
        if agreed.is_empty() {
            return None;
        }
        Some(serde_json::Value::Array(
            agreed.into_iter().map(serde_json::Value::String).collect(),
        ))
    }

    /// The negotiated compressor names, preferred first.
    #[must_use]
    pub fn negotiated_names(&self) -> Vec<&'static str> {
        self.negotiated.iter().map(|c| c.name()).collect()
    }

    /// Compresses a message into a compressed frame.
    ///
    /// `compressor_id` selects a specific compressor (typically echoing
    /// the one the request arrived under); otherwise the first negotiated
    /// compressor is used. Without any negotiated compressor the message
    /// is returned unchanged.
    pub fn compress_message(
        &self,
        message: &Message,
        compressor_id: Option<CompressorId>,
    ) -> Result<Message, Error> {
        let compressor = match compressor_id {
            Some(id) => {
                self.registry
                    .by_id(id.into())
                    .ok_or_else(|| Error::UnknownCompressorId { id: id.into() })?
            }
            None => match self.negotiated.first() {
                Some(compressor) => compressor.clone(),
                None => return Ok(message.clone()),
            },
        };

        let header = message.header();
        let body = message.body();
        let mut payload = vec![0u8; compressor.max_compressed_size(body.len())];
        let written = compressor.compress(body, &mut payload)?;

        let mut compressed_body = BytesMut::with_capacity(COMPRESSED_PRELUDE_SIZE + written);
        compressed_body.put_i32_le(header.op_code);
        compressed_body.put_i32_le(i32::try_from(body.len()).unwrap_or(i32::MAX));
        compressed_body.put_u8(compressor.id().into());
        compressed_body.put_slice(&payload[..written]);

        Message::new(
            header.request_id,
            header.response_to,
            OpCode::Compressed as i32,
            &compressed_body,
        )
    }

    /// Decompresses a compressed frame back into the original message,
    /// reporting which compressor produced it.
    ///
    /// Fails with [`Error::InvalidCompressedMessage`] unless the decoded
    /// size matches the frame's advertised uncompressed size.
    pub fn decompress_message(&self, message: &Message) -> Result<(Message, CompressorId), Error> {
        let header = message.header();
        if header.op_code != OpCode::Compressed as i32 {
            return Err(Error::InvalidMessage {
                reason: format!("op {} is not a compressed frame", header.op_code),
            });
        }
        let mut body = message.body();
        if body.len() < COMPRESSED_PRELUDE_SIZE {
            return Err(Error::InvalidCompressedMessage {
                reason: "compressed frame too short for its prelude".to_string(),
            });
        }
        let original_op = body.get_i32_le();
        let uncompressed_size = body.get_i32_le();
        let compressor_id = body.get_u8();

        let Ok(uncompressed_size) = usize::try_from(uncompressed_size) else {
            return Err(Error::InvalidCompressedMessage {
                reason: format!("negative uncompressed size {uncompressed_size}"),
            });
        };
        if uncompressed_size > MAX_MESSAGE_SIZE - MESSAGE_HEADER_SIZE {
            return Err(Error::InvalidCompressedMessage {
                reason: format!("uncompressed size {uncompressed_size} exceeds maximum"),
            });
        }

        let compressor = self
            .registry
            .by_id(compressor_id)
            .ok_or(Error::UnknownCompressorId { id: compressor_id })?;

        let mut decompressed = vec![0u8; uncompressed_size];
        let produced = compressor.decompress(body, &mut decompressed)?;
        if produced != uncompressed_size {
            return Err(Error::InvalidCompressedMessage {
                reason: format!(
                    "frame decodes to {produced} bytes but advertises {uncompressed_size}"
                ),
            });
        }

        let id = CompressorId::try_from(compressor_id).map_err(|_| {
            Error::UnknownCompressorId { id: compressor_id }
        })?;
        let message = Message::new(
            header.request_id,
            header.response_to,
            original_op,
            &decompressed,
        )?;
        Ok((message, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(list: &[&str]) -> Arc<CompressorRegistry> {
        let names: Vec<String> = list.iter().map(|s| (*s).to_string()).collect();
        Arc::new(CompressorRegistry::with_enabled(&names).expect("known names"))
    }

    fn sample_message(body_len: usize) -> Message {
        let body: Vec<u8> = (0..body_len).map(|i| (i % 17) as u8).collect();
        Message::new(99, 0, OpCode::Msg as i32, &body).expect("message builds")
    }

    #[test]
    fn negotiation_keeps_client_preference_order() {
        let mut manager = CompressionManager::new(registry(&["zlib", "snappy"]));
        let agreed =
            manager.server_negotiate(&["snappy".to_string(), "zlib".to_string()]);
        assert_eq!(agreed, vec!["snappy".to_string(), "zlib".to_string()]);
        assert_eq!(manager.negotiated_names(), vec!["snappy", "zlib"]);
    }

    #[test]
    fn negotiation_drops_unsupported_names() {
        let mut manager = CompressionManager::new(registry(&["zlib"]));
        let agreed = manager.server_negotiate(&[
            "snappy".to_string(),
            "zlib".to_string(),
            "lzma".to_string(),
        ]);
        assert_eq!(agreed, vec!["zlib".to_string()]);
    }

    #[test]
    fn document_negotiation_echoes_the_intersection() {
        let mut manager = CompressionManager::new(registry(&["zlib"]));
        let request = json!({ "handshake": 1, "compression": ["snappy", "zlib"] });
        let response = manager
            .server_negotiate_document(&request)
            .expect("overlap exists");
        assert_eq!(response, json!(["zlib"]));
    }

    #[test]
    fn document_negotiation_omits_field_without_overlap() {
        let mut manager = CompressionManager::new(registry(&["zlib"]));
        let request = json!({ "compression": ["snappy"] });
        assert!(manager.server_negotiate_document(&request).is_none());
        assert!(manager.negotiated_names().is_empty());
    }

    #[test]
    fn client_negotiation_mirrors_the_server_answer() {
        let mut client = CompressionManager::new(registry(&["snappy", "zlib"]));
        let advertised = client.client_begin().expect("two names enabled");
        assert_eq!(advertised, json!(["snappy", "zlib"]));

        // The server picked zlib only.
        client.client_finish_document(&json!({ "ok": 1, "compression": ["zlib"] }));
        assert_eq!(client.negotiated_names(), vec!["zlib"]);

        // A response without the field leaves nothing negotiated.
        client.client_finish_document(&json!({ "ok": 1 }));
        assert!(client.negotiated_names().is_empty());

        let disabled = CompressionManager::new(registry(&[]));
        assert!(disabled.client_begin().is_none());
    }

    #[test]
    fn compression_round_trips_after_negotiation() {
        let mut manager = CompressionManager::new(registry(&["snappy", "zlib"]));
        let _ = manager.server_negotiate(&["zlib".to_string()]);

        let message = sample_message(4096);
        let compressed = manager
            .compress_message(&message, None)
            .expect("compression succeeds");
        assert_eq!(compressed.header().op_code, OpCode::Compressed as i32);
        assert_eq!(compressed.header().request_id, 99);
        // prelude: original op, uncompressed size, compressor id
        assert_eq!(compressed.body()[8], u8::from(CompressorId::Zlib));

        let (decompressed, id) = manager
            .decompress_message(&compressed)
            .expect("decompression succeeds");
        assert_eq!(id, CompressorId::Zlib);
        assert_eq!(decompressed, message);
    }

    #[test]
    fn unnegotiated_sessions_pass_messages_through() {
        let manager = CompressionManager::new(registry(&["snappy"]));
        let message = sample_message(128);
        let passed = manager
            .compress_message(&message, None)
            .expect("passthrough succeeds");
        assert_eq!(passed, message);
    }

    #[test]
    fn explicit_id_overrides_negotiation_order() {
        let mut manager = CompressionManager::new(registry(&["snappy", "zlib"]));
        let _ = manager.server_negotiate(&["snappy".to_string(), "zlib".to_string()]);
        let message = sample_message(512);
        let compressed = manager
            .compress_message(&message, Some(CompressorId::Zlib))
            .expect("compression succeeds");
        assert_eq!(compressed.body()[8], u8::from(CompressorId::Zlib));
    }

    #[test]
    fn disabled_compressor_ids_fail_decompression() {
        let mut snappy_side = CompressionManager::new(registry(&["snappy"]));
        let _ = snappy_side.server_negotiate(&["snappy".to_string()]);
        let compressed = snappy_side
            .compress_message(&sample_message(256), None)
            .expect("compression succeeds");

        let zlib_only = CompressionManager::new(registry(&["zlib"]));
        assert!(matches!(
            zlib_only.decompress_message(&compressed),
            Err(Error::UnknownCompressorId { id: 1 })
        ));
    }

    #[test]
    fn tampered_size_field_is_rejected() {
        let mut manager = CompressionManager::new(registry(&["snappy"]));
        let _ = manager.server_negotiate(&["snappy".to_string()]);
        let compressed = manager
            .compress_message(&sample_message(256), None)
            .expect("compression succeeds");

        // Corrupt the advertised uncompressed size.
        let mut tampered = BytesMut::from(compressed.as_bytes());
        tampered[MESSAGE_HEADER_SIZE + 4] = 0x01;
        tampered[MESSAGE_HEADER_SIZE + 5] = 0x00;
        let tampered = Message::from_bytes(tampered.freeze()).expect("frame still parses");
        assert!(matches!(
            manager.decompress_message(&tampered),
            Err(Error::InvalidCompressedMessage { .. })
        ));
    }
}
