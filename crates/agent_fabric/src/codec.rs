//! Envelope codec — wire encoding and payload compression.
//!
//! The wire form is self-describing JSON. Binary blobs are base64 text, and
//! when `flags.compressed` is set every blob is an LZ4 block with its
//! uncompressed size prepended. Whether to compress is decided once, by
//! [`EnvelopeCodec::apply_compression_policy`], when the envelope is built;
//! decoding only ever looks at the flag.

use crate::error::{FabricError, Result};
use crate::message::Envelope;

/// Blob size at which payload compression kicks in by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 16 * 1024;

/// Largest frame the codec accepts by default, compressed or not.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes and decodes envelopes.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    compression_threshold: usize,
    max_frame_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new(compression_threshold: usize, max_frame_size: usize) -> Self {
        Self {
            compression_threshold,
            max_frame_size,
        }
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Set `flags.compressed` if the payload carries enough blob data.
    ///
    /// Only ever turns compression on; an envelope that is already flagged
    /// stays flagged.
    pub fn apply_compression_policy(&self, envelope: &mut Envelope) {
        if !envelope.flags.compressed && envelope.value.blob_size() >= self.compression_threshold {
            envelope.flags.compressed = true;
        }
    }

    /// Reject envelopes that could never be encoded, without encoding them.
    ///
    /// An uncompressed payload whose base64 text alone would exceed the
    /// frame limit fails here. Compressed ones are only measured by
    /// [`encode`](Self::encode).
    pub fn check(&self, envelope: &Envelope) -> Result<()> {
        validate(envelope)?;
        check_arrays(envelope)?;
        if let Some(bad) = envelope.value.find_non_finite() {
            return Err(FabricError::MalformedEnvelope(format!(
                "non-finite float {bad} in payload of '{}'",
                envelope.key
            )));
        }
        if !envelope.flags.compressed {
            let base64_len = envelope.value.blob_size().div_ceil(3).saturating_mul(4);
            if base64_len > self.max_frame_size {
                return Err(FabricError::SendFailed(format!(
                    "payload of '{}' needs at least {base64_len} bytes, limit is {}",
                    envelope.key, self.max_frame_size
                )));
            }
        }
        Ok(())
    }

    /// Serialize an envelope into wire bytes.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.check(envelope)?;

        let bytes = if envelope.flags.compressed {
            let mut wire = envelope.clone();
            wire.value.try_for_each_blob(|blob| {
                *blob = compress_lz4(blob)?;
                Ok::<_, FabricError>(())
            })?;
            serde_json::to_vec(&wire)?
        } else {
            serde_json::to_vec(envelope)?
        };

        if bytes.len() > self.max_frame_size {
            return Err(FabricError::SendFailed(format!(
                "encoded envelope is {} bytes, limit is {}",
                bytes.len(),
                self.max_frame_size
            )));
        }
        Ok(bytes)
    }

    /// Parse wire bytes back into an envelope.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() > self.max_frame_size {
            return Err(FabricError::MalformedEnvelope(format!(
                "frame of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_frame_size
            )));
        }

        let mut envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| FabricError::MalformedEnvelope(e.to_string()))?;
        validate(&envelope)?;

        if envelope.flags.compressed {
            let limit = self.max_frame_size;
            envelope
                .value
                .try_for_each_blob(|blob| {
                    *blob = decompress_lz4(blob, limit)?;
                    Ok::<_, FabricError>(())
                })?;
        }
        check_arrays(&envelope)?;
        Ok(envelope)
    }
}

/// Structural checks shared by encode and decode.
fn validate(envelope: &Envelope) -> Result<()> {
    if envelope.key.is_empty() {
        return Err(FabricError::MalformedEnvelope("empty key".into()));
    }
    if envelope.sender.is_empty() {
        return Err(FabricError::MalformedEnvelope("empty sender".into()));
    }
    if envelope.flags.stream_chunk != envelope.stream.is_some() {
        return Err(FabricError::MalformedEnvelope(format!(
            "stream flag and stream header disagree on '{}'",
            envelope.key
        )));
    }
    Ok(())
}

/// Array data must match its shape. Only meaningful on uncompressed blobs.
fn check_arrays(envelope: &Envelope) -> Result<()> {
    match envelope.value.find_bad_array() {
        Some(reason) => Err(FabricError::MalformedEnvelope(format!(
            "{reason} in payload of '{}'",
            envelope.key
        ))),
        None => Ok(()),
    }
}

/// Compress a blob with LZ4, prepending the uncompressed size.
pub fn compress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    lz4::block::compress(data, Some(lz4::block::CompressionMode::FAST(1)), true)
        .map_err(|e| FabricError::SendFailed(format!("LZ4 compression failed: {e}")))
}

/// Decompress a size-prefixed LZ4 block, refusing anything that claims to
/// expand beyond `max_size`.
pub fn decompress_lz4(compressed: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let prefix: [u8; 4] = compressed
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| FabricError::MalformedEnvelope("truncated LZ4 block".into()))?;
    let claimed = i32::from_le_bytes(prefix);
    if claimed < 0 || claimed as usize > max_size {
        return Err(FabricError::MalformedEnvelope(format!(
            "LZ4 block claims {claimed} bytes, limit is {max_size}"
        )));
    }
    lz4::block::decompress(compressed, None)
        .map_err(|e| FabricError::MalformedEnvelope(format!("LZ4 decompression failed: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
