use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::Stream;

use crate::error::Result;
use crate::types::ProgressUpdate;

// ============================================================================
// SSE Frame Decoder
// ============================================================================

/// Line prefix carried by every event frame on the generation stream.
const DATA_PREFIX: &str = "data: ";

/// Incremental decoder for the `/run-stream` event stream.
///
/// Chunks arrive at arbitrary byte boundaries; a record is one
/// `data: `-prefixed line holding a JSON `ProgressUpdate`. The decoder
/// buffers raw bytes and only UTF-8-decodes complete lines, so a chunk split
/// in the middle of a multi-byte character never corrupts the record. A
/// trailing partial line is kept between calls, lines without the prefix are
/// skipped, and malformed payloads are dropped without disturbing
/// neighbouring records. One bad frame must not sink the session.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: BytesMut,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of stream text, yielding every complete record it
    /// finished.
    pub fn feed(&mut self, chunk: &str) -> Vec<ProgressUpdate> {
        self.feed_bytes(chunk.as_bytes())
    }

    /// Consume one raw chunk, yielding every complete record it finished.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<ProgressUpdate> {
        self.buffer.extend_from_slice(chunk);

        let mut updates = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            if let Some(update) = Self::parse_line(line.trim_end_matches(['\n', '\r'])) {
                updates.push(update);
            }
        }
        updates
    }

    /// End of stream. A trailing incomplete line is discarded, not an error;
    /// the transport decides when the stream is done, not us.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            log::debug!("discarding {} bytes of trailing partial frame", self.buffer.len());
            self.buffer.clear();
        }
    }

    fn parse_line(line: &str) -> Option<ProgressUpdate> {
        let payload = line.strip_prefix(DATA_PREFIX)?;
        match serde_json::from_str(payload) {
            Ok(update) => Some(update),
            Err(e) => {
                log::debug!("dropping malformed frame: {}", e);
                None
            }
        }
    }
}

// ============================================================================
// Stream Adapter
// ============================================================================

/// Adapt a raw byte stream into a stream of decoded records. Framing faults
/// are absorbed by the decoder; only transport errors come through.
pub fn decode_stream<S>(mut chunks: S) -> impl Stream<Item = Result<ProgressUpdate>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    async_stream::try_stream! {
        let mut decoder = SseFrameDecoder::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            for update in decoder.feed_bytes(&chunk) {
                yield update;
            }
        }
        decoder.finish();
    }
}

// ============================================================================
// Tests
// ============================================================================
