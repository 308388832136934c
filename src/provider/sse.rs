//! Server-sent events decoding.
//!
//! Provides [`SseDecoder`] for line-buffered reassembly of SSE events from
//! raw byte chunks. Handles TCP chunk boundaries, CRLF line endings, and
//! non-data fields.

use bytes::BytesMut;

/// Lines longer than this without a newline are discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

impl SseEvent {
    /// Whether this is the OpenAI end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder.
///
/// Buffers raw bytes across chunk boundaries and emits an event at every
/// blank line that follows at least one `data:` line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns the events completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeded buffer cap, discarding"
            );
            self.buffer.clear();
        }

        events
    }

    /// Flush any trailing line and pending event at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id, retry and unknown fields carry nothing we route on
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build SSE bytes from event lines, then split at the given byte positions
    /// to simulate TCP chunk boundaries.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    fn decode_all(chunks: &[Vec<u8>]) -> Vec<SseEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn test_single_chunk() {
        let events = [
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":" world"}}]}"#,
            "data: [DONE]",
        ];
        let decoded = decode_all(&split_sse_at_positions(&events, &[]));
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].data.contains("Hello"));
        assert!(decoded[2].is_done());
    }

    #[test]
    fn test_split_across_chunks() {
        let events = [
            r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[7, 50, 120, 150]);
        assert!(chunks.len() > 1);
        let decoded = decode_all(&chunks);
        assert_eq!(decoded.len(), 3);
        assert!(decoded[1].data.contains("\"prompt_tokens\":10"));
    }

    #[test]
    fn test_event_field_and_comments() {
        let raw = b"event: content_block_delta\nid: 7\nretry: 5000\n: keepalive\ndata: {\"x\":1}\n\n";
        let decoded = decode_all(&[raw.to_vec()]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(decoded[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let raw = b"event: ping\n\ndata: real\n\n";
        let decoded = decode_all(&[raw.to_vec()]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].event, None);
        assert_eq!(decoded[0].data, "real");
    }

    #[test]
    fn test_crlf_line_endings() {
        let raw = b"data: one\r\n\r\ndata: [DONE]\r\n\r\n";
        let decoded = decode_all(&[raw.to_vec()]);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].data, "one");
        assert!(decoded[1].is_done());
    }

    #[test]
    fn test_data_without_space() {
        let decoded = decode_all(&[b"data:{\"a\":1}\n\ndata:[DONE]\n\n".to_vec()]);
        assert_eq!(decoded[0].data, "{\"a\":1}");
        assert!(decoded[1].is_done());
    }

    #[test]
    fn test_multiline_data_joined() {
        let decoded = decode_all(&[b"data: a\ndata: b\n\n".to_vec()]);
        assert_eq!(decoded[0].data, "a\nb");
    }

    #[test]
    fn test_done_without_trailing_newline() {
        let decoded = decode_all(&[b"data: x\n\ndata: [DONE]".to_vec()]);
        assert_eq!(decoded.len(), 2);
        assert!(decoded[1].is_done());
    }

    #[test]
    fn test_empty_stream() {
        assert!(decode_all(&[]).is_empty());
    }

    #[test]
    fn test_buffer_cap() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&vec![b'x'; 65 * 1024]).is_empty());
        // After the oversized line is dropped, normal data still decodes.
        let events = decoder.push(b"\ndata: ok\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }
}
