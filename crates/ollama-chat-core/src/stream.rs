//! Streaming reply handling.
//!
//! Ollama streams a chat reply as newline-delimited JSON objects. [`LineDecoder`]
//! splits the raw body into lines, [`decode_line`] pulls the content delta out
//! of one line, and [`StreamAssembler`] folds the resulting chunks into the
//! text the user sees.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;

/// Appended to the partial reply while it is still streaming.
pub const CURSOR: char = '▌';

const ERROR_PREFIXES: [&str; 2] = ["Error: HTTP", "Connection error:"];

/// One decoded unit of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A fragment of assistant text.
    Delta(String),
    /// The stream failed; the text is shown to the user as-is.
    Failed(String),
}

impl StreamChunk {
    pub fn text(&self) -> &str {
        match self {
            StreamChunk::Delta(text) | StreamChunk::Failed(text) => text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamChunk::Failed(_))
    }

    /// Text that reads like an error message. Only meaningful for the first
    /// chunk of a stream; later deltas are model output.
    fn looks_like_error(&self) -> bool {
        ERROR_PREFIXES.iter().any(|p| self.text().starts_with(p))
    }
}

#[derive(Deserialize)]
struct ChatLine {
    message: Option<ChatLineMessage>,
}

#[derive(Deserialize)]
struct ChatLineMessage {
    content: Option<String>,
}

/// Extract `message.content` from one NDJSON line.
///
/// Blank lines, invalid JSON and objects without `message.content` give `None`.
pub fn decode_line(line: &str) -> Option<String> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatLine>(line) {
        Ok(parsed) => parsed.message.and_then(|m| m.content),
        Err(e) => {
            tracing::debug!(error = %e, "skipping undecodable stream line");
            None
        }
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are buffered until a newline arrives, so a line (or a multi-byte
/// character) split across network chunks comes out whole.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).take(end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// The final text of one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledReply {
    pub content: String,
    pub errored: bool,
}

/// Accumulates deltas into the reply text.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: String,
    received: usize,
    errored: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one chunk. Returns `false` once an error has been seen; nothing
    /// further should be pushed after that.
    ///
    /// A [`StreamChunk::Failed`] is always an error. A delta starting with an
    /// error prefix counts as one only when it opens the stream.
    pub fn push(&mut self, chunk: &StreamChunk) -> bool {
        if self.errored {
            return false;
        }
        let first = self.received == 0;
        self.received += 1;
        self.buffer.push_str(chunk.text());
        if chunk.is_error() || (first && chunk.looks_like_error()) {
            tracing::warn!(error = %chunk.text(), "chat stream failed");
            self.errored = true;
            return false;
        }
        true
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// The text so far with the cursor glyph appended.
    pub fn partial(&self) -> String {
        let mut partial = String::with_capacity(self.buffer.len() + CURSOR.len_utf8());
        partial.push_str(&self.buffer);
        partial.push(CURSOR);
        partial
    }

    pub fn finish(self) -> AssembledReply {
        AssembledReply {
            content: self.buffer,
            errored: self.errored,
        }
    }

    /// Consume `chunks` to the end (or the first error), calling `on_partial`
    /// with the partial buffer after every chunk.
    pub async fn drive<S, F>(chunks: S, mut on_partial: F) -> AssembledReply
    where
        S: Stream<Item = StreamChunk>,
        F: FnMut(&str),
    {
        let mut assembler = Self::new();
        futures_util::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            let keep_going = assembler.push(&chunk);
            if !keep_going {
                break;
            }
            on_partial(&assembler.partial());
        }
        assembler.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_decode_line_with_content() {
        let line = r#"{"model":"llama2","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        assert_eq!(decode_line(line), Some("Hel".to_string()));
    }

    #[test]
    fn test_decode_line_skips_garbage() {
        assert_eq!(decode_line("not json"), None);
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   "), None);
        assert_eq!(decode_line(r#"{"done":true}"#), None);
        assert_eq!(decode_line(r#"{"message":{"role":"assistant"}}"#), None);
    }

    #[test]
    fn test_decode_line_trims_carriage_return() {
        let line = "{\"message\":{\"content\":\"x\"}}\r";
        assert_eq!(decode_line(line), Some("x".to_string()));
    }

    #[test]
    fn test_line_decoder_joins_split_lines() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"message\":{\"con");
        assert_eq!(decoder.next_line(), None);
        decoder.push(b"tent\":\"a\"}}\n{\"mess");
        assert_eq!(
            decoder.next_line(),
            Some("{\"message\":{\"content\":\"a\"}}".to_string())
        );
        assert_eq!(decoder.next_line(), None);
        assert_eq!(decoder.finish(), Some("{\"mess".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_keeps_multibyte_chars_intact() {
        let line = "{\"message\":{\"content\":\"ñ\"}}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = LineDecoder::new();
        decoder.push(&line[..split]);
        decoder.push(&line[split..]);
        let decoded = decoder.next_line().and_then(|l| decode_line(&l));
        assert_eq!(decoded, Some("ñ".to_string()));
    }

    #[tokio::test]
    async fn test_drive_concatenates_deltas() {
        let deltas = vec!["The", " quick", " brown", " fox"];
        let chunks = stream::iter(deltas.iter().map(|d| StreamChunk::Delta(d.to_string())));

        let mut partials = Vec::new();
        let reply = StreamAssembler::drive(chunks, |p| partials.push(p.to_string())).await;

        assert_eq!(reply.content, deltas.concat());
        assert!(!reply.errored);
        assert_eq!(partials.len(), 4);
        assert_eq!(partials[1], format!("The quick{CURSOR}"));
        assert!(!reply.content.contains(CURSOR));
    }

    #[tokio::test]
    async fn test_drive_empty_stream() {
        let reply = StreamAssembler::drive(stream::empty(), |_| {}).await;
        assert_eq!(reply.content, "");
        assert!(!reply.errored);
    }

    #[tokio::test]
    async fn test_drive_stops_at_error() {
        let chunks = stream::iter(vec![
            StreamChunk::Delta("partial ".to_string()),
            StreamChunk::Failed("Connection error: reset".to_string()),
            StreamChunk::Delta("never seen".to_string()),
        ]);

        let reply = StreamAssembler::drive(chunks, |_| {}).await;

        assert_eq!(reply.content, "partial Connection error: reset");
        assert!(reply.errored);
    }

    #[test]
    fn test_leading_error_prefix_counts_as_error() {
        let mut assembler = StreamAssembler::new();
        assert!(!assembler.push(&StreamChunk::Delta("Error: HTTP 500".to_string())));
        assert!(!assembler.push(&StreamChunk::Delta("more".to_string())));
        let reply = assembler.finish();
        assert_eq!(reply.content, "Error: HTTP 500");
        assert!(reply.errored);
    }

    #[tokio::test]
    async fn test_error_prefix_mid_reply_is_plain_text() {
        let deltas = vec![
            "A 503 means ",
            "Error: HTTP 503 Service Unavailable",
            ", so retry later. ",
            "Connection error: is another one.",
        ];
        let chunks = stream::iter(deltas.iter().map(|d| StreamChunk::Delta(d.to_string())));

        let reply = StreamAssembler::drive(chunks, |_| {}).await;

        assert_eq!(reply.content, deltas.concat());
        assert!(!reply.errored);
    }
}
