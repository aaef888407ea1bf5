//! Incremental Server-Sent Events parsing for streamed model replies.
//!
//! The chat-completions endpoint streams `data:` lines separated by blank
//! lines, ending with a `data: [DONE]` sentinel. This parser is fed raw
//! response chunks and yields complete data payloads as they close;
//! payloads split across chunks are buffered until their terminating blank
//! line arrives.

/// Parses a byte stream into SSE data payloads.
#[derive(Debug, Default)]
pub struct SseParser {
    line: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of bytes, returning any payloads completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for ch in String::from_utf8_lossy(chunk).chars() {
            if ch != '\n' {
                self.line.push(ch);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.take_line(line, &mut payloads);
        }
        payloads
    }

    /// Emits whatever is still buffered when the stream ends without a
    /// final blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.line.is_empty() {
            // A trailing non-blank line can only add to the data buffer.
            let line = std::mem::take(&mut self.line);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();
            self.take_line(&line, &mut Vec::new());
        }
        (!self.data.is_empty()).then(|| self.data.drain(..).collect::<Vec<_>>().join("\n"))
    }

    fn take_line(&mut self, line: &str, payloads: &mut Vec<String>) {
        // Blank line: event boundary.
        if line.is_empty() {
            if !self.data.is_empty() {
                payloads.push(self.data.drain(..).collect::<Vec<_>>().join("\n"));
            }
            return;
        }
        // Comment line.
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        }
        // Other fields (event:, id:, retry:) carry nothing we use.
    }
}
