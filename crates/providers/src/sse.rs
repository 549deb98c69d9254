//! Incremental SSE frame decoding for provider response bodies.
//!
//! Chunks arrive at arbitrary byte boundaries; events are delimited by a
//! blank line. Only `data:` lines matter — `event:`, `id:` and `retry:`
//! lines are skipped.

/// Accumulates body chunks and yields complete `data:` payloads.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk, returning every complete payload it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..pos + 2).collect();
            if let Some(data) = extract_data(&block) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Drain whatever remains once the body closes (a final event may lack
    /// its trailing blank line).
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        extract_data(&rest)
    }
}

/// Join the `data:` lines of one SSE event block.
fn extract_data(block: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.trim().strip_prefix("data:") {
            let rest = rest.trim();
            if !rest.is_empty() {
                data_lines.push(rest);
            }
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut dec = SseDecoder::new();
        let got = dec.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(got, vec!["{\"a\":1}"]);
    }

    #[test]
    fn split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"data: par").is_empty());
        let got = dec.feed(b"tial\n\ndata: next\n\n");
        assert_eq!(got, vec!["partial", "next"]);
    }

    #[test]
    fn skips_non_data_lines() {
        let mut dec = SseDecoder::new();
        let got = dec.feed(b"event: ping\nid: 7\ndata: payload\n\n");
        assert_eq!(got, vec!["payload"]);
    }

    #[test]
    fn finish_drains_trailing_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"data: tail").is_empty());
        assert_eq!(dec.finish().as_deref(), Some("tail"));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut dec = SseDecoder::new();
        let got = dec.feed(b"data: [DONE]\n\n");
        assert_eq!(got, vec!["[DONE]"]);
    }
}
