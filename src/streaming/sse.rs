/// Incremental SSE line parser.
///
/// Feeds arrive as arbitrary byte chunks; the trailing partial line is kept
/// across pushes so a frame split mid-line still parses. Only `data:` lines
/// matter; everything else (event names, comments, blank lines) is skipped.
#[derive(Default)]
pub struct SseParser {
    pending: String,
    saw_data: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// One `data:` payload (without the prefix)
    Data(String),
    /// The `data: [DONE]` terminator
    Done,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any `data:` frame has been observed so far
    pub fn saw_data(&self) -> bool {
        self.saw_data
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(event) = self.parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush the trailing line after the upstream closes without a newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.pending);
        self.parse_line(line.trim_end_matches('\r'))
    }

    fn parse_line(&mut self, line: &str) -> Option<SseEvent> {
        let data = line.strip_prefix("data:")?.trim_start();
        self.saw_data = true;
        if data == "[DONE]" {
            Some(SseEvent::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseEvent::Data(data.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_frames() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn test_partial_line_kept_across_pushes() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"text\":\"he").is_empty());
        let events = parser.push(b"llo\"}\n");
        assert_eq!(events, vec![SseEvent::Data("{\"text\":\"hello\"}".to_string())]);
    }

    #[test]
    fn test_non_data_lines_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: ping\nretry: 100\n: comment\ndata: x\n");
        assert_eq!(events, vec![SseEvent::Data("x".to_string())]);
        assert!(parser.saw_data());
    }

    #[test]
    fn test_crlf_lines() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: y\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("y".to_string())]);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        assert_eq!(parser.finish(), Some(SseEvent::Data("tail".to_string())));
    }

    #[test]
    fn test_no_data_seen() {
        let mut parser = SseParser::new();
        parser.push(b"{\"whole\": \"json body\"}");
        assert!(!parser.saw_data());
    }
}
