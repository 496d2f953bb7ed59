//! Incremental Server-Sent Events parser.

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Last event id seen on the stream
    pub id: Option<String>,
    /// Event type; `None` means the default `message` type
    pub event: Option<String>,
    /// Event data, multi-line data joined with `\n`
    pub data: String,
}

impl SseEvent {
    /// Whether this is a default-typed or explicit `message` event.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Line-oriented SSE parser that tolerates arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    last_id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let text = String::from_utf8_lossy(&raw).into_owned();
            let line = text.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                return Some(event);
            }
        }
        self.dispatch()
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
            "id" => self.last_id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {},
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            id: self.last_id.clone(),
            event,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_named_and_default_events() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /message?sessionId=abc\n\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    id: None,
                    event: Some("endpoint".to_string()),
                    data: "/message?sessionId=abc".to_string(),
                },
                SseEvent {
                    id: None,
                    event: None,
                    data: "{\"a\":1}".to_string(),
                },
            ]
        );
        assert!(events[1].is_message());
    }

    #[test]
    fn handles_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 7\r\nda").is_empty());
        assert!(parser.feed(b"ta: hel").is_empty());
        let events = parser.feed(b"lo\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\ndata: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
    }
}
