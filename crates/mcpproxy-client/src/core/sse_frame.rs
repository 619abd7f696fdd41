//! Minimal `text/event-stream` framer shared by the streamable-http and sse
//! Core Clients. Only the `event:`/`data:` fields matter to MCP's use of SSE;
//! `id:`/`retry:` and comment lines are accepted and ignored.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser: feed it arbitrary byte chunks as they arrive off the
/// wire, get back however many complete events that chunk completed.
#[derive(Default)]
pub struct SseEventParser {
    buffer: String,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(split_at) = find_event_boundary(&self.buffer) {
            let (raw_event, rest) = self.buffer.split_at(split_at);
            let raw_event = raw_event.to_string();
            let rest = rest.trim_start_matches(['\n', '\r']).to_string();
            if let Some(event) = parse_one_event(&raw_event) {
                events.push(event);
            }
            self.buffer = rest;
        }

        events
    }
}

fn find_event_boundary(buffer: &str) -> Option<usize> {
    buffer.find("\n\n").or_else(|| buffer.find("\r\n\r\n"))
}

fn parse_one_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
        }
        // id:/retry:/comment lines are intentionally ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_complete_event() {
        let mut parser = SseEventParser::new();
        let events = parser.push("event: message\ndata: {\"ok\":true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"ok\":true}");
    }

    #[test]
    fn buffers_a_partial_event_across_chunks() {
        let mut parser = SseEventParser::new();
        assert!(parser.push("event: message\ndata: {\"a").is_empty());
        let events = parser.push("\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multiple_data_lines_with_newline() {
        let mut parser = SseEventParser::new();
        let events = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn ignores_comment_and_id_lines() {
        let mut parser = SseEventParser::new();
        let events = parser.push(": keep-alive\nid: 5\ndata: hi\n\n");
        assert_eq!(events[0].data, "hi");
    }
}
