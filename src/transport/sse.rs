//! SSE framing helpers shared by the streamable-HTTP and legacy-SSE
//! transports: event parsing, a bounded retention window for `Last-Event-ID`
//! resumption, and backpressure accounting.

use std::collections::VecDeque;

use serde_json::Value;

/// One parsed `text/event-stream` event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Parse a raw SSE body into its constituent events (`\n\n`-delimited
/// blocks, `field: value` lines, with `data:` lines joined by `\n`).
pub fn parse_events(body: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    for block in body.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        let mut id = None;
        let mut event = None;
        let mut data_lines = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("id:") {
                id = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if !data_lines.is_empty() {
            events.push(SseEvent { id, event, data: data_lines.join("\n") });
        }
    }
    events
}

/// The streamable-HTTP transport expects exactly one terminal JSON-RPC
/// response carried as the final event's `data` payload.
pub fn extract_final_json(body: &str) -> Option<Value> {
    parse_events(body).last().and_then(|e| serde_json::from_str(&e.data).ok())
}

/// Bounded event-id retention window backing `Last-Event-ID` resumption: a
/// client that reconnects with an id still in the window replays from
/// there; an id that has aged out forces a fresh subscription instead of a
/// silent gap.
pub struct RetentionWindow {
    capacity: usize,
    events: VecDeque<SseEvent>,
}

impl RetentionWindow {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, events: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, event: SseEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events strictly after `last_event_id`, or `None` if that id has
    /// already aged out of the window (caller must resubscribe fresh).
    pub fn replay_after(&self, last_event_id: &str) -> Option<Vec<SseEvent>> {
        let pos = self.events.iter().position(|e| e.id.as_deref() == Some(last_event_id))?;
        Some(self.events.iter().skip(pos + 1).cloned().collect())
    }
}

/// Incremental counterpart to [`parse_events`] for a transport that only
/// ever sees the body as it arrives off the wire in arbitrary byte chunks:
/// buffers partial blocks across calls and returns just the events that
/// completed since the last call.
#[derive(Default)]
pub struct IncrementalParser {
    buffer: String,
}

impl IncrementalParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of raw bytes (lossily decoded as UTF-8, since SSE
    /// is a text format and a chunk boundary may split a multi-byte
    /// character but never a field line). Returns the events whose
    /// terminating blank line has now been seen.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut completed = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            completed.extend(parse_events(&block));
        }
        completed
    }
}

/// High/low water-mark backpressure gate for a single subscriber: producers
/// stop emitting once `high` unacknowledged events are buffered and resume
/// only once the buffer drains back to `low`.
pub struct BackpressureGate {
    high: usize,
    low: usize,
    buffered: usize,
    paused: bool,
}

impl BackpressureGate {
    pub fn new(low: usize, high: usize) -> Self {
        assert!(low <= high, "low water mark must not exceed high water mark");
        Self { high, low, buffered: 0, paused: false }
    }

    /// Returns `true` if the producer should keep emitting.
    pub fn on_enqueue(&mut self) -> bool {
        self.buffered += 1;
        if self.buffered >= self.high {
            self.paused = true;
        }
        !self.paused
    }

    pub fn on_drain(&mut self) -> bool {
        self.buffered = self.buffered.saturating_sub(1);
        if self.paused && self.buffered <= self.low {
            self.paused = false;
        }
        !self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_line_data_and_id() {
        let body = "id: 5\nevent: message\ndata: line one\ndata: line two\n\n";
        let events = parse_events(body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("5"));
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn extract_final_json_picks_last_event() {
        let body = "data: {\"a\":1}\n\ndata: {\"a\":2}\n\n";
        assert_eq!(extract_final_json(body), Some(serde_json::json!({"a": 2})));
    }

    #[test]
    fn retention_window_evicts_oldest_beyond_capacity() {
        let mut window = RetentionWindow::new(2);
        window.push(SseEvent { id: Some("1".into()), event: None, data: "a".into() });
        window.push(SseEvent { id: Some("2".into()), event: None, data: "b".into() });
        window.push(SseEvent { id: Some("3".into()), event: None, data: "c".into() });
        assert!(window.replay_after("1").is_none());
        let replay = window.replay_after("2").unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id.as_deref(), Some("3"));
    }

    #[test]
    fn incremental_parser_handles_events_split_across_chunks() {
        let mut parser = IncrementalParser::new();
        assert!(parser.push(b"id: 1\nevent: mess").is_empty());
        let completed = parser.push(b"age\ndata: {\"a\":1}\n\nid: 2\ndata: {\"a\":2}\n\ndata:");
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].id.as_deref(), Some("1"));
        assert_eq!(completed[0].data, "{\"a\":1}");
        assert_eq!(completed[1].id.as_deref(), Some("2"));
        let rest = parser.push(b" {\"a\":3}\n\n");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data, "{\"a\":3}");
    }

    #[test]
    fn backpressure_gate_pauses_at_high_mark_and_resumes_at_low_mark() {
        let mut gate = BackpressureGate::new(1, 3);
        assert!(gate.on_enqueue());
        assert!(gate.on_enqueue());
        assert!(!gate.on_enqueue()); // hit high water mark
        assert!(gate.is_paused());
        assert!(!gate.on_drain()); // 2 buffered, still above low mark
        assert!(gate.on_drain()); // 1 buffered, at low mark, resumes
        assert!(!gate.is_paused());
    }
}
