//! Incremental Server-Sent Events decoder.
//!
//! Fed raw transport chunks, yields complete events. The server's control
//! frames carry `{offset, cursor?, upToDate?, closed?}`.

use serde::Deserialize;

/// Decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Data event with payload (multi-line payloads rejoined with `\n`).
    Data(String),
    /// Control event with reader-state metadata.
    Control(ControlFrame),
}

/// The control event payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlFrame {
    pub offset: String,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(rename = "upToDate", default)]
    pub up_to_date: bool,
    #[serde(default)]
    pub closed: bool,
}

/// Push-based SSE decoder: `push` transport bytes in, `next_event` complete
/// events out.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw transport bytes to the decode buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Decode the next complete event, if the buffer holds one.
    ///
    /// Malformed control payloads yield `None` for that event; other field
    /// lines (`id:`, `retry:`, comments) are ignored per the SSE spec.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                // Blank line = dispatch
                if let Some(event) = self.dispatch() {
                    return Some(event);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event_type = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim_start().to_string());
            }
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_type = None;
            return None;
        }

        let data = self.data_lines.join("\n");
        let event_type = self.event_type.take();
        self.data_lines.clear();

        match event_type.as_deref() {
            Some("control") => serde_json::from_str::<ControlFrame>(&data)
                .ok()
                .map(SseEvent::Control),
            _ => Some(SseEvent::Data(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(input: &str) -> Vec<SseEvent> {
        let mut decoder = SseDecoder::new();
        decoder.push(input.as_bytes());
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_data_event() {
        let events = drain("event: data\ndata: hello world\n\n");
        assert_eq!(events, vec![SseEvent::Data("hello world".to_string())]);
    }

    #[test]
    fn test_default_event_type_is_data() {
        let events = drain("data: payload\n\n");
        assert_eq!(events, vec![SseEvent::Data("payload".to_string())]);
    }

    #[test]
    fn test_parse_control_event() {
        let events = drain(
            "event: control\ndata: {\"offset\":\"0000000000000000_0000000000000002\",\"cursor\":\"9\",\"upToDate\":true}\n\n",
        );
        match &events[0] {
            SseEvent::Control(frame) => {
                assert_eq!(frame.offset, "0000000000000000_0000000000000002");
                assert_eq!(frame.cursor.as_deref(), Some("9"));
                assert!(frame.up_to_date);
                assert!(!frame.closed);
            }
            other => panic!("expected control, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_closed_control() {
        let events = drain("event: control\ndata: {\"offset\":\"-1\",\"closed\":true}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Control(ControlFrame {
                offset: "-1".to_string(),
                cursor: None,
                up_to_date: false,
                closed: true,
            })]
        );
    }

    #[test]
    fn test_multi_line_data_rejoined() {
        let events = drain("data: a\ndata: b\n\n");
        assert_eq!(events, vec![SseEvent::Data("a\nb".to_string())]);
    }

    #[test]
    fn test_incremental_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: da");
        assert!(decoder.next_event().is_none());
        decoder.push(b"ta\ndata: split");
        assert!(decoder.next_event().is_none());
        decoder.push(b"\n\n");
        assert_eq!(
            decoder.next_event(),
            Some(SseEvent::Data("split".to_string()))
        );
    }

    #[test]
    fn test_ignores_comments_and_unknown_fields() {
        let events = drain(": comment\nid: 5\nretry: 100\ndata: x\n\n");
        assert_eq!(events, vec![SseEvent::Data("x".to_string())]);
    }

    #[test]
    fn test_round_trips_server_encoding() {
        let payload = "line one\nline two";
        let encoded = crate::codec::sse_frame("data", payload);
        let events = drain(&encoded);
        assert_eq!(events, vec![SseEvent::Data(payload.to_string())]);
    }
}
