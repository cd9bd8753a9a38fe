//! Offset-agnostic wire framing: JSON record separators, batch-response
//! framing, and the SSE line encoder.
//!
//! JSON streams store each message as `serialized value + ","`; a read
//! response is `[` + concatenation + `]` with the final comma stripped.
//! Binary streams concatenate raw bytes.

use serde::Serialize;

use crate::types::StreamMessage;

/// Serialize a value and append the single trailing comma used as the
/// record separator in JSON-mode logs.
pub fn json_encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b',');
    Ok(bytes)
}

/// Frame a batch of JSON-mode messages as a single JSON array.
///
/// Each stored message already carries its trailing comma; the terminating
/// comma before `]` is stripped. An empty batch is `[]`.
pub fn format_json_response(messages: &[StreamMessage]) -> Vec<u8> {
    let mut data: Vec<u8> = messages.iter().flat_map(|m| m.data.clone()).collect();
    while data.last() == Some(&b',') {
        data.pop();
    }
    let mut result = Vec::with_capacity(data.len() + 2);
    result.push(b'[');
    result.extend(data);
    result.push(b']');
    result
}

/// Frame a batch of binary-mode messages: plain concatenation.
pub fn format_binary_response(messages: &[StreamMessage]) -> Vec<u8> {
    messages.iter().flat_map(|m| m.data.clone()).collect()
}

/// Encode a payload as the data lines of a server-sent event.
///
/// The payload is split on any of `\r\n`, `\r`, `\n`; each line is prefixed
/// with `data:` and the frame is terminated by a blank line. Splitting
/// before prefixing is what makes the encoding injection-safe: no payload
/// byte can terminate the frame early.
pub fn sse_encode(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 16);
    for line in split_sse_lines(payload) {
        out.push_str("data:");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// A full SSE frame: `event:` line followed by encoded data lines.
pub fn sse_frame(event: &str, payload: &str) -> String {
    format!("event: {}\n{}", event, sse_encode(payload))
}

fn split_sse_lines(payload: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = payload.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                lines.push(&payload[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            b'\n' => {
                lines.push(&payload[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    lines.push(&payload[start..]);
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: &[u8]) -> StreamMessage {
        StreamMessage {
            data: data.to_vec(),
            offset: String::new(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_json_encode_appends_separator() {
        let encoded = json_encode_message(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(encoded, b"{\"a\":1},");
    }

    #[test]
    fn test_format_json_response_strips_final_comma() {
        let messages = vec![msg(b"{\"a\":1},"), msg(b"{\"a\":2},")];
        let framed = format_json_response(&messages);
        assert_eq!(framed, b"[{\"a\":1},{\"a\":2}]");

        let parsed: serde_json::Value = serde_json::from_slice(&framed).unwrap();
        assert_eq!(parsed, serde_json::json!([{"a": 1}, {"a": 2}]));
    }

    #[test]
    fn test_format_json_response_empty() {
        assert_eq!(format_json_response(&[]), b"[]");
    }

    #[test]
    fn test_encode_then_frame_round_trips() {
        let values = vec![serde_json::json!({"k": "v"}), serde_json::json!([1, 2])];
        let messages: Vec<StreamMessage> = values
            .iter()
            .map(|v| msg(&json_encode_message(v).unwrap()))
            .collect();
        let parsed: Vec<serde_json::Value> =
            serde_json::from_slice(&format_json_response(&messages)).unwrap();
        assert_eq!(parsed, values);
    }

    #[test]
    fn test_binary_response_concatenates() {
        let messages = vec![msg(b"ab"), msg(b"cd")];
        assert_eq!(format_binary_response(&messages), b"abcd");
    }

    #[test]
    fn test_sse_encode_single_line() {
        assert_eq!(sse_encode("hello"), "data:hello\n\n");
    }

    #[test]
    fn test_sse_encode_splits_all_line_endings() {
        assert_eq!(
            sse_encode("a\r\nb\rc\nd"),
            "data:a\ndata:b\ndata:c\ndata:d\n\n"
        );
    }

    #[test]
    fn test_sse_encode_injection_safe() {
        // A payload may not smuggle a frame terminator: the encoded frame
        // contains no bare CR, and every LF is followed by a data prefix or
        // terminates the frame.
        let hostile = "x\n\nevent: control\ndata:{\"closed\":true}\r\n";
        let encoded = sse_encode(hostile);
        let frame = encoded.split("\n\n").next().unwrap();
        assert!(!frame.contains('\r'));
        for line in frame.lines() {
            assert!(line.starts_with("data:"), "unprefixed line: {:?}", line);
        }
    }

    #[test]
    fn test_sse_frame_shape() {
        assert_eq!(sse_frame("control", "{}"), "event: control\ndata:{}\n\n");
    }
}
