//! Decoder for the `text/event-stream` framing used by the change stream.
//!
//! A frame is a run of `field: value` lines terminated by a blank line. Only
//! `event` and `data` fields are interpreted; comment lines (leading `:`) and
//! unknown fields are ignored.

use serde_json::Value;

use super::NetworkError;
use crate::model::{ChangeEvent, ChangeKind};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

/// Largest frame accepted before the partial frame is dropped.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Incremental frame splitter; chunks may cut frames (and lines) anywhere.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
    // Skipping the rest of an oversized frame.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..end + sep_len).take(end).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }

        if self.buf.len() > self.max_frame_len {
            if !self.discarding {
                log::warn!(
                    "Dropping malformed frame: no terminator within {} bytes",
                    self.max_frame_len
                );
            }
            self.discarding = true;
            // Keep a tail so a terminator split across chunks is still found.
            let keep = self.buf.len().min(3);
            self.buf.drain(..self.buf.len() - keep);
        }
        frames
    }
}

fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &str) -> Option<Frame> {
    let mut frame = Frame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if frame.event.is_none() && data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

/// Interpret a frame as a change of `collection`.
///
/// Returns `Ok(None)` for frames that carry nothing to apply (keep-alives,
/// empty frames, the `null` sentinel). `StreamClosed` means the server ended
/// the stream on purpose; any other error is a malformed frame.
pub fn parse_change(collection: &str, frame: &Frame) -> Result<Option<ChangeEvent>, NetworkError> {
    let kind = match frame.event.as_deref().unwrap_or("put") {
        "put" => ChangeKind::Put,
        "patch" => ChangeKind::Patch,
        "keep-alive" => return Ok(None),
        "cancel" | "auth_revoked" => {
            return Err(NetworkError::StreamClosed(
                frame.event.clone().unwrap_or_default(),
            ))
        }
        other => {
            return Err(NetworkError::SerializationError(format!(
                "unknown event type '{other}'"
            )))
        }
    };

    let data = frame.data.trim();
    if data.is_empty() || data == "null" {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(data)?;
    let (path, data) = match value {
        Value::Object(mut map) if map.contains_key("path") => {
            let path = match map.remove("path") {
                Some(Value::String(p)) => p,
                _ => {
                    return Err(NetworkError::SerializationError(
                        "frame path is not a string".to_string(),
                    ))
                }
            };
            (path, map.remove("data").unwrap_or(Value::Null))
        }
        other => ("/".to_string(), other),
    };

    Ok(Some(ChangeEvent {
        collection: collection.to_string(),
        kind,
        path,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: put\nda").is_empty());
        let frames = decoder.push(b"ta: {\"path\":\"/c1\",\"data\":1}\n\nevent: keep");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("put"));
        assert_eq!(frames[0].data, "{\"path\":\"/c1\",\"data\":1}");

        let frames = decoder.push(b"-alive\ndata: null\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("keep-alive"));
    }

    #[test]
    fn crlf_framing_and_comments_are_accepted() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": hello\r\nevent: patch\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("patch"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn put_frame_becomes_change_event() {
        let frame = Frame {
            event: Some("put".to_string()),
            data: r#"{"path":"/c1","data":{"name":"Acme"}}"#.to_string(),
        };
        let change = parse_change("companies", &frame).unwrap().unwrap();
        assert_eq!(change.collection, "companies");
        assert_eq!(change.kind, ChangeKind::Put);
        assert_eq!(change.path, "/c1");
        assert_eq!(change.data, json!({"name": "Acme"}));
    }

    #[test]
    fn bare_data_frame_defaults_to_root_put() {
        let frame = Frame {
            event: None,
            data: r#"{"c1":{"name":"Acme"}}"#.to_string(),
        };
        let change = parse_change("companies", &frame).unwrap().unwrap();
        assert_eq!(change.kind, ChangeKind::Put);
        assert_eq!(change.path, "/");
    }

    #[test]
    fn sentinel_and_keep_alive_frames_are_skipped() {
        let null_frame = Frame {
            event: Some("put".to_string()),
            data: "null".to_string(),
        };
        assert!(parse_change("c", &null_frame).unwrap().is_none());

        let keep_alive = Frame {
            event: Some("keep-alive".to_string()),
            data: String::new(),
        };
        assert!(parse_change("c", &keep_alive).unwrap().is_none());
    }

    #[test]
    fn malformed_and_closing_frames_are_distinguished() {
        let malformed = Frame {
            event: Some("put".to_string()),
            data: "{not json".to_string(),
        };
        assert!(matches!(
            parse_change("c", &malformed),
            Err(NetworkError::SerializationError(_))
        ));

        let revoked = Frame {
            event: Some("auth_revoked".to_string()),
            data: "credential is no longer valid".to_string(),
        };
        assert!(matches!(
            parse_change("c", &revoked),
            Err(NetworkError::StreamClosed(_))
        ));
    }

    #[test]
    fn oversized_frame_is_dropped_and_decoding_resumes() {
        let mut decoder = FrameDecoder::with_max_frame_len(16);

        assert!(decoder.push(b"data: 0123456789").is_empty());
        assert!(decoder.push(b"abcdefghijklmnopqrstuvwxyz").is_empty());
        assert!(decoder.buf.len() <= 16);

        let frames = decoder.push(b"\n\ndata: 1\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "1");
    }
}
