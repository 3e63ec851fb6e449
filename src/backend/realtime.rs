//! Server-sent event framing for the backend's realtime channel.

use serde::Deserialize;

/// Event name of the first frame, carrying the connection's client id.
pub const CONNECT_EVENT: &str = "PB_CONNECT";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub client_id: String,
}

/// Incremental decoder: feed raw chunks, get complete frames back.
///
/// Bytes are buffered until a line is complete, so a character split across
/// two chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let bytes: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.has_data || !self.current.event.is_empty() {
                    frames.push(std::mem::take(&mut self.current));
                }
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.current.event = value.to_string(),
                "id" => self.current.id = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }
        frames
    }
}

/// Subscription topic for a collection: `*` for every record, or one id.
pub fn topic(collection: &str, pattern: &str) -> String {
    format!("{}/{}", collection, pattern)
}

/// True when a frame's event name belongs to a subscription on `collection`.
pub fn frame_matches(frame: &SseFrame, collection: &str) -> bool {
    frame
        .event
        .split('?')
        .next()
        .and_then(|name| name.split_once('/'))
        .map(|(name, _)| name == collection)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"id:abc\nevent:PB_CON").is_empty());
        let frames = decoder.push(b"NECT\ndata:{\"clientId\":\"abc\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, CONNECT_EVENT);
        assert_eq!(frames[0].id.as_deref(), Some("abc"));

        let payload: ConnectPayload = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(payload.client_id, "abc");
    }

    #[test]
    fn keeps_multibyte_characters_split_between_chunks() {
        let body = "event: procedures/*\ndata: {\"name\":\"Kumāra\"}\n\n".as_bytes();
        let split = body.iter().position(|&byte| byte == 0xC4).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&body[..split]).is_empty());
        let frames = decoder.push(&body[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"name\":\"Kumāra\"}");
        assert!(!frames[0].data.contains('\u{FFFD}'));
    }

    #[test]
    fn handles_crlf_comments_and_multiline_data() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b": keepalive\r\nevent: procedures/*\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "procedures/*");
        assert_eq!(frames[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn matches_collection_topics() {
        let frame = SseFrame { event: topic("procedures", "*"), ..Default::default() };
        assert!(frame_matches(&frame, "procedures"));
        assert!(!frame_matches(&frame, "patients"));

        let with_options = SseFrame { event: "procedures/abc?options=%7B%7D".into(), ..Default::default() };
        assert!(frame_matches(&with_options, "procedures"));
    }
}
