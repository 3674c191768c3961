//! Response stream decoder
//!
//! Turns the agent's `data: <json>\n` byte stream into typed frames.
//! Lines are reassembled at the byte level so multi-byte characters split
//! across transport chunks survive intact. A bad line is logged and dropped;
//! it never aborts the decode.

use crate::error::Result;
use crate::transport::ByteStream;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// One record of the response stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Reply has started; creates the assistant placeholder
    Start,
    /// Text, possibly carrying metadata sentinels
    Chunk {
        #[serde(default)]
        content: String,
    },
    /// Reply finished
    Complete,
    /// Terminal failure reported by the agent
    Error {
        #[serde(default, alias = "message")]
        error: String,
    },
}

impl Frame {
    /// Chunk frame with the given content
    pub fn chunk(content: impl Into<String>) -> Self {
        Frame::Chunk {
            content: content.into(),
        }
    }

    /// Encode as one wire record (`data: <json>\n\n`)
    pub fn to_record(&self) -> Bytes {
        let value = match self {
            Frame::Start => serde_json::json!({"type": "start"}),
            Frame::Chunk { content } => serde_json::json!({"type": "chunk", "content": content}),
            Frame::Complete => serde_json::json!({"type": "complete"}),
            Frame::Error { error } => serde_json::json!({"type": "error", "error": error}),
        };
        Bytes::from(format!("data: {}\n\n", value))
    }
}

/// Typed frame stream produced by [`decode_frames`]
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Incremental line decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = self.decode_line(&line[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever remains after the stream closed
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line)
    }

    /// Number of lines dropped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Frame> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping non-UTF-8 stream line");
                self.dropped += 1;
                return None;
            }
        };

        // Record terminator
        if line.trim().is_empty() {
            return None;
        }

        let Some(data) = line.strip_prefix("data:") else {
            tracing::debug!(line = %line, "Skipping non-data stream line");
            self.dropped += 1;
            return None;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return None;
        }

        match serde_json::from_str::<Frame>(data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(error = %e, data = %data, "Dropping unparseable stream frame");
                self.dropped += 1;
                None
            }
        }
    }
}

/// Lazily decode a response body into frames, in arrival order
pub fn decode_frames(mut body: ByteStream) -> FrameStream {
    async_stream::try_stream! {
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                yield frame;
            }
        }
        if let Some(frame) = decoder.finish() {
            yield frame;
        }
        if decoder.dropped() > 0 {
            tracing::debug!(dropped = decoder.dropped(), "Stream closed with dropped lines");
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConverseError;

    fn chunk(content: &str) -> Frame {
        Frame::chunk(content)
    }

    #[test]
    fn test_frame_serde() {
        let frame: Frame = serde_json::from_str(r#"{"type":"chunk","content":"hi"}"#).unwrap();
        assert_eq!(frame, chunk("hi"));

        let frame: Frame = serde_json::from_str(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                error: "boom".into()
            }
        );

        let frame: Frame = serde_json::from_str(r#"{"type":"start","extra":1}"#).unwrap();
        assert_eq!(frame, Frame::Start);
    }

    #[test]
    fn test_record_round_trip() {
        let frames = vec![
            Frame::Start,
            chunk("line one\nline two"),
            Frame::Error {
                error: "boom".into(),
            },
            Frame::Complete,
        ];
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for frame in &frames {
            decoded.extend(decoder.push(&frame.to_record()));
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_push_whole_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b"data: {\"type\":\"start\"}\n\ndata: {\"type\":\"chunk\",\"content\":\"Found 3 files\"}\n\ndata: {\"type\":\"complete\"}\n\n",
        );
        assert_eq!(frames, vec![Frame::Start, chunk("Found 3 files"), Frame::Complete]);
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn test_push_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"chu").is_empty());
        assert!(decoder.push(b"nk\",\"content\":\"ab").is_empty());
        let frames = decoder.push(b"c\"}\n");
        assert_eq!(frames, vec![chunk("abc")]);
    }

    #[test]
    fn test_multibyte_split() {
        let line = "data: {\"type\":\"chunk\",\"content\":\"✓ done\"}\n".as_bytes();
        let split_at = line.iter().position(|b| *b == 0xE2).unwrap() + 1;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&line[..split_at]).is_empty());
        assert_eq!(decoder.push(&line[split_at..]), vec![chunk("✓ done")]);
    }

    #[test]
    fn test_blank_lines_are_silent() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"\n\r\n   \n").is_empty());
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn test_bad_lines_dropped_without_abort() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b"garbage\ndata: {not json}\ndata: {\"type\":\"mystery\"}\ndata: {\"type\":\"complete\"}\n",
        );
        assert_eq!(frames, vec![Frame::Complete]);
        assert_eq!(decoder.dropped(), 3);
    }

    #[test]
    fn test_crlf_and_compact_prefix() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data:{\"type\":\"start\"}\r\n");
        assert_eq!(frames, vec![Frame::Start]);
    }

    #[test]
    fn test_finish_decodes_trailing_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"complete\"}").is_empty());
        assert_eq!(decoder.finish(), Some(Frame::Complete));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_decode_frames_stream() {
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"start\"}\n\ndata: {\"type\":\"chunk\",")),
            Ok(Bytes::from_static(b"\"content\":\"hello\"}\n\n")),
            Ok(Bytes::from_static(b"data: {\"type\":\"complete\"}")),
        ])
        .boxed();

        let frames: Vec<Frame> = decode_frames(body)
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec![Frame::Start, chunk("hello"), Frame::Complete]);
    }

    #[tokio::test]
    async fn test_decode_frames_transport_error() {
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"start\"}\n")),
            Err(ConverseError::Network("connection reset".into())),
        ])
        .boxed();

        let mut frames = decode_frames(body);
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::Start);
        let err = frames.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ConverseError::Network(_)));
    }
}
