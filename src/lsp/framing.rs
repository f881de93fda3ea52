//! LSP message framing layer
//!
//! Handles LSP-specific message framing using Content-Length headers
//! as specified in the Language Server Protocol specification.
//!
//! Wire format of one frame:
//! `Content-Length: <length>\r\n\r\n<content>`
//!
//! Decoding is incremental: bytes are fed into a [`FrameBuffer`] in whatever
//! chunks the transport delivers, and complete frames are extracted with an
//! explicit cursor advancing over a single accumulator. Headers are parsed
//! strictly from the start of unconsumed data; a malformed frame is logged
//! and skipped, never fatal to the stream.

use serde_json::Value;
use tracing::{trace, warn};

/// Maximum frame payload size to prevent memory exhaustion
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encode a JSON-RPC value into one length-prefixed frame
///
/// The declared length is the exact UTF-8 byte length of the JSON encoding.
pub fn encode_frame(message: &Value) -> Vec<u8> {
    let payload = message.to_string();
    let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(payload.as_bytes());
    frame
}

/// One step of the frame extraction loop
enum FrameStep {
    /// Not enough buffered data for a complete frame
    Incomplete,
    /// A complete frame was parsed, plus the number of bytes consumed
    Message(Value, usize),
    /// A malformed region was skipped; continue from the new offset
    Skip(usize),
    /// Header consumed; `remaining` payload bytes must be discarded as they
    /// arrive, never accumulated
    SkipPayload { consumed: usize, remaining: usize },
}

/// Incremental decoder for a stream of length-prefixed JSON-RPC frames
///
/// Invariant: after each [`feed`](FrameBuffer::feed) call the accumulator
/// holds only trailing partial bytes, never a complete undispatched frame.
/// An oversize declared length never inflates the accumulator either: its
/// payload is discarded byte-for-byte as it arrives.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,

    /// Payload bytes of a rejected frame still owed to the discard state
    skip_remaining: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes awaiting more data
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and extract every complete frame now available
    ///
    /// Behaves identically whether the stream arrives a byte at a time or in
    /// whole-message chunks.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut incoming = bytes;

        // Owed discard bytes come straight off the input, bypassing the
        // accumulator entirely
        if self.skip_remaining > 0 {
            let discard = self.skip_remaining.min(incoming.len());
            self.skip_remaining -= discard;
            incoming = &incoming[discard..];
        }
        if incoming.is_empty() {
            return Vec::new();
        }

        self.buf.extend_from_slice(incoming);

        let mut messages = Vec::new();
        let mut cursor = 0;

        loop {
            match Self::next_frame(&self.buf[cursor..]) {
                FrameStep::Incomplete => break,
                FrameStep::Message(message, consumed) => {
                    messages.push(message);
                    cursor += consumed;
                }
                FrameStep::Skip(consumed) => {
                    cursor += consumed;
                }
                FrameStep::SkipPayload { consumed, remaining } => {
                    cursor += consumed;
                    let buffered = (self.buf.len() - cursor).min(remaining);
                    cursor += buffered;
                    self.skip_remaining = remaining - buffered;
                    if self.skip_remaining > 0 {
                        break;
                    }
                }
            }
        }

        self.buf.drain(..cursor);
        messages
    }

    /// Try to extract one frame starting at offset 0 of `data`
    fn next_frame(data: &[u8]) -> FrameStep {
        let Some(header_end) = find_subsequence(data, HEADER_TERMINATOR) else {
            return FrameStep::Incomplete;
        };

        let content_start = header_end + HEADER_TERMINATOR.len();

        let content_length = match parse_content_length(&data[..header_end]) {
            Some(len) if len <= MAX_MESSAGE_SIZE => len,
            Some(len) => {
                warn!(
                    "Dropping oversize frame: {} bytes (max {})",
                    len, MAX_MESSAGE_SIZE
                );
                // Waiting for an attacker-declared length to arrive would
                // buffer without bound; discard the payload as it streams in
                return FrameStep::SkipPayload {
                    consumed: content_start,
                    remaining: len,
                };
            }
            None => {
                warn!(
                    "Malformed frame header, skipping: {:?}",
                    String::from_utf8_lossy(&data[..header_end])
                );
                // Without a usable length the payload boundary is unknown;
                // skip the header block and resynchronize on the next one
                return FrameStep::Skip(content_start);
            }
        };

        if data.len() < content_start + content_length {
            trace!(
                "Incomplete frame: need {} more bytes",
                content_start + content_length - data.len()
            );
            return FrameStep::Incomplete;
        }

        let payload = &data[content_start..content_start + content_length];
        let consumed = content_start + content_length;

        match serde_json::from_slice::<Value>(payload) {
            Ok(message) => {
                trace!("Parsed complete frame ({} bytes)", content_length);
                FrameStep::Message(message, consumed)
            }
            Err(e) => {
                warn!("Dropping unparsable frame payload: {}", e);
                FrameStep::Skip(consumed)
            }
        }
    }
}

/// Parse the Content-Length value from a frame's header block
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    for line in header.split("\r\n") {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame_bytes(message: &Value) -> Vec<u8> {
        encode_frame(message)
    }

    #[test]
    fn test_encode_frame_header() {
        let message = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let payload = message.to_string();
        let frame = encode_frame(&message);

        let expected_header = format!("Content-Length: {}\r\n\r\n", payload.len());
        assert!(frame.starts_with(expected_header.as_bytes()));
        assert!(frame.ends_with(payload.as_bytes()));
    }

    #[test]
    fn test_encode_frame_counts_utf8_bytes() {
        let message = json!({"label": "héllo"});
        let frame = encode_frame(&message);

        let header_end = find_subsequence(&frame, b"\r\n\r\n").unwrap();
        let declared = parse_content_length(&frame[..header_end]).unwrap();
        assert_eq!(declared, frame.len() - header_end - 4);
        // Byte length, not char count
        assert_eq!(declared, message.to_string().len());
    }

    #[test]
    fn test_feed_whole_frame() {
        let message = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        let mut buffer = FrameBuffer::new();

        let decoded = buffer.feed(&frame_bytes(&message));
        assert_eq!(decoded, vec![message]);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_feed_multiple_frames_one_chunk() {
        let first = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let second = json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown"});

        let mut combined = frame_bytes(&first);
        combined.extend(frame_bytes(&second));

        let mut buffer = FrameBuffer::new();
        let decoded = buffer.feed(&combined);
        assert_eq!(decoded, vec![first, second]);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_delivery() {
        let messages = vec![
            json!({"jsonrpc": "2.0", "id": 1, "result": {"items": [{"label": "foo"}]}}),
            json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"message": "hî"}}),
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "nope"}}),
        ];

        let mut stream = Vec::new();
        for message in &messages {
            stream.extend(frame_bytes(message));
        }

        let mut whole = FrameBuffer::new();
        let whole_decoded = whole.feed(&stream);

        let mut trickle = FrameBuffer::new();
        let mut trickle_decoded = Vec::new();
        for byte in &stream {
            trickle_decoded.extend(trickle.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(whole_decoded, messages);
        assert_eq!(trickle_decoded, messages);
        assert_eq!(trickle.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let message = json!({"jsonrpc": "2.0", "id": 7, "result": null});
        let frame = frame_bytes(&message);
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut buffer = FrameBuffer::new();
        assert!(buffer.feed(head).is_empty());
        assert_eq!(buffer.feed(tail), vec![message]);
    }

    #[test]
    fn test_malformed_payload_is_skipped_stream_continues() {
        let bad = b"Content-Length: 9\r\n\r\nnot json!";
        let good = json!({"jsonrpc": "2.0", "id": 3, "result": 42});

        let mut stream = bad.to_vec();
        stream.extend(frame_bytes(&good));

        let mut buffer = FrameBuffer::new();
        let decoded = buffer.feed(&stream);
        assert_eq!(decoded, vec![good]);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_invalid_content_length_resynchronizes() {
        let good = json!({"jsonrpc": "2.0", "id": 4, "result": true});

        let mut stream = b"Content-Length: bogus\r\n\r\n".to_vec();
        stream.extend(frame_bytes(&good));

        let mut buffer = FrameBuffer::new();
        let decoded = buffer.feed(&stream);
        assert_eq!(decoded, vec![good]);
    }

    #[test]
    fn test_oversize_declaration_never_grows_the_buffer() {
        // A length no peer could ever deliver; the payload must be
        // discarded as it streams in, not awaited
        let declared = usize::MAX / 2;
        let header = format!("Content-Length: {declared}\r\n\r\n");

        let mut buffer = FrameBuffer::new();
        assert!(buffer.feed(header.as_bytes()).is_empty());
        assert_eq!(buffer.pending_bytes(), 0);

        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..4 {
            assert!(buffer.feed(&chunk).is_empty());
            assert_eq!(buffer.pending_bytes(), 0);
        }
    }

    #[test]
    fn test_stream_resumes_after_oversize_payload() {
        let declared = MAX_MESSAGE_SIZE + 10;
        let header = format!("Content-Length: {declared}\r\n\r\n");
        let good = json!({"jsonrpc": "2.0", "id": 6, "result": "ok"});

        let mut buffer = FrameBuffer::new();
        assert!(buffer.feed(header.as_bytes()).is_empty());

        // Deliver exactly the declared payload in chunks, then a real frame
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..16 {
            assert!(buffer.feed(&chunk).is_empty());
        }
        assert!(buffer.feed(&[b'x'; 10]).is_empty());
        assert_eq!(buffer.pending_bytes(), 0);

        assert_eq!(buffer.feed(&frame_bytes(&good)), vec![good]);
    }

    #[test]
    fn test_oversize_header_and_payload_in_one_chunk() {
        let payload = vec![b'x'; MAX_MESSAGE_SIZE + 1];
        let good = json!({"jsonrpc": "2.0", "id": 8, "result": false});

        let mut stream = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        stream.extend_from_slice(&payload);
        stream.extend(frame_bytes(&good));

        let mut buffer = FrameBuffer::new();
        assert_eq!(buffer.feed(&stream), vec![good]);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_extra_headers_are_tolerated() {
        let message = json!({"jsonrpc": "2.0", "id": 5, "result": []});
        let payload = message.to_string();
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            payload.len(),
            payload
        );

        let mut buffer = FrameBuffer::new();
        assert_eq!(buffer.feed(framed.as_bytes()), vec![message]);
    }
}
