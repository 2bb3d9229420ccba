//! SSE wire framing.
//!
//! [`Framer`] renders frames in the W3C EventSource text format; the
//! incremental [`SseDecoder`] parses the reverse direction. The decoder is
//! line-buffering: network reads do not align with frame boundaries, so
//! partial lines are held until the terminating newline arrives, and
//! multiple frames inside one read are all emitted.

use crate::core::error::ParseError;

/// Default name for frames that carry no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// A parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// Value of the `event:` field, if present.
    pub event_type: Option<String>,
    /// Accumulated `data:` payload; multiple lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if present.
    pub id: Option<String>,
    /// Value of the `retry:` field in milliseconds, if present and numeric.
    pub retry: Option<u64>,
}

impl SseFrame {
    /// The frame's event type, falling back to the protocol default.
    pub fn event_type_or_default(&self) -> &str {
        self.event_type.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }
}

/// Stateless SSE frame encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Framer;

impl Framer {
    /// Render one frame into `buf`.
    ///
    /// Emits `event:`, one `data:` line per payload line, then the optional
    /// `id:` and `retry:` fields, terminated by a blank line.
    pub fn encode_into(
        event_type: &str,
        data: &str,
        id: Option<&str>,
        retry_ms: Option<u64>,
        buf: &mut Vec<u8>,
    ) {
        if !event_type.is_empty() {
            buf.extend_from_slice(b"event: ");
            buf.extend_from_slice(event_type.as_bytes());
            buf.push(b'\n');
        }
        for line in data.split('\n') {
            buf.extend_from_slice(b"data: ");
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        if let Some(id) = id {
            buf.extend_from_slice(b"id: ");
            buf.extend_from_slice(id.as_bytes());
            buf.push(b'\n');
        }
        if let Some(retry) = retry_ms {
            buf.extend_from_slice(b"retry: ");
            buf.extend_from_slice(retry.to_string().as_bytes());
            buf.push(b'\n');
        }
        buf.push(b'\n');
    }

    /// Render one frame into a fresh buffer.
    pub fn encode(
        event_type: &str,
        data: &str,
        id: Option<&str>,
        retry_ms: Option<u64>,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(data.len() + event_type.len() + 32);
        Self::encode_into(event_type, data, id, retry_ms, &mut buf);
        buf
    }

    /// Render a comment frame (`: <text>`), used for keep-alive pings.
    pub fn encode_comment(text: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(text.len() + 4);
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(b"\n\n");
        buf
    }
}

/// Incremental, line-buffering SSE parser.
///
/// Feed raw bytes as they arrive; complete frames come back as soon as their
/// terminating blank line has been seen. Trailing bytes without a newline
/// stay buffered for the next `feed`.
#[derive(Debug)]
pub struct SseDecoder {
    /// Bytes not yet terminated by a newline.
    buffer: Vec<u8>,
    /// Fields of the frame currently being accumulated.
    pending: PendingFrame,
    /// Cap on a single field (and on the unterminated buffer).
    max_field_len: usize,
}

#[derive(Debug, Default)]
struct PendingFrame {
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl PendingFrame {
    fn is_empty(&self) -> bool {
        self.event_type.is_none()
            && self.data_lines.is_empty()
            && self.id.is_none()
            && self.retry.is_none()
    }

    /// Flush into a frame, or `None` when the payload is empty.
    fn take(&mut self) -> Option<SseFrame> {
        let frame = SseFrame {
            event_type: self.event_type.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        };
        if frame.data.is_empty() {
            return None;
        }
        Some(frame)
    }
}

impl SseDecoder {
    /// Create a decoder with the given single-field length cap.
    pub fn new(max_field_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pending: PendingFrame::default(),
            max_field_len,
        }
    }

    /// Feed raw bytes, returning every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseFrame>, ParseError> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_field_len {
                return Err(ParseError::FieldTooLong {
                    limit: self.max_field_len,
                });
            }
            let line = std::str::from_utf8(&line).map_err(|_| ParseError::InvalidUtf8)?;
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        // A run of bytes with no newline at all is still bounded.
        if self.buffer.len() > self.max_field_len {
            return Err(ParseError::FieldTooLong {
                limit: self.max_field_len,
            });
        }

        Ok(frames)
    }

    /// Flush the frame still being accumulated when the stream ends.
    ///
    /// The wire format only dispatches on a blank line, but a peer that
    /// closes the stream right after its last `data:` line still meant to
    /// send that frame, so an accumulated non-empty payload is returned.
    pub fn finish(&mut self) -> Result<Option<SseFrame>, ParseError> {
        if !self.buffer.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            let line = match line.strip_suffix(b"\r") {
                Some(stripped) => stripped.to_vec(),
                None => line,
            };
            if line.len() > self.max_field_len {
                return Err(ParseError::FieldTooLong {
                    limit: self.max_field_len,
                });
            }
            let line = std::str::from_utf8(&line).map_err(|_| ParseError::InvalidUtf8)?;
            // A non-blank trailing line contributes its field before the flush.
            if !line.is_empty() {
                self.consume_field(line);
            }
        }
        Ok(self.pending.take())
    }

    /// Whether a frame is partially accumulated.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.buffer.is_empty()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.pending.take();
        }
        if line.starts_with(':') {
            // Comment; keep-alive pings arrive this way.
            return None;
        }
        self.consume_field(line);
        None
    }

    fn consume_field(&mut self, line: &str) {
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                // One leading space after the colon is part of the syntax.
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            // A line with no colon is a field with an empty value.
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event_type = Some(value.to_owned()),
            "data" => self.pending.data_lines.push(value.to_owned()),
            "id" => self.pending.id = Some(value.to_owned()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.pending.retry = Some(ms);
                }
            }
            // Unknown fields are ignored per the EventSource grammar.
            _ => {}
        }
    }
}
