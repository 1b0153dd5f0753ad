//! Server-Sent-Events frame decoding.
//!
//! Splits a raw byte stream into blank-line delimited frames and parses each
//! payload as JSON. Two grammars are supported:
//!
//! * [`Grammar::LineJson`]: every `data:` line carries one JSON envelope and a
//!   literal `[DONE]` payload terminates the stream.
//! * [`Grammar::NamedEvent`]: a frame has an `event:` line plus one or more
//!   `data:` lines that are joined before parsing.

const DONE_SENTINEL: &str = "[DONE]";

/// Wire grammar used to turn frames into JSON payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grammar {
    LineJson,
    NamedEvent,
}

/// A decoded but unparsed protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Json {
        frame: RawFrame,
        value: serde_json::Value,
    },
    /// The `[DONE]` sentinel.
    Done,
    /// Payload was not valid JSON. Non-fatal for the stream.
    Invalid { frame: RawFrame, error: String },
}

/// Incremental decoder holding the bytes of an unterminated trailing frame.
#[derive(Debug)]
pub struct FrameDecoder {
    grammar: Grammar,
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a frame delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(grammar: Grammar) -> Self {
        Self {
            grammar,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    pub fn grammar(&self) -> Grammar {
        self.grammar
    }

    /// Feeds one chunk and returns every frame it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.buf.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        // A delimiter may straddle the previous chunk boundary.
        let mut from = self.scanned.saturating_sub(3);
        while let Some((end, delim_len)) = frame_end(&self.buf, from) {
            let rest = self.buf.split_off(end + delim_len);
            let mut block = std::mem::replace(&mut self.buf, rest);
            block.truncate(end);
            self.decode_block(&block, &mut decoded);
            from = 0;
        }
        self.scanned = self.buf.len();
        decoded
    }

    /// Flushes a final frame that was not followed by a blank line.
    ///
    /// Called once the byte source is exhausted.
    pub fn finish(&mut self) -> Vec<DecodedFrame> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let mut decoded = Vec::new();
        self.decode_block(&rest, &mut decoded);
        decoded
    }

    /// Returns true if bytes of an incomplete frame are buffered.
    pub fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    fn decode_block(&self, bytes: &[u8], out: &mut Vec<DecodedFrame>) {
        let fields = FrameFields::parse(bytes);
        if fields.data.is_empty() {
            return;
        }
        match self.grammar {
            Grammar::LineJson => {
                for data in fields.data {
                    out.extend(decode_payload(fields.event.clone(), data, true));
                }
            }
            Grammar::NamedEvent => {
                out.extend(decode_payload(fields.event, fields.data.join("\n"), false));
            }
        }
    }
}

/// Returns `(frame_len, delimiter_len)` of the first blank line at or after
/// `from`.
fn frame_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buf.len()).find_map(|i| {
        let tail = &buf[i..];
        if tail.starts_with(b"\n\n") {
            Some((i, 2))
        } else if tail.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

/// The `event` and `data` fields of one frame. Other fields and comment
/// lines are dropped.
#[derive(Default)]
struct FrameFields {
    event: Option<String>,
    data: Vec<String>,
}

impl FrameFields {
    fn parse(bytes: &[u8]) -> Self {
        let mut fields = Self::default();
        for line in String::from_utf8_lossy(bytes).lines() {
            let (name, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match name {
                "event" => fields.event = Some(value.to_string()),
                "data" => fields.data.push(value.to_string()),
                _ => {}
            }
        }
        fields
    }
}

fn decode_payload(event: Option<String>, data: String, sentinel: bool) -> Option<DecodedFrame> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    if sentinel && trimmed == DONE_SENTINEL {
        return Some(DecodedFrame::Done);
    }
    let frame = RawFrame { event, data };
    Some(match serde_json::from_str::<serde_json::Value>(&frame.data) {
        Ok(value) => DecodedFrame::Json { frame, value },
        Err(e) => DecodedFrame::Invalid {
            frame,
            error: format!("invalid SSE JSON frame: {e}"),
        },
    })
}
