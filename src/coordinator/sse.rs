//! Incremental Server-Sent Events decoder
//!
//! Bytes arrive in arbitrary chunks from the HTTP body; `push` buffers them
//! and `next_event` yields complete events as blank-line terminators show up.

use crate::error::{Error, Result};

/// Longest line the reader holds while waiting for its newline
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One decoded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseReader {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk. Fails when an unterminated line outgrows the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_LINE_BYTES && !self.buffer.contains(&b'\n') {
            self.buffer.clear();
            return Err(Error::connection_lost(format!(
                "event stream line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
        Ok(())
    }

    /// Next complete event, or `None` until more bytes arrive
    pub fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let newline_pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let mut line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            line.pop();
            if let Some(b'\r') = line.last() {
                line.pop();
            }

            if line.is_empty() {
                if self.event.is_none() && self.data.is_empty() && self.id.is_none() {
                    continue;
                }
                let event = SseEvent {
                    event: self.event.take(),
                    data: self.data.join("\n"),
                    id: self.id.take(),
                };
                self.data.clear();
                return Some(event);
            }

            // comment line
            if line.starts_with(b":") {
                continue;
            }

            let (field, value) = match line.iter().position(|&b| b == b':') {
                Some(pos) => {
                    let value = &line[pos + 1..];
                    (&line[..pos], value.strip_prefix(b" ").unwrap_or(value))
                }
                None => (&line[..], &[][..]),
            };
            let value = String::from_utf8_lossy(value).into_owned();

            match field {
                b"event" => self.event = Some(value.trim().to_string()),
                b"data" => self.data.push(value),
                b"id" if !value.is_empty() => self.id = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
}
