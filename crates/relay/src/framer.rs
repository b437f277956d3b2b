//! Event-stream frame splitting for byte passthrough
//!
//! Comment lines (leading `:`) go out as soon as they arrive. Everything else
//! is held until a blank line closes the frame, so the client never sees half
//! an event. Bytes are never rewritten: concatenating every emitted chunk
//! reproduces the input exactly.

use bytes::Bytes;

/// Per-request buffer turning raw upstream chunks into whole frames.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    /// Bytes after the last newline seen.
    partial: Vec<u8>,
    /// Lines of the frame currently being assembled.
    frame: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk; returns what can be emitted now, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.partial.extend_from_slice(chunk);

        let mut out: Vec<Vec<u8>> = Vec::new();
        // A comment emitted in this call still waiting for its blank line.
        let mut open_comment = false;

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();

            if line.starts_with(b":") {
                out.push(line);
                open_comment = true;
            } else if is_blank(&line) {
                if !self.frame.is_empty() {
                    self.frame.extend_from_slice(&line);
                    out.push(std::mem::take(&mut self.frame));
                } else if open_comment && let Some(comment) = out.last_mut() {
                    comment.extend_from_slice(&line);
                } else {
                    out.push(line);
                }
                open_comment = false;
            } else {
                self.frame.extend_from_slice(&line);
                open_comment = false;
            }
        }

        out.into_iter().map(Bytes::from).collect()
    }

    /// Whatever is left once the upstream is done, emitted at most once.
    pub fn finish(&mut self) -> Option<Bytes> {
        let mut rest = std::mem::take(&mut self.frame);
        rest.append(&mut self.partial);
        (!rest.is_empty()).then(|| Bytes::from(rest))
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\n" || line == b"\r\n"
}
