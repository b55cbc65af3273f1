//! Line reassembly and per-line parsing for the upstream event stream. Both
//! the streaming translator and the non-streaming aggregator read through
//! this layer, so the overflow and bad-line rules apply identically.

use bytes::BytesMut;

use crate::format::UpstreamEvent;

/// A line buffer longer than this without a newline is resynchronized.
pub const MAX_LINE_BUFFER: usize = 1024 * 1024;

/// Accumulates upstream body bytes and yields complete lines. A stream that
/// never sends a newline cannot grow the buffer unboundedly: past 1 MiB the
/// buffer is cut back to the last newline inside its first half, keeping the
/// suffix so a later newline can resynchronize the stream.
#[derive(Debug)]
pub struct SseLineBuffer {
    buf: BytesMut,
}

impl SseLineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);

        if self.buf.len() > MAX_LINE_BUFFER && !self.buf.contains(&b'\n') {
            let half = self.buf.len() / 2;
            let cut = match self.buf[..half].iter().rposition(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                None => half,
            };
            tracing::warn!(
                dropped = cut,
                retained = self.buf.len() - cut,
                "line buffer overflow, resynchronizing"
            );
            let _ = self.buf.split_to(cut);
        }
    }

    /// The next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(newline + 1);
        Some(String::from_utf8_lossy(&line[..newline]).into_owned())
    }

    /// Drain whatever is left at EOF so a final unterminated line is still
    /// processed.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// The meaning of one upstream line.
#[derive(Debug)]
pub enum SseLine {
    /// The `data: [DONE]` sentinel.
    Done,
    Event(Box<UpstreamEvent>),
}

/// Parse one line. `None` means the line carries nothing for us: not a
/// `data:` line, or a body that failed to parse. A single bad line never
/// aborts the stream.
pub fn parse_line(line: &str) -> Option<SseLine> {
    let line = line.trim();
    let payload = line.strip_prefix("data: ")?;

    if payload == "[DONE]" {
        return Some(SseLine::Done);
    }

    match serde_json::from_str::<UpstreamEvent>(payload) {
        Ok(event) => Some(SseLine::Event(Box::new(event))),
        Err(error) => {
            tracing::debug!(%error, "skipping unparseable event line");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lines_split_across_chunk_boundaries() {
        let mut buf = SseLineBuffer::with_capacity(64);
        buf.push(b"data: {\"a\"");
        assert!(buf.next_line().is_none());

        buf.push(b": 1}\ndata: two\nda");
        assert_eq!(buf.next_line().unwrap(), "data: {\"a\": 1}");
        assert_eq!(buf.next_line().unwrap(), "data: two");
        assert!(buf.next_line().is_none());

        buf.push(b"ta: three\n");
        assert_eq!(buf.next_line().unwrap(), "data: three");
    }

    #[test]
    fn partial_line_flushes_at_eof() {
        let mut buf = SseLineBuffer::with_capacity(64);
        buf.push(b"data: unterminated");
        assert!(buf.next_line().is_none());
        assert_eq!(buf.take_partial().unwrap(), "data: unterminated");
        assert!(buf.take_partial().is_none());
    }

    #[test]
    fn crlf_is_trimmed_by_parse() {
        assert!(matches!(
            parse_line("data: [DONE]\r"),
            Some(SseLine::Done)
        ));
    }

    #[test]
    fn overflow_without_newline_drops_half() {
        let mut buf = SseLineBuffer::with_capacity(64);
        buf.push(&vec![b'x'; MAX_LINE_BUFFER + 10]);

        // Resync dropped the first half but kept the tail, so a newline that
        // eventually arrives still terminates a line.
        buf.push(b"end\n");
        let line = buf.next_line().unwrap();
        assert!(line.ends_with("end"));
        assert!(line.len() < MAX_LINE_BUFFER);
    }

    #[test]
    fn parse_requires_data_prefix() {
        assert!(parse_line("event: ping").is_none());
        assert!(parse_line(": comment").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("data: {\"data\": {\"phase\": \"answer\"}}").is_some());
    }

    #[test]
    fn bad_json_is_skipped_not_fatal() {
        assert!(parse_line("data: {not json").is_none());
    }

    #[test]
    fn done_sentinel() {
        assert!(matches!(parse_line("data: [DONE]"), Some(SseLine::Done)));
    }
}
