/// Incremental SSE decoder.
///
/// Feed raw body chunks in; complete frames come out. Only `data:` lines
/// matter for the chat-completions protocol: data lines accumulate into the
/// current event and are dispatched at the blank line that ends it. The
/// literal payload `[DONE]` terminates the stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// One complete `data:` payload.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a body chunk, returning any frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                self.data_lines.push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
            }
            // Field lines other than data: (event:, id:, retry:, comments)
            // are irrelevant to this protocol and skipped.
        }
        frames
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload.trim() == "[DONE]" {
            Some(SseFrame::Done)
        } else {
            Some(SseFrame::Data(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: {\"x\":1}\n\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"x\":1}".to_string())]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"he").is_empty());
        assert!(parser.push(b"llo\":true}").is_empty());
        let frames = parser.push(b"\n\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"hello\":true}".to_string())]);
    }

    #[test]
    fn done_terminator() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: [DONE]\n\n");
        assert_eq!(frames, vec![SseFrame::Done]);
    }

    #[test]
    fn multiple_frames_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame::Data("a".to_string()),
                SseFrame::Data("b".to_string()),
                SseFrame::Done,
            ]
        );
    }

    #[test]
    fn ignores_other_fields_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keepalive\nevent: message\nid: 3\ndata: x\n\n");
        assert_eq!(frames, vec![SseFrame::Data("x".to_string())]);
    }

    #[test]
    fn crlf_lines() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: x\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::Data("x".to_string())]);
    }

    #[test]
    fn multi_line_data_joined() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: first\ndata: second\n\n");
        assert_eq!(frames, vec![SseFrame::Data("first\nsecond".to_string())]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail\n").is_empty());
        assert_eq!(parser.finish(), Some(SseFrame::Data("tail".to_string())));
        assert_eq!(parser.finish(), None);
    }
}
