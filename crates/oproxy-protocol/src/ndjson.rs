use bytes::Bytes;

/// Incremental splitter for newline-delimited JSON bodies.
///
/// Ollama streams one JSON object per line; chunk boundaries fall anywhere,
/// including inside multi-byte UTF-8 sequences, so the unterminated tail is
/// carried as raw bytes between pushes.
#[derive(Debug, Default)]
pub struct LineParser {
    buffer: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            if !text.trim().is_empty() {
                lines.push(text);
            }
        }

        lines
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines_and_keeps_tail() {
        let mut parser = LineParser::new();
        let lines = parser.push_bytes(&Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n{\"c\""));
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        let lines = parser.push_bytes(&Bytes::from_static(b":3}\n"));
        assert_eq!(lines, vec!["{\"c\":3}"]);
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut parser = LineParser::new();
        assert!(parser.push_bytes(&Bytes::from_static(b"{\"done\":true}")).is_empty());
        assert_eq!(parser.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn multibyte_utf8_survives_chunk_boundary() {
        let mut parser = LineParser::new();
        let text = "{\"msg\":\"こんにちは\"}\n";
        let bytes = text.as_bytes();
        // Split inside the middle of a 3-byte character.
        let lines = parser.push_bytes(&Bytes::copy_from_slice(&bytes[..12]));
        assert!(lines.is_empty());
        let lines = parser.push_bytes(&Bytes::copy_from_slice(&bytes[12..]));
        assert_eq!(lines, vec!["{\"msg\":\"こんにちは\"}"]);
    }

    #[test]
    fn blank_and_crlf_lines_are_dropped() {
        let mut parser = LineParser::new();
        let lines = parser.push_bytes(&Bytes::from_static(b"\r\n{\"a\":1}\r\n\n"));
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }
}
