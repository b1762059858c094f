//! Streaming line framing
//!
//! Channels deliver arbitrary chunks of bytes. A [`LineBuffer`] accumulates
//! those chunks and splits them into [`FramedLine`]s according to a
//! [`Framer`] policy. Lines are decoded as UTF-8 only once they are complete,
//! so a multi-byte character split across two reads is never mangled.

use std::collections::VecDeque;

use regex::Regex;

use crate::error::ProtocolError;

/// A single line produced by a [`LineBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    /// Decoded line text (including the terminator when `keep_ends` is set)
    pub text: String,
    /// Whether the line ended with a terminator
    ///
    /// Partial lines flushed by a timeout have `eol == false`.
    pub eol: bool,
}

impl FramedLine {
    /// Create a complete line
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            eol: true,
        }
    }

    /// Create a line that was cut off before its terminator arrived
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            eol: false,
        }
    }
}

/// Policy for splitting a byte stream into lines
#[derive(Debug, Clone)]
pub enum Framer {
    /// Split at every `\n`
    Newline {
        /// Keep the trailing `\n` on each line
        keep_ends: bool,
        /// Collapse any run of trailing `\r`/`\n` into a single `\n`
        clean_ends: bool,
    },

    /// Split at an arbitrary terminator byte, for transports that are not line-oriented
    Terminator {
        /// Terminator byte
        byte: u8,
        /// Keep the terminator on each line
        keep_ends: bool,
    },

    /// Newline framing that also extracts log lines interleaved inside responses
    ///
    /// Group 1 of `pattern` is emitted as its own line; whatever is left of
    /// the original line after removing the whole match is emitted next.
    InterwovenLog {
        /// Pattern whose first group captures the embedded log line
        pattern: Regex,
        /// Append `\n` to the extracted log line
        add_newline: bool,
    },
}

impl Default for Framer {
    fn default() -> Self {
        Framer::Newline {
            keep_ends: true,
            clean_ends: true,
        }
    }
}

impl Framer {
    /// Build an interwoven-log framer from a pattern string
    pub fn interwoven_log(pattern: &str, add_newline: bool) -> Result<Self, ProtocolError> {
        let pattern = Regex::new(pattern).map_err(|e| ProtocolError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Framer::InterwovenLog {
            pattern,
            add_newline,
        })
    }

    fn terminator(&self) -> u8 {
        match self {
            Framer::Terminator { byte, .. } => *byte,
            Framer::Newline { .. } | Framer::InterwovenLog { .. } => b'\n',
        }
    }

    /// Turn one raw terminated line (terminator included) into output lines
    fn finish(&self, raw: &[u8], out: &mut VecDeque<FramedLine>) {
        match self {
            Framer::Newline {
                keep_ends,
                clean_ends,
            } => out.push_back(FramedLine::complete(clean_line(raw, *keep_ends, *clean_ends))),
            Framer::Terminator { keep_ends, .. } => {
                let body = if *keep_ends {
                    raw
                } else {
                    &raw[..raw.len() - 1]
                };
                out.push_back(FramedLine::complete(String::from_utf8_lossy(body)));
            }
            Framer::InterwovenLog {
                pattern,
                add_newline,
            } => {
                let line = clean_line(raw, true, true);
                let Some(caps) = pattern.captures(&line) else {
                    out.push_back(FramedLine::complete(line));
                    return;
                };
                let (Some(whole), Some(log)) = (caps.get(0), caps.get(1)) else {
                    out.push_back(FramedLine::complete(line));
                    return;
                };
                let mut log_line = log.as_str().to_string();
                if *add_newline {
                    log_line.push('\n');
                }
                out.push_back(FramedLine::complete(log_line));

                let rest = format!("{}{}", &line[..whole.start()], &line[whole.end()..]);
                if !rest.is_empty() {
                    out.push_back(FramedLine::complete(rest));
                }
            }
        }
    }
}

fn clean_line(raw: &[u8], keep_ends: bool, clean_ends: bool) -> String {
    let text = String::from_utf8_lossy(raw);
    if clean_ends {
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if keep_ends {
            format!("{}\n", trimmed)
        } else {
            trimmed.to_string()
        }
    } else if keep_ends {
        text.into_owned()
    } else {
        text.strip_suffix('\n').unwrap_or(&text).to_string()
    }
}

/// Streaming line splitter
///
/// ```
/// use sb_protocol::{Framer, LineBuffer};
///
/// let mut buf = LineBuffer::new(Framer::default());
/// buf.push_bytes(b"Return Co");
/// assert!(buf.next_line().is_none());
/// buf.push_bytes(b"de: 0\r\n");
/// assert_eq!(buf.next_line().unwrap().text, "Return Code: 0\n");
/// ```
#[derive(Debug, Clone)]
pub struct LineBuffer {
    framer: Framer,
    buffer: Vec<u8>,
    ready: VecDeque<FramedLine>,
}

impl LineBuffer {
    /// Create a buffer using the given framing policy
    pub fn new(framer: Framer) -> Self {
        Self {
            framer,
            buffer: Vec::with_capacity(256),
            ready: VecDeque::new(),
        }
    }

    /// The framing policy in use
    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    /// Push raw bytes read from a channel
    pub fn push_bytes(&mut self, data: &[u8]) {
        let terminator = self.framer.terminator();
        let mut start = self.buffer.len();
        self.buffer.extend_from_slice(data);

        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == terminator) {
            let end = start + offset + 1;
            let raw: Vec<u8> = self.buffer.drain(..end).collect();
            self.framer.finish(&raw, &mut self.ready);
            start = 0;
        }
    }

    /// Take the next complete line, if any
    pub fn next_line(&mut self) -> Option<FramedLine> {
        self.ready.pop_front()
    }

    /// Whether bytes are waiting for a terminator
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Flush the unterminated tail as a partial line
    pub fn take_partial(&mut self) -> Option<FramedLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(FramedLine::partial(String::from_utf8_lossy(&raw)))
    }

    /// Discard all buffered data
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.ready.clear();
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(Framer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(buf: &mut LineBuffer) -> Vec<String> {
        std::iter::from_fn(|| buf.next_line()).map(|l| l.text).collect()
    }

    #[test]
    fn test_newline_split() {
        let mut buf = LineBuffer::default();
        buf.push_bytes(b"foo\nbar\nba");
        assert_eq!(drain(&mut buf), vec!["foo\n", "bar\n"]);
        assert!(buf.has_partial());
        buf.push_bytes(b"z\n");
        assert_eq!(drain(&mut buf), vec!["baz\n"]);
        assert!(!buf.has_partial());
    }

    #[test]
    fn test_clean_ends_collapses_crlf() {
        let mut buf = LineBuffer::default();
        buf.push_bytes(b"one\r\ntwo\r\r\n");
        assert_eq!(drain(&mut buf), vec!["one\n", "two\n"]);
    }

    #[test]
    fn test_no_keep_ends() {
        let mut buf = LineBuffer::new(Framer::Newline {
            keep_ends: false,
            clean_ends: true,
        });
        buf.push_bytes(b"one\r\n");
        assert_eq!(drain(&mut buf), vec!["one"]);
    }

    #[test]
    fn test_raw_ends_preserved() {
        let mut buf = LineBuffer::new(Framer::Newline {
            keep_ends: true,
            clean_ends: false,
        });
        buf.push_bytes(b"one\r\n");
        assert_eq!(drain(&mut buf), vec!["one\r\n"]);
    }

    #[test]
    fn test_terminator_framing() {
        let mut buf = LineBuffer::new(Framer::Terminator {
            byte: b';',
            keep_ends: false,
        });
        buf.push_bytes(b"FA00014250000;MD2;ID");
        assert_eq!(drain(&mut buf), vec!["FA00014250000", "MD2"]);
        assert_eq!(buf.take_partial(), Some(FramedLine::partial("ID")));
    }

    #[test]
    fn test_interwoven_log_extracted() {
        let framer = Framer::interwoven_log(r"(<LOG> [^>]*>)", true).unwrap();
        let mut buf = LineBuffer::new(framer);
        buf.push_bytes(b"resp<LOG> boot ok>onse\n");
        assert_eq!(drain(&mut buf), vec!["<LOG> boot ok>\n", "response\n"]);
    }

    #[test]
    fn test_interwoven_log_without_match() {
        let framer = Framer::interwoven_log(r"(<LOG> [^>]*>)", false).unwrap();
        let mut buf = LineBuffer::new(framer);
        buf.push_bytes(b"plain\n");
        assert_eq!(drain(&mut buf), vec!["plain\n"]);
    }

    #[test]
    fn test_interwoven_invalid_pattern() {
        assert!(matches!(
            Framer::interwoven_log("(", false),
            Err(ProtocolError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_split_utf8_reassembled() {
        let mut buf = LineBuffer::default();
        let bytes = "héllo\n".as_bytes();
        buf.push_bytes(&bytes[..2]);
        buf.push_bytes(&bytes[2..]);
        assert_eq!(drain(&mut buf), vec!["héllo\n"]);
    }

    #[test]
    fn test_take_partial_empty() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.take_partial(), None);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_lines(
            lines in prop::collection::vec("[a-z ]{0,12}", 1..8),
            split in 1usize..7,
        ) {
            let stream: String = lines.iter().map(|l| format!("{}\n", l)).collect();

            let mut whole = LineBuffer::default();
            whole.push_bytes(stream.as_bytes());

            let mut chunked = LineBuffer::default();
            for chunk in stream.as_bytes().chunks(split) {
                chunked.push_bytes(chunk);
            }

            prop_assert_eq!(drain(&mut whole), drain(&mut chunked));
        }
    }
}
