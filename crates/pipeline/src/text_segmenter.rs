//! Incremental reply-text segmentation
//!
//! Reply text streams in from the language model in arbitrarily small
//! pieces, down to single characters. [`SentenceSegmenter`] buffers it and
//! emits complete units as soon as they can be decided:
//! - a run of terminal punctuation followed by any other character closes a
//!   sentence, keeping the punctuation attached to it
//! - a `<...>` tag is emitted as one atomic unit, with any text before it
//!   flushed first; an unterminated `<` is held for more input
//! - [`SentenceSegmenter::finish`] flushes whatever remains
//!
//! Output is identical whether the text arrives whole or one character at a
//! time.

use voiceloop_core::RouteCommand;

/// Sentence-terminal punctuation, ASCII and CJK
const TERMINALS: &[char] = &['.', '!', '?', ';', '…', '。', '！', '？', '；'];

fn is_terminal(c: char) -> bool {
    TERMINALS.contains(&c)
}

/// One emitted unit of reply text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextUnit {
    /// A complete sentence ready for synthesis
    Sentence(String),
    /// A complete `<...>` tag, delimiters included
    Tag(String),
}

impl TextUnit {
    pub fn text(&self) -> &str {
        match self {
            TextUnit::Sentence(s) | TextUnit::Tag(s) => s,
        }
    }
}

/// Parse a routing directive of the form `<route|agent_id|user_query|transition_text>`
///
/// Returns `None` for any other tag. The transition text may itself contain
/// `|`; only the first three delimiters split fields.
pub fn parse_route_tag(tag: &str) -> Option<RouteCommand> {
    let inner = tag.strip_prefix('<')?.strip_suffix('>')?;
    let mut fields = inner.splitn(4, '|');
    if fields.next()? != "route" {
        return None;
    }
    let target_agent = fields.next()?.to_string();
    let user_query = fields.next()?.to_string();
    let text = fields.next().unwrap_or("").to_string();
    Some(RouteCommand {
        target_agent,
        user_query,
        text,
    })
}

/// Incremental sentence/tag boundary detector
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buf: Vec<char>,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every unit that became complete
    pub fn push(&mut self, text: &str) -> Vec<TextUnit> {
        self.buf.extend(text.chars());
        self.scan()
    }

    /// Flush all remaining buffered text as a final unit
    pub fn finish(&mut self) -> Vec<TextUnit> {
        let mut units = self.scan();
        let rest: String = self.buf.drain(..).collect();
        push_sentence(&mut units, &rest);
        units
    }

    /// Whether any text is held back waiting for more input
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    fn scan(&mut self) -> Vec<TextUnit> {
        let mut units = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < self.buf.len() {
            let c = self.buf[i];
            if c == '<' {
                match self.buf[i + 1..].iter().position(|&c| c == '>') {
                    Some(offset) => {
                        let end = i + 1 + offset;
                        let before: String = self.buf[start..i].iter().collect();
                        push_sentence(&mut units, &before);
                        units.push(TextUnit::Tag(self.buf[i..=end].iter().collect()));
                        i = end + 1;
                        start = i;
                    }
                    // Unterminated tag, hold until more input or finish
                    None => break,
                }
            } else if is_terminal(c) {
                let mut j = i + 1;
                while j < self.buf.len() && is_terminal(self.buf[j]) {
                    j += 1;
                }
                if j == self.buf.len() {
                    // The punctuation run may still grow
                    break;
                }
                let sentence: String = self.buf[start..j].iter().collect();
                push_sentence(&mut units, &sentence);
                start = j;
                i = j;
            } else {
                i += 1;
            }
        }

        self.buf.drain(..start);
        units
    }
}

fn push_sentence(units: &mut Vec<TextUnit>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        units.push(TextUnit::Sentence(trimmed.to_string()));
    }
}
