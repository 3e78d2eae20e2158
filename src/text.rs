//! Text utilities: cleanup, title generation, sentence chunking for TTS

/// Collapse whitespace and strip markup so text is safe to display or speak
#[must_use]
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut last_space = true;

    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_whitespace() => {
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
            // markdown emphasis/code markers read badly out loud
            '*' | '`' | '#' => {}
            c => {
                out.push(c);
                last_space = false;
            }
        }
    }

    out.trim_end().to_string()
}

/// Truncate to at most `max_len` characters, appending `...` when cut
#[must_use]
pub fn truncate(text: &str, max_len: usize) -> String {
    const SUFFIX: &str = "...";
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(SUFFIX.len());
    let cut: String = text.chars().take(keep).collect();
    format!("{cut}{SUFFIX}")
}

/// Derive a session title from the first user message
#[must_use]
pub fn conversation_title(first_message: &str, max_len: usize) -> String {
    let title = truncate(&clean_text(first_message), max_len);
    if title.trim().is_empty() {
        "New conversation".to_string()
    } else {
        title
    }
}

/// Characters that end a sentence for TTS chunking purposes
const SENTENCE_ENDS: &[char] = &['.', '!', '?', '\n', '。', '！', '？', '；', ';'];

/// Accumulates streamed completion deltas and yields sentence-sized
/// chunks suitable for incremental speech synthesis.
///
/// Chunks shorter than `min_chars` are held back and merged with the
/// following sentence so the synthesizer is not called for fragments
/// like "Hi.".
#[derive(Debug)]
pub struct SentenceChunker {
    buf: String,
    min_chars: usize,
}

impl SentenceChunker {
    /// Create a chunker that emits sentences of at least `min_chars` characters
    #[must_use]
    pub fn new(min_chars: usize) -> Self {
        Self {
            buf: String::new(),
            min_chars,
        }
    }

    /// Feed a delta; returns any complete sentences ready for synthesis
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);

        let mut out = Vec::new();
        loop {
            let Some(end) = self.boundary() else { break };
            let sentence: String = self.buf.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_string());
            }
        }
        out
    }

    /// Drain whatever remains after the stream ends
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    /// Byte offset just past the first usable sentence boundary
    fn boundary(&self) -> Option<usize> {
        let mut chars_seen = 0usize;
        for (idx, ch) in self.buf.char_indices() {
            chars_seen += 1;
            if SENTENCE_ENDS.contains(&ch) && chars_seen >= self.min_chars {
                return Some(idx + ch.len_utf8());
            }
        }
        None
    }
}
