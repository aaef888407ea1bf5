/// Accumulates streamed reply fragments and emits complete sentences.
///
/// Some synthesis backends cannot speak partial text, so the response
/// pipeline feeds fragments through this buffer and flushes whole sentences
/// as they close. A boundary is `.`, `!` or `?` followed by whitespace (or
/// sitting at the end of the buffered text), or a newline. A period wedged
/// between non-whitespace characters ("3.14", "v0.2") does not close a
/// sentence.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    pending: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns any sentences completed by it.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.pending.push_str(fragment);

        let mut sentences = Vec::new();
        loop {
            let Some(end) = self.boundary() else { break };
            let sentence: String = self.pending.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
        }
        sentences
    }

    /// Drains whatever is left, for the end of a reply stream.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_owned())
    }

    /// Byte index one past the first sentence boundary, if any.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.pending.char_indices().peekable();
        while let Some((index, ch)) = chars.next() {
            let end = index + ch.len_utf8();
            match ch {
                '\n' => return Some(end),
                '.' | '!' | '?' => match chars.peek() {
                    None => return Some(end),
                    Some((_, next)) if next.is_whitespace() => return Some(end),
                    // Mid-token punctuation, e.g. a decimal point.
                    Some(_) => {}
                },
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_without_boundary_stay_buffered() {
        let mut buffer = SentenceBuffer::new();
        assert!(buffer.push("Hello the").is_empty());
        assert!(buffer.push("re, I am").is_empty());
        assert_eq!(buffer.flush().as_deref(), Some("Hello there, I am"));
    }

    #[test]
    fn sentence_emitted_at_boundary() {
        let mut buffer = SentenceBuffer::new();
        assert!(buffer.push("Hel").is_empty());
        let out = buffer.push("lo. Wor");
        assert_eq!(out, vec!["Hello.".to_owned()]);
        let out = buffer.push("ld!");
        assert_eq!(out, vec!["World!".to_owned()]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn multiple_sentences_in_one_fragment() {
        let mut buffer = SentenceBuffer::new();
        let out = buffer.push("One. Two! Three? Four");
        assert_eq!(
            out,
            vec!["One.".to_owned(), "Two!".to_owned(), "Three?".to_owned()]
        );
        assert_eq!(buffer.flush().as_deref(), Some("Four"));
    }

    #[test]
    fn newline_closes_a_sentence() {
        let mut buffer = SentenceBuffer::new();
        let out = buffer.push("First line\nsecond");
        assert_eq!(out, vec!["First line".to_owned()]);
    }

    #[test]
    fn decimal_point_does_not_split() {
        let mut buffer = SentenceBuffer::new();
        assert!(buffer.push("It costs 3.14 euros").is_empty());
        let out = buffer.push(" today.");
        assert_eq!(out, vec!["It costs 3.14 euros today.".to_owned()]);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut buffer = SentenceBuffer::new();
        buffer.push("Leftover");
        assert_eq!(buffer.flush().as_deref(), Some("Leftover"));
        assert!(buffer.flush().is_none());
    }
}
