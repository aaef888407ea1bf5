use crate::vision::VideoFrame;
use std::sync::Arc;

/// The role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One piece of a message body: plain text or a reference to a cached frame.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    Image(Arc<VideoFrame>),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(text.into())
    }

    pub fn image(frame: Arc<VideoFrame>) -> Self {
        ContentPart::Image(frame)
    }
}

/// A single conversation turn. Immutable once appended to the history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    role: Role,
    content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[ContentPart] {
        &self.content
    }

    /// The concatenated text parts of this turn.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect()
    }

    pub fn has_image(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::Image(_)))
    }
}

/// Attempt to mutate the fixed system turn or reorder the history.
///
/// This is a programming error rather than a runtime condition; callers are
/// expected to treat it as fatal in development builds.
#[derive(Debug, thiserror::Error)]
#[error("conversation history invariant violated: {0}")]
pub struct InvariantViolation(pub &'static str);

/// Ordered, append-only conversation history.
///
/// Index 0 is always the session's system-prompt turn, set once at
/// construction. All other turns are appended and never reordered or
/// removed.
#[derive(Debug)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
        }
    }

    /// Appends a user or assistant turn to the end of the history.
    pub fn append(&mut self, message: ChatMessage) -> Result<(), InvariantViolation> {
        if message.role() == Role::System {
            return Err(InvariantViolation(
                "the system turn is fixed at index 0 and set only at session start",
            ));
        }
        self.messages.push(message);
        Ok(())
    }

    /// A read-only copy of the current history, in append order.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_the_system_turn() {
        let state = ConversationState::new("You are a voice assistant.");
        let history = state.snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role(), Role::System);
        assert_eq!(history[0].text(), "You are a voice assistant.");
    }

    #[test]
    fn appends_preserve_order() {
        let mut state = ConversationState::new("prompt");
        state
            .append(ChatMessage::user(vec![ContentPart::text("hello")]))
            .expect("user turn appends");
        state
            .append(ChatMessage::assistant("hi there"))
            .expect("assistant turn appends");

        let history = state.snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role(), Role::System);
        assert_eq!(history[1].role(), Role::User);
        assert_eq!(history[1].text(), "hello");
        assert_eq!(history[2].role(), Role::Assistant);
        assert_eq!(history[2].text(), "hi there");
    }

    #[test]
    fn rejects_a_second_system_turn() {
        let mut state = ConversationState::new("prompt");
        let err = state
            .append(ChatMessage::system("replacement"))
            .expect_err("system turns after init must be rejected");
        assert!(err.to_string().contains("invariant"));

        // The history is untouched.
        assert_eq!(state.len(), 1);
        assert_eq!(state.snapshot()[0].text(), "prompt");
    }

    #[test]
    fn system_turn_survives_any_append_sequence() {
        let mut state = ConversationState::new("P");
        for i in 0..50 {
            state
                .append(ChatMessage::user(vec![ContentPart::text(format!("u{i}"))]))
                .expect("append");
            state
                .append(ChatMessage::assistant(format!("a{i}")))
                .expect("append");
        }
        assert_eq!(state.snapshot()[0].role(), Role::System);
        assert_eq!(state.snapshot()[0].text(), "P");
    }

    #[test]
    fn text_skips_image_parts() {
        let frame = Arc::new(VideoFrame::jpeg(bytes::Bytes::from_static(b"\xff\xd8")));
        let message = ChatMessage::user(vec![
            ContentPart::text("what is this"),
            ContentPart::image(frame),
        ]);
        assert_eq!(message.text(), "what is this");
        assert!(message.has_image());
    }
}
