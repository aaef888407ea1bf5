use crate::conversation::ChatMessage;
use crate::functions::FunctionCallSpec;
use async_trait::async_trait;
use futures::Stream;
#[cfg(test)]
use mockall::automock;
use std::pin::Pin;

/// One item of a streamed model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFragment {
    /// A chunk of reply text, in generation order.
    Text(String),
    /// The model invoked one of the offered functions.
    FunctionCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// A finite stream of reply fragments for a single model request.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyFragment, ModelError>> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    RequestFailed(String),
    #[error("model stream interrupted: {0}")]
    StreamInterrupted(String),
}

/// The language-model capability.
///
/// Given the ordered conversation history and the set of functions the model
/// may invoke, produces a streamed reply. The stream is pulled by the
/// response pipeline and must stop producing once the receiver is dropped.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait LanguageModel: Send + Sync {
    async fn stream_reply(
        &self,
        history: Vec<ChatMessage>,
        tools: Vec<FunctionCallSpec>,
    ) -> Result<ReplyStream, ModelError>;
}
