pub mod conversation;
pub mod functions;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod sentence;
pub mod speech;
pub mod transport;
pub mod vision;

/// An inbound event on the session orchestrator's mailbox.
///
/// Every event source (the chat transport and the function-call dispatch
/// path) feeds this one typed intake point, which is what keeps the
/// single-active-pipeline rule enforceable without shared mutable state.
/// Video frames deliberately bypass the mailbox: they flow straight into
/// the [`vision::VisionFrameCache`] so an unbounded frame cadence can never
/// starve trigger handling.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chat message arrived from the remote participant.
    Chat(String),
    /// A model-invoked function finished; the arguments echo the original
    /// call (including the `user_msg` that triggered it).
    FunctionCallCompleted {
        name: String,
        arguments: serde_json::Value,
    },
    /// The transport connection is gone; the session ends.
    Closed,
}
