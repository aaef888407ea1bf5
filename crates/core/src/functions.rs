use crate::SessionEvent;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Declarative description of one parameter of a callable function.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Declarative description of a function the model may invoke.
///
/// Specs are registered once at startup and immutable for the session
/// lifetime; `parameters_schema` renders the JSON-schema form a model
/// request expects.
#[derive(Debug, Clone)]
pub struct FunctionCallSpec {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
}

impl FunctionCallSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            description: description.into(),
            required,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn parameters_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|param| {
                (
                    param.name.clone(),
                    serde_json::json!({
                        "type": "string",
                        "description": param.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|param| param.required)
            .map(|param| param.name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Handler invoked when the model calls the matching function.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, arguments: serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FunctionCallError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("function {function} invoked without required argument {argument}")]
    MissingArgument { function: String, argument: String },
}

struct Registration {
    spec: FunctionCallSpec,
    handler: Arc<dyn FunctionHandler>,
}

/// Registry of model-invocable functions and the dispatch path for their
/// invocations.
///
/// A successful invocation runs the handler and forwards a
/// [`SessionEvent::FunctionCallCompleted`], tagged with the function name
/// and the echoed arguments, to the orchestrator mailbox, so the session
/// can re-trigger a response from the triggering message. Malformed
/// model-issued calls (unknown name, missing required argument) are logged
/// and dropped, never surfaced to the user.
pub struct FunctionCallBroker {
    entries: HashMap<String, Registration>,
    completions: mpsc::Sender<SessionEvent>,
}

impl FunctionCallBroker {
    pub fn new(completions: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            completions,
        }
    }

    /// Registers a callable function. Startup-only; later registrations for
    /// the same name replace the earlier one.
    pub fn register(&mut self, spec: FunctionCallSpec, handler: Arc<dyn FunctionHandler>) {
        self.entries
            .insert(spec.name().to_owned(), Registration { spec, handler });
    }

    /// The registered specs, for inclusion in a model request.
    pub fn describe_all(&self) -> Vec<FunctionCallSpec> {
        self.entries
            .values()
            .map(|registration| registration.spec.clone())
            .collect()
    }

    /// Dispatches a model-issued invocation.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<(), FunctionCallError> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| FunctionCallError::UnknownFunction(name.to_owned()))?;

        for param in registration.spec.params() {
            let present = arguments
                .get(&param.name)
                .is_some_and(|value| !value.is_null());
            if param.required && !present {
                return Err(FunctionCallError::MissingArgument {
                    function: name.to_owned(),
                    argument: param.name.clone(),
                });
            }
        }

        if let Err(e) = registration.handler.call(arguments.clone()).await {
            tracing::warn!(function = name, error = %e, "function handler failed, dropping call");
            return Ok(());
        }

        let completed = SessionEvent::FunctionCallCompleted {
            name: name.to_owned(),
            arguments,
        };
        // try_send: the dispatch path must never block behind the mailbox,
        // or a completion could wedge the pipeline the orchestrator is
        // waiting on.
        if let Err(e) = self.completions.try_send(completed) {
            tracing::warn!(function = name, error = %e, "dropping function completion");
        }
        Ok(())
    }
}

/// The vision capability offered to the model: invoked when the user asks
/// about something that requires looking at the camera feed.
pub fn vision_function_spec() -> FunctionCallSpec {
    FunctionCallSpec::new(
        "image",
        "Called when asked to evaluate something that would require vision capabilities, \
         for example, an image, video, or the webcam feed.",
    )
    .with_param(
        "user_msg",
        "The user message that triggered this function",
        true,
    )
}

/// Handler for the vision function. The interesting work happens on the
/// completion path (the orchestrator re-triggers a response with the cached
/// frame attached), so the handler itself only records the trigger.
pub struct VisionRequestHandler;

#[async_trait]
impl FunctionHandler for VisionRequestHandler {
    async fn call(&self, arguments: serde_json::Value) -> anyhow::Result<()> {
        let user_msg = arguments
            .get("user_msg")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        tracing::info!(user_msg, "vision capability requested");
        Ok(())
    }
}
