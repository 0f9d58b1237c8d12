//! The LLM seam used by the memory extractor

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, Response};

/// Static information about a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
}

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub input_schema: serde_json::Value,
}

/// A generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
}

/// A chat model.
///
/// Responses are streamed; a non-streaming model yields a single item.
#[async_trait]
pub trait Model: Send + Sync {
    fn info(&self) -> ModelInfo;

    async fn generate_content(&self, request: ModelRequest) -> Result<BoxStream<'static, Response>>;
}

/// Runs before the model; returning a response skips the model call
pub type BeforeModelFn = Arc<dyn Fn(&ModelRequest) -> Result<Option<Response>> + Send + Sync>;

/// Runs on each streamed response; returning a response replaces it
pub type AfterModelFn = Arc<dyn Fn(&ModelRequest, &Response) -> Result<Option<Response>> + Send + Sync>;

/// Hooks around a model call.
///
/// Callbacks run in registration order and the first one to return a
/// response wins. An error aborts the call.
#[derive(Clone, Default)]
pub struct ModelCallbacks {
    before_model: Vec<BeforeModelFn>,
    after_model: Vec<AfterModelFn>,
}

impl ModelCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_model(
        mut self,
        callback: impl Fn(&ModelRequest) -> Result<Option<Response>> + Send + Sync + 'static,
    ) -> Self {
        self.before_model.push(Arc::new(callback));
        self
    }

    pub fn after_model(
        mut self,
        callback: impl Fn(&ModelRequest, &Response) -> Result<Option<Response>> + Send + Sync + 'static,
    ) -> Self {
        self.after_model.push(Arc::new(callback));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_model.is_empty() && self.after_model.is_empty()
    }

    pub fn run_before_model(&self, request: &ModelRequest) -> Result<Option<Response>> {
        for callback in &self.before_model {
            if let Some(response) = callback(request)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    pub fn run_after_model(&self, request: &ModelRequest, response: Response) -> Result<Response> {
        for callback in &self.after_model {
            if let Some(replacement) = callback(request, &response)? {
                return Ok(replacement);
            }
        }
        Ok(response)
    }
}

impl fmt::Debug for ModelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCallbacks")
            .field("before_model", &self.before_model.len())
            .field("after_model", &self.after_model.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn first_before_response_wins() {
        let callbacks = ModelCallbacks::new()
            .before_model(|_| Ok(None))
            .before_model(|_| Ok(Some(Response::from_message(Message::assistant("cached")))))
            .before_model(|_| Err(Error::model("never reached")));

        let response = callbacks.run_before_model(&ModelRequest::default()).unwrap();
        assert_eq!(
            response.and_then(|r| r.first_message().map(|m| m.content.clone())),
            Some("cached".to_string())
        );
    }

    #[test]
    fn after_passes_through_when_nothing_replaces() {
        let callbacks = ModelCallbacks::new().after_model(|_, _| Ok(None));
        let original = Response::from_message(Message::assistant("hi"));
        let out = callbacks
            .run_after_model(&ModelRequest::default(), original.clone())
            .unwrap();
        assert_eq!(out, original);

        let failing = ModelCallbacks::new().after_model(|_, _| Err(Error::model("rejected")));
        assert!(failing
            .run_after_model(&ModelRequest::default(), original)
            .is_err());
        assert!(ModelCallbacks::new().is_empty());
    }
}
