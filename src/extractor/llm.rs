//! LLM-backed memory extractor

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;

use super::checker::{checks_any, Checker};
use super::{ExtractionContext, MemoryExtractor, Operation};
use crate::error::{Error, Result};
use crate::memory::MemoryEntry;
use crate::message::{Message, Response, ToolCall};
use crate::model::{Model, ModelCallbacks, ModelRequest, ToolDeclaration};
use crate::tools::{self, EnabledTools};

const METADATA_MODEL_NAME: &str = "model_name";
const METADATA_MODEL_AVAILABLE: &str = "model_available";

/// Extractor that asks a model to call memory tools.
///
/// ```rust,ignore
/// let extractor = LlmExtractor::new(model)
///     .with_checker(check_turn_interval(3));
/// let config = AutoMemoryConfig::with_extractor(Arc::new(extractor));
/// ```
pub struct LlmExtractor {
    model: RwLock<Option<Arc<dyn Model>>>,
    prompt: RwLock<String>,
    checkers: Vec<Checker>,
    enabled_tools: RwLock<EnabledTools>,
    callbacks: Option<ModelCallbacks>,
}

impl LlmExtractor {
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self {
            model: RwLock::new(Some(model)),
            prompt: RwLock::new(DEFAULT_PROMPT.to_string()),
            checkers: Vec::new(),
            enabled_tools: RwLock::new(EnabledTools::all()),
            callbacks: None,
        }
    }

    /// An extractor with no model yet; see [`MemoryExtractor::set_model`]
    pub fn without_model() -> Self {
        Self {
            model: RwLock::new(None),
            prompt: RwLock::new(DEFAULT_PROMPT.to_string()),
            checkers: Vec::new(),
            enabled_tools: RwLock::new(EnabledTools::all()),
            callbacks: None,
        }
    }

    /// Replace the system prompt. Empty prompts are ignored.
    pub fn with_prompt(self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.is_empty() {
            *self.prompt.write() = prompt;
        }
        self
    }

    /// Add a checker; all checkers must pass for extraction to run.
    pub fn with_checker(mut self, checker: Checker) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Replace all checkers with one that passes when any of these does.
    pub fn with_checkers_any(mut self, checkers: Vec<Checker>) -> Self {
        if !checkers.is_empty() {
            self.checkers = vec![checks_any(checkers)];
        }
        self
    }

    /// Hooks run around every model call
    pub fn with_model_callbacks(mut self, callbacks: ModelCallbacks) -> Self {
        self.callbacks = (!callbacks.is_empty()).then_some(callbacks);
        self
    }

    async fn call_model(
        &self,
        model: &dyn Model,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Response>> {
        if let Some(callbacks) = &self.callbacks {
            let custom = callbacks
                .run_before_model(&request)
                .map_err(|e| Error::model(format!("before model callback failed: {}", e)))?;
            if let Some(response) = custom {
                tracing::debug!("extractor: model call answered by callback");
                return Ok(stream::iter(vec![response]).boxed());
            }
        }

        model.generate_content(request).await.map_err(|e| {
            tracing::warn!("extractor: model call failed: {}", e);
            Error::model(format!("model call failed: {}", e))
        })
    }

    fn build_messages(&self, messages: &[Message], existing: &[MemoryEntry]) -> Vec<Message> {
        let mut result = Vec::with_capacity(messages.len() + 1);
        result.push(Message::system(self.build_system_prompt(existing)));
        result.extend_from_slice(messages);
        result
    }

    fn build_system_prompt(&self, existing: &[MemoryEntry]) -> String {
        let mut prompt = self.prompt.read().clone();

        prompt.push_str("\n<available_actions>\n");
        prompt.push_str(&self.available_actions_block());
        prompt.push_str("</available_actions>\n");

        if !existing.is_empty() {
            prompt.push_str("\n<existing_memories>\n");
            for entry in existing {
                let _ = writeln!(prompt, "- [{}] {}", entry.id, entry.memory.memory);
            }
            prompt.push_str("</existing_memories>\n");
        }
        prompt
    }

    fn available_actions_block(&self) -> String {
        let enabled = self.enabled_tools.read();
        let mut block = String::new();
        for name in tools::MUTATION_TOOLS {
            if !enabled.is_enabled(name) {
                continue;
            }
            let _ = writeln!(block, "- {}: {}", name, action_description(name));
        }
        if block.is_empty() {
            block.push_str("No actions available.\n");
        }
        block
    }

    fn declared_tools(&self) -> Vec<ToolDeclaration> {
        let enabled = self.enabled_tools.read();
        memory_tool_declarations()
            .into_iter()
            .filter(|decl| enabled.is_enabled(&decl.name))
            .collect()
    }
}

#[async_trait]
impl MemoryExtractor for LlmExtractor {
    async fn extract(&self, messages: &[Message], existing: &[MemoryEntry]) -> Result<Vec<Operation>> {
        let model = self
            .model
            .read()
            .clone()
            .ok_or_else(|| Error::model("no model configured for memory extraction"))?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let request = ModelRequest {
            messages: self.build_messages(messages, existing),
            tools: self.declared_tools(),
        };

        let mut responses = self.call_model(model.as_ref(), request.clone()).await?;

        let mut ops = Vec::new();
        while let Some(response) = responses.next().await {
            let response = match &self.callbacks {
                Some(callbacks) => callbacks
                    .run_after_model(&request, response)
                    .map_err(|e| Error::model(format!("after model callback failed: {}", e)))?,
                None => response,
            };
            if let Some(err) = &response.error {
                return Err(Error::model(format!("model error: {}", err.message)));
            }
            let Some(message) = response.first_message() else {
                continue;
            };
            ops.extend(message.tool_calls.iter().filter_map(parse_tool_call));
        }
        Ok(ops)
    }

    fn should_extract(&self, ctx: &ExtractionContext<'_>) -> bool {
        self.checkers.iter().all(|check| check(ctx))
    }

    fn set_prompt(&self, prompt: &str) {
        if !prompt.is_empty() {
            *self.prompt.write() = prompt.to_string();
        }
    }

    fn set_model(&self, model: Arc<dyn Model>) {
        *self.model.write() = Some(model);
    }

    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        let model = self.model.read().clone();
        let name = model.as_ref().map(|m| m.info().name).unwrap_or_default();
        HashMap::from([
            (METADATA_MODEL_NAME.to_string(), json!(name)),
            (METADATA_MODEL_AVAILABLE.to_string(), json!(model.is_some())),
        ])
    }

    fn set_enabled_tools(&self, enabled: &EnabledTools) {
        *self.enabled_tools.write() = enabled.clone();
    }
}

#[derive(Deserialize)]
struct AddArgs {
    memory: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    memory_id: String,
    memory: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct DeleteArgs {
    memory_id: String,
}

fn parse_tool_call(call: &ToolCall) -> Option<Operation> {
    let parsed = match call.name.as_str() {
        tools::ADD_TOOL => serde_json::from_str::<AddArgs>(&call.arguments)
            .map(|a| (!a.memory.is_empty()).then(|| Operation::add(a.memory, a.topics))),
        tools::UPDATE_TOOL => serde_json::from_str::<UpdateArgs>(&call.arguments).map(|a| {
            (!a.memory_id.is_empty() && !a.memory.is_empty())
                .then(|| Operation::update(a.memory_id, a.memory, a.topics))
        }),
        tools::DELETE_TOOL => serde_json::from_str::<DeleteArgs>(&call.arguments)
            .map(|a| (!a.memory_id.is_empty()).then(|| Operation::delete(a.memory_id))),
        tools::CLEAR_TOOL => Ok(Some(Operation::Clear)),
        other => {
            tracing::warn!("extractor: ignoring unknown tool call '{}'", other);
            return None;
        }
    };

    match parsed {
        Ok(op) => op,
        Err(e) => {
            tracing::warn!("extractor: failed to parse tool args for {}: {}", call.name, e);
            None
        }
    }
}

fn action_description(name: &str) -> &'static str {
    match name {
        tools::ADD_TOOL => "Add a new memory (only if genuinely new information).",
        tools::UPDATE_TOOL => {
            "Update an existing memory with new or corrected information. \
             Prefer updating over adding a near-duplicate."
        }
        tools::DELETE_TOOL => "Delete a memory when the user explicitly asks to forget something.",
        tools::CLEAR_TOOL => "Clear all memories only when the user explicitly asks to forget everything.",
        _ => "",
    }
}

/// Declarations of the four mutation tools offered to the model
pub fn memory_tool_declarations() -> Vec<ToolDeclaration> {
    let topics = json!({
        "type": "array",
        "items": { "type": "string" },
        "description": "Optional topics for categorizing the memory."
    });
    vec![
        ToolDeclaration {
            name: tools::ADD_TOOL.to_string(),
            description: "Add a new memory about the user.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory": {
                        "type": "string",
                        "description": "A brief, third-person statement capturing key information about the user."
                    },
                    "topics": topics.clone()
                },
                "required": ["memory"]
            }),
        },
        ToolDeclaration {
            name: tools::UPDATE_TOOL.to_string(),
            description: "Update an existing memory.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory_id": { "type": "string", "description": "ID of the memory to update." },
                    "memory": { "type": "string", "description": "The updated memory content." },
                    "topics": topics
                },
                "required": ["memory_id", "memory"]
            }),
        },
        ToolDeclaration {
            name: tools::DELETE_TOOL.to_string(),
            description: "Delete a memory.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "memory_id": { "type": "string", "description": "ID of the memory to delete." }
                },
                "required": ["memory_id"]
            }),
        },
        ToolDeclaration {
            name: tools::CLEAR_TOOL.to_string(),
            description: "Clear all memories of the user.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

/// Default system prompt for memory extraction
pub const DEFAULT_PROMPT: &str = r#"You are a Memory Manager for an AI Assistant.
Your task is to analyze the conversation and manage user memories.

<instructions>
1. Analyze the conversation to identify any new or updated information about the
   user that should be remembered.
2. Check if this information is already captured in existing memories.
3. Determine if any memories need to be added, updated, or deleted.
4. You can call multiple tools in parallel to handle all necessary changes at once.
5. If no memory changes are needed, do not call any tools.
</instructions>

<guidelines>
- Write memories as brief, third-person statements, e.g. "User enjoys hiking on weekends."
- Keep each memory focused on a single piece of information.
- Do not repeat information across memories; update existing memories instead.
- When a user's preferences change, update the relevant memory.
- Only delete when the user explicitly asks to forget something.
- Only clear when the user explicitly asks to forget everything.
- Write memories and topics in the same language as the user.
- Do not create memories for transient requests, information already captured,
  or generic conversation that reveals nothing personal.
</guidelines>
"#;
