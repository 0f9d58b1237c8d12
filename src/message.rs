//! Message types shared by sessions, extractors and models

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A piece of multi-part message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Whether the part carries something worth showing to an extractor.
    pub fn is_blank(&self) -> bool {
        match self {
            ContentPart::Text { text } => text.trim().is_empty(),
            ContentPart::Image { url } => url.trim().is_empty(),
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender
    pub role: Role,

    /// Message content
    #[serde(default)]
    pub content: String,

    /// Multi-part content (text, images)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_parts: Vec<ContentPart>,

    /// Tool calls proposed by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Tool that produced this message (role = tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Tool call this message answers (role = tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message
    pub fn tool(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }

    /// Set tool calls
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Set content parts
    pub fn with_content_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.content_parts = parts;
        self
    }

    /// Tool results and assistant turns that only request tools.
    pub fn is_tool_scaffolding(&self) -> bool {
        self.role == Role::Tool || !self.tool_calls.is_empty()
    }

    /// Whether there is any non-whitespace content
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty() || self.content_parts.iter().any(|p| !p.is_blank())
    }

    /// User/assistant text that a memory extractor should see.
    pub fn is_conversational(&self) -> bool {
        !self.is_tool_scaffolding() && self.has_content()
    }
}

/// A tool call within a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool call ID
    pub id: String,

    /// Tool name
    pub name: String,

    /// Raw JSON arguments as produced by the model
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// One completion choice
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: Message,
}

/// Error reported inside a model response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// A model response, as recorded on session events
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub choices: Vec<Choice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Response carrying a single message
    pub fn from_message(message: Message) -> Self {
        Self {
            choices: vec![Choice { index: 0, message }],
            error: None,
        }
    }

    /// Response carrying only an error
    pub fn from_error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            choices: Vec::new(),
            error: Some(ResponseError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    /// Message of the first choice, if any
    pub fn first_message(&self) -> Option<&Message> {
        self.choices.first().map(|c| &c.message)
    }
}
