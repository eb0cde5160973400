use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// One role-tagged entry in a session's history. Never mutated once committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    /// A model turn requesting tools, with any text the model sent alongside.
    ToolCalls {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        calls: Vec<ToolInvocation>,
    },
    ToolResults(Vec<ToolResult>),
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn tool_calls(calls: Vec<ToolInvocation>) -> Self {
        Self::tool_calls_with_text(None, calls)
    }

    pub fn tool_calls_with_text(text: Option<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Model,
            content: TurnContent::ToolCalls { text, calls },
        }
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::Tool,
            content: TurnContent::ToolResults(results),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    /// Opaque provider token that must be echoed back with the call on replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            signature: None,
        }
    }
}

/// Either a success payload or an error payload, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolOutcome {
    #[serde(rename = "result")]
    Success(String),
    #[serde(rename = "error")]
    Error(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ToolOutcome::Success(message) | ToolOutcome::Error(message) => message,
        }
    }

    /// `{"result": ..}` or `{"error": ..}`, the shape the model is shown.
    pub fn to_value(&self) -> Value {
        match self {
            ToolOutcome::Success(message) => serde_json::json!({ "result": message }),
            ToolOutcome::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub name: String,
    pub outcome: ToolOutcome,
}

/// What the caller sees for each tool call made while answering a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}
