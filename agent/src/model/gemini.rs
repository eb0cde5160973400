use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ModelClient, ModelError, ModelRequest, ModelResponse, ToolDeclaration, Usage};
use crate::conversation::{Role, ToolInvocation, Turn, TurnContent};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// `generateContent` over the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| ModelError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.endpoint, model)
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let body = GenerateContentRequest::from_request(request);
        debug!(model = request.model, turns = request.turns.len(), "sending generateContent");

        let response = self
            .client
            .post(self.url(request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| ModelError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|error| format!("unable to read error body: {error}"));
            return Err(ModelError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|error| ModelError::Transport(error.to_string()))?;
        parse_response(&body)
    }
}

/// Parses a `generateContent` response body.
///
/// A body without candidates (a blocked prompt, for instance) is an empty
/// response rather than an error.
pub(crate) fn parse_response(body: &str) -> Result<ModelResponse, ModelError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|error| ModelError::InvalidResponse(error.to_string()))?;
    Ok(parsed.into_model_response())
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSet>,
}

impl GenerateContentRequest {
    fn from_request(request: &ModelRequest<'_>) -> Self {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: request.tools.to_vec(),
            }]
        };
        Self {
            contents: request.turns.iter().map(Content::from_turn).collect(),
            system_instruction: Content {
                role: "user".to_string(),
                parts: vec![Part::text(request.system_instruction)],
            },
            tools,
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolSet {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn from_turn(turn: &Turn) -> Self {
        let parts = match &turn.content {
            TurnContent::Text(text) => vec![Part::text(text)],
            TurnContent::ToolCalls { text, calls } => text
                .iter()
                .map(|text| Part::text(text))
                .chain(calls.iter().map(Part::function_call))
                .collect(),
            TurnContent::ToolResults(results) => results
                .iter()
                .map(|result| Part::function_response(&result.name, result.outcome.to_value()))
                .collect(),
        };
        // Gemini only knows "user" and "model"; tool results travel as user content.
        let role = match turn.role {
            Role::Model => "model",
            Role::User | Role::Tool => "user",
        };
        Self {
            role: role.to_string(),
            parts,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(
        rename = "thoughtSignature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    thought_signature: Option<String>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    fn function_call(call: &ToolInvocation) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: call.name.clone(),
                args: call.args.clone(),
            }),
            thought_signature: call.signature.clone(),
            ..Self::default()
        }
    }

    fn function_response(name: &str, response: Value) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.to_string(),
                response,
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

impl GenerateContentResponse {
    fn into_model_response(self) -> ModelResponse {
        let usage = self.usage_metadata.map(|usage| Usage {
            prompt_tokens: usage.prompt_token_count,
            response_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        });
        let parts = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(chunk) = part.text {
                text.push_str(&chunk);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolInvocation {
                    name: call.name,
                    args: call.args,
                    signature: part.thought_signature,
                });
            }
        }

        ModelResponse {
            text: (!text.is_empty()).then_some(text),
            tool_calls,
            usage,
        }
    }
}

fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: Option<ErrorBody>,
    }
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }

    serde_json::from_str::<Envelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .and_then(|error| error.message)
        .unwrap_or_else(|| body.trim().to_string())
}
