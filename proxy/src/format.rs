//! Wire formats on both sides of the proxy: the OpenAI-compatible surface the
//! client sees, and the event-stream dialect the upstream speaks. Client
//! requests are validated only for well-formedness; unknown upstream fields
//! are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ProxyConfig, PublicModels};

/// The single upstream model token every public name maps onto.
pub const UPSTREAM_MODEL_ID: &str = "0727-360B-API";
pub const UPSTREAM_MODEL_NAME: &str = "GLM-4.5";
pub const MODEL_OWNER: &str = "z.ai";

/// The MCP server enabling web search on the upstream.
pub const SEARCH_MCP_SERVER: &str = "deep-web-search";

/// A single message in a conversation. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

/// The body of a client `/v1/chat/completions` call. Deserialization is the
/// validation: a missing `model` or `messages` fails the parse.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Per-request feature toggles derived from the public model name.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Features {
    pub enable_thinking: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
}

impl Features {
    /// Map a public model name onto upstream feature flags. Unrecognized
    /// names behave like the primary model.
    pub fn for_model(models: &PublicModels, name: &str) -> Features {
        if name == models.thinking {
            Features {
                enable_thinking: true,
                ..Default::default()
            }
        } else if name == models.search {
            Features {
                enable_thinking: true,
                web_search: true,
                auto_web_search: true,
            }
        } else {
            Features::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

/// The id/name/owner triple the upstream expects alongside the model token.
#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

/// The request body sent to the upstream. Always streams; constructed per
/// request and never mutated after dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub features: Features,
    pub background_tasks: BackgroundTasks,
    pub chat_id: String,
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    pub model_item: ModelItem,
    pub variables: BTreeMap<String, String>,
    pub tool_servers: Vec<String>,
}

impl UpstreamRequest {
    pub fn new(config: &ProxyConfig, request: &ClientRequest, chat_id: &str, message_id: &str) -> Self {
        let features = Features::for_model(&config.models, &request.model);
        let mcp_servers = if features.web_search {
            vec![SEARCH_MCP_SERVER.to_string()]
        } else {
            Vec::new()
        };

        let mut variables = BTreeMap::new();
        variables.insert("{{USER_NAME}}".to_string(), "User".to_string());
        variables.insert("{{USER_LOCATION}}".to_string(), "Unknown".to_string());
        variables.insert(
            "{{CURRENT_DATETIME}}".to_string(),
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );

        Self {
            stream: true,
            model: UPSTREAM_MODEL_ID.to_string(),
            messages: request.messages.clone(),
            features,
            background_tasks: BackgroundTasks::default(),
            chat_id: chat_id.to_string(),
            id: message_id.to_string(),
            mcp_servers,
            model_item: ModelItem {
                id: UPSTREAM_MODEL_ID.to_string(),
                name: UPSTREAM_MODEL_NAME.to_string(),
                owned_by: MODEL_OWNER.to_string(),
            },
            variables,
            tool_servers: Vec::new(),
        }
    }
}

/// One parsed upstream `data:` line. The primary dialect reports phases in
/// `data`; an alternative dialect sends OpenAI-style `choices` deltas with a
/// separate `reasoning_content` field. Unknown fields are dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEvent {
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub data: UpstreamEventData,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub choices: Vec<VariantChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEventData {
    #[serde(default)]
    pub delta_content: String,
    #[serde(default)]
    pub edit_content: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub inner: Option<UpstreamInner>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamInner {
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantChoice {
    #[serde(default)]
    pub delta: VariantDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl UpstreamEvent {
    /// The first error carried by the event, wherever the upstream put it.
    pub fn error_value(&self) -> Option<&serde_json::Value> {
        self.error
            .as_ref()
            .or(self.data.error.as_ref())
            .or_else(|| self.data.inner.as_ref().and_then(|i| i.error.as_ref()))
    }

    pub fn is_done(&self) -> bool {
        self.data.done || self.data.phase == "done"
    }
}

/// A streaming delta. Exactly one of the role opener, `content`,
/// `reasoning_content`, or the empty finish delta is populated per chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One OpenAI-shaped streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn with_delta(id: &str, created: i64, model: &str, delta: Delta, finish: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(str::to_string),
            }],
        }
    }

    /// The role-only opener that must precede all content.
    pub fn opener(id: &str, created: i64, model: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            Delta {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
            None,
        )
    }

    pub fn content(id: &str, created: i64, model: &str, text: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            Delta {
                content: Some(text.to_string()),
                ..Default::default()
            },
            None,
        )
    }

    pub fn reasoning(id: &str, created: i64, model: &str, text: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            Delta {
                reasoning_content: Some(text.to_string()),
                ..Default::default()
            },
            None,
        )
    }

    /// Empty delta plus a finish reason.
    pub fn finish(id: &str, created: i64, model: &str) -> Self {
        Self::with_delta(id, created, model, Delta::default(), Some("stop"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

/// Token usage block. The upstream does not report usage, so this stays
/// zero-filled for shape compatibility.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The non-streaming response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn assistant(id: &str, created: i64, model: &str, content: String) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_request_requires_model_and_messages() {
        let ok = json!({"model": "GLM-4.5", "messages": [{"role": "user", "content": "hi"}]});
        let parsed: ClientRequest = serde_json::from_value(ok).unwrap();
        assert!(!parsed.stream);
        assert_eq!(parsed.messages.len(), 1);

        let missing_model = json!({"messages": []});
        assert!(serde_json::from_value::<ClientRequest>(missing_model).is_err());
    }

    #[test]
    fn feature_mapping_by_model_name() {
        let models = PublicModels::default();

        let base = Features::for_model(&models, "GLM-4.5");
        assert!(!base.enable_thinking && !base.web_search);

        let thinking = Features::for_model(&models, "GLM-4.5-Thinking");
        assert!(thinking.enable_thinking && !thinking.web_search);

        let search = Features::for_model(&models, "GLM-4.5-Search");
        assert!(search.enable_thinking && search.web_search && search.auto_web_search);

        let unknown = Features::for_model(&models, "gpt-4o");
        assert!(!unknown.enable_thinking);
    }

    #[test]
    fn upstream_request_shape() {
        let config = ProxyConfig::default();
        let request: ClientRequest = serde_json::from_value(json!({
            "model": "GLM-4.5-Search",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();

        let upstream = UpstreamRequest::new(&config, &request, "1700000000000", "1700000000001");
        assert!(upstream.stream);
        assert_eq!(upstream.model, UPSTREAM_MODEL_ID);
        assert_eq!(upstream.mcp_servers, vec![SEARCH_MCP_SERVER.to_string()]);
        assert!(upstream.variables.contains_key("{{CURRENT_DATETIME}}"));

        let body = serde_json::to_value(&upstream).unwrap();
        assert_eq!(body["model_item"]["owned_by"], "z.ai");
        assert_eq!(body["background_tasks"]["title_generation"], false);
    }

    #[test]
    fn upstream_event_error_locations() {
        let top: UpstreamEvent =
            serde_json::from_value(json!({"error": {"code": 1}})).unwrap();
        assert!(top.error_value().is_some());

        let data: UpstreamEvent =
            serde_json::from_value(json!({"data": {"error": "boom"}})).unwrap();
        assert!(data.error_value().is_some());

        let inner: UpstreamEvent =
            serde_json::from_value(json!({"data": {"inner": {"error": "boom"}}})).unwrap();
        assert!(inner.error_value().is_some());

        let clean: UpstreamEvent =
            serde_json::from_value(json!({"data": {"phase": "answer", "delta_content": "x"}}))
                .unwrap();
        assert!(clean.error_value().is_none());
    }

    #[test]
    fn done_via_flag_or_phase() {
        let by_flag: UpstreamEvent =
            serde_json::from_value(json!({"data": {"done": true}})).unwrap();
        assert!(by_flag.is_done());

        let by_phase: UpstreamEvent =
            serde_json::from_value(json!({"data": {"phase": "done"}})).unwrap();
        assert!(by_phase.is_done());
    }

    #[test]
    fn unknown_event_fields_ignored() {
        let event: UpstreamEvent = serde_json::from_value(json!({
            "type": "chat:completion",
            "surprise": {"nested": true},
            "data": {"phase": "answer", "delta_content": "ok", "usage": {"x": 1}},
        }))
        .unwrap();
        assert_eq!(event.data.delta_content, "ok");
    }

    #[test]
    fn chunk_constructors_populate_one_field() {
        let opener = ChatCompletionChunk::opener("id", 1, "m");
        assert_eq!(opener.choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(opener.choices[0].delta.content.is_none());

        let finish = ChatCompletionChunk::finish("id", 1, "m");
        assert!(finish.choices[0].delta.role.is_none());
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));

        let json = serde_json::to_value(&finish).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert!(json["choices"][0]["delta"].as_object().unwrap().is_empty());
    }
}
