//! Gemini API client
//!
//! Implements [`ModelProvider`] over `generateContent` and the SSE flavour of
//! `streamGenerateContent`. Uses a long-lived reqwest::Client for connection pooling.

use super::{
    ChunkStream, ModelChunk, ModelContent, ModelMessage, ModelProvider, ModelRequest,
    ModelResponse, ModelRole, ModelToolCall,
};
use crate::error::AgentError;
use crate::models::{generate_id, FinishReason, Usage};
use crate::tools::ToolSchema;
use crate::Result;
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, trace};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (proxies, local emulators)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, self.model, method)
    }

    async fn post(&self, url: &str, request: &ModelRequest) -> Result<reqwest::Response> {
        if self.api_key.is_empty() {
            return Err(AgentError::ConfigurationError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let body = GeminiRequest::from_model_request(request);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AgentError::ProviderError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(AgentError::ProviderError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for GeminiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        info!(model = %self.model, messages = request.messages.len(), "Calling Gemini API");

        let response = self.post(&self.endpoint("generateContent"), request).await?;

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AgentError::ProviderError(format!("Gemini parse error: {}", e))
        })?;

        if gemini_response.candidates.is_empty() {
            return Err(AgentError::ProviderError(
                "No response from Gemini API".to_string(),
            ));
        }

        let mut decoder = ChunkDecoder::default();
        let mut chunks = decoder.decode(gemini_response);
        chunks.push(decoder.finish());

        Ok(ModelResponse::from_chunks(chunks))
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream> {
        info!(model = %self.model, messages = request.messages.len(), "Streaming from Gemini API");

        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(&url, request).await?;

        Ok(decode_sse(response.bytes_stream()))
    }
}

/// Decode a Gemini SSE body into model chunks.
///
/// Events are framed on raw bytes, so a multi-byte character split across
/// network reads is decoded whole.
fn decode_sse<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        events: bytes.eventsource().boxed(),
        pending: VecDeque::new(),
        decoder: ChunkDecoder::default(),
        done: false,
    };

    stream::unfold(state, next_chunk).boxed()
}

type SseEvents<E> = BoxStream<'static, std::result::Result<Event, EventStreamError<E>>>;

/// Streaming state threaded through `stream::unfold`
struct SseState<E> {
    events: SseEvents<E>,
    pending: VecDeque<ModelChunk>,
    decoder: ChunkDecoder,
    done: bool,
}

async fn next_chunk<E: std::fmt::Display>(
    mut state: SseState<E>,
) -> Option<(Result<ModelChunk>, SseState<E>)> {
    loop {
        if let Some(chunk) = state.pending.pop_front() {
            return Some((Ok(chunk), state));
        }

        if state.done {
            return None;
        }

        match state.events.next().await {
            Some(Ok(event)) => match parse_sse_data(&event.data) {
                Ok(Some(response)) => {
                    let decoded = state.decoder.decode(response);
                    state.pending.extend(decoded);
                }
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            },
            Some(Err(e)) => {
                state.done = true;
                return Some((
                    Err(AgentError::ProviderError(format!("stream read error: {}", e))),
                    state,
                ));
            }
            None => {
                state.done = true;
                let finish = state.decoder.finish();
                state.pending.push_back(finish);
            }
        }
    }
}

/// Parse one SSE data payload. Returns `None` for empty and `[DONE]` payloads.
fn parse_sse_data(data: &str) -> Result<Option<GeminiResponse>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        trace!("ignoring empty SSE event");
        return Ok(None);
    }

    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| AgentError::ProviderError(format!("invalid JSON in SSE data: {}", e)))
}

/// Turns Gemini responses into model chunks, remembering the last finish
/// reason and usage so the final `Finish` chunk carries them.
#[derive(Default)]
struct ChunkDecoder {
    finish_reason: Option<FinishReason>,
    usage: Usage,
}

impl ChunkDecoder {
    fn decode(&mut self, response: GeminiResponse) -> Vec<ModelChunk> {
        let mut chunks = Vec::new();

        if let Some(usage) = response.usage_metadata {
            // Usage metadata is cumulative across stream chunks.
            self.usage = Usage {
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: usage.candidates_token_count.unwrap_or(0),
            };
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return chunks;
        };

        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = Some(map_finish_reason(reason));
        }

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    chunks.push(ModelChunk::TextDelta(text));
                }
            }
            if let Some(call) = part.function_call {
                debug!(tool_name = %call.name, "Gemini requested function call");
                chunks.push(ModelChunk::ToolCall(ModelToolCall {
                    id: generate_id(),
                    name: call.name,
                    arguments: call.args.unwrap_or(Value::Object(Default::default())),
                }));
            }
        }

        chunks
    }

    fn finish(&mut self) -> ModelChunk {
        ModelChunk::Finish {
            reason: self.finish_reason.unwrap_or(FinishReason::Other),
            usage: self.usage.clone(),
        }
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

//
// ================= Wire Format =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

impl GeminiRequest {
    fn from_model_request(request: &ModelRequest) -> Self {
        let contents = request.messages.iter().map(Content::from_model_message).collect();

        let system_instruction = if request.system.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part::text(request.system.clone())],
            })
        };

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolDeclarations {
                function_declarations: request.tools.iter().map(FunctionDeclaration::from).collect(),
            }]
        };

        Self {
            contents,
            system_instruction,
            tools,
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn from_model_message(message: &ModelMessage) -> Self {
        let role = match message.role {
            ModelRole::User => "user",
            ModelRole::Model => "model",
        };

        let parts = message
            .content
            .iter()
            .map(|content| match content {
                ModelContent::Text(text) => Part::text(text.clone()),
                ModelContent::FunctionCall { name, args, .. } => Part {
                    function_call: Some(FunctionCall {
                        name: name.clone(),
                        args: Some(args.clone()),
                    }),
                    ..Part::default()
                },
                ModelContent::FunctionResponse { name, response, .. } => Part {
                    function_response: Some(FunctionResponse {
                        name: name.clone(),
                        response: response.clone(),
                    }),
                    ..Part::default()
                },
            })
            .collect();

        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

impl From<&ToolSchema> for FunctionDeclaration {
    fn from(schema: &ToolSchema) -> Self {
        // Gemini rejects object schemas without properties.
        let has_properties = schema
            .parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| !props.is_empty())
            .unwrap_or(false);

        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters: has_properties.then(|| schema.parameters.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = ModelRequest {
            system: "You are a helpful assistant".to_string(),
            messages: vec![
                ModelMessage {
                    role: ModelRole::User,
                    content: vec![ModelContent::Text("What time is it in Lima?".into())],
                },
                ModelMessage {
                    role: ModelRole::Model,
                    content: vec![ModelContent::FunctionCall {
                        id: "c1".into(),
                        name: "get_local_time".into(),
                        args: json!({"location": "Lima"}),
                    }],
                },
            ],
            tools: vec![
                ToolSchema {
                    name: "get_local_time".into(),
                    description: "time".into(),
                    parameters: json!({"type": "object", "properties": {"location": {"type": "string"}}}),
                },
                ToolSchema {
                    name: "get_scheduled_tasks".into(),
                    description: "list".into(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
            ],
        };

        let json = serde_json::to_value(GeminiRequest::from_model_request(&request)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are a helpful assistant");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][1]["parts"][0]["functionCall"]["name"], "get_local_time");
        let declarations = &json["tools"][0]["functionDeclarations"];
        assert!(declarations[0].get("parameters").is_some());
        assert!(declarations[1].get("parameters").is_none());
    }

    #[test]
    fn test_parse_sse_data() {
        assert!(parse_sse_data("").unwrap().is_none());
        assert!(parse_sse_data("[DONE]").unwrap().is_none());
        assert!(parse_sse_data("not json").is_err());

        let response = parse_sse_data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(response.candidates.len(), 1);
    }

    async fn decode_reads(reads: Vec<Vec<u8>>) -> Vec<ModelChunk> {
        let body = stream::iter(reads.into_iter().map(Ok::<_, std::io::Error>));
        decode_sse(body)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_multibyte_text_split_across_reads() {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"café\"}]}}]}\n\n";
        let bytes = body.as_bytes();
        let split = body.find('é').unwrap() + 1;
        assert_eq!(bytes[split - 1], 0xC3);

        let chunks = decode_reads(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]).await;

        assert_eq!(chunks[0], ModelChunk::TextDelta("café".into()));
        assert!(matches!(chunks.last(), Some(ModelChunk::Finish { .. })));
    }

    #[tokio::test]
    async fn test_events_framed_across_reads() {
        let reads = vec![
            b": keep-alive\n\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"te".to_vec(),
            b"xt\":\"Hi\"}]}}]}\n\ndata: {\"candidates\":[{\"finishReason\":\"STOP\"}],".to_vec(),
            b"\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":1}}\n\n".to_vec(),
        ];

        let chunks = decode_reads(reads).await;

        assert_eq!(
            chunks,
            vec![
                ModelChunk::TextDelta("Hi".into()),
                ModelChunk::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage {
                        input_tokens: 4,
                        output_tokens: 1
                    },
                },
            ]
        );
    }

    #[test]
    fn test_decoder_tracks_finish_and_usage() {
        let mut decoder = ChunkDecoder::default();

        let first: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "Hi"}]}}]
        }))
        .unwrap();
        let second: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "get_local_time", "args": {"location": "Oslo"}}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }))
        .unwrap();

        assert_eq!(decoder.decode(first), vec![ModelChunk::TextDelta("Hi".into())]);

        let chunks = decoder.decode(second);
        match &chunks[0] {
            ModelChunk::ToolCall(call) => {
                assert_eq!(call.name, "get_local_time");
                assert_eq!(call.arguments["location"], "Oslo");
                assert!(!call.id.is_empty());
            }
            other => panic!("unexpected chunk: {other:?}"),
        }

        assert_eq!(
            decoder.finish(),
            ModelChunk::Finish {
                reason: FinishReason::Stop,
                usage: Usage {
                    input_tokens: 12,
                    output_tokens: 3
                },
            }
        );
    }

    #[tokio::test]
    async fn test_missing_api_key_is_configuration_error() {
        let client = GeminiClient::new(String::new(), "gemini-2.0-flash".into()).unwrap();
        let request = ModelRequest {
            system: String::new(),
            messages: vec![],
            tools: vec![],
        };

        let err = client.generate(&request).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfigurationError(_)));
    }
}
