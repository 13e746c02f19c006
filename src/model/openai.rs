//! Streaming adapter for OpenAI-compatible `/chat/completions` endpoints.

use super::sse::SseDecoder;
use super::{ModelClient, ModelEventStream, ModelRequest, StreamEvent, STREAM_CHANNEL_CAPACITY};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::tokens::estimate_tokens;
use crate::types::{ChatChunk, ChatRequest, StreamOptions};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Client for OpenAI-compatible model APIs.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.trim().to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, request: ModelRequest) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: request.messages,
            tools: (!request.tools.is_empty()).then_some(request.tools),
            temperature: self.temperature,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(request);
        let mut req = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let mut response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status(status, body));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut accumulator = StreamAccumulator::default();
            loop {
                let bytes = match response.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(ModelError::Http(err))).await;
                        return;
                    }
                };
                for payload in decoder.push(&bytes) {
                    if !forward_payload(&payload, &mut accumulator, &tx).await {
                        return;
                    }
                }
            }
            if let Some(payload) = decoder.finish() {
                if !forward_payload(&payload, &mut accumulator, &tx).await {
                    return;
                }
            }
            // Providers that close without `[DONE]` still get a complete turn.
            for event in accumulator.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Decode one SSE payload and forward the resulting events.
///
/// Returns false once the stream is over (terminator, error or receiver gone).
async fn forward_payload(
    payload: &str,
    accumulator: &mut StreamAccumulator,
    tx: &mpsc::Sender<Result<StreamEvent, ModelError>>,
) -> bool {
    let events = if payload == "[DONE]" {
        accumulator.finish()
    } else {
        match serde_json::from_str::<ChatChunk>(payload) {
            Ok(chunk) => accumulator.apply(chunk),
            Err(err) => {
                let _ = tx
                    .send(Err(ModelError::InvalidResponse(format!(
                        "invalid streaming chunk: {err}"
                    ))))
                    .await;
                return false;
            }
        }
    };
    let finished = accumulator.finished;
    for event in events {
        if tx.send(Ok(event)).await.is_err() {
            return false;
        }
    }
    !finished
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

/// Folds chunk deltas into [`StreamEvent`]s.
///
/// Tool-call fragments are keyed by their `index`; complete calls are only
/// emitted once the stream finishes, since arguments may arrive in pieces.
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    calls: BTreeMap<usize, PendingCall>,
    finished: bool,
}

impl StreamAccumulator {
    fn apply(&mut self, chunk: ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                events.push(StreamEvent::Reason {
                    tokens: estimate_tokens(&reasoning),
                    delta: reasoning,
                });
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.text.push_str(&content);
                events.push(StreamEvent::ResponseTokens {
                    count: estimate_tokens(&content),
                });
                events.push(StreamEvent::TextPartial { delta: content });
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let pending = self.calls.entry(call.index).or_default();
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    pending.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        pending.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        pending.arguments.push_str(&arguments);
                    }
                }
                if !pending.started && !pending.name.is_empty() {
                    pending.started = true;
                    events.push(StreamEvent::ToolStart {
                        id: pending.id.clone(),
                        name: pending.name.clone(),
                    });
                }
            }
        }
        if let Some(usage) = chunk.usage {
            // completion_tokens includes reasoning; report the two apart.
            let reasoning = usage
                .completion_tokens_details
                .map_or(0, |details| details.reasoning_tokens);
            events.push(StreamEvent::Usage {
                prompt: usage.prompt_tokens,
                output: usage.completion_tokens.saturating_sub(reasoning),
                reasoning,
            });
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| StreamEvent::ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                },
                name: call.name,
                arguments: if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                },
            })
            .collect();
        if !self.text.is_empty() {
            events.push(StreamEvent::TextComplete {
                text: std::mem::take(&mut self.text),
            });
        }
        events.push(StreamEvent::Complete);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ToolDefinition};
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> ChatChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn request_body_omits_empty_tools() {
        let client = OpenAiClient::new(&ModelConfig::default()).unwrap();
        let body = client.request_body(ModelRequest {
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
        });
        assert!(body.tools.is_none());
        assert!(body.stream);

        let body = client.request_body(ModelRequest {
            messages: vec![Message::user("hi")],
            tools: vec![ToolDefinition::function("file_read", "read", json!({}))],
        });
        assert_eq!(body.tools.map(|t| t.len()), Some(1));
    }

    #[test]
    fn text_deltas_accumulate_into_complete_text() {
        let mut acc = StreamAccumulator::default();
        let mut events = acc.apply(chunk(json!({"choices": [{"delta": {"content": "Hel"}}]})));
        events.extend(acc.apply(chunk(json!({"choices": [{"delta": {"content": "lo"}}]}))));
        events.extend(acc.finish());

        let partials: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextPartial { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(partials, vec!["Hel", "lo"]);
        assert!(events.contains(&StreamEvent::TextComplete {
            text: "Hello".into()
        }));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn usage_reports_reasoning_apart_from_output() {
        let mut acc = StreamAccumulator::default();
        let usage = acc.apply(chunk(json!({"choices": [], "usage": {
            "prompt_tokens": 12,
            "completion_tokens": 100,
            "completion_tokens_details": {"reasoning_tokens": 60}
        }})));
        assert_eq!(
            usage,
            vec![StreamEvent::Usage {
                prompt: 12,
                output: 40,
                reasoning: 60
            }]
        );
    }

    #[test]
    fn tool_call_fragments_join_by_index() {
        let mut acc = StreamAccumulator::default();
        let first = acc.apply(chunk(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "file_read", "arguments": "{\"pa"}}
        ]}}]})));
        assert_eq!(
            first,
            vec![StreamEvent::ToolStart {
                id: "call_1".into(),
                name: "file_read".into()
            }]
        );
        let second = acc.apply(chunk(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "th\":\"a.txt\"}"}}
        ]}, "finish_reason": "tool_calls"}]})));
        assert!(second.is_empty());

        let usage = acc.apply(chunk(json!({"choices": [], "usage": {
            "prompt_tokens": 20, "completion_tokens": 9
        }})));
        assert_eq!(
            usage,
            vec![StreamEvent::Usage {
                prompt: 20,
                output: 9,
                reasoning: 0
            }]
        );

        let done = acc.finish();
        assert_eq!(
            done,
            vec![
                StreamEvent::ToolCall {
                    id: "call_1".into(),
                    name: "file_read".into(),
                    arguments: "{\"path\":\"a.txt\"}".into()
                },
                StreamEvent::Complete
            ]
        );
    }

    #[tokio::test]
    async fn invalid_chunk_reports_error_and_stops() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut acc = StreamAccumulator::default();
        assert!(!forward_payload("{not json", &mut acc, &tx).await);
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("invalid streaming chunk"));
    }

    #[tokio::test]
    async fn done_marker_finishes_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut acc = StreamAccumulator::default();
        assert!(forward_payload(r#"{"choices":[{"delta":{"content":"ok"}}]}"#, &mut acc, &tx).await);
        assert!(!forward_payload("[DONE]", &mut acc, &tx).await);
        drop(tx);
        let mut events = Vec::new();
        while let Some(item) = rx.recv().await {
            events.push(item.unwrap());
        }
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }
}
