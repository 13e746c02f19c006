//! Shared test fixtures: temp dirs, SSE payload builders and a scripted
//! model client that replays canned stream events.

use crate::error::ModelError;
use crate::model::{ModelClient, ModelEventStream, ModelRequest, StreamEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("steward-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// One SSE `data:` block as sent by chat-completions streams.
pub fn sse_data_block(data: &str) -> String {
    format!("data: {data}\n\n")
}

pub fn sse_done_block() -> &'static str {
    "data: [DONE]\n\n"
}

/// Step in a scripted model stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(StreamEvent),
    Delay(Duration),
    Fail(String),
}

/// Model client replaying one script per `stream` call.
///
/// Once the scripts run out, every further call answers with an empty
/// completed turn. Requests are recorded for later inspection.
#[derive(Default)]
pub struct ScriptedModelClient {
    scripts: StdMutex<VecDeque<Vec<ScriptStep>>>,
    requests: StdMutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: StdMutex::new(scripts.into()),
            requests: StdMutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

/// Script that streams `text` and completes.
pub fn text_turn(text: &str) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Event(StreamEvent::TextPartial {
            delta: text.to_string(),
        }),
        ScriptStep::Event(StreamEvent::ResponseTokens { count: 3 }),
        ScriptStep::Event(StreamEvent::TextComplete {
            text: text.to_string(),
        }),
        ScriptStep::Event(StreamEvent::Complete),
    ]
}

/// Script that requests one tool call and completes.
pub fn tool_turn(id: &str, name: &str, arguments: serde_json::Value) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Event(StreamEvent::ToolStart {
            id: id.to_string(),
            name: name.to_string(),
        }),
        ScriptStep::Event(StreamEvent::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }),
        ScriptStep::Event(StreamEvent::Complete),
    ]
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        self.requests.lock().expect("requests lock").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| vec![ScriptStep::Event(StreamEvent::Complete)]);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in script {
                let item = match step {
                    ScriptStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    ScriptStep::Event(event) => Ok(event),
                    ScriptStep::Fail(message) => Err(ModelError::InvalidResponse(message)),
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn temp_dir_fixture_writes_files() {
        let fixture = TestTempDir::new("fixture");
        let file = fixture.write_text("nested/file.txt", "hello");
        assert_eq!(fs::read_to_string(file).unwrap(), "hello");
    }

    #[test]
    fn sse_helpers_emit_expected_wire_format() {
        assert_eq!(sse_data_block("{}"), "data: {}\n\n");
        assert_eq!(sse_done_block(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn scripted_client_replays_then_completes_empty() {
        let client = ScriptedModelClient::new(vec![text_turn("hi")]);
        let request = ModelRequest {
            messages: vec![Message::user("hello")],
            tools: Vec::new(),
        };
        let mut rx = client.stream(request.clone()).await.unwrap();
        let mut events = Vec::new();
        while let Some(item) = rx.recv().await {
            events.push(item.unwrap());
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events.last(), Some(&StreamEvent::Complete));

        let mut rx = client.stream(request).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), StreamEvent::Complete);
        assert_eq!(client.requests().len(), 2);
    }
}
