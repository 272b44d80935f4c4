//! LLM client used by the sentence-tokenizer fallback
//!
//! Defines the client trait and response types. Two implementations:
//! - `CommandClient`: runs a configured command per request, JSON on stdin,
//!   reply on stdout (production)
//! - `MockClient`: returns preconfigured responses (testing)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Text produced by one completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    /// Backend-specific extras (timing, usage)
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Errors from LLM client operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("llm backend not available: {0}")]
    Unavailable(String),
    #[error("no handler for task: {0}")]
    TaskNotFound(String),
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("response parse error: {0}")]
    ParseError(String),
}

/// Client trait for running a named LLM task.
///
/// Abstracts over transport so the segmenter doesn't depend on how the
/// model is reached.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Check if the backend is reachable.
    async fn is_available(&self) -> bool;

    /// Run `task` against `input` and return the raw completion.
    async fn complete(&self, task: &str, input: &str) -> Result<LlmResponse, LlmError>;
}

/// Request written to the command's stdin.
#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    task: &'a str,
    input: &'a str,
}

/// Reply shape accepted on stdout. Anything else is taken as plain text.
#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(alias = "response", alias = "output")]
    text: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Runs an external command once per request.
#[derive(Debug, Clone)]
pub struct CommandClient {
    program: String,
    args: Vec<String>,
    timeout_seconds: u64,
}

impl CommandClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_seconds: 60,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    fn resolve_program(&self) -> bool {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return program.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    async fn run(&self, request: String) -> Result<String, LlmError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Unavailable(format!("failed to start {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::Unavailable("no stdin available".to_string()))?;
        stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| LlmError::InvocationFailed(format!("failed to write request: {}", e)))?;
        drop(stdin);

        // Both pipes are drained together; a chatty stderr cannot stall stdout.
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LlmError::InvocationFailed(format!("failed to read reply: {}", e)))?;
        if !output.status.success() {
            return Err(LlmError::InvocationFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| LlmError::ParseError(format!("reply is not utf-8: {}", e)))
    }
}

#[async_trait]
impl LlmClient for CommandClient {
    async fn is_available(&self) -> bool {
        self.resolve_program()
    }

    async fn complete(&self, task: &str, input: &str) -> Result<LlmResponse, LlmError> {
        let request = serde_json::to_string(&CommandRequest { task, input })
            .map_err(|e| LlmError::InvocationFailed(format!("failed to serialize request: {}", e)))?;

        let output = timeout(Duration::from_secs(self.timeout_seconds), self.run(request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout_seconds))??;

        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Err(LlmError::ParseError("empty reply".to_string()));
        }
        match serde_json::from_str::<CommandReply>(trimmed) {
            Ok(reply) => Ok(LlmResponse {
                text: reply.text,
                metadata: reply.metadata,
            }),
            Err(_) => Ok(LlmResponse::text(trimmed)),
        }
    }
}

type Handler = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

enum MockBehavior {
    Fixed(String),
    Failure(String),
    Handler(Handler),
}

/// Mock client for testing: returns preconfigured responses per task.
pub struct MockClient {
    available: bool,
    responses: HashMap<String, MockBehavior>,
    calls: AtomicUsize,
}

impl MockClient {
    /// Create a mock client that reports as available.
    pub fn available() -> Self {
        Self {
            available: true,
            responses: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock client that reports as unavailable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::available()
        }
    }

    /// Register a fixed completion for a task.
    pub fn with_response(mut self, task: impl Into<String>, text: impl Into<String>) -> Self {
        self.responses
            .insert(task.into(), MockBehavior::Fixed(text.into()));
        self
    }

    /// Register a failure for a task.
    pub fn with_failure(mut self, task: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses
            .insert(task.into(), MockBehavior::Failure(message.into()));
        self
    }

    /// Register a completion computed from the request input.
    pub fn with_handler<F>(mut self, task: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.responses
            .insert(task.into(), MockBehavior::Handler(Arc::new(handler)));
        self
    }

    /// Number of `complete` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(&self, task: &str, input: &str) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(LlmError::Unavailable(
                "mock client configured as unavailable".to_string(),
            ));
        }

        match self.responses.get(task) {
            Some(MockBehavior::Fixed(text)) => Ok(LlmResponse::text(text.clone())),
            Some(MockBehavior::Failure(message)) => Err(LlmError::InvocationFailed(format!(
                "mock failure for task '{}': {}",
                task, message
            ))),
            Some(MockBehavior::Handler(handler)) => handler(input)
                .map(LlmResponse::text)
                .map_err(LlmError::InvocationFailed),
            None => Err(LlmError::TaskNotFound(format!(
                "no mock response for task '{}'",
                task
            ))),
        }
    }
}

/// Pull a JSON value out of an LLM reply.
///
/// Tries a direct parse, then a fenced code block, then the outermost
/// `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    let structured = |v: &serde_json::Value| v.is_object() || v.is_array();

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if structured(&v) {
            return Some(v);
        }
    }

    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```\n") {
        let after = &trimmed[start + 4..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };
    if let Some(block) = fenced {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(block.trim()) {
            if structured(&v) {
                return Some(v);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}
