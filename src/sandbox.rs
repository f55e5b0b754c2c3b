//! Sandbox host port for level-2 transformer code
//!
//! User-supplied code never runs inside the engine's own trust boundary.
//! The host (a VM context, worker, or subprocess) receives the code string
//! plus rows and context, and must isolate script errors from crashing the
//! process. The engine only supplies inputs and surfaces failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Capability-scoped execution port for user code.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Evaluate `code` as a single function `(rows, context) -> rows`.
    async fn run(
        &self,
        code: &str,
        rows: Vec<Value>,
        context: Value,
    ) -> anyhow::Result<Vec<Value>>;
}

/// Default host that refuses to run anything.
///
/// An engine without a configured sandbox must not silently evaluate user
/// code, so level-2 execution fails loudly until a real host is injected.
pub struct DenySandbox;

#[async_trait]
impl SandboxHost for DenySandbox {
    async fn run(
        &self,
        _code: &str,
        _rows: Vec<Value>,
        _context: Value,
    ) -> anyhow::Result<Vec<Value>> {
        anyhow::bail!("no sandbox host configured")
    }
}

/// Recorded sandbox invocation, for assertions.
#[derive(Debug, Clone)]
pub struct SandboxCall {
    pub code: String,
    pub rows: Vec<Value>,
    pub context: Value,
}

/// Mock host with queued outcomes.
///
/// Returns queued results in FIFO order; when the queue is empty it echoes
/// the input rows. Every call is recorded.
#[derive(Default)]
pub struct MockSandbox {
    outcomes: Mutex<Vec<Result<Vec<Value>, String>>>,
    calls: Arc<Mutex<Vec<SandboxCall>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful result.
    pub fn queue_rows(&self, rows: Vec<Value>) {
        self.outcomes.lock().push(Ok(rows));
    }

    /// Queue a script failure.
    pub fn queue_error(&self, message: impl Into<String>) {
        self.outcomes.lock().push(Err(message.into()));
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SandboxHost for MockSandbox {
    async fn run(
        &self,
        code: &str,
        rows: Vec<Value>,
        context: Value,
    ) -> anyhow::Result<Vec<Value>> {
        self.calls.lock().push(SandboxCall {
            code: code.to_string(),
            rows: rows.clone(),
            context,
        });

        let outcome = {
            let mut queue = self.outcomes.lock();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        match outcome {
            Some(Ok(rows)) => Ok(rows),
            Some(Err(message)) => anyhow::bail!("{message}"),
            None => Ok(rows),
        }
    }
}
