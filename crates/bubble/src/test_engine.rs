//! Scripted engine for unit tests: replays queued replies and records every
//! envelope it was handed.

use crate::engine::Engine;
use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedEngine {
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    seen: Mutex<Vec<serde_json::Value>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn reply(self, raw: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(raw.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(TransportError::new(message)));
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn envelopes(&self) -> Vec<serde_json::Value> {
        self.seen.lock().unwrap().clone()
    }
}

impl Engine for ScriptedEngine {
    async fn call(&self, envelope: String) -> Result<String, TransportError> {
        let parsed = serde_json::from_str(&envelope).unwrap_or(serde_json::Value::Null);
        self.seen.lock().unwrap().push(parsed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::new("no scripted reply left")))
    }
}
