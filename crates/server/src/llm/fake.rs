//! Fake — deterministic test double for the LLM transport.
//!
//! Outcomes for `generate` are scripted as a queue; health and embeddings
//! are simple switches. Lets orchestrator and gateway tests run without a
//! model server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{BoxFuture, LlmError, LlmOps};

#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Ok(String),
    Unavailable,
    Timeout,
    Http(u16),
    Malformed,
}

impl FakeOutcome {
    fn into_result(self) -> Result<String, LlmError> {
        match self {
            FakeOutcome::Ok(body) => Ok(body),
            FakeOutcome::Unavailable => {
                Err(LlmError::Unavailable("connection refused".to_string()))
            }
            FakeOutcome::Timeout => Err(LlmError::Timeout(Duration::from_secs(1))),
            FakeOutcome::Http(status) => Err(LlmError::Http {
                status,
                detail: "scripted".to_string(),
            }),
            FakeOutcome::Malformed => Err(LlmError::Malformed("scripted".to_string())),
        }
    }
}

pub struct FakeLlm {
    healthy: AtomicBool,
    generate_queue: Mutex<VecDeque<FakeOutcome>>,
    generate_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    embedding: Mutex<Vec<f32>>,
    embed_fails: AtomicBool,
    models: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            generate_queue: Mutex::new(VecDeque::new()),
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            embedding: Mutex::new(vec![1.0, 0.0, 0.0]),
            embed_fails: AtomicBool::new(false),
            models: Mutex::new(vec!["llama3.1".to_string()]),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Script the next generate outcome (FIFO). An empty queue answers
    /// with a canned valid analysis.
    pub fn push_generate(&self, outcome: FakeOutcome) {
        self.generate_queue.lock().push_back(outcome);
    }

    pub fn set_embedding(&self, vector: Vec<f32>) {
        *self.embedding.lock() = vector;
    }

    pub fn fail_embeddings(&self, fail: bool) {
        self.embed_fails.store(fail, Ordering::SeqCst);
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    fn default_response() -> String {
        r#"{"summary":"canned analysis","root_cause":"canned cause","severity":"medium",
            "recommendations":["canned recommendation"],"patterns":[],
            "error_analysis":[],"critical_errors":1,"non_critical_errors":0}"#
            .to_string()
    }
}

impl Default for FakeLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmOps for FakeLlm {
    fn health<'a>(
        &'a self,
        _endpoint: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<(), LlmError>> {
        Box::pin(async move {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(LlmError::Unavailable("scripted outage".to_string()))
            }
        })
    }

    fn list_models<'a>(
        &'a self,
        _endpoint: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, LlmError>> {
        Box::pin(async move {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(LlmError::Unavailable("scripted outage".to_string()));
            }
            Ok(self.models.lock().clone())
        })
    }

    fn generate<'a>(
        &'a self,
        _endpoint: &'a str,
        _model: &'a str,
        _prompt: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<String, LlmError>> {
        Box::pin(async move {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.generate_queue.lock().pop_front();
            match outcome {
                Some(outcome) => outcome.into_result(),
                None => Ok(Self::default_response()),
            }
        })
    }

    fn embed<'a>(
        &'a self,
        _endpoint: &'a str,
        _model: &'a str,
        _text: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>> {
        Box::pin(async move {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            if self.embed_fails.load(Ordering::SeqCst) {
                return Err(LlmError::Unavailable("scripted embed outage".to_string()));
            }
            Ok(self.embedding.lock().clone())
        })
    }
}
