//! LLM gateway — the single point of contact with the external
//! generation/embedding endpoint.
//!
//! Domain code talks to [`LlmGateway`], which layers retry, timeout, and
//! call recording over an [`LlmOps`] implementation. `live.rs` provides the
//! reqwest-backed client; `fake.rs` provides a scripted test double.

pub mod fake;
pub mod live;
pub mod recorder;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

pub use live::HttpLlm;
pub use recorder::{CallRecord, CallRecorder};

/// Transient transport failures are retried at most this many times.
const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("endpoint unreachable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("endpoint returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Only transport-level failures are retryable; timeouts are fatal and
    /// HTTP errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    FormatInference,
    RcaAnalysis,
    RcaAggregation,
    Embedding,
    General,
}

/// Attribution for the call ring.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub log_file_id: Option<String>,
    pub job_id: Option<String>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe transport interface. One implementation speaks HTTP; the
/// fake replays scripted outcomes for tests.
pub trait LlmOps: Send + Sync {
    fn health<'a>(&'a self, endpoint: &'a str, timeout: Duration)
        -> BoxFuture<'a, Result<(), LlmError>>;

    fn list_models<'a>(
        &'a self,
        endpoint: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, LlmError>>;

    fn generate<'a>(
        &'a self,
        endpoint: &'a str,
        model: &'a str,
        prompt: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, LlmError>>;

    fn embed<'a>(
        &'a self,
        endpoint: &'a str,
        model: &'a str,
        text: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>>;
}

pub struct LlmGateway {
    ops: Arc<dyn LlmOps>,
    recorder: Arc<CallRecorder>,
    health_timeout: Duration,
}

impl LlmGateway {
    pub fn new(ops: Arc<dyn LlmOps>, recorder: Arc<CallRecorder>, health_timeout: Duration) -> Self {
        Self {
            ops,
            recorder,
            health_timeout,
        }
    }

    pub fn http(recorder: Arc<CallRecorder>, health_timeout: Duration) -> Self {
        Self::new(Arc::new(HttpLlm::new()), recorder, health_timeout)
    }

    pub fn recorder(&self) -> &Arc<CallRecorder> {
        &self.recorder
    }

    /// Probe the endpoint's tags route with a short timeout.
    pub async fn health(&self, endpoint: &str) -> Result<(), LlmError> {
        self.ops.health(endpoint, self.health_timeout).await
    }

    pub async fn list_models(&self, endpoint: &str) -> Result<Vec<String>, LlmError> {
        self.ops.list_models(endpoint, self.health_timeout).await
    }

    /// Blocking generation call with retry on transport failure and full
    /// call recording.
    pub async fn generate(
        &self,
        endpoint: &str,
        model: &str,
        prompt: &str,
        timeout: Duration,
        call_type: CallType,
        ctx: &CallContext,
    ) -> Result<String, LlmError> {
        let started = Instant::now();
        let result = self
            .with_retry(|| self.ops.generate(endpoint, model, prompt, timeout))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => self.recorder.record(
                call_type,
                model,
                "ok",
                duration_ms,
                prompt,
                response,
                None,
                ctx.log_file_id.clone(),
                ctx.job_id.clone(),
            ),
            Err(e) => self.recorder.record(
                call_type,
                model,
                "error",
                duration_ms,
                prompt,
                "",
                Some(e.to_string()),
                ctx.log_file_id.clone(),
                ctx.job_id.clone(),
            ),
        }
        result
    }

    pub async fn embed(
        &self,
        endpoint: &str,
        model: &str,
        text: &str,
        timeout: Duration,
        ctx: &CallContext,
    ) -> Result<Vec<f32>, LlmError> {
        let started = Instant::now();
        let result = self
            .with_retry(|| self.ops.embed(endpoint, model, text, timeout))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(vector) => self.recorder.record(
                CallType::Embedding,
                model,
                "ok",
                duration_ms,
                text,
                &format!("[{} dims]", vector.len()),
                None,
                ctx.log_file_id.clone(),
                ctx.job_id.clone(),
            ),
            Err(e) => self.recorder.record(
                CallType::Embedding,
                model,
                "error",
                duration_ms,
                text,
                "",
                Some(e.to_string()),
                ctx.log_file_id.clone(),
                ctx.job_id.clone(),
            ),
        }
        result
    }

    /// Exponential backoff (base 1 s, factor 2, ±20 % jitter) on transport
    /// failures only.
    async fn with_retry<'a, T, F>(&self, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> BoxFuture<'a, Result<T, LlmError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = backoff_with_jitter(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient LLM transport failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeLlm, FakeOutcome};
    use super::*;

    fn gateway(fake: Arc<FakeLlm>) -> LlmGateway {
        LlmGateway::new(fake, Arc::new(CallRecorder::new(50)), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_generate_records_success() {
        let fake = Arc::new(FakeLlm::new());
        fake.push_generate(FakeOutcome::Ok("{\"summary\":\"s\"}".to_string()));
        let gw = gateway(fake);

        let out = gw
            .generate(
                "http://fake/api",
                "llama3.1",
                "prompt",
                Duration::from_secs(30),
                CallType::RcaAnalysis,
                &CallContext::default(),
            )
            .await
            .unwrap();
        assert!(out.contains("summary"));

        let snapshot = gw.recorder().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, "ok");
        assert_eq!(snapshot[0].call_type, CallType::RcaAnalysis);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_retried_twice() {
        let fake = Arc::new(FakeLlm::new());
        fake.push_generate(FakeOutcome::Unavailable);
        fake.push_generate(FakeOutcome::Unavailable);
        fake.push_generate(FakeOutcome::Ok("recovered".to_string()));
        let gw = gateway(fake.clone());

        let out = gw
            .generate(
                "http://fake/api",
                "m",
                "p",
                Duration::from_secs(30),
                CallType::General,
                &CallContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(fake.generate_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_two_retries() {
        let fake = Arc::new(FakeLlm::new());
        for _ in 0..4 {
            fake.push_generate(FakeOutcome::Unavailable);
        }
        let gw = gateway(fake.clone());

        let err = gw
            .generate(
                "http://fake/api",
                "m",
                "p",
                Duration::from_secs(30),
                CallType::General,
                &CallContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
        // Initial attempt + two retries
        assert_eq!(fake.generate_calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_not_retried() {
        let fake = Arc::new(FakeLlm::new());
        fake.push_generate(FakeOutcome::Timeout);
        fake.push_generate(FakeOutcome::Ok("never reached".to_string()));
        let gw = gateway(fake.clone());

        let err = gw
            .generate(
                "http://fake/api",
                "m",
                "p",
                Duration::from_secs(30),
                CallType::General,
                &CallContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert_eq!(fake.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_http_4xx_not_retried() {
        let fake = Arc::new(FakeLlm::new());
        fake.push_generate(FakeOutcome::Http(404));
        let gw = gateway(fake.clone());

        let err = gw
            .generate(
                "http://fake/api",
                "m",
                "p",
                Duration::from_secs(30),
                CallType::General,
                &CallContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 404, .. }));
        assert_eq!(fake.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_embed_returns_vector_and_records() {
        let fake = Arc::new(FakeLlm::new());
        fake.set_embedding(vec![0.5, 0.5, 0.0]);
        let gw = gateway(fake);

        let vector = gw
            .embed(
                "http://fake/api",
                "nomic-embed-text",
                "some summary",
                Duration::from_secs(30),
                &CallContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(vector.len(), 3);

        let snapshot = gw.recorder().snapshot();
        assert_eq!(snapshot[0].call_type, CallType::Embedding);
        assert!(snapshot[0].response.contains("3 dims"));
    }

    #[tokio::test]
    async fn test_health_follows_fake_state() {
        let fake = Arc::new(FakeLlm::new());
        let gw = gateway(fake.clone());
        assert!(gw.health("http://fake/api").await.is_ok());

        fake.set_healthy(false);
        assert!(gw.health("http://fake/api").await.is_err());
    }
}
