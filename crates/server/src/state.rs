use std::sync::Arc;
use std::time::Duration;

use pipeline::parser::LogPipeline;

use crate::config::AppConfig;
use crate::db::Database;
use crate::jobs::ingest::IngestContext;
use crate::jobs::rca::RcaContext;
use crate::jobs::JobScheduler;
use crate::llm::{CallRecorder, HttpLlm, LlmGateway, LlmOps};
use crate::services::learning::LearningService;
use crate::services::FeedbackService;

/// Shared application state (thread-safe). Built once at boot, cloned into
/// every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub gateway: Arc<LlmGateway>,
    pub scheduler: Arc<JobScheduler>,
    pub feedback: FeedbackService,
}

impl AppState {
    /// Production wiring with the HTTP transport.
    pub fn new(config: AppConfig, db: Database) -> Self {
        Self::with_ops(config, db, Arc::new(HttpLlm::new()))
    }

    /// Wiring with an injected transport; router tests pass the fake.
    pub fn with_ops(config: AppConfig, db: Database, ops: Arc<dyn LlmOps>) -> Self {
        let config = Arc::new(config);
        let recorder = Arc::new(CallRecorder::new(config.llm.call_log_size));
        let gateway = Arc::new(LlmGateway::new(
            ops,
            recorder,
            Duration::from_secs(config.llm.health_timeout_secs),
        ));

        let feedback = FeedbackService::new(db.clone());
        let learning = Arc::new(LearningService::new(
            db.clone(),
            gateway.clone(),
            feedback.clone(),
        ));

        let ingest = IngestContext {
            db: db.clone(),
            pipeline: Arc::new(LogPipeline::new()),
        };
        let rca = RcaContext {
            db: db.clone(),
            gateway: gateway.clone(),
            learning,
            feedback: feedback.clone(),
            config: config.clone(),
        };
        let scheduler = JobScheduler::start(
            ingest,
            rca,
            config.workers.parse_pool,
            config.workers.rca_pool,
            config.workers.queue_depth,
        );

        Self {
            config,
            db,
            gateway,
            scheduler,
            feedback,
        }
    }

    /// Resolve the LLM endpoint for a user, falling back to the configured
    /// default.
    pub fn endpoint_for(&self, user: &crate::db::users::UserRecord) -> Option<String> {
        user.llm_endpoint
            .clone()
            .or_else(|| self.config.llm.default_endpoint.clone())
    }
}
