//! Bounded in-memory record of outbound model calls. A fixed-capacity ring
//! under one mutex; reads copy under the lock.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::CallType;

/// Payload/response excerpts are capped so the ring stays bounded even
/// with large prompts.
const EXCERPT_LIMIT: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub call_type: CallType,
    pub model: String,
    /// "ok" or "error".
    pub status: &'static str,
    pub duration_ms: u64,
    pub payload: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

pub struct CallRecorder {
    ring: Mutex<VecDeque<CallRecord>>,
    capacity: usize,
}

impl CallRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        call_type: CallType,
        model: &str,
        status: &'static str,
        duration_ms: u64,
        payload: &str,
        response: &str,
        error: Option<String>,
        log_file_id: Option<String>,
        job_id: Option<String>,
    ) {
        let record = CallRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            call_type,
            model: model.to_string(),
            status,
            duration_ms,
            payload: excerpt(payload),
            response: excerpt(response),
            error,
            log_file_id,
            job_id,
        };

        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Snapshot, newest last.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

fn excerpt(raw: &str) -> String {
    if raw.len() <= EXCERPT_LIMIT {
        return raw.to_string();
    }
    let mut cut = EXCERPT_LIMIT;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}… [truncated {} bytes]", &raw[..cut], raw.len() - cut)
}
