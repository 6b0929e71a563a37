//! Log ingestion and root-cause-analysis service.
//!
//! The binary in `main.rs` wires configuration, the SQLite repository, the
//! LLM gateway, the background worker pools, and the HTTP API defined
//! here. The heavy parsing/analysis-preparation logic lives in the
//! `pipeline` crate; this crate owns persistence, orchestration, and the
//! serving surface.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod services;
pub mod state;
