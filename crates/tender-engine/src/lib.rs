//! Per-portal resumable crawl engine (extract -> classify -> enrich) and the
//! multi-worker orchestrator that runs portals in isolation against one store.

pub mod classify;
pub mod config;
pub mod enrich;
pub mod orchestrator;
pub mod pagination;
pub mod phases;
pub mod retry;
pub mod worker;

pub const CRATE_NAME: &str = "tender-engine";
