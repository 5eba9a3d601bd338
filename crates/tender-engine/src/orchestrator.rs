//! Fan portals out to isolated workers and aggregate how they ended.
//!
//! Workers are launched behind a trait so production can spawn one OS process
//! per portal while tests run them in-memory. The orchestrator never touches
//! the store itself; a dead worker costs its own portal and nothing else.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tender_core::PortalConfig;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How a launched worker finished, as observable from outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Completed,
    Failed { code: Option<i32> },
}

impl WorkerExit {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[async_trait]
pub trait WorkerHandle: Send {
    async fn wait(&mut self) -> Result<WorkerExit>;
}

/// Starts one worker for one portal. Launch failures count against the portal
/// the same as a worker that died.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, portal: &PortalConfig) -> Result<Box<dyn WorkerHandle>>;
}

#[derive(Debug, Clone)]
pub struct PortalRunSummary {
    pub portal_id: String,
    pub display_name: String,
    pub exit: WorkerExit,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSummary {
    pub portals: Vec<PortalRunSummary>,
    pub total_duration: Duration,
}

impl OrchestratorSummary {
    pub fn completed(&self) -> usize {
        self.portals.iter().filter(|p| p.exit.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.portals.len() - self.completed()
    }

    pub fn all_completed(&self) -> bool {
        self.failed() == 0
    }
}

pub struct Orchestrator {
    /// Pause between consecutive launches so the portals never see the whole
    /// fleet arrive at once.
    stagger: Duration,
}

impl Orchestrator {
    pub fn new(stagger: Duration) -> Self {
        Self { stagger }
    }

    /// Launch every portal, staggered, then wait for all of them. Portals run
    /// concurrently; the summary arrives only after the slowest one is done.
    pub async fn run(
        &self,
        launcher: &dyn WorkerLauncher,
        portals: &[PortalConfig],
    ) -> OrchestratorSummary {
        let run_start = Instant::now();
        let mut monitors: JoinSet<PortalRunSummary> = JoinSet::new();

        for (index, portal) in portals.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            info!(portal = %portal.portal_id, "launching worker");
            let portal = portal.clone();
            let started = Instant::now();
            match launcher.launch(&portal).await {
                Ok(mut handle) => {
                    monitors.spawn(async move {
                        let exit = match handle.wait().await {
                            Ok(exit) => exit,
                            Err(err) => {
                                error!(portal = %portal.portal_id, error = %err, "worker wait failed");
                                WorkerExit::Failed { code: None }
                            }
                        };
                        PortalRunSummary {
                            portal_id: portal.portal_id,
                            display_name: portal.display_name,
                            exit,
                            duration: started.elapsed(),
                        }
                    });
                }
                Err(err) => {
                    error!(portal = %portal.portal_id, error = %err, "worker launch failed");
                    monitors.spawn(async move {
                        PortalRunSummary {
                            portal_id: portal.portal_id,
                            display_name: portal.display_name,
                            exit: WorkerExit::Failed { code: None },
                            duration: started.elapsed(),
                        }
                    });
                }
            }
        }

        let mut summaries = Vec::with_capacity(portals.len());
        while let Some(joined) = monitors.join_next().await {
            match joined {
                Ok(summary) => {
                    match summary.exit {
                        WorkerExit::Completed => {
                            info!(portal = %summary.portal_id, took = ?summary.duration, "worker completed");
                        }
                        WorkerExit::Failed { code } => {
                            warn!(portal = %summary.portal_id, ?code, "worker failed");
                        }
                    }
                    summaries.push(summary);
                }
                Err(err) => error!(error = %err, "worker monitor panicked"),
            }
        }

        // Report in launch order, not completion order.
        summaries.sort_by_key(|s| {
            portals
                .iter()
                .position(|p| p.portal_id == s.portal_id)
                .unwrap_or(usize::MAX)
        });

        OrchestratorSummary {
            portals: summaries,
            total_duration: run_start.elapsed(),
        }
    }
}
