//! Worker health status callbacks.
//!
//! Workers (or their supervisor) report `healthy`/`unhealthy` together with
//! their app data. The board keeps the latest report per worker; the health
//! tracker snapshots it and hands the live set to the worker registry.

use crate::models::WorkerAppData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Unhealthy,
}

/// A worker as currently observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWorker {
    pub id: String,
    pub healthy: bool,
    pub app_data: WorkerAppData,
}

#[derive(Debug, Clone)]
struct Report {
    status: WorkerStatus,
    app_data: WorkerAppData,
    received_at: Instant,
}

#[derive(Debug, Default)]
pub struct WorkerStatusBoard {
    reports: Mutex<HashMap<String, Report>>,
    changed: Notify,
}

impl WorkerStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status callback. Wakes the health tracker if the status
    /// flipped or the worker is new.
    pub fn report(&self, worker_id: &str, status: WorkerStatus, app_data: WorkerAppData) {
        let previous = {
            let mut reports = match self.reports.lock() {
                Ok(reports) => reports,
                Err(poisoned) => poisoned.into_inner(),
            };
            reports.insert(
                worker_id.to_string(),
                Report {
                    status,
                    app_data,
                    received_at: Instant::now(),
                },
            )
        };
        if previous.map(|p| p.status) != Some(status) {
            self.changed.notify_one();
        }
    }

    /// Current view; reports older than `staleness` count as unhealthy.
    pub fn snapshot(&self, staleness: Duration) -> Vec<LiveWorker> {
        let reports = match self.reports.lock() {
            Ok(reports) => reports,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let mut workers: Vec<LiveWorker> = reports
            .iter()
            .map(|(id, report)| LiveWorker {
                id: id.clone(),
                healthy: report.status == WorkerStatus::Healthy
                    && now.duration_since(report.received_at) <= staleness,
                app_data: report.app_data.clone(),
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Resolves when a status change has been reported.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
