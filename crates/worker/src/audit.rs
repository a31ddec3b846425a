//! Periodic consistency audit.
//!
//! Compares the directory and template versions of every GPO and reports
//! template trees that have no directory object. Findings are logged; the
//! audit never repairs anything.

use std::time::Duration;

use soon_engine::GpoManager;
use tokio_util::sync::CancellationToken;

/// Run one audit and log the outcome. Returns whether the domain was clean.
pub async fn run_once(manager: &GpoManager) -> bool {
    match manager.audit().await {
        Ok(report) if report.is_clean() => {
            tracing::info!(checked = report.checked, "Audit clean");
            true
        }
        Ok(report) => {
            tracing::warn!(
                checked = report.checked,
                inconsistent = report.inconsistent.len(),
                orphan_trees = report.orphan_trees.len(),
                "Audit found problems"
            );
            match serde_json::to_string(&report) {
                Ok(json) => tracing::warn!(report = %json, "Audit report"),
                Err(e) => tracing::error!(error = %e, "Failed to serialize audit report"),
            }
            false
        }
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "Audit failed");
            false
        }
    }
}

/// Audit every `period` until `cancel` is triggered.
pub async fn run(manager: GpoManager, period: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = period.as_secs(), "Audit loop started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Audit loop stopping");
                break;
            }
            _ = interval.tick() => {
                run_once(&manager).await;
            }
        }
    }
}
