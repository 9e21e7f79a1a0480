use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use runweave_core::types::{OrchestratorEvent, RunStatus};

/// JSONL orchestration logger.
///
/// Drains a bus receiver and appends one JSON object per line to
/// `{log_dir}/{session}/{timestamp}.jsonl`, flushing after every entry.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    session: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=batch summary, 2=+warnings and failures,
    /// 3=every node run transition.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Write entries until `cancel` fires or the bus closes.
    ///
    /// Takes a receiver subscribed by the caller, so nothing published after
    /// the call is missed while the log file is being opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<OrchestratorEvent>,
        session: String,
        cancel: CancellationToken,
    ) {
        let session_dir = self.log_dir.join(&session);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            // Buffered events are drained before cancellation is observed.
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&session, &event) else {
                                continue;
                            };
                            match serde_json::to_string(&entry) {
                                Ok(json) => {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                                Err(e) => error!(error = %e, "Failed to serialize log entry"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Returns None if the event is filtered out at this level.
    fn event_to_entry(&self, session: &str, event: &OrchestratorEvent) -> Option<LogEntry> {
        let entry = |event_type: &'static str, batch_id: Option<String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session: session.to_string(),
            event_type,
            batch_id,
            detail: Some(detail),
        };

        match event {
            // L1: batch summary
            OrchestratorEvent::BatchSubmitted {
                batch_id,
                node_ids,
                combinations,
            } => Some(entry(
                "batch_submitted",
                Some(batch_id.to_string()),
                serde_json::json!({ "node_ids": node_ids, "combinations": combinations }),
            )),
            OrchestratorEvent::SubmissionFailed { node_ids, error } => Some(entry(
                "submission_failed",
                None,
                serde_json::json!({ "node_ids": node_ids, "error": error }),
            )),
            OrchestratorEvent::BatchCanceled { batch_id } => Some(LogEntry {
                detail: None,
                ..entry("batch_canceled", Some(batch_id.to_string()), serde_json::Value::Null)
            }),
            OrchestratorEvent::BatchSettled { batch_id, status } => Some(entry(
                "batch_settled",
                Some(batch_id.to_string()),
                serde_json::json!({ "status": status }),
            )),

            // L2: warnings and failures
            OrchestratorEvent::CostWarningRaised { warning } if self.level >= 2 => Some(entry(
                "cost_warning",
                None,
                serde_json::to_value(warning).unwrap_or(serde_json::Value::Null),
            )),
            OrchestratorEvent::NodeRunUpdated {
                batch_id,
                node_id,
                node_run_id,
                status,
            } if self.level >= 3 || (self.level >= 2 && *status == RunStatus::Failed) => {
                Some(entry(
                    "node_run_updated",
                    Some(batch_id.to_string()),
                    serde_json::json!({
                        "node_id": node_id,
                        "node_run_id": node_run_id,
                        "status": status,
                    }),
                ))
            }

            _ => None,
        }
    }
}
