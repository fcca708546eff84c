use std::path::PathBuf;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strata_core::error::Result;
use strata_core::trace::{RunId, TraceEvent, TracePhase};

/// JSONL trace sink.
///
/// Consumes trace events from the event bus and appends each one as a JSON
/// line. The format is append-only and crash-resilient: if the process dies
/// mid-run, every previously written line is intact.
pub struct TraceLogger {
    log_dir: PathBuf,
}

impl TraceLogger {
    /// Logs are written to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Write events for `run_id` until its `RunFinished` event arrives, the
    /// bus closes, or `cancel` fires. Subscribe before starting the run so
    /// no event is missed. Returns the path of the file written.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<TraceEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let run_dir = self.log_dir.join(&run_id.0);
        tokio::fs::create_dir_all(&run_dir).await?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        info!(path = %log_path.display(), "TraceLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("TraceLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id != run_id {
                                continue;
                            }
                            let line = format!("{}\n", serde_json::to_string(&event)?);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write trace entry");
                                break;
                            }
                            // Flush after each entry for crash resilience
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush trace log");
                            }
                            if matches!(event.phase, TracePhase::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "TraceLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, TraceLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await?;
        debug!(path = %log_path.display(), "TraceLogger finished");
        Ok(log_path)
    }
}
