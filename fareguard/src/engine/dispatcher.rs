// fareguard/src/engine/dispatcher.rs
//
// Writes operator-facing records to JSONL files in the output directory.
//
//   ops_alerts.jsonl    — one line per batch that could not be committed
//                         (store ops failed after retries, offset commit
//                         failed). Wire this to your paging system.
//   fraud_alerts.jsonl  — audit trail: every fraud alert of a committed batch.
//
// Without an output directory the dispatcher only logs.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::engine::aggregate::BatchSummary;
use crate::error::WriteError;
use crate::events::RiskTier;

#[derive(Debug, Clone, Serialize)]
pub struct OpsAlert {
    pub kind:      &'static str,
    pub batch_id:  String,
    pub message:   String,
    /// Descriptions of the store ops that did not land.
    pub failed:    Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl OpsAlert {
    pub fn from_write_error(err: &WriteError) -> Self {
        let (kind, batch_id, failed) = match err {
            WriteError::Partial { batch_id, failed, .. } => (
                "partial_write",
                batch_id.clone(),
                failed.iter().map(|(i, op, e)| format!("#{} {}: {}", i, op, e)).collect(),
            ),
            WriteError::Commit { batch_id, source } => (
                "commit_failed",
                batch_id.clone(),
                vec![format!("HSET ingest:offsets: {}", source)],
            ),
            WriteError::Offsets(e) => ("offsets_unreadable", String::new(), vec![e.to_string()]),
        };
        Self { kind, batch_id, message: err.to_string(), failed, timestamp: Utc::now() }
    }
}

pub struct Dispatcher {
    out: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(output_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &output_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { out: output_dir })
    }

    pub async fn ops_alert(&self, err: &WriteError) -> Result<()> {
        let alert = OpsAlert::from_write_error(err);
        error!(kind = alert.kind, batch_id = %alert.batch_id, failed = alert.failed.len(), "{}", alert.message);
        self.write("ops_alerts.jsonl", &(serde_json::to_string(&alert)? + "\n")).await
    }

    /// Audit trail for a committed batch.
    pub async fn fraud_alerts(&self, summary: &BatchSummary) -> Result<()> {
        if summary.alerts.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for alert in &summary.alerts {
            let tier = RiskTier::from_score(alert.fraud_score);
            if tier == RiskTier::Critical {
                info!(
                    trip_id = %alert.trip_id,
                    score = alert.fraud_score,
                    zone = alert.pickup_zone,
                    "CRITICAL fraud alert"
                );
            }
            lines.push_str(&alert.to_json());
            lines.push('\n');
        }
        self.write("fraud_alerts.jsonl", &lines).await
    }

    async fn write(&self, file: &str, content: &str) -> Result<()> {
        let Some(dir) = &self.out else { return Ok(()) };
        let mut f = OpenOptions::new().create(true).append(true)
            .open(dir.join(file)).await?;
        f.write_all(content.as_bytes()).await?;
        Ok(())
    }
}
