//! Operational log sink.
//!
//! Every ingestion run posts a structured [`RunReport`] to an external
//! sink when one is configured. The sink is strictly best-effort: a write
//! failure is a warning, never an error, and an unconfigured sink makes
//! every call a no-op.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::models::RunReport;

pub struct OpLog {
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
}

impl OpLog {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: config.oplog_url.clone(),
            token: config.oplog_token.clone(),
        }
    }

    pub async fn record_run(&self, report: &RunReport) {
        let Some(ref url) = self.url else {
            debug!(run_id = report.run_id, "No operational log sink configured");
            return;
        };

        let mut request = self.client.post(url).json(report);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(run_id = report.run_id, "Run report recorded");
            }
            Ok(response) => {
                warn!(
                    run_id = report.run_id,
                    status = %response.status(),
                    "Operational log sink rejected run report"
                );
            }
            Err(e) => {
                warn!(run_id = report.run_id, error = %e, "Failed to reach operational log sink");
            }
        }
    }
}
