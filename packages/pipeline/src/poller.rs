//! API poller: fetches configured HTTP endpoints for `api` scopes and
//! feeds the payloads through the ingestion pipeline.

use std::sync::Arc;
use std::time::Duration;

use carbonplane_registry::{ChartKind, FlowchartRegistry, InputType};

use crate::ingest::{IngestError, IngestInput, IngestReport, Ingestor};

/// Result of polling one scope.
#[derive(Debug)]
pub struct PollOutcome {
    pub node_id: String,
    pub scope_identifier: String,
    pub result: Result<IngestReport, IngestError>,
}

/// Polls every `api` scope of a client's active flowchart.
pub struct ApiPoller {
    http: reqwest::Client,
    registry: Arc<FlowchartRegistry>,
    ingestor: Arc<Ingestor>,
}

impl ApiPoller {
    pub fn new(registry: Arc<FlowchartRegistry>, ingestor: Arc<Ingestor>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            registry,
            ingestor,
        }
    }

    /// Poll all configured endpoints for one client. Endpoint failures
    /// are per-scope; one slow device never blocks the others' data.
    pub async fn poll_client(&self, client_id: &str) -> Vec<PollOutcome> {
        let chart = match self
            .registry
            .get_flowchart(client_id, ChartKind::Organisation)
            .await
        {
            Ok(Some(chart)) => chart,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(client_id = %client_id, error = %e, "Poll skipped: registry unavailable");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for node in &chart.nodes {
            for scope in &node.scopes {
                if scope.input_type != InputType::Api {
                    continue;
                }
                let Some(endpoint) = scope.api_endpoint.as_deref() else {
                    tracing::warn!(
                        client_id = %client_id,
                        scope = %scope.scope_identifier,
                        "API scope has no endpoint configured"
                    );
                    continue;
                };

                let result = self
                    .poll_endpoint(client_id, &node.node_id, &scope.scope_identifier, endpoint)
                    .await;
                outcomes.push(PollOutcome {
                    node_id: node.node_id.clone(),
                    scope_identifier: scope.scope_identifier.clone(),
                    result,
                });
            }
        }
        outcomes
    }

    async fn poll_endpoint(
        &self,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
        endpoint: &str,
    ) -> Result<IngestReport, IngestError> {
        let response = self
            .http
            .get(endpoint)
            .send()
            .await
            .map_err(|e| IngestError::BadPayload {
                reason: format!("endpoint {} unreachable: {}", endpoint, e),
            })?;

        if !response.status().is_success() {
            return Err(IngestError::BadPayload {
                reason: format!("endpoint {} returned {}", endpoint, response.status()),
            });
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| IngestError::BadPayload {
                reason: format!("endpoint {} returned non-JSON body: {}", endpoint, e),
            })?;

        self.ingestor
            .ingest(client_id, node_id, scope_identifier, IngestInput::ApiPoll(payload))
            .await
    }
}
