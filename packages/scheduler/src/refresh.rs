//! Monthly summary refresh: materialises the prior month's rollups for
//! every active client, so period summaries exist even for clients whose
//! data arrived while the materialiser was offline.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use carbonplane_registry::ClientStore;
use carbonplane_rollup::{Materialiser, Period};

use crate::jobs::{Job, JobError, JobReport};

/// The summary-creation job (`0 2 1 * *` by default).
pub struct SummaryRefreshJob {
    clients: Arc<dyn ClientStore>,
    materialiser: Arc<Materialiser>,
    timezone: Tz,
}

impl SummaryRefreshJob {
    pub fn new(
        clients: Arc<dyn ClientStore>,
        materialiser: Arc<Materialiser>,
        timezone: Tz,
    ) -> Self {
        Self {
            clients,
            materialiser,
            timezone,
        }
    }

    fn prior_month(&self) -> Period {
        let today = Utc::now().with_timezone(&self.timezone).date_naive();
        if today.month() == 1 {
            Period::Monthly {
                year: today.year() - 1,
                month: 12,
            }
        } else {
            Period::Monthly {
                year: today.year(),
                month: today.month() - 1,
            }
        }
    }
}

#[async_trait]
impl Job for SummaryRefreshJob {
    fn name(&self) -> &'static str {
        "summary-refresh"
    }

    async fn run(&self) -> Result<JobReport, JobError> {
        let clients = self
            .clients
            .active_clients()
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        let month = self.prior_month();
        let year = match month {
            Period::Monthly { year, .. } => Period::Yearly { year },
            _ => unreachable!("prior_month always returns a monthly period"),
        };

        let mut refreshed = 0;
        for client in clients {
            for period in [month, year, Period::AllTime] {
                let result = self
                    .materialiser
                    .recalculate(&client.client_id, period)
                    .await
                    .map_err(|e| JobError::Failed(e.to_string()))?;
                if result.is_some() {
                    refreshed += 1;
                }
            }
        }

        Ok(JobReport {
            items_processed: refreshed,
        })
    }
}
