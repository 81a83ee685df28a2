//! Monthly backup format: JSON, optionally gzipped, with a bitwise
//! restore path. Restored summaries keep their metadata verbatim, so
//! `prevent_auto_recalculation` survives a restore.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

use carbonplane_registry::StoreError;

use crate::store::SummaryStore;
use crate::summary::EmissionSummary;

/// Current backup format version.
const BACKUP_VERSION: u32 = 1;

/// Gzip magic bytes, used to sniff compressed payloads on restore.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Backup scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Aggregate figures recorded alongside the data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(rename = "totalClients")]
    pub total_clients: usize,
    #[serde(rename = "totalCO2e")]
    pub total_co2e: f64,
}

/// A backup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub count: usize,
    pub data: Vec<EmissionSummary>,
    pub metadata: BackupMetadata,
}

/// Backup failures.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("backup serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backup io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported backup version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Creates and restores summary backups.
pub struct BackupService {
    summaries: Arc<dyn SummaryStore>,
}

impl BackupService {
    pub fn new(summaries: Arc<dyn SummaryStore>) -> Self {
        Self { summaries }
    }

    /// Full backup of one client's summary collection.
    pub async fn full_backup(&self, client_id: &str) -> Result<Backup, BackupError> {
        let data = self.summaries.all_for_client(client_id).await?;
        Ok(Self::wrap(BackupType::Full, data))
    }

    /// Incremental backup: summaries recalculated after `since`.
    pub async fn incremental_backup(
        &self,
        client_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Backup, BackupError> {
        let data: Vec<EmissionSummary> = self
            .summaries
            .all_for_client(client_id)
            .await?
            .into_iter()
            .filter(|s| s.metadata.last_calculated > since)
            .collect();
        Ok(Self::wrap(BackupType::Incremental, data))
    }

    fn wrap(backup_type: BackupType, data: Vec<EmissionSummary>) -> Backup {
        let clients: std::collections::HashSet<&str> =
            data.iter().map(|s| s.client_id.as_str()).collect();
        let metadata = BackupMetadata {
            total_clients: clients.len(),
            total_co2e: data.iter().map(|s| s.totals.co2e).sum(),
        };
        Backup {
            backup_type,
            timestamp: Utc::now(),
            version: BACKUP_VERSION,
            count: data.len(),
            data,
            metadata,
        }
    }

    /// Restore every summary in the backup verbatim. Returns how many
    /// documents were written.
    pub async fn restore(&self, backup: &Backup) -> Result<usize, BackupError> {
        if backup.version != BACKUP_VERSION {
            return Err(BackupError::VersionMismatch {
                found: backup.version,
                expected: BACKUP_VERSION,
            });
        }
        for summary in &backup.data {
            self.summaries.put(summary.clone()).await?;
        }
        tracing::info!(
            count = backup.count,
            backup_type = ?backup.backup_type,
            "Backup restored"
        );
        Ok(backup.data.len())
    }

    /// Serialise a backup to plain JSON.
    pub fn to_json(backup: &Backup) -> Result<Vec<u8>, BackupError> {
        Ok(serde_json::to_vec(backup)?)
    }

    /// Serialise a backup to gzipped JSON.
    pub fn to_gzip(backup: &Backup) -> Result<Vec<u8>, BackupError> {
        let json = serde_json::to_vec(backup)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Deserialise a backup, sniffing gzip by magic bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Backup, BackupError> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(bytes);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySummaryStore;
    use crate::summary::Period;

    fn summary(client: &str, month: u32, co2e: f64) -> EmissionSummary {
        let mut summary = EmissionSummary::empty(client, Period::Monthly { year: 2024, month });
        summary.totals.co2e = co2e;
        summary.totals.data_point_count = 1;
        summary
    }

    async fn seeded() -> (Arc<InMemorySummaryStore>, BackupService) {
        let store = Arc::new(InMemorySummaryStore::new());
        for month in 1..=3 {
            store.put(summary("acme", month, month as f64 * 100.0)).await.unwrap();
        }
        let service = BackupService::new(Arc::clone(&store) as Arc<dyn SummaryStore>);
        (store, service)
    }

    #[tokio::test]
    async fn test_full_backup_then_restore_is_bitwise() {
        let (store, service) = seeded().await;

        // Protect one summary; the bit must survive the round trip
        let period = Period::Monthly { year: 2024, month: 2 };
        let mut protected = store.get("acme", &period).await.unwrap().unwrap();
        protected.metadata.prevent_auto_recalculation = true;
        store.put(protected).await.unwrap();

        let backup = service.full_backup("acme").await.unwrap();
        assert_eq!(backup.count, 3);
        assert_eq!(backup.metadata.total_clients, 1);
        assert!((backup.metadata.total_co2e - 600.0).abs() < 1e-9);

        let before = store.all_for_client("acme").await.unwrap();
        assert_eq!(store.delete_all("acme").await.unwrap(), 3);
        assert!(store.all_for_client("acme").await.unwrap().is_empty());

        let restored = service.restore(&backup).await.unwrap();
        assert_eq!(restored, 3);
        let after = store.all_for_client("acme").await.unwrap();
        assert_eq!(before, after);
        assert!(store
            .get("acme", &period)
            .await
            .unwrap()
            .unwrap()
            .metadata
            .prevent_auto_recalculation);
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let (_store, service) = seeded().await;
        let backup = service.full_backup("acme").await.unwrap();

        let plain = BackupService::to_json(&backup).unwrap();
        let gzipped = BackupService::to_gzip(&backup).unwrap();
        assert!(gzipped.starts_with(&GZIP_MAGIC));

        let from_plain = BackupService::from_bytes(&plain).unwrap();
        let from_gzip = BackupService::from_bytes(&gzipped).unwrap();
        assert_eq!(from_plain.count, 3);
        assert_eq!(from_gzip.count, 3);
        assert_eq!(from_plain.data, from_gzip.data);
    }

    #[tokio::test]
    async fn test_incremental_filters_by_last_calculated() {
        let (store, service) = seeded().await;

        let cutoff = Utc::now();
        let mut fresh = summary("acme", 4, 50.0);
        fresh.metadata.last_calculated = cutoff + chrono::Duration::seconds(10);
        store.put(fresh).await.unwrap();

        let backup = service.incremental_backup("acme", cutoff).await.unwrap();
        assert_eq!(backup.backup_type, BackupType::Incremental);
        assert_eq!(backup.count, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (_store, service) = seeded().await;
        let mut backup = service.full_backup("acme").await.unwrap();
        backup.version = 99;
        assert!(matches!(
            service.restore(&backup).await,
            Err(BackupError::VersionMismatch { .. })
        ));
    }
}
