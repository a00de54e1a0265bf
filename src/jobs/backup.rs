use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::BackupUploader;
use crate::error::ActionError;
use crate::model::*;
use crate::timezone::utc_from_ms;

use super::JobAction;

/// Produces a restorable image of the whole service state.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<u8>, ActionError>;
}

/// Uploads a journal-format snapshot. Restoring is copying it over the journal.
pub struct BackupJob {
    source: Arc<dyn SnapshotSource>,
    uploader: Arc<dyn BackupUploader>,
}

impl BackupJob {
    pub fn new(source: Arc<dyn SnapshotSource>, uploader: Arc<dyn BackupUploader>) -> Self {
        Self { source, uploader }
    }

    pub fn destination(now: Ms) -> String {
        format!("parkd-{}.wal", utc_from_ms(now).format("%Y%m%dT%H%M%SZ"))
    }
}

#[async_trait]
impl JobAction for BackupJob {
    fn kind(&self) -> JobKind {
        JobKind::Backup
    }

    async fn fire(&self, _config: &ScheduleConfig, now: Ms) -> Result<(), ActionError> {
        let snapshot = self.source.snapshot().await?;
        self.uploader
            .upload(&snapshot, &Self::destination(now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixed(Vec<u8>);

    #[async_trait]
    impl SnapshotSource for Fixed {
        async fn snapshot(&self) -> Result<Vec<u8>, ActionError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recording {
        uploads: Mutex<Vec<(usize, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl BackupUploader for Recording {
        async fn upload(&self, snapshot: &[u8], destination: &str) -> Result<(), ActionError> {
            if self.fail {
                return Err(ActionError::Upload {
                    size: snapshot.len(),
                    error: "bucket unavailable".into(),
                });
            }
            self.uploads
                .lock()
                .unwrap()
                .push((snapshot.len(), destination.to_string()));
            Ok(())
        }
    }

    #[test]
    fn destination_is_timestamped() {
        // 2024-07-16T09:05:00Z
        assert_eq!(BackupJob::destination(1_721_120_700_000), "parkd-20240716T090500Z.wal");
    }

    #[tokio::test]
    async fn uploads_snapshot() {
        let uploader = Arc::new(Recording::default());
        let job = BackupJob::new(Arc::new(Fixed(vec![1, 2, 3])), uploader.clone());
        let cfg = ScheduleConfig::new(JobKind::Backup, Frequency::Daily, 2);
        job.fire(&cfg, 1_721_120_700_000).await.unwrap();
        let uploads = uploader.uploads.lock().unwrap();
        assert_eq!(uploads.as_slice(), &[(3, "parkd-20240716T090500Z.wal".to_string())]);
    }

    #[tokio::test]
    async fn upload_failure_reports_size() {
        let uploader = Arc::new(Recording { fail: true, ..Default::default() });
        let job = BackupJob::new(Arc::new(Fixed(vec![0; 10])), uploader);
        let cfg = ScheduleConfig::new(JobKind::Backup, Frequency::Daily, 2);
        let err = job.fire(&cfg, 0).await.unwrap_err();
        assert_eq!(
            err,
            ActionError::Upload { size: 10, error: "bucket unavailable".into() }
        );
    }
}
