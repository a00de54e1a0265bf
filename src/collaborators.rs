use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::Engine;
use crate::error::ActionError;
use crate::model::*;

// ── Interfaces ───────────────────────────────────────────────────

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), ActionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    Summary,
    Dynamic { template: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub kind: ReportKind,
    pub from: Ms,
    pub to: Ms,
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn render(&self, request: &ReportRequest) -> Result<Vec<u8>, ActionError>;
}

#[async_trait]
pub trait BackupUploader: Send + Sync {
    /// Store `snapshot` under `destination`. Failures carry the byte count.
    async fn upload(&self, snapshot: &[u8], destination: &str) -> Result<(), ActionError>;
}

// ── Defaults ─────────────────────────────────────────────────────

/// Logs deliveries instead of sending them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), ActionError> {
        if recipients.is_empty() {
            return Err(ActionError::Mail("no recipients".into()));
        }
        tracing::info!(
            "mail to {}: {subject} ({} bytes)",
            recipients.join(", "),
            body.len()
        );
        Ok(())
    }
}

/// Templates understood by [`JsonReportGenerator`].
pub const REPORT_TEMPLATES: [&str; 3] = ["reservations", "by_resource", "by_owner"];

/// Renders reservation data straight from the engine as JSON.
pub struct JsonReportGenerator {
    engine: Arc<Engine>,
}

impl JsonReportGenerator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

fn count_by<K: Ord + Clone>(
    reservations: &[Reservation],
    key: impl Fn(&Reservation) -> K,
) -> std::collections::BTreeMap<K, usize> {
    let mut counts = std::collections::BTreeMap::new();
    for r in reservations {
        *counts.entry(key(r)).or_insert(0) += 1;
    }
    counts
}

fn reservation_json(r: &Reservation) -> serde_json::Value {
    json!({
        "id": r.id.to_string(),
        "resource_id": r.resource_id.to_string(),
        "owner": r.owner,
        "start": r.span.start,
        "end": r.span.end,
        "status": r.status.as_str(),
        "label": r.label,
    })
}

#[async_trait]
impl ReportGenerator for JsonReportGenerator {
    async fn render(&self, request: &ReportRequest) -> Result<Vec<u8>, ActionError> {
        let reservations = self
            .engine
            .reservations_between(request.from, request.to)
            .await
            .map_err(|e| ActionError::Render(e.to_string()))?;
        let active = reservations.iter().filter(|r| r.is_active()).count();

        let (name, body) = match &request.kind {
            ReportKind::Summary => (
                "summary",
                json!({
                    "by_resource": count_by(&reservations, |r| r.resource_id.to_string()),
                }),
            ),
            ReportKind::Dynamic { template } => {
                let body = match template.as_str() {
                    "reservations" => json!({
                        "reservations": reservations.iter().map(reservation_json).collect::<Vec<_>>(),
                    }),
                    "by_resource" => json!({
                        "by_resource": count_by(&reservations, |r| r.resource_id.to_string()),
                    }),
                    "by_owner" => json!({
                        "by_owner": count_by(&reservations, |r| {
                            r.owner.clone().unwrap_or_else(|| "(forgotten)".into())
                        }),
                    }),
                    other => {
                        return Err(ActionError::Render(format!(
                            "unknown template {other:?}, expected one of {}",
                            REPORT_TEMPLATES.join(", ")
                        )));
                    }
                };
                (template.as_str(), body)
            }
        };

        let mut doc = json!({
            "report": name,
            "from": request.from,
            "to": request.to,
            "total": reservations.len(),
            "active": active,
            "cancelled": reservations.len() - active,
        });
        if let (Some(doc), Some(body)) = (doc.as_object_mut(), body.as_object()) {
            doc.extend(body.clone());
        }
        serde_json::to_vec_pretty(&doc).map_err(|e| ActionError::Render(e.to_string()))
    }
}

/// Writes backups into a local directory.
pub struct DirectoryUploader {
    dir: PathBuf,
}

impl DirectoryUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BackupUploader for DirectoryUploader {
    async fn upload(&self, snapshot: &[u8], destination: &str) -> Result<(), ActionError> {
        let fail = |e: std::io::Error| ActionError::Upload {
            size: snapshot.len(),
            error: e.to_string(),
        };
        if destination.contains('/') || destination.contains('\\') || destination.starts_with('.') {
            return Err(ActionError::Upload {
                size: snapshot.len(),
                error: format!("invalid destination name: {destination}"),
            });
        }
        tokio::fs::create_dir_all(&self.dir).await.map_err(fail)?;
        let tmp = self.dir.join(format!(".{destination}.tmp"));
        let path = self.dir.join(destination);
        tokio::fs::write(&tmp, snapshot).await.map_err(fail)?;
        tokio::fs::rename(&tmp, &path).await.map_err(fail)?;
        tracing::info!("backup written to {} ({} bytes)", path.display(), snapshot.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_mailer_requires_recipients() {
        let err = LogMailer.send(&[], "subject", "body").await.unwrap_err();
        assert!(matches!(err, ActionError::Mail(_)));
        LogMailer
            .send(&["ops@example.com".into()], "subject", "body")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn directory_uploader_writes_file() {
        let dir = std::env::temp_dir().join("parkd_test_uploader");
        let _ = std::fs::remove_dir_all(&dir);
        let uploader = DirectoryUploader::new(&dir);

        uploader.upload(b"snapshot", "backup-1.wal").await.unwrap();
        assert_eq!(std::fs::read(dir.join("backup-1.wal")).unwrap(), b"snapshot");

        let err = uploader.upload(b"x", "../escape.wal").await.unwrap_err();
        assert!(matches!(err, ActionError::Upload { size: 1, .. }));
    }
}
