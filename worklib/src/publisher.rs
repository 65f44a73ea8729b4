use crate::error::Result;
use crate::services::ObjectStore;
use crate::types::ObjectBlob;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Keys written to the object store.
    pub uploaded: Vec<String>,
    /// Keys whose upload failed.
    pub failed: Vec<String>,
}

/// Uploads a working directory's files to `<job_id>/<basename>`.
///
/// Every regular file directly in the directory is published, including staged inputs
/// and the script itself. Subdirectories are not descended into.
pub struct OutputPublisher {
    objects: Arc<dyn ObjectStore>,
}

impl OutputPublisher {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Uploads are independent: a failed file is logged and the rest still go out.
    /// Only failing to list the directory is an error.
    pub async fn publish(
        &self,
        job_id: &str,
        bucket: &str,
        workdir: &Path,
    ) -> Result<PublishReport> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(workdir).await?;
        while let Some(entry) = entries.next_entry().await? {
            match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => {
                    names.push(entry.file_name().to_string_lossy().into_owned())
                }
                _ => {}
            }
        }
        names.sort();

        info!(count = names.len(), "putting files in object store");
        let mut report = PublishReport::default();
        for name in names {
            let key = format!("{}/{}", job_id, name);
            let uploaded = match fs::read(workdir.join(&name)).await {
                Ok(bytes) => self.objects.put(bucket, &key, ObjectBlob::from(bytes)).await,
                Err(err) => Err(err.into()),
            };
            match uploaded {
                Ok(()) => {
                    info!(%bucket, %key, "PUT");
                    report.uploaded.push(key);
                }
                Err(err) => {
                    warn!(%bucket, %key, error = %err, "upload failed");
                    report.failed.push(key);
                }
            }
        }
        Ok(report)
    }
}
