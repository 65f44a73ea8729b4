use crate::config::StagingConfig;
use crate::error::{Error, Result};
use crate::services::ObjectStore;
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::{fs, time};
use tracing::{info, warn};

/// Materializes a job's input files in its working directory.
pub struct InputStager {
    objects: Arc<dyn ObjectStore>,
    config: StagingConfig,
}

impl InputStager {
    pub fn new(objects: Arc<dyn ObjectStore>, config: StagingConfig) -> Self {
        Self { objects, config }
    }

    /// Fetch everything stored under `<job_id>/`, then make sure every listed input is present.
    ///
    /// Inputs may still be uploading when the job is picked up, so each retry of the
    /// presence wait fetches the prefix again. Returns the names of the fetched files.
    pub async fn stage(
        &self,
        job_id: &str,
        bucket: &str,
        files: &[String],
        workdir: &Path,
    ) -> Result<Vec<String>> {
        fs::create_dir_all(workdir).await?;
        let mut fetched = self.fetch_remote(job_id, bucket, workdir).await?;
        let attempts = self.config.presence_attempts.max(1);
        let mut attempt = 1;
        while let Some(file) = missing_input(files, workdir).await? {
            if attempt >= attempts {
                return Err(Error::StagingTimeout {
                    file: file.clone(),
                    attempts,
                });
            }
            info!(file = %file, attempt, "waiting for input file");
            time::sleep(self.config.presence_interval).await;
            attempt += 1;
            for name in self.fetch_remote(job_id, bucket, workdir).await? {
                if !fetched.contains(&name) {
                    fetched.push(name);
                }
            }
        }
        Ok(fetched)
    }

    /// Download every object under the `<job_id>/` prefix into `workdir`,
    /// named by the part of the key after the prefix.
    pub async fn fetch_remote(
        &self,
        job_id: &str,
        bucket: &str,
        workdir: &Path,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}/", job_id);
        let mut fetched = Vec::new();
        for key in self.objects.list(bucket, &prefix).await? {
            let name = match key.strip_prefix(&prefix) {
                Some(name) if is_flat_name(name) => name,
                _ => {
                    warn!(%key, "skipping object outside the working directory");
                    continue;
                }
            };
            let blob = self.objects.get(bucket, &key).await?;
            fs::write(workdir.join(name), &blob).await?;
            info!(%bucket, %key, "GET");
            fetched.push(name.to_string());
        }
        Ok(fetched)
    }
}

/// The first listed file whose basename is not in `workdir`.
async fn missing_input<'a>(files: &'a [String], workdir: &Path) -> Result<Option<&'a String>> {
    for file in files {
        let name = Path::new(file)
            .file_name()
            .ok_or_else(|| Error::UnsafeFileName(file.clone()))?;
        if fs::metadata(workdir.join(name)).await.is_err() {
            return Ok(Some(file));
        }
    }
    Ok(None)
}

fn is_flat_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
}
