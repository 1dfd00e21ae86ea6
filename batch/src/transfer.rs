//! The capability the scheduler drives: move one unit, or give up on a registered object.
use crate::context::TransferSettings;
use crate::unit::{Direction, TransferUnit};
use anyhow::Result;
use async_trait::async_trait;
use commons::retry::Retry;
use commons::{Error as CommonsError, Resolve};
use commons_download::{download_to_dir, DownloadOptions, DownloadOutcome};
use commons_upload::{upload_file, MultipartService, UploadConfig, UploadMode};
use std::sync::Arc;

/// A successfully transferred unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub object_id: String,
    pub mode: UploadMode,
    /// Only for downloads: where the data went and why
    pub download: Option<DownloadOutcome>,
}

#[async_trait]
pub trait Transfer: Send + Sync {
    /// The mode a transfer of this unit would use, for the ledger.
    async fn mode_for(&self, unit: &TransferUnit) -> UploadMode;

    async fn transfer(&self, unit: &TransferUnit) -> Result<Completed>;

    /// Delete an object whose upload is being given up.
    async fn abandon(&self, object_id: &str) -> Result<()>;
}

/// Transfers against a real commons, through a resolver and the broker's multipart methods.
pub struct CommonsTransfer {
    resolver: Arc<dyn Resolve>,
    multipart: Arc<dyn MultipartService>,
    upload: UploadConfig,
    download: DownloadOptions,
}

impl CommonsTransfer {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        multipart: Arc<dyn MultipartService>,
        settings: &TransferSettings,
    ) -> Self {
        Self {
            resolver,
            multipart,
            upload: settings.upload.clone(),
            download: settings.download,
        }
    }

    fn retry(&self) -> &Retry {
        &self.upload.retry
    }
}

#[async_trait]
impl Transfer for CommonsTransfer {
    async fn mode_for(&self, unit: &TransferUnit) -> UploadMode {
        match unit.direction {
            Direction::Download => UploadMode::Simple,
            Direction::Upload => {
                let size = match unit.size {
                    Some(size) => size,
                    None => tokio::fs::metadata(&unit.path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0),
                };
                self.upload.mode_for(size)
            }
        }
    }

    async fn transfer(&self, unit: &TransferUnit) -> Result<Completed> {
        match unit.direction {
            Direction::Upload => {
                let uploaded = upload_file(
                    &unit.path,
                    &unit.file_name,
                    unit.object_id.as_deref(),
                    &self.upload,
                    self.resolver.as_ref(),
                    self.multipart.as_ref(),
                )
                .await?;
                Ok(Completed {
                    object_id: uploaded.object_id,
                    mode: uploaded.mode,
                    download: None,
                })
            }
            Direction::Download => {
                let object_id = unit.object_id.as_deref().ok_or_else(|| {
                    CommonsError::Config(format!(
                        "download of {} has no object id",
                        unit.path.display()
                    ))
                })?;
                let outcome = download_to_dir(
                    object_id,
                    &unit.path,
                    &self.download,
                    self.retry(),
                    self.resolver.as_ref(),
                )
                .await?;
                Ok(Completed {
                    object_id: outcome.object_id.clone(),
                    mode: UploadMode::Simple,
                    download: Some(outcome),
                })
            }
        }
    }

    async fn abandon(&self, object_id: &str) -> Result<()> {
        self.resolver.delete(object_id).await
    }
}
