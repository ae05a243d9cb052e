//! Scheduled server snapshots with per-server retention.
//!
//! A job's `instance_id` metadata names the server. The strategy asks the
//! image service for a snapshot, polls it until it settles, then prunes
//! older scheduled snapshots of that same server down to the retention the
//! server advertises in its own metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rota_scheduler::Job;
use tracing::{debug, info, warn};

use crate::error::ActionError;
use crate::strategy::{ActionStrategy, ExternalStatus};

/// Job metadata key naming the server to snapshot.
pub const INSTANCE_ID_KEY: &str = "instance_id";
/// Image metadata key naming the server an image was taken from.
pub const IMAGE_INSTANCE_KEY: &str = "instance_uuid";
/// Image metadata marking snapshots this service created.
pub const CREATED_BY_KEY: &str = "org.openstack__1__created_by";
pub const CREATED_BY_VALUE: &str = "scheduled_images_service";
/// Server metadata key holding the number of snapshots to keep.
pub const RETENTION_KEY: &str = "org.openstack__1__retention";

/// An image as listed by the image service.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub created: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

/// The slice of a compute/image API the snapshot strategy needs.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Start a snapshot of `instance_id`; returns the new image id.
    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, ActionError>;

    /// Current image state (`QUEUED`, `SAVING`, `ACTIVE`, ...); `None` when
    /// the image cannot be found.
    async fn image_status(&self, image_id: &str) -> Result<Option<String>, ActionError>;

    async fn get_server(&self, instance_id: &str) -> Result<Option<Server>, ActionError>;

    async fn list_images(&self) -> Result<Vec<Image>, ActionError>;

    async fn delete_image(&self, image_id: &str) -> Result<(), ActionError>;
}

/// Snapshot-and-prune [`ActionStrategy`].
pub struct SnapshotStrategy {
    images: Arc<dyn ImageService>,
}

impl SnapshotStrategy {
    pub fn new(images: Arc<dyn ImageService>) -> Self {
        Self { images }
    }

    /// Delete scheduled snapshots of `instance_id` beyond the newest
    /// `retention`, never touching `keep_id` or another server's images.
    async fn prune(
        &self,
        instance_id: &str,
        keep_id: &str,
        retention: usize,
    ) -> Result<usize, ActionError> {
        let mut owned: Vec<Image> = self
            .images
            .list_images()
            .await?
            .into_iter()
            .filter(|image| {
                image.id != keep_id
                    && image.metadata.get(IMAGE_INSTANCE_KEY).map(String::as_str)
                        == Some(instance_id)
                    && image.metadata.get(CREATED_BY_KEY).map(String::as_str)
                        == Some(CREATED_BY_VALUE)
            })
            .collect();
        owned.sort_by(|a, b| b.created.cmp(&a.created));

        let mut deleted = 0;
        for image in owned.iter().skip(retention) {
            match self.images.delete_image(&image.id).await {
                Ok(()) => {
                    debug!(image_id = %image.id, %instance_id, "old snapshot deleted");
                    deleted += 1;
                }
                // A leftover image is picked up by the next run.
                Err(e) => warn!(image_id = %image.id, %instance_id, "snapshot delete failed: {e}"),
            }
        }
        Ok(deleted)
    }

    async fn retention(&self, instance_id: &str) -> Result<usize, ActionError> {
        let Some(server) = self.images.get_server(instance_id).await? else {
            warn!(%instance_id, "server not found, skipping retention");
            return Ok(0);
        };
        Ok(server
            .metadata
            .get(RETENTION_KEY)
            .and_then(|r| r.trim().parse::<usize>().ok())
            .unwrap_or(0))
    }
}

fn instance_id(job: &Job) -> Result<&str, ActionError> {
    job.metadata
        .get(INSTANCE_ID_KEY)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ActionError::Fatal(format!("job {} has no {INSTANCE_ID_KEY} metadata", job.id))
        })
}

#[async_trait]
impl ActionStrategy for SnapshotStrategy {
    async fn initiate(&self, job: &Job) -> Result<String, ActionError> {
        let instance_id = instance_id(job)?;
        let name = format!("Daily-{instance_id}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
        let metadata = BTreeMap::from([(CREATED_BY_KEY.to_string(), CREATED_BY_VALUE.to_string())]);

        let image_id = self.images.create_image(instance_id, &name, &metadata).await?;
        info!(job_id = %job.id, %instance_id, %image_id, "snapshot requested");
        Ok(image_id)
    }

    async fn poll(&self, handle: &str) -> Result<ExternalStatus, ActionError> {
        let status = self.images.image_status(handle).await?;
        Ok(match status.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("ACTIVE") => ExternalStatus::Succeeded,
            Some(state @ ("QUEUED" | "SAVING")) => ExternalStatus::InProgress(state.to_string()),
            Some(state) => ExternalStatus::Failed(format!("image {handle} entered state {state}")),
            None => ExternalStatus::Failed(format!("image {handle} not found")),
        })
    }

    async fn finalize(&self, job: &Job, handle: &str) -> Result<(), ActionError> {
        let instance_id = instance_id(job)?;
        let retention = self.retention(instance_id).await?;
        if retention == 0 {
            debug!(%instance_id, "no retention configured");
            return Ok(());
        }
        let deleted = self.prune(instance_id, handle, retention).await?;
        info!(job_id = %job.id, %instance_id, retention, deleted, "snapshots pruned");
        Ok(())
    }
}
