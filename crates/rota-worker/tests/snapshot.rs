mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{FakeImages, NEW_IMAGE_ID};
use rota_scheduler::{Job, JobStatus};
use rota_worker::snapshot::INSTANCE_ID_KEY;
use rota_worker::{ActionError, ActionStrategy, ExternalStatus, SnapshotStrategy};

const INSTANCE: &str = "instance-a";

fn job(instance_id: Option<&str>) -> Job {
    let now = Utc::now();
    let mut metadata = BTreeMap::new();
    if let Some(id) = instance_id {
        metadata.insert(INSTANCE_ID_KEY.to_string(), id.to_string());
    }
    Job {
        id: "job-1".into(),
        schedule_id: "schedule-1".into(),
        tenant: "tenant-1".into(),
        action: "snapshot".into(),
        worker_id: Some("w1".into()),
        status: JobStatus::Processing,
        retry_count: 0,
        timeout: Some(now + Duration::hours(1)),
        hard_timeout: Some(now + Duration::hours(2)),
        error_message: None,
        metadata,
        created_at: now,
        updated_at: now,
    }
}

fn strategy(images: &Arc<FakeImages>) -> SnapshotStrategy {
    SnapshotStrategy::new(Arc::clone(images) as Arc<dyn rota_worker::ImageService>)
}

#[tokio::test]
async fn initiate_snapshots_the_job_instance() {
    let images = Arc::new(FakeImages::default());
    let handle = strategy(&images).initiate(&job(Some(INSTANCE))).await.unwrap();
    assert_eq!(handle, NEW_IMAGE_ID);
    assert_eq!(*images.created_for.lock().unwrap(), vec![INSTANCE.to_string()]);
}

#[tokio::test]
async fn initiate_without_instance_is_fatal() {
    let images = Arc::new(FakeImages::default());
    let err = strategy(&images).initiate(&job(None)).await.unwrap_err();
    assert!(matches!(err, ActionError::Fatal(_)));
}

#[tokio::test]
async fn image_states_map_to_external_status() {
    let cases = [
        (Some("QUEUED"), ExternalStatus::InProgress("QUEUED".into())),
        (Some("saving"), ExternalStatus::InProgress("SAVING".into())),
        (Some("ACTIVE"), ExternalStatus::Succeeded),
    ];
    for (state, expected) in cases {
        let images = Arc::new(FakeImages::with_statuses(&[state]));
        assert_eq!(strategy(&images).poll(NEW_IMAGE_ID).await.unwrap(), expected);
    }

    for state in [Some("ERROR"), Some("KILLED"), Some("DELETED"), Some("PENDING_DELETE"), None] {
        let images = Arc::new(FakeImages::with_statuses(&[state]));
        let status = strategy(&images).poll(NEW_IMAGE_ID).await.unwrap();
        assert!(matches!(status, ExternalStatus::Failed(_)), "{state:?} gave {status:?}");
    }
}

#[tokio::test]
async fn retention_prunes_oldest_of_the_same_instance_only() {
    let images = Arc::new(FakeImages::default());
    images.add_server(INSTANCE, Some(3));
    let newest_prior = Utc::now() - Duration::hours(1);
    let ours = images.add_images(INSTANCE, 5, newest_prior);
    let theirs = images.add_images("instance-b", 3, newest_prior);

    let s = strategy(&images);
    let j = job(Some(INSTANCE));
    let handle = s.initiate(&j).await.unwrap();
    s.finalize(&j, &handle).await.unwrap();

    let mut deleted = images.deleted();
    deleted.sort();
    let mut expected = vec![ours[3].clone(), ours[4].clone()];
    expected.sort();
    assert_eq!(deleted, expected);

    let remaining: Vec<String> = images
        .images
        .lock()
        .unwrap()
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert!(remaining.contains(&NEW_IMAGE_ID.to_string()));
    for id in theirs.iter().chain(&ours[..3]) {
        assert!(remaining.contains(id), "{id} was pruned");
    }
}

#[tokio::test]
async fn nothing_pruned_within_retention_or_without_one() {
    let images = Arc::new(FakeImages::default());
    images.add_server(INSTANCE, Some(3));
    images.add_images(INSTANCE, 3, Utc::now() - Duration::hours(1));
    let s = strategy(&images);
    let j = job(Some(INSTANCE));
    let handle = s.initiate(&j).await.unwrap();
    s.finalize(&j, &handle).await.unwrap();
    assert!(images.deleted().is_empty());

    let unconfigured = Arc::new(FakeImages::default());
    unconfigured.add_server(INSTANCE, None);
    unconfigured.add_images(INSTANCE, 6, Utc::now());
    strategy(&unconfigured).finalize(&j, NEW_IMAGE_ID).await.unwrap();
    assert!(unconfigured.deleted().is_empty());

    // Server gone: finalize still succeeds.
    let orphan = Arc::new(FakeImages::default());
    orphan.add_images(INSTANCE, 6, Utc::now());
    strategy(&orphan).finalize(&j, NEW_IMAGE_ID).await.unwrap();
    assert!(orphan.deleted().is_empty());
}
