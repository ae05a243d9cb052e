#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rota_worker::snapshot::{
    Image, Server, CREATED_BY_KEY, CREATED_BY_VALUE, IMAGE_INSTANCE_KEY, RETENTION_KEY,
};
use rota_worker::{ActionError, ImageService};

pub const NEW_IMAGE_ID: &str = "66666666-6666-6666-6666-666666666666";

/// Scripted image service. Polls pop `statuses` front to back and repeat
/// the last entry once the script runs out.
#[derive(Default)]
pub struct FakeImages {
    pub statuses: Mutex<VecDeque<Result<Option<String>, ActionError>>>,
    pub images: Mutex<Vec<Image>>,
    pub servers: Mutex<Vec<Server>>,
    pub deleted: Mutex<Vec<String>>,
    pub created_for: Mutex<Vec<String>>,
}

impl FakeImages {
    pub fn with_statuses(statuses: &[Option<&str>]) -> Self {
        let fake = Self::default();
        *fake.statuses.lock().unwrap() = statuses
            .iter()
            .map(|s| Ok(s.map(str::to_string)))
            .collect();
        fake
    }

    pub fn push_status(&self, status: Result<Option<String>, ActionError>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn add_server(&self, id: &str, retention: Option<u32>) {
        let mut metadata = BTreeMap::new();
        if let Some(r) = retention {
            metadata.insert(RETENTION_KEY.to_string(), r.to_string());
        }
        self.servers.lock().unwrap().push(Server {
            id: id.to_string(),
            metadata,
        });
    }

    /// `count` scheduled images for `instance_id`, one day apart, newest
    /// first. Returns their ids in that order.
    pub fn add_images(
        &self,
        instance_id: &str,
        count: usize,
        newest: DateTime<Utc>,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        let mut images = self.images.lock().unwrap();
        for i in 0..count {
            let id = format!("{instance_id}-image-{i}");
            images.push(Image {
                id: id.clone(),
                created: newest - Duration::days(i as i64),
                metadata: BTreeMap::from([
                    (IMAGE_INSTANCE_KEY.to_string(), instance_id.to_string()),
                    (CREATED_BY_KEY.to_string(), CREATED_BY_VALUE.to_string()),
                ]),
            });
            ids.push(id);
        }
        ids
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageService for FakeImages {
    async fn create_image(
        &self,
        instance_id: &str,
        _name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, ActionError> {
        assert_eq!(
            metadata.get(CREATED_BY_KEY).map(String::as_str),
            Some(CREATED_BY_VALUE)
        );
        self.created_for.lock().unwrap().push(instance_id.to_string());
        let mut image_metadata = metadata.clone();
        image_metadata.insert(IMAGE_INSTANCE_KEY.to_string(), instance_id.to_string());
        self.images.lock().unwrap().push(Image {
            id: NEW_IMAGE_ID.to_string(),
            created: Utc::now(),
            metadata: image_metadata,
        });
        Ok(NEW_IMAGE_ID.to_string())
    }

    async fn image_status(&self, _image_id: &str) -> Result<Option<String>, ActionError> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.pop_front().unwrap()
        } else {
            statuses.front().cloned().unwrap_or(Ok(None))
        }
    }

    async fn get_server(&self, instance_id: &str) -> Result<Option<Server>, ActionError> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == instance_id)
            .cloned())
    }

    async fn list_images(&self) -> Result<Vec<Image>, ActionError> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), ActionError> {
        self.images.lock().unwrap().retain(|i| i.id != image_id);
        self.deleted.lock().unwrap().push(image_id.to_string());
        Ok(())
    }
}
