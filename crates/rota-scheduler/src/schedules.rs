use std::sync::Arc;

use chrono::Utc;
use rota_core::config::PaginationConfig;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::pagination::{resolve_limit, Page, PageRequest};
use crate::recurrence;
use crate::store::Store;
use crate::types::{Metadata, NewSchedule, Schedule, ScheduleChanges, ScheduleFilter};

const MAX_TENANT_LEN: usize = 255;

/// Validated schedule CRUD and schedule metadata.
pub struct ScheduleService {
    store: Arc<dyn Store>,
    pagination: PaginationConfig,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>, pagination: PaginationConfig) -> Self {
        Self { store, pagination }
    }

    /// Create a schedule with its first `next_run` computed from now.
    pub fn create(&self, new: &NewSchedule) -> Result<Schedule> {
        validate_tenant(&new.tenant)?;
        validate_action(&new.action)?;
        if let Some(id) = &new.id {
            validate_uuid(id)?;
        }
        recurrence::validate(&new.recurrence)?;
        let next_run = recurrence::next_run(&new.recurrence, Utc::now())?;

        let schedule = self.store.schedule_create(new, next_run)?;
        info!(
            schedule_id = %schedule.id,
            tenant = %schedule.tenant,
            action = %schedule.action,
            %next_run,
            "schedule created"
        );
        Ok(schedule)
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        self.store.schedule_get_by_id(id)
    }

    pub fn list(&self, filter: &ScheduleFilter, page: &PageRequest) -> Result<Page<Schedule>> {
        let limit = resolve_limit(page.limit, &self.pagination)?;
        let schedules = self
            .store
            .schedule_list(filter, page.marker.as_deref(), limit)?;
        Ok(Page::new(schedules, limit, |s: &Schedule| s.id.as_str()))
    }

    /// Apply `changes`. Touching any recurrence field recomputes `next_run`
    /// from now.
    pub fn update(&self, id: &str, changes: &ScheduleChanges) -> Result<Schedule> {
        if let Some(tenant) = &changes.tenant {
            validate_tenant(tenant)?;
        }
        if let Some(action) = &changes.action {
            validate_action(action)?;
        }

        let next_run = if changes.touches_recurrence() {
            let current = self.store.schedule_get_by_id(id)?;
            let rec = changes.apply_recurrence(&current.recurrence);
            recurrence::validate(&rec)?;
            Some(recurrence::next_run(&rec, Utc::now())?)
        } else {
            None
        };

        let schedule = self.store.schedule_update(id, changes, next_run)?;
        info!(schedule_id = %id, next_run = %schedule.next_run, "schedule updated");
        Ok(schedule)
    }

    /// Delete the schedule and its metadata. Jobs already produced remain.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.schedule_delete(id)?;
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    // --- metadata ----------------------------------------------------------

    pub fn create_metadata(&self, schedule_id: &str, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.store.schedule_meta_create(schedule_id, key, value)
    }

    pub fn get_metadata(&self, schedule_id: &str, key: &str) -> Result<String> {
        self.store.schedule_meta_get(schedule_id, key)
    }

    pub fn list_metadata(&self, schedule_id: &str) -> Result<Metadata> {
        self.store.schedule_meta_list(schedule_id)
    }

    pub fn delete_metadata(&self, schedule_id: &str, key: &str) -> Result<()> {
        self.store.schedule_meta_delete(schedule_id, key)
    }

    pub fn replace_metadata(&self, schedule_id: &str, metadata: &Metadata) -> Result<Metadata> {
        for key in metadata.keys() {
            validate_key(key)?;
        }
        self.store.schedule_meta_replace(schedule_id, metadata)
    }
}

fn validate_tenant(tenant: &str) -> Result<()> {
    if tenant.trim().is_empty() {
        return Err(SchedulerError::Invalid("tenant must not be empty".to_string()));
    }
    if tenant.len() > MAX_TENANT_LEN {
        return Err(SchedulerError::Invalid(format!(
            "tenant must be at most {MAX_TENANT_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_action(action: &str) -> Result<()> {
    if action.trim().is_empty() {
        return Err(SchedulerError::Invalid("action must not be empty".to_string()));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SchedulerError::Invalid(
            "metadata key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Hyphenated UUID only; the simple and braced forms are rejected.
fn validate_uuid(id: &str) -> Result<()> {
    if id.len() == 36 && Uuid::parse_str(id).is_ok() {
        Ok(())
    } else {
        Err(SchedulerError::Invalid(format!("{id} is not a valid UUID")))
    }
}
