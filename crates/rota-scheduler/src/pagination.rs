use rota_core::config::PaginationConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Client paging parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    /// Id of the last item of the previous page.
    pub marker: Option<String>,
    pub limit: Option<u32>,
}

impl PageRequest {
    pub fn after(marker: impl Into<String>) -> Self {
        Self {
            marker: Some(marker.into()),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Set only when the page came back full, i.e. more items may exist.
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, limit: u32, id_of: impl Fn(&T) -> &str) -> Self {
        let full = !items.is_empty() && items.len() == limit as usize;
        let next_marker = if full {
            items.last().map(|item| id_of(item).to_string())
        } else {
            None
        };
        Self { items, next_marker }
    }
}

/// Effective page size: the configured default when unset, clamped to the
/// server maximum. Zero is rejected.
pub fn resolve_limit(requested: Option<u32>, config: &PaginationConfig) -> Result<u32> {
    match requested {
        Some(0) => Err(SchedulerError::Invalid(
            "limit must be a positive integer".to_string(),
        )),
        Some(n) => Ok(n.min(config.limit_max)),
        None => Ok(config.limit_default.min(config.limit_max)),
    }
}
