use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::strategy::ActionStrategy;

/// Action name → strategy, assembled once at worker startup.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ActionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` for `action`, replacing any earlier one.
    pub fn register(&mut self, action: impl Into<String>, strategy: Arc<dyn ActionStrategy>) {
        let action = action.into();
        info!(%action, "action strategy registered");
        self.strategies.insert(action, strategy);
    }

    pub fn with(mut self, action: impl Into<String>, strategy: Arc<dyn ActionStrategy>) -> Self {
        self.register(action, strategy);
        self
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn ActionStrategy>> {
        self.strategies.get(action).cloned()
    }

    /// Registered action names, sorted so claim order is stable.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.strategies.keys().cloned().collect();
        actions.sort();
        actions
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
