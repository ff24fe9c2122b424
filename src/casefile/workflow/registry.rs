// SPDX-License-Identifier: MIT

use crate::casefile::workflow::task::TaskUnit;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Task implementations by name, shared between clones
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Arc<dyn TaskUnit>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, task: Arc<dyn TaskUnit>) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.name().to_string(), task);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskUnit>> {
        let tasks = self.tasks.read().await;
        tasks.get(name).cloned()
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
