//! In-memory task store for tests and platforms without file storage.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{TaskRecord, TaskStore};

#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.read().unwrap().get(task_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let mut out: Vec<TaskRecord> = self.records.read().unwrap().values().cloned().collect();
        out.sort_by_key(|r| (r.created_at, r.task_id.clone()));
        Ok(out)
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.records.write().unwrap().remove(task_id);
        Ok(())
    }
}
