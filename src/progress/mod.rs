//! Shared progress document for the currently active run.
//!
//! A single mutable JSON document, replaced wholesale at run start and
//! patched merge-by-key while the worker is executing. Readers get an
//! eventually-consistent snapshot; no history is kept.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
pub struct ProgressTracker {
    doc: Arc<Mutex<Map<String, Value>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            doc: Arc::new(Mutex::new(Map::new())),
        }
    }

    /// Replace the document with an empty object carrying only the run id,
    /// so stale progress from a previous run never leaks into the new
    /// run's view.
    pub async fn begin_run(&self, run_id: Uuid) {
        let mut doc = self.doc.lock().await;
        doc.clear();
        doc.insert("run_id".to_string(), Value::String(run_id.to_string()));
    }

    /// Merge-by-key patch: a present value overwrites the key, an explicit
    /// null deletes it.
    pub async fn apply(&self, patch: Map<String, Value>) {
        let mut doc = self.doc.lock().await;
        for (key, value) in patch {
            if value.is_null() {
                doc.remove(&key);
            } else {
                doc.insert(key, value);
            }
        }
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.doc.lock().await.clone()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
