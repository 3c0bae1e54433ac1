//! Concurrency admission: one running execution per pipeline config

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Compare-and-set running slot per `pipeline_config_id`.
///
/// This is the in-process arbiter that keeps two StartExecution handlers
/// from admitting simultaneously; the repository remains the system of
/// record, and the waiting queue is derived from it (NOT_STARTED
/// executions ordered by build time).
#[derive(Default)]
pub struct AdmissionController {
    running: Mutex<HashMap<String, Uuid>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the running slot. Succeeds if the slot is free or already
    /// held by this execution.
    pub fn try_acquire(&self, pipeline_config_id: &str, execution_id: Uuid) -> bool {
        let mut running = self.running.lock().unwrap();
        match running.get(pipeline_config_id) {
            Some(holder) => *holder == execution_id,
            None => {
                running.insert(pipeline_config_id.to_string(), execution_id);
                true
            }
        }
    }

    /// Record an already-running execution discovered in the repository
    /// (restart recovery).
    pub fn record_running(&self, pipeline_config_id: &str, execution_id: Uuid) {
        let mut running = self.running.lock().unwrap();
        running
            .entry(pipeline_config_id.to_string())
            .or_insert(execution_id);
    }

    /// Free the slot if this execution holds it.
    pub fn release(&self, pipeline_config_id: &str, execution_id: Uuid) {
        let mut running = self.running.lock().unwrap();
        if running.get(pipeline_config_id) == Some(&execution_id) {
            running.remove(pipeline_config_id);
        }
    }

    pub fn running(&self, pipeline_config_id: &str) -> Option<Uuid> {
        let running = self.running.lock().unwrap();
        running.get(pipeline_config_id).copied()
    }
}
