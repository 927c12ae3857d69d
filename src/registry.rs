use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::config::definition::ProcessId;
use crate::runner::RunnerHandle;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("`{0}` is already registered")]
    AlreadyRegistered(ProcessId),

    #[error("`{0}` is not registered")]
    NotFound(ProcessId),
}

/// Unique-key lookup from process id to runner address, scoped to this node.
/// The manager is the sole writer; any task may read. The registry never owns
/// runner lifetime.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<ProcessId, RunnerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ProcessId, handle: RunnerHandle) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        entries.insert(id, handle);
        Ok(())
    }

    pub fn unregister(&self, id: &ProcessId) -> Result<RunnerHandle, RegistryError> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn lookup(&self, id: &ProcessId) -> Option<RunnerHandle> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }
}
