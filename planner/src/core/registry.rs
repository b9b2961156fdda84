//! Insert-if-absent registries shared across concurrent branches.
//!
//! Both registries are injected into the orchestrator and build runtime
//! explicitly. Claims are a single atomic check-and-set on a `DashMap`
//! shard; no lock is ever held across an `.await`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::PlanError;

/// Child names already created under each parent.
#[derive(Debug, Default)]
pub struct ChildNameRegistry {
    names: DashMap<(String, String), ()>,
}

impl ChildNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `child` under `parent_path`; a second claim is a collision.
    pub fn claim(&self, parent_path: &str, child: &str) -> Result<(), PlanError> {
        match self
            .names
            .entry((parent_path.to_string(), child.to_string()))
        {
            Entry::Occupied(_) => Err(PlanError::Collision {
                key: format!("{parent_path}/{child}"),
                owner: parent_path.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Owner (leaf name) of each `(output_path, filename)` pair.
#[derive(Debug, Default)]
pub struct FileOwnershipRegistry {
    owners: DashMap<(String, String), String>,
}

impl FileOwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        output_path: &str,
        filename: &str,
        owner: &str,
    ) -> Result<(), PlanError> {
        match self
            .owners
            .entry((output_path.to_string(), filename.to_string()))
        {
            Entry::Occupied(existing) => Err(PlanError::Collision {
                key: display_key(output_path, filename),
                owner: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                Ok(())
            }
        }
    }

    pub fn owner(&self, output_path: &str, filename: &str) -> Option<String> {
        self.owners
            .get(&(output_path.to_string(), filename.to_string()))
            .map(|owner| owner.value().clone())
    }
}

fn display_key(output_path: &str, filename: &str) -> String {
    if output_path.is_empty() {
        filename.to_string()
    } else {
        format!("{output_path}/{filename}")
    }
}
