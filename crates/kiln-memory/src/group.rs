//! Memory groups: the scope in which one Function requests its temporaries.

use std::sync::Arc;

use kiln_core::{Result, Target};

use crate::lifetime::Interval;
use crate::manager::{AllocationId, MemoryManager};

/// Named view onto a [`MemoryManager`] with a fixed lifetime.
///
/// Every allocation requested through the group is live over the group's
/// interval, normally the single task that owns it.
#[derive(Debug, Clone)]
pub struct MemoryGroup {
    manager: Arc<MemoryManager>,
    name: String,
    lifetime: Interval,
}

impl MemoryGroup {
    pub fn new(manager: Arc<MemoryManager>, name: impl Into<String>, lifetime: Interval) -> Self {
        Self {
            manager,
            name: name.into(),
            lifetime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifetime(&self) -> Interval {
        self.lifetime
    }

    pub fn target(&self) -> Target {
        self.manager.target()
    }

    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Request (or re-request) scratch allocation `key` of `bytes` bytes.
    pub fn manage(&self, key: &str, bytes: usize) -> Result<AllocationId> {
        self.manager.request(&self.name, key, bytes, self.lifetime)
    }

    /// Allocations this group has requested so far.
    pub fn allocations(&self) -> Vec<(String, AllocationId)> {
        self.manager.group_allocations(&self.name)
    }
}
