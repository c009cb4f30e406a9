//! The per-target memory manager.
//!
//! Functions register pooled allocations (keyed by memory group and name)
//! together with the task interval over which their contents must stay valid.
//! `finalize` colors the intervals and creates one backing segment per color
//! class; every allocation then resolves to `segment base + 0` inside the
//! segment of its class.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kiln_core::{KilnError, Result, Target};

use crate::blob::{align_up, Blob, BLOB_ALIGN};
use crate::lifetime::{color_intervals, Interval};

/// How color classes map onto real allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAffinity {
    /// One backing blob per color class.
    #[default]
    Blob,
    /// One pool; classes are laid out at increasing aligned offsets.
    Offset,
}

/// Handle to a pooled allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u32);

impl AllocationId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Resolved placement of one allocation.
#[derive(Debug, Clone)]
pub struct Region {
    pub blob: Arc<Blob>,
    /// Byte offset of the allocation inside `blob`.
    pub offset: usize,
    /// Requested size in bytes.
    pub size: usize,
    pub lifetime: Interval,
}

#[derive(Debug)]
struct Request {
    group: String,
    key: String,
    size: usize,
    lifetime: Interval,
}

#[derive(Debug, Clone)]
struct Segment {
    blob: Arc<Blob>,
    offset: usize,
    capacity: usize,
}

#[derive(Debug)]
struct Plan {
    segments: Vec<Segment>,
    /// Color class of each planned request.
    class_of: Vec<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    requests: Vec<Request>,
    index: HashMap<(String, String), AllocationId>,
    plan: Option<Plan>,
    /// Requests were added or re-timed after the last plan.
    stale: bool,
}

/// Lifetime-aware pool of temporaries for one target.
#[derive(Debug)]
pub struct MemoryManager {
    target: Target,
    affinity: MemoryAffinity,
    inner: Mutex<Inner>,
}

impl MemoryManager {
    pub fn new(target: Target, affinity: MemoryAffinity) -> Self {
        Self {
            target,
            affinity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn affinity(&self) -> MemoryAffinity {
        self.affinity
    }

    /// Register (or update) the allocation `key` of memory group `group`.
    ///
    /// Re-requesting an existing key returns the same id. After finalization a
    /// size change resizes in place (see [`MemoryManager::resize`]); a new key
    /// or a changed lifetime leaves the plan stale until [`MemoryManager::refinalize`].
    pub fn request(&self, group: &str, key: &str, size: usize, lifetime: Interval) -> Result<AllocationId> {
        let mut inner = self.inner.lock();
        let lookup = (group.to_string(), key.to_string());

        if let Some(&id) = inner.index.get(&lookup) {
            let planned = inner.plan.is_some();
            let req = &mut inner.requests[id.index()];
            if req.lifetime != lifetime {
                req.lifetime = lifetime;
                if planned {
                    debug!(group, key, ?lifetime, "lifetime changed after finalize");
                    inner.stale = true;
                }
            }
            Self::resize_locked(&mut inner, self.target, id, size)?;
            return Ok(id);
        }

        let id = AllocationId(inner.requests.len() as u32);
        inner.requests.push(Request {
            group: group.to_string(),
            key: key.to_string(),
            size,
            lifetime,
        });
        inner.index.insert(lookup, id);
        if inner.plan.is_some() {
            debug!(group, key, size, "new allocation after finalize");
            inner.stale = true;
        }
        Ok(id)
    }

    /// Color all requests and create the backing storage. Exactly once.
    pub fn finalize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.plan.is_some() {
            return Err(KilnError::usage(format!(
                "memory manager for {} finalized twice",
                self.target
            )));
        }
        self.build_plan(&mut inner);
        Ok(())
    }

    /// Rebuild the whole plan from the current requests with fresh storage.
    pub fn refinalize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.plan.is_none() {
            return Err(KilnError::usage("refinalize before finalize"));
        }
        self.build_plan(&mut inner);
        Ok(())
    }

    fn build_plan(&self, inner: &mut Inner) {
        let spans: Vec<(Interval, usize)> = inner.requests.iter().map(|r| (r.lifetime, r.size)).collect();
        let coloring = color_intervals(&spans);

        let segments: Vec<Segment> = match self.affinity {
            MemoryAffinity::Blob => coloring
                .class_sizes
                .iter()
                .map(|&capacity| Segment {
                    blob: Arc::new(Blob::new(capacity, self.target)),
                    offset: 0,
                    capacity,
                })
                .collect(),
            MemoryAffinity::Offset => {
                let pool_size: usize = coloring.class_sizes.iter().map(|&s| align_up(s, BLOB_ALIGN)).sum();
                let pool = Arc::new(Blob::new(pool_size, self.target));
                let mut offset = 0;
                coloring
                    .class_sizes
                    .iter()
                    .map(|&capacity| {
                        let seg = Segment {
                            blob: Arc::clone(&pool),
                            offset,
                            capacity,
                        };
                        offset += align_up(capacity, BLOB_ALIGN);
                        seg
                    })
                    .collect()
            }
        };

        info!(
            target_backend = %self.target,
            affinity = ?self.affinity,
            allocations = inner.requests.len(),
            classes = segments.len(),
            bytes = coloring.total_size(),
            "memory plan finalized"
        );

        inner.plan = Some(Plan {
            segments,
            class_of: coloring.classes,
        });
        inner.stale = false;
    }

    /// Change the size of an allocation.
    ///
    /// Before finalization this only records the size. Afterwards, shrinking
    /// keeps the current placement; growing past the class capacity moves that
    /// class (and only that class) into a new dedicated allocation.
    pub fn resize(&self, id: AllocationId, size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::resize_locked(&mut inner, self.target, id, size)
    }

    fn resize_locked(inner: &mut Inner, target: Target, id: AllocationId, size: usize) -> Result<()> {
        let req = inner
            .requests
            .get_mut(id.index())
            .ok_or_else(|| KilnError::usage(format!("unknown allocation {id:?}")))?;
        if req.size == size {
            return Ok(());
        }
        req.size = size;

        let Some(plan) = inner.plan.as_mut() else {
            return Ok(());
        };
        let Some(&class) = plan.class_of.get(id.index()) else {
            return Ok(());
        };
        let seg = &mut plan.segments[class];
        if size > seg.capacity {
            info!(
                target_backend = %target,
                class,
                from = seg.capacity,
                to = size,
                "growing memory class"
            );
            *seg = Segment {
                blob: Arc::new(Blob::new(size, target)),
                offset: 0,
                capacity: size,
            };
        }
        Ok(())
    }

    /// Placement of an allocation. Requires an up-to-date plan.
    pub fn region(&self, id: AllocationId) -> Result<Region> {
        let inner = self.inner.lock();
        let plan = inner
            .plan
            .as_ref()
            .ok_or_else(|| KilnError::usage(format!("memory manager for {} is not finalized", self.target)))?;
        if inner.stale {
            return Err(KilnError::usage(format!(
                "memory manager for {} has requests newer than its plan; refinalize first",
                self.target
            )));
        }
        let req = inner
            .requests
            .get(id.index())
            .ok_or_else(|| KilnError::usage(format!("unknown allocation {id:?}")))?;
        let seg = &plan.segments[plan.class_of[id.index()]];
        Ok(Region {
            blob: Arc::clone(&seg.blob),
            offset: seg.offset,
            size: req.size,
            lifetime: req.lifetime,
        })
    }

    pub fn lifetime(&self, id: AllocationId) -> Option<Interval> {
        self.inner.lock().requests.get(id.index()).map(|r| r.lifetime)
    }

    pub fn size(&self, id: AllocationId) -> Option<usize> {
        self.inner.lock().requests.get(id.index()).map(|r| r.size)
    }

    pub fn lookup(&self, group: &str, key: &str) -> Option<AllocationId> {
        self.inner.lock().index.get(&(group.to_string(), key.to_string())).copied()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().plan.is_some()
    }

    /// New keys or lifetimes were registered since the last plan.
    pub fn needs_refinalize(&self) -> bool {
        self.inner.lock().stale
    }

    pub fn num_allocations(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Number of color classes (distinct reusable blocks) in the current plan.
    pub fn num_blocks(&self) -> usize {
        self.inner.lock().plan.as_ref().map_or(0, |p| p.segments.len())
    }

    /// Bytes reserved for pooled allocations: the sum of class capacities.
    pub fn peak_bytes(&self) -> usize {
        self.inner
            .lock()
            .plan
            .as_ref()
            .map_or(0, |p| p.segments.iter().map(|s| s.capacity).sum())
    }

    /// Bytes the unpooled alternative would use: the sum of all requests.
    pub fn requested_bytes(&self) -> usize {
        self.inner.lock().requests.iter().map(|r| r.size).sum()
    }

    /// Allocations registered by one memory group, in request order.
    pub fn group_allocations(&self, group: &str) -> Vec<(String, AllocationId)> {
        let inner = self.inner.lock();
        inner
            .requests
            .iter()
            .enumerate()
            .filter(|(_, r)| r.group == group)
            .map(|(i, r)| (r.key.clone(), AllocationId(i as u32)))
            .collect()
    }
}
