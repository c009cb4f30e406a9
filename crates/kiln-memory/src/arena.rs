//! Tensor arena.
//!
//! Tensors are addressed by `TensorHandle`, an index into the arena. A slot
//! holds the tensor's descriptor and its backing: an owned blob, a pooled
//! allocation of a [`MemoryManager`], or a sub-region of another tensor.
//! Functions only ever hold handles and resolve them to views when they run.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::error;

use kiln_core::{KilnError, Result, TensorDescriptor};

use crate::blob::Blob;
use crate::lifetime::Interval;
use crate::manager::{AllocationId, MemoryManager};
use crate::view::TensorView;

/// Index of a tensor in a [`TensorArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(u32);

impl TensorHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Where a tensor's bytes live.
#[derive(Debug, Clone)]
pub enum Backing {
    Unbound,
    /// Dedicated storage, valid for the arena's lifetime.
    Owned(Arc<Blob>),
    /// Pooled storage, valid only inside the allocation's lifetime.
    Managed {
        manager: Arc<MemoryManager>,
        alloc: AllocationId,
    },
    /// A region of another tensor starting at `offsets`.
    Sub {
        parent: TensorHandle,
        offsets: SmallVec<[usize; 4]>,
    },
}

#[derive(Debug)]
struct Slot {
    name: String,
    desc: TensorDescriptor,
    backing: Backing,
}

/// Owner of every tensor slot of a graph session.
#[derive(Debug, Default)]
pub struct TensorArena {
    slots: Vec<Slot>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unbound tensor.
    pub fn add(&mut self, name: impl Into<String>, desc: TensorDescriptor) -> TensorHandle {
        let handle = TensorHandle(self.slots.len() as u32);
        self.slots.push(Slot {
            name: name.into(),
            desc,
            backing: Backing::Unbound,
        });
        handle
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, h: TensorHandle) -> Result<&Slot> {
        self.slots
            .get(h.index())
            .ok_or_else(|| KilnError::usage(format!("unknown tensor handle {}", h.0)))
    }

    fn slot_mut(&mut self, h: TensorHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(h.index())
            .ok_or_else(|| KilnError::usage(format!("unknown tensor handle {}", h.0)))
    }

    pub fn desc(&self, h: TensorHandle) -> Result<&TensorDescriptor> {
        Ok(&self.slot(h)?.desc)
    }

    pub fn name(&self, h: TensorHandle) -> Result<&str> {
        Ok(&self.slot(h)?.name)
    }

    pub fn backing(&self, h: TensorHandle) -> Result<&Backing> {
        Ok(&self.slot(h)?.backing)
    }

    /// Replace a tensor's descriptor, growing its storage if needed.
    ///
    /// Owned tensors get a fresh zeroed blob when they outgrow the old one;
    /// pooled tensors are resized through their manager.
    pub fn set_desc(&mut self, h: TensorHandle, desc: TensorDescriptor) -> Result<()> {
        let slot = self.slot_mut(h)?;
        let bytes = desc.total_bytes();
        if let Backing::Managed { manager, alloc } = &slot.backing {
            manager.resize(*alloc, bytes)?;
        }
        if matches!(&slot.backing, Backing::Owned(blob) if blob.len() < bytes) {
            slot.backing = Backing::Owned(Arc::new(Blob::new(bytes, desc.target)));
        }
        slot.desc = desc;
        Ok(())
    }

    /// Give the tensor dedicated, zero-initialized storage.
    pub fn bind_owned(&mut self, h: TensorHandle) -> Result<()> {
        let slot = self.slot_mut(h)?;
        let blob = Blob::new(slot.desc.total_bytes(), slot.desc.target);
        slot.backing = Backing::Owned(Arc::new(blob));
        Ok(())
    }

    /// Back the tensor with a pooled allocation.
    pub fn bind_managed(&mut self, h: TensorHandle, manager: Arc<MemoryManager>, alloc: AllocationId) -> Result<()> {
        self.slot_mut(h)?.backing = Backing::Managed { manager, alloc };
        Ok(())
    }

    /// Make the tensor a region of `parent` starting at `offsets`.
    pub fn bind_sub(&mut self, h: TensorHandle, parent: TensorHandle, offsets: &[usize]) -> Result<()> {
        self.slot(parent)?;
        if parent == h {
            return Err(KilnError::structural("a tensor cannot be a sub-tensor of itself"));
        }
        self.slot_mut(h)?.backing = Backing::Sub {
            parent,
            offsets: SmallVec::from_slice(offsets),
        };
        Ok(())
    }

    pub fn is_bound(&self, h: TensorHandle) -> bool {
        self.slot(h).is_ok_and(|s| !matches!(s.backing, Backing::Unbound))
    }

    /// Lifetime of a pooled tensor (or of the pooled tensor it is a region of).
    pub fn lifetime(&self, h: TensorHandle) -> Result<Option<Interval>> {
        match &self.slot(h)?.backing {
            Backing::Managed { manager, alloc } => Ok(manager.lifetime(*alloc)),
            Backing::Sub { parent, .. } => self.lifetime(*parent),
            _ => Ok(None),
        }
    }

    /// Resolve a tensor to a view, without a lifetime check.
    ///
    /// Meant for host-side access to owned tensors (accessors, tests).
    pub fn view(&self, h: TensorHandle) -> Result<TensorView> {
        let slot = self.slot(h)?;
        match &slot.backing {
            Backing::Unbound => Err(KilnError::usage(format!(
                "tensor {} ({}) has no storage",
                h.0, slot.name
            ))),
            Backing::Owned(blob) => TensorView::new(Arc::clone(blob), 0, slot.desc.clone()),
            Backing::Managed { manager, alloc } => {
                let region = manager.region(*alloc)?;
                TensorView::new(region.blob, region.offset, slot.desc.clone())
            }
            Backing::Sub { parent, offsets } => self.view(*parent)?.sub_view(offsets, slot.desc.clone()),
        }
    }

    /// Resolve a tensor for use by the task at index `step`.
    ///
    /// Pooled storage is shared with other tensors outside its lifetime, so
    /// resolving it at any other step is a usage error.
    pub fn view_at(&self, h: TensorHandle, step: usize) -> Result<TensorView> {
        if let Some(lifetime) = self.lifetime(h)? {
            if !lifetime.contains(step) {
                let name = &self.slot(h)?.name;
                error!(tensor = %name, step, ?lifetime, "pooled tensor used outside its lifetime");
                return Err(KilnError::usage(format!(
                    "tensor {name} accessed at step {step} outside its lifetime {lifetime:?}"
                )));
            }
        }
        self.view(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryAffinity;
    use kiln_core::{DataType, Target};

    fn f32_desc(shape: &[usize]) -> TensorDescriptor {
        TensorDescriptor::new(shape, DataType::F32)
    }

    #[test]
    fn test_owned() {
        let mut arena = TensorArena::new();
        let h = arena.add("x", f32_desc(&[2, 2]));
        assert!(!arena.is_bound(h));
        assert!(arena.view(h).unwrap_err().is_usage());

        arena.bind_owned(h).unwrap();
        arena.view(h).unwrap().copy_from_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        // Owned tensors have no lifetime restriction.
        assert_eq!(arena.view_at(h, 99).unwrap().load(&[1, 1]), 4.0);
    }

    #[test]
    fn test_managed_lifetime_guard() {
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let mut arena = TensorArena::new();
        let h = arena.add("act", f32_desc(&[4]));
        let alloc = mm.request("g", "act", 16, Interval::new(1, 3)).unwrap();
        arena.bind_managed(h, Arc::clone(&mm), alloc).unwrap();
        mm.finalize().unwrap();

        assert!(arena.view_at(h, 1).is_ok());
        assert!(arena.view_at(h, 2).is_ok());
        assert!(arena.view_at(h, 0).unwrap_err().is_usage());
        assert!(arena.view_at(h, 3).unwrap_err().is_usage());
    }

    #[test]
    fn test_sub_tensor() {
        let mut arena = TensorArena::new();
        let parent = arena.add("cat", f32_desc(&[1, 1, 2, 4]));
        arena.bind_owned(parent).unwrap();
        let right = arena.add("cat.1", f32_desc(&[1, 1, 2, 2]));
        arena.bind_sub(right, parent, &[0, 0, 0, 2]).unwrap();

        arena.view(right).unwrap().fill(5.0);
        assert_eq!(
            arena.view(parent).unwrap().to_vec_f32(),
            vec![0.0, 0.0, 5.0, 5.0, 0.0, 0.0, 5.0, 5.0]
        );
        assert!(arena.bind_sub(right, right, &[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_set_desc_grows_owned() {
        let mut arena = TensorArena::new();
        let h = arena.add("x", f32_desc(&[2]));
        arena.bind_owned(h).unwrap();
        arena.set_desc(h, f32_desc(&[8])).unwrap();
        assert_eq!(arena.view(h).unwrap().numel(), 8);
    }

    #[test]
    fn test_set_desc_resizes_managed() {
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let mut arena = TensorArena::new();
        let h = arena.add("x", f32_desc(&[2]));
        let alloc = mm.request("g", "x", 8, Interval::at(0)).unwrap();
        arena.bind_managed(h, Arc::clone(&mm), alloc).unwrap();
        mm.finalize().unwrap();

        arena.set_desc(h, f32_desc(&[16])).unwrap();
        assert_eq!(mm.size(alloc), Some(64));
        assert_eq!(arena.view_at(h, 0).unwrap().numel(), 16);
    }

    #[test]
    fn test_unknown_handle() {
        let arena = TensorArena::new();
        assert!(arena.desc(TensorHandle(3)).unwrap_err().is_usage());
    }
}
