//! Backing storage blocks.
//!
//! A `Blob` is a fixed-size, zero-initialized block of 32-bit words. Words are
//! atomics so that the CPU scheduler's worker threads may write disjoint
//! regions of one blob concurrently through shared references.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kiln_core::{KilnError, Result, Target};

/// Byte alignment of every allocation handed out by the memory manager.
pub const BLOB_ALIGN: usize = 64;

static NEXT_BLOB_ID: AtomicU64 = AtomicU64::new(1);

/// Round `n` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// One real backing allocation.
pub struct Blob {
    id: u64,
    target: Target,
    words: Box<[AtomicU32]>,
}

impl Blob {
    /// Allocate `bytes` (rounded up to whole words) of zeroed storage on `target`.
    pub fn new(bytes: usize, target: Target) -> Self {
        let nwords = bytes.div_ceil(4);
        let words = (0..nwords).map(|_| AtomicU32::new(0)).collect();
        Self {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            target,
            words,
        }
    }

    /// Process-unique identity, stable for the blob's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of f32 elements the blob can hold.
    pub fn capacity_f32(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.words[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store_f32(&self, index: usize, value: f32) {
        self.words[index].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Check that `[index, index + len)` lies inside the blob.
    pub fn check_range(&self, index: usize, len: usize) -> Result<()> {
        match index.checked_add(len) {
            Some(end) if end <= self.words.len() => Ok(()),
            _ => Err(KilnError::resource(format!(
                "range [{index}, {index}+{len}) outside blob {} of {} elements",
                self.id,
                self.words.len()
            ))),
        }
    }

    /// Borrow `len` elements starting at `index` as a plain slice.
    ///
    /// # Safety
    /// No other thread may write to the range while the slice is alive.
    #[inline]
    pub unsafe fn f32_slice(&self, index: usize, len: usize) -> &[f32] {
        let words = &self.words[index..index + len];
        std::slice::from_raw_parts(words.as_ptr() as *const f32, len)
    }

    /// Mutably borrow `len` elements starting at `index`.
    ///
    /// # Safety
    /// The caller must have exclusive access to the range while the slice is
    /// alive: no other slice or load/store may touch it concurrently.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn f32_slice_mut(&self, index: usize, len: usize) -> &mut [f32] {
        let words = &self.words[index..index + len];
        // AtomicU32 has the same layout as u32 and permits mutation through `&`.
        std::slice::from_raw_parts_mut(words.as_ptr() as *mut f32, len)
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("bytes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed() {
        let blob = Blob::new(40, Target::Cpu);
        assert_eq!(blob.len(), 40);
        assert_eq!(blob.capacity_f32(), 10);
        assert!((0..10).all(|i| blob.load_f32(i) == 0.0));
    }

    #[test]
    fn test_load_store() {
        let blob = Blob::new(16, Target::Gpu);
        blob.store_f32(2, -1.5);
        assert_eq!(blob.load_f32(2), -1.5);
        assert_eq!(blob.target(), Target::Gpu);
    }

    #[test]
    fn test_rounds_to_words() {
        assert_eq!(Blob::new(5, Target::Cpu).len(), 8);
        assert!(Blob::new(0, Target::Cpu).is_empty());
    }

    #[test]
    fn test_unique_ids() {
        let a = Blob::new(4, Target::Cpu);
        let b = Blob::new(4, Target::Cpu);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_slices() {
        let blob = Blob::new(32, Target::Cpu);
        unsafe {
            let s = blob.f32_slice_mut(2, 3);
            s.copy_from_slice(&[1.0, 2.0, 3.0]);
        }
        let s = unsafe { blob.f32_slice(0, 8) };
        assert_eq!(s, &[0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert!(blob.check_range(6, 2).is_ok());
        assert!(blob.check_range(7, 2).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, BLOB_ALIGN), 0);
        assert_eq!(align_up(1, BLOB_ALIGN), 64);
        assert_eq!(align_up(100, BLOB_ALIGN), 128);
        assert_eq!(align_up(128, BLOB_ALIGN), 128);
    }
}
