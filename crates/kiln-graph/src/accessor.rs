//! Accessors: callbacks that fill or drain tensor contents.
//!
//! Input accessors run before every invocation, output accessors after, and
//! const accessors once after storage is bound. Returning `false` reports
//! that the accessor could not supply (or take) the data.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_memory::TensorView;

pub trait Accessor: Send {
    fn access(&mut self, tensor: &TensorView) -> bool;
}

impl<F> Accessor for F
where
    F: FnMut(&TensorView) -> bool + Send,
{
    fn access(&mut self, tensor: &TensorView) -> bool {
        self(tensor)
    }
}

/// Fills every element with one value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantAccessor {
    pub value: f32,
}

impl ConstantAccessor {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Accessor for ConstantAccessor {
    fn access(&mut self, tensor: &TensorView) -> bool {
        tensor.fill(self.value);
        true
    }
}

/// Copies a fixed buffer in, row-major. Fails if the element count differs.
#[derive(Debug, Clone)]
pub struct VecAccessor {
    data: Vec<f32>,
}

impl VecAccessor {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }
}

impl Accessor for VecAccessor {
    fn access(&mut self, tensor: &TensorView) -> bool {
        tensor.copy_from_f32(&self.data).is_ok()
    }
}

/// Uniform random values in `[lo, hi)` from a seeded generator.
#[derive(Debug, Clone)]
pub struct RandomAccessor {
    rng: StdRng,
    lo: f32,
    hi: f32,
}

impl RandomAccessor {
    pub fn new(seed: u64, lo: f32, hi: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            lo,
            hi,
        }
    }
}

impl Accessor for RandomAccessor {
    fn access(&mut self, tensor: &TensorView) -> bool {
        if self.hi <= self.lo {
            return false;
        }
        let data: Vec<f32> = (0..tensor.numel()).map(|_| self.rng.gen_range(self.lo..self.hi)).collect();
        tensor.copy_from_f32(&data).is_ok()
    }
}

/// Drains the tensor into a shared buffer the caller keeps a handle to.
#[derive(Debug, Clone, Default)]
pub struct CaptureAccessor {
    data: Arc<Mutex<Vec<f32>>>,
}

impl CaptureAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the captured values.
    pub fn buffer(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.data)
    }

    /// Copy of the last captured tensor.
    pub fn values(&self) -> Vec<f32> {
        self.data.lock().clone()
    }
}

impl Accessor for CaptureAccessor {
    fn access(&mut self, tensor: &TensorView) -> bool {
        *self.data.lock() = tensor.to_vec_f32();
        true
    }
}
