//! Strided f32 views into backing blobs.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use kiln_core::{DataType, KilnError, Result, TensorDescriptor, TensorShape};

use crate::blob::Blob;

/// A typed window onto part of a [`Blob`].
///
/// Views are cheap to clone and carry their own strides, so a sub-tensor of a
/// larger tensor is just a view with the parent's strides and a shifted origin.
#[derive(Clone)]
pub struct TensorView {
    blob: Arc<Blob>,
    /// Element (not byte) offset of coordinate zero.
    origin: usize,
    desc: TensorDescriptor,
    strides: SmallVec<[usize; 4]>,
}

impl TensorView {
    /// A contiguous view of `desc` starting `byte_offset` bytes into `blob`.
    pub fn new(blob: Arc<Blob>, byte_offset: usize, desc: TensorDescriptor) -> Result<Self> {
        if byte_offset % 4 != 0 {
            return Err(KilnError::resource(format!("misaligned view offset {byte_offset}")));
        }
        let strides = desc.shape.contiguous_strides();
        Self::with_strides(blob, byte_offset / 4, desc, strides)
    }

    fn with_strides(
        blob: Arc<Blob>,
        origin: usize,
        desc: TensorDescriptor,
        strides: SmallVec<[usize; 4]>,
    ) -> Result<Self> {
        if desc.data_type != DataType::F32 {
            return Err(KilnError::shape(format!(
                "tensor views are f32 only, got {}",
                desc.data_type
            )));
        }
        let span = if desc.shape.numel() == 0 {
            0
        } else {
            desc.shape
                .dims()
                .iter()
                .zip(&strides)
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
                + 1
        };
        blob.check_range(origin, span)?;
        Ok(Self {
            blob,
            origin,
            desc,
            strides,
        })
    }

    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn shape(&self) -> &TensorShape {
        &self.desc.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.desc.shape.dims()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        self.desc.shape.numel()
    }

    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }

    /// Byte offset of coordinate zero inside the blob.
    pub fn byte_offset(&self) -> usize {
        self.origin * 4
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == self.desc.shape.contiguous_strides()
    }

    #[inline]
    fn index(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.strides.len());
        self.origin
            + coords
                .iter()
                .zip(&self.strides)
                .map(|(&c, &s)| c * s)
                .sum::<usize>()
    }

    #[inline]
    pub fn load(&self, coords: &[usize]) -> f32 {
        self.blob.load_f32(self.index(coords))
    }

    #[inline]
    pub fn store(&self, coords: &[usize], value: f32) {
        self.blob.store_f32(self.index(coords), value);
    }

    /// Blob index of row-major element `i`.
    #[inline]
    fn flat_index(&self, mut i: usize) -> usize {
        if self.is_contiguous() {
            return self.origin + i;
        }
        let dims = self.desc.shape.dims();
        let mut index = self.origin;
        for d in (0..dims.len()).rev() {
            index += (i % dims[d]) * self.strides[d];
            i /= dims[d];
        }
        index
    }

    /// Row-major element `i`.
    #[inline]
    pub fn load_flat(&self, i: usize) -> f32 {
        self.blob.load_f32(self.flat_index(i))
    }

    #[inline]
    pub fn store_flat(&self, i: usize, value: f32) {
        self.blob.store_f32(self.flat_index(i), value);
    }

    /// Copy the contents out in row-major order.
    pub fn to_vec_f32(&self) -> Vec<f32> {
        (0..self.numel()).map(|i| self.load_flat(i)).collect()
    }

    /// Overwrite the contents from row-major `data`.
    pub fn copy_from_f32(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.numel() {
            return Err(KilnError::shape(format!(
                "cannot copy {} values into tensor of shape {}",
                data.len(),
                self.shape()
            )));
        }
        for (i, &v) in data.iter().enumerate() {
            self.store_flat(i, v);
        }
        Ok(())
    }

    pub fn fill(&self, value: f32) {
        for i in 0..self.numel() {
            self.store_flat(i, value);
        }
    }

    /// A view of `desc.shape` elements starting at `offsets`, sharing this
    /// view's strides.
    pub fn sub_view(&self, offsets: &[usize], desc: TensorDescriptor) -> Result<TensorView> {
        let dims = self.dims();
        if offsets.len() != dims.len() || desc.shape.ndim() != dims.len() {
            return Err(KilnError::shape(format!(
                "sub-tensor {} at {:?} does not match parent rank {}",
                desc.shape,
                offsets,
                dims.len()
            )));
        }
        for (d, (&o, &e)) in offsets.iter().zip(desc.shape.dims()).enumerate() {
            if o + e > dims[d] {
                return Err(KilnError::shape(format!(
                    "sub-tensor {} at {:?} exceeds parent {}",
                    desc.shape,
                    offsets,
                    self.shape()
                )));
            }
        }
        let origin = self.index(offsets);
        Self::with_strides(Arc::clone(&self.blob), origin, desc, self.strides.clone())
    }

    /// The same elements under a new shape. Requires a contiguous view.
    pub fn reshaped(&self, shape: impl Into<TensorShape>) -> Result<TensorView> {
        let shape = shape.into();
        if shape.numel() != self.numel() || !self.is_contiguous() {
            return Err(KilnError::shape(format!(
                "cannot reshape {} view to {}",
                self.shape(),
                shape
            )));
        }
        let strides = shape.contiguous_strides();
        Self::with_strides(Arc::clone(&self.blob), self.origin, self.desc.with_shape(shape), strides)
    }

    /// Borrow a contiguous view as a slice.
    ///
    /// # Safety
    /// Nothing may write to the view while the slice is alive.
    pub unsafe fn as_slice(&self) -> Result<&[f32]> {
        self.require_contiguous()?;
        Ok(self.blob.f32_slice(self.origin, self.numel()))
    }

    /// Mutably borrow elements `[start, start + len)` of a contiguous view.
    ///
    /// # Safety
    /// The caller must be the only reader or writer of that range while the
    /// slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, start: usize, len: usize) -> Result<&mut [f32]> {
        self.require_contiguous()?;
        if start + len > self.numel() {
            return Err(KilnError::resource(format!(
                "range [{start}, {start}+{len}) outside tensor of {} elements",
                self.numel()
            )));
        }
        Ok(self.blob.f32_slice_mut(self.origin + start, len))
    }

    fn require_contiguous(&self) -> Result<()> {
        if self.is_contiguous() {
            Ok(())
        } else {
            Err(KilnError::shape(format!(
                "expected a contiguous view, got strides {:?} for shape {}",
                self.strides,
                self.shape()
            )))
        }
    }
}

impl fmt::Debug for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("blob", &self.blob.id())
            .field("origin", &self.origin)
            .field("desc", &self.desc)
            .field("strides", &self.strides)
            .finish()
    }
}
