//! Tensor descriptors: everything shape propagation knows about a tensor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DataType, KilnError, Result, Target, TensorShape};

/// Memory layout tag of a rank-4 activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataLayout {
    /// `[N, C, H, W]`, channel-first
    Nchw,
    /// `[N, H, W, C]`, channel-last
    #[default]
    Nhwc,
}

/// Logical dimension of a rank-4 tensor, independent of layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLayoutDimension {
    Batch,
    Channel,
    Height,
    Width,
}

impl DataLayout {
    /// Index of `dim` in a rank-4 shape stored with this layout.
    pub fn index_of(&self, dim: DataLayoutDimension) -> usize {
        use DataLayoutDimension::*;
        match (self, dim) {
            (_, Batch) => 0,
            (DataLayout::Nchw, Channel) => 1,
            (DataLayout::Nchw, Height) => 2,
            (DataLayout::Nchw, Width) => 3,
            (DataLayout::Nhwc, Height) => 1,
            (DataLayout::Nhwc, Width) => 2,
            (DataLayout::Nhwc, Channel) => 3,
        }
    }

    /// Build rank-4 coordinates in this layout from logical `(n, c, h, w)`.
    #[inline]
    pub fn coords(&self, n: usize, c: usize, h: usize, w: usize) -> [usize; 4] {
        match self {
            DataLayout::Nchw => [n, c, h, w],
            DataLayout::Nhwc => [n, h, w, c],
        }
    }

    /// Split rank-4 coordinates in this layout into logical `(n, c, h, w)`.
    #[inline]
    pub fn split(&self, coords: &[usize]) -> (usize, usize, usize, usize) {
        match self {
            DataLayout::Nchw => (coords[0], coords[1], coords[2], coords[3]),
            DataLayout::Nhwc => (coords[0], coords[3], coords[1], coords[2]),
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLayout::Nchw => write!(f, "NCHW"),
            DataLayout::Nhwc => write!(f, "NHWC"),
        }
    }
}

/// Asymmetric quantization parameters: `real = scale * (q - offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub scale: f32,
    pub offset: i32,
}

impl QuantizationInfo {
    pub fn new(scale: f32, offset: i32) -> Self {
        Self { scale, offset }
    }

    pub fn quantize(&self, value: f32) -> u8 {
        let q = (value / self.scale).round() as i32 + self.offset;
        q.clamp(0, 255) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        (q as i32 - self.offset) as f32 * self.scale
    }
}

impl Default for QuantizationInfo {
    fn default() -> Self {
        Self { scale: 1.0, offset: 0 }
    }
}

/// Shape, element type, quantization, layout and target of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub shape: TensorShape,
    pub data_type: DataType,
    pub quant_info: QuantizationInfo,
    pub layout: DataLayout,
    pub target: Target,
}

impl TensorDescriptor {
    /// F32, NHWC, CPU descriptor for `shape`.
    pub fn new(shape: impl Into<TensorShape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quant_info: QuantizationInfo::default(),
            layout: DataLayout::default(),
            target: Target::default(),
        }
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_quant_info(mut self, quant_info: QuantizationInfo) -> Self {
        self.quant_info = quant_info;
        self
    }

    pub fn with_shape(&self, shape: impl Into<TensorShape>) -> Self {
        Self {
            shape: shape.into(),
            ..self.clone()
        }
    }

    /// Total bytes occupied by a contiguous tensor with this descriptor.
    pub fn total_bytes(&self) -> usize {
        self.data_type.storage_bytes(self.shape.numel())
    }

    /// Size of a logical dimension. Requires a rank-4 shape.
    pub fn dimension(&self, dim: DataLayoutDimension) -> Result<usize> {
        if self.shape.ndim() != 4 {
            return Err(KilnError::shape(format!(
                "expected a rank-4 tensor for {:?}, got shape {}",
                dim, self.shape
            )));
        }
        Ok(self.shape.dims()[self.layout.index_of(dim)])
    }

    /// `(n, c, h, w)` of a rank-4 descriptor.
    pub fn nchw(&self) -> Result<(usize, usize, usize, usize)> {
        use DataLayoutDimension::*;
        Ok((
            self.dimension(Batch)?,
            self.dimension(Channel)?,
            self.dimension(Height)?,
            self.dimension(Width)?,
        ))
    }

    /// Fail unless the element type is one the reference kernels compute on.
    pub fn require_f32(&self, what: &str) -> Result<()> {
        if self.data_type != DataType::F32 {
            return Err(KilnError::shape(format!(
                "{what}: unsupported data type {}, expected f32",
                self.data_type
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} @{}", self.shape, self.data_type, self.layout, self.target)
    }
}
