//! Operator parameter structs shared by graph nodes and kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{KilnError, Result};

/// Width × height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size2D {
    pub width: usize,
    pub height: usize,
}

impl Size2D {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// How fractional output sizes are rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DimensionRounding {
    #[default]
    Floor,
    Ceil,
}

/// Strides and (possibly asymmetric) zero padding of a sliding-window operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PadStrideInfo {
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub round: DimensionRounding,
}

impl PadStrideInfo {
    /// Symmetric padding.
    pub fn new(stride_x: usize, stride_y: usize, pad_x: usize, pad_y: usize) -> Self {
        Self {
            stride_x,
            stride_y,
            pad_left: pad_x,
            pad_right: pad_x,
            pad_top: pad_y,
            pad_bottom: pad_y,
            round: DimensionRounding::Floor,
        }
    }

    pub fn with_asymmetric_padding(
        mut self,
        left: usize,
        right: usize,
        top: usize,
        bottom: usize,
    ) -> Self {
        self.pad_left = left;
        self.pad_right = right;
        self.pad_top = top;
        self.pad_bottom = bottom;
        self
    }

    pub fn with_rounding(mut self, round: DimensionRounding) -> Self {
        self.round = round;
        self
    }

    pub fn has_padding(&self) -> bool {
        self.pad_left + self.pad_right + self.pad_top + self.pad_bottom > 0
    }

    /// Output `(width, height)` of a `kernel`-sized window slid over `(width, height)`.
    pub fn scaled_dimensions(&self, width: usize, height: usize, kernel: Size2D) -> Result<(usize, usize)> {
        if self.stride_x == 0 || self.stride_y == 0 {
            return Err(KilnError::shape("stride must be non-zero"));
        }
        let padded_w = width + self.pad_left + self.pad_right;
        let padded_h = height + self.pad_top + self.pad_bottom;
        if padded_w < kernel.width || padded_h < kernel.height {
            return Err(KilnError::shape(format!(
                "kernel {}x{} larger than padded input {}x{}",
                kernel.width, kernel.height, padded_w, padded_h
            )));
        }
        let scale = |span: usize, stride: usize| match self.round {
            DimensionRounding::Floor => span / stride + 1,
            DimensionRounding::Ceil => span.div_ceil(stride) + 1,
        };
        Ok((
            scale(padded_w - kernel.width, self.stride_x),
            scale(padded_h - kernel.height, self.stride_y),
        ))
    }
}

impl Default for PadStrideInfo {
    fn default() -> Self {
        Self::new(1, 1, 0, 0)
    }
}

/// Implementation strategy of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConvolutionMethod {
    /// Let the heuristic decide.
    #[default]
    Default,
    Direct,
    Gemm,
    Winograd,
}

impl fmt::Display for ConvolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvolutionMethod::Default => write!(f, "default"),
            ConvolutionMethod::Direct => write!(f, "direct"),
            ConvolutionMethod::Gemm => write!(f, "gemm"),
            ConvolutionMethod::Winograd => write!(f, "winograd"),
        }
    }
}

/// Activation function applied elementwise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ActivationFunction {
    #[default]
    Identity,
    Relu,
    /// `min(a, max(0, x))`
    BoundedRelu,
    /// `min(a, max(b, x))`
    LuBoundedRelu,
    /// `x > 0 ? x : a * x`
    LeakyRelu,
    Logistic,
    /// `a * tanh(b * x)`
    Tanh,
    /// `ln(1 + e^x)`
    SoftRelu,
    Abs,
    Square,
    Sqrt,
    /// `a * x + b`
    Linear,
}

/// An activation function with its `a` / `b` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActivationInfo {
    pub function: ActivationFunction,
    pub a: f32,
    pub b: f32,
}

impl ActivationInfo {
    pub fn new(function: ActivationFunction) -> Self {
        Self { function, a: 0.0, b: 0.0 }
    }

    pub fn with_params(function: ActivationFunction, a: f32, b: f32) -> Self {
        Self { function, a, b }
    }

    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        let (a, b) = (self.a, self.b);
        match self.function {
            ActivationFunction::Identity => x,
            ActivationFunction::Relu => x.max(0.0),
            ActivationFunction::BoundedRelu => x.max(0.0).min(a),
            ActivationFunction::LuBoundedRelu => x.max(b).min(a),
            ActivationFunction::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    a * x
                }
            }
            ActivationFunction::Logistic => 1.0 / (1.0 + (-x).exp()),
            ActivationFunction::Tanh => a * (b * x).tanh(),
            ActivationFunction::SoftRelu => (1.0 + x.exp()).ln(),
            ActivationFunction::Abs => x.abs(),
            ActivationFunction::Square => x * x,
            ActivationFunction::Sqrt => x.sqrt(),
            ActivationFunction::Linear => a * x + b,
        }
    }
}

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolingType {
    #[default]
    Max,
    Average,
}

/// Pooling parameters. `global` pools the whole spatial extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolingInfo {
    pub pool_type: PoolingType,
    pub pool_size: Size2D,
    pub pad_stride: PadStrideInfo,
    /// Average pooling divides by the number of non-padding elements.
    pub exclude_padding: bool,
    pub global: bool,
}

impl PoolingInfo {
    pub fn new(pool_type: PoolingType, pool_size: usize, pad_stride: PadStrideInfo) -> Self {
        Self {
            pool_type,
            pool_size: Size2D::new(pool_size, pool_size),
            pad_stride,
            exclude_padding: true,
            global: false,
        }
    }

    pub fn global(pool_type: PoolingType) -> Self {
        Self {
            pool_type,
            pool_size: Size2D::default(),
            pad_stride: PadStrideInfo::default(),
            exclude_padding: true,
            global: true,
        }
    }
}

/// Cross-map local response normalization:
/// `out = in / (kappa + alpha / norm_size * sum(in^2))^beta`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationInfo {
    pub norm_size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub kappa: f32,
}

impl NormalizationInfo {
    pub fn cross_map(norm_size: usize, alpha: f32, beta: f32) -> Self {
        Self {
            norm_size,
            alpha,
            beta,
            kappa: 1.0,
        }
    }
}

/// Binary elementwise operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseOperation {
    Add,
    Sub,
    Mul,
    Max,
    Min,
    SquaredDiff,
}

impl EltwiseOperation {
    #[inline]
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            EltwiseOperation::Add => a + b,
            EltwiseOperation::Sub => a - b,
            EltwiseOperation::Mul => a * b,
            EltwiseOperation::Max => a.max(b),
            EltwiseOperation::Min => a.min(b),
            EltwiseOperation::SquaredDiff => (a - b) * (a - b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_dimensions() {
        let info = PadStrideInfo::new(1, 1, 0, 0);
        assert_eq!(info.scaled_dimensions(28, 28, Size2D::new(5, 5)).unwrap(), (24, 24));

        let pool = PadStrideInfo::new(2, 2, 0, 0);
        assert_eq!(pool.scaled_dimensions(24, 24, Size2D::new(2, 2)).unwrap(), (12, 12));

        let same = PadStrideInfo::new(1, 1, 1, 1);
        assert_eq!(same.scaled_dimensions(7, 5, Size2D::new(3, 3)).unwrap(), (7, 5));
    }

    #[test]
    fn test_scaled_dimensions_rounding() {
        let floor = PadStrideInfo::new(2, 2, 0, 0);
        assert_eq!(floor.scaled_dimensions(7, 7, Size2D::new(2, 2)).unwrap(), (3, 3));
        let ceil = floor.with_rounding(DimensionRounding::Ceil);
        assert_eq!(ceil.scaled_dimensions(7, 7, Size2D::new(2, 2)).unwrap(), (4, 4));
    }

    #[test]
    fn test_scaled_dimensions_errors() {
        let info = PadStrideInfo::new(1, 1, 0, 0);
        assert!(info.scaled_dimensions(2, 2, Size2D::new(3, 3)).unwrap_err().is_shape());
        let zero = PadStrideInfo::new(0, 1, 0, 0);
        assert!(zero.scaled_dimensions(8, 8, Size2D::new(3, 3)).is_err());
    }

    #[test]
    fn test_activation_apply() {
        assert_eq!(ActivationInfo::new(ActivationFunction::Relu).apply(-2.0), 0.0);
        let brelu = ActivationInfo::with_params(ActivationFunction::BoundedRelu, 6.0, 0.0);
        assert_eq!(brelu.apply(9.0), 6.0);
        let leaky = ActivationInfo::with_params(ActivationFunction::LeakyRelu, 0.1, 0.0);
        assert!((leaky.apply(-2.0) + 0.2).abs() < 1e-6);
        let logistic = ActivationInfo::new(ActivationFunction::Logistic);
        assert!((logistic.apply(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_eltwise_apply() {
        assert_eq!(EltwiseOperation::Add.apply(1.0, 2.0), 3.0);
        assert_eq!(EltwiseOperation::SquaredDiff.apply(1.0, 4.0), 9.0);
        assert_eq!(EltwiseOperation::Min.apply(1.0, 4.0), 1.0);
    }
}
