//! # kiln-core
//!
//! Foundational types shared by every kiln crate.
//!
//! Provides:
//! - Element data types and quantization parameters
//! - Small-vector tensor shapes and memory layouts
//! - `TensorDescriptor`, the immutable result of shape propagation
//! - `Window`, the ≤4-D iteration domain used to split kernel work
//! - Operator parameter structs (padding/stride, activation, pooling, ...)
//! - The `KilnError` taxonomy

pub mod dtype;
pub mod target;
pub mod shape;
pub mod descriptor;
pub mod window;
pub mod info;
pub mod error;

pub use dtype::DataType;
pub use target::Target;
pub use shape::TensorShape;
pub use descriptor::{DataLayout, DataLayoutDimension, QuantizationInfo, TensorDescriptor};
pub use window::{BorderSize, Dimension, Window, MAX_WINDOW_DIMS};
pub use info::{
    ActivationFunction, ActivationInfo, ConvolutionMethod, DimensionRounding, EltwiseOperation,
    NormalizationInfo, PadStrideInfo, PoolingInfo, PoolingType, Size2D,
};
pub use error::KilnError;

pub type Result<T> = std::result::Result<T, KilnError>;
