//! # kiln-kernels
//!
//! Reference f32 kernels and the operator functions built from them.
//!
//! Provides:
//! - Output-shape rules for every operator
//! - Convolution by GEMM (im2col), direct, Winograd F(2x2,3x3) and depthwise
//! - Pooling, activation, elementwise, softmax, normalization and copies
//! - Tiled GEMM with an AVX2 inner loop
//! - `functions`: kernels wired into operators with pooled scratch tensors

pub mod shapes;
pub mod border;
pub mod gemm;
pub mod im2col;
pub mod direct;
pub mod winograd;
pub mod pooling;
pub mod activation;
pub mod elementwise;
pub mod softmax;
pub mod normalization;
pub mod copy;
pub mod functions;

#[cfg(test)]
mod test_util;

pub use functions::{
    create_convolution, select_convolution_method, validate_convolution, ActivationLayer, BatchNormParams,
    BatchNormalizationLayer, ConcatenateLayer, ConvolutionTensors, DepthwiseConvolutionLayer,
    DirectConvolutionLayer, ElementwiseLayer, FullyConnectedLayer, GemmConvolutionLayer, NormalizationLayer,
    PoolingLayer, ReshapeLayer, SoftmaxLayer, WinogradConvolutionLayer,
};
