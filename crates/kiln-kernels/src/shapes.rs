//! Output descriptors of every operator.
//!
//! These are the shape-propagation rules: pure functions of input
//! descriptors and parameters that fail with a shape error on bad input.

use kiln_core::{
    BorderSize, DataLayoutDimension, KilnError, PadStrideInfo, PoolingInfo, Result, Size2D, TensorDescriptor,
};

/// Rank-4 descriptor in `like`'s layout with logical extents `(n, c, h, w)`.
pub fn with_nchw(like: &TensorDescriptor, n: usize, c: usize, h: usize, w: usize) -> TensorDescriptor {
    like.with_shape(like.layout.coords(n, c, h, w))
}

/// Convolution weights share the input layout: N = output channels,
/// C = input channels, H / W = kernel size.
pub fn convolution_output(
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
    info: &PadStrideInfo,
) -> Result<TensorDescriptor> {
    input.require_f32("convolution input")?;
    weights.require_f32("convolution weights")?;
    let (n, c, h, w) = input.nchw()?;
    let (ofm, ifm, kh, kw) = weights.nchw()?;
    if ifm != c {
        return Err(KilnError::shape(format!(
            "convolution weights expect {ifm} input channels, input {} has {c}",
            input.shape
        )));
    }
    check_bias(bias, ofm)?;
    let (ow, oh) = info.scaled_dimensions(w, h, Size2D::new(kw, kh))?;
    Ok(with_nchw(input, n, ofm, oh, ow))
}

/// Depthwise weights: N = 1, C = input channels × multiplier.
pub fn depthwise_output(
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
    info: &PadStrideInfo,
    multiplier: usize,
) -> Result<TensorDescriptor> {
    input.require_f32("depthwise input")?;
    let (n, c, h, w) = input.nchw()?;
    let (wn, wc, kh, kw) = weights.nchw()?;
    if multiplier == 0 || wn != 1 || wc != c * multiplier {
        return Err(KilnError::shape(format!(
            "depthwise weights {} do not match {c} channels with multiplier {multiplier}",
            weights.shape
        )));
    }
    check_bias(bias, wc)?;
    let (ow, oh) = info.scaled_dimensions(w, h, Size2D::new(kw, kh))?;
    Ok(with_nchw(input, n, wc, oh, ow))
}

fn check_bias(bias: Option<&TensorDescriptor>, channels: usize) -> Result<()> {
    if let Some(b) = bias {
        if b.shape.dims() != [channels] {
            return Err(KilnError::shape(format!(
                "bias shape {} does not match {channels} output channels",
                b.shape
            )));
        }
    }
    Ok(())
}

pub fn pooling_output(input: &TensorDescriptor, info: &PoolingInfo) -> Result<TensorDescriptor> {
    input.require_f32("pooling input")?;
    let (n, c, h, w) = input.nchw()?;
    if info.global {
        return Ok(with_nchw(input, n, c, 1, 1));
    }
    let (ow, oh) = info.pad_stride.scaled_dimensions(w, h, info.pool_size)?;
    Ok(with_nchw(input, n, c, oh, ow))
}

/// Input `[batch, ...]` flattened to `[batch, K]` times weights `[K, outputs]`.
pub fn fully_connected_output(
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
) -> Result<TensorDescriptor> {
    input.require_f32("fully connected input")?;
    let (batch, k) = flat_rows(input)?;
    let wd = weights.shape.dims();
    if wd.len() != 2 || wd[0] != k {
        return Err(KilnError::shape(format!(
            "fully connected weights {} do not match {k} inputs",
            weights.shape
        )));
    }
    check_bias(bias, wd[1])?;
    Ok(input.with_shape([batch, wd[1]]))
}

/// `(batch, features)` of a tensor viewed as a matrix.
pub fn flat_rows(desc: &TensorDescriptor) -> Result<(usize, usize)> {
    let dims = desc.shape.dims();
    match dims.first() {
        Some(&batch) if batch > 0 => Ok((batch, desc.shape.numel() / batch)),
        _ => Err(KilnError::shape(format!("cannot flatten shape {}", desc.shape))),
    }
}

pub fn flatten_output(input: &TensorDescriptor) -> Result<TensorDescriptor> {
    let (batch, k) = flat_rows(input)?;
    Ok(input.with_shape([batch, k]))
}

pub fn reshape_output(input: &TensorDescriptor, target: &[isize]) -> Result<TensorDescriptor> {
    input
        .shape
        .resolve_reshape(target)
        .map(|shape| input.with_shape(shape))
        .ok_or_else(|| KilnError::shape(format!("cannot reshape {} to {target:?}", input.shape)))
}

pub fn elementwise_output(a: &TensorDescriptor, b: &TensorDescriptor) -> Result<TensorDescriptor> {
    a.require_f32("elementwise input")?;
    b.require_f32("elementwise input")?;
    if a.layout != b.layout && a.shape.ndim() == 4 && b.shape.ndim() == 4 {
        return Err(KilnError::shape(format!("layout mismatch {} vs {}", a.layout, b.layout)));
    }
    a.shape
        .broadcast_with(&b.shape)
        .map(|shape| a.with_shape(shape))
        .ok_or_else(|| KilnError::shape(format!("cannot broadcast {} with {}", a.shape, b.shape)))
}

/// Axis index of a logical dimension, for rank-4 tensors.
pub fn concat_axis(desc: &TensorDescriptor, axis: DataLayoutDimension) -> Result<usize> {
    if desc.shape.ndim() != 4 {
        return Err(KilnError::shape(format!(
            "concatenation along {axis:?} needs rank-4 inputs, got {}",
            desc.shape
        )));
    }
    Ok(desc.layout.index_of(axis))
}

pub fn concat_output(inputs: &[&TensorDescriptor], axis: DataLayoutDimension) -> Result<TensorDescriptor> {
    let first = inputs
        .first()
        .ok_or_else(|| KilnError::shape("concatenation of zero inputs"))?;
    first.require_f32("concatenation input")?;
    let a = concat_axis(first, axis)?;
    let mut dims = first.shape.dims().to_vec();
    for desc in &inputs[1..] {
        desc.require_f32("concatenation input")?;
        let other = desc.shape.dims();
        let compatible = desc.layout == first.layout
            && other.len() == dims.len()
            && other.iter().zip(&dims).enumerate().all(|(d, (x, y))| d == a || x == y);
        if !compatible {
            return Err(KilnError::shape(format!(
                "cannot concatenate {} with {} along {axis:?}",
                first.shape, desc.shape
            )));
        }
        dims[a] += other[a];
    }
    Ok(first.with_shape(dims))
}

/// Descriptor of `input` after zero-padding its spatial dimensions.
pub fn padded_descriptor(input: &TensorDescriptor, border: BorderSize) -> Result<TensorDescriptor> {
    let (n, c, h, w) = input.nchw()?;
    Ok(with_nchw(
        input,
        n,
        c,
        h + border.top + border.bottom,
        w + border.left + border.right,
    ))
}

/// Require two descriptors to have identical shapes.
pub fn require_same_shape(a: &TensorDescriptor, b: &TensorDescriptor, what: &str) -> Result<()> {
    if a.shape != b.shape {
        return Err(KilnError::shape(format!(
            "{what}: shape {} does not match {}",
            a.shape, b.shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{DataLayout, DataType, PoolingType};

    fn nhwc(shape: [usize; 4]) -> TensorDescriptor {
        TensorDescriptor::new(shape, DataType::F32)
    }

    #[test]
    fn test_lenet_shapes() {
        let input = nhwc([1, 28, 28, 1]);
        let weights = nhwc([20, 5, 5, 1]);
        let bias = TensorDescriptor::new([20], DataType::F32);
        let conv = convolution_output(&input, &weights, Some(&bias), &PadStrideInfo::new(1, 1, 0, 0)).unwrap();
        assert_eq!(conv.shape.dims(), &[1, 24, 24, 20]);

        let pool = PoolingInfo::new(PoolingType::Max, 2, PadStrideInfo::new(2, 2, 0, 0));
        assert_eq!(pooling_output(&conv, &pool).unwrap().shape.dims(), &[1, 12, 12, 20]);
    }

    #[test]
    fn test_nchw_convolution() {
        let input = nhwc([1, 3, 8, 8]).with_layout(DataLayout::Nchw);
        let weights = nhwc([4, 3, 3, 3]).with_layout(DataLayout::Nchw);
        let out = convolution_output(&input, &weights, None, &PadStrideInfo::new(1, 1, 1, 1)).unwrap();
        assert_eq!(out.shape.dims(), &[1, 4, 8, 8]);
    }

    #[test]
    fn test_channel_mismatch() {
        let input = nhwc([1, 8, 8, 3]);
        let weights = nhwc([4, 3, 3, 2]);
        let err = convolution_output(&input, &weights, None, &PadStrideInfo::default()).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn test_bias_mismatch() {
        let input = nhwc([1, 8, 8, 3]);
        let weights = nhwc([4, 3, 3, 3]);
        let bias = TensorDescriptor::new([5], DataType::F32);
        assert!(convolution_output(&input, &weights, Some(&bias), &PadStrideInfo::default()).is_err());
    }

    #[test]
    fn test_fully_connected() {
        let input = nhwc([2, 4, 4, 8]);
        let weights = TensorDescriptor::new([128, 10], DataType::F32);
        assert_eq!(fully_connected_output(&input, &weights, None).unwrap().shape.dims(), &[2, 10]);
        let bad = TensorDescriptor::new([100, 10], DataType::F32);
        assert!(fully_connected_output(&input, &bad, None).is_err());
    }

    #[test]
    fn test_concat() {
        let a = nhwc([1, 4, 4, 3]);
        let b = nhwc([1, 4, 4, 5]);
        let out = concat_output(&[&a, &b], DataLayoutDimension::Channel).unwrap();
        assert_eq!(out.shape.dims(), &[1, 4, 4, 8]);
        assert!(concat_output(&[&a, &b], DataLayoutDimension::Width).is_err());
    }

    #[test]
    fn test_global_pooling_and_flatten() {
        let input = nhwc([1, 7, 7, 16]);
        let pooled = pooling_output(&input, &PoolingInfo::global(PoolingType::Average)).unwrap();
        assert_eq!(pooled.shape.dims(), &[1, 1, 1, 16]);
        assert_eq!(flatten_output(&pooled).unwrap().shape.dims(), &[1, 16]);
    }

    #[test]
    fn test_padded() {
        let input = nhwc([1, 5, 6, 2]);
        let padded = padded_descriptor(&input, BorderSize::new(1, 2, 3, 4)).unwrap();
        assert_eq!(padded.shape.dims(), &[1, 9, 12, 2]);
    }
}
