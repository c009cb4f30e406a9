//! Binary elementwise operations with broadcasting.

use smallvec::SmallVec;

use kiln_core::{Dimension, EltwiseOperation, Result, TensorDescriptor, TensorShape, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::{elementwise_output, require_same_shape};

/// `Dst(0) = op(Src(0), Src(1))`, broadcasting size-1 dimensions aligned on
/// the innermost axis.
#[derive(Debug, Clone)]
pub struct ElementwiseKernel {
    op: EltwiseOperation,
    out_shape: TensorShape,
    a_shape: TensorShape,
    b_shape: TensorShape,
    window: Window,
}

/// Coordinates in an input of shape `input` for output coordinates `out`.
fn broadcast_coords(out: &[usize], input: &TensorShape) -> SmallVec<[usize; 6]> {
    let skip = out.len() - input.ndim();
    out[skip..]
        .iter()
        .zip(input.dims())
        .map(|(&c, &extent)| if extent == 1 { 0 } else { c })
        .collect()
}

impl ElementwiseKernel {
    pub fn validate(a: &TensorDescriptor, b: &TensorDescriptor, dst: &TensorDescriptor) -> Result<()> {
        let expected = elementwise_output(a, b)?;
        require_same_shape(dst, &expected, "elementwise")
    }

    pub fn configure(
        a: &TensorDescriptor,
        b: &TensorDescriptor,
        dst: &TensorDescriptor,
        op: EltwiseOperation,
    ) -> Result<Self> {
        Self::validate(a, b, dst)?;
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, dst.shape.numel(), 1));
        Ok(Self {
            op,
            out_shape: dst.shape.clone(),
            a_shape: a.shape.clone(),
            b_shape: b.shape.clone(),
            window,
        })
    }
}

impl Kernel for ElementwiseKernel {
    fn name(&self) -> &str {
        "elementwise"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn config_id(&self) -> String {
        format!("elementwise_{:?}_{}", self.op, self.out_shape.numel())
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let a = ctx.pack.src(0)?;
        let b = ctx.pack.src(1)?;
        let dst = ctx.pack.dst(0)?;
        let same = self.a_shape == self.out_shape && self.b_shape == self.out_shape;
        let dims = self.out_shape.dims();
        let mut coords: SmallVec<[usize; 6]> = SmallVec::from_elem(0, dims.len());

        for i in window.dim(0).iter() {
            let value = if same {
                self.op.apply(a.load_flat(i), b.load_flat(i))
            } else {
                let mut rem = i;
                for d in (0..dims.len()).rev() {
                    coords[d] = rem % dims[d];
                    rem /= dims[d];
                }
                let x = a.load(&broadcast_coords(&coords, &self.a_shape));
                let y = b.load(&broadcast_coords(&coords, &self.b_shape));
                self.op.apply(x, y)
            };
            dst.store_flat(i, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{run_kernel, tensor, zeros};
    use kiln_runtime::{TensorPack, TensorSlot};

    fn eltwise(op: EltwiseOperation, a: (&[usize], &[f32]), b: (&[usize], &[f32]), out: &[usize]) -> Vec<f32> {
        let a = tensor(a.0, a.1);
        let b = tensor(b.0, b.1);
        let dst = zeros(out);
        let k = ElementwiseKernel::configure(a.desc(), b.desc(), dst.desc(), op).unwrap();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), a)
            .with(TensorSlot::Src(1), b)
            .with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 3);
        dst.to_vec_f32()
    }

    #[test]
    fn test_add_same_shape() {
        let out = eltwise(
            EltwiseOperation::Add,
            (&[2, 2], &[1.0, 2.0, 3.0, 4.0]),
            (&[2, 2], &[10.0, 20.0, 30.0, 40.0]),
            &[2, 2],
        );
        assert_eq!(out, vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_broadcast_row_and_column() {
        // [2, 3] * [3]
        let out = eltwise(
            EltwiseOperation::Mul,
            (&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            (&[3], &[1.0, 0.0, -1.0]),
            &[2, 3],
        );
        assert_eq!(out, vec![1.0, 0.0, -3.0, 4.0, 0.0, -6.0]);

        // [2, 1] - [1, 3]
        let out = eltwise(
            EltwiseOperation::Sub,
            (&[2, 1], &[10.0, 20.0]),
            (&[1, 3], &[1.0, 2.0, 3.0]),
            &[2, 3],
        );
        assert_eq!(out, vec![9.0, 8.0, 7.0, 19.0, 18.0, 17.0]);
    }

    #[test]
    fn test_incompatible() {
        let a = zeros(&[2, 3]);
        let b = zeros(&[4]);
        let dst = zeros(&[2, 3]);
        assert!(ElementwiseKernel::validate(a.desc(), b.desc(), dst.desc()).unwrap_err().is_shape());
    }
}
