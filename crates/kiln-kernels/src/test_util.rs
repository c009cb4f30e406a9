use std::sync::Arc;

use kiln_core::{DataLayout, DataType, Target, TensorDescriptor};
use kiln_memory::{Blob, TensorView};
use kiln_runtime::{CpuScheduler, Hints, Kernel, Scheduler, TensorPack};

pub fn tensor(shape: &[usize], data: &[f32]) -> TensorView {
    layout_tensor(shape, DataLayout::Nhwc, data)
}

pub fn layout_tensor(shape: &[usize], layout: DataLayout, data: &[f32]) -> TensorView {
    let desc = TensorDescriptor::new(shape, DataType::F32).with_layout(layout);
    let view = TensorView::new(Arc::new(Blob::new(desc.total_bytes(), Target::Cpu)), 0, desc).unwrap();
    view.copy_from_f32(data).unwrap();
    view
}

pub fn zeros(shape: &[usize]) -> TensorView {
    tensor(shape, &vec![0.0; shape.iter().product()])
}

pub fn run_kernel(kernel: Arc<dyn Kernel>, pack: &TensorPack, threads: usize) {
    let sched = CpuScheduler::new(threads).unwrap();
    sched.schedule(&kernel, &Hints::default(), pack).unwrap();
}

pub fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() <= tol, "element {i}: got {g}, expected {e}");
    }
}
