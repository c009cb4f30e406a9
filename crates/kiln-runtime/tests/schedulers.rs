//! Scheduler behavior seen from outside the crate.

use std::sync::Arc;

use parking_lot::Mutex;

use kiln_core::{DataType, Dimension, Result, Target, TensorDescriptor, Window};
use kiln_memory::{Blob, TensorView};
use kiln_runtime::{
    CpuScheduler, ExecutionContext, GpuScheduler, Hints, Kernel, Scheduler, SchedulingStrategy, TensorPack,
    TensorSlot, Tuner,
};

/// `dst[i] = src[i] * 2` over a 1-D window, recording sub-window extents.
struct Doubler {
    window: Window,
    extents: Mutex<Vec<usize>>,
}

impl Doubler {
    fn new(n: usize) -> Arc<Self> {
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, n, 1));
        Arc::new(Self {
            window,
            extents: Mutex::new(Vec::new()),
        })
    }
}

impl Kernel for Doubler {
    fn name(&self) -> &str {
        "doubler"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        for i in window.dim(0).iter() {
            dst.store(&[i], src.load(&[i]) * 2.0);
        }
        self.extents.lock().push(window.num_iterations(0));
        Ok(())
    }
}

fn tensor(n: usize, target: Target) -> TensorView {
    let desc = TensorDescriptor::new([n], DataType::F32).with_target(target);
    TensorView::new(Arc::new(Blob::new(n * 4, target)), 0, desc).unwrap()
}

fn pack(n: usize, target: Target) -> (TensorPack, TensorView) {
    let src = tensor(n, target);
    src.copy_from_f32(&(0..n).map(|i| i as f32).collect::<Vec<_>>()).unwrap();
    let dst = tensor(n, target);
    let pack = TensorPack::new().with(TensorSlot::Src(0), src).with(TensorSlot::Dst(0), dst.clone());
    (pack, dst)
}

#[test]
fn test_cpu_split_extents_17_over_4() {
    let sched = CpuScheduler::new(4).unwrap();
    let kernel = Doubler::new(17);
    let (pack, dst) = pack(17, Target::Cpu);
    let k: Arc<dyn Kernel> = kernel.clone();
    sched.schedule(&k, &Hints::split(0), &pack).unwrap();

    let mut extents = kernel.extents.lock().clone();
    extents.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(extents, vec![5, 4, 4, 4]);
    assert_eq!(dst.to_vec_f32(), (0..17).map(|i| i as f32 * 2.0).collect::<Vec<_>>());
}

#[test]
fn test_cpu_split_is_exact_for_all_thread_counts() {
    for threads in 1..=9 {
        let sched = CpuScheduler::new(threads)
            .unwrap()
            .with_strategy(if threads % 2 == 0 { SchedulingStrategy::Dynamic } else { SchedulingStrategy::Static });
        let kernel = Doubler::new(23);
        let (pack, dst) = pack(23, Target::Cpu);
        let k: Arc<dyn Kernel> = kernel.clone();
        sched.schedule(&k, &Hints::default(), &pack).unwrap();
        assert_eq!(kernel.extents.lock().iter().sum::<usize>(), 23, "threads {threads}");
        assert_eq!(dst.load(&[22]), 44.0);
    }
}

#[test]
fn test_gpu_async_then_sync() {
    let sched = GpuScheduler::new().unwrap();
    let kernel = Doubler::new(100);
    let (pack, dst) = pack(100, Target::Gpu);
    let k: Arc<dyn Kernel> = kernel.clone();
    sched.schedule(&k, &Hints::default(), &pack).unwrap();
    sched.sync().unwrap();
    assert_eq!(dst.load(&[99]), 198.0);
    // Default local size along x is 8.
    assert_eq!(kernel.extents.lock().len(), 13);
}

#[test]
fn test_tuner_reuses_cached_choice() {
    let tuner = Arc::new(Tuner::new());
    let sched = GpuScheduler::new().unwrap().with_tuner(Arc::clone(&tuner));
    let (pack, dst) = pack(64, Target::Gpu);

    let first: Arc<dyn Kernel> = Doubler::new(64);
    sched.schedule(&first, &Hints::default(), &pack).unwrap();
    sched.sync().unwrap();
    assert_eq!(tuner.tunings(), 1);
    assert_eq!(tuner.hits(), 0);
    let runs_after_first = tuner.candidate_runs();
    assert!(runs_after_first > 1);

    // A new kernel instance with the same signature hits the cache.
    let second: Arc<dyn Kernel> = Doubler::new(64);
    sched.schedule(&second, &Hints::default(), &pack).unwrap();
    sched.sync().unwrap();
    assert_eq!(tuner.tunings(), 1);
    assert_eq!(tuner.hits(), 1);
    assert_eq!(tuner.candidate_runs(), runs_after_first);
    assert_eq!(dst.load(&[63]), 126.0);

    // A different shape is a different signature.
    let (pack32, _) = self::pack(32, Target::Gpu);
    let third: Arc<dyn Kernel> = Doubler::new(32);
    sched.schedule(&third, &Hints::default(), &pack32).unwrap();
    sched.sync().unwrap();
    assert_eq!(tuner.tunings(), 2);
}

#[test]
fn test_tuner_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tuning.json");
    {
        let tuner = Arc::new(Tuner::new());
        let sched = GpuScheduler::new().unwrap().with_tuner(Arc::clone(&tuner));
        let (pack, _) = pack(40, Target::Gpu);
        let k: Arc<dyn Kernel> = Doubler::new(40);
        sched.schedule(&k, &Hints::default(), &pack).unwrap();
        sched.sync().unwrap();
        tuner.save(&path).unwrap();
    }

    let tuner = Arc::new(Tuner::load(&path).unwrap());
    let sched = GpuScheduler::new().unwrap().with_tuner(Arc::clone(&tuner));
    let (pack, _) = pack(40, Target::Gpu);
    let k: Arc<dyn Kernel> = Doubler::new(40);
    sched.schedule(&k, &Hints::default(), &pack).unwrap();
    sched.sync().unwrap();
    assert_eq!(tuner.tunings(), 0);
    assert_eq!(tuner.hits(), 1);
}
