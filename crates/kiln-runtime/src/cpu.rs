//! Fork-join CPU scheduler over a fixed rayon pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use kiln_core::{KilnError, Result, Target, MAX_WINDOW_DIMS};

use crate::cpu_info::CpuInfo;
use crate::kernel::{ExecutionContext, Kernel, TensorPack, ThreadInfo};
use crate::scheduler::{Hints, Scheduler, SchedulingStrategy};

/// Splits each kernel's window along its split dimension and runs the
/// sub-windows on a fixed-size thread pool, returning after all complete.
pub struct CpuScheduler {
    pool: rayon::ThreadPool,
    num_threads: usize,
    strategy: SchedulingStrategy,
    cpu_info: &'static CpuInfo,
}

impl std::fmt::Debug for CpuScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuScheduler")
            .field("num_threads", &self.num_threads)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl CpuScheduler {
    /// A pool of `num_threads` workers; 0 means one per hardware thread.
    pub fn new(num_threads: usize) -> Result<Self> {
        let cpu_info = CpuInfo::detect();
        let num_threads = if num_threads == 0 { cpu_info.num_cpus } else { num_threads };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("kiln-cpu-{i}"))
            .build()
            .map_err(|e| KilnError::resource(format!("cannot start CPU pool: {e}")))?;
        debug!(num_threads, tier = cpu_info.best_tier(), "CPU scheduler started");
        Ok(Self {
            pool,
            num_threads,
            strategy: SchedulingStrategy::default(),
            cpu_info,
        })
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    pub fn cpu_info(&self) -> &'static CpuInfo {
        self.cpu_info
    }

    /// Number of sub-windows a window with `iterations` along the split
    /// dimension is cut into.
    pub fn num_windows(&self, strategy: SchedulingStrategy, iterations: usize) -> usize {
        let wanted = match strategy {
            SchedulingStrategy::Static => self.num_threads,
            SchedulingStrategy::Dynamic => self.num_threads * 3,
        };
        wanted.min(iterations).max(1)
    }
}

impl Scheduler for CpuScheduler {
    fn target(&self) -> Target {
        Target::Cpu
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn schedule(&self, kernel: &Arc<dyn Kernel>, hints: &Hints, pack: &TensorPack) -> Result<()> {
        let window = *kernel.window();
        window.validate()?;
        let split = hints.split_dimension.unwrap_or_else(|| kernel.split_dimension());
        if split >= MAX_WINDOW_DIMS {
            return Err(KilnError::usage(format!(
                "kernel {} split along dimension {split}",
                kernel.name()
            )));
        }
        let iterations = window.num_iterations(split);
        if window.total_iterations() == 0 {
            return Ok(());
        }

        if !kernel.is_parallelisable() || self.num_threads == 1 || iterations <= 1 {
            trace!(kernel = kernel.name(), ?window, "run on caller thread");
            let ctx = ExecutionContext {
                pack,
                thread: ThreadInfo {
                    thread_id: 0,
                    num_threads: 1,
                    cpu_info: self.cpu_info,
                },
            };
            return kernel.run(&window, &ctx);
        }

        let strategy = hints.strategy.unwrap_or(self.strategy);
        let num_windows = self.num_windows(strategy, iterations);
        let num_workers = self.num_threads.min(num_windows);
        trace!(
            kernel = kernel.name(),
            split,
            iterations,
            num_windows,
            num_workers,
            ?strategy,
            "schedule"
        );

        let feeder = AtomicUsize::new(num_workers);
        let first_error: Mutex<Option<KilnError>> = Mutex::new(None);
        let kernel: &dyn Kernel = kernel.as_ref();
        let cpu_info = self.cpu_info;

        self.pool.scope(|s| {
            for thread_id in 0..num_workers {
                let feeder = &feeder;
                let first_error = &first_error;
                let window = &window;
                s.spawn(move |_| {
                    let ctx = ExecutionContext {
                        pack,
                        thread: ThreadInfo {
                            thread_id,
                            num_threads: num_workers,
                            cpu_info,
                        },
                    };
                    // Each worker starts on its own sub-window, then (dynamic
                    // strategy only) keeps pulling from the feeder.
                    let mut next = thread_id;
                    while next < num_windows {
                        let sub = window.split_window(split, next, num_windows);
                        if let Err(e) = kernel.run(&sub, &ctx) {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            return;
                        }
                        next = match strategy {
                            SchedulingStrategy::Static => num_windows,
                            SchedulingStrategy::Dynamic => feeder.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                });
            }
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Dimension, Window};

    /// Records every sub-window it is asked to run.
    struct Recorder {
        window: Window,
        parallel: bool,
        seen: Mutex<Vec<Window>>,
    }

    impl Recorder {
        fn new(extent: usize, parallel: bool) -> Arc<Self> {
            let mut window = Window::new(1);
            window.set(0, Dimension::new(0, extent, 1));
            Arc::new(Self {
                window,
                parallel,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn extents(&self) -> Vec<(usize, usize)> {
            let mut v: Vec<_> = self.seen.lock().iter().map(|w| (w.dim(0).start, w.dim(0).end)).collect();
            v.sort();
            v
        }
    }

    impl Kernel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn window(&self) -> &Window {
            &self.window
        }
        fn is_parallelisable(&self) -> bool {
            self.parallel
        }
        fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
            assert!(ctx.thread.thread_id < ctx.thread.num_threads);
            self.seen.lock().push(*window);
            Ok(())
        }
    }

    #[test]
    fn test_static_split_17_over_4() {
        let sched = CpuScheduler::new(4).unwrap();
        let rec = Recorder::new(17, true);
        let kernel: Arc<dyn Kernel> = rec.clone();
        sched.schedule(&kernel, &Hints::split(0), &TensorPack::new()).unwrap();
        assert_eq!(rec.extents(), vec![(0, 5), (5, 9), (9, 13), (13, 17)]);
    }

    #[test]
    fn test_dynamic_covers_window() {
        let sched = CpuScheduler::new(2).unwrap().with_strategy(SchedulingStrategy::Dynamic);
        let rec = Recorder::new(10, true);
        let kernel: Arc<dyn Kernel> = rec.clone();
        sched.schedule(&kernel, &Hints::default(), &TensorPack::new()).unwrap();
        let extents = rec.extents();
        assert_eq!(extents.len(), 6);
        let mut cursor = 0;
        for (start, end) in extents {
            assert_eq!(start, cursor);
            cursor = end;
        }
        assert_eq!(cursor, 10);
    }

    #[test]
    fn test_non_parallelisable_runs_whole() {
        let sched = CpuScheduler::new(4).unwrap();
        let rec = Recorder::new(9, false);
        let kernel: Arc<dyn Kernel> = rec.clone();
        sched.schedule(&kernel, &Hints::default(), &TensorPack::new()).unwrap();
        assert_eq!(rec.extents(), vec![(0, 9)]);
    }

    #[test]
    fn test_fewer_iterations_than_threads() {
        let sched = CpuScheduler::new(8).unwrap();
        let rec = Recorder::new(3, true);
        let kernel: Arc<dyn Kernel> = rec.clone();
        sched.schedule(&kernel, &Hints::default(), &TensorPack::new()).unwrap();
        assert_eq!(rec.extents(), vec![(0, 1), (1, 2), (2, 3)]);
    }

    struct Failing(Window);

    impl Kernel for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn window(&self) -> &Window {
            &self.0
        }
        fn run(&self, window: &Window, _: &ExecutionContext<'_>) -> Result<()> {
            if window.dim(0).start == 0 {
                Err(KilnError::resource("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_error_propagates() {
        let sched = CpuScheduler::new(2).unwrap();
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, 8, 1));
        let kernel: Arc<dyn Kernel> = Arc::new(Failing(window));
        let err = sched.schedule(&kernel, &Hints::default(), &TensorPack::new()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
