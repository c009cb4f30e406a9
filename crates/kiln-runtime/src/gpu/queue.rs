//! In-order command queue served by a dedicated device thread.
//!
//! The device is host-emulated: a kernel's window is cut into work-groups of
//! the local work size and the groups are executed one after another on the
//! device thread. Enqueue never blocks on execution; `sync` waits for the
//! queue to drain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use kiln_core::{Dimension, KilnError, Result, Window};

use crate::kernel::{ExecutionContext, Kernel, TensorPack, ThreadInfo};

/// Local work size, `[x, y, z]`.
pub type WorkSize = [usize; 3];

struct Command {
    kernel: Arc<dyn Kernel>,
    pack: TensorPack,
    lws: WorkSize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Command>,
    busy: bool,
    shutdown: bool,
    error: Option<KilnError>,
    executed: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

pub struct CommandQueue {
    shared: Arc<Shared>,
    device: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CommandQueue")
            .field("pending", &state.pending.len())
            .field("busy", &state.busy)
            .field("executed", &state.executed)
            .finish()
    }
}

impl CommandQueue {
    /// Start the device thread.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let device_shared = Arc::clone(&shared);
        let device = std::thread::Builder::new()
            .name("kiln-gpu-queue".to_string())
            .spawn(move || device_loop(&device_shared))?;
        Ok(Self {
            shared,
            device: Some(device),
        })
    }

    /// Append a kernel launch. Returns immediately.
    pub fn enqueue(&self, kernel: Arc<dyn Kernel>, pack: TensorPack, lws: WorkSize) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(KilnError::usage("enqueue on a shut down command queue"));
        }
        trace!(kernel = kernel.name(), ?lws, pending = state.pending.len(), "enqueue");
        state.pending.push_back(Command { kernel, pack, lws });
        self.shared.work.notify_one();
        Ok(())
    }

    /// Block until every enqueued launch has finished.
    ///
    /// Returns the first error raised by a launch since the previous sync.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() || state.busy {
            self.shared.idle.wait(&mut state);
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one launch in isolation and measure it, draining the queue first.
    pub fn run_timed(&self, kernel: Arc<dyn Kernel>, pack: TensorPack, lws: WorkSize) -> Result<Duration> {
        self.sync()?;
        let start = Instant::now();
        self.enqueue(kernel, pack, lws)?;
        self.sync()?;
        Ok(start.elapsed())
    }

    /// Launches completed so far.
    pub fn executed(&self) -> u64 {
        self.shared.state.lock().executed
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && !state.busy
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(device) = self.device.take() {
            let _ = device.join();
        }
    }
}

fn device_loop(shared: &Shared) {
    loop {
        let command = {
            let mut state = shared.state.lock();
            loop {
                if let Some(cmd) = state.pending.pop_front() {
                    state.busy = true;
                    break cmd;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        let result = execute(&command);

        let mut state = shared.state.lock();
        state.busy = false;
        state.executed += 1;
        if let Err(e) = result {
            error!(kernel = command.kernel.name(), error = %e, "kernel launch failed");
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        if state.pending.is_empty() {
            shared.idle.notify_all();
        }
    }
}

fn execute(command: &Command) -> Result<()> {
    let window = *command.kernel.window();
    window.validate()?;
    let ctx = ExecutionContext {
        pack: &command.pack,
        thread: ThreadInfo::single(),
    };
    for group in work_groups(&window, command.lws) {
        command.kernel.run(&group, &ctx)?;
    }
    Ok(())
}

/// Global work size of a window: iterations of its last three dimensions,
/// `[x, y, z]` with x the innermost.
pub fn global_work_size(window: &Window) -> WorkSize {
    let rank = window.rank();
    let mut gws = [1; 3];
    for (axis, size) in gws.iter_mut().enumerate().take(rank) {
        *size = window.num_iterations(rank - 1 - axis);
    }
    gws
}

/// Cut `window` into work-groups of `lws` iterations along its last three
/// dimensions. Earlier dimensions stay whole inside every group.
pub fn work_groups(window: &Window, lws: WorkSize) -> Vec<Window> {
    let rank = window.rank();
    let mut groups = vec![*window];
    for (axis, &local) in lws.iter().enumerate().take(rank) {
        let d = rank - 1 - axis;
        let dim = window.dim(d);
        let local = local.max(1);
        let count = dim.num_iterations().div_ceil(local);
        groups = groups
            .into_iter()
            .flat_map(|w| {
                (0..count).map(move |g| {
                    let start = dim.start + g * local * dim.step;
                    let end = (start + local * dim.step).min(dim.end);
                    let mut out = w;
                    out.set(d, Dimension::new(start, end, dim.step));
                    out
                })
            })
            .collect();
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(extents: &[usize]) -> Window {
        let mut w = Window::new(extents.len());
        for (d, &e) in extents.iter().enumerate() {
            w.set(d, Dimension::new(0, e, 1));
        }
        w
    }

    struct Counting {
        window: Window,
        points: Mutex<usize>,
        groups: Mutex<usize>,
        fail: bool,
    }

    impl Kernel for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn window(&self) -> &Window {
            &self.window
        }
        fn run(&self, window: &Window, _: &ExecutionContext<'_>) -> Result<()> {
            if self.fail {
                return Err(KilnError::resource("device fault"));
            }
            *self.points.lock() += window.total_iterations();
            *self.groups.lock() += 1;
            Ok(())
        }
    }

    fn counting(extents: &[usize], fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            window: window(extents),
            points: Mutex::new(0),
            groups: Mutex::new(0),
            fail,
        })
    }

    #[test]
    fn test_global_work_size() {
        assert_eq!(global_work_size(&window(&[2, 3, 4, 5])), [5, 4, 3]);
        assert_eq!(global_work_size(&window(&[7])), [7, 1, 1]);
    }

    #[test]
    fn test_work_groups_cover_window() {
        let w = window(&[2, 5, 6]);
        let groups = work_groups(&w, [4, 2, 1]);
        // x: 6 -> 2 groups, y: 5 -> 3 groups, z: 2 -> 2 groups
        assert_eq!(groups.len(), 12);
        let total: usize = groups.iter().map(Window::total_iterations).sum();
        assert_eq!(total, w.total_iterations());
        assert!(groups.iter().all(|g| w.contains(g)));
    }

    #[test]
    fn test_enqueue_and_sync() {
        let queue = CommandQueue::new().unwrap();
        let k = counting(&[3, 8], false);
        for _ in 0..3 {
            queue.enqueue(k.clone(), TensorPack::new(), [4, 1, 1]).unwrap();
        }
        queue.sync().unwrap();
        assert!(queue.is_idle());
        assert_eq!(queue.executed(), 3);
        assert_eq!(*k.points.lock(), 3 * 24);
        assert_eq!(*k.groups.lock(), 3 * 6);
    }

    #[test]
    fn test_sync_reports_first_error_once() {
        let queue = CommandQueue::new().unwrap();
        queue.enqueue(counting(&[4], true), TensorPack::new(), [1, 1, 1]).unwrap();
        assert!(queue.sync().is_err());
        // The error is consumed by the sync that reported it.
        queue.sync().unwrap();
    }

    #[test]
    fn test_run_timed() {
        let queue = CommandQueue::new().unwrap();
        let k = counting(&[16], false);
        queue.run_timed(k.clone(), TensorPack::new(), [8, 1, 1]).unwrap();
        assert_eq!(*k.groups.lock(), 2);
    }
}
