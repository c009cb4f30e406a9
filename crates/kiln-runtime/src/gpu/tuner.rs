//! Local-work-size tuner with a persistent cache.
//!
//! The first launch of a kernel signature benchmarks every candidate local
//! work size on the device and records the fastest. Later launches with the
//! same signature reuse the cached choice.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use kiln_core::Result;

use crate::gpu::queue::{global_work_size, CommandQueue, WorkSize};
use crate::kernel::{Kernel, TensorPack, TensorSlot};

const MAX_LOCAL: WorkSize = [64, 16, 4];
const MAX_GROUP_ITEMS: usize = 256;

/// Largest power of two `<= n` (and at least 1).
fn floor_pow2(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Fixed local-size heuristic used when tuning is off.
pub fn default_lws(gws: WorkSize) -> WorkSize {
    [floor_pow2(gws[0].min(8)), floor_pow2(gws[1].min(4)), 1]
}

/// Power-of-two local sizes bounded by the global size and the group limit.
pub fn candidates(gws: WorkSize) -> Vec<WorkSize> {
    let axis = |i: usize| {
        let bound = gws[i].clamp(1, MAX_LOCAL[i]);
        std::iter::successors(Some(1usize), |&v| Some(v * 2)).take_while(move |&v| v <= bound)
    };
    let mut out = Vec::new();
    for z in axis(2) {
        for y in axis(1) {
            for x in axis(0) {
                if x * y * z <= MAX_GROUP_ITEMS {
                    out.push([x, y, z]);
                }
            }
        }
    }
    out
}

/// Cache key: the kernel's config id plus the shape of its primary source.
///
/// Kernels whose window is their output (pooling, border fills) read very
/// different amounts of data for the same window.
pub fn signature(kernel: &dyn Kernel, pack: &TensorPack) -> String {
    let mut id = kernel.config_id();
    if let Ok(src) = pack.get(TensorSlot::Src(0)) {
        id.push_str("_src");
        for (i, d) in src.dims().iter().enumerate() {
            let _ = write!(id, "{}{d}", if i == 0 { "" } else { "x" });
        }
    }
    id
}

/// Cache of tuned local work sizes keyed by kernel signature.
#[derive(Debug, Default)]
pub struct Tuner {
    cache: Mutex<HashMap<String, WorkSize>>,
    hits: AtomicU64,
    tunings: AtomicU64,
    candidate_runs: AtomicU64,
}

impl Tuner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache written by [`Tuner::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let entries: HashMap<String, WorkSize> = serde_json::from_str(&text)?;
        info!(path = %path.as_ref().display(), entries = entries.len(), "loaded tuner cache");
        Ok(Self {
            cache: Mutex::new(entries),
            ..Self::default()
        })
    }

    /// Load the cache if the file exists, else start empty.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Write the cache as JSON, entries sorted by signature.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let sorted: BTreeMap<String, WorkSize> = self.cache.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(&sorted)?)?;
        info!(path = %path.as_ref().display(), entries = sorted.len(), "saved tuner cache");
        Ok(())
    }

    pub fn get(&self, signature: &str) -> Option<WorkSize> {
        self.cache.lock().get(signature).copied()
    }

    pub fn insert(&self, signature: impl Into<String>, lws: WorkSize) {
        self.cache.lock().insert(signature.into(), lws);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Launches served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Signatures benchmarked.
    pub fn tunings(&self) -> u64 {
        self.tunings.load(Ordering::Relaxed)
    }

    /// Individual candidate launches made while benchmarking.
    pub fn candidate_runs(&self) -> u64 {
        self.candidate_runs.load(Ordering::Relaxed)
    }

    /// Local work size for `kernel`, benchmarking on `queue` on first sight.
    ///
    /// The cache lock is not held while benchmarking; two sessions tuning the
    /// same signature concurrently both benchmark and the last result wins.
    pub fn tune(&self, queue: &CommandQueue, kernel: &Arc<dyn Kernel>, pack: &TensorPack) -> Result<WorkSize> {
        let signature = signature(kernel.as_ref(), pack);
        if let Some(lws) = self.get(&signature) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%signature, ?lws, "tuner cache hit");
            return Ok(lws);
        }

        let gws = global_work_size(kernel.window());
        let mut best: Option<(Duration, WorkSize)> = None;
        for lws in candidates(gws) {
            let elapsed = queue.run_timed(Arc::clone(kernel), pack.clone(), lws)?;
            self.candidate_runs.fetch_add(1, Ordering::Relaxed);
            if best.map_or(true, |(t, _)| elapsed < t) {
                best = Some((elapsed, lws));
            }
        }
        let (elapsed, lws) = best.unwrap_or((Duration::ZERO, [1, 1, 1]));
        self.tunings.fetch_add(1, Ordering::Relaxed);
        info!(%signature, ?gws, ?lws, ?elapsed, "tuned kernel");
        self.insert(signature, lws);
        Ok(lws)
    }
}
