//! Value lifetimes and interval coloring.
//!
//! Every pooled allocation is live over a half-open range of execution-task
//! indices. Allocations whose ranges are disjoint may share backing storage;
//! `color_intervals` assigns each allocation to a reuse class so that members
//! of one class never overlap in time.

use std::fmt;

/// Half-open range `[start, end)` of execution-task indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end: end.max(start) }
    }

    /// The single step `[step, step + 1)`.
    pub fn at(step: usize) -> Self {
        Self { start: step, end: step + 1 }
    }

    /// Live for the whole run.
    pub fn forever() -> Self {
        Self { start: 0, end: usize::MAX }
    }

    pub fn contains(&self, step: usize) -> bool {
        self.start <= step && step < self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Result of coloring a set of `(interval, size)` requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coloring {
    /// Reuse class of each request, in request order.
    pub classes: Vec<usize>,
    /// Size of each class: the largest member.
    pub class_sizes: Vec<usize>,
}

impl Coloring {
    pub fn num_classes(&self) -> usize {
        self.class_sizes.len()
    }

    /// Sum of class sizes, i.e. the backing memory the coloring needs.
    pub fn total_size(&self) -> usize {
        self.class_sizes.iter().sum()
    }
}

/// Greedy first-fit coloring of an interval graph.
///
/// Requests are visited by interval start (ties: larger first, then request
/// order) and placed in the lowest-index class whose last member ended at or
/// before the request starts. Visiting in start order makes first-fit optimal,
/// so the class count equals the maximum number of simultaneously live requests.
pub fn color_intervals(requests: &[(Interval, usize)]) -> Coloring {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by(|&a, &b| {
        let (ia, sa) = requests[a];
        let (ib, sb) = requests[b];
        ia.start
            .cmp(&ib.start)
            .then(sb.cmp(&sa))
            .then(a.cmp(&b))
    });

    let mut classes = vec![0; requests.len()];
    let mut class_sizes: Vec<usize> = Vec::new();
    let mut class_ends: Vec<usize> = Vec::new();

    for idx in order {
        let (interval, size) = requests[idx];
        let class = match class_ends.iter().position(|&end| end <= interval.start) {
            Some(c) => c,
            None => {
                class_sizes.push(0);
                class_ends.push(0);
                class_sizes.len() - 1
            }
        };
        classes[idx] = class;
        class_sizes[class] = class_sizes[class].max(size);
        class_ends[class] = interval.end;
    }

    Coloring { classes, class_sizes }
}

/// Maximum number of intervals live at the same step.
pub fn max_overlap(intervals: &[Interval]) -> usize {
    let mut events: Vec<(usize, i32)> = Vec::with_capacity(intervals.len() * 2);
    for iv in intervals.iter().filter(|iv| !iv.is_empty()) {
        events.push((iv.start, 1));
        events.push((iv.end, -1));
    }
    // Ends sort before starts at the same step: [0,2) and [2,5) do not overlap.
    events.sort();
    let mut live = 0i32;
    let mut best = 0i32;
    for (_, delta) in events {
        live += delta;
        best = best.max(live);
    }
    best as usize
}
