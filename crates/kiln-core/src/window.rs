//! Iteration windows.
//!
//! A `Window` describes the rectangular iteration space a kernel covers, one
//! `(start, end, step)` range per dimension. Schedulers split windows into
//! sub-windows that are executed independently.

use std::fmt;

use crate::{KilnError, Result, TensorShape};

/// Maximum number of dimensions a window can describe.
pub const MAX_WINDOW_DIMS: usize = 4;

/// Half-open range `[start, end)` visited with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimension {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl Dimension {
    pub const fn new(start: usize, end: usize, step: usize) -> Self {
        Self { start, end, step }
    }

    /// A dimension covering a single iteration at index 0.
    pub const fn unit() -> Self {
        Self { start: 0, end: 1, step: 1 }
    }

    /// Number of iterations, `ceil((end - start) / step)`.
    pub fn num_iterations(&self) -> usize {
        if self.end <= self.start {
            0
        } else {
            (self.end - self.start).div_ceil(self.step)
        }
    }

    /// Index of every visited point.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(self.step.max(1))
    }
}

impl Default for Dimension {
    fn default() -> Self {
        Self::unit()
    }
}

/// An N-dimensional (N ≤ 4) iteration domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    dims: [Dimension; MAX_WINDOW_DIMS],
    rank: usize,
}

impl Window {
    /// A window of `rank` unit dimensions.
    pub fn new(rank: usize) -> Self {
        debug_assert!(rank <= MAX_WINDOW_DIMS);
        Self {
            dims: [Dimension::unit(); MAX_WINDOW_DIMS],
            rank: rank.min(MAX_WINDOW_DIMS),
        }
    }

    /// A window visiting every element of `shape` with unit steps.
    pub fn from_shape(shape: &TensorShape) -> Result<Self> {
        Self::from_shape_with_steps(shape, &[])
    }

    /// A window over `shape`; `steps[d]` (default 1) sets the step of dimension `d`.
    pub fn from_shape_with_steps(shape: &TensorShape, steps: &[usize]) -> Result<Self> {
        if shape.ndim() > MAX_WINDOW_DIMS {
            return Err(KilnError::shape(format!(
                "cannot build a window over rank-{} shape {}",
                shape.ndim(),
                shape
            )));
        }
        let mut win = Window::new(shape.ndim());
        for (d, &extent) in shape.dims().iter().enumerate() {
            let step = steps.get(d).copied().unwrap_or(1).max(1);
            win.dims[d] = Dimension::new(0, extent, step);
        }
        Ok(win)
    }

    /// Number of meaningful dimensions.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Dimension `d`; indices past [`MAX_WINDOW_DIMS`] read as a unit dimension.
    pub fn dim(&self, d: usize) -> Dimension {
        self.dims.get(d).copied().unwrap_or_else(Dimension::unit)
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims[..self.rank]
    }

    /// Set dimension `d`, growing the rank to cover it. Indices past
    /// [`MAX_WINDOW_DIMS`] are ignored.
    pub fn set(&mut self, d: usize, dim: Dimension) {
        let Some(slot) = self.dims.get_mut(d) else {
            return;
        };
        *slot = dim;
        self.rank = self.rank.max(d + 1);
    }

    /// Iterations along dimension `d`; dimensions beyond the rank have one.
    pub fn num_iterations(&self, d: usize) -> usize {
        self.dim(d).num_iterations()
    }

    /// Total number of visited points.
    pub fn total_iterations(&self) -> usize {
        self.dims().iter().map(Dimension::num_iterations).product()
    }

    /// The dimension with the most iterations (lowest index on ties).
    pub fn largest_dimension(&self) -> usize {
        let mut best = 0;
        for d in 1..self.rank {
            if self.num_iterations(d) > self.num_iterations(best) {
                best = d;
            }
        }
        best
    }

    /// Sub-window `id` of `total` along `dimension`.
    ///
    /// Every sub-window gets `iterations / total` iterations; the first
    /// `iterations % total` sub-windows get one more. The union of all
    /// sub-windows is the original window, without overlap.
    ///
    /// A `total` of zero counts as one. Ids past the last sub-window get an
    /// empty range, and a `dimension` past [`MAX_WINDOW_DIMS`] leaves the
    /// window whole.
    pub fn split_window(&self, dimension: usize, id: usize, total: usize) -> Window {
        let Some(&dim) = self.dims.get(dimension) else {
            return *self;
        };
        let total = total.max(1);
        let iterations = dim.num_iterations();
        let base = iterations / total;
        let rem = iterations % total;

        let (first, count) = if id >= total {
            (iterations, 0)
        } else if id < rem {
            (id * (base + 1), base + 1)
        } else {
            (rem * (base + 1) + (id - rem) * base, base)
        };

        let start = (dim.start + first * dim.step).min(dim.end.max(dim.start));
        let end = (start + count * dim.step).min(dim.end).max(start);

        let mut out = *self;
        out.dims[dimension] = Dimension::new(start, end, dim.step);
        out
    }

    /// Check that every dimension is well formed.
    pub fn validate(&self) -> Result<()> {
        for (d, dim) in self.dims().iter().enumerate() {
            if dim.step == 0 || dim.end < dim.start {
                return Err(KilnError::shape(format!(
                    "invalid window dimension {d}: {dim:?}"
                )));
            }
        }
        Ok(())
    }

    /// Whether `other` lies entirely inside this window.
    pub fn contains(&self, other: &Window) -> bool {
        (0..MAX_WINDOW_DIMS).all(|d| {
            let a = self.dims[d];
            let b = other.dims[d];
            b.start >= a.start && b.end <= a.end
        })
    }

    /// Visit every point of the window, outermost dimension slowest.
    pub fn for_each(&self, mut f: impl FnMut([usize; MAX_WINDOW_DIMS])) {
        if self.total_iterations() == 0 {
            return;
        }
        let d = self.dims;
        for i0 in d[0].iter() {
            for i1 in d[1].iter() {
                for i2 in d[2].iter() {
                    for i3 in d[3].iter() {
                        f([i0, i1, i2, i3]);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Window[")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}:{}", d.start, d.end, d.step)?;
        }
        write!(f, "]")
    }
}

/// Elements a kernel reads outside its nominal window, per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BorderSize {
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
    pub left: usize,
}

impl BorderSize {
    pub fn new(top: usize, right: usize, bottom: usize, left: usize) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn uniform(size: usize) -> Self {
        Self::new(size, size, size, size)
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(win: &Window, dim: usize, total: usize) -> Vec<(usize, usize)> {
        (0..total)
            .map(|id| {
                let sub = win.split_window(dim, id, total);
                (sub.dim(dim).start, sub.dim(dim).end)
            })
            .collect()
    }

    #[test]
    fn test_split_17_over_4() {
        let win = Window::from_shape(&TensorShape::new(&[17])).unwrap();
        let parts = extents(&win, 0, 4);
        assert_eq!(parts, vec![(0, 5), (5, 9), (9, 13), (13, 17)]);
        let sizes: Vec<usize> = parts.iter().map(|(s, e)| e - s).collect();
        assert_eq!(sizes, vec![5, 4, 4, 4]);
    }

    #[test]
    fn test_split_covers_exactly() {
        for extent in 1..40usize {
            let win = Window::from_shape(&TensorShape::new(&[3, extent])).unwrap();
            for total in 1..=extent.min(12) {
                let mut covered = vec![0u32; extent];
                for (s, e) in extents(&win, 1, total) {
                    assert!(s <= e);
                    for slot in covered.iter_mut().take(e).skip(s) {
                        *slot += 1;
                    }
                }
                assert!(covered.iter().all(|&c| c == 1), "extent={extent} total={total}");
            }
        }
    }

    #[test]
    fn test_split_with_step() {
        let win = Window::from_shape_with_steps(&TensorShape::new(&[10]), &[2]).unwrap();
        assert_eq!(win.num_iterations(0), 5);
        let a = win.split_window(0, 0, 2);
        let b = win.split_window(0, 1, 2);
        assert_eq!((a.dim(0).start, a.dim(0).end), (0, 6));
        assert_eq!((b.dim(0).start, b.dim(0).end), (6, 10));
        assert_eq!(a.num_iterations(0) + b.num_iterations(0), 5);
    }

    #[test]
    fn test_largest_dimension() {
        let win = Window::from_shape(&TensorShape::new(&[1, 24, 24, 20])).unwrap();
        assert_eq!(win.largest_dimension(), 1);
        assert_eq!(win.total_iterations(), 24 * 24 * 20);
    }

    #[test]
    fn test_for_each_visits_all() {
        let win = Window::from_shape(&TensorShape::new(&[2, 3])).unwrap();
        let mut seen = Vec::new();
        win.for_each(|c| seen.push((c[0], c[1])));
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[5], (1, 2));
    }

    #[test]
    fn test_rank_limit() {
        let shape = TensorShape::new(&[1, 2, 3, 4, 5]);
        assert!(Window::from_shape(&shape).unwrap_err().is_shape());
    }

    #[test]
    fn test_out_of_range_arguments() {
        let win = Window::from_shape(&TensorShape::new(&[6, 4])).unwrap();
        assert_eq!(win.split_window(0, 0, 0), win);
        assert_eq!(win.split_window(MAX_WINDOW_DIMS, 0, 2), win);
        let past = win.split_window(0, 3, 3);
        assert_eq!(past.dim(0), Dimension::new(6, 6, 1));
        assert_eq!(past.total_iterations(), 0);

        let mut w = win;
        w.set(MAX_WINDOW_DIMS + 1, Dimension::new(0, 9, 1));
        assert_eq!(w, win);
        assert_eq!(w.rank(), 2);
        assert_eq!(w.dim(MAX_WINDOW_DIMS), Dimension::unit());
        assert_eq!(w.num_iterations(7), 1);
    }

    #[test]
    fn test_validate_and_contains() {
        let win = Window::from_shape(&TensorShape::new(&[8, 8])).unwrap();
        assert!(win.validate().is_ok());
        assert!(win.contains(&win.split_window(0, 1, 3)));
        let mut bad = win;
        bad.set(0, Dimension::new(4, 2, 1));
        assert!(bad.validate().is_err());
    }
}
