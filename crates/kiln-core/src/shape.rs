use smallvec::SmallVec;
use std::fmt;

/// Maximum rank a tensor shape may have.
pub const MAX_DIMS: usize = 6;

/// Tensor shape, outermost dimension first, stack-allocated up to 4 dims.
///
/// `[N, H, W, C]` for an NHWC activation, `[OC, KH, KW, IC]` for its weights.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    dims: SmallVec<[usize; 4]>,
}

impl TensorShape {
    /// Create a shape from dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of a specific dimension.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Whether any dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }

    /// Element strides of a contiguous row-major layout.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let ndim = self.dims.len();
        if ndim == 0 {
            return SmallVec::new();
        }
        let mut strides = SmallVec::from_elem(0usize, ndim);
        strides[ndim - 1] = 1;
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Numpy-style broadcast of two shapes, aligned on the innermost dimension.
    pub fn broadcast_with(&self, other: &TensorShape) -> Option<TensorShape> {
        let max_ndim = self.ndim().max(other.ndim());
        let mut result = SmallVec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let a = if i < self.ndim() { self.dims[self.ndim() - 1 - i] } else { 1 };
            let b = if i < other.ndim() { other.dims[other.ndim() - 1 - i] } else { 1 };

            if a == b || b == 1 {
                result.push(a);
            } else if a == 1 {
                result.push(b);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(TensorShape { dims: result })
    }

    /// Resolve a reshape target where at most one entry is `-1` (inferred).
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<TensorShape> {
        let numel = self.numel();
        let mut inferred_idx = None;
        let mut known_product: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            if d == -1 {
                if inferred_idx.is_some() {
                    return None;
                }
                inferred_idx = Some(i);
            } else if d <= 0 {
                return None;
            } else {
                known_product = known_product.checked_mul(d as usize)?;
            }
        }

        let mut result: SmallVec<[usize; 4]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred_idx {
            if known_product == 0 || numel % known_product != 0 {
                return None;
            }
            result[idx] = numel / known_product;
        }

        let resolved = TensorShape { dims: result };
        (resolved.numel() == numel).then_some(resolved)
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorShape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        TensorShape::new(dims)
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        TensorShape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for TensorShape {
                fn from(dims: [usize; $n]) -> Self {
                    TensorShape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);
