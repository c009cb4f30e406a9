//! Winograd F(2x2, 3x3) convolution.
//!
//! Filters are transformed once (`U = G g Gᵀ`, 16 values per filter and
//! input channel). Each 2x2 output tile is then computed from a 4x4 input
//! patch as `Aᵀ [Σ_c U ⊙ (Bᵀ d B)] A`.

use kiln_core::{BorderSize, DataLayout, Dimension, KilnError, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

pub const TILE: usize = 2;
pub const PATCH: usize = 4;

fn input_transform(d: &[f32; 16]) -> [f32; 16] {
    // Bᵀ d
    let mut t = [0.0f32; 16];
    for j in 0..4 {
        let (d0, d1, d2, d3) = (d[j], d[4 + j], d[8 + j], d[12 + j]);
        t[j] = d0 - d2;
        t[4 + j] = d1 + d2;
        t[8 + j] = d2 - d1;
        t[12 + j] = d1 - d3;
    }
    // (Bᵀ d) B
    let mut v = [0.0f32; 16];
    for i in 0..4 {
        let (t0, t1, t2, t3) = (t[i * 4], t[i * 4 + 1], t[i * 4 + 2], t[i * 4 + 3]);
        v[i * 4] = t0 - t2;
        v[i * 4 + 1] = t1 + t2;
        v[i * 4 + 2] = t2 - t1;
        v[i * 4 + 3] = t1 - t3;
    }
    v
}

fn filter_transform(g: &[f32; 9]) -> [f32; 16] {
    // G g (4x3)
    let mut t = [0.0f32; 12];
    for j in 0..3 {
        let (g0, g1, g2) = (g[j], g[3 + j], g[6 + j]);
        t[j] = g0;
        t[3 + j] = 0.5 * (g0 + g1 + g2);
        t[6 + j] = 0.5 * (g0 - g1 + g2);
        t[9 + j] = g2;
    }
    // (G g) Gᵀ (4x4)
    let mut u = [0.0f32; 16];
    for i in 0..4 {
        let (t0, t1, t2) = (t[i * 3], t[i * 3 + 1], t[i * 3 + 2]);
        u[i * 4] = t0;
        u[i * 4 + 1] = 0.5 * (t0 + t1 + t2);
        u[i * 4 + 2] = 0.5 * (t0 - t1 + t2);
        u[i * 4 + 3] = t2;
    }
    u
}

fn output_transform(m: &[f32; 16]) -> [f32; 4] {
    // Aᵀ m (2x4)
    let mut t = [0.0f32; 8];
    for j in 0..4 {
        let (m0, m1, m2, m3) = (m[j], m[4 + j], m[8 + j], m[12 + j]);
        t[j] = m0 + m1 + m2;
        t[4 + j] = m1 - m2 - m3;
    }
    // (Aᵀ m) A (2x2)
    let mut y = [0.0f32; 4];
    for i in 0..2 {
        let (t0, t1, t2, t3) = (t[i * 4], t[i * 4 + 1], t[i * 4 + 2], t[i * 4 + 3]);
        y[i * 2] = t0 + t1 + t2;
        y[i * 2 + 1] = t1 - t2 - t3;
    }
    y
}

/// Whether Winograd F(2x2, 3x3) can run a convolution with these parameters.
pub fn is_supported(kernel_hw: (usize, usize), stride: (usize, usize)) -> bool {
    kernel_hw == (3, 3) && stride == (1, 1)
}

/// Number of 2x2 output tiles along `(h, w)`.
pub fn tile_counts(out_h: usize, out_w: usize) -> (usize, usize) {
    (out_h.div_ceil(TILE), out_w.div_ceil(TILE))
}

/// Transform `(OFM, IFM, 3, 3)` weights into `[OFM, IFM, 16]`.
#[derive(Debug, Clone)]
pub struct WinogradFilterTransformKernel {
    layout: DataLayout,
    in_channels: usize,
    window: Window,
}

impl WinogradFilterTransformKernel {
    pub fn output_shape(weights: &TensorDescriptor) -> Result<[usize; 3]> {
        let (ofm, ifm, kh, kw) = weights.nchw()?;
        if (kh, kw) != (3, 3) {
            return Err(KilnError::shape(format!(
                "winograd F(2x2,3x3) needs 3x3 weights, got {kh}x{kw}"
            )));
        }
        Ok([ofm, ifm, PATCH * PATCH])
    }

    pub fn configure(weights: &TensorDescriptor, dst: &TensorDescriptor) -> Result<Self> {
        let shape = Self::output_shape(weights)?;
        if dst.shape.dims() != shape {
            return Err(KilnError::shape(format!(
                "transformed weights {} should be {:?}",
                dst.shape, shape
            )));
        }
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, shape[0], 1));
        Ok(Self {
            layout: weights.layout,
            in_channels: shape[1],
            window,
        })
    }
}

impl Kernel for WinogradFilterTransformKernel {
    fn name(&self) -> &str {
        "winograd_filter_transform"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        for o in window.dim(0).iter() {
            for c in 0..self.in_channels {
                let mut g = [0.0f32; 9];
                for ky in 0..3 {
                    for kx in 0..3 {
                        g[ky * 3 + kx] = src.load(&self.layout.coords(o, c, ky, kx));
                    }
                }
                for (i, &u) in filter_transform(&g).iter().enumerate() {
                    dst.store(&[o, c, i], u);
                }
            }
        }
        Ok(())
    }
}

/// Slots: `Src(0)` padded input, `Src(1)` transformed weights, `Aux(0)` bias, `Dst(0)`.
///
/// The window iterates `[N, tiles_h, tiles_w]`.
#[derive(Debug, Clone)]
pub struct WinogradConvolutionKernel {
    layout: DataLayout,
    in_channels: usize,
    out_channels: usize,
    out_hw: (usize, usize),
    has_bias: bool,
    border: BorderSize,
    window: Window,
}

impl WinogradConvolutionKernel {
    /// Padded height and width needed to cover every tile of `dst`.
    pub fn required_padded_hw(dst: &TensorDescriptor) -> Result<(usize, usize)> {
        let (_, _, oh, ow) = dst.nchw()?;
        let (th, tw) = tile_counts(oh, ow);
        Ok((th * TILE + 2, tw * TILE + 2))
    }

    pub fn configure(
        padded: &TensorDescriptor,
        transformed: &TensorDescriptor,
        dst: &TensorDescriptor,
        has_bias: bool,
    ) -> Result<Self> {
        let (n, c, ph, pw) = padded.nchw()?;
        let (_, ofm, oh, ow) = dst.nchw()?;
        if transformed.shape.dims() != [ofm, c, PATCH * PATCH] {
            return Err(KilnError::shape(format!(
                "transformed weights {} do not match {c} -> {ofm} channels",
                transformed.shape
            )));
        }
        let (need_h, need_w) = Self::required_padded_hw(dst)?;
        if ph < need_h || pw < need_w {
            return Err(KilnError::shape(format!(
                "padded input {} too small for winograd tiles of {}",
                padded.shape, dst.shape
            )));
        }
        let (th, tw) = tile_counts(oh, ow);
        let mut window = Window::new(3);
        window.set(0, Dimension::new(0, n, 1));
        window.set(1, Dimension::new(0, th, 1));
        window.set(2, Dimension::new(0, tw, 1));
        Ok(Self {
            layout: padded.layout,
            in_channels: c,
            out_channels: ofm,
            out_hw: (oh, ow),
            has_bias,
            border: BorderSize::default(),
            window,
        })
    }

    pub fn with_border(mut self, border: BorderSize) -> Self {
        self.border = border;
        self
    }
}

impl Kernel for WinogradConvolutionKernel {
    fn name(&self) -> &str {
        "winograd_convolution"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn border_size(&self) -> BorderSize {
        self.border
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let u = ctx.pack.src(1)?;
        let bias = if self.has_bias { Some(ctx.pack.aux(0)?) } else { None };
        let dst = ctx.pack.dst(0)?;
        let (oh, ow) = self.out_hw;
        let mut transformed = vec![[0.0f32; 16]; self.in_channels];

        for n in window.dim(0).iter() {
            for ty in window.dim(1).iter() {
                for tx in window.dim(2).iter() {
                    let (y0, x0) = (ty * TILE, tx * TILE);
                    for (c, v) in transformed.iter_mut().enumerate() {
                        let mut d = [0.0f32; 16];
                        for i in 0..PATCH {
                            for j in 0..PATCH {
                                d[i * PATCH + j] = src.load(&self.layout.coords(n, c, y0 + i, x0 + j));
                            }
                        }
                        *v = input_transform(&d);
                    }

                    for o in 0..self.out_channels {
                        let mut m = [0.0f32; 16];
                        for (c, v) in transformed.iter().enumerate() {
                            for (e, acc) in m.iter_mut().enumerate() {
                                *acc += u.load(&[o, c, e]) * v[e];
                            }
                        }
                        let y = output_transform(&m);
                        let b = bias.map_or(0.0, |b| b.load(&[o]));
                        for i in 0..TILE {
                            for j in 0..TILE {
                                let (oy, ox) = (y0 + i, x0 + j);
                                if oy < oh && ox < ow {
                                    dst.store(&self.layout.coords(n, o, oy, ox), y[i * TILE + j] + b);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
