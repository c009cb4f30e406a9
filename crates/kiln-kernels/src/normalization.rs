//! Cross-map local response normalization and batch normalization.

use kiln_core::{ActivationInfo, DataLayout, KilnError, NormalizationInfo, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::require_same_shape;

/// Slots: `Src(0)`, `Dst(0)`. Sums squares over `norm_size` neighbouring
/// channels centred on each element.
#[derive(Debug, Clone)]
pub struct NormalizationKernel {
    info: NormalizationInfo,
    layout: DataLayout,
    channels: usize,
    window: Window,
}

impl NormalizationKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor, info: &NormalizationInfo) -> Result<()> {
        src.require_f32("normalization input")?;
        src.nchw()?;
        if info.norm_size == 0 || info.norm_size % 2 == 0 {
            return Err(KilnError::shape(format!(
                "normalization size must be odd, got {}",
                info.norm_size
            )));
        }
        require_same_shape(src, dst, "normalization")
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor, info: NormalizationInfo) -> Result<Self> {
        Self::validate(src, dst, &info)?;
        Ok(Self {
            info,
            layout: src.layout,
            channels: src.nchw()?.1,
            window: Window::from_shape(&dst.shape)?,
        })
    }
}

impl Kernel for NormalizationKernel {
    fn name(&self) -> &str {
        "normalization_cross_map"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let half = self.info.norm_size / 2;
        let coeff = self.info.alpha / self.info.norm_size as f32;
        window.for_each(|coords| {
            let (n, c, y, x) = self.layout.split(&coords);
            let lo = c.saturating_sub(half);
            let hi = (c + half).min(self.channels - 1);
            let sum: f32 = (lo..=hi)
                .map(|k| {
                    let v = src.load(&self.layout.coords(n, k, y, x));
                    v * v
                })
                .sum();
            let scale = (self.info.kappa + coeff * sum).powf(self.info.beta);
            dst.store(&coords, src.load(&coords) / scale);
        });
        Ok(())
    }
}

/// Slots: `Src(0)`, `Aux(0)` mean, `Aux(1)` variance, optional `Aux(2)` beta
/// and `Aux(3)` gamma, `Dst(0)`.
#[derive(Debug, Clone)]
pub struct BatchNormalizationKernel {
    epsilon: f32,
    has_beta: bool,
    has_gamma: bool,
    activation: Option<ActivationInfo>,
    layout: DataLayout,
    window: Window,
}

impl BatchNormalizationKernel {
    pub fn validate(
        src: &TensorDescriptor,
        dst: &TensorDescriptor,
        params: &[Option<&TensorDescriptor>; 4],
    ) -> Result<()> {
        src.require_f32("batch normalization input")?;
        let (_, c, _, _) = src.nchw()?;
        require_same_shape(src, dst, "batch normalization")?;
        for (i, p) in params.iter().enumerate() {
            match p {
                Some(d) if d.shape.dims() != [c] => {
                    return Err(KilnError::shape(format!(
                        "batch normalization parameter {i} has shape {}, expected [{c}]",
                        d.shape
                    )));
                }
                None if i < 2 => {
                    return Err(KilnError::shape("batch normalization needs mean and variance"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn configure(
        src: &TensorDescriptor,
        dst: &TensorDescriptor,
        params: &[Option<&TensorDescriptor>; 4],
        epsilon: f32,
        activation: Option<ActivationInfo>,
    ) -> Result<Self> {
        Self::validate(src, dst, params)?;
        Ok(Self {
            epsilon,
            has_beta: params[2].is_some(),
            has_gamma: params[3].is_some(),
            activation,
            layout: src.layout,
            window: Window::from_shape(&dst.shape)?,
        })
    }
}

impl Kernel for BatchNormalizationKernel {
    fn name(&self) -> &str {
        "batch_normalization"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let mean = ctx.pack.aux(0)?;
        let var = ctx.pack.aux(1)?;
        let beta = if self.has_beta { Some(ctx.pack.aux(2)?) } else { None };
        let gamma = if self.has_gamma { Some(ctx.pack.aux(3)?) } else { None };
        window.for_each(|coords| {
            let (_, c, _, _) = self.layout.split(&coords);
            let norm = (src.load(&coords) - mean.load(&[c])) / (var.load(&[c]) + self.epsilon).sqrt();
            let mut v = norm * gamma.map_or(1.0, |g| g.load(&[c])) + beta.map_or(0.0, |b| b.load(&[c]));
            if let Some(act) = &self.activation {
                v = act.apply(v);
            }
            dst.store(&coords, v);
        });
        Ok(())
    }
}
