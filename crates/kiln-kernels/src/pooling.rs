//! Max and average pooling with implicit padding.

use kiln_core::{DataLayout, PoolingInfo, PoolingType, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::{pooling_output, require_same_shape};

/// Slots: `Src(0)`, `Dst(0)`. Padding is never materialized: windows are
/// clipped to the input.
#[derive(Debug, Clone)]
pub struct PoolingKernel {
    info: PoolingInfo,
    layout: DataLayout,
    src_hw: (usize, usize),
    window: Window,
}

impl PoolingKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor, info: &PoolingInfo) -> Result<()> {
        let expected = pooling_output(src, info)?;
        require_same_shape(dst, &expected, "pooling")
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor, info: &PoolingInfo) -> Result<Self> {
        Self::validate(src, dst, info)?;
        let (_, _, h, w) = src.nchw()?;
        let mut info = *info;
        if info.global {
            info.pool_size.width = w;
            info.pool_size.height = h;
            info.pad_stride = Default::default();
        }
        Ok(Self {
            info,
            layout: src.layout,
            src_hw: (h, w),
            window: Window::from_shape(&dst.shape)?,
        })
    }
}

impl Kernel for PoolingKernel {
    fn name(&self) -> &str {
        match self.info.pool_type {
            PoolingType::Max => "pooling_max",
            PoolingType::Average => "pooling_avg",
        }
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let (h, w) = (self.src_hw.0 as isize, self.src_hw.1 as isize);
        let ps = &self.info.pad_stride;
        let (pool_w, pool_h) = (self.info.pool_size.width as isize, self.info.pool_size.height as isize);

        window.for_each(|coords| {
            let (n, c, oy, ox) = self.layout.split(&coords);
            let y0 = (oy * ps.stride_y) as isize - ps.pad_top as isize;
            let x0 = (ox * ps.stride_x) as isize - ps.pad_left as isize;
            // Pool region including padding, then clipped to the input.
            let y1 = (y0 + pool_h).min(h + ps.pad_bottom as isize);
            let x1 = (x0 + pool_w).min(w + ps.pad_right as isize);
            let padded_area = ((y1 - y0) * (x1 - x0)).max(0);
            let (ys, ye) = (y0.max(0), y1.min(h));
            let (xs, xe) = (x0.max(0), x1.min(w));

            let value = if ys >= ye || xs >= xe {
                0.0
            } else {
                match self.info.pool_type {
                    PoolingType::Max => {
                        let mut m = f32::NEG_INFINITY;
                        for y in ys..ye {
                            for x in xs..xe {
                                m = m.max(src.load(&self.layout.coords(n, c, y as usize, x as usize)));
                            }
                        }
                        m
                    }
                    PoolingType::Average => {
                        let mut sum = 0.0;
                        for y in ys..ye {
                            for x in xs..xe {
                                sum += src.load(&self.layout.coords(n, c, y as usize, x as usize));
                            }
                        }
                        let count = if self.info.exclude_padding {
                            (ye - ys) * (xe - xs)
                        } else {
                            padded_area
                        };
                        sum / count as f32
                    }
                }
            };
            dst.store(&coords, value);
        });
        Ok(())
    }
}
