use crate::config::FlowParams;
use image::{GrayImage, Luma};

// Pyramid levels smaller than this are not worth estimating on.
const MIN_LEVEL_SIZE: usize = 8;
// Smallest structure-tensor eigenvalue (per window pixel) that still gives a
// trustworthy solve. Flat regions fall below it and are not refined.
const MIN_EIGENVALUE: f64 = 1e-2;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlowVector {
    pub u: f32, // horizontal flow
    pub v: f32, // vertical flow
}

impl FlowVector {
    pub fn new(u: f32, v: f32) -> Self {
        Self { u, v }
    }

    pub fn magnitude(&self) -> f32 {
        (self.u * self.u + self.v * self.v).sqrt()
    }
}

/// Per-pixel displacement from the previous frame to the current one.
#[derive(Clone, Debug)]
pub struct FlowField {
    width: u32,
    height: u32,
    u: Vec<f32>,
    v: Vec<f32>,
}

impl FlowField {
    pub fn zeros(width: u32, height: u32) -> Self {
        let len = (width * height) as usize;
        Self {
            width,
            height,
            u: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> FlowVector {
        let idx = (y * self.width + x) as usize;
        FlowVector::new(self.u[idx], self.v[idx])
    }

    pub fn magnitudes(&self) -> impl Iterator<Item = f32> + '_ {
        self.u.iter().zip(&self.v).map(|(u, v)| (u * u + v * v).sqrt())
    }

    /// Fraction of pixels whose flow magnitude is strictly above `threshold`.
    pub fn motion_ratio(&self, threshold: f32) -> f64 {
        if self.u.is_empty() {
            return 0.0;
        }
        let moving = self.magnitudes().filter(|m| *m > threshold).count();
        moving as f64 / self.u.len() as f64
    }

    /// Magnitudes scaled by 10 and saturated, for display.
    pub fn magnitude_map(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).magnitude() * 10.0).min(255.0) as u8])
        })
    }
}

/// Single-channel float image used inside the pyramid.
#[derive(Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample, clamped to the border.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let top = self.at(x0, y0) + (self.at(x1, y0) - self.at(x0, y0)) * fx;
        let bottom = self.at(x0, y1) + (self.at(x1, y1) - self.at(x0, y1)) * fx;
        top + (bottom - top) * fy
    }

    fn smooth(&self, kernel: &[f32]) -> Plane {
        let half = (kernel.len() / 2) as isize;
        let (w, h) = (self.width, self.height);
        let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

        let mut horizontal = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = clamp(x as isize + k as isize - half, w);
                    acc += weight * self.at(sx, y);
                }
                horizontal[y * w + x] = acc;
            }
        }

        let mut data = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = clamp(y as isize + k as isize - half, h);
                    acc += weight * horizontal[sy * w + x];
                }
                data[y * w + x] = acc;
            }
        }

        Plane { width: w, height: h, data }
    }

    fn downsample(&self, scale: f32) -> Plane {
        let width = ((self.width as f32 * scale).round() as usize).max(1);
        let height = ((self.height as f32 * scale).round() as usize).max(1);
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;

        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(self.sample((x as f32 + 0.5) * sx - 0.5, (y as f32 + 0.5) * sy - 0.5));
            }
        }

        Plane { width, height, data }
    }

    /// Central-difference gradients, one-sided at the border.
    fn gradients(&self) -> (Vec<f32>, Vec<f32>) {
        let (w, h) = (self.width, self.height);
        let mut ix = vec![0.0f32; w * h];
        let mut iy = vec![0.0f32; w * h];

        for y in 0..h {
            let (yu, yd) = (y.saturating_sub(1), (y + 1).min(h - 1));
            for x in 0..w {
                let (xl, xr) = (x.saturating_sub(1), (x + 1).min(w - 1));
                if xr > xl {
                    ix[y * w + x] = (self.at(xr, y) - self.at(xl, y)) / (xr - xl) as f32;
                }
                if yd > yu {
                    iy[y * w + x] = (self.at(x, yd) - self.at(x, yu)) / (yd - yu) as f32;
                }
            }
        }

        (ix, iy)
    }
}

/// Window sums of `values` over a (2r+1)² box clipped to the image, via an
/// integral image.
fn box_sum(values: &[f64], width: usize, height: usize, radius: usize) -> Vec<f64> {
    let stride = width + 1;
    let mut integral = vec![0.0f64; stride * (height + 1)];
    for y in 0..height {
        let mut row = 0.0;
        for x in 0..width {
            row += values[y * width + x];
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }

    let mut sums = Vec::with_capacity(width * height);
    for y in 0..height {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius + 1).min(height);
        for x in 0..width {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(width);
            sums.push(
                integral[y1 * stride + x1] - integral[y0 * stride + x1] - integral[y1 * stride + x0]
                    + integral[y0 * stride + x0],
            );
        }
    }
    sums
}

fn window_area(x: usize, y: usize, width: usize, height: usize, radius: usize) -> f64 {
    let w = (x + radius + 1).min(width) - x.saturating_sub(radius);
    let h = (y + radius + 1).min(height) - y.saturating_sub(radius);
    (w * h) as f64
}

fn gaussian_kernel(taps: usize, sigma: f32) -> Vec<f32> {
    let center = (taps / 2) as f32;
    let mut kernel: Vec<f32> = (0..taps)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= total;
    }
    kernel
}

/// Dense coarse-to-fine Lucas-Kanade flow.
///
/// Every pixel solves the 2x2 structure-tensor system over its window, the
/// solve is repeated `iterations` times per level against the current frame
/// warped by the running estimate, and the estimate is carried down the
/// pyramid. Pixels without enough texture in their window are not refined
/// and keep the estimate from the coarser level, so the flat inside of a
/// moving object moves with its edges. Nothing is estimated for them at the
/// coarsest level.
pub struct DenseFlowEstimator {
    params: FlowParams,
    kernel: Vec<f32>,
}

impl DenseFlowEstimator {
    pub fn new(params: FlowParams) -> Self {
        let kernel = gaussian_kernel(params.poly_n, params.poly_sigma);
        Self { params, kernel }
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Both frames must have the same dimensions.
    pub fn compute(&self, prev: &GrayImage, curr: &GrayImage) -> FlowField {
        debug_assert_eq!(prev.dimensions(), curr.dimensions());
        let (width, height) = prev.dimensions();
        if width == 0 || height == 0 {
            return FlowField::zeros(width, height);
        }

        let prev_pyramid = self.build_pyramid(prev);
        let curr_pyramid = self.build_pyramid(curr);

        let coarsest = &prev_pyramid[prev_pyramid.len() - 1];
        let mut u = vec![0.0f32; coarsest.width * coarsest.height];
        let mut v = vec![0.0f32; coarsest.width * coarsest.height];

        for level in (0..prev_pyramid.len()).rev() {
            let p = &prev_pyramid[level];
            if level + 1 < prev_pyramid.len() {
                let coarse = &prev_pyramid[level + 1];
                let (up_u, up_v) = upsample_flow(&u, &v, coarse, p);
                u = up_u;
                v = up_v;
            }
            self.refine_level(p, &curr_pyramid[level], &mut u, &mut v);
        }

        FlowField { width, height, u, v }
    }

    fn build_pyramid(&self, img: &GrayImage) -> Vec<Plane> {
        let mut pyramid = vec![Plane::from_gray(img).smooth(&self.kernel)];

        while pyramid.len() < self.params.levels {
            let next = pyramid[pyramid.len() - 1].downsample(self.params.pyramid_scale);
            if next.width < MIN_LEVEL_SIZE || next.height < MIN_LEVEL_SIZE {
                break;
            }
            pyramid.push(next.smooth(&self.kernel));
        }

        pyramid
    }

    fn refine_level(&self, prev: &Plane, curr: &Plane, u: &mut [f32], v: &mut [f32]) {
        let (w, h) = (prev.width, prev.height);
        let radius = self.params.window_size / 2;
        let max_step = radius as f64;

        let (ix, iy) = prev.gradients();
        let gxx = box_sum(&ix.iter().map(|g| (*g as f64).powi(2)).collect::<Vec<_>>(), w, h, radius);
        let gyy = box_sum(&iy.iter().map(|g| (*g as f64).powi(2)).collect::<Vec<_>>(), w, h, radius);
        let gxy = box_sum(
            &ix.iter().zip(&iy).map(|(a, b)| *a as f64 * *b as f64).collect::<Vec<_>>(),
            w,
            h,
            radius,
        );

        let valid: Vec<bool> = (0..w * h)
            .map(|i| {
                let (a, b, c) = (gxx[i], gxy[i], gyy[i]);
                let min_eig = (a + c) / 2.0 - (((a - c) / 2.0).powi(2) + b * b).sqrt();
                min_eig / window_area(i % w, i / w, w, h, radius) >= MIN_EIGENVALUE
            })
            .collect();

        // Untextured pixels keep whatever the coarser level handed down.
        for _ in 0..self.params.iterations {
            let temporal: Vec<f32> = (0..w * h)
                .map(|i| {
                    let (x, y) = ((i % w) as f32, (i / w) as f32);
                    curr.sample(x + u[i], y + v[i]) - prev.data[i]
                })
                .collect();

            let bx = box_sum(
                &ix.iter().zip(&temporal).map(|(g, t)| *g as f64 * *t as f64).collect::<Vec<_>>(),
                w,
                h,
                radius,
            );
            let by = box_sum(
                &iy.iter().zip(&temporal).map(|(g, t)| *g as f64 * *t as f64).collect::<Vec<_>>(),
                w,
                h,
                radius,
            );

            for i in 0..w * h {
                if !valid[i] {
                    continue;
                }

                // Solve G * d = -b for this pixel's window.
                let det = gxx[i] * gyy[i] - gxy[i] * gxy[i];
                if det <= f64::EPSILON {
                    continue;
                }
                let mut du = (gxy[i] * by[i] - gyy[i] * bx[i]) / det;
                let mut dv = (gxy[i] * bx[i] - gxx[i] * by[i]) / det;

                let step = (du * du + dv * dv).sqrt();
                if step > max_step {
                    du *= max_step / step;
                    dv *= max_step / step;
                }

                u[i] += du as f32;
                v[i] += dv as f32;
            }
        }
    }
}

fn upsample_flow(u: &[f32], v: &[f32], coarse: &Plane, fine: &Plane) -> (Vec<f32>, Vec<f32>) {
    let cu = Plane { width: coarse.width, height: coarse.height, data: u.to_vec() };
    let cv = Plane { width: coarse.width, height: coarse.height, data: v.to_vec() };
    let sx = coarse.width as f32 / fine.width as f32;
    let sy = coarse.height as f32 / fine.height as f32;

    let mut up_u = Vec::with_capacity(fine.width * fine.height);
    let mut up_v = Vec::with_capacity(fine.width * fine.height);
    for y in 0..fine.height {
        for x in 0..fine.width {
            let cx = (x as f32 + 0.5) * sx - 0.5;
            let cy = (y as f32 + 0.5) * sy - 0.5;
            up_u.push(cu.sample(cx, cy) / sx);
            up_v.push(cv.sample(cx, cy) / sy);
        }
    }

    (up_u, up_v)
}
