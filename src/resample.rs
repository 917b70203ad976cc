//! Plane resampling
//!
//! Planes are resized separably with B-spline interpolation of order 0 to 5
//! (0 nearest, 1 linear, 3 cubic). Output sample `j` of an axis resized from
//! `n` to `m` samples is taken at source coordinate `(j + 0.5) * n / m - 0.5`,
//! so pixel centres line up. Samples outside the plane are mirrored about the
//! edge samples. No anti-aliasing filter is applied before downsampling, and
//! for orders above 1 the result is clipped to the input's value range.
//!
//! Work is spread over a fixed-size rayon pool, one plane per task, and the
//! resampled planes are stacked back in input order.

use crate::array::{dispatch, Element, VolumeArray};
use crate::error::{PyramidError, Result};
use ndarray::{stack, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Worker threads used when none are configured
pub const DEFAULT_WORKERS: usize = 8;

/// B-spline interpolation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct InterpolationOrder(u8);

impl InterpolationOrder {
    pub const NEAREST: Self = Self(0);
    pub const LINEAR: Self = Self(1);
    pub const CUBIC: Self = Self(3);

    pub fn new(order: u8) -> Result<Self> {
        if order > 5 {
            return Err(PyramidError::Validation(format!(
                "Interpolation order must be between 0 and 5, got {}",
                order
            )));
        }
        Ok(Self(order))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Orders above 1 interpolate spline coefficients rather than samples
    fn needs_prefilter(&self) -> bool {
        self.0 > 1
    }

    /// Poles of the recursive filter turning samples into spline coefficients
    fn poles(&self) -> &'static [f64] {
        const ORDER_2: [f64; 1] = [-0.171_572_875_253_809_9];
        const ORDER_3: [f64; 1] = [-0.267_949_192_431_122_7];
        const ORDER_4: [f64; 2] = [-0.361_341_225_900_220_2, -0.013_725_429_297_339_12];
        const ORDER_5: [f64; 2] = [-0.430_575_347_099_973_8, -0.043_096_288_203_264_65];
        match self.0 {
            2 => &ORDER_2,
            3 => &ORDER_3,
            4 => &ORDER_4,
            5 => &ORDER_5,
            _ => &[],
        }
    }
}

impl fmt::Display for InterpolationOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "nearest",
            1 => "linear",
            2 => "quadratic",
            3 => "cubic",
            4 => "quartic",
            _ => "quintic",
        };
        write!(f, "{} ({})", self.0, name)
    }
}

/// Centred B-spline basis function of degree `order`
fn bspline(order: u8, x: f64) -> f64 {
    let n = order as i32;
    let half = (n + 1) as f64 / 2.0;
    let mut sum = 0.0;
    let mut binomial = 1.0;
    for k in 0..=(n + 1) {
        // Inclusive so the degree-0 box covers [-0.5, 0.5)
        let t = x + half - k as f64;
        if t >= 0.0 {
            let term = if n == 0 { 1.0 } else { t.powi(n) };
            sum += if k % 2 == 0 { binomial * term } else { -binomial * term };
        }
        binomial = binomial * (n + 1 - k) as f64 / (k + 1) as f64;
    }
    let factorial: f64 = (1..=n).map(|v| v as f64).product();
    sum / factorial
}

/// Whole-sample mirror of an index into `0..len`
fn mirror_index(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let folded = index.rem_euclid(period);
    if folded >= len as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

/// Source taps and weights for every output sample along one axis
#[derive(Debug, Clone)]
struct AxisKernel {
    taps: usize,
    indices: Vec<usize>,
    weights: Vec<f64>,
}

impl AxisKernel {
    fn new(input_len: usize, output_len: usize, order: InterpolationOrder) -> Self {
        let taps = order.value() as usize + 1;
        let half_support = taps as f64 / 2.0;
        let scale = input_len as f64 / output_len as f64;
        let mut indices = Vec::with_capacity(output_len * taps);
        let mut weights = Vec::with_capacity(output_len * taps);

        for j in 0..output_len {
            let coordinate = (j as f64 + 0.5) * scale - 0.5;
            let first = (coordinate - half_support).floor() as isize + 1;
            for tap in 0..taps as isize {
                let source = first + tap;
                indices.push(mirror_index(source, input_len));
                weights.push(bspline(order.value(), coordinate - source as f64));
            }
        }

        Self {
            taps,
            indices,
            weights,
        }
    }

    fn sample(&self, output: usize, line: impl Fn(usize) -> f64) -> f64 {
        let start = output * self.taps;
        self.indices[start..start + self.taps]
            .iter()
            .zip(&self.weights[start..start + self.taps])
            .map(|(&index, &weight)| weight * line(index))
            .sum()
    }
}

/// In-place conversion of samples to B-spline coefficients, mirror boundary
fn prefilter_line(line: &mut [f64], poles: &[f64]) {
    let n = line.len();
    if n < 2 || poles.is_empty() {
        return;
    }

    let gain: f64 = poles.iter().map(|&z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    for value in line.iter_mut() {
        *value *= gain;
    }

    for &z in poles {
        // Causal initialisation over the mirrored signal
        let z_last = z.powi(n as i32 - 1);
        let mut z_i = z;
        let mut first = line[0] + z_last * line[n - 1];
        for i in 1..n - 1 {
            first += z_i * (line[i] + z_last * line[n - 1 - i]);
            z_i *= z;
        }
        line[0] = first / (1.0 - z_last * z_last);

        for i in 1..n {
            line[i] += z * line[i - 1];
        }

        line[n - 1] = (z * line[n - 2] + line[n - 1]) * z / (z * z - 1.0);
        for i in (0..n - 1).rev() {
            line[i] = z * (line[i + 1] - line[i]);
        }
    }
}

fn prefilter_plane(plane: &mut Array2<f64>, order: InterpolationOrder) {
    let poles = order.poles();
    for axis in [Axis(0), Axis(1)] {
        let mut buffer = Vec::new();
        for mut lane in plane.lanes_mut(axis) {
            buffer.clear();
            buffer.extend(lane.iter().copied());
            prefilter_line(&mut buffer, poles);
            for (dst, src) in lane.iter_mut().zip(&buffer) {
                *dst = *src;
            }
        }
    }
}

/// Resizes planes of one fixed input shape to one fixed output shape
#[derive(Debug, Clone)]
pub struct PlaneResampler {
    input: [usize; 2],
    output: [usize; 2],
    order: InterpolationOrder,
    rows: AxisKernel,
    cols: AxisKernel,
}

impl PlaneResampler {
    pub fn new(input: [usize; 2], output: [usize; 2], order: InterpolationOrder) -> Result<Self> {
        if input.contains(&0) || output.contains(&0) {
            return Err(PyramidError::Validation(format!(
                "Cannot resample plane of shape {:?} to {:?}",
                input, output
            )));
        }
        Ok(Self {
            input,
            output,
            order,
            rows: AxisKernel::new(input[0], output[0], order),
            cols: AxisKernel::new(input[1], output[1], order),
        })
    }

    /// Resample one plane, converting back to its element type
    pub fn resample<T: Element>(&self, plane: ArrayView2<'_, T>) -> Result<Array2<T>> {
        let (height, width) = plane.dim();
        if [height, width] != self.input {
            return Err(PyramidError::Validation(format!(
                "Plane of shape {:?} given to resampler for {:?}",
                [height, width],
                self.input
            )));
        }

        let mut samples = plane.mapv(T::to_sample);
        let range = if self.order.needs_prefilter() {
            let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prefilter_plane(&mut samples, self.order);
            Some((min, max))
        } else {
            None
        };

        let [out_h, out_w] = self.output;
        let columns = Array2::from_shape_fn((height, out_w), |(r, j)| {
            self.cols.sample(j, |c| samples[[r, c]])
        });
        let resampled = Array2::from_shape_fn((out_h, out_w), |(i, j)| {
            let value = self.rows.sample(i, |r| columns[[r, j]]);
            match range {
                Some((min, max)) => value.clamp(min, max),
                None => value,
            }
        });

        Ok(resampled.mapv(T::from_sample))
    }
}

/// Fixed-size pool that resamples the planes of a block in parallel
#[derive(Clone)]
pub struct ResamplePool {
    pool: Arc<ThreadPool>,
    workers: usize,
}

impl fmt::Debug for ResamplePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResamplePool")
            .field("workers", &self.workers)
            .finish()
    }
}

impl ResamplePool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("resample-{}", i))
            .build()
            .map_err(|e| PyramidError::Configuration(format!("Resample pool: {}", e)))?;
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Resize every Z plane of a `(dz, y, x)` block to `(ty, tx)`
    pub async fn resize_xy(
        &self,
        block: VolumeArray,
        target: [usize; 2],
        order: InterpolationOrder,
    ) -> Result<VolumeArray> {
        self.run(block, PlaneAxis::Z, target, order).await
    }

    /// Resize every XZ plane of a `(z, dy, x)` block to `(tz, tx)`, giving
    /// a `(tz, dy, tx)` block
    pub async fn resize_xz(
        &self,
        block: VolumeArray,
        target: [usize; 2],
        order: InterpolationOrder,
    ) -> Result<VolumeArray> {
        self.run(block, PlaneAxis::Y, target, order).await
    }

    async fn run(
        &self,
        block: VolumeArray,
        axis: PlaneAxis,
        target: [usize; 2],
        order: InterpolationOrder,
    ) -> Result<VolumeArray> {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            pool.install(|| dispatch!(&block, array => resize_block(array.view(), axis, target, order)))
        })
        .await?
    }
}

/// Axis the planes of a block are taken across
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaneAxis {
    /// `(y, x)` planes, one per Z index
    Z,
    /// `(z, x)` planes, one per Y index
    Y,
}

impl PlaneAxis {
    fn axis(&self) -> Axis {
        match self {
            PlaneAxis::Z => Axis(0),
            PlaneAxis::Y => Axis(1),
        }
    }
}

fn resize_block<T: Element>(
    block: ndarray::ArrayView3<'_, T>,
    axis: PlaneAxis,
    target: [usize; 2],
    order: InterpolationOrder,
) -> Result<VolumeArray> {
    let count = block.len_of(axis.axis());
    let input = {
        let (z, y, x) = block.dim();
        match axis {
            PlaneAxis::Z => [y, x],
            PlaneAxis::Y => [z, x],
        }
    };
    let resampler = PlaneResampler::new(input, target, order)?;

    let planes = (0..count)
        .into_par_iter()
        .map(|index| {
            let plane = block.index_axis(axis.axis(), index);
            match catch_unwind(AssertUnwindSafe(|| resampler.resample(plane))) {
                Ok(result) => result.map_err(|e| PyramidError::worker(index, e)),
                Err(payload) => Err(PyramidError::worker(
                    index,
                    PyramidError::Panic(panic_message(payload.as_ref())),
                )),
            }
        })
        .collect::<Result<Vec<Array2<T>>>>()?;

    let views: Vec<ArrayView2<'_, T>> = planes.iter().map(|p| p.view()).collect();
    let stacked = stack(axis.axis(), &views).map_err(|e| PyramidError::Validation(e.to_string()))?;
    Ok(VolumeArray::from(stacked))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn order(value: u8) -> InterpolationOrder {
        InterpolationOrder::new(value).unwrap()
    }

    #[test]
    fn test_order_bounds() {
        assert!(InterpolationOrder::new(5).is_ok());
        assert!(InterpolationOrder::new(6).is_err());
        assert_eq!(InterpolationOrder::default(), InterpolationOrder::NEAREST);
        assert_eq!(InterpolationOrder::CUBIC.to_string(), "3 (cubic)");
    }

    #[test]
    fn test_bspline_partition_of_unity() {
        for degree in 0..=5u8 {
            for &offset in &[0.0, 0.25, 0.5, 0.8] {
                let sum: f64 = (-4..=4).map(|k| bspline(degree, offset + k as f64)).sum();
                assert!((sum - 1.0).abs() < 1e-9, "degree {} offset {}", degree, offset);
            }
        }
        assert!((bspline(3, 0.0) - 2.0 / 3.0).abs() < 1e-12);
        assert!((bspline(3, 1.0) - 1.0 / 6.0).abs() < 1e-12);
        assert!((bspline(1, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mirror_index() {
        assert_eq!(mirror_index(-1, 5), 1);
        assert_eq!(mirror_index(-2, 5), 2);
        assert_eq!(mirror_index(5, 5), 3);
        assert_eq!(mirror_index(6, 5), 2);
        assert_eq!(mirror_index(3, 5), 3);
        assert_eq!(mirror_index(-7, 1), 0);
    }

    #[test]
    fn test_same_shape_is_identity() {
        let plane = Array2::from_shape_fn((7, 9), |(y, x)| (y * 31 + x * 7) as u16);
        for value in 0..=5 {
            let resampler = PlaneResampler::new([7, 9], [7, 9], order(value)).unwrap();
            let out = resampler.resample(plane.view()).unwrap();
            assert_eq!(out, plane, "order {}", value);
        }
    }

    #[test]
    fn test_nearest_downsample() {
        let plane = Array2::from_shape_fn((4, 6), |(y, x)| (10 * y + x) as u8);
        let resampler = PlaneResampler::new([4, 6], [2, 3], InterpolationOrder::NEAREST).unwrap();
        let out = resampler.resample(plane.view()).unwrap();
        // Output centres map to 1.5, 3.5, ... which round to the odd samples
        assert_eq!(out, Array2::from_shape_vec((2, 3), vec![11, 13, 15, 31, 33, 35]).unwrap());
    }

    #[test]
    fn test_linear_downsample_averages_pairs() {
        let plane = Array2::from_shape_fn((2, 8), |(_, x)| (x * 10) as f32);
        let resampler = PlaneResampler::new([2, 8], [1, 4], InterpolationOrder::LINEAR).unwrap();
        let out = resampler.resample(plane.view()).unwrap();
        assert_eq!(out.row(0).to_vec(), vec![5.0, 25.0, 45.0, 65.0]);
    }

    #[test]
    fn test_spline_preserves_constant_and_range() {
        let constant = Array2::from_elem((5, 5), 42.0f64);
        let cubic = PlaneResampler::new([5, 5], [3, 8], InterpolationOrder::CUBIC).unwrap();
        for value in cubic.resample(constant.view()).unwrap() {
            assert!((value - 42.0).abs() < 1e-9);
        }

        // Splines overshoot at a step; the result is clipped to the input range
        let step = Array2::from_shape_fn((1, 8), |(_, x)| if x < 4 { 0.0f32 } else { 1.0 });
        let quintic = PlaneResampler::new([1, 8], [1, 13], order(5)).unwrap();
        let out = quintic.resample(step.view()).unwrap();
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(out[[0, 12]] > 0.9);
        assert!(out[[0, 0]] < 0.1);
    }

    #[test]
    fn test_rejects_empty_shapes() {
        assert!(PlaneResampler::new([0, 4], [2, 2], InterpolationOrder::NEAREST).is_err());
        assert!(PlaneResampler::new([4, 4], [2, 0], InterpolationOrder::NEAREST).is_err());
    }

    #[tokio::test]
    async fn test_pool_resize_xy_keeps_plane_order() {
        let pool = ResamplePool::new(4).unwrap();
        let block = Array3::from_shape_fn((16, 4, 4), |(z, _, _)| z as u16);
        let out = pool
            .resize_xy(VolumeArray::from(block), [2, 2], InterpolationOrder::NEAREST)
            .await
            .unwrap();
        assert_eq!(out.shape(), [16, 2, 2]);
        let typed = out.as_typed::<u16>().unwrap();
        for z in 0..16 {
            assert!(typed.index_axis(Axis(0), z).iter().all(|&v| v == z as u16));
        }
    }

    #[tokio::test]
    async fn test_pool_resize_xz_layout() {
        let pool = ResamplePool::new(2).unwrap();
        // Value encodes (z, y, x)
        let block = Array3::from_shape_fn((4, 3, 6), |(z, y, x)| (100 * z + 10 * y + x) as i32);
        let out = pool
            .resize_xz(VolumeArray::from(block), [2, 3], InterpolationOrder::NEAREST)
            .await
            .unwrap();
        assert_eq!(out.shape(), [2, 3, 3]);
        let typed = out.as_typed::<i32>().unwrap();
        // z picks 1 and 3, x picks 1, 3 and 5, y is untouched
        assert_eq!(typed[[0, 2, 0]], 100 + 20 + 1);
        assert_eq!(typed[[1, 1, 2]], 300 + 10 + 5);
    }

    #[tokio::test]
    async fn test_pool_rejects_empty_target() {
        let pool = ResamplePool::new(1).unwrap();
        let block = VolumeArray::zeros(crate::types::DataType::U8, [1, 4, 4]);
        let result = pool
            .resize_xy(block, [0, 2], InterpolationOrder::NEAREST)
            .await;
        assert!(matches!(result, Err(PyramidError::Validation(_))));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("plane {}", 3)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "plane 3");
    }
}
