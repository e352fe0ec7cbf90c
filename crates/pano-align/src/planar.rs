//! Planar correlators and the coarse-to-fine pyramid aligner.
//!
//! A [`Correlator`] scores a candidate displacement between two RGB buffers;
//! the metric set is closed and known, so dispatch is over a small sum type
//! rather than trait objects. [`PyramidAligner`] searches for the
//! displacement minimising the score, downsampling until a size floor, brute
//! forcing at the bottom, and refining ±2 px per level on the way up.

use pano_core::{PixelBuffer, Real};

use crate::stat::{OnlineVariance, VariancePool};

/// Per-pixel difference metrics over RGB triplets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorMetric {
    AbsoluteDifference,
    LeastSquares,
    GemanMcClure { alpha: f32 },
    CrossCorrelation { alpha: f32 },
}

impl ErrorMetric {
    #[inline]
    fn calculate(&self, a: [u8; 3], b: [u8; 3]) -> f32 {
        let db = a[0] as f32 - b[0] as f32;
        let dg = a[1] as f32 - b[1] as f32;
        let dr = a[2] as f32 - b[2] as f32;
        match *self {
            ErrorMetric::AbsoluteDifference => (db.abs() + dg.abs() + dr.abs()) / 3.0,
            ErrorMetric::LeastSquares => (db * db + dg * dg + dr * dr) / 9.0,
            ErrorMetric::GemanMcClure { alpha } => {
                let x = (db.abs() + dg.abs() + dr.abs()) / 3.0;
                let x2 = x * x;
                x2 / (1.0 + x2 / (alpha * alpha))
            }
            ErrorMetric::CrossCorrelation { alpha } => {
                let p = (a[0] as f32 - alpha) * (b[0] as f32 - alpha)
                    + (a[1] as f32 - alpha) * (b[1] as f32 - alpha)
                    + (a[2] as f32 - alpha) * (b[2] as f32 - alpha);
                p / (256.0 * 3.0)
            }
        }
    }

    /// `-1` for similarity metrics that grow with agreement.
    #[inline]
    fn sign(&self) -> f32 {
        match self {
            ErrorMetric::CrossCorrelation { .. } => -1.0,
            _ => 1.0,
        }
    }
}

/// A displacement scorer: plain sum or normalised by valid-pixel count.
///
/// The normalised form makes scores comparable across displacements with
/// different overlap sizes and is what the pairwise correlator uses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Correlator {
    Base(ErrorMetric),
    Normed(ErrorMetric),
}

impl Correlator {
    /// Score displacement `(dx, dy)`: compares `a(x, y)` against
    /// `b(x + dx, y + dy)` over the valid region. Lower is better.
    pub fn calculate(&self, a: &PixelBuffer, b: &PixelBuffer, dx: i32, dy: i32) -> f32 {
        let metric = match self {
            Correlator::Base(m) | Correlator::Normed(m) => *m,
        };
        let sx = 0.max(-dx);
        let ex = (a.width() as i32).min(b.width() as i32 - dx);
        let sy = 0.max(-dy);
        let ey = (a.height() as i32).min(b.height() as i32 - dy);
        if ex <= sx || ey <= sy {
            return f32::MAX;
        }

        let mut sum = 0.0f32;
        for y in sy..ey {
            for x in sx..ex {
                let pa = a.get(x as u32, y as u32);
                let pb = b.get((x + dx) as u32, (y + dy) as u32);
                sum += metric.calculate(pa, pb);
            }
        }
        match self {
            Correlator::Base(m) => sum * m.sign(),
            Correlator::Normed(m) => sum * m.sign() / ((ex - sx) * (ey - sy)) as f32,
        }
    }
}

/// Result of a planar search: the winning displacement, the sample weight
/// that went into the variance estimate, and the variance of the scores.
#[derive(Clone, Copy, Debug)]
pub struct PlanarResult {
    pub offset: (i32, i32),
    pub n: usize,
    pub variance: Real,
}

/// Exhaustive search over `dx ∈ [ox-wx, ox+wx]`, `dy ∈ [oy-wy, oy+wy]`.
///
/// Scans x in the outer loop and y in the inner one; the first minimum
/// wins, which keeps tie-breaking deterministic.
pub fn brute_force_align(
    correlator: &Correlator,
    a: &PixelBuffer,
    b: &PixelBuffer,
    wx: i32,
    wy: i32,
    ox: i32,
    oy: i32,
) -> PlanarResult {
    debug_assert!(wx > 0 && wy > 0, "correlation window exists");
    let mut best = (ox, oy);
    let mut min = f32::MAX;
    let mut var = OnlineVariance::default();

    for dx in -wx..=wx {
        for dy in -wy..=wy {
            let score = correlator.calculate(a, b, dx + ox, dy + oy);
            var.push(score as Real);
            if score < min {
                min = score;
                best = (dx + ox, dy + oy);
            }
        }
    }

    PlanarResult {
        offset: best,
        n: (wx * 2 + wy * 2) as usize,
        variance: var.result(),
    }
}

/// Downsample by two with a 2×2 box filter.
pub fn downsample_half(buf: &PixelBuffer) -> PixelBuffer {
    let w = (buf.width() / 2).max(1);
    let h = (buf.height() / 2).max(1);
    let mut data = Vec::with_capacity((w * h * 3) as usize);
    for y in 0..h {
        for x in 0..w {
            let x0 = (x * 2).min(buf.width() - 1);
            let x1 = (x * 2 + 1).min(buf.width() - 1);
            let y0 = (y * 2).min(buf.height() - 1);
            let y1 = (y * 2 + 1).min(buf.height() - 1);
            for c in 0..3 {
                let sum = buf.get(x0, y0)[c] as u16
                    + buf.get(x1, y0)[c] as u16
                    + buf.get(x0, y1)[c] as u16
                    + buf.get(x1, y1)[c] as u16;
                data.push((sum / 4) as u8);
            }
        }
    }
    PixelBuffer::new(w, h, data).expect("buffer size matches")
}

/// Coarse-to-fine displacement search over a [`Correlator`].
#[derive(Clone, Copy, Debug)]
pub struct PyramidAligner {
    correlator: Correlator,
    /// Search window at the coarsest level, as a fraction of image size.
    wx: Real,
    wy: Real,
    /// Number of fine levels that propagate the guess without refinement.
    dskip: i32,
}

impl PyramidAligner {
    pub fn new(correlator: Correlator) -> Self {
        Self {
            correlator,
            wx: 0.5,
            wy: 0.5,
            dskip: 0,
        }
    }

    pub fn with_window(correlator: Correlator, wx: Real, wy: Real, dskip: i32) -> Self {
        Self {
            correlator,
            wx,
            wy,
            dskip,
        }
    }

    /// Find the displacement of `b` relative to `a` minimising the score.
    pub fn align(&self, a: &PixelBuffer, b: &PixelBuffer) -> PlanarResult {
        let mut pool = VariancePool::default();
        let offset = self.align_internal(a, b, self.dskip, 0, &mut pool);
        PlanarResult {
            offset,
            n: pool.total_weight() as usize,
            variance: pool.result(),
        }
    }

    fn align_internal(
        &self,
        a: &PixelBuffer,
        b: &PixelBuffer,
        dskip: i32,
        depth: i32,
        pool: &mut VariancePool,
    ) -> (i32, i32) {
        const MIN_SIZE: Real = 4.0;

        let floor_x = MIN_SIZE / self.wx;
        let floor_y = MIN_SIZE / self.wy;
        let above_floor = (a.width() as Real) > floor_x
            && (b.width() as Real) > floor_x
            && (a.height() as Real) > floor_y
            && (b.height() as Real) > floor_y;

        if above_floor {
            let ta = downsample_half(a);
            let tb = downsample_half(b);
            let guess = self.align_internal(&ta, &tb, dskip - 1, depth + 1, pool);

            if dskip > 0 {
                return (guess.0 * 2, guess.1 * 2);
            }

            let detailed =
                brute_force_align(&self.correlator, a, b, 2, 2, guess.0 * 2, guess.1 * 2);
            pool.push(detailed.variance, (detailed.n as Real) * (2f64).powi(depth));
            detailed.offset
        } else {
            let wx = ((a.width().max(b.width()) as Real * self.wx) as i32).max(1);
            let wy = ((a.height().max(b.height()) as Real * self.wy) as i32).max(1);
            let detailed = brute_force_align(&self.correlator, a, b, wx, wy, 0, 0);
            pool.push(detailed.variance, (detailed.n as Real) * (2f64).powi(depth));
            detailed.offset
        }
    }
}
