//! Per-frame exposure gain estimation.
//!
//! Overlapping pairs vote on relative gains; the estimator solves the
//! regularised normal equations so that scaled mean intensities agree
//! across every pair while gains stay anchored around one.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use pano_core::{PixelBuffer, Real};

/// Mean intensity of a buffer over all channels, in `[0, 255]`.
pub fn mean_intensity(buf: &PixelBuffer) -> Real {
    let bytes = buf.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    bytes.iter().map(|&b| b as Real).sum::<Real>() / bytes.len() as Real
}

/// Collects intensity observations of overlapping pairs and solves for
/// per-frame gains.
#[derive(Clone, Debug, Default)]
pub struct ExposureCompensator {
    frames: Vec<u64>,
    index: HashMap<u64, usize>,
    pairs: Vec<(usize, usize, Real, Real)>,
}

impl ExposureCompensator {
    /// Record one overlapping pair with the mean intensities of the two
    /// frames over the shared region.
    pub fn add_pair(&mut self, a: u64, b: u64, mean_a: Real, mean_b: Real) {
        let ia = self.intern(a);
        let ib = self.intern(b);
        self.pairs.push((ia, ib, mean_a, mean_b));
    }

    fn intern(&mut self, id: u64) -> usize {
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.frames.len();
        self.frames.push(id);
        self.index.insert(id, i);
        i
    }

    /// Solve for gains; frames without observations get gain 1.
    pub fn estimate(&self) -> HashMap<u64, Real> {
        let n = self.frames.len();
        if n == 0 {
            return HashMap::new();
        }

        // Regulariser keeps the system well posed and pulls gains to 1;
        // scaled to the intensity magnitude so it competes with the data.
        let mean_sq = self
            .pairs
            .iter()
            .map(|&(_, _, ma, mb)| (ma * ma + mb * mb) / 2.0)
            .sum::<Real>()
            / self.pairs.len().max(1) as Real;
        let alpha = (0.01 * mean_sq).max(1e-6);

        let mut a = DMatrix::<Real>::zeros(n, n);
        let mut b = DVector::<Real>::zeros(n);
        for i in 0..n {
            a[(i, i)] = alpha;
            b[i] = alpha;
        }
        for &(i, j, mi, mj) in &self.pairs {
            a[(i, i)] += mi * mi;
            a[(j, j)] += mj * mj;
            a[(i, j)] -= mi * mj;
            a[(j, i)] -= mi * mj;
        }

        let gains = a
            .lu()
            .solve(&b)
            .unwrap_or_else(|| DVector::from_element(n, 1.0));

        self.frames
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, gains[i]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_pairs_give_unit_gains() {
        let mut comp = ExposureCompensator::default();
        comp.add_pair(1, 2, 100.0, 100.0);
        comp.add_pair(2, 3, 100.0, 100.0);
        for gain in comp.estimate().values() {
            assert!((gain - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn dim_frame_gets_boosted() {
        let mut comp = ExposureCompensator::default();
        // Frame 2 is consistently 20% darker than its neighbours.
        comp.add_pair(1, 2, 100.0, 80.0);
        comp.add_pair(2, 3, 80.0, 100.0);
        let gains = comp.estimate();
        assert!(gains[&2] > gains[&1]);
        assert!(gains[&2] > gains[&3]);
        let ratio = gains[&2] / gains[&1];
        assert!((ratio - 1.25).abs() < 0.1, "ratio {ratio}");
    }

    #[test]
    fn mean_intensity_of_flat_buffer() {
        let buf = PixelBuffer::new(4, 4, vec![50; 48]).unwrap();
        assert!((mean_intensity(&buf) - 50.0).abs() < 1e-12);
    }
}
