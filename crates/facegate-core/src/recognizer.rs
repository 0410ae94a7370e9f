//! Local Binary Patterns Histograms (LBPH) face recognizer.
//!
//! Each template is encoded as a circular LBP code image, split into a grid
//! of cells, and summarized as one normalized histogram per cell. A probe is
//! assigned the label of the training sample with the smallest chi-square
//! distance. Training only stores histograms, so it is deterministic and a
//! retrain from the same samples yields bit-identical distances.

use crate::types::{FaceTemplate, MemberId, TEMPLATE_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Interpolated neighbors within this of the center count as equal.
/// Real intensity differences are never this small.
const LBP_TOLERANCE: f32 = 1e-3;

/// Nearest gallery label for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: MemberId,
    /// Dissimilarity; 0 for identical templates, larger is less similar.
    pub distance: f64,
}

/// A trained model that maps a probe template to its nearest label.
pub trait Recognizer: Send + Sync {
    /// `None` only when the model holds no samples.
    fn predict(&self, probe: &FaceTemplate) -> Option<Prediction>;

    /// Number of training samples held.
    fn sample_count(&self) -> usize;
}

/// Builds a fresh [`Recognizer`] from the complete labeled sample set.
///
/// Training is always from scratch; there is no incremental update.
pub trait Trainer: Send + Sync {
    fn train(&self, samples: &[(MemberId, FaceTemplate)]) -> Arc<dyn Recognizer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    /// Sampling points on the circle; histograms have `2^neighbors` bins.
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LbphTrainer {
    params: LbphParams,
}

impl LbphTrainer {
    pub fn new(params: LbphParams) -> Self {
        // Keep the histogram size sane: 2^16 bins per cell at most.
        let params = LbphParams {
            radius: params.radius.clamp(1, TEMPLATE_SIZE / 4),
            neighbors: params.neighbors.clamp(1, 16),
            grid_x: params.grid_x.max(1),
            grid_y: params.grid_y.max(1),
        };
        Self { params }
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }
}

impl Trainer for LbphTrainer {
    fn train(&self, samples: &[(MemberId, FaceTemplate)]) -> Arc<dyn Recognizer> {
        let histograms = samples
            .iter()
            .map(|(label, template)| (*label, spatial_histogram(template, &self.params)))
            .collect();
        Arc::new(LbphModel {
            params: self.params,
            histograms,
        })
    }
}

/// Trained LBPH model: one spatial histogram per sample.
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<(MemberId, Vec<f32>)>,
}

impl Recognizer for LbphModel {
    fn predict(&self, probe: &FaceTemplate) -> Option<Prediction> {
        let query = spatial_histogram(probe, &self.params);
        let mut best: Option<Prediction> = None;
        for (label, histogram) in &self.histograms {
            let distance = chi_square(histogram, &query);
            // Strict comparison: the first sample wins on equal distance.
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: *label,
                    distance,
                });
            }
        }
        best
    }

    fn sample_count(&self) -> usize {
        self.histograms.len()
    }
}

/// Circular LBP code image, `(size - 2r)` on each side.
fn lbp_codes(template: &FaceTemplate, params: &LbphParams) -> (Vec<u32>, usize, usize) {
    let size = TEMPLATE_SIZE as usize;
    let src = template.pixels();
    let r = params.radius as usize;
    let rows = size - 2 * r;
    let cols = size - 2 * r;
    let mut codes = vec![0u32; rows * cols];

    for n in 0..params.neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / params.neighbors as f32;
        let x = snap(params.radius as f32 * angle.cos());
        let y = snap(-(params.radius as f32) * angle.sin());
        let (fx, fy) = (x.floor(), y.floor());
        let (cx, cy) = (x.ceil(), y.ceil());
        let (tx, ty) = (x - fx, y - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy, cx, cy) = (fx as isize, fy as isize, cx as isize, cy as isize);

        for i in r..size - r {
            for j in r..size - r {
                let at = |dy: isize, dx: isize| {
                    src[(i as isize + dy) as usize * size + (j as isize + dx) as usize] as f32
                };
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = src[i * size + j] as f32;
                if t > center || (t - center).abs() < LBP_TOLERANCE {
                    codes[(i - r) * cols + (j - r)] |= 1 << n;
                }
            }
        }
    }
    (codes, rows, cols)
}

/// Round sampling offsets that sit on the pixel grid up to float noise.
fn snap(v: f32) -> f32 {
    let r = v.round();
    if (v - r).abs() < 1e-5 {
        r
    } else {
        v
    }
}

/// Concatenated per-cell LBP histograms, each normalized to sum to 1.
fn spatial_histogram(template: &FaceTemplate, params: &LbphParams) -> Vec<f32> {
    let (codes, rows, cols) = lbp_codes(template, params);
    let bins = 1usize << params.neighbors;
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let cell_w = cols / gx;
    let cell_h = rows / gy;
    let mut out = vec![0f32; gx * gy * bins];
    if cell_w == 0 || cell_h == 0 {
        return out;
    }
    let inv_area = 1.0 / (cell_w * cell_h) as f32;

    for cy in 0..gy {
        for cx in 0..gx {
            let hist = &mut out[(cy * gx + cx) * bins..(cy * gx + cx + 1) * bins];
            for y in cy * cell_h..(cy + 1) * cell_h {
                for x in cx * cell_w..(cx + 1) * cell_w {
                    hist[codes[y * cols + x] as usize] += 1.0;
                }
            }
            for v in hist.iter_mut() {
                *v *= inv_area;
            }
        }
    }
    out
}

/// Symmetric chi-square distance: `2 * Σ (a - b)² / (a + b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    let mut result = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let diff = x as f64 - y as f64;
        let sum = x as f64 + y as f64;
        if sum.abs() > f64::EPSILON {
            result += diff * diff / sum;
        }
    }
    result * 2.0
}
