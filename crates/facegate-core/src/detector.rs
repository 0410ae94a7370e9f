//! Multiscale sliding-window face location and candidate grouping.
//!
//! The frame is scanned at a pyramid of scales; every window the cascade
//! accepts becomes a raw candidate. Candidates are clustered by similarity
//! and a cluster survives only with more than `min_neighbors` members, which
//! suppresses isolated false positives.

use crate::cascade::{CascadeError, HaarCascade, Integrals};
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

/// Relative tolerance used when clustering raw candidates.
const GROUP_EPS: f64 = 0.2;

/// Anything that can find faces in a luminance frame.
///
/// Implementations return candidates in their native order; callers break
/// area ties by that order.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, luma: &GrayImage) -> Vec<FaceRegion>;
}

impl<F> FaceLocator for F
where
    F: Fn(&GrayImage) -> Vec<FaceRegion> + Send + Sync,
{
    fn locate(&self, luma: &GrayImage) -> Vec<FaceRegion> {
        self(luma)
    }
}

/// Sliding-window search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocatorParams {
    /// Window growth per pyramid level; must be greater than 1.
    pub scale_factor: f64,
    /// A candidate cluster needs strictly more members than this to survive.
    pub min_neighbors: u32,
    /// Smallest face side in frame pixels.
    pub min_size: u32,
    /// Largest face side in frame pixels, unbounded when `None`.
    pub max_size: Option<u32>,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: 100,
            max_size: None,
        }
    }
}

/// Haar cascade face locator.
pub struct CascadeLocator {
    cascade: HaarCascade,
    params: LocatorParams,
}

impl CascadeLocator {
    pub fn new(cascade: HaarCascade, params: LocatorParams) -> Result<Self, CascadeError> {
        if !(params.scale_factor > 1.0) {
            return Err(CascadeError::Unsupported(format!(
                "scale factor must exceed 1.0, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &LocatorParams {
        &self.params
    }

    /// Every window the cascade accepts, across all pyramid levels, before grouping.
    fn raw_candidates(&self, luma: &GrayImage) -> Vec<FaceRegion> {
        let (img_w, img_h) = luma.dimensions();
        let (win_w, win_h) = self.cascade.window_size();
        let max_side = self.params.max_size.unwrap_or(u32::MAX);

        let mut candidates = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let scaled_win_w = (win_w as f64 * factor).round() as u32;
            let scaled_win_h = (win_h as f64 * factor).round() as u32;
            let level_w = (img_w as f64 / factor).round() as u32;
            let level_h = (img_h as f64 / factor).round() as u32;

            if scaled_win_w > img_w
                || scaled_win_h > img_h
                || level_w < win_w
                || level_h < win_h
                || scaled_win_w > max_side
                || scaled_win_h > max_side
            {
                break;
            }

            if scaled_win_w >= self.params.min_size && scaled_win_h >= self.params.min_size {
                let level = if level_w == img_w && level_h == img_h {
                    luma.clone()
                } else {
                    imageops::resize(luma, level_w, level_h, FilterType::Triangle)
                };
                let integrals = Integrals::new(&level);
                let step = if factor > 2.0 { 1 } else { 2 };

                let before = candidates.len();
                for y in (0..=level_h - win_h).step_by(step) {
                    for x in (0..=level_w - win_w).step_by(step) {
                        if self.cascade.evaluate(&integrals, x, y) {
                            candidates.push(FaceRegion::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                scaled_win_w,
                                scaled_win_h,
                            ));
                        }
                    }
                }
                tracing::trace!(
                    factor,
                    window = scaled_win_w,
                    hits = candidates.len() - before,
                    "scanned pyramid level"
                );
            }

            factor *= self.params.scale_factor;
        }
        candidates
    }
}

impl FaceLocator for CascadeLocator {
    fn locate(&self, luma: &GrayImage) -> Vec<FaceRegion> {
        let raw = self.raw_candidates(luma);
        let raw_count = raw.len();
        let faces = group_regions(raw, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(raw = raw_count, faces = faces.len(), "cascade scan complete");
        faces
    }
}

/// Single-channel BT.601 luminance of a color frame.
///
/// Uses 14-bit fixed-point weights (0.299, 0.587, 0.114) with rounding, the
/// conversion the stock frontal-face cascades were trained on.
pub fn to_luma(frame: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        let luma = (r as u32 * R + g as u32 * G + b as u32 * B + (1 << 13)) >> 14;
        Luma([luma as u8])
    })
}

/// Pick the region with the largest area; on exact ties the earliest wins.
pub fn select_largest(regions: &[FaceRegion]) -> Option<FaceRegion> {
    let mut best: Option<FaceRegion> = None;
    for region in regions {
        match best {
            Some(b) if region.area() <= b.area() => {}
            _ => best = Some(*region),
        }
    }
    best
}

fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let (ax, ay, aw, ah) = (a.x as f64, a.y as f64, a.width as f64, a.height as f64);
    let (bx, by, bw, bh) = (b.x as f64, b.y as f64, b.width as f64, b.height as f64);
    (ax - bx).abs() <= delta
        && (ay - by).abs() <= delta
        && (ax + aw - bx - bw).abs() <= delta
        && (ay + ah - by - bh).abs() <= delta
}

/// Union-find clustering; labels are numbered in order of first appearance.
fn partition(regions: &[FaceRegion], eps: f64) -> (Vec<usize>, usize) {
    let n = regions.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&regions[i], &regions[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = rj.min(ri);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = vec![0; n];
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels[i] = class_of_root[root];
    }
    (labels, classes)
}

/// Merge overlapping raw candidates into averaged regions.
///
/// A cluster is kept only if it has more than `min_neighbors` members. Kept
/// clusters that sit inside a stronger cluster are dropped. With
/// `min_neighbors == 0` the raw candidates are returned untouched.
pub fn group_regions(regions: Vec<FaceRegion>, min_neighbors: u32, eps: f64) -> Vec<FaceRegion> {
    if min_neighbors == 0 || regions.is_empty() {
        return regions;
    }

    let (labels, classes) = partition(&regions, eps);
    let mut sums = vec![[0.0f64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (region, &label) in regions.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += region.x as f64;
        s[1] += region.y as f64;
        s[2] += region.width as f64;
        s[3] += region.height as f64;
        counts[label] += 1;
    }

    let averaged: Vec<FaceRegion> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            FaceRegion::new(
                (s[0] * inv).round() as u32,
                (s[1] * inv).round() as u32,
                (s[2] * inv).round() as u32,
                (s[3] * inv).round() as u32,
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if i == j || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            grouped.push(*r1);
        }
    }
    grouped
}
