//! Boosted Haar cascade (Viola–Jones) loaded from an OpenCV cascade XML file.
//!
//! Only the current OpenCV layout (`<cascade>` with `stageType` BOOST and
//! `featureType` HAAR) is supported. Windows are evaluated against integral
//! and squared-integral images of the (possibly downscaled) frame, with each
//! feature response normalized by the window's standard deviation.

use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use roxmltree::{Document, Node};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Stage thresholds are loosened by this much, matching OpenCV's loader.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

/// Windows with `area / norm` at or above this (stddev <= 10) are skipped.
const MIN_INV_CONTRAST: f64 = 0.1;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("cascade is missing <{0}>")]
    MissingElement(&'static str),
    #[error("invalid number {value:?} in <{element}>")]
    InvalidNumber { element: &'static str, value: String },
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("inconsistent cascade: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Internal tree node. Child indices `<= 0` point into the leaf table as `-idx`.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A trained Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

/// Integral and squared-integral images of one pyramid level.
///
/// Both tables are padded with a leading zero row and column, so the sum of
/// the rectangle `(x, y, w, h)` reads four corners without bounds checks.
pub(crate) struct Integrals {
    sum: Vec<u64>,
    squares: Vec<u64>,
    stride: usize,
}

impl Integrals {
    pub(crate) fn new(gray: &GrayImage) -> Self {
        let sum: Image<Luma<u64>> = integral_image(gray);
        let squares: Image<Luma<u64>> = integral_squared_image(gray);
        Self {
            stride: gray.width() as usize + 1,
            sum: sum.into_raw(),
            squares: squares.into_raw(),
        }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
        let top_left = table[y * stride + x];
        let top_right = table[y * stride + x + w];
        let bottom_left = table[(y + h) * stride + x];
        let bottom_right = table[(y + h) * stride + x + w];
        (bottom_right + top_left) - (top_right + bottom_left)
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn squares(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.squares, self.stride, x, y, w, h)
    }
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?cascade.window_size(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported("no <cascade> element; old-style cascades are not supported".into())
            })?;

        let stage_type = text(child(root, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = text(child(root, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = number(child(root, "width")?, "width")?;
        let window_height: u32 = number(child(root, "height")?, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Inconsistent(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = items(child(root, "features")?)
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = Self {
            window_width,
            window_height,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Detection window size `(width, height)` the cascade was trained at.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn validate(&self) -> Result<(), CascadeError> {
        if self.stages.is_empty() {
            return Err(CascadeError::Inconsistent("cascade has no stages".into()));
        }
        for feature in &self.features {
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(CascadeError::Inconsistent(format!(
                        "feature rect ({}, {}, {}, {}) exceeds the {}x{} window",
                        r.x, r.y, r.width, r.height, self.window_width, self.window_height
                    )));
                }
            }
        }
        for (si, stage) in self.stages.iter().enumerate() {
            for weak in &stage.classifiers {
                for node in &weak.nodes {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::Inconsistent(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) < weak.nodes.len()
                        } else {
                            (child.unsigned_abs() as usize) < weak.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Inconsistent(format!(
                                "stage {si} has a dangling tree index {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// Flat and low-contrast windows (standard deviation of 10 or less) are
    /// rejected before any stage runs. The caller guarantees the window lies
    /// inside the integral image.
    pub(crate) fn evaluate(&self, integrals: &Integrals, x: u32, y: u32) -> bool {
        // Variance normalization over the window shrunk by one pixel per side.
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = integrals.sum(x + 1, y + 1, nw, nh) as f64;
        let squares = integrals.squares(x + 1, y + 1, nw, nh) as f64;
        let nf = area * squares - sum * sum;
        if nf <= 0.0 {
            return false;
        }
        let inv_norm = 1.0 / nf.sqrt();
        if area * inv_norm >= MIN_INV_CONTRAST {
            return false;
        }

        for stage in &self.stages {
            let mut score = 0.0f32;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.feature_value(node.feature, integrals, x, y) * inv_norm;
                    idx = if value < node.threshold as f64 {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                score += weak.leaves[idx.unsigned_abs() as usize];
            }
            if score < stage.threshold {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, feature: usize, integrals: &Integrals, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight as f64 * integrals.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

fn parse_stage(node: Node) -> Result<Stage, CascadeError> {
    let threshold: f32 = number(child(node, "stageThreshold")?, "stageThreshold")?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|weak| {
            let raw = numbers(child(weak, "internalNodes")?, "internalNodes")?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(CascadeError::Unsupported(format!(
                    "internalNodes with {} values (categorical features?)",
                    raw.len()
                )));
            }
            let nodes = raw
                .chunks_exact(4)
                .map(|c| TreeNode {
                    left: c[0] as i32,
                    right: c[1] as i32,
                    feature: c[2] as usize,
                    threshold: c[3] as f32,
                })
                .collect();
            let leaves = numbers(child(weak, "leafValues")?, "leafValues")?
                .into_iter()
                .map(|v| v as f32)
                .collect();
            Ok(WeakClassifier { nodes, leaves })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_feature(node: Node) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.children().find(|n| n.has_tag_name("tilted")) {
        if text(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }
    let rects = items(child(node, "rects")?)
        .map(|r| {
            let v = numbers(r, "rects")?;
            if v.len() != 5 || v[..4].iter().any(|&c| c < 0.0) {
                return Err(CascadeError::Inconsistent(format!("bad feature rect {v:?}")));
            }
            Ok(WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HaarFeature { rects })
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> Result<Node<'a, 'input>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or(CascadeError::MissingElement(name))
}

/// OpenCV serializes sequences as repeated `<_>` elements.
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn number<T: FromStr>(node: Node, element: &'static str) -> Result<T, CascadeError> {
    let raw = text(node);
    raw.parse().map_err(|_| CascadeError::InvalidNumber {
        element,
        value: raw.to_string(),
    })
}

fn numbers(node: Node, element: &'static str) -> Result<Vec<f64>, CascadeError> {
    text(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse().map_err(|_| CascadeError::InvalidNumber {
                element,
                value: tok.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One-stage, one-stump cascade on a 24×24 window that fires when the
    /// right half of the window is brighter than the left half.
    pub(crate) const EDGE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0000000149011612e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 12 24 -1.</_>
        <_>
          12 0 12 24 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    pub(crate) fn half_split(width: u32, height: u32, split: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| if x < split { Luma([0]) } else { Luma([255]) })
    }

    #[test]
    fn test_parse_edge_cascade() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        assert_eq!(cascade.window_size(), (24, 24));
        assert_eq!(cascade.stage_count(), 1);
        assert_eq!(cascade.features.len(), 1);
        assert_eq!(cascade.features[0].rects.len(), 2);
        let stump = cascade.stages[0].classifiers[0].nodes[0];
        assert_eq!((stump.left, stump.right, stump.feature), (0, -1, 0));
    }

    #[test]
    fn test_window_on_edge_passes() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let gray = half_split(48, 24, 24);
        let integrals = Integrals::new(&gray);
        // Window x=12 spans 12..36: dark left half, bright right half.
        assert!(cascade.evaluate(&integrals, 12, 0));
    }

    #[test]
    fn test_uniform_window_rejected() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let gray = GrayImage::from_pixel(24, 24, Luma([128]));
        let integrals = Integrals::new(&gray);
        assert!(!cascade.evaluate(&integrals, 0, 0));
    }

    #[test]
    fn test_low_contrast_window_rejected() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let split = |dark: u8, bright: u8| {
            GrayImage::from_fn(24, 24, move |x, _| if x < 12 { Luma([dark]) } else { Luma([bright]) })
        };
        // Same edge polarity; stddev 5 is skipped, stddev 20 is scored.
        assert!(!cascade.evaluate(&Integrals::new(&split(120, 130)), 0, 0));
        assert!(cascade.evaluate(&Integrals::new(&split(100, 140)), 0, 0));
    }

    #[test]
    fn test_reversed_edge_rejected() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let gray = GrayImage::from_fn(24, 24, |x, _| if x < 12 { Luma([255]) } else { Luma([0]) });
        let integrals = Integrals::new(&gray);
        assert!(!cascade.evaluate(&integrals, 0, 0));
    }

    #[test]
    fn test_integral_rect_sum() {
        let gray = GrayImage::from_pixel(5, 4, Luma([2]));
        let integrals = Integrals::new(&gray);
        assert_eq!(integrals.sum(0, 0, 5, 4), 40);
        assert_eq!(integrals.sum(1, 1, 2, 2), 8);
        assert_eq!(integrals.squares(1, 1, 2, 2), 16);
    }

    #[test]
    fn test_old_style_cascade_rejected() {
        let xml = r#"<opencv_storage><haarcascade_frontalface type_id="opencv-haar-classifier"><size>24 24</size></haarcascade_frontalface></opencv_storage>"#;
        assert!(matches!(HaarCascade::from_xml(xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_tilted_feature_rejected() {
        let xml = EDGE_CASCADE.replace("</rects></_></features>", "</rects><tilted>1</tilted></_></features>");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_dangling_feature_index_rejected() {
        let xml = EDGE_CASCADE.replace("0 -1 0 1.0000000149011612e-01", "0 -1 3 1.0000000149011612e-01");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Inconsistent(_))));
    }

    #[test]
    fn test_rect_outside_window_rejected() {
        let xml = EDGE_CASCADE.replace("12 0 12 24 1.", "20 0 12 24 1.");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Inconsistent(_))));
    }

    #[test]
    fn test_bad_number_reported() {
        let xml = EDGE_CASCADE.replace("<width>24</width>", "<width>wide</width>");
        assert!(matches!(
            HaarCascade::from_xml(&xml),
            Err(CascadeError::InvalidNumber { element: "width", .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = HaarCascade::load("/nonexistent/cascade.xml").unwrap_err();
        assert!(matches!(err, CascadeError::Io { .. }));
    }
}
