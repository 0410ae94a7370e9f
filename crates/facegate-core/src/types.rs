use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Side length of the canonical template and display crops.
pub const TEMPLATE_SIZE: u32 = 200;

const TEMPLATE_LEN: usize = (TEMPLATE_SIZE * TEMPLATE_SIZE) as usize;
const DISPLAY_LEN: usize = TEMPLATE_LEN * 3;

/// Gallery-assigned member identifier; doubles as the classifier label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub i64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width`×`height` frame. `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(FaceRegion::new(self.x, self.y, w, h))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected {expected} pixel bytes, got {actual}")]
pub struct PixelLengthError {
    pub expected: usize,
    pub actual: usize,
}

/// Normalized 200×200 grayscale face crop, the classifier's only input.
#[derive(Clone, PartialEq, Eq)]
pub struct FaceTemplate {
    pixels: Vec<u8>,
}

impl FaceTemplate {
    pub fn from_pixels(pixels: Vec<u8>) -> Result<Self, PixelLengthError> {
        if pixels.len() != TEMPLATE_LEN {
            return Err(PixelLengthError {
                expected: TEMPLATE_LEN,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels })
    }

    pub(crate) fn from_image(image: GrayImage) -> Self {
        debug_assert_eq!(image.dimensions(), (TEMPLATE_SIZE, TEMPLATE_SIZE));
        Self {
            pixels: image.into_raw(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, self.pixels.clone())
            .unwrap_or_else(|| GrayImage::new(TEMPLATE_SIZE, TEMPLATE_SIZE))
    }
}

impl fmt::Debug for FaceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceTemplate")
            .field("size", &TEMPLATE_SIZE)
            .finish_non_exhaustive()
    }
}

/// 200×200 RGB face crop kept for people, never for the classifier.
#[derive(Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pixels: Vec<u8>,
}

impl DisplayImage {
    pub fn from_pixels(pixels: Vec<u8>) -> Result<Self, PixelLengthError> {
        if pixels.len() != DISPLAY_LEN {
            return Err(PixelLengthError {
                expected: DISPLAY_LEN,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels })
    }

    pub(crate) fn from_image(image: RgbImage) -> Self {
        debug_assert_eq!(image.dimensions(), (TEMPLATE_SIZE, TEMPLATE_SIZE));
        Self {
            pixels: image.into_raw(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn to_image(&self) -> RgbImage {
        RgbImage::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, self.pixels.clone())
            .unwrap_or_else(|| RgbImage::new(TEMPLATE_SIZE, TEMPLATE_SIZE))
    }

    /// Encode as a baseline JPEG for display surfaces.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = std::io::Cursor::new(Vec::new());
        self.to_image()
            .write_to(&mut out, image::ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }
}

impl fmt::Debug for DisplayImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayImage")
            .field("size", &TEMPLATE_SIZE)
            .finish_non_exhaustive()
    }
}

/// Identity fields supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl Registration {
    /// Trim names and email, collapse runs of whitespace inside names, and
    /// drop an empty phone number.
    pub fn sanitized(&self) -> Registration {
        Registration {
            first_name: collapse_whitespace(&self.first_name),
            last_name: collapse_whitespace(&self.last_name),
            email: self.email.trim().to_string(),
            phone: self
                .phone
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A member about to be written to the gallery.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub registration: Registration,
    pub template: FaceTemplate,
    pub display: Option<DisplayImage>,
}

/// A persisted member with its template.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub id: MemberId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub registered_at: String,
    pub template: FaceTemplate,
    pub display: Option<DisplayImage>,
}

impl MemberRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Listing view of a member, without image payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: MemberId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub registered_at: String,
    pub has_photo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}

/// Why a verification was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    GalleryEmpty,
    NoFaceDetected,
    Undecodable { detail: String },
    NoMatch,
    MemberRemoved,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::GalleryEmpty => write!(f, "gallery empty"),
            RejectReason::NoFaceDetected => write!(f, "no face detected in the image"),
            RejectReason::Undecodable { detail } => write!(f, "could not decode image: {detail}"),
            RejectReason::NoMatch => write!(f, "face not recognized"),
            RejectReason::MemberRemoved => write!(f, "matched member no longer enrolled"),
        }
    }
}

/// Outcome of a single verification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub decision: Decision,
    pub member_id: Option<MemberId>,
    pub member_name: Option<String>,
    /// Recognizer distance of the nearest label; absent when no prediction ran.
    pub distance: Option<f64>,
    pub reason: Option<RejectReason>,
}

impl VerificationResult {
    pub fn accepted(member: &MemberRecord, distance: f64) -> Self {
        Self {
            decision: Decision::Accepted,
            member_id: Some(member.id),
            member_name: Some(member.display_name()),
            distance: Some(distance),
            reason: None,
        }
    }

    pub fn rejected(reason: RejectReason, distance: Option<f64>) -> Self {
        Self {
            decision: Decision::Rejected,
            member_id: None,
            member_name: None,
            distance,
            reason: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.decision == Decision::Accepted
    }
}
