//! Verification engine: decode, locate, normalize, classify, threshold.

use crate::classifier::ClassifierSnapshot;
use crate::decoder::{self, DecodeError, ImageInput};
use crate::detector::{select_largest, to_luma, FaceLocator};
use crate::gallery::{Gallery, GalleryError};
use crate::normalizer;
use crate::types::{DisplayImage, FaceRegion, FaceTemplate, RejectReason, VerificationResult};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no face detected in the image")]
    NoFaceDetected,
}

impl PipelineError {
    fn reject_reason(&self) -> RejectReason {
        match self {
            PipelineError::Decode(e) => RejectReason::Undecodable {
                detail: e.to_string(),
            },
            PipelineError::NoFaceDetected => RejectReason::NoFaceDetected,
        }
    }
}

/// Acceptance rule for a recognizer distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Distances strictly below this are a match.
    pub threshold: f64,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self { threshold: 70.0 }
    }
}

impl VerifyPolicy {
    pub fn accepts(&self, distance: f64) -> bool {
        distance < self.threshold
    }
}

/// A located face ready for normalization.
struct LocatedFace {
    luma: GrayImage,
    color: RgbImage,
    region: FaceRegion,
}

pub struct VerificationEngine {
    locator: Arc<dyn FaceLocator>,
    policy: VerifyPolicy,
}

impl VerificationEngine {
    pub fn new(locator: Arc<dyn FaceLocator>, policy: VerifyPolicy) -> Self {
        Self { locator, policy }
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    /// Produce the template and display crop for a new member.
    ///
    /// Touches neither the gallery nor the classifier.
    pub fn enroll(&self, input: ImageInput) -> Result<(FaceTemplate, DisplayImage), PipelineError> {
        let face = self.locate(input)?;
        Ok(normalizer::normalize(&face.luma, &face.color, face.region))
    }

    /// Decide whether `input` shows an enrolled member.
    ///
    /// Undecodable images and frames without a face are rejections, not
    /// errors. Only a gallery fault during the existence check fails.
    pub fn verify(
        &self,
        input: ImageInput,
        classifier: &ClassifierSnapshot,
        gallery: &dyn Gallery,
    ) -> Result<VerificationResult, GalleryError> {
        if !classifier.is_trained() {
            return Ok(VerificationResult::rejected(RejectReason::GalleryEmpty, None));
        }

        let face = match self.locate(input) {
            Ok(face) => face,
            Err(e) => {
                tracing::debug!(error = %e, "verification image rejected");
                return Ok(VerificationResult::rejected(e.reject_reason(), None));
            }
        };
        let probe = normalizer::template(&face.luma, face.region);

        let Some(prediction) = classifier.predict(&probe) else {
            return Ok(VerificationResult::rejected(RejectReason::GalleryEmpty, None));
        };
        let distance = prediction.distance;
        tracing::debug!(label = %prediction.label, distance, "nearest gallery member");

        if !self.policy.accepts(distance) {
            return Ok(VerificationResult::rejected(RejectReason::NoMatch, Some(distance)));
        }

        match gallery.by_id(prediction.label)? {
            Some(member) => Ok(VerificationResult::accepted(&member, distance)),
            None => {
                tracing::warn!(member_id = %prediction.label, "model matched a member missing from the gallery");
                Ok(VerificationResult::rejected(RejectReason::MemberRemoved, Some(distance)))
            }
        }
    }

    fn locate(&self, input: ImageInput) -> Result<LocatedFace, PipelineError> {
        let color = decoder::decode(input)?;
        let luma = to_luma(&color);
        let regions = self.locator.locate(&luma);
        let (w, h) = luma.dimensions();
        let region = select_largest(&regions)
            .and_then(|r| r.clamp_to(w, h))
            .ok_or(PipelineError::NoFaceDetected)?;
        tracing::debug!(
            faces = regions.len(),
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            "face selected"
        );
        Ok(LocatedFace { luma, color, region })
    }
}
