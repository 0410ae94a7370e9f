//! Access-control service: enrollment, verification and member management
//! on top of a gallery, a locator and a retrainable classifier.

use crate::classifier::ClassifierLifecycle;
use crate::decoder::ImageInput;
use crate::detector::FaceLocator;
use crate::gallery::{Gallery, GalleryError};
use crate::pipeline::{PipelineError, VerificationEngine, VerifyPolicy};
use crate::recognizer::Trainer;
use crate::types::{MemberId, MemberSummary, NewMember, Registration, VerificationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccessError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Gallery(#[from] GalleryError),

    #[error("invalid registration: {0}")]
    InvalidRegistration(&'static str),

    #[error("failed to encode member photo: {0}")]
    Encode(#[from] image::ImageError),
}

impl AccessError {
    /// True for errors caused by the request itself rather than by storage.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AccessError::Pipeline(_)
                | AccessError::InvalidRegistration(_)
                | AccessError::Gallery(GalleryError::DuplicateIdentity { .. })
                | AccessError::Gallery(GalleryError::NotFound(_))
        )
    }
}

/// Daemon health and model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub version: String,
    pub members: usize,
    pub trained: bool,
    pub threshold: f64,
    pub model_generation: u64,
}

pub struct AccessControl {
    gallery: Arc<dyn Gallery>,
    engine: VerificationEngine,
    classifier: ClassifierLifecycle,
}

impl AccessControl {
    /// Build the service and train once from the gallery's current contents.
    pub fn new(
        gallery: Arc<dyn Gallery>,
        locator: Arc<dyn FaceLocator>,
        trainer: impl Trainer + 'static,
        policy: VerifyPolicy,
    ) -> Result<Self, AccessError> {
        let service = Self {
            gallery,
            engine: VerificationEngine::new(locator, policy),
            classifier: ClassifierLifecycle::new(trainer),
        };
        let snapshot = service.classifier.refresh(service.gallery.as_ref())?;
        tracing::info!(
            members = snapshot.sample_count(),
            trained = snapshot.is_trained(),
            threshold = policy.threshold,
            "access control ready"
        );
        Ok(service)
    }

    /// Enroll a new member from a face image.
    ///
    /// Nothing is written when the image is rejected or the email is taken.
    pub fn enroll_member(&self, registration: Registration, image: ImageInput) -> Result<MemberId, AccessError> {
        let registration = registration.sanitized();
        if registration.first_name.is_empty() || registration.last_name.is_empty() {
            return Err(AccessError::InvalidRegistration("first and last name are required"));
        }
        if registration.email.is_empty() {
            return Err(AccessError::InvalidRegistration("email is required"));
        }

        let (template, display) = self.engine.enroll(image)?;
        let id = self.gallery.insert(NewMember {
            registration,
            template,
            display: Some(display),
        })?;
        tracing::info!(member_id = %id, "member enrolled");

        self.classifier.refresh(self.gallery.as_ref())?;
        Ok(id)
    }

    pub fn verify(&self, image: ImageInput) -> Result<VerificationResult, AccessError> {
        let snapshot = self.classifier.current();
        let result = self.engine.verify(image, &snapshot, self.gallery.as_ref())?;
        match (&result.member_id, &result.reason) {
            (Some(id), _) => tracing::info!(member_id = %id, distance = ?result.distance, "access granted"),
            (None, Some(reason)) => tracing::info!(%reason, distance = ?result.distance, "access denied"),
            (None, None) => {}
        }
        Ok(result)
    }

    /// Remove a member and retrain. Unknown ids are `NotFound` and do not retrain.
    pub fn delete_member(&self, id: MemberId) -> Result<(), AccessError> {
        if !self.gallery.delete(id)? {
            return Err(GalleryError::NotFound(id).into());
        }
        tracing::info!(member_id = %id, "member deleted");
        self.classifier.refresh(self.gallery.as_ref())?;
        Ok(())
    }

    pub fn list_members(&self) -> Result<Vec<MemberSummary>, AccessError> {
        Ok(self.gallery.list()?)
    }

    /// The member's display crop as JPEG.
    pub fn member_photo(&self, id: MemberId) -> Result<Vec<u8>, AccessError> {
        let display = self
            .gallery
            .display_image(id)?
            .ok_or(GalleryError::NotFound(id))?;
        Ok(display.to_jpeg()?)
    }

    pub fn status(&self) -> Result<ServiceStatus, AccessError> {
        let snapshot = self.classifier.current();
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            members: self.gallery.count()?,
            trained: snapshot.is_trained(),
            threshold: self.engine.policy().threshold,
            model_generation: snapshot.generation(),
        })
    }
}
