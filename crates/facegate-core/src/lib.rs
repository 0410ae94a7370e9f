//! facegate-core: Face identity pipeline for event access control.
//!
//! Haar cascade face location, histogram-equalized 200×200 templates and an
//! LBPH recognizer that is retrained from the gallery on every change.

pub mod cascade;
pub mod classifier;
pub mod decoder;
pub mod detector;
pub mod gallery;
pub mod normalizer;
pub mod pipeline;
pub mod recognizer;
pub mod service;
pub mod types;

pub use cascade::{CascadeError, HaarCascade};
pub use classifier::{ClassifierLifecycle, ClassifierSnapshot};
pub use decoder::{DecodeError, ImageInput};
pub use detector::{CascadeLocator, FaceLocator, LocatorParams};
pub use gallery::{Gallery, GalleryError, MemoryGallery};
pub use pipeline::{PipelineError, VerificationEngine, VerifyPolicy};
pub use recognizer::{LbphParams, LbphTrainer, Prediction, Recognizer, Trainer};
pub use service::{AccessControl, AccessError, ServiceStatus};
pub use types::{
    Decision, DisplayImage, FaceRegion, FaceTemplate, MemberId, MemberRecord, MemberSummary,
    NewMember, Registration, RejectReason, VerificationResult,
};
