//! Gallery: the persistent source of truth for enrolled members.

use crate::types::{DisplayImage, FaceTemplate, MemberId, MemberRecord, MemberSummary, NewMember};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("a member with email {email} is already enrolled")]
    DuplicateIdentity { email: String },

    #[error("no member with id {0}")]
    NotFound(MemberId),

    #[error("gallery unavailable: {0}")]
    Unavailable(#[source] BoxError),

    #[error("gallery record {id} is corrupt: {message}")]
    Corrupt { id: MemberId, message: String },
}

impl GalleryError {
    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        GalleryError::Unavailable(err.into())
    }
}

/// Member storage consulted by enrollment, verification and retraining.
///
/// Implementations serialize their own writes. Email is the deduplication
/// key; a second insert with the same email fails with
/// [`GalleryError::DuplicateIdentity`] and writes nothing.
pub trait Gallery: Send + Sync {
    fn insert(&self, member: NewMember) -> Result<MemberId, GalleryError>;

    /// Every stored template with its label, in id order.
    fn all_templates(&self) -> Result<Vec<(MemberId, FaceTemplate)>, GalleryError>;

    fn by_id(&self, id: MemberId) -> Result<Option<MemberRecord>, GalleryError>;

    /// Remove a member. `false` when no such member existed.
    fn delete(&self, id: MemberId) -> Result<bool, GalleryError>;

    /// Summaries of every member, in id order.
    fn list(&self) -> Result<Vec<MemberSummary>, GalleryError>;

    fn display_image(&self, id: MemberId) -> Result<Option<DisplayImage>, GalleryError>;

    fn count(&self) -> Result<usize, GalleryError> {
        Ok(self.list()?.len())
    }
}

/// In-process gallery, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryGallery {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    last_id: i64,
    members: BTreeMap<MemberId, MemberRecord>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, GalleryError> {
        self.inner
            .lock()
            .map_err(|_| GalleryError::unavailable("memory gallery lock poisoned"))
    }
}

impl Gallery for MemoryGallery {
    fn insert(&self, member: NewMember) -> Result<MemberId, GalleryError> {
        let mut state = self.state()?;
        let email = member.registration.email;
        if state
            .members
            .values()
            .any(|m| m.email.eq_ignore_ascii_case(&email))
        {
            return Err(GalleryError::DuplicateIdentity { email });
        }

        state.last_id += 1;
        let id = MemberId(state.last_id);
        let record = MemberRecord {
            id,
            first_name: member.registration.first_name,
            last_name: member.registration.last_name,
            email,
            phone: member.registration.phone,
            registered_at: chrono::Utc::now().to_rfc3339(),
            template: member.template,
            display: member.display,
        };
        state.members.insert(id, record);
        Ok(id)
    }

    fn all_templates(&self) -> Result<Vec<(MemberId, FaceTemplate)>, GalleryError> {
        Ok(self
            .state()?
            .members
            .values()
            .map(|m| (m.id, m.template.clone()))
            .collect())
    }

    fn by_id(&self, id: MemberId) -> Result<Option<MemberRecord>, GalleryError> {
        Ok(self.state()?.members.get(&id).cloned())
    }

    fn delete(&self, id: MemberId) -> Result<bool, GalleryError> {
        Ok(self.state()?.members.remove(&id).is_some())
    }

    fn list(&self) -> Result<Vec<MemberSummary>, GalleryError> {
        Ok(self
            .state()?
            .members
            .values()
            .map(|m| MemberSummary {
                id: m.id,
                first_name: m.first_name.clone(),
                last_name: m.last_name.clone(),
                email: m.email.clone(),
                phone: m.phone.clone(),
                registered_at: m.registered_at.clone(),
                has_photo: m.display.is_some(),
            })
            .collect())
    }

    fn display_image(&self, id: MemberId) -> Result<Option<DisplayImage>, GalleryError> {
        Ok(self.state()?.members.get(&id).and_then(|m| m.display.clone()))
    }

    fn count(&self) -> Result<usize, GalleryError> {
        Ok(self.state()?.members.len())
    }
}
