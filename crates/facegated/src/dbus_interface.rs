use crate::engine::{EngineError, EngineHandle};
use facegate_core::{ImageInput, MemberId, Registration};
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.facegate.AccessControl1";
pub const OBJECT_PATH: &str = "/org/facegate/AccessControl1";

/// D-Bus interface for the facegate access-control daemon.
///
/// Bus name: org.facegate.AccessControl1
/// Object path: /org/facegate/AccessControl1
///
/// Image arguments carry encoded image bytes or the UTF-8 text of a
/// `data:` URL. Structured replies are JSON strings.
pub struct AccessService {
    engine: EngineHandle,
}

impl AccessService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facegate.AccessControl1")]
impl AccessService {
    /// Enroll a new member from a face image. Returns the member id.
    async fn enroll(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
        phone: &str,
        image: Vec<u8>,
    ) -> fdo::Result<i64> {
        tracing::info!(email, bytes = image.len(), "enroll requested");
        let registration = Registration {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            phone: Some(phone.to_string()),
        };
        let id = self
            .engine
            .enroll(registration, image_input(image))
            .await
            .map_err(to_fdo)?;
        Ok(id.0)
    }

    /// Verify a face image against the gallery. Returns the result as JSON.
    async fn verify(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "verify requested");
        let result = self.engine.verify(image_input(image)).await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Remove a member and retrain.
    async fn remove_member(&self, member_id: i64) -> fdo::Result<bool> {
        tracing::info!(member_id, "remove_member requested");
        self.engine
            .delete(MemberId(member_id))
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// List enrolled members as JSON.
    async fn list_members(&self) -> fdo::Result<String> {
        let members = self.engine.list().await.map_err(to_fdo)?;
        to_json(&members)
    }

    /// A member's display photo as JPEG bytes.
    async fn member_photo(&self, member_id: i64) -> fdo::Result<Vec<u8>> {
        self.engine
            .photo(MemberId(member_id))
            .await
            .map_err(to_fdo)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

fn image_input(payload: Vec<u8>) -> ImageInput {
    if payload.starts_with(b"data:") {
        match String::from_utf8(payload) {
            Ok(url) => ImageInput::DataUrl(url),
            Err(e) => ImageInput::Encoded(e.into_bytes()),
        }
    } else {
        ImageInput::Encoded(payload)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

/// Request-level rejections are `InvalidArgs`; storage and engine faults are `Failed`.
fn to_fdo(err: EngineError) -> fdo::Error {
    match &err {
        EngineError::Access(e) if e.is_rejection() => {
            tracing::info!(error = %e, "request rejected");
            fdo::Error::InvalidArgs(e.to_string())
        }
        EngineError::Access(_) => {
            tracing::error!(error = %err, "request failed");
            fdo::Error::Failed(err.to_string())
        }
        EngineError::Spawn(_) | EngineError::ChannelClosed => {
            tracing::error!(error = %err, "engine unavailable");
            fdo::Error::Failed(err.to_string())
        }
    }
}
