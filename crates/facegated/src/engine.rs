use facegate_core::{
    AccessControl, AccessError, ImageInput, MemberId, MemberSummary, Registration, ServiceStatus,
    VerificationResult,
};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, AccessError>>;

/// Messages sent from D-Bus handlers to the worker threads.
enum EngineRequest {
    Enroll {
        registration: Registration,
        image: ImageInput,
        reply: Reply<MemberId>,
    },
    Verify {
        image: ImageInput,
        reply: Reply<VerificationResult>,
    },
    Delete {
        id: MemberId,
        reply: Reply<()>,
    },
    List {
        reply: Reply<Vec<MemberSummary>>,
    },
    Photo {
        id: MemberId,
        reply: Reply<Vec<u8>>,
    },
    Status {
        reply: Reply<ServiceStatus>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Run the enrollment pipeline and store the new member.
    pub async fn enroll(&self, registration: Registration, image: ImageInput) -> Result<MemberId, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            registration,
            image,
            reply,
        })
        .await
    }

    pub async fn verify(&self, image: ImageInput) -> Result<VerificationResult, EngineError> {
        self.request(|reply| EngineRequest::Verify { image, reply }).await
    }

    pub async fn delete(&self, id: MemberId) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Delete { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<MemberSummary>, EngineError> {
        self.request(|reply| EngineRequest::List { reply }).await
    }

    pub async fn photo(&self, id: MemberId) -> Result<Vec<u8>, EngineError> {
        self.request(|reply| EngineRequest::Photo { id, reply }).await
    }

    pub async fn status(&self) -> Result<ServiceStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn `workers` OS threads that run pipeline requests against `service`.
///
/// Decoding, detection and training are CPU-bound and never run on the
/// async runtime. At most `queue_depth` requests wait for a free worker;
/// further callers wait on send.
pub fn spawn_engine(
    service: Arc<AccessControl>,
    workers: usize,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for n in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let service = Arc::clone(&service);
        std::thread::Builder::new()
            .name(format!("facegate-worker-{n}"))
            .spawn(move || {
                tracing::debug!(worker = n, "engine worker started");
                loop {
                    // Only one idle worker waits on the channel; the rest wait here.
                    let next = match rx.lock() {
                        Ok(mut guard) => guard.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(req) = next else { break };
                    handle(&service, req);
                }
                tracing::debug!(worker = n, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }
    tracing::info!(workers, queue_depth, "engine started");

    Ok(EngineHandle { tx })
}

fn handle(service: &AccessControl, req: EngineRequest) {
    match req {
        EngineRequest::Enroll {
            registration,
            image,
            reply,
        } => {
            let _ = reply.send(service.enroll_member(registration, image));
        }
        EngineRequest::Verify { image, reply } => {
            let _ = reply.send(service.verify(image));
        }
        EngineRequest::Delete { id, reply } => {
            let _ = reply.send(service.delete_member(id));
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(service.list_members());
        }
        EngineRequest::Photo { id, reply } => {
            let _ = reply.send(service.member_photo(id));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(service.status());
        }
    }
}
