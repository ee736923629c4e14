use chrono::NaiveDateTime;
use facegate_core::history::HistoryError;
use facegate_core::shift::ShiftError;
use facegate_core::store::{CheckinRecord, CheckinSink, IdentityStore, ReferenceStore, StoreError};
use facegate_core::{
    CheckinEvent, EmbedderError, FaceEmbedder, FaceEncoder, Identity, LifecycleError,
    ReferenceImage, ReferenceManager, ResetOutcome, Shift, Verification, VerifyError,
    VerifyRequest, Verifier,
};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests the pool accepts before senders wait.
const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face model unavailable: {0}")]
    Startup(EmbedderError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Shift(#[from] ShiftError),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("engine workers exited")]
    ChannelClosed,
}

impl EngineError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::Lifecycle(e) => e.reason_code(),
            EngineError::Verify(e) => e.reason_code(),
            EngineError::History(e) => e.reason_code(),
            EngineError::Shift(e) => e.reason_code(),
            _ => "transient_io_failure",
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    Register {
        identity_id: String,
        image: Vec<u8>,
        at: NaiveDateTime,
        reply: Reply<ReferenceImage>,
    },
    Update {
        identity_id: String,
        image: Vec<u8>,
        at: NaiveDateTime,
        reply: Reply<ReferenceImage>,
    },
    Reset {
        identity_id: String,
        reply: Reply<ResetOutcome>,
    },
    Verify {
        request: VerifyRequest,
        reply: Reply<Verification>,
    },
}

impl EngineRequest {
    fn kind(&self) -> &'static str {
        match self {
            EngineRequest::Register { .. } => "register",
            EngineRequest::Update { .. } => "update",
            EngineRequest::Reset { .. } => "reset",
            EngineRequest::Verify { .. } => "verify",
        }
    }

    /// The caller stopped waiting (timed out or disconnected).
    fn abandoned(&self) -> bool {
        match self {
            EngineRequest::Register { reply, .. } | EngineRequest::Update { reply, .. } => {
                reply.is_closed()
            }
            EngineRequest::Reset { reply, .. } => reply.is_closed(),
            EngineRequest::Verify { reply, .. } => reply.is_closed(),
        }
    }
}

/// Store view for one request; writes are refused once its caller has gone.
struct CallerGate<'a, S: ?Sized> {
    store: &'a S,
    live: &'a dyn Fn() -> bool,
}

impl<S: ?Sized> CallerGate<'_, S> {
    fn admit(&self, identity_id: &str) -> Result<(), StoreError> {
        if (self.live)() {
            return Ok(());
        }
        tracing::warn!(identity = identity_id, "caller gone before write; nothing stored");
        Err(StoreError::Backend("request abandoned by caller".into()))
    }
}

impl<S: IdentityStore + ?Sized> IdentityStore for CallerGate<'_, S> {
    fn identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        self.store.identity(id)
    }

    fn shift(&self, id: &str) -> Result<Option<Shift>, StoreError> {
        self.store.shift(id)
    }
}

impl<S: ReferenceStore + ?Sized> ReferenceStore for CallerGate<'_, S> {
    fn attachments(&self, identity_id: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        self.store.attachments(identity_id)
    }

    fn install(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        self.admit(identity_id)?;
        self.store.install(identity_id, content, at)
    }

    fn replace(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        self.admit(identity_id)?;
        self.store.replace(identity_id, content, at)
    }

    fn clear(&self, identity_id: &str) -> Result<usize, StoreError> {
        self.admit(identity_id)?;
        self.store.clear(identity_id)
    }
}

impl<S: CheckinSink + ?Sized> CheckinSink for CallerGate<'_, S> {
    fn record(&self, event: &CheckinEvent) -> Result<CheckinRecord, StoreError> {
        self.admit(&event.identity_id)?;
        self.store.record(event)
    }
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn register(
        &self,
        identity_id: String,
        image: Vec<u8>,
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, EngineError> {
        self.call(|reply| EngineRequest::Register {
            identity_id,
            image,
            at,
            reply,
        })
        .await
    }

    pub async fn update(
        &self,
        identity_id: String,
        image: Vec<u8>,
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, EngineError> {
        self.call(|reply| EngineRequest::Update {
            identity_id,
            image,
            at,
            reply,
        })
        .await
    }

    pub async fn reset(&self, identity_id: String) -> Result<ResetOutcome, EngineError> {
        self.call(|reply| EngineRequest::Reset { identity_id, reply })
            .await
    }

    pub async fn verify(&self, request: VerifyRequest) -> Result<Verification, EngineError> {
        self.call(|reply| EngineRequest::Verify { request, reply })
            .await
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn `workers` engine threads sharing one request queue.
///
/// Each worker gets its own embedder from `load_embedder`; models are
/// loaded here, before any thread starts, so a missing model fails startup.
pub fn spawn_engine<S, E, F>(
    store: Arc<S>,
    workers: usize,
    load_embedder: F,
) -> Result<EngineHandle, EngineError>
where
    S: IdentityStore + ReferenceStore + CheckinSink + Send + Sync + 'static,
    E: FaceEmbedder + Send + 'static,
    F: Fn() -> Result<E, EmbedderError>,
{
    let workers = workers.max(1);
    let mut encoders = Vec::with_capacity(workers);
    for _ in 0..workers {
        encoders.push(FaceEncoder::new(load_embedder().map_err(EngineError::Startup)?));
    }
    tracing::info!(workers, "face models loaded");

    let (tx, rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));

    for (n, encoder) in encoders.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        let store = Arc::clone(&store);
        std::thread::Builder::new()
            .name(format!("facegate-engine-{n}"))
            .spawn(move || worker_loop(n, &rx, &*store, encoder))?;
    }

    Ok(EngineHandle { tx, workers })
}

fn worker_loop<S, E>(
    n: usize,
    rx: &Mutex<mpsc::Receiver<EngineRequest>>,
    store: &S,
    mut encoder: FaceEncoder<E>,
) where
    S: IdentityStore + ReferenceStore + CheckinSink + ?Sized,
    E: FaceEmbedder,
{
    tracing::info!(worker = n, "engine worker started");
    loop {
        // Only the lock holder waits on the channel; the guard drops once a request arrives.
        let next = match rx.lock() {
            Ok(mut guard) => guard.blocking_recv(),
            Err(_) => None,
        };
        let Some(req) = next else { break };
        handle(store, &mut encoder, req);
    }
    tracing::info!(worker = n, "engine worker exiting");
}

fn handle<S, E>(store: &S, encoder: &mut FaceEncoder<E>, req: EngineRequest)
where
    S: IdentityStore + ReferenceStore + CheckinSink + ?Sized,
    E: FaceEmbedder,
{
    if req.abandoned() {
        tracing::warn!(request = req.kind(), "caller gone before start; request skipped");
        return;
    }
    match req {
        EngineRequest::Register {
            identity_id,
            image,
            at,
            reply,
        } => {
            let result = {
                let live = || !reply.is_closed();
                let gate = CallerGate { store, live: &live };
                ReferenceManager::new(&gate, encoder).register(&identity_id, image, at)
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::Update {
            identity_id,
            image,
            at,
            reply,
        } => {
            let result = {
                let live = || !reply.is_closed();
                let gate = CallerGate { store, live: &live };
                ReferenceManager::new(&gate, encoder).update(&identity_id, image, at)
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::Reset { identity_id, reply } => {
            let result = {
                let live = || !reply.is_closed();
                let gate = CallerGate { store, live: &live };
                ReferenceManager::new(&gate, encoder).reset(&identity_id)
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::Verify { request, reply } => {
            let result = {
                let live = || !reply.is_closed();
                let gate = CallerGate { store, live: &live };
                Verifier::new(&gate, encoder).verify(request)
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
    }
}
