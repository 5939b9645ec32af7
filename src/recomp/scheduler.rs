//! Compilation scheduling.
//!
//! The controller hands [`CompileRequest`]s to a [`CompilationScheduler`]
//! and gets back a [`CompileTicket`], a future that resolves once the
//! request has been compiled. [`QueueScheduler`] is a bounded queue
//! drained by tokio worker tasks that run a [`CompileBackend`] on the
//! blocking pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::body::{Hotness, PersistentMethodInfo};
use crate::jit::body_builder::BodyTemplate;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("compilation queue is full")]
    SchedulingFull,

    #[error("compilation scheduler has shut down")]
    Closed,

    #[error("compilation failed: {0}")]
    Error(String),
}

/// A request to recompile one method.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub method: Arc<PersistentMethodInfo>,
    /// Start address of the body being replaced.
    pub old_start: u64,
    pub level: Hotness,
    /// Compile with profiling instrumentation.
    pub profiling: bool,
    /// Method generation at submission.
    pub generation: u64,
}

/// A compiled replacement body, not yet placed in a code cache.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub level: Hotness,
    pub template: BodyTemplate,
}

type Completion = Result<CompileResult, SchedulingError>;

/// Resolves to the outcome of a submitted request.
#[derive(Debug)]
pub struct CompileTicket {
    rx: oneshot::Receiver<Completion>,
}

/// Sending half of a [`CompileTicket`].
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<Completion>,
}

impl CompletionSender {
    /// Deliver the outcome. Returns false if the ticket was dropped.
    pub fn complete(self, result: Completion) -> bool {
        self.tx.send(result).is_ok()
    }
}

impl CompileTicket {
    pub fn pair() -> (CompletionSender, CompileTicket) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { tx }, CompileTicket { rx })
    }

    /// A ticket that is already resolved.
    pub fn ready(result: Completion) -> Self {
        let (tx, ticket) = Self::pair();
        tx.complete(result);
        ticket
    }
}

impl Future for CompileTicket {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SchedulingError::Closed)))
    }
}

pub trait CompilationScheduler: Send + Sync {
    fn submit(&self, request: CompileRequest) -> Result<CompileTicket, SchedulingError>;
}

/// The optimizer behind a [`QueueScheduler`].
pub trait CompileBackend: Send + Sync + 'static {
    fn compile(&self, request: &CompileRequest) -> Result<CompileResult, SchedulingError>;
}

struct Job {
    request: CompileRequest,
    done: CompletionSender,
}

/// A bounded compilation queue served by worker tasks.
pub struct QueueScheduler {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl QueueScheduler {
    /// Start `workers` worker tasks on `handle`.
    pub fn start(
        handle: &Handle,
        backend: Arc<dyn CompileBackend>,
        capacity: usize,
        workers: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let backend = Arc::clone(&backend);
                handle.spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(Job { request, done }) = job else {
                            break;
                        };
                        tracing::debug!(
                            worker,
                            method = %request.method.id(),
                            level = %request.level,
                            "compiling"
                        );
                        let backend = Arc::clone(&backend);
                        let result = tokio::task::spawn_blocking(move || backend.compile(&request))
                            .await
                            .unwrap_or_else(|e| Err(SchedulingError::Error(e.to_string())));
                        done.complete(result);
                    }
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Stop accepting requests and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl CompilationScheduler for QueueScheduler {
    fn submit(&self, request: CompileRequest) -> Result<CompileTicket, SchedulingError> {
        let (done, ticket) = CompileTicket::pair();
        self.tx.try_send(Job { request, done }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SchedulingError::SchedulingFull,
            mpsc::error::TrySendError::Closed(_) => SchedulingError::Closed,
        })?;
        Ok(ticket)
    }
}
