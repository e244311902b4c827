//! Ordered asynchronous command streams and cross-stream signals.
//!
//! A [`Stream`] is a FIFO of commands executed by its own tokio task.
//! Enqueueing never blocks the caller. Commands run strictly in enqueue
//! order; after the first failure every later command is skipped, and
//! [`Stream::synchronize`] reports that failure.
//!
//! A [`Signal`] is a counting post/wait object. A post enqueued on a failed
//! stream poisons the signal instead of silently vanishing, so the waiting
//! stream fails too rather than hanging.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::error::{HcollError, Result};

enum Command {
    Task(BoxFuture<'static, Result<()>>),
    Post(Signal),
    Fence(oneshot::Sender<Option<String>>),
}

/// Handle to an ordered command stream. Clones share the same queue.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u32,
    tx: mpsc::UnboundedSender<Command>,
}

impl Stream {
    /// Create a stream and spawn its worker on the current tokio runtime.
    pub fn new(id: u32) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| HcollError::Internal(format!("stream {id} needs a tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_worker(id, rx));
        Ok(Self {
            inner: Arc::new(StreamInner { id, tx }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Append a command. Returns immediately.
    pub fn enqueue(&self, task: impl Future<Output = Result<()>> + Send + 'static) -> Result<()> {
        self.send(Command::Task(Box::pin(task)))
    }

    /// Append a post of `signal`.
    pub fn enqueue_post(&self, signal: &Signal) -> Result<()> {
        self.send(Command::Post(signal.clone()))
    }

    /// Append a wait on `signal`. Later commands run only after a matching
    /// post has executed.
    pub fn enqueue_wait(&self, signal: &Signal) -> Result<()> {
        let signal = signal.clone();
        self.enqueue(async move { signal.wait().await })
    }

    /// Wait until every previously enqueued command has finished.
    ///
    /// Returns the first error recorded on this stream, if any.
    pub async fn synchronize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Fence(tx))?;
        let failure = rx.await.map_err(|_| HcollError::StreamFailed {
            stream: self.id(),
            reason: "worker exited".into(),
        })?;
        match failure {
            Some(reason) => Err(HcollError::StreamFailed {
                stream: self.id(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.inner.tx.send(cmd).map_err(|_| HcollError::StreamFailed {
            stream: self.id(),
            reason: "worker exited".into(),
        })
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

async fn run_worker(id: u32, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut failure: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Task(task) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::warn!(stream = id, "stream command failed: {e}");
                    failure = Some(e.to_string());
                }
            }
            Command::Post(signal) => {
                if let Some(reason) = &failure {
                    signal.poison(format!("stream {id}: {reason}"));
                }
                signal.post();
            }
            Command::Fence(done) => {
                let _ = done.send(failure.clone());
            }
        }
    }
}

/// Counting cross-stream synchronization object.
#[derive(Clone)]
pub struct Signal {
    id: u32,
    inner: Arc<SignalInner>,
}

struct SignalInner {
    permits: Semaphore,
    poisoned: OnceLock<String>,
}

impl Signal {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            inner: Arc::new(SignalInner {
                permits: Semaphore::new(0),
                poisoned: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn post(&self) {
        self.inner.permits.add_permits(1);
    }

    fn poison(&self, reason: String) {
        let _ = self.inner.poisoned.set(reason);
    }

    pub(crate) async fn wait(&self) -> Result<()> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| HcollError::Internal(format!("signal {} closed", self.id)))?;
        permit.forget();
        match self.inner.poisoned.get() {
            Some(reason) => Err(HcollError::Internal(format!(
                "signal {} posted by failed {reason}",
                self.id
            ))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("id", &self.id).finish()
    }
}
