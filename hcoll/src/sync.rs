//! Main/auxiliary stream synchronization.
//!
//! Every cross-stream edge is emitted by [`sync_edge`], which always enqueues
//! the post on the source stream together with the wait on the destination
//! stream. [`start_aux`] and [`finish_aux`] are the fan-out and fan-in
//! barriers built from it. Templates never post or wait on their own.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::error::{HcollError, Result};
use crate::memory::DeviceMem;
use crate::reduce::reduce_slice;
use crate::stream::{Signal, Stream};
use crate::types::{DataType, ReduceOp};

/// Kind of command handed to a stream by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Post,
    Wait,
    Memcpy,
    Reduce,
}

/// One dispatched command, reported to a [`TaskObserver`] at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub kind: TaskKind,
    pub stream: u32,
    pub signal: Option<u32>,
    pub bytes: usize,
}

/// Observer notified of every command the dispatcher enqueues.
pub trait TaskObserver: Send + Sync {
    fn on_task(&self, event: &TaskEvent);
}

/// Lock-free recording observer.
#[derive(Default)]
pub struct TaskLog {
    events: SegQueue<TaskEvent>,
}

impl TaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all recorded events in arrival order.
    pub fn drain(&self) -> Vec<TaskEvent> {
        let mut out = Vec::with_capacity(self.events.len());
        while let Some(e) = self.events.pop() {
            out.push(e);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl TaskObserver for TaskLog {
    fn on_task(&self, event: &TaskEvent) {
        self.events.push(event.clone());
    }
}

/// Issues synchronization, copy and reduce commands onto streams.
pub trait Dispatcher: Send + Sync {
    /// Enqueue a post of `signal` on `stream`.
    fn post(&self, stream: &Stream, signal: &Signal) -> Result<()>;

    /// Enqueue a wait on `signal` on `stream`.
    fn wait(&self, stream: &Stream, signal: &Signal) -> Result<()>;

    /// Enqueue a device-to-device copy. Lengths must match.
    fn memcpy_async(&self, stream: &Stream, dst: &DeviceMem, src: &DeviceMem) -> Result<()>;

    /// Enqueue `dst = op(dst, src)` element-wise.
    fn reduce_async(
        &self,
        stream: &Stream,
        dst: &DeviceMem,
        src: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()>;
}

/// Dispatcher that runs commands on the host stream workers.
#[derive(Default, Clone)]
pub struct HostDispatcher {
    observer: Option<Arc<dyn TaskObserver>>,
}

impl HostDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Arc<dyn TaskObserver>) -> Self {
        Self {
            observer: Some(observer),
        }
    }

    fn notify(&self, kind: TaskKind, stream: &Stream, signal: Option<&Signal>, bytes: usize) {
        if let Some(obs) = &self.observer {
            obs.on_task(&TaskEvent {
                kind,
                stream: stream.id(),
                signal: signal.map(Signal::id),
                bytes,
            });
        }
    }
}

impl Dispatcher for HostDispatcher {
    fn post(&self, stream: &Stream, signal: &Signal) -> Result<()> {
        stream.enqueue_post(signal)?;
        self.notify(TaskKind::Post, stream, Some(signal), 0);
        Ok(())
    }

    fn wait(&self, stream: &Stream, signal: &Signal) -> Result<()> {
        stream.enqueue_wait(signal)?;
        self.notify(TaskKind::Wait, stream, Some(signal), 0);
        Ok(())
    }

    fn memcpy_async(&self, stream: &Stream, dst: &DeviceMem, src: &DeviceMem) -> Result<()> {
        if dst.len() != src.len() {
            return Err(HcollError::BufferSizeMismatch {
                expected: dst.len(),
                actual: src.len(),
            });
        }
        if dst.is_empty() || (dst.same_allocation(src) && dst.offset() == src.offset()) {
            return Ok(());
        }
        let (dst, src) = (dst.clone(), src.clone());
        let bytes = dst.len();
        stream.enqueue(async move { dst.copy_from(&src) })?;
        self.notify(TaskKind::Memcpy, stream, None, bytes);
        Ok(())
    }

    fn reduce_async(
        &self,
        stream: &Stream,
        dst: &DeviceMem,
        src: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        if dst.len() != src.len() {
            return Err(HcollError::BufferSizeMismatch {
                expected: dst.len(),
                actual: src.len(),
            });
        }
        if dst.is_empty() {
            return Ok(());
        }
        let (dst, src) = (dst.clone(), src.clone());
        let bytes = dst.len();
        stream.enqueue(async move {
            let incoming = src.read()?;
            dst.update(|bytes| reduce_slice(bytes, &incoming, dtype, op))
        })?;
        self.notify(TaskKind::Reduce, stream, None, bytes);
        Ok(())
    }
}

/// Happens-before edge from work enqueued on `from` to work enqueued on `to`.
pub fn sync_edge(
    dispatcher: &dyn Dispatcher,
    from: &Stream,
    to: &Stream,
    signal: &Signal,
) -> Result<()> {
    dispatcher.post(from, signal)?;
    dispatcher.wait(to, signal)
}

/// Fan-out barrier: each auxiliary stream starts after the main stream's
/// prior work.
pub fn start_aux(
    dispatcher: &dyn Dispatcher,
    main: &Stream,
    aux: &[Stream],
    main_to_aux: &[Signal],
) -> Result<()> {
    check_signals(aux, main_to_aux)?;
    for (stream, signal) in aux.iter().zip(main_to_aux) {
        sync_edge(dispatcher, main, stream, signal)?;
    }
    Ok(())
}

/// Fan-in barrier: the main stream continues after every auxiliary
/// stream's prior work.
pub fn finish_aux(
    dispatcher: &dyn Dispatcher,
    main: &Stream,
    aux: &[Stream],
    aux_to_main: &[Signal],
) -> Result<()> {
    check_signals(aux, aux_to_main)?;
    for (stream, signal) in aux.iter().zip(aux_to_main) {
        sync_edge(dispatcher, stream, main, signal)?;
    }
    Ok(())
}

fn check_signals(aux: &[Stream], signals: &[Signal]) -> Result<()> {
    if signals.len() < aux.len() {
        return Err(HcollError::InsufficientSignals {
            required: aux.len(),
            available: signals.len(),
        });
    }
    Ok(())
}
