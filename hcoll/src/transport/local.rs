//! In-process transport: every (channel, src, dst) triple owns a mailbox
//! with separate lanes for data, acks and data signals.
//!
//! Both endpoints of a link resolve the same mailbox lazily through the
//! shared fabric, so ranks running as separate tokio tasks can build their
//! topologies independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::HcollConfig;
use crate::error::{HcollError, Result};
use crate::link::{Link, LinkRef, LinkType};
use crate::memory::DeviceMem;
use crate::stream::Stream;
use crate::topology::CommPlane;
use crate::types::{Rank, UserMemType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MailboxKey {
    plane: CommPlane,
    index: usize,
    src: Rank,
    dst: Rank,
}

struct Frame {
    mem_type: UserMemType,
    offset: u64,
    payload: Bytes,
}

struct Lane<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Lane<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

struct Mailbox {
    data: Lane<Frame>,
    ack: Lane<()>,
    signal: Lane<()>,
}

struct FabricInner {
    mailboxes: Mutex<HashMap<MailboxKey, Arc<Mailbox>>>,
    recv_timeout: Duration,
}

/// Shared in-process fabric. Clones refer to the same mailboxes.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::from_config(&HcollConfig::default())
    }
}

impl LocalFabric {
    /// Fabric whose receives expire after `config.transfer_timeout`.
    pub fn from_config(config: &HcollConfig) -> Self {
        Self::new(config.transfer_timeout)
    }

    pub fn new(recv_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                mailboxes: Mutex::new(HashMap::new()),
                recv_timeout,
            }),
        }
    }

    /// Link from `local` to `remote` on parallel link set `index` of `plane`.
    pub fn link(
        &self,
        plane: CommPlane,
        index: usize,
        local: Rank,
        remote: Rank,
        link_type: LinkType,
    ) -> LinkRef {
        let outbound = self.mailbox(MailboxKey {
            plane,
            index,
            src: local,
            dst: remote,
        });
        let inbound = self.mailbox(MailboxKey {
            plane,
            index,
            src: remote,
            dst: local,
        });
        Arc::new(LocalLink {
            remote,
            link_type,
            outbound,
            inbound,
            recv_timeout: self.inner.recv_timeout,
        })
    }

    fn mailbox(&self, key: MailboxKey) -> Arc<Mailbox> {
        // Inserts are atomic, so a poisoned map is still consistent.
        let mut map = self
            .inner
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(Mailbox {
                    data: Lane::new(),
                    ack: Lane::new(),
                    signal: Lane::new(),
                })),
        )
    }
}

/// One direction-pair of mailboxes between two ranks.
pub struct LocalLink {
    remote: Rank,
    link_type: LinkType,
    outbound: Arc<Mailbox>,
    inbound: Arc<Mailbox>,
    recv_timeout: Duration,
}

async fn recv_lane<T>(lane: &Lane<T>, timeout: Duration, op: &'static str, peer: Rank) -> Result<T> {
    let mut rx = lane.rx.lock().await;
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(HcollError::LinkClosed { peer }),
        Err(_) => Err(HcollError::Timeout { op, peer }),
    }
}

impl Link for LocalLink {
    fn remote_rank(&self) -> Rank {
        self.remote
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn tx_async(
        &self,
        mem_type: UserMemType,
        offset: u64,
        src: &DeviceMem,
        stream: &Stream,
    ) -> Result<()> {
        let mailbox = Arc::clone(&self.outbound);
        let src = src.clone();
        let peer = self.remote;
        tracing::trace!(peer, bytes = src.len(), offset, "tx enqueued");
        stream.enqueue(async move {
            let payload = Bytes::from(src.read()?);
            mailbox
                .data
                .tx
                .send(Frame {
                    mem_type,
                    offset,
                    payload,
                })
                .map_err(|_| HcollError::LinkClosed { peer })
        })
    }

    fn rx_async(
        &self,
        mem_type: UserMemType,
        offset: u64,
        dst: &DeviceMem,
        stream: &Stream,
    ) -> Result<()> {
        let mailbox = Arc::clone(&self.inbound);
        let dst = dst.clone();
        let peer = self.remote;
        let timeout = self.recv_timeout;
        tracing::trace!(peer, bytes = dst.len(), offset, "rx enqueued");
        stream.enqueue(async move {
            let frame = recv_lane(&mailbox.data, timeout, "rx", peer).await?;
            if frame.payload.len() != dst.len() {
                return Err(HcollError::BufferSizeMismatch {
                    expected: dst.len(),
                    actual: frame.payload.len(),
                });
            }
            if frame.mem_type != mem_type {
                tracing::debug!(
                    peer,
                    sent = ?frame.mem_type,
                    expected = ?mem_type,
                    offset = frame.offset,
                    "rx memory window differs from sender"
                );
            }
            dst.write(&frame.payload)
        })
    }

    fn tx_wait_done(&self, stream: &Stream) -> Result<()> {
        // Sends complete as soon as they are handed to the mailbox.
        stream.enqueue(async { Ok(()) })
    }

    fn rx_wait_done(&self, stream: &Stream) -> Result<()> {
        stream.enqueue(async { Ok(()) })
    }

    fn tx_ack(&self, stream: &Stream) -> Result<()> {
        let mailbox = Arc::clone(&self.outbound);
        let peer = self.remote;
        stream.enqueue(async move {
            mailbox
                .ack
                .tx
                .send(())
                .map_err(|_| HcollError::LinkClosed { peer })
        })
    }

    fn rx_ack(&self, stream: &Stream) -> Result<()> {
        let mailbox = Arc::clone(&self.inbound);
        let peer = self.remote;
        let timeout = self.recv_timeout;
        stream.enqueue(async move { recv_lane(&mailbox.ack, timeout, "rx_ack", peer).await })
    }

    fn tx_data_signal(&self, stream: &Stream) -> Result<()> {
        let mailbox = Arc::clone(&self.outbound);
        let peer = self.remote;
        stream.enqueue(async move {
            mailbox
                .signal
                .tx
                .send(())
                .map_err(|_| HcollError::LinkClosed { peer })
        })
    }

    fn rx_data_signal(&self, stream: &Stream) -> Result<()> {
        let mailbox = Arc::clone(&self.inbound);
        let peer = self.remote;
        let timeout = self.recv_timeout;
        stream.enqueue(async move {
            recv_lane(&mailbox.signal, timeout, "rx_data_signal", peer).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::execute_barrier;

    #[tokio::test]
    async fn test_fifo_transfer() {
        let fabric = LocalFabric::default();
        let a = fabric.link(CommPlane::Level(0), 0, 0, 1, LinkType::Fabric);
        let b = fabric.link(CommPlane::Level(0), 0, 1, 0, LinkType::Fabric);
        let sa = Stream::new(0).unwrap();
        let sb = Stream::new(1).unwrap();

        let first = DeviceMem::from_bytes(vec![1, 2]);
        let second = DeviceMem::from_bytes(vec![3, 4, 5]);
        a.tx_async(UserMemType::OutputMem, 0, &first, &sa).unwrap();
        a.tx_async(UserMemType::OutputMem, 2, &second, &sa).unwrap();

        let out = DeviceMem::alloc(5);
        b.rx_async(UserMemType::OutputMem, 0, &out.range(0, 2).unwrap(), &sb)
            .unwrap();
        b.rx_async(UserMemType::OutputMem, 2, &out.range(2, 3).unwrap(), &sb)
            .unwrap();
        sa.synchronize().await.unwrap();
        sb.synchronize().await.unwrap();
        assert_eq!(out.read().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_stream() {
        let fabric = LocalFabric::default();
        let a = fabric.link(CommPlane::Combined, 0, 0, 1, LinkType::Rdma);
        let b = fabric.link(CommPlane::Combined, 0, 1, 0, LinkType::Rdma);
        let s = Stream::new(0).unwrap();
        a.tx_async(UserMemType::InputMem, 0, &DeviceMem::alloc(4), &s)
            .unwrap();
        b.rx_async(UserMemType::InputMem, 0, &DeviceMem::alloc(8), &s)
            .unwrap();
        assert!(s.synchronize().await.is_err());
    }

    #[tokio::test]
    async fn test_planes_are_isolated() {
        let fabric = LocalFabric::new(Duration::from_millis(20));
        let p0 = fabric.link(CommPlane::Combined, 0, 0, 1, LinkType::Fabric);
        let p1 = fabric.link(CommPlane::Combined, 1, 1, 0, LinkType::Fabric);
        let s = Stream::new(0).unwrap();
        p0.tx_async(UserMemType::OutputMem, 0, &DeviceMem::alloc(1), &s)
            .unwrap();
        p1.rx_async(UserMemType::OutputMem, 0, &DeviceMem::alloc(1), &s)
            .unwrap();
        let err = s.synchronize().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn test_unmatched_rx_expires_after_transfer_timeout() {
        let config = HcollConfig {
            transfer_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let fabric = LocalFabric::from_config(&config);
        let link = fabric.link(CommPlane::Level(0), 0, 0, 1, LinkType::Fabric);
        let s = Stream::new(7).unwrap();
        link.rx_async(UserMemType::OutputMem, 0, &DeviceMem::alloc(4), &s)
            .unwrap();
        let started = std::time::Instant::now();
        match s.synchronize().await {
            Err(HcollError::StreamFailed { stream: 7, reason }) => {
                assert!(reason.contains("timed out"), "{reason}")
            }
            other => panic!("expected a timed out stream, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ring_barrier_does_not_deadlock() {
        let fabric = LocalFabric::default();
        let world = 4u32;
        let mut streams = Vec::new();
        for r in 0..world {
            let prev = (r + world - 1) % world;
            let next = (r + 1) % world;
            let pre = fabric.link(CommPlane::Level(0), 0, r, prev, LinkType::Fabric);
            let aft = fabric.link(CommPlane::Level(0), 0, r, next, LinkType::Fabric);
            let s = Stream::new(r).unwrap();
            execute_barrier(pre.as_ref(), aft.as_ref(), &s).unwrap();
            streams.push(s);
        }
        for s in &streams {
            s.synchronize().await.unwrap();
        }
    }
}
