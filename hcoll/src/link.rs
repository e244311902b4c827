//! Point-to-point transport contract consumed by the templates.

use std::sync::Arc;

use crate::error::Result;
use crate::memory::DeviceMem;
use crate::stream::Stream;
use crate::types::{Rank, UserMemType};

/// Physical class of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Node-local path (same device or same node).
    Local,
    /// Scale-up interconnect plane between devices.
    Fabric,
    /// Scale-out RDMA network.
    Rdma,
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkType::Local => f.write_str("local"),
            LinkType::Fabric => f.write_str("fabric"),
            LinkType::Rdma => f.write_str("rdma"),
        }
    }
}

/// Ordered asynchronous transport handle to one peer.
///
/// Every method only enqueues work on `stream` and returns. Transfers on
/// one link are matched in FIFO order: the n-th `tx_async` on one side pairs
/// with the n-th `rx_async` on the other.
pub trait Link: Send + Sync {
    fn remote_rank(&self) -> Rank;

    fn link_type(&self) -> LinkType;

    /// Send `src` to the peer. `offset` addresses the peer's `mem_type` window.
    fn tx_async(&self, mem_type: UserMemType, offset: u64, src: &DeviceMem, stream: &Stream)
    -> Result<()>;

    /// Receive into `dst`. `offset` addresses the peer's `mem_type` window.
    fn rx_async(&self, mem_type: UserMemType, offset: u64, dst: &DeviceMem, stream: &Stream)
    -> Result<()>;

    /// Stream-ordered wait until all sends so far have left this side.
    fn tx_wait_done(&self, stream: &Stream) -> Result<()>;

    /// Stream-ordered wait until all receives so far have landed.
    fn rx_wait_done(&self, stream: &Stream) -> Result<()>;

    fn tx_ack(&self, stream: &Stream) -> Result<()>;

    fn rx_ack(&self, stream: &Stream) -> Result<()>;

    fn tx_data_signal(&self, stream: &Stream) -> Result<()>;

    fn rx_data_signal(&self, stream: &Stream) -> Result<()>;
}

pub type LinkRef = Arc<dyn Link>;

/// Neighbor barrier between the link to the previous rank (`pre`) and the
/// link to the next rank (`aft`).
///
/// Acks flow backwards and data signals forwards, so a ring of ranks each
/// running this barrier cannot deadlock.
pub fn execute_barrier(pre: &dyn Link, aft: &dyn Link, stream: &Stream) -> Result<()> {
    pre.tx_ack(stream)?;
    aft.rx_ack(stream)?;
    aft.tx_data_signal(stream)?;
    pre.rx_data_signal(stream)
}
