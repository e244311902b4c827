use crate::error::{HcollError, Result};
use crate::stream::Stream;
use crate::types::{DataType, OpKind, Rank, ReduceOp};

/// One logical collective call. Immutable once execution starts.
///
/// `count` is read per operation kind:
///
/// | op | `count` | input bytes | output bytes |
/// |---|---|---|---|
/// | all-gather | elements each rank contributes | `count` | `world * count` |
/// | reduce-scatter | elements each rank keeps | `world * count` | `count` |
/// | all-reduce | total elements | `count` | `count` |
/// | broadcast | total elements | root only | `count` |
/// | all-to-all | elements per ordered rank pair | `world * count` | `world * count` |
/// | send/recv | elements per direction | `count` | `count` |
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub op: OpKind,
    pub count: usize,
    pub dtype: DataType,
    pub reduce_op: Option<ReduceOp>,
    /// Global rank of the broadcast root.
    pub root: Option<Rank>,
    pub send_to: Option<Rank>,
    pub recv_from: Option<Rank>,
    /// Stream the operation is enqueued on. Completion is observed here.
    pub stream: Stream,
    /// Correlation tag for logs.
    pub tag: String,
    /// Element distance between consecutive rank blocks of the all-gather
    /// output. Zero means densely packed.
    pub stride_count: u64,
}

impl OperationDescriptor {
    pub fn new(op: OpKind, count: usize, dtype: DataType, stream: Stream) -> Self {
        Self {
            op,
            count,
            dtype,
            reduce_op: None,
            root: None,
            send_to: None,
            recv_from: None,
            stream,
            tag: String::new(),
            stride_count: 0,
        }
    }

    pub fn with_reduce(mut self, op: ReduceOp) -> Self {
        self.reduce_op = Some(op);
        self
    }

    pub fn with_root(mut self, root: Rank) -> Self {
        self.root = Some(root);
        self
    }

    /// Send to `send_to` and receive from `recv_from`; either may be absent.
    pub fn with_peers(mut self, send_to: Option<Rank>, recv_from: Option<Rank>) -> Self {
        self.send_to = send_to;
        self.recv_from = recv_from;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_stride(mut self, stride_count: u64) -> Self {
        self.stride_count = stride_count;
        self
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    /// Bytes of one element block (`count` elements).
    pub fn block_bytes(&self) -> usize {
        self.count * self.elem_size()
    }

    /// Whether the output layout differs from the dense one.
    pub fn is_strided(&self) -> bool {
        self.stride_count != 0 && self.stride_count != self.count as u64
    }

    /// Checks that need no topology.
    pub fn validate(&self, world: usize) -> Result<()> {
        if self.stride_count != 0 && self.stride_count < self.count as u64 {
            return Err(HcollError::InvalidStride {
                stride: self.stride_count,
                count: self.count as u64,
            });
        }
        if self.is_strided() && self.op != OpKind::AllGather {
            return Err(HcollError::param(
                self.op.name(),
                format!("stride {} only applies to all-gather", self.stride_count),
            ));
        }
        if self.op.is_reduction() {
            if self.reduce_op.is_none() {
                return Err(HcollError::param(self.op.name(), "reduction requires a reduce operator"));
            }
            crate::reduce::check_reducible(self.dtype)?;
        }
        if self.op == OpKind::Broadcast {
            match self.root {
                Some(root) if (root as usize) < world => {}
                Some(root) => {
                    return Err(HcollError::param(
                        "broadcast",
                        format!("root {root} outside world of {world}"),
                    ));
                }
                None => return Err(HcollError::param("broadcast", "broadcast requires a root")),
            }
        }
        if self.op == OpKind::SendRecv {
            if self.send_to.is_none() && self.recv_from.is_none() {
                return Err(HcollError::param("send_recv", "neither a send nor a receive peer"));
            }
            if let Some(peer) = self
                .send_to
                .into_iter()
                .chain(self.recv_from)
                .find(|&p| p as usize >= world)
            {
                return Err(HcollError::param(
                    "send_recv",
                    format!("peer {peer} outside world of {world}"),
                ));
            }
        }
        Ok(())
    }
}
