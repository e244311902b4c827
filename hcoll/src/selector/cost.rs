//! Closed-form latency/bandwidth cost models.
//!
//! All costs are in microseconds. Bandwidth is bytes per second.

use crate::selector::Algorithm;
use crate::types::OpKind;

pub const GB2B: f64 = 1024.0 * 1024.0 * 1024.0;
pub const SECOND2MICROSECOND: f64 = 1_000_000.0;

/// Per-link payload below which all-reduce is not split into pipeline slices.
pub const MIN_PER_LINK_DATA_SIZE: u64 = 4 * 1024 * 1024;
pub const MAX_PIPELINE_SLICE_NUM: u64 = 4;
/// Per-server payload below which an inter-node ring is not sliced.
pub const MIN_RING_DATA_SIZE: u64 = 64 * 1024;
pub const MAX_RING_PIPELINE_SERVER_NUM: usize = 128;

/// Integer ceiling of log2(n). Returns 0 for n <= 1.
pub fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        return 0;
    }
    usize::BITS - (n - 1).leading_zeros()
}

/// Integer floor of log2(n). Returns 0 for n <= 1.
pub fn floor_log2(n: usize) -> u32 {
    if n <= 1 {
        return 0;
    }
    usize::BITS - 1 - n.leading_zeros()
}

/// Inputs shared by every cost model for one level.
#[derive(Debug, Clone, Copy)]
pub struct CostInput {
    /// Group size at the level being evaluated.
    pub group_size: usize,
    /// Per-loop payload per rank.
    pub bytes: u64,
    /// Global participant count.
    pub world: usize,
    /// Level-0 group size.
    pub inner_size: usize,
    pub latency_us: f64,
    pub bandwidth_bps: f64,
}

/// Evaluated candidate costs. `nhr` is absent for models that only compare
/// ring against halving-doubling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Costs {
    pub ring: f64,
    pub nhr: Option<f64>,
    pub hd: f64,
}

impl Costs {
    /// Strictly cheaper wins; ties prefer Ring, then NHR, then HD.
    pub fn pick(&self) -> Algorithm {
        let mut best = Algorithm::Ring;
        let mut min = self.ring;
        if let Some(nhr) = self.nhr
            && nhr < min
        {
            best = Algorithm::Nhr;
            min = nhr;
        }
        if self.hd < min {
            best = Algorithm::HalvingDoubling;
        }
        best
    }
}

/// Cost model family registered for an operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostModel {
    AllGather,
    ReduceScatter,
    AllReduce,
    Broadcast,
}

impl CostModel {
    pub fn for_op(op: OpKind) -> Option<Self> {
        match op {
            OpKind::AllGather => Some(CostModel::AllGather),
            OpKind::ReduceScatter => Some(CostModel::ReduceScatter),
            OpKind::AllReduce => Some(CostModel::AllReduce),
            OpKind::Broadcast => Some(CostModel::Broadcast),
            OpKind::AllToAll | OpKind::SendRecv => None,
        }
    }

    pub fn costs(self, input: &CostInput) -> Costs {
        let n = input.group_size.max(1);
        let nf = n as f64;
        let steps = (n - 1) as f64;
        let lat = input.latency_us;
        let pow2 = n.is_power_of_two();
        let log2 = floor_log2(n) as f64;
        let clog2 = ceil_log2(n) as f64;

        match self {
            CostModel::AllGather | CostModel::ReduceScatter => {
                let xfer = input.bytes as f64 * input.world as f64 / input.bandwidth_bps
                    * SECOND2MICROSECOND;
                let ring = steps * lat + steps / nf * xfer;
                let nhr = clog2 * lat + steps / nf * xfer;
                let hd = if pow2 {
                    log2 * lat + steps / nf * xfer
                } else {
                    clog2 * lat + (2.0 * nf - 1.0) / nf * xfer
                };
                Costs {
                    ring,
                    nhr: Some(nhr),
                    hd,
                }
            }
            CostModel::AllReduce => {
                let xfer = input.bytes as f64 / input.inner_size.max(1) as f64
                    / input.bandwidth_bps
                    * SECOND2MICROSECOND;
                let ring = 2.0 * steps * lat + 2.0 * steps / nf * xfer;
                let nhr = 2.0 * clog2 * lat + 2.0 * steps / nf * xfer;
                let hd = if pow2 {
                    2.0 * log2 * lat + 2.0 * steps / nf * xfer
                } else {
                    2.0 * clog2 * lat + 2.0 * (2.0 * nf - 1.0) / nf * xfer
                };
                Costs {
                    ring,
                    nhr: Some(nhr),
                    hd,
                }
            }
            CostModel::Broadcast => {
                let xfer = input.bytes as f64 / input.inner_size.max(1) as f64
                    / input.bandwidth_bps
                    * SECOND2MICROSECOND;
                let ring = 2.0 * steps * lat + 2.0 * steps / nf * xfer;
                // Non power-of-two: scatter + all-gather + one copy.
                let hd = if pow2 {
                    2.0 * log2 * lat + 2.0 * steps / nf * xfer
                } else {
                    (1.0 + 2.0 * log2) * lat + (1.0 + 2.0 * steps / nf) * xfer
                };
                Costs {
                    ring,
                    nhr: None,
                    hd,
                }
            }
        }
    }
}

/// Conservative count of scheduled task contexts a pipelined schedule uses.
///
/// `inner_size` is the level-0 group size and `outer_size` the level-1
/// group size. Zero for operations that never pipeline.
pub fn pipeline_context_estimate(op: OpKind, inner_size: usize, outer_size: usize) -> u64 {
    let steps = outer_size as u64;
    let fabric_per_step = 5 * inner_size.saturating_sub(1) as u64;
    let rdma_per_step = 7;
    let copy_per_step = 1;
    let per_step = fabric_per_step + rdma_per_step + copy_per_step;
    let barrier = 4;
    match op {
        OpKind::AllGather | OpKind::ReduceScatter | OpKind::AllReduce => {
            let n = steps * per_step + barrier + 1;
            if op == OpKind::AllReduce { 2 * n } else { n }
        }
        OpKind::AllToAll => steps * per_step + barrier + 1 + steps,
        OpKind::Broadcast | OpKind::SendRecv => 0,
    }
}

/// Number of sequential pipeline slices for an all-reduce of `bytes`.
///
/// Returns 0 when pipelining does not apply at all, and at least 1
/// otherwise.
pub fn pipeline_slice_count(
    op: OpKind,
    bytes: u64,
    inner_size: usize,
    outer_size: usize,
    inter_ring: bool,
) -> u64 {
    if op != OpKind::AllReduce || inner_size < 2 || outer_size < 2 {
        return 0;
    }
    if inter_ring && outer_size > MAX_RING_PIPELINE_SERVER_NUM {
        return 0;
    }
    let mut slices = (bytes / inner_size as u64 / MIN_PER_LINK_DATA_SIZE).min(MAX_PIPELINE_SLICE_NUM);
    if inter_ring && bytes / (outer_size as u64) < MIN_RING_DATA_SIZE {
        slices = 1;
    }
    slices.max(1)
}
