//! The uniform contract every concrete communication pattern implements.
//!
//! A template is configured once with [`AlgTemplate::prepare`], which only
//! validates and stores its inputs, and then enqueues its transfers with
//! [`AlgTemplate::run_async`]. Neither call waits for data to move.

mod alltoall;
mod broadcast;
mod hd;
mod mesh;
mod nhr;
mod ring;
mod striped;

pub use alltoall::{AllToAllSliced, PeerIndex, piece_plan};
pub use broadcast::{BroadcastChain, BroadcastTree};
pub use hd::AllGatherHd;
pub use mesh::{AllGatherMesh, ReduceScatterMesh};
pub use nhr::AllGatherNhr;
pub use ring::{AllGatherRing, ReduceScatterRing};
pub use striped::AllGatherStriped;

use std::sync::Arc;

use crate::config::HcollConfig;
use crate::error::{HcollError, Result};
use crate::link::LinkRef;
use crate::memory::{DeviceMem, ExecMem};
use crate::slice::Slice;
use crate::stream::{Signal, Stream};
use crate::sync::Dispatcher;
use crate::topology::SubGroup;
use crate::types::{DataType, ReduceOp};

/// Label of a concrete template implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    AllGatherRing,
    AllGatherNhr,
    AllGatherHd,
    AllGatherMesh,
    AllGatherStriped,
    ReduceScatterRing,
    ReduceScatterMesh,
    BroadcastChain,
    BroadcastTree,
    AllToAllSliced,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 10] = [
        TemplateKind::AllGatherRing,
        TemplateKind::AllGatherNhr,
        TemplateKind::AllGatherHd,
        TemplateKind::AllGatherMesh,
        TemplateKind::AllGatherStriped,
        TemplateKind::ReduceScatterRing,
        TemplateKind::ReduceScatterMesh,
        TemplateKind::BroadcastChain,
        TemplateKind::BroadcastTree,
        TemplateKind::AllToAllSliced,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TemplateKind::AllGatherRing => "allgather_ring",
            TemplateKind::AllGatherNhr => "allgather_nhr",
            TemplateKind::AllGatherHd => "allgather_hd",
            TemplateKind::AllGatherMesh => "allgather_mesh",
            TemplateKind::AllGatherStriped => "allgather_striped",
            TemplateKind::ReduceScatterRing => "reduce_scatter_ring",
            TemplateKind::ReduceScatterMesh => "reduce_scatter_mesh",
            TemplateKind::BroadcastChain => "broadcast_chain",
            TemplateKind::BroadcastTree => "broadcast_tree",
            TemplateKind::AllToAllSliced => "alltoall_sliced",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How the striped all-gather divides a rank's contribution across planes.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaneSplit {
    /// Shares proportional to per-plane bandwidth (any unit).
    Bandwidth(Vec<f64>),
    /// This many equal shares.
    Equal(usize),
}

impl PlaneSplit {
    pub fn plane_count(&self) -> usize {
        match self {
            PlaneSplit::Bandwidth(bw) => bw.len(),
            PlaneSplit::Equal(k) => *k,
        }
    }

    /// Partition `region` into one slice per plane. Exact: the last plane
    /// absorbs every rounding remainder.
    pub fn partition(&self, region: Slice, align: usize) -> Result<Vec<Slice>> {
        match self {
            PlaneSplit::Bandwidth(bw) => region.split_weighted(bw, align),
            PlaneSplit::Equal(k) => Ok(region.split(*k, align)),
        }
    }
}

/// Shared services threaded through every template call.
#[derive(Clone)]
pub struct ExecContext {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub config: Arc<HcollConfig>,
}

impl ExecContext {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: Arc<HcollConfig>) -> Self {
        Self { dispatcher, config }
    }
}

/// Signal pairs for one fan-out/fan-in window.
#[derive(Debug, Clone, Default)]
pub struct SignalPairs {
    pub main_to_aux: Vec<Signal>,
    pub aux_to_main: Vec<Signal>,
}

impl SignalPairs {
    /// Number of complete pairs.
    pub fn len(&self) -> usize {
        self.main_to_aux.len().min(self.aux_to_main.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Topology facts a template cannot derive from its own group.
#[derive(Debug, Clone, Default)]
pub struct TopologyParams {
    /// Leading ring steps that stay on node-local links.
    pub local_hop: usize,
    /// Ranks per node.
    pub node_size: usize,
    /// This rank's node index.
    pub node_index: usize,
    /// Number of nodes.
    pub node_count: usize,
    /// This rank's index within its node.
    pub local_index: usize,
    /// All-to-all links are indexed by global rank rather than per phase.
    pub flattened: bool,
}

/// Everything `prepare` needs.
#[derive(Clone)]
pub struct PrepareArgs {
    pub mem: ExecMem,
    /// Elements per block (per ordered pair for all-to-all).
    pub count: usize,
    pub dtype: DataType,
    pub reduce_op: Option<ReduceOp>,
    /// Local index of the broadcast root.
    pub root: Option<usize>,
    pub main_stream: Stream,
    pub aux_streams: Vec<Stream>,
    pub signals: SignalPairs,
    pub local_rank: usize,
    pub group_size: usize,
    /// Block owned by each local rank, as byte ranges of `mem.output`.
    pub slices: Vec<Slice>,
    pub topo: TopologyParams,
    /// Parallel link sets, one per plane.
    pub sub_groups: Vec<SubGroup>,
    pub ctx: ExecContext,
}

impl PrepareArgs {
    /// Arguments for a single-stream template over `output`.
    pub fn new(
        ctx: ExecContext,
        mem: ExecMem,
        main_stream: Stream,
        local_rank: usize,
        group_size: usize,
    ) -> Self {
        Self {
            mem,
            count: 0,
            dtype: DataType::U8,
            reduce_op: None,
            root: None,
            main_stream,
            aux_streams: Vec::new(),
            signals: SignalPairs::default(),
            local_rank,
            group_size,
            slices: Vec::new(),
            topo: TopologyParams::default(),
            sub_groups: Vec::new(),
            ctx,
        }
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    /// View of `slice` inside the output buffer.
    pub(crate) fn block(&self, slice: Slice) -> Result<DeviceMem> {
        self.mem.output.range(slice.offset, slice.size)
    }

    /// Largest slice size.
    pub(crate) fn max_slice(&self) -> usize {
        self.slices.iter().map(|s| s.size).max().unwrap_or(0)
    }

    pub(crate) fn check_group(&self, op: &'static str) -> Result<()> {
        if self.group_size == 0 || self.local_rank >= self.group_size {
            return Err(HcollError::param(
                op,
                format!(
                    "local rank {} outside group of {}",
                    self.local_rank, self.group_size
                ),
            ));
        }
        Ok(())
    }

    /// One in-bounds slice per group member.
    pub(crate) fn check_slices(&self, op: &'static str) -> Result<()> {
        self.check_group(op)?;
        if self.slices.len() != self.group_size {
            return Err(HcollError::SliceMismatch {
                expected: self.group_size,
                actual: self.slices.len(),
            });
        }
        let cap = self.mem.output.len();
        if let Some(s) = self.slices.iter().find(|s| s.end() > cap) {
            return Err(HcollError::OutOfBounds {
                offset: s.offset,
                len: s.size,
                capacity: cap,
            });
        }
        Ok(())
    }

    /// At least `needed` auxiliary streams and signal pairs.
    pub(crate) fn check_aux(&self, needed: usize) -> Result<()> {
        if self.aux_streams.len() < needed {
            return Err(HcollError::InsufficientStreams {
                required: needed,
                available: self.aux_streams.len(),
            });
        }
        if self.signals.len() < needed {
            return Err(HcollError::InsufficientSignals {
                required: needed,
                available: self.signals.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn reduce_op(&self, op: &'static str) -> Result<ReduceOp> {
        self.reduce_op
            .ok_or_else(|| HcollError::param(op, "reduction requires a reduce operator"))
    }
}

/// Lifecycle of one template instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    Unconfigured,
    Prepared,
    Running,
    Complete,
}

impl TemplateState {
    pub const fn name(self) -> &'static str {
        match self {
            TemplateState::Unconfigured => "unconfigured",
            TemplateState::Prepared => "prepared",
            TemplateState::Running => "running",
            TemplateState::Complete => "complete",
        }
    }
}

/// Phase of the sliced all-to-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllToAllPhase {
    Gather = 0,
    Inter = 1,
    Scatter = 2,
}

impl TryFrom<u32> for AllToAllPhase {
    type Error = HcollError;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(AllToAllPhase::Gather),
            1 => Ok(AllToAllPhase::Inter),
            2 => Ok(AllToAllPhase::Scatter),
            other => Err(HcollError::UnknownMode(other)),
        }
    }
}

/// Optional capability of multi-phase templates.
pub trait PhasedTemplate {
    fn set_mode(&mut self, phase: AllToAllPhase);

    /// Local index of each plane's aggregator, overriding the default
    /// `plane % node_size` placement.
    fn set_aggregators(&mut self, aggregators: Vec<usize>) -> Result<()>;
}

/// A concrete communication pattern.
pub trait AlgTemplate: Send {
    fn kind(&self) -> TemplateKind;

    fn state(&self) -> TemplateState;

    /// Validate and store the configuration. Starts no transfer.
    fn prepare(&mut self, args: PrepareArgs) -> Result<()>;

    /// Enqueue every transfer on the prepared streams and return.
    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()>;

    /// Capability query for phase-driven templates.
    fn phased(&mut self) -> Option<&mut dyn PhasedTemplate> {
        None
    }
}

/// Stored configuration plus lifecycle state, shared by all templates.
pub(crate) struct Core {
    kind: TemplateKind,
    state: TemplateState,
    args: Option<PrepareArgs>,
}

impl Core {
    pub(crate) fn new(kind: TemplateKind) -> Self {
        Self {
            kind,
            state: TemplateState::Unconfigured,
            args: None,
        }
    }

    pub(crate) fn state(&self) -> TemplateState {
        self.state
    }

    /// Store `args` once `check` accepts them. A failed check leaves the
    /// template unconfigured.
    pub(crate) fn prepare(
        &mut self,
        args: PrepareArgs,
        check: impl FnOnce(&PrepareArgs) -> Result<()>,
    ) -> Result<()> {
        self.args = None;
        self.state = TemplateState::Unconfigured;
        check(&args)?;
        self.args = Some(args);
        self.state = TemplateState::Prepared;
        Ok(())
    }

    /// Stored arguments while the template is `Prepared`.
    pub(crate) fn prepared(&self) -> Option<&PrepareArgs> {
        match self.state {
            TemplateState::Prepared => self.args.as_ref(),
            _ => None,
        }
    }

    /// Move to `Running` and return the stored arguments.
    pub(crate) fn begin(
        &mut self,
        local_rank: usize,
        group_size: usize,
        links: &[LinkRef],
    ) -> Result<&PrepareArgs> {
        if self.state != TemplateState::Prepared {
            return Err(HcollError::InvalidState {
                template: self.kind,
                state: self.state.name(),
                action: "run",
            });
        }
        let args = self.args.as_ref().ok_or(HcollError::InvalidState {
            template: self.kind,
            state: TemplateState::Unconfigured.name(),
            action: "run",
        })?;
        if local_rank != args.local_rank || group_size != args.group_size {
            return Err(HcollError::param(
                self.kind.name(),
                format!(
                    "run as {local_rank}/{group_size} but prepared as {}/{}",
                    args.local_rank, args.group_size
                ),
            ));
        }
        if links.len() != group_size {
            return Err(HcollError::param(
                self.kind.name(),
                format!("{} links for a group of {group_size}", links.len()),
            ));
        }
        self.state = TemplateState::Running;
        Ok(args)
    }

    pub(crate) fn finish(&mut self) {
        self.state = TemplateState::Complete;
    }
}

/// Previous and next ring neighbors of `rank`.
pub(crate) fn ring_neighbors(rank: usize, n: usize) -> (usize, usize) {
    ((rank + n - 1) % n, (rank + 1) % n)
}
