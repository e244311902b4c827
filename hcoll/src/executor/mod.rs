//! Hierarchical decomposition of one collective into per-level templates.
//!
//! Each operation kind is a small plan assembled from three capabilities:
//! [`ComputesResourceRequest`] sizes what the external allocator must hand
//! out, [`DecomposesIntoLevels`] turns the topology into an ordered list of
//! template steps, and [`RunsTemplate`] enqueues those steps together with
//! the local copies that stitch them. [`HierarchicalExecutor`] looks the plan
//! up and drives it. Nothing here waits for data to move; completion is
//! observed on the descriptor's stream.

mod alltoall;
mod broadcast;
mod descriptor;
mod gather;
pub mod partition;
mod reduce;
mod resources;
mod sendrecv;

pub use descriptor::OperationDescriptor;
pub use partition::{LevelPartition, LevelSlices, rank_blocks};
pub use resources::{ResourceRequest, ResourceResponse};

use std::sync::Arc;

use crate::config::HcollConfig;
use crate::error::{HcollError, Result};
use crate::memory::{DeviceMem, ExecMem};
use crate::registry::TemplateRegistry;
use crate::selector::{Algorithm, AlgorithmChoice};
use crate::slice::Slice;
use crate::template::{AlgTemplate, AllToAllPhase, ExecContext, PrepareArgs, TemplateKind, TopologyParams};
use crate::topology::{CommPlane, SubGroup, Topology, TopologyShape};
use crate::types::{OpKind, Rank};

/// Fixed inputs of one `orchestrate` call.
pub struct OpContext<'a> {
    pub desc: &'a OperationDescriptor,
    pub choice: AlgorithmChoice,
    pub shape: &'a TopologyShape,
    pub rank: Rank,
    pub config: &'a HcollConfig,
}

impl OpContext<'_> {
    pub fn world(&self) -> usize {
        self.shape.world_size()
    }

    pub fn elem_size(&self) -> usize {
        self.desc.elem_size()
    }

    pub fn partition(&self, region: Slice) -> LevelPartition {
        LevelPartition::new(self.shape, self.rank, region, self.elem_size())
    }
}

/// One template invocation within an operation.
#[derive(Debug, Clone)]
pub struct LevelStep {
    /// Topology level, or `None` for steps spanning the whole world.
    pub level: Option<usize>,
    pub kind: TemplateKind,
    /// Communicator whose link set 0 is handed to `run_async`.
    pub plane: CommPlane,
    pub local_rank: usize,
    pub group_size: usize,
    /// Per-member blocks, absolute within the working buffer.
    pub slices: Vec<Slice>,
    pub root: Option<usize>,
    pub local_hop: usize,
    /// Parallel link sets passed as `sub_groups`, in order.
    pub link_sets: Vec<(CommPlane, usize)>,
    pub phase: Option<AllToAllPhase>,
}

impl LevelStep {
    /// Step at `level` over the partition entry `lv`.
    pub fn at_level(lv: &LevelSlices, kind: TemplateKind) -> Self {
        Self {
            level: Some(lv.level),
            kind,
            plane: CommPlane::Level(lv.level),
            local_rank: lv.local_rank,
            group_size: lv.group_size(),
            slices: lv.slices.clone(),
            root: None,
            local_hop: 0,
            link_sets: Vec::new(),
            phase: None,
        }
    }
}

pub trait ComputesResourceRequest {
    fn resource_request(&self, cx: &OpContext<'_>) -> Result<ResourceRequest>;
}

pub trait DecomposesIntoLevels {
    /// Template steps over `region` in execution order. Levels of size 1
    /// are left out.
    fn decompose(&self, cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>>;
}

pub trait RunsTemplate {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem)
    -> Result<()>;
}

/// Everything an operation kind contributes to the executor.
pub trait OpPlan: ComputesResourceRequest + DecomposesIntoLevels + RunsTemplate + Send + Sync {}

impl<T> OpPlan for T where T: ComputesResourceRequest + DecomposesIntoLevels + RunsTemplate + Send + Sync {}

/// Plan for `op`.
pub fn plan_for(op: OpKind) -> &'static dyn OpPlan {
    match op {
        OpKind::AllGather => &gather::AllGatherPlan,
        OpKind::ReduceScatter => &reduce::ReduceScatterPlan,
        OpKind::AllReduce => &reduce::AllReducePlan,
        OpKind::Broadcast => &broadcast::BroadcastPlan,
        OpKind::AllToAll => &alltoall::AllToAllPlan,
        OpKind::SendRecv => &sendrecv::SendRecvPlan,
    }
}

/// Template that runs `alg` for `op`; `None` for send/recv, which moves
/// data without a template. Combinations without a dedicated template fall
/// back to a ring.
pub fn template_for(op: OpKind, alg: Algorithm) -> Option<TemplateKind> {
    let kind = match (op, alg) {
        (OpKind::AllGather | OpKind::AllReduce, Algorithm::Nhr) => TemplateKind::AllGatherNhr,
        (OpKind::AllGather | OpKind::AllReduce, Algorithm::HalvingDoubling) => TemplateKind::AllGatherHd,
        (OpKind::AllGather | OpKind::AllReduce, Algorithm::Mesh) => TemplateKind::AllGatherMesh,
        (OpKind::AllGather, Algorithm::Pipeline) => TemplateKind::AllGatherStriped,
        (OpKind::AllGather | OpKind::AllReduce, _) => TemplateKind::AllGatherRing,
        (OpKind::ReduceScatter, Algorithm::Mesh) => TemplateKind::ReduceScatterMesh,
        (OpKind::ReduceScatter, _) => TemplateKind::ReduceScatterRing,
        (OpKind::Broadcast, Algorithm::Ring | Algorithm::Pipeline) => TemplateKind::BroadcastChain,
        (OpKind::Broadcast, _) => TemplateKind::BroadcastTree,
        (OpKind::AllToAll, _) => TemplateKind::AllToAllSliced,
        (OpKind::SendRecv, _) => return None,
    };
    let fallback = match op {
        OpKind::ReduceScatter => !matches!(alg, Algorithm::Ring | Algorithm::Mesh),
        OpKind::AllReduce => alg == Algorithm::Pipeline,
        _ => false,
    };
    if fallback {
        tracing::debug!(%op, %alg, template = %kind, "no dedicated template, falling back");
    }
    Some(kind)
}

/// Template runner bound to one operation's resources.
pub struct LevelRunner<'a> {
    executor: &'a HierarchicalExecutor,
    res: &'a ResourceResponse,
}

impl LevelRunner<'_> {
    pub fn topology(&self) -> &dyn Topology {
        self.executor.topology.as_ref()
    }

    pub fn resources(&self) -> &ResourceResponse {
        self.res
    }

    pub fn create(&self, kind: TemplateKind) -> Result<Box<dyn AlgTemplate>> {
        self.executor.registry.create(kind)
    }

    /// `n` parallel link sets of `plane`.
    pub fn link_sets(&self, plane: CommPlane, n: usize) -> Result<Vec<SubGroup>> {
        let topo = self.topology();
        if !topo.check_link_sets(plane, n) {
            return Err(HcollError::param(
                "topology",
                format!("{plane:?} offers fewer than {n} parallel link sets"),
            ));
        }
        (0..n).map(|i| topo.sub_group(plane, i)).collect()
    }

    /// Arguments shared by every template of the operation.
    pub fn base_args(
        &self,
        cx: &OpContext<'_>,
        mem: ExecMem,
        local_rank: usize,
        group_size: usize,
    ) -> PrepareArgs {
        let mut args = PrepareArgs::new(
            self.executor.ctx.clone(),
            mem,
            cx.desc.stream.clone(),
            local_rank,
            group_size,
        );
        args.count = cx.desc.count;
        args.dtype = cx.desc.dtype;
        args.reduce_op = cx.desc.reduce_op;
        args.aux_streams = self.res.aux_streams.clone();
        args.signals = self.res.signals.clone();
        args
    }

    /// Enqueue a device copy on the operation's stream.
    pub fn copy(&self, cx: &OpContext<'_>, dst: &DeviceMem, src: &DeviceMem) -> Result<()> {
        self.executor
            .ctx
            .dispatcher
            .memcpy_async(&cx.desc.stream, dst, src)
    }

    /// Prepare and run one step's template over `mem`.
    pub fn run_step(&self, cx: &OpContext<'_>, step: &LevelStep, mem: ExecMem) -> Result<()> {
        let mut args = self.base_args(cx, mem, step.local_rank, step.group_size);
        args.slices = step.slices.clone();
        args.root = step.root;
        args.topo = TopologyParams {
            local_hop: step.local_hop,
            ..Default::default()
        };
        for &(plane, index) in &step.link_sets {
            args.sub_groups.push(self.topology().sub_group(plane, index)?);
        }
        let links = self.topology().sub_group(step.plane, 0)?.links;
        tracing::debug!(
            tag = %cx.desc.tag,
            rank = cx.rank,
            level = ?step.level,
            template = %step.kind,
            group_size = step.group_size,
            "running level template"
        );
        let mut template = self.create(step.kind)?;
        template.prepare(args)?;
        template.run_async(step.local_rank, step.group_size, &links)
    }
}

/// Decomposes collectives over a hierarchical topology and runs them.
pub struct HierarchicalExecutor {
    topology: Arc<dyn Topology>,
    registry: Arc<TemplateRegistry>,
    ctx: ExecContext,
}

impl HierarchicalExecutor {
    pub fn new(topology: Arc<dyn Topology>, registry: Arc<TemplateRegistry>, ctx: ExecContext) -> Self {
        Self {
            topology,
            registry,
            ctx,
        }
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn config(&self) -> &HcollConfig {
        &self.ctx.config
    }

    fn context<'a>(&'a self, desc: &'a OperationDescriptor, choice: AlgorithmChoice) -> OpContext<'a> {
        OpContext {
            desc,
            choice,
            shape: self.topology.shape(),
            rank: self.topology.rank(),
            config: &self.ctx.config,
        }
    }

    /// Streams, signals and scratch `desc` needs under `choice`.
    pub fn resource_request(&self, desc: &OperationDescriptor, choice: AlgorithmChoice) -> Result<ResourceRequest> {
        let cx = self.context(desc, choice);
        desc.validate(cx.world())?;
        plan_for(desc.op).resource_request(&cx)
    }

    /// Template steps `desc` decomposes into, over its whole buffer.
    pub fn decompose(&self, desc: &OperationDescriptor, choice: AlgorithmChoice) -> Result<Vec<LevelStep>> {
        let cx = self.context(desc, choice);
        desc.validate(cx.world())?;
        let total = match desc.op {
            OpKind::AllGather | OpKind::ReduceScatter => cx.world() * desc.block_bytes(),
            _ => desc.block_bytes(),
        };
        plan_for(desc.op).decompose(&cx, Slice::new(0, total))
    }

    /// Enqueue `desc` on its stream using the allocated `res`.
    ///
    /// Descriptor, buffer and resource checks run before the first command
    /// is enqueued. Returns once all commands are enqueued.
    pub fn orchestrate(
        &self,
        desc: &OperationDescriptor,
        choice: AlgorithmChoice,
        input: &DeviceMem,
        output: &DeviceMem,
        res: &ResourceResponse,
    ) -> Result<()> {
        let cx = self.context(desc, choice);
        desc.validate(cx.world())?;
        let plan = plan_for(desc.op);
        let req = plan.resource_request(&cx)?;
        check_resources(&req, res)?;
        if desc.count == 0 {
            tracing::debug!(tag = %desc.tag, op = %desc.op, "empty operation, nothing to do");
            return Ok(());
        }
        tracing::debug!(
            tag = %desc.tag,
            op = %desc.op,
            rank = cx.rank,
            count = desc.count,
            %choice,
            "orchestrating"
        );
        let runner = LevelRunner { executor: self, res };
        plan.run(&cx, &runner, input, output)
    }
}

fn check_resources(req: &ResourceRequest, res: &ResourceResponse) -> Result<()> {
    if res.aux_streams.len() < req.stream_count {
        return Err(HcollError::InsufficientStreams {
            required: req.stream_count,
            available: res.aux_streams.len(),
        });
    }
    if res.signals.len() < req.signal_count {
        return Err(HcollError::InsufficientSignals {
            required: req.signal_count,
            available: res.signals.len(),
        });
    }
    if req.scratch_bytes > 0 {
        let scratch = res.scratch.as_ref().ok_or(HcollError::MissingBuffer("scratch"))?;
        if scratch.len() < req.scratch_bytes {
            return Err(HcollError::ScratchTooSmall {
                required: req.scratch_bytes,
                available: scratch.len(),
            });
        }
    }
    if req.needs_staging_buffer {
        let staging = res
            .staging_output
            .as_ref()
            .ok_or(HcollError::MissingBuffer("staging output"))?;
        if staging.len() < req.staging_bytes {
            return Err(HcollError::BufferSizeMismatch {
                expected: req.staging_bytes,
                actual: staging.len(),
            });
        }
    }
    Ok(())
}

/// `mem` must hold at least `needed` bytes.
pub(crate) fn check_len(what: &'static str, mem: &DeviceMem, needed: usize) -> Result<()> {
    if mem.len() < needed {
        tracing::debug!(buffer = what, needed, len = mem.len(), "buffer too small");
        return Err(HcollError::BufferSizeMismatch {
            expected: needed,
            actual: mem.len(),
        });
    }
    Ok(())
}

/// Aux streams needed by a level running `kind` over `n` members.
pub(crate) fn aux_need(kind: TemplateKind, n: usize, config: &HcollConfig) -> usize {
    match kind {
        TemplateKind::AllGatherMesh | TemplateKind::ReduceScatterMesh => n.saturating_sub(1),
        TemplateKind::AllGatherStriped => config.plane_count(),
        TemplateKind::AllToAllSliced => config.alltoall_planes.max(1),
        _ => 0,
    }
}
