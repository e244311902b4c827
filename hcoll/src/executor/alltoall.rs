use crate::error::Result;
use crate::executor::{
    ComputesResourceRequest, DecomposesIntoLevels, LevelRunner, LevelStep, OpContext, ResourceRequest,
    RunsTemplate, aux_need, check_len,
};
use crate::memory::{DeviceMem, ExecMem};
use crate::slice::Slice;
use crate::template::{AllToAllPhase, TemplateKind, TopologyParams};
use crate::topology::CommPlane;
use crate::types::OpKind;

const PHASES: [AllToAllPhase; 3] = [AllToAllPhase::Gather, AllToAllPhase::Inter, AllToAllPhase::Scatter];

/// All-to-all as three phases of one sliced template. Nodes are level-0
/// groups. Two-level shapes run each phase on its own level; any other
/// shape, or `alltoall_flattened`, runs all phases over the combined plane.
pub(crate) struct AllToAllPlan;

impl AllToAllPlan {
    fn hierarchical(cx: &OpContext<'_>) -> bool {
        !cx.config.alltoall_flattened && cx.shape.level_count() >= 2 && cx.shape.group_size(2) == 1
    }

    fn plane(cx: &OpContext<'_>, phase: AllToAllPhase) -> CommPlane {
        match (Self::hierarchical(cx), phase) {
            (false, _) => CommPlane::Combined,
            (true, AllToAllPhase::Inter) => CommPlane::Level(1),
            (true, _) => CommPlane::Level(0),
        }
    }

    fn topo_params(cx: &OpContext<'_>) -> TopologyParams {
        let node_size = cx.shape.group_size(0);
        let rank = cx.rank as usize;
        TopologyParams {
            node_size,
            node_count: cx.world() / node_size,
            node_index: rank / node_size,
            local_index: rank % node_size,
            flattened: !Self::hierarchical(cx),
            ..Default::default()
        }
    }
}

impl ComputesResourceRequest for AllToAllPlan {
    fn resource_request(&self, cx: &OpContext<'_>) -> Result<ResourceRequest> {
        let world = cx.world();
        if world == 1 {
            return Ok(ResourceRequest::default());
        }
        Ok(ResourceRequest {
            scratch_bytes: 2 * cx.shape.group_size(0) * world * cx.desc.block_bytes(),
            ..ResourceRequest::aux(aux_need(TemplateKind::AllToAllSliced, world, cx.config))
        })
    }
}

impl DecomposesIntoLevels for AllToAllPlan {
    fn decompose(&self, cx: &OpContext<'_>, _region: Slice) -> Result<Vec<LevelStep>> {
        let coords = cx.shape.coords(cx.rank);
        let planes = cx.config.alltoall_planes.max(1);
        Ok(PHASES
            .iter()
            .map(|&phase| {
                let plane = Self::plane(cx, phase);
                let (level, local_rank, group_size) = match plane {
                    CommPlane::Level(k) => (Some(k), coords[k], cx.shape.group_size(k)),
                    _ => (None, cx.rank as usize, cx.world()),
                };
                LevelStep {
                    level,
                    kind: TemplateKind::AllToAllSliced,
                    plane,
                    local_rank,
                    group_size,
                    slices: Vec::new(),
                    root: None,
                    local_hop: 0,
                    link_sets: (0..planes).map(|p| (plane, p)).collect(),
                    phase: Some(phase),
                }
            })
            .collect())
    }
}

impl RunsTemplate for AllToAllPlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let bytes = cx.world() * cx.desc.block_bytes();
        check_len("input", input, bytes)?;
        check_len("output", output, bytes)?;
        let mut mem = ExecMem::new(input.range(0, bytes)?, output.range(0, bytes)?);
        if let Some(scratch) = &runner.resources().scratch {
            mem = mem.with_scratch(scratch.clone());
        }
        let topo = Self::topo_params(cx);
        let planes = cx.config.alltoall_planes.max(1);
        let mut template = runner.create(TemplateKind::AllToAllSliced)?;
        tracing::debug!(
            tag = %cx.desc.tag,
            rank = cx.rank,
            flattened = topo.flattened,
            nodes = topo.node_count,
            "running all-to-all"
        );
        for step in self.decompose(cx, Slice::new(0, bytes))? {
            let groups = if cx.world() == 1 {
                vec![runner.topology().sub_group(step.plane, 0)?]
            } else {
                runner.link_sets(step.plane, planes)?
            };
            let mut args = runner.base_args(cx, mem.clone(), step.local_rank, step.group_size);
            args.topo = topo.clone();
            let links = groups[0].links.clone();
            args.sub_groups = groups;
            template.prepare(args)?;
            if let (Some(phased), Some(phase)) = (template.phased(), step.phase) {
                phased.set_mode(phase);
            }
            template.run_async(step.local_rank, step.group_size, &links)?;
        }
        Ok(())
    }
}
